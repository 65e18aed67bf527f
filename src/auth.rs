use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Shared cleartext password for every login. The user name is not checked
/// here; it only names the acting user once connected.
#[derive(Debug)]
pub struct ShiftbookAuthSource {
    password: String,
}

impl ShiftbookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for ShiftbookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!(user = ?login.user(), database = ?login.database(), "password login");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
