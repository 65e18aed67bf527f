use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::NaiveDate;
use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};

use shiftbook::clock::FixedClock;
use shiftbook::tenant::TenantManager;
use shiftbook::wire;

// ── Test infrastructure ──────────────────────────────────────

static SERVER_SEQ: AtomicU32 = AtomicU32::new(0);

/// Server whose clock reads 2025-06-10 10:00.
async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!(
        "shiftbook_int_test_{}_{}",
        std::process::id(),
        SERVER_SEQ.fetch_add(1, Ordering::SeqCst)
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    let now = NaiveDate::from_ymd_opt(2025, 6, 10)
        .unwrap()
        .and_hms_opt(10, 0, 0)
        .unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, Arc::new(FixedClock::new(now))));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "shiftbook".to_string(), None).await;
            });
        }
    });

    addr
}

/// Log in as `user`; the login name is the acting user id.
async fn connect(addr: SocketAddr, dbname: &str, user: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user(user)
        .password("shiftbook");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn query(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &tokio_postgres::Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code()
        .map(|c| c.code().to_string())
        .unwrap_or_else(|| panic!("no SQLSTATE for {sql}: {err}"))
}

/// Positions, users and a Morning (06:00-14:00) and Midday (12:00-18:00)
/// shift. User 1 is the admin; 2 and 3 are cashiers, 4 is a cook.
async fn seed(client: &tokio_postgres::Client) {
    for sql in [
        "INSERT INTO positions (id, name) VALUES (1, 'Cashier')",
        "INSERT INTO positions (id, name) VALUES (2, 'Cook')",
        "INSERT INTO users (id, full_name, position_id, is_admin) VALUES (1, 'Ada Admin', NULL, true)",
        "INSERT INTO users (id, full_name, position_id) VALUES (2, 'Ann Lee', 1)",
        "INSERT INTO users (id, full_name, position_id) VALUES (3, 'Bob Diaz', 1)",
        "INSERT INTO users (id, full_name, position_id) VALUES (4, 'Cy Park', 2)",
        "INSERT INTO shifts (id, name, start_time, end_time) VALUES (10, 'Morning', '06:00', '14:00')",
        "INSERT INTO position_rules (shift_id, position_id, required_count) VALUES (10, 1, 1), (10, 2, 1)",
        "INSERT INTO shifts (id, name, start_time, end_time) VALUES (20, 'Midday', '12:00', '18:00')",
        "INSERT INTO position_rules (shift_id, position_id, required_count) VALUES (20, 1, 1)",
    ] {
        client.batch_execute(sql).await.unwrap();
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn open_slot_round_trip() {
    let addr = start_test_server().await;
    let client = connect(addr, "store_a", "1").await;
    seed(&client).await;

    let rows = query(
        &client,
        "INSERT INTO open_slots (shift_id, date) VALUES (10, '2025-06-12')",
    )
    .await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("created"), Some("t"));
    assert_eq!(rows[0].get("employee_shift_id"), Some("1"));
    assert_eq!(rows[0].get("existing_count"), Some("0"));

    // Merging is the default: a second call hands back the same row.
    let rows = query(
        &client,
        "INSERT INTO open_slots (shift_id, date) VALUES (10, '2025-06-12')",
    )
    .await;
    assert_eq!(rows[0].get("created"), Some("f"));
    assert_eq!(rows[0].get("existing_count"), Some("1"));

    let schedules = query(&client, "SELECT * FROM schedules").await;
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].get("name"), Some("Auto: 2025-06-12"));
    assert_eq!(schedules[0].get("auto"), Some("t"));

    let occurrences = query(&client, "SELECT * FROM occurrences WHERE date = '2025-06-12'").await;
    assert_eq!(occurrences.len(), 1);
    assert_eq!(occurrences[0].get("shift_name"), Some("Morning"));
    assert_eq!(occurrences[0].get("start_time"), Some("06:00:00"));
    assert_eq!(occurrences[0].get("status"), Some("OPEN"));
    assert_eq!(occurrences[0].get("employee_id"), None);

    let check = query(
        &client,
        "SELECT * FROM slot_check WHERE shift_id = 10 AND date = '2025-06-13'",
    )
    .await;
    assert_eq!(check[0].get("can_add"), Some("t"));
    assert_eq!(check[0].get("total_required"), Some("2"));
}

#[tokio::test]
async fn assignment_fills_slot_and_reopens() {
    let addr = start_test_server().await;
    let client = connect(addr, "store_a", "1").await;
    seed(&client).await;

    query(&client, "INSERT INTO open_slots (shift_id, date) VALUES (10, '2025-06-12')").await;
    let rows = query(
        &client,
        "INSERT INTO assignments (shift_id, date, employee_id, notes) VALUES (10, '2025-06-12', 2, 'till 3')",
    )
    .await;
    assert_eq!(rows[0].get("reused_open_slot"), Some("t"));
    assert_eq!(rows[0].get("employee_name"), Some("Ann Lee"));
    assert_eq!(rows[0].get("employee_position_name"), Some("Cashier"));
    let id = rows[0].get("employee_shift_id").unwrap().to_string();

    let rows = query(&client, "SELECT * FROM occurrences WHERE date >= '2025-06-12' AND date <= '2025-06-12'").await;
    assert_eq!(rows[0].get("status"), Some("ASSIGNED"));
    assert_eq!(rows[0].get("notes"), Some("till 3"));

    let rows = query(&client, &format!("DELETE FROM assignments WHERE id = {id}")).await;
    assert_eq!(rows[0].get("reopened"), Some("t"));
    let rows = query(&client, "SELECT * FROM occurrences WHERE date = '2025-06-12' AND shift_id = 10").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status"), Some("OPEN"));

    let rows = query(&client, "DELETE FROM occurrences WHERE shift_id = 10 AND date = '2025-06-12'").await;
    assert_eq!(rows[0].get("removed_count"), Some("1"));
    assert!(query(&client, "SELECT * FROM schedules").await.is_empty());
}

#[tokio::test]
async fn rejections_carry_sqlstate() {
    let addr = start_test_server().await;
    let client = connect(addr, "store_a", "1").await;
    seed(&client).await;

    client
        .batch_execute("INSERT INTO assignments (shift_id, date, employee_id) VALUES (10, '2025-06-12', 2)")
        .await
        .unwrap();

    // Cashier capacity on Morning is one.
    assert_eq!(
        sqlstate(&client, "INSERT INTO assignments (shift_id, date, employee_id) VALUES (10, '2025-06-12', 3)").await,
        "23514"
    );
    // Midday overlaps Morning, which already holds Ann.
    assert_eq!(
        sqlstate(&client, "INSERT INTO assignments (shift_id, date, employee_id) VALUES (20, '2025-06-12', 2)").await,
        "23P01"
    );
    assert_eq!(
        sqlstate(&client, "INSERT INTO open_slots (shift_id, date, merge) VALUES (10, '2025-06-12', false)").await,
        "23505"
    );
    assert_eq!(
        sqlstate(&client, "INSERT INTO open_slots (shift_id, date) VALUES (10, '2025-06-09')").await,
        "55000"
    );
    assert_eq!(
        sqlstate(&client, "INSERT INTO open_slots (shift_id, date) VALUES (99, '2025-06-12')").await,
        "P0002"
    );
    assert_eq!(
        sqlstate(&client, "UPDATE shifts SET name = 'Early' WHERE id = 10").await,
        "55006"
    );
    assert_eq!(sqlstate(&client, "SELECT * FROM orders").await, "42601");
    assert_eq!(sqlstate(&client, "NOT EVEN SQL").await, "42601");

    // The connection stays usable after errors.
    assert_eq!(query(&client, "SELECT * FROM shifts").await.len(), 2);
}

#[tokio::test]
async fn employees_check_in_their_own_shift() {
    let addr = start_test_server().await;
    let admin = connect(addr, "store_a", "1").await;
    seed(&admin).await;

    let rows = query(
        &admin,
        "INSERT INTO assignments (shift_id, date, employee_id) VALUES (10, '2025-06-10', 2)",
    )
    .await;
    let id = rows[0].get("employee_shift_id").unwrap().to_string();

    let bob = connect(addr, "store_a", "3").await;
    assert_eq!(
        sqlstate(&bob, &format!("UPDATE assignments SET status = 'checked_in' WHERE id = {id}")).await,
        "42501"
    );

    let ann = connect(addr, "store_a", "2").await;
    let rows = query(&ann, &format!("UPDATE assignments SET status = 'checked_in' WHERE id = {id}")).await;
    assert_eq!(rows[0].get("status"), Some("CHECKED_IN"));
    assert_eq!(rows[0].get("check_in"), Some("2025-06-10 10:00:00"));

    // The shift is still running.
    assert_eq!(
        sqlstate(&ann, &format!("UPDATE assignments SET status = 'completed' WHERE id = {id}")).await,
        "55000"
    );
}

#[tokio::test]
async fn running_shift_is_canceled_not_deleted() {
    let addr = start_test_server().await;
    let client = connect(addr, "store_a", "1").await;
    seed(&client).await;

    query(&client, "INSERT INTO assignments (shift_id, date, employee_id) VALUES (10, '2025-06-10', 2)").await;
    query(&client, "INSERT INTO assignments (shift_id, date, employee_id) VALUES (10, '2025-06-11', 2)").await;

    let rows = query(&client, "UPDATE shifts SET active = false WHERE id = 10").await;
    assert_eq!(rows[0].get("active"), Some("f"));
    assert_eq!(rows[0].get("kept_past"), Some("0"));
    assert_eq!(rows[0].get("canceled_today"), Some("1"));
    assert_eq!(rows[0].get("deleted_future"), Some("1"));

    let rows = query(
        &client,
        "SELECT * FROM occurrences WHERE date >= '2025-06-10' AND date <= '2025-06-11'",
    )
    .await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status"), Some("CANCELED"));

    let active = query(&client, "SELECT * FROM shifts WHERE active = true").await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].get("name"), Some("Midday"));
}

#[tokio::test]
async fn tenants_are_isolated() {
    let addr = start_test_server().await;
    let a = connect(addr, "store_a", "1").await;
    seed(&a).await;
    let b = connect(addr, "store_b", "1").await;

    assert_eq!(query(&a, "SELECT * FROM shifts").await.len(), 2);
    assert!(query(&b, "SELECT * FROM shifts").await.is_empty());
    assert_eq!(
        sqlstate(&b, "SELECT * FROM position_rules WHERE shift_id = 10").await,
        "P0002"
    );
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let addr = start_test_server().await;
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("store_a")
        .user("1")
        .password("nope");
    assert!(config.connect(NoTls).await.is_err());
}
