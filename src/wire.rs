use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::{TlsAcceptor, process_socket};
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::ShiftbookAuthSource;
use crate::engine::{ConflictKind, Engine, EngineError};
use crate::model::*;
use crate::observability::{self, ENGINE_REJECTIONS_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, AssignmentChange, Command, Shape};
use crate::tenant::TenantManager;

pub struct ShiftbookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<ShiftbookQueryParser>,
}

impl ShiftbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(ShiftbookQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    async fn run<C: ClientInfo>(&self, client: &C, sql: &str) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, acting_user(client), cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        actor: Option<DbId>,
        cmd: Command,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertPosition { id, name } => {
                engine.create_position(id, name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertUser { user } => {
                engine.save_user(user).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertShift { template } => {
                engine
                    .create_template(template, None, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertPositionRules { shift_id, rules } => {
                let saved = engine
                    .set_position_rules(shift_id, rules, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(saved.len())))
            }
            Command::UpdateShift { id, patch } => {
                let (template, counts) = engine
                    .update_template(id, patch, actor)
                    .await
                    .map_err(engine_err)?;
                let counts = counts.as_ref();
                Ok(rows(
                    Shape::Deactivation,
                    vec![vec![
                        Cell::int(template.id),
                        Cell::text(template.name),
                        Cell::Bool(Some(template.active)),
                        Cell::Int(counts.map(|c| c.kept_past as i64)),
                        Cell::Int(counts.map(|c| c.canceled_today as i64)),
                        Cell::Int(counts.map(|c| c.deleted_future as i64)),
                    ]],
                ))
            }
            Command::InsertSchedule {
                name,
                start_date,
                end_date,
            } => {
                let container = engine
                    .create_container(name, start_date, end_date, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(Shape::Schedules, vec![container_row(container)]))
            }
            Command::DeleteSchedule { id } => {
                engine.delete_container(id, actor).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::AddOpenSlots {
                shift_id,
                date,
                create_schedule,
                merge,
            } => {
                let outcome = engine
                    .add_open_slots(date, shift_id, actor, create_schedule, merge)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(
                    Shape::OpenSlots,
                    vec![vec![
                        Cell::Bool(Some(outcome.created)),
                        Cell::int(outcome.employee_shift_id),
                        Cell::Int(outcome.schedule_id),
                        Cell::int(outcome.existing_count as i64),
                    ]],
                ))
            }
            Command::RemoveSlots { shift_id, date } => {
                let outcome = engine
                    .remove_slots(date, shift_id, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(
                    Shape::RemovedSlots,
                    vec![vec![
                        Cell::int(outcome.removed_count as i64),
                        Cell::int(outcome.canceled_count as i64),
                    ]],
                ))
            }
            Command::AssignEmployee {
                shift_id,
                date,
                employee_id,
                notes,
            } => {
                let outcome = engine
                    .add_employee_to_shift(date, shift_id, employee_id, notes, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(
                    Shape::Assignment,
                    vec![vec![
                        Cell::Bool(Some(outcome.created)),
                        Cell::int(outcome.employee_shift_id),
                        Cell::Bool(Some(outcome.reused_open_slot)),
                        Cell::text(outcome.employee_name),
                        Cell::Text(outcome.employee_position_name),
                    ]],
                ))
            }
            Command::RemoveAssignment { id } => {
                let outcome = engine
                    .remove_employee_from_shift(id, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(
                    Shape::Removal,
                    vec![vec![
                        Cell::int(outcome.employee_shift_id),
                        Cell::Bool(Some(outcome.reopened)),
                    ]],
                ))
            }
            Command::UpdateAssignment { id, change } => {
                match change {
                    AssignmentChange::Cancel { reason } => {
                        engine.cancel_assignment(id, actor, &reason).await
                    }
                    AssignmentChange::Restore => engine.restore_assignment(id, actor).await,
                    AssignmentChange::CheckIn => engine.check_in(id, actor).await,
                    AssignmentChange::CheckOut => engine.check_out(id, actor).await,
                }
                .map_err(engine_err)?;
                let view = engine.occurrence_view(id).await;
                Ok(rows(
                    Shape::Occurrences,
                    view.into_iter().map(occurrence_row).collect(),
                ))
            }
            Command::SelectShifts { active_only } => {
                let templates = engine.list_templates(active_only);
                Ok(rows(
                    Shape::Shifts,
                    templates
                        .into_iter()
                        .map(|t| {
                            vec![
                                Cell::int(t.id),
                                Cell::text(t.name),
                                Cell::time(t.window.start),
                                Cell::time(t.window.end),
                                Cell::Bool(Some(t.active)),
                                Cell::Text(t.description),
                            ]
                        })
                        .collect(),
                ))
            }
            Command::SelectPositionRules { shift_id } => {
                let rules = engine.position_rules(shift_id).map_err(engine_err)?;
                Ok(rows(
                    Shape::PositionRules,
                    rules
                        .into_iter()
                        .map(|r| {
                            vec![
                                Cell::int(r.shift_id),
                                Cell::int(r.position_id),
                                Cell::Text(engine.catalog.position(r.position_id).map(|p| p.name)),
                                Cell::Int(r.required_count.map(i64::from)),
                                Cell::Bool(Some(r.allowed)),
                            ]
                        })
                        .collect(),
                ))
            }
            Command::SelectSchedules => Ok(rows(
                Shape::Schedules,
                engine.list_containers().into_iter().map(container_row).collect(),
            )),
            Command::SelectOccurrences { from, to, shift_id } => {
                let views = engine
                    .occurrences_between(from, to, shift_id)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(
                    Shape::Occurrences,
                    views.into_iter().map(occurrence_row).collect(),
                ))
            }
            Command::SelectSlotCheck { shift_id, date } => {
                let check = engine
                    .validate_slot(shift_id, date)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(
                    Shape::SlotCheck,
                    vec![vec![
                        Cell::Bool(Some(check.can_add)),
                        Cell::Text(check.reason),
                        Cell::int(i64::from(check.total_required)),
                        Cell::int(check.existing_count as i64),
                    ]],
                ))
            }
        }
    }
}

/// The login user name doubles as the acting user id. Non-numeric names act
/// anonymously.
fn acting_user<C: ClientInfo>(client: &C) -> Option<DbId> {
    client.metadata().get("user").and_then(|u| u.parse().ok())
}

// ── Result encoding ─────────────────────────────────────────────

enum Cell {
    Int(Option<i64>),
    Text(Option<String>),
    Bool(Option<bool>),
}

impl Cell {
    fn int(v: i64) -> Self {
        Cell::Int(Some(v))
    }

    fn text(v: String) -> Self {
        Cell::Text(Some(v))
    }

    fn date(v: chrono::NaiveDate) -> Self {
        Cell::Text(Some(v.format("%Y-%m-%d").to_string()))
    }

    fn time(v: chrono::NaiveTime) -> Self {
        Cell::Text(Some(v.format("%H:%M:%S").to_string()))
    }

    fn timestamp(v: Option<chrono::NaiveDateTime>) -> Self {
        Cell::Text(v.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()))
    }

    fn encode(&self, encoder: &mut DataRowEncoder) -> PgWireResult<()> {
        match self {
            Cell::Int(v) => encoder.encode_field(v),
            Cell::Text(v) => encoder.encode_field(v),
            Cell::Bool(v) => encoder.encode_field(v),
        }
    }
}

fn container_row(c: ScheduleContainer) -> Vec<Cell> {
    let auto = c.is_auto();
    vec![
        Cell::int(c.id),
        Cell::text(c.name),
        Cell::date(c.start_date),
        Cell::date(c.end_date),
        Cell::Bool(Some(auto)),
    ]
}

fn occurrence_row(v: OccurrenceView) -> Vec<Cell> {
    vec![
        Cell::int(v.id),
        Cell::int(v.shift_id),
        Cell::text(v.shift_name),
        Cell::date(v.date),
        Cell::time(v.start),
        Cell::time(v.end),
        Cell::Int(v.schedule_id),
        Cell::Int(v.employee_id),
        Cell::Text(v.employee_name),
        Cell::Text(v.employee_position_name),
        Cell::text(v.status.as_str().to_string()),
        Cell::Text(v.notes),
        Cell::Text(v.reason),
        Cell::timestamp(v.check_in),
        Cell::timestamp(v.check_out),
        Cell::Int(v.overtime_minutes),
    ]
}

fn columns(shape: Shape) -> &'static [(&'static str, Type)] {
    match shape {
        Shape::Shifts => &[
            ("id", Type::INT8),
            ("name", Type::VARCHAR),
            ("start_time", Type::VARCHAR),
            ("end_time", Type::VARCHAR),
            ("active", Type::BOOL),
            ("description", Type::VARCHAR),
        ],
        Shape::PositionRules => &[
            ("shift_id", Type::INT8),
            ("position_id", Type::INT8),
            ("position_name", Type::VARCHAR),
            ("required_count", Type::INT8),
            ("allowed", Type::BOOL),
        ],
        Shape::Schedules => &[
            ("id", Type::INT8),
            ("name", Type::VARCHAR),
            ("start_date", Type::VARCHAR),
            ("end_date", Type::VARCHAR),
            ("auto", Type::BOOL),
        ],
        Shape::Occurrences => &[
            ("id", Type::INT8),
            ("shift_id", Type::INT8),
            ("shift_name", Type::VARCHAR),
            ("date", Type::VARCHAR),
            ("start_time", Type::VARCHAR),
            ("end_time", Type::VARCHAR),
            ("schedule_id", Type::INT8),
            ("employee_id", Type::INT8),
            ("employee_name", Type::VARCHAR),
            ("employee_position_name", Type::VARCHAR),
            ("status", Type::VARCHAR),
            ("notes", Type::VARCHAR),
            ("reason", Type::VARCHAR),
            ("check_in", Type::VARCHAR),
            ("check_out", Type::VARCHAR),
            ("overtime_minutes", Type::INT8),
        ],
        Shape::SlotCheck => &[
            ("can_add", Type::BOOL),
            ("reason", Type::VARCHAR),
            ("total_required", Type::INT8),
            ("existing_count", Type::INT8),
        ],
        Shape::OpenSlots => &[
            ("created", Type::BOOL),
            ("employee_shift_id", Type::INT8),
            ("schedule_id", Type::INT8),
            ("existing_count", Type::INT8),
        ],
        Shape::RemovedSlots => &[("removed_count", Type::INT8), ("canceled_count", Type::INT8)],
        Shape::Assignment => &[
            ("created", Type::BOOL),
            ("employee_shift_id", Type::INT8),
            ("reused_open_slot", Type::BOOL),
            ("employee_name", Type::VARCHAR),
            ("employee_position_name", Type::VARCHAR),
        ],
        Shape::Removal => &[("employee_shift_id", Type::INT8), ("reopened", Type::BOOL)],
        Shape::Deactivation => &[
            ("id", Type::INT8),
            ("name", Type::VARCHAR),
            ("active", Type::BOOL),
            ("kept_past", Type::INT8),
            ("canceled_today", Type::INT8),
            ("deleted_future", Type::INT8),
        ],
    }
}

fn schema(shape: Shape) -> Vec<FieldInfo> {
    columns(shape)
        .iter()
        .map(|(name, ty)| FieldInfo::new((*name).into(), None, None, ty.clone(), FieldFormat::Text))
        .collect()
}

fn described_schema(sql: &str) -> Vec<FieldInfo> {
    sql::describe(sql).map(schema).unwrap_or_default()
}

fn rows(shape: Shape, cells: Vec<Vec<Cell>>) -> Response {
    let schema = Arc::new(schema(shape));
    let data: Vec<PgWireResult<_>> = cells
        .into_iter()
        .map(|row| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            for cell in &row {
                cell.encode(&mut encoder)?;
            }
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(data)))
}

#[async_trait]
impl SimpleQueryHandler for ShiftbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ShiftbookQueryParser;

#[async_trait]
impl QueryParser for ShiftbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(described_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ShiftbookHandler {
    type Statement = String;
    type QueryParser = ShiftbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        self.run(client, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            described_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(described_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals. Highest index first so
/// `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ShiftbookFactory {
    handler: Arc<ShiftbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ShiftbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ShiftbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(ShiftbookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                ShiftbookAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ShiftbookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(ShiftbookFactory::new(tenant_manager, password));
    process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidState(_) => "55000",
        EngineError::Conflict(kind) => match kind {
            ConflictKind::ShiftOverlap { .. } | ConflictKind::EmployeeDoubleBooked { .. } => "23P01",
            ConflictKind::AlreadyScheduled { .. } | ConflictKind::AlreadyAssigned { .. } => "23505",
            ConflictKind::PositionNotAllowed { .. } | ConflictKind::CapacityExceeded { .. } => "23514",
            ConflictKind::TemplateInUse(_) | ConflictKind::ContainerNotEmpty(_) => "55006",
        },
        EngineError::Forbidden { .. } => "42501",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

/// The client sees `user_message()`; when that hides the cause, the full
/// error travels in the detail field.
fn engine_err(e: EngineError) -> PgWireError {
    metrics::counter!(ENGINE_REJECTIONS_TOTAL, "code" => e.code()).increment(1);
    debug!(code = e.code(), "rejected: {e}");
    let mut info = ErrorInfo::new("ERROR".into(), sqlstate(&e).into(), e.user_message());
    let cause = e.to_string();
    if cause != info.message {
        info.detail = Some(cause);
    }
    PgWireError::UserError(Box::new(info))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
