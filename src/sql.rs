use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertPosition {
        id: DbId,
        name: String,
    },
    InsertUser {
        user: User,
    },
    InsertShift {
        template: NewTemplate,
    },
    UpdateShift {
        id: DbId,
        patch: TemplatePatch,
    },
    InsertPositionRules {
        shift_id: DbId,
        rules: Vec<RuleInput>,
    },
    InsertSchedule {
        name: String,
        start_date: NaiveDate,
        end_date: NaiveDate,
    },
    DeleteSchedule {
        id: DbId,
    },
    AddOpenSlots {
        shift_id: DbId,
        date: NaiveDate,
        create_schedule: bool,
        merge: bool,
    },
    RemoveSlots {
        shift_id: DbId,
        date: NaiveDate,
    },
    AssignEmployee {
        shift_id: DbId,
        date: NaiveDate,
        employee_id: DbId,
        notes: Option<String>,
    },
    RemoveAssignment {
        id: DbId,
    },
    UpdateAssignment {
        id: DbId,
        change: AssignmentChange,
    },
    SelectShifts {
        active_only: bool,
    },
    SelectPositionRules {
        shift_id: DbId,
    },
    SelectSchedules,
    SelectOccurrences {
        from: NaiveDate,
        to: NaiveDate,
        shift_id: Option<DbId>,
    },
    SelectSlotCheck {
        shift_id: DbId,
        date: NaiveDate,
    },
}

/// Status transition requested through `UPDATE assignments SET status = ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentChange {
    Cancel { reason: String },
    Restore,
    CheckIn,
    CheckOut,
}

/// Row layout a statement answers with, known before its parameters are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Shifts,
    PositionRules,
    Schedules,
    Occurrences,
    SlotCheck,
    OpenSlots,
    RemovedSlots,
    Assignment,
    Removal,
    Deactivation,
}

impl Command {
    pub fn shape(&self) -> Option<Shape> {
        match self {
            Command::SelectShifts { .. } => Some(Shape::Shifts),
            Command::SelectPositionRules { .. } => Some(Shape::PositionRules),
            Command::SelectSchedules | Command::InsertSchedule { .. } => Some(Shape::Schedules),
            Command::SelectOccurrences { .. } | Command::UpdateAssignment { .. } => {
                Some(Shape::Occurrences)
            }
            Command::SelectSlotCheck { .. } => Some(Shape::SlotCheck),
            Command::AddOpenSlots { .. } => Some(Shape::OpenSlots),
            Command::RemoveSlots { .. } => Some(Shape::RemovedSlots),
            Command::AssignEmployee { .. } => Some(Shape::Assignment),
            Command::RemoveAssignment { .. } => Some(Shape::Removal),
            Command::UpdateShift { .. } => Some(Shape::Deactivation),
            Command::InsertPosition { .. }
            | Command::InsertUser { .. }
            | Command::InsertShift { .. }
            | Command::InsertPositionRules { .. }
            | Command::DeleteSchedule { .. } => None,
        }
    }
}

fn shape_for(statement: &Statement) -> Option<Shape> {
    match statement {
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return None;
            };
            let table = table_factor_name(&select.from.first()?.relation).ok()?;
            match table.as_str() {
                "shifts" => Some(Shape::Shifts),
                "position_rules" => Some(Shape::PositionRules),
                "schedules" => Some(Shape::Schedules),
                "occurrences" => Some(Shape::Occurrences),
                "slot_check" => Some(Shape::SlotCheck),
                _ => None,
            }
        }
        Statement::Insert(insert) => match insert_table_name(insert).ok()?.as_str() {
            "open_slots" => Some(Shape::OpenSlots),
            "assignments" => Some(Shape::Assignment),
            "schedules" => Some(Shape::Schedules),
            _ => None,
        },
        Statement::Delete(delete) => match delete_table_name(delete).ok()?.as_str() {
            "occurrences" => Some(Shape::RemovedSlots),
            "assignments" => Some(Shape::Removal),
            _ => None,
        },
        Statement::Update { table, .. } => match table_factor_name(&table.relation).ok()?.as_str() {
            "shifts" => Some(Shape::Deactivation),
            "assignments" => Some(Shape::Occurrences),
            _ => None,
        },
        _ => None,
    }
}

/// Result shape of a statement that may still contain `$n` placeholders.
pub fn describe(sql: &str) -> Option<Shape> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    shape_for(stmts.first()?)
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(statement) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match statement {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table_factor_name(&table.relation)?, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// One VALUES row addressed by column name, or by position when the INSERT
/// lists no columns.
struct Row<'a> {
    columns: &'a [String],
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, column: &str, position: usize) -> Option<&'a Expr> {
        if self.columns.is_empty() {
            self.values.get(position)
        } else {
            let idx = self.columns.iter().position(|c| c == column)?;
            self.values.get(idx)
        }
    }

    fn require(&self, table: &'static str, column: &'static str, position: usize) -> Result<&'a Expr, SqlError> {
        self.get(column, position)
            .ok_or(SqlError::MissingColumn(table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    let rows = extract_insert_rows(insert)?;
    let row = Row {
        columns: &columns,
        values: &rows[0],
    };

    match table.as_str() {
        "positions" => Ok(Command::InsertPosition {
            id: parse_i64(row.require("positions", "id", 0)?)?,
            name: parse_string(row.require("positions", "name", 1)?)?,
        }),
        "users" => Ok(Command::InsertUser {
            user: User {
                id: parse_i64(row.require("users", "id", 0)?)?,
                full_name: parse_string(row.require("users", "full_name", 1)?)?,
                position_id: row.get("position_id", 2).map(parse_i64_or_null).transpose()?.flatten(),
                is_admin: row.get("is_admin", 3).map(parse_bool).transpose()?.unwrap_or(false),
                active: row.get("active", 4).map(parse_bool).transpose()?.unwrap_or(true),
            },
        }),
        "shifts" => Ok(Command::InsertShift {
            template: NewTemplate {
                id: parse_i64(row.require("shifts", "id", 0)?)?,
                name: parse_string(row.require("shifts", "name", 1)?)?,
                window: TimeWindow::new(
                    parse_time(row.require("shifts", "start_time", 2)?)?,
                    parse_time(row.require("shifts", "end_time", 3)?)?,
                ),
                active: row.get("active", 4).map(parse_bool).transpose()?.unwrap_or(true),
                description: row.get("description", 5).map(parse_string_or_null).transpose()?.flatten(),
            },
        }),
        "position_rules" => {
            let mut shift_id = None;
            let mut rules = Vec::with_capacity(rows.len());
            for values in &rows {
                let row = Row {
                    columns: &columns,
                    values,
                };
                let sid = parse_i64(row.require("position_rules", "shift_id", 0)?)?;
                if shift_id.is_some_and(|s| s != sid) {
                    return Err(SqlError::Unsupported(
                        "position_rules rows must share one shift_id".into(),
                    ));
                }
                shift_id = Some(sid);
                rules.push(RuleInput {
                    position_id: parse_i64(row.require("position_rules", "position_id", 1)?)?,
                    required_count: row
                        .get("required_count", 2)
                        .map(parse_u32_or_null)
                        .transpose()?
                        .flatten(),
                    allowed: row.get("allowed", 3).map(parse_bool).transpose()?,
                });
            }
            Ok(Command::InsertPositionRules {
                shift_id: shift_id.ok_or(SqlError::MissingColumn("position_rules", "shift_id"))?,
                rules,
            })
        }
        "schedules" => Ok(Command::InsertSchedule {
            name: parse_string(row.require("schedules", "name", 0)?)?,
            start_date: parse_date(row.require("schedules", "start_date", 1)?)?,
            end_date: parse_date(row.require("schedules", "end_date", 2)?)?,
        }),
        "open_slots" => Ok(Command::AddOpenSlots {
            shift_id: parse_i64(row.require("open_slots", "shift_id", 0)?)?,
            date: parse_date(row.require("open_slots", "date", 1)?)?,
            create_schedule: row.get("create_schedule", 2).map(parse_bool).transpose()?.unwrap_or(true),
            merge: row.get("merge", 3).map(parse_bool).transpose()?.unwrap_or(true),
        }),
        "assignments" => Ok(Command::AssignEmployee {
            shift_id: parse_i64(row.require("assignments", "shift_id", 0)?)?,
            date: parse_date(row.require("assignments", "date", 1)?)?,
            employee_id: parse_i64(row.require("assignments", "employee_id", 2)?)?,
            notes: row.get("notes", 3).map(parse_string_or_null).transpose()?.flatten(),
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(&delete.selection)?;

    match table.as_str() {
        "schedules" => Ok(Command::DeleteSchedule {
            id: parse_i64(filters.eq("id")?)?,
        }),
        "occurrences" => Ok(Command::RemoveSlots {
            shift_id: parse_i64(filters.eq("shift_id")?)?,
            date: parse_date(filters.eq("date")?)?,
        }),
        "assignments" => Ok(Command::RemoveAssignment {
            id: parse_i64(filters.eq("id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &str,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let filters = Filters::from_selection(selection)?;
    let id = parse_i64(filters.eq("id")?)?;
    let mut set: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.push((column, &assignment.value));
    }
    let value_of = |column: &str| set.iter().find(|(c, _)| c == column).map(|(_, v)| *v);

    match table {
        "shifts" => {
            let mut patch = TemplatePatch::default();
            for (column, value) in &set {
                match column.as_str() {
                    "name" => patch.name = Some(parse_string(value)?),
                    "start_time" => patch.start = Some(parse_time(value)?),
                    "end_time" => patch.end = Some(parse_time(value)?),
                    "active" => patch.active = Some(parse_bool(value)?),
                    "description" => patch.description = parse_string_or_null(value)?,
                    other => return Err(SqlError::UnknownColumn("shifts", other.to_string())),
                }
            }
            Ok(Command::UpdateShift { id, patch })
        }
        "assignments" => {
            let status = value_of("status").ok_or(SqlError::MissingColumn("assignments", "status"))?;
            let change = match parse_string(status)?.to_lowercase().as_str() {
                "canceled" | "cancelled" => AssignmentChange::Cancel {
                    reason: value_of("reason")
                        .map(parse_string)
                        .transpose()?
                        .unwrap_or_default(),
                },
                "assigned" => AssignmentChange::Restore,
                "checked_in" => AssignmentChange::CheckIn,
                "completed" => AssignmentChange::CheckOut,
                other => {
                    return Err(SqlError::Unsupported(format!("status transition to {other}")));
                }
            };
            Ok(Command::UpdateAssignment { id, change })
        }
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_selection(&select.selection)?;

    match table.as_str() {
        "shifts" => Ok(Command::SelectShifts {
            active_only: filters.get_eq("active").map(parse_bool).transpose()?.unwrap_or(false),
        }),
        "position_rules" => Ok(Command::SelectPositionRules {
            shift_id: parse_i64(filters.eq("shift_id")?)?,
        }),
        "schedules" => Ok(Command::SelectSchedules),
        "occurrences" => {
            let shift_id = filters.get_eq("shift_id").map(parse_i64).transpose()?;
            let (from, to) = match filters.get_eq("date") {
                Some(date) => {
                    let date = parse_date(date)?;
                    (date, date)
                }
                None => (
                    parse_date(filters.lower("date").ok_or(SqlError::MissingFilter("date"))?)?,
                    parse_date(filters.upper("date").ok_or(SqlError::MissingFilter("date"))?)?,
                ),
            };
            Ok(Command::SelectOccurrences { from, to, shift_id })
        }
        "slot_check" => Ok(Command::SelectSlotCheck {
            shift_id: parse_i64(filters.eq("shift_id")?)?,
            date: parse_date(filters.eq("date")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Conjunction of `column <op> value` comparisons from a WHERE clause.
struct Filters<'a> {
    terms: Vec<(String, ast::BinaryOperator, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: &'a Option<Expr>) -> Result<Self, SqlError> {
        let mut filters = Self { terms: Vec::new() };
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::And,
                right,
            } => {
                self.collect(left)?;
                self.collect(right)
            }
            Expr::BinaryOp { left, op, right } => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                self.terms.push((column, op.clone(), right.as_ref()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn find(&self, column: &str, ops: &[ast::BinaryOperator]) -> Option<&'a Expr> {
        self.terms
            .iter()
            .find(|(c, op, _)| c == column && ops.contains(op))
            .map(|(_, _, v)| *v)
    }

    fn get_eq(&self, column: &str) -> Option<&'a Expr> {
        self.find(column, &[ast::BinaryOperator::Eq])
    }

    fn eq(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get_eq(column).ok_or(SqlError::MissingFilter(column))
    }

    fn lower(&self, column: &str) -> Option<&'a Expr> {
        self.find(column, &[ast::BinaryOperator::GtEq])
    }

    fn upper(&self, column: &str) -> Option<&'a Expr> {
        self.find(column, &[ast::BinaryOperator::LtEq])
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_i64(expr).map(Some)
    }
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    parse_i64_or_null(expr)?
        .map(|v| u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range"))))
        .transpose()
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::DoubleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        _ => Err(SqlError::Parse(format!("expected string, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_string(expr).map(Some)
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s}: {e}")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
