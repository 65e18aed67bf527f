use chrono::NaiveDate;
use thiserror::Error;

use crate::model::DbId;

/// Which entity a lookup failed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Shift(DbId),
    Occurrence(DbId),
    Employee(DbId),
    Position(DbId),
    Container(DbId),
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Shift(id) => write!(f, "shift {id}"),
            Entity::Occurrence(id) => write!(f, "employee shift {id}"),
            Entity::Employee(id) => write!(f, "employee {id}"),
            Entity::Position(id) => write!(f, "position {id}"),
            Entity::Container(id) => write!(f, "schedule {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateViolation {
    #[error("date {0} is in the past")]
    PastDate(NaiveDate),
    #[error("shift {0} has no required slots")]
    NoRequiredSlots(DbId),
    #[error("shift {0} is inactive")]
    TemplateInactive(DbId),
    #[error("shift start must be before its end")]
    InvalidTimeWindow,
    #[error("start date must not be after end date")]
    InvalidDateRange,
    #[error("employee shift {0} is not assigned")]
    NotAssigned(DbId),
    #[error("employee shift {0} is not canceled")]
    NotCanceled(DbId),
    #[error("a cancellation reason is required")]
    ReasonRequired,
    #[error("check-in is only possible while the shift is running")]
    OutsideShiftWindow,
    #[error("employee shift {0} is already checked in")]
    AlreadyCheckedIn(DbId),
    #[error("employee shift {0} has no check-in")]
    NotCheckedIn(DbId),
    #[error("employee shift {0} is already checked out")]
    AlreadyCheckedOut(DbId),
    #[error("shift has not ended yet")]
    ShiftNotEnded,
    #[error("names starting with \"Auto:\" are reserved")]
    ReservedName,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictKind {
    #[error("shift {shift_id} overlaps shift {other_shift_id} already scheduled on {date}")]
    ShiftOverlap {
        shift_id: DbId,
        other_shift_id: DbId,
        date: NaiveDate,
    },
    #[error("shift {shift_id} is already scheduled on {date}")]
    AlreadyScheduled { shift_id: DbId, date: NaiveDate },
    #[error("employee {employee_id} is already assigned to shift {shift_id} on {date}")]
    AlreadyAssigned {
        employee_id: DbId,
        shift_id: DbId,
        date: NaiveDate,
    },
    #[error("position {position_id:?} of employee {employee_id} is not allowed on shift {shift_id}")]
    PositionNotAllowed {
        employee_id: DbId,
        position_id: Option<DbId>,
        shift_id: DbId,
    },
    #[error("position {position_id} on shift {shift_id} is full ({required} required)")]
    CapacityExceeded {
        shift_id: DbId,
        position_id: DbId,
        required: u32,
    },
    #[error("employee {employee_id} already works overlapping employee shift {occurrence_id}")]
    EmployeeDoubleBooked {
        employee_id: DbId,
        occurrence_id: DbId,
    },
    #[error("shift {0} is referenced by scheduled occurrences")]
    TemplateInUse(DbId),
    #[error("schedule {0} still holds occurrences")]
    ContainerNotEmpty(DbId),
}

impl ConflictKind {
    /// Stable machine-readable cause.
    pub fn code(&self) -> &'static str {
        match self {
            ConflictKind::ShiftOverlap { .. } => "shift_overlap",
            ConflictKind::AlreadyScheduled { .. } => "already_scheduled",
            ConflictKind::AlreadyAssigned { .. } => "already_assigned",
            ConflictKind::PositionNotAllowed { .. } => "position_not_allowed",
            ConflictKind::CapacityExceeded { .. } => "capacity_exceeded",
            ConflictKind::EmployeeDoubleBooked { .. } => "employee_double_booked",
            ConflictKind::TemplateInUse(_) => "template_in_use",
            ConflictKind::ContainerNotEmpty(_) => "container_not_empty",
        }
    }

    /// The employee picked for the slot cannot take it.
    pub fn is_employee_selection(&self) -> bool {
        matches!(
            self,
            ConflictKind::AlreadyAssigned { .. }
                | ConflictKind::PositionNotAllowed { .. }
                | ConflictKind::CapacityExceeded { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Entity),
    #[error("already exists: {0}")]
    AlreadyExists(Entity),
    #[error("invalid state: {0}")]
    InvalidState(#[from] StateViolation),
    #[error("conflict: {0}")]
    Conflict(#[from] ConflictKind),
    #[error("user {user_id:?} may not act on this employee shift")]
    Forbidden { user_id: Option<DbId> },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable code, used for metrics labels and API bodies.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidState(_) => "invalid_state",
            EngineError::Conflict(kind) => kind.code(),
            EngineError::Forbidden { .. } => "forbidden",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }

    /// Message safe to show an end user. Employee-selection conflicts collapse
    /// into one generic hint; everything else reads like its `Display`.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::Conflict(kind) if kind.is_employee_selection() => {
                "This employee cannot take the shift, please choose another employee".to_string()
            }
            EngineError::WalError(_) => "The change could not be saved, please retry".to_string(),
            other => other.to_string(),
        }
    }
}
