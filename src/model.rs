use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// Identifier of every persisted entity. Positions, users and shift templates
/// carry ids assigned by the directory that owns them; schedule containers and
/// occurrences draw theirs from per-engine sequences.
pub type DbId = i64;

/// Prefix that marks a schedule container as created by the engine.
pub const AUTO_CONTAINER_PREFIX: &str = "Auto:";

/// Daily time-of-day window of a shift template, inclusive of both ends for
/// "is it running now" checks and treated as open for overlap checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Two windows on the same calendar day overlap iff `s1 < e2 && s2 < e1`.
    /// Back-to-back windows (one ends when the other starts) do not overlap.
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        self.start <= t && t <= self.end
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftTemplate {
    pub id: DbId,
    pub name: String,
    pub window: TimeWindow,
    pub active: bool,
    pub description: Option<String>,
    pub created_by: Option<DbId>,
    pub created_at: NaiveDateTime,
    pub updated_by: Option<DbId>,
    pub updated_at: Option<NaiveDateTime>,
}

/// Per-(template, position) staffing rule. `required_count: None` means the
/// position is allowed without an upper bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRule {
    pub shift_id: DbId,
    pub position_id: DbId,
    pub allowed: bool,
    pub required_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub id: DbId,
    pub name: String,
}

/// A user of the directory. Employees are users with a position; admins are
/// users flagged `is_admin`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: DbId,
    pub full_name: String,
    pub position_id: Option<DbId>,
    pub is_admin: bool,
    pub active: bool,
}

/// Inclusive calendar range grouping occurrences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleContainer {
    pub id: DbId,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub created_by: Option<DbId>,
    pub created_at: NaiveDateTime,
}

impl ScheduleContainer {
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }

    pub fn is_auto(&self) -> bool {
        self.name.starts_with(AUTO_CONTAINER_PREFIX)
    }

    pub fn auto_name(date: NaiveDate) -> String {
        format!("{AUTO_CONTAINER_PREFIX} {}", date.format("%Y-%m-%d"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OccurrenceStatus {
    /// Unfilled slot: no employee bound.
    Open,
    Assigned { employee_id: DbId },
    /// Canceled rows remember who held them so they can be restored.
    Canceled {
        employee_id: Option<DbId>,
        reason: Option<String>,
    },
}

impl OccurrenceStatus {
    pub fn employee_id(&self) -> Option<DbId> {
        match self {
            OccurrenceStatus::Open => None,
            OccurrenceStatus::Assigned { employee_id } => Some(*employee_id),
            OccurrenceStatus::Canceled { employee_id, .. } => *employee_id,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, OccurrenceStatus::Canceled { .. })
    }

    pub fn is_open(&self) -> bool {
        matches!(self, OccurrenceStatus::Open)
    }

    /// Bound to an employee and not canceled.
    pub fn assigned_to(&self) -> Option<DbId> {
        match self {
            OccurrenceStatus::Assigned { employee_id } => Some(*employee_id),
            _ => None,
        }
    }
}

/// One concrete instance of a shift template on a calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftOccurrence {
    pub id: DbId,
    pub shift_id: DbId,
    pub container_id: Option<DbId>,
    pub date: NaiveDate,
    pub status: OccurrenceStatus,
    pub notes: Option<String>,
    pub check_in: Option<NaiveDateTime>,
    pub check_out: Option<NaiveDateTime>,
    pub created_by: Option<DbId>,
    pub created_at: NaiveDateTime,
    pub updated_by: Option<DbId>,
    pub updated_at: Option<NaiveDateTime>,
}

impl ShiftOccurrence {
    pub fn touch(&mut self, by: Option<DbId>, at: NaiveDateTime) {
        self.updated_by = by;
        self.updated_at = Some(at);
    }
}

/// Status shown to readers. `Missed` is derived from the clock and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisplayStatus {
    Open,
    Assigned,
    CheckedIn,
    Completed,
    Missed,
    Canceled,
}

impl DisplayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayStatus::Open => "OPEN",
            DisplayStatus::Assigned => "ASSIGNED",
            DisplayStatus::CheckedIn => "CHECKED_IN",
            DisplayStatus::Completed => "COMPLETED",
            DisplayStatus::Missed => "MISSED",
            DisplayStatus::Canceled => "CANCELED",
        }
    }
}

/// Where a (date, window) pair sits relative to "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayPhase {
    Past,
    TodayBeforeWindow,
    TodayInWindow,
    TodayAfterWindow,
    Future,
}

impl DayPhase {
    pub fn of(date: NaiveDate, window: &TimeWindow, now: NaiveDateTime) -> Self {
        let today = now.date();
        if date < today {
            return DayPhase::Past;
        }
        if date > today {
            return DayPhase::Future;
        }
        let t = now.time();
        if t < window.start {
            DayPhase::TodayBeforeWindow
        } else if window.contains(t) {
            DayPhase::TodayInWindow
        } else {
            DayPhase::TodayAfterWindow
        }
    }

    pub fn has_ended(&self) -> bool {
        matches!(self, DayPhase::Past | DayPhase::TodayAfterWindow)
    }
}

/// The event types. Whole rows are recorded so replay is a plain upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PositionSaved {
        position: Position,
    },
    UserSaved {
        user: User,
    },
    TemplateSaved {
        template: ShiftTemplate,
    },
    RulesReplaced {
        shift_id: DbId,
        rules: Vec<PositionRule>,
    },
    ContainerCreated {
        container: ScheduleContainer,
    },
    ContainerDeleted {
        id: DbId,
    },
    OccurrenceCreated {
        occurrence: ShiftOccurrence,
    },
    OccurrenceUpdated {
        occurrence: ShiftOccurrence,
    },
    OccurrenceDeleted {
        id: DbId,
        date: NaiveDate,
    },
    /// Written by compaction so deleted ids are never handed out again.
    SequencesAdvanced {
        next_occurrence_id: DbId,
        next_container_id: DbId,
    },
}

impl Event {
    /// Calendar day whose lock must be held to apply this event.
    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            Event::OccurrenceCreated { occurrence } | Event::OccurrenceUpdated { occurrence } => {
                Some(occurrence.date)
            }
            Event::OccurrenceDeleted { date, .. } => Some(*date),
            _ => None,
        }
    }
}

/// One WAL record: every event produced by a single operation. Applied as a
/// unit on replay, so a crash never leaves half an operation behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub at: NaiveDateTime,
    pub actor: Option<DbId>,
    pub events: Vec<Event>,
}

impl Commit {
    pub fn dates(&self) -> BTreeSet<NaiveDate> {
        self.events.iter().filter_map(Event::date).collect()
    }
}

// ── Operation inputs ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTemplate {
    pub id: DbId,
    pub name: String,
    pub window: TimeWindow,
    pub active: bool,
    pub description: Option<String>,
}

/// Partial template update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplatePatch {
    pub name: Option<String>,
    pub start: Option<NaiveTime>,
    pub end: Option<NaiveTime>,
    pub active: Option<bool>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleInput {
    pub position_id: DbId,
    pub required_count: Option<u32>,
    /// Defaults to `required_count != Some(0)`.
    pub allowed: Option<bool>,
}

// ── Operation outputs ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSlotsOutcome {
    pub created: bool,
    pub employee_shift_id: DbId,
    pub schedule_id: Option<DbId>,
    pub existing_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveSlotsOutcome {
    pub removed_count: usize,
    pub canceled_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeactivationCounts {
    pub kept_past: usize,
    pub canceled_today: usize,
    pub deleted_future: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentOutcome {
    pub created: bool,
    pub employee_shift_id: DbId,
    pub reused_open_slot: bool,
    pub employee_name: String,
    pub employee_position_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovalOutcome {
    pub employee_shift_id: DbId,
    /// The row survived as an open slot instead of being deleted.
    pub reopened: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotCheck {
    pub can_add: bool,
    pub reason: Option<String>,
    pub total_required: u32,
    pub existing_count: usize,
}

/// Read model of an occurrence joined with its template and employee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OccurrenceView {
    pub id: DbId,
    pub shift_id: DbId,
    pub shift_name: String,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub schedule_id: Option<DbId>,
    pub employee_id: Option<DbId>,
    pub employee_name: Option<String>,
    pub employee_position_name: Option<String>,
    pub status: DisplayStatus,
    pub notes: Option<String>,
    pub reason: Option<String>,
    pub check_in: Option<NaiveDateTime>,
    pub check_out: Option<NaiveDateTime>,
    pub overtime_minutes: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn window_overlap() {
        let morning = TimeWindow::new(t(6, 0), t(14, 0));
        let day = TimeWindow::new(t(9, 0), t(17, 0));
        let evening = TimeWindow::new(t(14, 0), t(22, 0));
        assert!(morning.overlaps(&day));
        assert!(day.overlaps(&morning));
        assert!(!morning.overlaps(&evening));
        assert!(!evening.overlaps(&morning));
    }

    #[test]
    fn window_contains_is_inclusive() {
        let w = TimeWindow::new(t(6, 0), t(14, 0));
        assert!(w.contains(t(6, 0)));
        assert!(w.contains(t(14, 0)));
        assert!(!w.contains(t(5, 59)));
        assert!(!w.contains(t(14, 1)));
    }

    #[test]
    fn day_phase_classification() {
        let w = TimeWindow::new(t(6, 0), t(14, 0));
        let now = d(2025, 6, 10).and_time(t(10, 0));
        assert_eq!(DayPhase::of(d(2025, 6, 9), &w, now), DayPhase::Past);
        assert_eq!(DayPhase::of(d(2025, 6, 10), &w, now), DayPhase::TodayInWindow);
        assert_eq!(DayPhase::of(d(2025, 6, 11), &w, now), DayPhase::Future);

        let early = d(2025, 6, 10).and_time(t(5, 0));
        assert_eq!(DayPhase::of(d(2025, 6, 10), &w, early), DayPhase::TodayBeforeWindow);
        let late = d(2025, 6, 10).and_time(t(15, 0));
        assert_eq!(DayPhase::of(d(2025, 6, 10), &w, late), DayPhase::TodayAfterWindow);
        assert!(DayPhase::TodayAfterWindow.has_ended());
        assert!(!DayPhase::TodayInWindow.has_ended());
    }

    #[test]
    fn auto_container_naming() {
        let name = ScheduleContainer::auto_name(d(2025, 6, 10));
        assert_eq!(name, "Auto: 2025-06-10");
        let c = ScheduleContainer {
            id: 1,
            name,
            start_date: d(2025, 6, 10),
            end_date: d(2025, 6, 10),
            created_by: None,
            created_at: d(2025, 6, 1).and_time(t(0, 0)),
        };
        assert!(c.is_auto());
        assert!(c.covers(d(2025, 6, 10)));
        assert!(!c.covers(d(2025, 6, 11)));
    }

    #[test]
    fn status_accessors() {
        assert_eq!(OccurrenceStatus::Open.employee_id(), None);
        assert!(OccurrenceStatus::Open.is_open());
        let assigned = OccurrenceStatus::Assigned { employee_id: 7 };
        assert_eq!(assigned.assigned_to(), Some(7));
        let canceled = OccurrenceStatus::Canceled {
            employee_id: Some(7),
            reason: Some("sick".into()),
        };
        assert!(canceled.is_canceled());
        assert_eq!(canceled.employee_id(), Some(7));
        assert_eq!(canceled.assigned_to(), None);
    }

    #[test]
    fn commit_serialization_roundtrip() {
        let occurrence = ShiftOccurrence {
            id: 3,
            shift_id: 1,
            container_id: Some(2),
            date: d(2025, 6, 10),
            status: OccurrenceStatus::Canceled {
                employee_id: Some(9),
                reason: None,
            },
            notes: Some("front desk".into()),
            check_in: None,
            check_out: None,
            created_by: Some(1),
            created_at: d(2025, 6, 1).and_time(t(8, 30)),
            updated_by: None,
            updated_at: None,
        };
        let commit = Commit {
            at: d(2025, 6, 1).and_time(t(8, 30)),
            actor: Some(1),
            events: vec![
                Event::OccurrenceCreated { occurrence },
                Event::OccurrenceDeleted { id: 4, date: d(2025, 6, 11) },
            ],
        };
        let bytes = bincode::serialize(&commit).unwrap();
        let decoded: Commit = bincode::deserialize(&bytes).unwrap();
        assert_eq!(commit, decoded);
        assert_eq!(
            decoded.dates().into_iter().collect::<Vec<_>>(),
            vec![d(2025, 6, 10), d(2025, 6, 11)]
        );
    }
}
