use chrono::{NaiveDate, NaiveDateTime};

use crate::limits::*;
use crate::model::*;

use super::error::{Entity, StateViolation};
use super::{Engine, EngineError};

impl Engine {
    pub fn template(&self, id: DbId) -> Option<ShiftTemplate> {
        self.catalog.template(id)
    }

    pub fn list_templates(&self, active_only: bool) -> Vec<ShiftTemplate> {
        self.catalog
            .templates()
            .into_iter()
            .filter(|t| !active_only || t.active)
            .collect()
    }

    pub fn position_rules(&self, shift_id: DbId) -> Result<Vec<PositionRule>, EngineError> {
        if self.catalog.template(shift_id).is_none() {
            return Err(EngineError::NotFound(Entity::Shift(shift_id)));
        }
        Ok(self.catalog.rules(shift_id))
    }

    pub fn list_containers(&self) -> Vec<ScheduleContainer> {
        self.containers.list()
    }

    pub async fn occurrence(&self, id: DbId) -> Option<ShiftOccurrence> {
        let date = self.store.date_of(id)?;
        let day = self.store.day(date)?;
        let guard = day.read().await;
        guard.get(id).cloned()
    }

    pub async fn occurrence_view(&self, id: DbId) -> Option<OccurrenceView> {
        let row = self.occurrence(id).await?;
        self.view(&row, self.clock.now())
    }

    /// Whether any occurrence, in any state, references the template.
    pub async fn shift_has_occurrences(&self, shift_id: DbId) -> bool {
        !self.dates_with_shift(shift_id).await.is_empty()
    }

    pub(super) async fn dates_with_shift(&self, shift_id: DbId) -> std::collections::BTreeSet<NaiveDate> {
        let mut dates = std::collections::BTreeSet::new();
        for date in self.store.dates() {
            if let Some(day) = self.store.day(date)
                && day.read().await.for_shift(shift_id).next().is_some()
            {
                dates.insert(date);
            }
        }
        dates
    }

    pub async fn occurrences_on(&self, date: NaiveDate, shift_id: Option<DbId>) -> Vec<OccurrenceView> {
        let Some(day) = self.store.day(date) else {
            return Vec::new();
        };
        let now = self.clock.now();
        let guard = day.read().await;
        guard
            .occurrences
            .iter()
            .filter(|o| shift_id.is_none_or(|s| o.shift_id == s))
            .filter_map(|o| self.view(o, now))
            .collect()
    }

    /// Occurrences in `[from, to]`, ordered by date, then start time.
    pub async fn occurrences_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        shift_id: Option<DbId>,
    ) -> Result<Vec<OccurrenceView>, EngineError> {
        if from > to {
            return Err(StateViolation::InvalidDateRange.into());
        }
        if (to - from).num_days() > MAX_QUERY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("date range too long"));
        }
        let mut views = Vec::new();
        for date in self.store.dates_between(from, to) {
            let mut day_views = self.occurrences_on(date, shift_id).await;
            day_views.sort_by_key(|v| (v.start, v.id));
            views.extend(day_views);
        }
        Ok(views)
    }

    /// Whether `add_open_slots` would create a new placeholder right now.
    pub async fn validate_slot(&self, shift_id: DbId, date: NaiveDate) -> Result<SlotCheck, EngineError> {
        if self.catalog.template(shift_id).is_none() {
            return Err(EngineError::NotFound(Entity::Shift(shift_id)));
        }
        let total_required = self.catalog.total_required(shift_id);
        let existing_count = match self.store.day(date) {
            Some(day) => day.read().await.for_shift(shift_id).count(),
            None => 0,
        };
        let reason = if date < self.clock.today() {
            Some(format!("date {date} is in the past"))
        } else if total_required == 0 {
            Some("shift has no required slots".to_string())
        } else if existing_count > 0 {
            Some(format!("shift is already scheduled on {date}"))
        } else {
            None
        };
        Ok(SlotCheck {
            can_add: reason.is_none(),
            reason,
            total_required,
            existing_count,
        })
    }

    fn view(&self, row: &ShiftOccurrence, now: NaiveDateTime) -> Option<OccurrenceView> {
        let template = self.catalog.template(row.shift_id)?;
        let employee_id = row.status.employee_id();
        let employee = employee_id.and_then(|id| self.directory.user(id));
        let status = match &row.status {
            OccurrenceStatus::Open => DisplayStatus::Open,
            OccurrenceStatus::Canceled { .. } => DisplayStatus::Canceled,
            OccurrenceStatus::Assigned { .. } => {
                if row.check_out.is_some() {
                    DisplayStatus::Completed
                } else if row.check_in.is_some() {
                    DisplayStatus::CheckedIn
                } else if DayPhase::of(row.date, &template.window, now).has_ended() {
                    DisplayStatus::Missed
                } else {
                    DisplayStatus::Assigned
                }
            }
        };
        let reason = match &row.status {
            OccurrenceStatus::Canceled { reason, .. } => reason.clone(),
            _ => None,
        };
        let scheduled_end = row.date.and_time(template.window.end);
        Some(OccurrenceView {
            id: row.id,
            shift_id: row.shift_id,
            shift_name: template.name,
            date: row.date,
            start: template.window.start,
            end: template.window.end,
            schedule_id: row.container_id,
            employee_id,
            employee_position_name: employee
                .as_ref()
                .and_then(|e| e.position_id)
                .and_then(|p| self.catalog.position(p))
                .map(|p| p.name),
            employee_name: employee.map(|e| e.full_name),
            status,
            notes: row.notes.clone(),
            reason,
            check_in: row.check_in,
            check_out: row.check_out,
            overtime_minutes: row
                .check_out
                .map(|out| (out - scheduled_end).num_minutes().max(0)),
        })
    }
}
