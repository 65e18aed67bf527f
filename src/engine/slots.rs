use std::collections::{BTreeSet, HashSet};

use chrono::{NaiveDate, NaiveDateTime};
use tracing::info;

use crate::limits::*;
use crate::model::*;

use super::conflict::{
    check_duplicate_assignment, check_employee_overlap, check_position_capacity,
    check_shift_overlap, ensure_not_past,
};
use super::error::{ConflictKind, Entity, StateViolation};
use super::store::DayState;
use super::{Engine, EngineError};

fn cancel_row(row: &ShiftOccurrence, actor: Option<DbId>, now: NaiveDateTime) -> Event {
    let mut canceled = row.clone();
    canceled.status = OccurrenceStatus::Canceled {
        employee_id: row.status.employee_id(),
        reason: None,
    };
    canceled.touch(actor, now);
    Event::OccurrenceUpdated {
        occurrence: canceled,
    }
}

impl Engine {
    fn template_or_not_found(&self, shift_id: DbId) -> Result<ShiftTemplate, EngineError> {
        self.catalog
            .template(shift_id)
            .ok_or(EngineError::NotFound(Entity::Shift(shift_id)))
    }

    /// Create the open-slot placeholder of a template on a date, or hand back
    /// the existing one when `merge_if_exists` is set.
    pub async fn add_open_slots(
        &self,
        date: NaiveDate,
        shift_id: DbId,
        admin_id: Option<DbId>,
        create_container_if_missing: bool,
        merge_if_exists: bool,
    ) -> Result<OpenSlotsOutcome, EngineError> {
        let _gate = self.gate.read().await;
        let template = self.template_or_not_found(shift_id)?;
        let now = self.clock.now();
        ensure_not_past(date, now.date())?;
        if !template.active {
            return Err(StateViolation::TemplateInactive(shift_id).into());
        }

        let mut day = self.lock_day(date).await;
        check_shift_overlap(&day, &self.catalog, &template)?;
        if self.catalog.total_required(shift_id) == 0 {
            return Err(StateViolation::NoRequiredSlots(shift_id).into());
        }

        let existing: Vec<&ShiftOccurrence> = day.for_shift(shift_id).collect();
        if let Some(first) = existing.first() {
            if !merge_if_exists {
                return Err(ConflictKind::AlreadyScheduled { shift_id, date }.into());
            }
            return Ok(OpenSlotsOutcome {
                created: false,
                employee_shift_id: first.id,
                schedule_id: first.container_id,
                existing_count: existing.len(),
            });
        }
        if day.occurrences.len() >= MAX_OCCURRENCES_PER_DAY {
            return Err(EngineError::LimitExceeded("too many shifts on this day"));
        }

        let actor = self.attribute(admin_id);
        let mut events = Vec::with_capacity(2);
        let container_id = match self.containers.find_covering(date) {
            Some(container) => Some(container.id),
            None if create_container_if_missing => {
                let container = self.new_auto_container(date, actor, now);
                let id = container.id;
                events.push(Event::ContainerCreated { container });
                Some(id)
            }
            None => None,
        };
        let occurrence = ShiftOccurrence {
            id: self.occurrence_ids.next(),
            shift_id,
            container_id,
            date,
            status: OccurrenceStatus::Open,
            notes: None,
            check_in: None,
            check_out: None,
            created_by: actor,
            created_at: now,
            updated_by: None,
            updated_at: None,
        };
        let id = occurrence.id;
        events.push(Event::OccurrenceCreated { occurrence });
        self.commit(&mut [&mut *day], actor, events).await?;

        info!(shift_id, %date, employee_shift_id = id, "open slot added");
        Ok(OpenSlotsOutcome {
            created: true,
            employee_shift_id: id,
            schedule_id: container_id,
            existing_count: 0,
        })
    }

    /// Remove every occurrence of a template on a date. While the shift is
    /// running the rows are canceled instead of deleted.
    pub async fn remove_slots(
        &self,
        date: NaiveDate,
        shift_id: DbId,
        admin_id: Option<DbId>,
    ) -> Result<RemoveSlotsOutcome, EngineError> {
        let _gate = self.gate.read().await;
        let template = self.template_or_not_found(shift_id)?;
        let now = self.clock.now();
        ensure_not_past(date, now.date())?;

        let mut day = self.lock_day(date).await;
        let rows: Vec<ShiftOccurrence> = day.for_shift(shift_id).cloned().collect();
        if rows.is_empty() {
            return Ok(RemoveSlotsOutcome {
                removed_count: 0,
                canceled_count: 0,
            });
        }

        let actor = self.attribute(admin_id);
        let (events, outcome) = if DayPhase::of(date, &template.window, now) == DayPhase::TodayInWindow {
            let events: Vec<Event> = rows
                .iter()
                .filter(|o| !o.status.is_canceled())
                .map(|o| cancel_row(o, actor, now))
                .collect();
            let canceled_count = events.len();
            (
                events,
                RemoveSlotsOutcome {
                    removed_count: 0,
                    canceled_count,
                },
            )
        } else {
            let events = self.delete_rows(&day, &rows);
            (
                events,
                RemoveSlotsOutcome {
                    removed_count: rows.len(),
                    canceled_count: 0,
                },
            )
        };
        self.commit(&mut [&mut *day], actor, events).await?;

        info!(
            shift_id,
            %date,
            removed = outcome.removed_count,
            canceled = outcome.canceled_count,
            "slots removed"
        );
        Ok(outcome)
    }

    /// Deletion events for `rows` plus release of auto containers they empty.
    fn delete_rows(&self, day: &DayState, rows: &[ShiftOccurrence]) -> Vec<Event> {
        let removed: HashSet<DbId> = rows.iter().map(|o| o.id).collect();
        let containers: BTreeSet<DbId> = rows.iter().filter_map(|o| o.container_id).collect();
        let mut events: Vec<Event> = rows
            .iter()
            .map(|o| Event::OccurrenceDeleted {
                id: o.id,
                date: o.date,
            })
            .collect();
        events.extend(self.release_auto_containers(day, &removed, &containers));
        events
    }

    /// Reconcile every occurrence of a template being turned inactive: past
    /// rows stay, rows of a shift running right now are canceled, everything
    /// else is deleted.
    pub async fn handle_template_deactivation(
        &self,
        shift_id: DbId,
        admin_id: Option<DbId>,
    ) -> Result<DeactivationCounts, EngineError> {
        let _gate = self.gate.write().await;
        let template = self.template_or_not_found(shift_id)?;
        let actor = self.attribute(admin_id);
        self.reconcile_deactivated(&template, actor, Vec::new()).await
    }

    /// Caller holds `gate` exclusively. `leading` events are committed
    /// together with the reconciliation.
    pub(super) async fn reconcile_deactivated(
        &self,
        template: &ShiftTemplate,
        actor: Option<DbId>,
        leading: Vec<Event>,
    ) -> Result<DeactivationCounts, EngineError> {
        let now = self.clock.now();
        let dates = self.dates_with_shift(template.id).await;
        let mut locks = self.lock_days(dates).await;

        let mut events = leading;
        let mut counts = DeactivationCounts::default();
        for day in locks.days() {
            let rows: Vec<ShiftOccurrence> = day.for_shift(template.id).cloned().collect();
            match DayPhase::of(day.date, &template.window, now) {
                DayPhase::Past => counts.kept_past += rows.len(),
                DayPhase::TodayInWindow => {
                    for row in rows.iter().filter(|o| !o.status.is_canceled()) {
                        events.push(cancel_row(row, actor, now));
                        counts.canceled_today += 1;
                    }
                }
                _ => {
                    counts.deleted_future += rows.len();
                    events.extend(self.delete_rows(day, &rows));
                }
            }
        }
        self.commit(&mut locks.days_mut(), actor, events).await?;

        info!(
            shift_id = template.id,
            kept_past = counts.kept_past,
            canceled_today = counts.canceled_today,
            deleted_future = counts.deleted_future,
            "shift template deactivated"
        );
        Ok(counts)
    }

    /// Bind an employee to a template on a date, filling an open slot when
    /// there is one.
    pub async fn add_employee_to_shift(
        &self,
        date: NaiveDate,
        shift_id: DbId,
        employee_id: DbId,
        notes: Option<String>,
        admin_id: Option<DbId>,
    ) -> Result<AssignmentOutcome, EngineError> {
        let _gate = self.gate.read().await;
        let template = self.template_or_not_found(shift_id)?;
        let employee = self
            .directory
            .user(employee_id)
            .ok_or(EngineError::NotFound(Entity::Employee(employee_id)))?;
        let now = self.clock.now();
        ensure_not_past(date, now.date())?;
        if !template.active {
            return Err(StateViolation::TemplateInactive(shift_id).into());
        }
        if notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(EngineError::LimitExceeded("notes too long"));
        }

        let mut day = self.lock_day(date).await;
        check_duplicate_assignment(&day, shift_id, employee_id, None)?;
        check_position_capacity(&day, &self.catalog, &self.directory, shift_id, &employee, None)?;
        check_employee_overlap(&day, &self.catalog, &template, employee_id)?;
        check_shift_overlap(&day, &self.catalog, &template)?;

        let actor = self.attribute(admin_id);
        let open_slot = day.for_shift(shift_id).find(|o| o.status.is_open()).cloned();
        let reused_open_slot = open_slot.is_some();
        let occurrence = match open_slot {
            Some(mut row) => {
                row.status = OccurrenceStatus::Assigned { employee_id };
                row.notes = notes;
                row.touch(actor, now);
                row
            }
            None => {
                if day.occurrences.len() >= MAX_OCCURRENCES_PER_DAY {
                    return Err(EngineError::LimitExceeded("too many shifts on this day"));
                }
                ShiftOccurrence {
                    id: self.occurrence_ids.next(),
                    shift_id,
                    container_id: self.containers.find_covering(date).map(|c| c.id),
                    date,
                    status: OccurrenceStatus::Assigned { employee_id },
                    notes,
                    check_in: None,
                    check_out: None,
                    created_by: actor,
                    created_at: now,
                    updated_by: None,
                    updated_at: None,
                }
            }
        };
        let id = occurrence.id;
        let event = if reused_open_slot {
            Event::OccurrenceUpdated { occurrence }
        } else {
            Event::OccurrenceCreated { occurrence }
        };
        self.commit(&mut [&mut *day], actor, vec![event]).await?;

        info!(shift_id, %date, employee_id, employee_shift_id = id, reused_open_slot, "employee assigned");
        Ok(AssignmentOutcome {
            created: true,
            employee_shift_id: id,
            reused_open_slot,
            employee_position_name: employee
                .position_id
                .and_then(|p| self.catalog.position(p))
                .map(|p| p.name),
            employee_name: employee.full_name,
        })
    }

    /// Unbind an employee. The last assignee's row turns back into an open
    /// slot so the template stays scheduled; any other row is deleted.
    pub async fn remove_employee_from_shift(
        &self,
        occurrence_id: DbId,
        admin_id: Option<DbId>,
    ) -> Result<RemovalOutcome, EngineError> {
        let _gate = self.gate.read().await;
        let not_found = || EngineError::NotFound(Entity::Occurrence(occurrence_id));
        let date = self.store.date_of(occurrence_id).ok_or_else(not_found)?;
        let now = self.clock.now();
        ensure_not_past(date, now.date())?;

        let mut day = self.lock_day(date).await;
        let row = day.get(occurrence_id).cloned().ok_or_else(not_found)?;
        let assigned = day
            .for_shift(row.shift_id)
            .filter(|o| o.status.assigned_to().is_some())
            .count();

        let actor = self.attribute(admin_id);
        let reopened = row.status.assigned_to().is_some() && assigned <= 1;
        let events = if reopened {
            let mut open = row;
            open.status = OccurrenceStatus::Open;
            open.notes = None;
            open.check_in = None;
            open.check_out = None;
            open.touch(actor, now);
            vec![Event::OccurrenceUpdated { occurrence: open }]
        } else {
            self.delete_rows(&day, std::slice::from_ref(&row))
        };
        self.commit(&mut [&mut *day], actor, events).await?;

        info!(employee_shift_id = occurrence_id, %date, reopened, "employee removed from shift");
        Ok(RemovalOutcome {
            employee_shift_id: occurrence_id,
            reopened,
        })
    }
}
