use tracing::info;

use crate::limits::*;
use crate::model::*;

use super::conflict::{
    check_duplicate_assignment, check_employee_overlap, check_position_capacity,
    check_shift_overlap, ensure_not_past,
};
use super::error::{Entity, StateViolation};
use super::store::DayGuard;
use super::{Engine, EngineError};

impl Engine {
    /// Lock the day of an occurrence and return it with its template.
    async fn lock_occurrence(
        &self,
        occurrence_id: DbId,
    ) -> Result<(DayGuard<'_>, ShiftOccurrence, ShiftTemplate), EngineError> {
        let not_found = || EngineError::NotFound(Entity::Occurrence(occurrence_id));
        let date = self.store.date_of(occurrence_id).ok_or_else(not_found)?;
        let day = self.lock_day(date).await;
        let row = day.get(occurrence_id).cloned().ok_or_else(not_found)?;
        let template = self
            .catalog
            .template(row.shift_id)
            .ok_or(EngineError::NotFound(Entity::Shift(row.shift_id)))?;
        Ok((day, row, template))
    }

    /// The acting user is the employee on the row or an admin.
    fn authorize(&self, acting_user_id: Option<DbId>, employee_id: Option<DbId>) -> Result<(), EngineError> {
        let allowed = acting_user_id
            .and_then(|id| self.directory.user(id))
            .is_some_and(|u| u.is_admin || Some(u.id) == employee_id);
        if allowed {
            Ok(())
        } else {
            Err(EngineError::Forbidden {
                user_id: acting_user_id,
            })
        }
    }

    pub async fn cancel_assignment(
        &self,
        occurrence_id: DbId,
        acting_user_id: Option<DbId>,
        reason: &str,
    ) -> Result<ShiftOccurrence, EngineError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(StateViolation::ReasonRequired.into());
        }
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let _gate = self.gate.read().await;
        let (mut day, row, _) = self.lock_occurrence(occurrence_id).await?;
        let now = self.clock.now();
        ensure_not_past(row.date, now.date())?;
        let employee_id = row
            .status
            .assigned_to()
            .ok_or(StateViolation::NotAssigned(occurrence_id))?;
        self.authorize(acting_user_id, Some(employee_id))?;

        let actor = self.attribute(acting_user_id);
        let mut canceled = row;
        canceled.status = OccurrenceStatus::Canceled {
            employee_id: Some(employee_id),
            reason: Some(reason.to_string()),
        };
        canceled.touch(actor, now);
        self.commit(
            &mut [&mut *day],
            actor,
            vec![Event::OccurrenceUpdated {
                occurrence: canceled.clone(),
            }],
        )
        .await?;
        info!(employee_shift_id = occurrence_id, employee_id, "assignment canceled");
        Ok(canceled)
    }

    /// Undo a cancellation. The row must still fit: shift overlap, duplicate,
    /// capacity and employee overlap are checked again.
    pub async fn restore_assignment(
        &self,
        occurrence_id: DbId,
        acting_user_id: Option<DbId>,
    ) -> Result<ShiftOccurrence, EngineError> {
        let _gate = self.gate.read().await;
        let (mut day, row, template) = self.lock_occurrence(occurrence_id).await?;
        let now = self.clock.now();
        ensure_not_past(row.date, now.date())?;
        let OccurrenceStatus::Canceled { employee_id, .. } = row.status else {
            return Err(StateViolation::NotCanceled(occurrence_id).into());
        };
        self.authorize(acting_user_id, employee_id)?;
        if !template.active {
            return Err(StateViolation::TemplateInactive(template.id).into());
        }

        check_shift_overlap(&day, &self.catalog, &template)?;
        let status = match employee_id {
            Some(employee_id) => {
                let employee = self
                    .directory
                    .user(employee_id)
                    .ok_or(EngineError::NotFound(Entity::Employee(employee_id)))?;
                check_duplicate_assignment(&day, template.id, employee_id, Some(occurrence_id))?;
                check_position_capacity(
                    &day,
                    &self.catalog,
                    &self.directory,
                    template.id,
                    &employee,
                    Some(occurrence_id),
                )?;
                check_employee_overlap(&day, &self.catalog, &template, employee_id)?;
                OccurrenceStatus::Assigned { employee_id }
            }
            None => OccurrenceStatus::Open,
        };

        let actor = self.attribute(acting_user_id);
        let mut restored = row;
        restored.status = status;
        restored.touch(actor, now);
        self.commit(
            &mut [&mut *day],
            actor,
            vec![Event::OccurrenceUpdated {
                occurrence: restored.clone(),
            }],
        )
        .await?;
        info!(employee_shift_id = occurrence_id, "assignment restored");
        Ok(restored)
    }

    /// Allowed only on the shift's date while its window is running.
    pub async fn check_in(
        &self,
        occurrence_id: DbId,
        acting_user_id: Option<DbId>,
    ) -> Result<ShiftOccurrence, EngineError> {
        let _gate = self.gate.read().await;
        let (mut day, row, template) = self.lock_occurrence(occurrence_id).await?;
        let employee_id = row
            .status
            .assigned_to()
            .ok_or(StateViolation::NotAssigned(occurrence_id))?;
        self.authorize(acting_user_id, Some(employee_id))?;
        let now = self.clock.now();
        if DayPhase::of(row.date, &template.window, now) != DayPhase::TodayInWindow {
            return Err(StateViolation::OutsideShiftWindow.into());
        }
        if row.check_in.is_some() {
            return Err(StateViolation::AlreadyCheckedIn(occurrence_id).into());
        }

        let actor = self.attribute(acting_user_id);
        let mut checked_in = row;
        checked_in.check_in = Some(now);
        checked_in.touch(actor, now);
        self.commit(
            &mut [&mut *day],
            actor,
            vec![Event::OccurrenceUpdated {
                occurrence: checked_in.clone(),
            }],
        )
        .await?;
        info!(employee_shift_id = occurrence_id, employee_id, "checked in");
        Ok(checked_in)
    }

    /// Allowed on the shift's date once its window has ended, after a check-in.
    /// Past days stay immutable, so a forgotten check-out is not repaired here.
    pub async fn check_out(
        &self,
        occurrence_id: DbId,
        acting_user_id: Option<DbId>,
    ) -> Result<ShiftOccurrence, EngineError> {
        let _gate = self.gate.read().await;
        let (mut day, row, template) = self.lock_occurrence(occurrence_id).await?;
        let employee_id = row
            .status
            .assigned_to()
            .ok_or(StateViolation::NotAssigned(occurrence_id))?;
        self.authorize(acting_user_id, Some(employee_id))?;
        if row.check_in.is_none() {
            return Err(StateViolation::NotCheckedIn(occurrence_id).into());
        }
        if row.check_out.is_some() {
            return Err(StateViolation::AlreadyCheckedOut(occurrence_id).into());
        }
        let now = self.clock.now();
        ensure_not_past(row.date, now.date())?;
        if DayPhase::of(row.date, &template.window, now) != DayPhase::TodayAfterWindow {
            return Err(StateViolation::ShiftNotEnded.into());
        }

        let actor = self.attribute(acting_user_id);
        let mut checked_out = row;
        checked_out.check_out = Some(now);
        checked_out.touch(actor, now);
        self.commit(
            &mut [&mut *day],
            actor,
            vec![Event::OccurrenceUpdated {
                occurrence: checked_out.clone(),
            }],
        )
        .await?;
        info!(employee_shift_id = occurrence_id, employee_id, "checked out");
        Ok(checked_out)
    }
}
