use chrono::NaiveDate;

use crate::model::*;

use super::catalog::{EmployeeDirectory, ShiftCatalog};
use super::error::{ConflictKind, StateViolation};
use super::store::DayState;
use super::EngineError;

/// Nothing on a past calendar day may be created, modified or deleted.
pub(super) fn ensure_not_past(date: NaiveDate, today: NaiveDate) -> Result<(), EngineError> {
    if date < today {
        return Err(StateViolation::PastDate(date).into());
    }
    Ok(())
}

/// Another template with an overlapping window already has a live row on
/// this day.
pub(super) fn check_shift_overlap(
    day: &DayState,
    catalog: &ShiftCatalog,
    template: &ShiftTemplate,
) -> Result<(), EngineError> {
    for row in day.active().filter(|o| o.shift_id != template.id) {
        if let Some(window) = catalog.window(row.shift_id)
            && window.overlaps(&template.window)
        {
            return Err(ConflictKind::ShiftOverlap {
                shift_id: template.id,
                other_shift_id: row.shift_id,
                date: day.date,
            }
            .into());
        }
    }
    Ok(())
}

pub(super) fn check_duplicate_assignment(
    day: &DayState,
    shift_id: DbId,
    employee_id: DbId,
    ignore: Option<DbId>,
) -> Result<(), EngineError> {
    let taken = day
        .for_shift(shift_id)
        .filter(|o| Some(o.id) != ignore)
        .any(|o| o.status.assigned_to() == Some(employee_id));
    if taken {
        return Err(ConflictKind::AlreadyAssigned {
            employee_id,
            shift_id,
            date: day.date,
        }
        .into());
    }
    Ok(())
}

/// With rules configured, the employee's position must be allowed and, when
/// the rule carries a required count, still have room on this (shift, date).
pub(super) fn check_position_capacity(
    day: &DayState,
    catalog: &ShiftCatalog,
    directory: &EmployeeDirectory,
    shift_id: DbId,
    employee: &User,
    ignore: Option<DbId>,
) -> Result<(), EngineError> {
    let rules = catalog.rules(shift_id);
    if rules.is_empty() {
        return Ok(());
    }
    let Some(rule) = rules
        .iter()
        .find(|r| r.allowed && Some(r.position_id) == employee.position_id)
    else {
        return Err(ConflictKind::PositionNotAllowed {
            employee_id: employee.id,
            position_id: employee.position_id,
            shift_id,
        }
        .into());
    };
    let Some(required) = rule.required_count else {
        return Ok(());
    };
    let filled = day
        .for_shift(shift_id)
        .filter(|o| Some(o.id) != ignore)
        .filter_map(|o| o.status.assigned_to())
        .filter(|eid| directory.position_of(*eid) == Some(rule.position_id))
        .count();
    if filled >= required as usize {
        return Err(ConflictKind::CapacityExceeded {
            shift_id,
            position_id: rule.position_id,
            required,
        }
        .into());
    }
    Ok(())
}

/// The employee already holds a live row of another template whose window
/// overlaps this one.
pub(super) fn check_employee_overlap(
    day: &DayState,
    catalog: &ShiftCatalog,
    template: &ShiftTemplate,
    employee_id: DbId,
) -> Result<(), EngineError> {
    for row in day.active() {
        if row.shift_id == template.id || row.status.assigned_to() != Some(employee_id) {
            continue;
        }
        if let Some(window) = catalog.window(row.shift_id)
            && window.overlaps(&template.window)
        {
            return Err(ConflictKind::EmployeeDoubleBooked {
                employee_id,
                occurrence_id: row.id,
            }
            .into());
        }
    }
    Ok(())
}
