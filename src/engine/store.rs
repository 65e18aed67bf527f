use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use crate::model::{DbId, ShiftOccurrence};

/// All occurrences of one calendar day, ordered by id.
#[derive(Debug, Clone)]
pub struct DayState {
    pub date: NaiveDate,
    pub occurrences: Vec<ShiftOccurrence>,
}

impl DayState {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            occurrences: Vec::new(),
        }
    }

    pub fn get(&self, id: DbId) -> Option<&ShiftOccurrence> {
        self.occurrences.iter().find(|o| o.id == id)
    }

    /// Insert keeping id order; replaces a row with the same id.
    pub fn upsert(&mut self, occurrence: ShiftOccurrence) {
        match self.occurrences.binary_search_by_key(&occurrence.id, |o| o.id) {
            Ok(pos) => self.occurrences[pos] = occurrence,
            Err(pos) => self.occurrences.insert(pos, occurrence),
        }
    }

    pub fn remove(&mut self, id: DbId) -> Option<ShiftOccurrence> {
        let pos = self.occurrences.iter().position(|o| o.id == id)?;
        Some(self.occurrences.remove(pos))
    }

    /// Every row of a template on this day, canceled ones included.
    pub fn for_shift(&self, shift_id: DbId) -> impl Iterator<Item = &ShiftOccurrence> {
        self.occurrences.iter().filter(move |o| o.shift_id == shift_id)
    }

    pub fn active(&self) -> impl Iterator<Item = &ShiftOccurrence> {
        self.occurrences.iter().filter(|o| !o.status.is_canceled())
    }

    pub fn holds_container(&self, container_id: DbId) -> bool {
        self.occurrences
            .iter()
            .any(|o| o.container_id == Some(container_id))
    }
}

pub type SharedDay = Arc<RwLock<DayState>>;

/// Occurrences partitioned by date, plus an id → date locator.
pub struct OccurrenceStore {
    days: DashMap<NaiveDate, SharedDay>,
    locator: DashMap<DbId, NaiveDate>,
}

impl OccurrenceStore {
    pub fn new() -> Self {
        Self {
            days: DashMap::new(),
            locator: DashMap::new(),
        }
    }

    pub fn day(&self, date: NaiveDate) -> Option<SharedDay> {
        self.days.get(&date).map(|e| e.value().clone())
    }

    pub fn day_or_insert(&self, date: NaiveDate) -> SharedDay {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DayState::new(date))))
            .value()
            .clone()
    }

    /// Dates with at least one day entry, ascending.
    pub fn dates(&self) -> BTreeSet<NaiveDate> {
        self.days.iter().map(|e| *e.key()).collect()
    }

    pub fn dates_between(&self, from: NaiveDate, to: NaiveDate) -> BTreeSet<NaiveDate> {
        self.days
            .iter()
            .map(|e| *e.key())
            .filter(|d| *d >= from && *d <= to)
            .collect()
    }

    pub fn date_of(&self, occurrence_id: DbId) -> Option<NaiveDate> {
        self.locator.get(&occurrence_id).map(|e| *e.value())
    }

    pub(super) fn locate(&self, occurrence_id: DbId, date: NaiveDate) {
        self.locator.insert(occurrence_id, date);
    }

    pub(super) fn forget(&self, occurrence_id: DbId) {
        self.locator.remove(&occurrence_id);
    }

    /// Drop an empty day's entry. The caller's guard and the map account for
    /// two references; a third means another task is about to lock the day.
    fn release(&self, date: NaiveDate) {
        self.days.remove_if(&date, |_, day| Arc::strong_count(day) == 2);
    }
}

/// Write guard over one day. Dropping it removes the day's entry when the
/// day holds no occurrences and no other task holds the day.
pub struct DayGuard<'a> {
    guard: OwnedRwLockWriteGuard<DayState>,
    store: &'a OccurrenceStore,
}

impl<'a> DayGuard<'a> {
    pub(super) fn new(guard: OwnedRwLockWriteGuard<DayState>, store: &'a OccurrenceStore) -> Self {
        Self { guard, store }
    }
}

impl Deref for DayGuard<'_> {
    type Target = DayState;

    fn deref(&self) -> &DayState {
        &self.guard
    }
}

impl DerefMut for DayGuard<'_> {
    fn deref_mut(&mut self) -> &mut DayState {
        &mut self.guard
    }
}

impl Drop for DayGuard<'_> {
    fn drop(&mut self) {
        if self.guard.occurrences.is_empty() {
            self.store.release(self.guard.date);
        }
    }
}

/// Write guards over a set of days, acquired in ascending date order.
pub struct DayLocks<'a> {
    guards: Vec<DayGuard<'a>>,
}

impl<'a> DayLocks<'a> {
    pub(super) fn new() -> Self {
        Self { guards: Vec::new() }
    }

    pub(super) fn push(&mut self, guard: DayGuard<'a>) {
        debug_assert!(self.guards.last().is_none_or(|g| g.date < guard.date));
        self.guards.push(guard);
    }

    pub fn days(&self) -> impl Iterator<Item = &DayState> {
        self.guards.iter().map(|g| &**g)
    }

    pub fn days_mut(&mut self) -> Vec<&mut DayState> {
        self.guards.iter_mut().map(|g| &mut **g).collect()
    }
}

/// Monotonic id sequence that never hands out an id seen on replay.
pub struct Sequence {
    next: AtomicI64,
}

impl Sequence {
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
        }
    }

    pub fn next(&self) -> DbId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    pub fn peek(&self) -> DbId {
        self.next.load(Ordering::SeqCst)
    }

    /// Make sure `id` is never returned by `next`.
    pub fn observe(&self, id: DbId) {
        self.next.fetch_max(id + 1, Ordering::SeqCst);
    }
}
