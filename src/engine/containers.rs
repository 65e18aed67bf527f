use std::collections::{BTreeSet, HashSet};

use chrono::{NaiveDate, NaiveDateTime};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::limits::*;
use crate::model::*;

use super::error::{ConflictKind, Entity, StateViolation};
use super::store::DayState;
use super::{Engine, EngineError};

/// Schedule containers by id.
pub struct ContainerRegistry {
    containers: DashMap<DbId, ScheduleContainer>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self {
            containers: DashMap::new(),
        }
    }

    pub fn get(&self, id: DbId) -> Option<ScheduleContainer> {
        self.containers.get(&id).map(|e| e.value().clone())
    }

    /// The oldest container whose range includes `date`.
    pub fn find_covering(&self, date: NaiveDate) -> Option<ScheduleContainer> {
        self.containers
            .iter()
            .filter(|e| e.covers(date))
            .min_by_key(|e| *e.key())
            .map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<ScheduleContainer> {
        let mut all: Vec<_> = self.containers.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|c| (c.start_date, c.id));
        all
    }

    pub(super) fn insert(&self, container: ScheduleContainer) {
        self.containers.insert(container.id, container);
    }

    pub(super) fn remove(&self, id: DbId) {
        self.containers.remove(&id);
    }
}

impl Engine {
    /// Build a single-day container named `Auto: <date>`. The caller commits
    /// the returned container with the occurrence that needs it.
    pub(super) fn new_auto_container(
        &self,
        date: NaiveDate,
        actor: Option<DbId>,
        now: NaiveDateTime,
    ) -> ScheduleContainer {
        ScheduleContainer {
            id: self.container_ids.next(),
            name: ScheduleContainer::auto_name(date),
            start_date: date,
            end_date: date,
            created_by: actor,
            created_at: now,
        }
    }

    /// Deletion events for auto-created containers among `candidates` that
    /// hold nothing on `day` once `removed` rows are gone. Auto containers
    /// span a single date, so the day alone decides emptiness.
    pub(super) fn release_auto_containers(
        &self,
        day: &DayState,
        removed: &HashSet<DbId>,
        candidates: &BTreeSet<DbId>,
    ) -> Vec<Event> {
        candidates
            .iter()
            .filter(|id| self.containers.get(**id).is_some_and(|c| c.is_auto()))
            .filter(|id| {
                !day.occurrences
                    .iter()
                    .any(|o| o.container_id == Some(**id) && !removed.contains(&o.id))
            })
            .map(|id| {
                debug!(container_id = *id, date = %day.date, "releasing empty auto schedule");
                Event::ContainerDeleted { id: *id }
            })
            .collect()
    }

    /// Admin-created container. Names with the auto prefix are reserved for
    /// the engine.
    pub async fn create_container(
        &self,
        name: String,
        start_date: NaiveDate,
        end_date: NaiveDate,
        admin_id: Option<DbId>,
    ) -> Result<ScheduleContainer, EngineError> {
        let _gate = self.gate.write().await;
        if start_date > end_date {
            return Err(StateViolation::InvalidDateRange.into());
        }
        if name.trim_start().starts_with(AUTO_CONTAINER_PREFIX) {
            return Err(StateViolation::ReservedName.into());
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("schedule name too long"));
        }
        let actor = self.attribute(admin_id);
        let container = ScheduleContainer {
            id: self.container_ids.next(),
            name,
            start_date,
            end_date,
            created_by: actor,
            created_at: self.clock.now(),
        };
        self.commit(
            &mut [],
            actor,
            vec![Event::ContainerCreated {
                container: container.clone(),
            }],
        )
        .await?;
        info!(container_id = container.id, %start_date, %end_date, "schedule created");
        Ok(container)
    }

    pub async fn delete_container(&self, id: DbId, admin_id: Option<DbId>) -> Result<(), EngineError> {
        let _gate = self.gate.write().await;
        let container = self
            .containers
            .get(id)
            .ok_or(EngineError::NotFound(Entity::Container(id)))?;
        for date in self.store.dates_between(container.start_date, container.end_date) {
            if let Some(day) = self.store.day(date)
                && day.read().await.holds_container(id)
            {
                return Err(ConflictKind::ContainerNotEmpty(id).into());
            }
        }
        let actor = self.attribute(admin_id);
        self.commit(&mut [], actor, vec![Event::ContainerDeleted { id }])
            .await?;
        info!(container_id = id, "schedule deleted");
        Ok(())
    }
}
