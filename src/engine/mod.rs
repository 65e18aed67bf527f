mod attendance;
mod catalog;
mod conflict;
mod containers;
mod error;
mod queries;
mod slots;
mod store;

pub use catalog::{EmployeeDirectory, ShiftCatalog};
pub use containers::ContainerRegistry;
pub use error::{ConflictKind, EngineError, Entity, StateViolation};
pub use store::{DayState, SharedDay};

use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use store::{DayGuard, DayLocks, OccurrenceStore, Sequence};

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        commits: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Commit, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued, then
/// fsyncs once for the whole batch and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { commit, response } => {
                let mut batch = vec![(commit, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { commit, response }) => batch.push((commit, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (commit, _) in batch {
        if let Err(e) = wal.append_buffered(commit) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partial bytes do not leak into the
    // next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { commits, response } => {
            let result = Wal::write_compact_file(wal.path(), &commits)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Scheduling state of one store: catalog, containers and occurrences, made
/// durable through the WAL.
///
/// Locking: slot operations hold `gate` shared and the write lock of every
/// day they touch, from the first validation read until the commit is
/// applied. Catalog changes, container administration, deactivation and
/// compaction hold `gate` exclusively. Days are always locked in ascending
/// date order.
pub struct Engine {
    pub catalog: ShiftCatalog,
    pub directory: EmployeeDirectory,
    pub containers: ContainerRegistry,
    pub(super) store: OccurrenceStore,
    pub(super) occurrence_ids: Sequence,
    pub(super) container_ids: Sequence,
    pub(super) gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let (wal, commits) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            catalog: ShiftCatalog::new(),
            directory: EmployeeDirectory::new(),
            containers: ContainerRegistry::new(),
            store: OccurrenceStore::new(),
            occurrence_ids: Sequence::new(),
            container_ids: Sequence::new(),
            gate: RwLock::new(()),
            wal_tx,
            notify,
            clock,
        };

        // Sole owner of every day lock here, so try_write always succeeds.
        // Never block: this may run inside an async context (lazy tenant creation).
        for commit in &commits {
            let mut guards: Vec<DayGuard<'_>> = commit
                .dates()
                .into_iter()
                .map(|date| {
                    let guard = engine
                        .store
                        .day_or_insert(date)
                        .try_write_owned()
                        .expect("replay: uncontended write");
                    DayGuard::new(guard, &engine.store)
                })
                .collect();
            let mut days: Vec<&mut DayState> = guards.iter_mut().map(|g| &mut **g).collect();
            for event in &commit.events {
                engine.apply_event(&mut days, event);
            }
        }
        if !commits.is_empty() {
            info!(path = %wal_path.display(), commits = commits.len(), "replayed WAL");
        }

        Ok(engine)
    }

    pub fn subscribe(&self, date: NaiveDate) -> broadcast::Receiver<Event> {
        self.notify.subscribe(date)
    }

    /// Apply one event. Occurrence events need their day among `days`.
    fn apply_event(&self, days: &mut [&mut DayState], event: &Event) {
        match event {
            Event::PositionSaved { position } => self.catalog.save_position(position.clone()),
            Event::UserSaved { user } => self.directory.save(user.clone()),
            Event::TemplateSaved { template } => self.catalog.save_template(template.clone()),
            Event::RulesReplaced { shift_id, rules } => {
                self.catalog.replace_rules(*shift_id, rules.clone())
            }
            Event::ContainerCreated { container } => {
                self.container_ids.observe(container.id);
                self.containers.insert(container.clone());
            }
            Event::ContainerDeleted { id } => self.containers.remove(*id),
            Event::OccurrenceCreated { occurrence } | Event::OccurrenceUpdated { occurrence } => {
                self.occurrence_ids.observe(occurrence.id);
                if let Some(day) = days.iter_mut().find(|d| d.date == occurrence.date) {
                    day.upsert(occurrence.clone());
                    self.store.locate(occurrence.id, occurrence.date);
                } else {
                    error!(date = %occurrence.date, id = occurrence.id, "occurrence event without its day lock");
                }
            }
            Event::OccurrenceDeleted { id, date } => {
                if let Some(day) = days.iter_mut().find(|d| d.date == *date) {
                    day.remove(*id);
                }
                self.store.forget(*id);
            }
            Event::SequencesAdvanced {
                next_occurrence_id,
                next_container_id,
            } => {
                self.occurrence_ids.observe(next_occurrence_id - 1);
                self.container_ids.observe(next_container_id - 1);
            }
        }
    }

    /// Write a commit to the WAL via the background group-commit writer.
    async fn wal_append(&self, commit: &Commit) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                commit: commit.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + notify. Nothing is applied unless the WAL write
    /// succeeded.
    pub(super) async fn commit(
        &self,
        days: &mut [&mut DayState],
        actor: Option<DbId>,
        events: Vec<Event>,
    ) -> Result<(), EngineError> {
        if events.is_empty() {
            return Ok(());
        }
        let commit = Commit {
            at: self.clock.now(),
            actor,
            events,
        };
        self.wal_append(&commit).await?;
        for event in &commit.events {
            self.apply_event(days, event);
        }
        for event in &commit.events {
            if let Some(date) = event.date() {
                self.notify.send(date, event);
            }
        }
        Ok(())
    }

    /// Write-lock one day, creating its entry on first use. The entry goes
    /// away again once the guard drops on an empty day.
    pub(super) async fn lock_day(&self, date: NaiveDate) -> DayGuard<'_> {
        DayGuard::new(self.store.day_or_insert(date).write_owned().await, &self.store)
    }

    /// Write-lock several days in ascending order.
    pub(super) async fn lock_days(&self, dates: BTreeSet<NaiveDate>) -> DayLocks<'_> {
        let mut locks = DayLocks::new();
        for date in dates {
            locks.push(self.lock_day(date).await);
        }
        locks
    }

    /// Best-effort attribution: an unknown acting user is recorded as `None`
    /// instead of failing the operation.
    pub(super) fn attribute(&self, user_id: Option<DbId>) -> Option<DbId> {
        let id = user_id?;
        if self.directory.user(id).is_some() {
            Some(id)
        } else {
            debug!(user_id = id, "unknown acting user, change left unattributed");
            None
        }
    }

    /// Replace the WAL with the minimal set of commits that recreates the
    /// current state: one for the catalog, one per day.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.gate.write().await;
        let at = self.clock.now();

        let mut catalog_events = Vec::new();
        for position in self.catalog.positions() {
            catalog_events.push(Event::PositionSaved { position });
        }
        for user in self.directory.users() {
            catalog_events.push(Event::UserSaved { user });
        }
        for template in self.catalog.templates() {
            catalog_events.push(Event::TemplateSaved { template });
        }
        for (shift_id, rules) in self.catalog.all_rules() {
            catalog_events.push(Event::RulesReplaced { shift_id, rules });
        }
        for container in self.containers.list() {
            catalog_events.push(Event::ContainerCreated { container });
        }
        catalog_events.push(Event::SequencesAdvanced {
            next_occurrence_id: self.occurrence_ids.peek(),
            next_container_id: self.container_ids.peek(),
        });

        let mut commits = vec![Commit {
            at,
            actor: None,
            events: catalog_events,
        }];
        for date in self.store.dates() {
            let Some(day) = self.store.day(date) else {
                continue;
            };
            let guard = day.read().await;
            if guard.occurrences.is_empty() {
                continue;
            }
            commits.push(Commit {
                at,
                actor: None,
                events: guard
                    .occurrences
                    .iter()
                    .map(|o| Event::OccurrenceCreated { occurrence: o.clone() })
                    .collect(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { commits, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
