// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Reversible tuning engine.
//!
//! The engine applies profiles to the host and undoes them again. Every apply
//! follows the same write-ahead discipline:
//!
//! 1. Take the engine lock.
//! 2. Resolve every assignment of the profile to a registered tunable.
//! 3. Read the prior value of every tunable and record it in a snapshot.
//! 4. Persist the snapshot and mark the profile as active.
//! 5. Write desired values one at a time in declaration order.
//! 6. Finalize the snapshot with the outcome of every write.
//!
//! Failure of a single tunable never stops the rest of the profile. It is
//! recorded, and the overall result becomes partial instead.
//!
//! # State Directory Layout
//!
//! ```text
//! <state_dir>/
//! ├── lock            PID of the process holding the engine lock
//! ├── active.toml     active profile marker
//! └── snapshots/      snapshot store
//! ```

pub mod lock;
pub mod marker;
pub mod report;

use crate::{
    engine::{
        lock::{EngineLock, LockError},
        marker::{ActiveProfileMarker, MarkerError},
        report::{
            ApplyResult, Mode, Outcome, Overall, RestoreResult, StatusEntry, StatusReport,
            TunableOutcome, TunableState,
        },
    },
    facts::FactsProvider,
    profile::Profile,
    store::{Snapshot, SnapshotRef, SnapshotStore, StoreError, TunableRecord},
    tunable::{RegistryError, Tunable, TunableRegistry, Value},
};

use indicatif::ProgressBar;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Applies profiles, restores snapshots, and reports status.
pub struct Engine {
    registry: TunableRegistry,
    facts: Box<dyn FactsProvider>,
    store: SnapshotStore,
    state_dir: PathBuf,
}

impl Engine {
    /// Construct new engine keeping its state in `state_dir`.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::Store`] if the state directory or snapshot
    ///   store cannot be created.
    pub fn new(
        registry: TunableRegistry,
        facts: impl FactsProvider,
        state_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let state_dir = state_dir.into();
        let store = SnapshotStore::open(state_dir.join("snapshots"))?;

        Ok(Self {
            registry,
            facts: Box::new(facts),
            store,
            state_dir,
        })
    }

    pub fn registry(&self) -> &TunableRegistry {
        &self.registry
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Currently active profile, if any.
    pub fn active_marker(&self) -> Option<ActiveProfileMarker> {
        ActiveProfileMarker::load(self.marker_path())
    }

    /// Apply profile to the host.
    ///
    /// In [`Mode::DryRun`] nothing is written: no tunable, no snapshot, no
    /// marker. The lock is still taken so the reported current values are not
    /// racing another apply.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::Lock`] if another apply or restore runs.
    /// - Return [`EngineError::Registry`] if the profile names an unknown
    ///   tunable. Nothing is written in that case.
    /// - Return [`EngineError::Store`] if the snapshot cannot be persisted.
    ///   Nothing is written in that case.
    /// - Return [`EngineError::Marker`] if the active profile marker cannot
    ///   be written. Nothing is written in that case.
    #[instrument(skip(self, profile, bar), fields(profile = profile.name()), level = "debug")]
    pub fn apply(&self, profile: &Profile, mode: Mode, bar: &ProgressBar) -> Result<ApplyResult> {
        let _lock = EngineLock::acquire(self.lock_path())?;
        info!("apply profile {:?}", profile.name());

        // INVARIANT: Every assignment resolves before anything is read or written.
        let resolved = profile
            .assignments()
            .iter()
            .map(|assignment| Ok((assignment, self.registry.resolve(&assignment.tunable)?)))
            .collect::<Result<Vec<_>>>()?;

        let facts = self.facts.gather();
        let mut snapshot = Snapshot::new(profile.name());
        let mut steps = Vec::with_capacity(resolved.len());
        for (assignment, tunable) in resolved {
            let Some(prior) = self.probe(tunable) else {
                snapshot.records.push(TunableRecord::unsupported(tunable.name()));
                steps.push(Step::Skip(tunable.name()));
                continue;
            };

            snapshot.records.push(TunableRecord::supported(tunable.name(), prior.clone()));
            match assignment.target.desired(&facts) {
                Some(desired) => steps.push(Step::Write {
                    record: snapshot.records.len() - 1,
                    tunable,
                    prior,
                    desired,
                }),
                None => {
                    debug!("target {} has no value for this host", assignment.target);
                    steps.push(Step::Skip(tunable.name()));
                }
            }
        }

        if mode == Mode::DryRun {
            let outcomes = steps
                .into_iter()
                .map(|step| match step {
                    Step::Skip(name) => TunableOutcome::new(name, Outcome::SkippedUnsupported),
                    Step::Write { tunable, prior, desired, .. } => TunableOutcome::new(
                        tunable.name(),
                        Outcome::Planned {
                            current: prior,
                            desired,
                        },
                    ),
                })
                .collect::<Vec<_>>();
            let overall = Overall::of_apply(&outcomes);

            return Ok(ApplyResult {
                profile: profile.name().into(),
                mode,
                snapshot_ref: None,
                snapshot,
                outcomes,
                overall,
            });
        }

        let snapshot_ref = self.store.save(&snapshot)?;
        ActiveProfileMarker {
            profile: profile.name().into(),
            snapshot: snapshot_ref.clone(),
            pid: std::process::id(),
            started_at: snapshot.created_at,
        }
        .save(self.marker_path())?;
        info!("saved snapshot {snapshot_ref}");

        bar.set_length(steps.len() as u64);
        let mut outcomes = Vec::with_capacity(steps.len());
        for step in steps {
            let outcome = match step {
                Step::Skip(name) => {
                    info!("{name}: not supported on this host, skipping");
                    TunableOutcome::new(name, Outcome::SkippedUnsupported)
                }
                Step::Write {
                    record,
                    tunable,
                    prior,
                    desired,
                } => {
                    bar.set_message(tunable.name().to_string());
                    let record = &mut snapshot.records[record];
                    record.write_attempted = true;
                    match tunable.write(&desired) {
                        Ok(()) => {
                            record.write_succeeded = true;
                            info!("{}: {prior} -> {desired}", tunable.name());
                            TunableOutcome::new(
                                tunable.name(),
                                Outcome::Applied {
                                    from: prior,
                                    to: desired,
                                },
                            )
                        }
                        Err(error) => {
                            warn!("{}: {error}", tunable.name());
                            record.error = Some(error.to_string());
                            TunableOutcome::new(tunable.name(), Outcome::Failed(error.to_string()))
                        }
                    }
                }
            };
            outcomes.push(outcome);
            bar.inc(1);
        }

        match self.store.finalize(&snapshot_ref, &snapshot) {
            Ok(()) => snapshot.finalized = true,
            Err(error) => warn!(
                "snapshot {snapshot_ref} left unfinalized, \
                 restore will write back every supported tunable: {error}"
            ),
        }

        let overall = Overall::of_apply(&outcomes);
        info!("profile {:?} applied: {overall}", profile.name());

        Ok(ApplyResult {
            profile: profile.name().into(),
            mode,
            snapshot_ref: Some(snapshot_ref),
            snapshot,
            outcomes,
            overall,
        })
    }

    /// Restore snapshot, or the most recent one if none is given.
    ///
    /// Only tunables the apply attempted to write are written back. If the
    /// apply never finalized its snapshot, every supported tunable is
    /// written back instead. The active profile marker is cleared only if it
    /// still refers to the restored snapshot.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::Lock`] if another apply or restore runs.
    /// - Return [`EngineError::NoSnapshot`] if no snapshot exists.
    /// - Return [`EngineError::SnapshotNotFound`] if the given snapshot does
    ///   not exist.
    /// - Return [`EngineError::Store`] if the snapshot cannot be read.
    #[instrument(skip(self, bar), level = "debug")]
    pub fn restore(
        &self,
        snapshot_ref: Option<&SnapshotRef>,
        bar: &ProgressBar,
    ) -> Result<RestoreResult> {
        let _lock = EngineLock::acquire(self.lock_path())?;

        let (snapshot_ref, snapshot) = match snapshot_ref {
            Some(snapshot_ref) => self
                .store
                .load(snapshot_ref)
                .map(|snapshot| (snapshot_ref.clone(), snapshot)),
            None => self.store.load_latest(),
        }
        .map_err(|error| match error {
            StoreError::Empty => EngineError::NoSnapshot,
            StoreError::NotFound(snapshot_ref) => EngineError::SnapshotNotFound(snapshot_ref),
            error => EngineError::Store(error),
        })?;

        info!("restore snapshot {snapshot_ref} of profile {:?}", snapshot.profile);
        if !snapshot.finalized {
            warn!("snapshot {snapshot_ref} was never finalized, restoring every supported tunable");
        }

        bar.set_length(snapshot.records.len() as u64);
        let mut outcomes = Vec::with_capacity(snapshot.records.len());
        for record in &snapshot.records {
            let outcome = match &record.prior_value {
                Some(prior) if snapshot.needs_restore(record) => {
                    bar.set_message(record.tunable.clone());
                    match self.registry.resolve(&record.tunable) {
                        Ok(tunable) => match tunable.write(prior) {
                            Ok(()) => {
                                info!("{}: restored {prior}", record.tunable);
                                Outcome::Restored(prior.clone())
                            }
                            Err(error) => {
                                warn!("{}: {error}", record.tunable);
                                Outcome::Failed(error.to_string())
                            }
                        },
                        Err(error) => {
                            warn!("{error}");
                            Outcome::Failed(error.to_string())
                        }
                    }
                }
                _ => {
                    debug!("{}: untouched by apply, skipping", record.tunable);
                    Outcome::SkippedUnsupported
                }
            };
            outcomes.push(TunableOutcome::new(record.tunable.clone(), outcome));
            bar.inc(1);
        }

        let overall = Overall::of_restore(&outcomes);
        let marker_cleared = match self.active_marker() {
            Some(marker) if marker.snapshot == snapshot_ref && overall != Overall::Failed => {
                match ActiveProfileMarker::clear(self.marker_path()) {
                    Ok(()) => true,
                    Err(error) => {
                        warn!("{error}");
                        false
                    }
                }
            }
            Some(marker) => {
                debug!("active profile {:?} is not from snapshot {snapshot_ref}", marker.profile);
                false
            }
            None => false,
        };
        info!("snapshot {snapshot_ref} restored: {overall}");

        Ok(RestoreResult {
            snapshot_ref,
            profile: snapshot.profile,
            outcomes,
            overall,
            marker_cleared,
        })
    }

    /// Compare live values with a profile.
    ///
    /// Takes no lock. Reads may interleave with a concurrent apply, in which
    /// case the report shows whatever was live at the time of each read.
    #[instrument(skip(self, profile), level = "debug")]
    pub fn status(&self, profile: Option<&Profile>) -> StatusReport {
        let active = self.active_marker();
        let Some(profile) = profile else {
            return StatusReport {
                active,
                profile: None,
                entries: Vec::new(),
            };
        };

        let facts = self.facts.gather();
        let entries = profile
            .assignments()
            .iter()
            .map(|assignment| {
                let live = self
                    .registry
                    .resolve(&assignment.tunable)
                    .ok()
                    .and_then(|tunable| self.probe(tunable));
                let state = match (live, assignment.target.desired(&facts)) {
                    (Some(live), Some(desired)) if live.satisfies(&desired) => {
                        TunableState::Matches(live)
                    }
                    (Some(live), Some(desired)) => TunableState::Diverged { live, desired },
                    _ => TunableState::Unsupported,
                };
                StatusEntry {
                    tunable: assignment.tunable.clone(),
                    state,
                }
            })
            .collect();

        StatusReport {
            active,
            profile: Some(profile.name().into()),
            entries,
        }
    }

    /// Read live value of tunable if it applies to this host.
    fn probe(&self, tunable: &dyn Tunable) -> Option<Value> {
        if !self.registry.is_applicable(tunable.name()) {
            return None;
        }

        match tunable.read() {
            Ok(value) => value,
            Err(error) => {
                warn!("cannot read {}, treating as unsupported: {error}", tunable.name());
                None
            }
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.state_dir.join("lock")
    }

    fn marker_path(&self) -> PathBuf {
        self.state_dir.join("active.toml")
    }
}

enum Step<'a> {
    Skip(&'a str),
    Write {
        record: usize,
        tunable: &'a dyn Tunable,
        prior: Value,
        desired: Value,
    },
}

/// Engine error types.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Engine lock cannot be taken.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Profile names a tunable that is not registered.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Restore requested with an empty snapshot store.
    #[error("no snapshot to restore")]
    NoSnapshot,

    /// Restore requested for a snapshot that does not exist.
    #[error("no snapshot {0}")]
    SnapshotNotFound(SnapshotRef),

    /// Snapshot store access fails.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Active profile marker cannot be written.
    #[error(transparent)]
    Marker(#[from] MarkerError),
}

/// Friendly result alias :3
type Result<T, E = EngineError> = std::result::Result<T, E>;
