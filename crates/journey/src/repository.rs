//! Run storage with compare-and-swap claims.
//!
//! `status` and `version` together form the claim. Every claim and every
//! commit bumps `version`, so a worker whose claim was swept cannot commit
//! over the run afterwards.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use donorflow_core::types::ContactId;

use crate::error::{JourneyError, JourneyResult};
use crate::state_machine::RunStateMachine;
use crate::types::{HistoryEntry, Outcome, Run, RunStatus};

/// A run that is due, with the version a claim must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueRun {
    pub run_id: Uuid,
    pub journey_id: Uuid,
    pub version: u64,
    pub scheduled_at: DateTime<Utc>,
}

/// Due runs picked for one tick.
#[derive(Debug, Clone, Default)]
pub struct DueSelection {
    /// Runs of active journeys, oldest first, at most `limit` of them.
    pub runs: Vec<DueRun>,
    /// Due runs left in place because their journey is not active.
    pub parked: usize,
}

#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The caller now owns the run; the returned copy carries the claim version.
    Claimed(Run),
    /// Someone else moved the run since it was selected.
    Conflict,
    /// The run is no longer due or no longer schedulable.
    NotEligible,
    NotFound,
}

#[derive(Debug, Clone)]
pub enum CommitOutcome {
    Committed(Run),
    /// A cancellation arrived mid-flight; the run was cancelled instead.
    Cancelled(Run),
}

#[derive(Debug, Clone)]
pub enum CancelOutcome {
    Cancelled(Run),
    /// The run is being processed; it is cancelled at the worker's commit.
    Deferred,
    AlreadyTerminal(RunStatus),
}

/// Persistence seam for runs. Implementations must make `try_claim`,
/// `commit`, `request_cancel` and `sweep_stale` atomic per run.
pub trait RunRepository: Send + Sync {
    /// Stores a new run unless the contact already has a live run on the
    /// same journey, in which case the existing run id is returned.
    fn insert(&self, run: Run) -> Result<Uuid, Uuid>;

    fn get(&self, run_id: Uuid) -> Option<Run>;

    fn list_for_journey(&self, journey_id: Uuid) -> Vec<Run>;

    fn live_run_for(&self, journey_id: Uuid, contact_id: &str) -> Option<Uuid>;

    /// Schedulable runs with `scheduled_at <= now` whose journey passes
    /// `journey_active`, oldest first. The filter applies before `limit`.
    fn due_runs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        journey_active: &dyn Fn(Uuid) -> bool,
    ) -> DueSelection;

    fn try_claim(&self, run_id: Uuid, expected_version: u64, now: DateTime<Utc>) -> ClaimOutcome;

    /// Writes back a claimed run. `run.version` must still equal the claim
    /// version stored in the repository.
    fn commit(&self, run: Run, now: DateTime<Utc>) -> JourneyResult<CommitOutcome>;

    fn request_cancel(&self, run_id: Uuid, now: DateTime<Utc>) -> JourneyResult<CancelOutcome>;

    /// Releases claims older than `timeout`, making those runs due again.
    fn sweep_stale(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<Run>;
}

/// DashMap-backed repository. Shard locks give per-run atomicity.
#[derive(Default)]
pub struct InMemoryRunRepository {
    runs: DashMap<Uuid, Run>,
    /// (journey, contact) -> run id of the contact's live run.
    live: DashMap<(Uuid, ContactId), Uuid>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Drops the live-index entry once a run is terminal. Must be called
    /// without holding a `runs` shard guard.
    fn release_live(&self, run: &Run) {
        let key = (run.journey_id, run.contact_id.clone());
        self.live.remove_if(&key, |_, id| *id == run.id);
    }

    fn finish_cancelled(run: &mut Run, now: DateTime<Utc>) {
        run.status = RunStatus::Cancelled;
        run.scheduled_at = None;
        run.claimed_at = None;
        run.cancel_requested = false;
        run.version += 1;
        run.updated_at = now;
        run.history.push(HistoryEntry {
            node_id: run.current_node_id.clone(),
            entered_at: now,
            outcome: Outcome::Cancelled,
        });
    }
}

impl RunRepository for InMemoryRunRepository {
    fn insert(&self, run: Run) -> Result<Uuid, Uuid> {
        let run_id = run.id;
        match self.live.entry((run.journey_id, run.contact_id.clone())) {
            Entry::Occupied(mut existing) => {
                let existing_id = *existing.get();
                let still_live = self
                    .runs
                    .get(&existing_id)
                    .map_or(false, |r| !r.status.is_terminal());
                if still_live {
                    return Err(existing_id);
                }
                self.runs.insert(run_id, run);
                existing.insert(run_id);
            }
            Entry::Vacant(slot) => {
                self.runs.insert(run_id, run);
                slot.insert(run_id);
            }
        }
        Ok(run_id)
    }

    fn get(&self, run_id: Uuid) -> Option<Run> {
        self.runs.get(&run_id).map(|r| r.clone())
    }

    fn list_for_journey(&self, journey_id: Uuid) -> Vec<Run> {
        let mut runs: Vec<Run> = self
            .runs
            .iter()
            .filter(|r| r.journey_id == journey_id)
            .map(|r| r.value().clone())
            .collect();
        runs.sort_by_key(|r| r.entered_at);
        runs
    }

    fn live_run_for(&self, journey_id: Uuid, contact_id: &str) -> Option<Uuid> {
        let id = *self.live.get(&(journey_id, contact_id.to_string()))?;
        self.runs
            .get(&id)
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.id)
    }

    fn due_runs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        journey_active: &dyn Fn(Uuid) -> bool,
    ) -> DueSelection {
        let mut selection = DueSelection::default();
        for r in self.runs.iter().filter(|r| r.is_due(now)) {
            let Some(scheduled_at) = r.scheduled_at else {
                continue;
            };
            if !journey_active(r.journey_id) {
                selection.parked += 1;
                continue;
            }
            selection.runs.push(DueRun {
                run_id: r.id,
                journey_id: r.journey_id,
                version: r.version,
                scheduled_at,
            });
        }
        selection.runs.sort_by_key(|d| d.scheduled_at);
        selection.runs.truncate(limit);
        selection
    }

    fn try_claim(&self, run_id: Uuid, expected_version: u64, now: DateTime<Utc>) -> ClaimOutcome {
        let Some(mut run) = self.runs.get_mut(&run_id) else {
            return ClaimOutcome::NotFound;
        };

        if run.version != expected_version {
            debug!(run_id = %run_id, expected_version, found = run.version, "Claim lost");
            return ClaimOutcome::Conflict;
        }
        if !run.is_due(now) || !RunStateMachine::can_transition(run.status, RunStatus::Processing) {
            return ClaimOutcome::NotEligible;
        }

        run.status = RunStatus::Processing;
        run.version += 1;
        run.claimed_at = Some(now);
        run.updated_at = now;
        ClaimOutcome::Claimed(run.clone())
    }

    fn commit(&self, run: Run, now: DateTime<Utc>) -> JourneyResult<CommitOutcome> {
        let outcome = {
            let mut stored = self
                .runs
                .get_mut(&run.id)
                .ok_or(JourneyError::RunNotFound(run.id))?;

            if stored.version != run.version || stored.status != RunStatus::Processing {
                return Err(JourneyError::ConcurrencyConflict {
                    id: run.id,
                    expected: run.version,
                    found: stored.version,
                });
            }

            if stored.cancel_requested {
                // Keep the audit trail of what the worker already did.
                stored.history = run.history;
                Self::finish_cancelled(&mut stored, now);
                info!(run_id = %stored.id, "Deferred cancellation applied at commit");
                CommitOutcome::Cancelled(stored.clone())
            } else {
                let Some(trigger) = RunStateMachine::trigger(stored.status, run.status) else {
                    return Err(JourneyError::InvalidRunTransition {
                        id: run.id,
                        from: stored.status,
                        to: run.status,
                    });
                };
                debug!(
                    run_id = %run.id,
                    trigger,
                    node_id = %run.current_node_id,
                    "Run committed"
                );
                let mut next = run;
                next.version = stored.version + 1;
                next.claimed_at = None;
                next.cancel_requested = false;
                next.updated_at = now;
                *stored = next;
                CommitOutcome::Committed(stored.clone())
            }
        };

        let committed = match &outcome {
            CommitOutcome::Committed(r) | CommitOutcome::Cancelled(r) => r,
        };
        if committed.status.is_terminal() {
            self.release_live(committed);
        }
        Ok(outcome)
    }

    fn request_cancel(&self, run_id: Uuid, now: DateTime<Utc>) -> JourneyResult<CancelOutcome> {
        let outcome = {
            let mut run = self
                .runs
                .get_mut(&run_id)
                .ok_or(JourneyError::RunNotFound(run_id))?;

            match run.status {
                RunStatus::Processing => {
                    // The claim version stays put so the worker's commit still
                    // lands and sees the flag.
                    run.cancel_requested = true;
                    CancelOutcome::Deferred
                }
                status if status.is_terminal() => CancelOutcome::AlreadyTerminal(status),
                _ => {
                    Self::finish_cancelled(&mut run, now);
                    CancelOutcome::Cancelled(run.clone())
                }
            }
        };

        if let CancelOutcome::Cancelled(run) = &outcome {
            self.release_live(run);
        }
        Ok(outcome)
    }

    fn sweep_stale(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<Run> {
        let mut swept = Vec::new();
        for mut run in self.runs.iter_mut() {
            if run.status != RunStatus::Processing {
                continue;
            }
            let expired = run.claimed_at.map_or(true, |at| at + timeout <= now);
            if !expired {
                continue;
            }

            warn!(
                run_id = %run.id,
                claimed_at = ?run.claimed_at,
                node_id = %run.current_node_id,
                "Reclaiming stale run"
            );
            if run.cancel_requested {
                Self::finish_cancelled(&mut run, now);
            } else {
                run.status = RunStatus::Active;
                run.claimed_at = None;
                run.version += 1;
                run.updated_at = now;
                if run.scheduled_at.map_or(true, |at| at > now) {
                    run.scheduled_at = Some(now);
                }
            }
            swept.push(run.clone());
        }

        for run in swept.iter().filter(|r| r.status.is_terminal()) {
            self.release_live(run);
        }
        swept
    }
}
