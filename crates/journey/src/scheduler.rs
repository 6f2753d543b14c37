//! Periodic driver that claims due runs and executes them on a bounded pool.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use donorflow_core::config::JourneyConfig;
use donorflow_core::event_bus::{make_event, EventSink};
use donorflow_core::types::EventType;

use crate::error::{JourneyError, JourneyResult};
use crate::executor::{NodeExecutor, NodeResult};
use crate::repository::{ClaimOutcome, CommitOutcome, RunRepository};
use crate::store::DefinitionStore;
use crate::types::{Outcome, Run, RunStatus};

/// Counters for one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub swept: usize,
    pub candidates: usize,
    /// Due runs left alone because their journey is not active.
    pub parked: usize,
    pub claimed: usize,
    pub conflicts: usize,
    /// Node executions committed, including inline follow-ups.
    pub steps: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub panicked: usize,
}

/// How a worker left the run it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerExit {
    Parked { steps: usize },
    Finished { steps: usize, status: RunStatus },
    Cancelled { steps: usize },
    Lost { steps: usize },
}

/// The caller's `now` moved forward by the wall time spent in the tick, so
/// claims and commits made late in a long tick carry late timestamps.
#[derive(Debug, Clone, Copy)]
struct TickClock {
    base: DateTime<Utc>,
    started: Instant,
}

impl TickClock {
    fn start(base: DateTime<Utc>) -> Self {
        Self {
            base,
            started: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.started.elapsed())
            .ok()
            .and_then(|elapsed| self.base.checked_add_signed(elapsed))
            .unwrap_or(self.base)
    }
}

#[derive(Clone)]
pub struct JourneyScheduler {
    store: Arc<DefinitionStore>,
    runs: Arc<dyn RunRepository>,
    executor: Arc<NodeExecutor>,
    event_sink: Arc<dyn EventSink>,
    config: JourneyConfig,
}

impl JourneyScheduler {
    pub fn new(
        store: Arc<DefinitionStore>,
        runs: Arc<dyn RunRepository>,
        executor: Arc<NodeExecutor>,
        event_sink: Arc<dyn EventSink>,
        config: JourneyConfig,
    ) -> Self {
        Self {
            store,
            runs,
            executor,
            event_sink,
            config,
        }
    }

    /// Ticks on the configured interval until `shutdown` flips to `true` or
    /// its sender is dropped. A tick in progress always runs to completion.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_interval_secs = self.config.tick_interval_secs,
            workers = self.config.worker_pool_size,
            "Journey scheduler started"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick(Utc::now()).await;
                    if report.candidates > 0 || report.swept > 0 {
                        info!(?report, "Scheduler tick finished");
                    } else {
                        debug!("Scheduler tick found no due runs");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Journey scheduler stopped");
    }

    /// One pass: sweep stale claims, claim due runs of active journeys and
    /// execute them with at most `worker_pool_size` in flight.
    ///
    /// `now` selects what is due. Claims and commits are stamped with `now`
    /// plus the time the tick has been running.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let clock = TickClock::start(now);
        let mut report = TickReport::default();

        report.swept = self.sweep_stale(now);

        let store = &self.store;
        let selection = self.runs.due_runs(now, self.config.max_runs_per_tick, &|journey_id| {
            store.is_active(journey_id)
        });
        report.parked = selection.parked;
        report.candidates = selection.runs.len() + selection.parked;
        metrics::gauge!("journey.tick_candidates").set(report.candidates as f64);
        let candidates = selection.runs;

        let semaphore = Arc::new(Semaphore::new(self.config.worker_pool_size.max(1)));
        let mut workers: JoinSet<WorkerExit> = JoinSet::new();

        for candidate in candidates {
            if !self.store.is_active(candidate.journey_id) {
                report.parked += 1;
                continue;
            }

            // Hold a permit before claiming so a claimed run never waits for a worker.
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            match self.runs.try_claim(candidate.run_id, candidate.version, clock.now()) {
                ClaimOutcome::Claimed(run) => {
                    report.claimed += 1;
                    metrics::counter!("journey.runs_claimed").increment(1);
                    let worker = self.clone();
                    workers.spawn(async move {
                        let _permit = permit;
                        worker.process(run, clock).await
                    });
                }
                ClaimOutcome::Conflict | ClaimOutcome::NotEligible => {
                    report.conflicts += 1;
                    metrics::counter!("journey.claim_conflicts").increment(1);
                    debug!(run_id = %candidate.run_id, "Run claimed elsewhere, skipping");
                }
                ClaimOutcome::NotFound => {}
            }
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(exit) => Self::tally(&mut report, exit),
                Err(join_err) => {
                    // The run stays in processing until the stale sweep frees it.
                    report.panicked += 1;
                    error!(error = %join_err, "Journey worker panicked");
                }
            }
        }

        report
    }

    fn tally(report: &mut TickReport, exit: WorkerExit) {
        match exit {
            WorkerExit::Parked { steps } | WorkerExit::Lost { steps } => report.steps += steps,
            WorkerExit::Cancelled { steps } => {
                report.steps += steps;
                report.cancelled += 1;
            }
            WorkerExit::Finished { steps, status } => {
                report.steps += steps;
                match status {
                    RunStatus::Completed => report.completed += 1,
                    RunStatus::Failed => report.failed += 1,
                    RunStatus::Cancelled => report.cancelled += 1,
                    _ => {}
                }
            }
        }
    }

    fn sweep_stale(&self, now: DateTime<Utc>) -> usize {
        let swept = self
            .runs
            .sweep_stale(now, self.config.stale_claim_timeout());
        for run in &swept {
            metrics::counter!("journey.stale_claims_swept").increment(1);
            let mut event = make_event(
                EventType::StaleClaimSwept,
                run.journey_id,
                Some(run.id),
                Some(run.contact_id.clone()),
            );
            event.detail = Some(run.current_node_id.clone());
            self.event_sink.emit(event);
        }
        swept.len()
    }

    /// Executes a claimed run, chaining zero-delay steps under fresh claims
    /// up to `max_inline_steps`.
    async fn process(&self, mut run: Run, clock: TickClock) -> WorkerExit {
        let mut steps = 0;

        loop {
            let result = match self.execute_step(&run, clock.now()).await {
                Ok(result) => result,
                Err(err) => {
                    error!(run_id = %run.id, error = %err, "Node execution failed");
                    NodeResult::failed(err.to_string())
                }
            };

            let executed_node = run.current_node_id.clone();
            let mut next = run.clone();
            let finished_at = clock.now();
            result.apply_to(&mut next, finished_at);

            let committed = match self.runs.commit(next, finished_at) {
                Ok(CommitOutcome::Committed(committed)) => committed,
                Ok(CommitOutcome::Cancelled(cancelled)) => {
                    self.emit_terminal(&cancelled);
                    return WorkerExit::Cancelled { steps: steps + 1 };
                }
                Err(JourneyError::ConcurrencyConflict { .. }) => {
                    warn!(run_id = %run.id, "Claim lost before commit, result discarded");
                    return WorkerExit::Lost { steps };
                }
                Err(err) => {
                    error!(run_id = %run.id, error = %err, "Failed to commit run");
                    return WorkerExit::Lost { steps };
                }
            };
            steps += 1;
            self.emit_step(&committed, &executed_node, &result.outcome);

            if committed.status.is_terminal() {
                self.emit_terminal(&committed);
                return WorkerExit::Finished {
                    steps,
                    status: committed.status,
                };
            }

            let reclaim_at = clock.now();
            let chain = committed.is_due(reclaim_at)
                && steps < self.config.max_inline_steps
                && self.store.is_active(committed.journey_id);
            if !chain {
                return WorkerExit::Parked { steps };
            }

            match self.runs.try_claim(committed.id, committed.version, reclaim_at) {
                ClaimOutcome::Claimed(reclaimed) => run = reclaimed,
                _ => return WorkerExit::Parked { steps },
            }
        }
    }

    async fn execute_step(&self, run: &Run, now: DateTime<Utc>) -> JourneyResult<NodeResult> {
        let journey = self
            .store
            .get(run.journey_id)
            .ok_or(JourneyError::JourneyNotFound(run.journey_id))?;
        let node = journey
            .node(&run.current_node_id)
            .ok_or_else(|| JourneyError::NodeNotFound {
                journey_id: journey.id,
                node_id: run.current_node_id.clone(),
            })?;
        self.executor.execute(run, &journey, node, now).await
    }

    fn emit_step(&self, run: &Run, node_id: &str, outcome: &Outcome) {
        let event_type = match outcome {
            Outcome::DispatchError { .. } => EventType::DispatchFailed,
            _ => EventType::NodeExecuted,
        };
        let mut event = make_event(
            event_type,
            run.journey_id,
            Some(run.id),
            Some(run.contact_id.clone()),
        );
        event.detail = Some(node_id.to_string());
        self.event_sink.emit(event);
    }

    fn emit_terminal(&self, run: &Run) {
        let event_type = match run.status {
            RunStatus::Completed => {
                metrics::counter!("journey.runs_completed").increment(1);
                info!(run_id = %run.id, journey_id = %run.journey_id, "Run completed");
                EventType::RunCompleted
            }
            RunStatus::Failed => {
                metrics::counter!("journey.runs_failed").increment(1);
                error!(
                    run_id = %run.id,
                    journey_id = %run.journey_id,
                    node_id = %run.current_node_id,
                    "Run failed"
                );
                EventType::RunFailed
            }
            RunStatus::Cancelled => {
                info!(run_id = %run.id, journey_id = %run.journey_id, "Run cancelled");
                EventType::RunCancelled
            }
            _ => return,
        };
        self.event_sink.emit(make_event(
            event_type,
            run.journey_id,
            Some(run.id),
            Some(run.contact_id.clone()),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryContacts, InMemoryDonations, ScriptedChannelSender};
    use crate::enrollment::EnrollmentService;
    use crate::executor::RetryPolicy;
    use crate::repository::InMemoryRunRepository;
    use crate::types::{Edge, JourneyDefinition, Node};
    use chrono::Duration;
    use donorflow_core::event_bus::{capture_sink, CaptureSink};
    use donorflow_core::types::{Channel, ContactProfile};
    use uuid::Uuid;

    struct Fixture {
        scheduler: JourneyScheduler,
        store: Arc<DefinitionStore>,
        runs: Arc<InMemoryRunRepository>,
        enrollment: EnrollmentService,
        sender: Arc<ScriptedChannelSender>,
        sink: Arc<CaptureSink>,
    }

    fn fixture(config: JourneyConfig) -> Fixture {
        fixture_with_sender(config, ScriptedChannelSender::new())
    }

    fn fixture_with_sender(config: JourneyConfig, sender: ScriptedChannelSender) -> Fixture {
        let store = Arc::new(DefinitionStore::new());
        let runs = Arc::new(InMemoryRunRepository::new());
        let contacts = Arc::new(InMemoryContacts::new());
        contacts.add(ContactProfile::new("c-1", "Ada"));
        contacts.add(ContactProfile::new("c-2", "Grace"));
        let sender = Arc::new(sender);
        let sink = capture_sink();

        let enrollment =
            EnrollmentService::new(store.clone(), runs.clone(), contacts.clone(), sink.clone());
        let executor = Arc::new(NodeExecutor::new(
            sender.clone(),
            Arc::new(InMemoryDonations::new()),
            contacts,
            enrollment.clone(),
            RetryPolicy::from_config(&config),
        ));
        let scheduler =
            JourneyScheduler::new(store.clone(), runs.clone(), executor, sink.clone(), config);

        Fixture {
            scheduler,
            store,
            runs,
            enrollment,
            sender,
            sink,
        }
    }

    /// entry -> thanks -> receipt, no delays.
    fn instant_journey(store: &DefinitionStore) -> Uuid {
        let journey = JourneyDefinition::new(
            "Thank you",
            "org-1",
            vec![
                Node::entry("entry"),
                Node::message("thanks", Channel::Email, "Thank you {{name}}"),
                Node::message("receipt", Channel::Email, "Your receipt"),
            ],
            vec![Edge::new("entry", "thanks"), Edge::new("thanks", "receipt")],
        );
        let id = store.create(journey).unwrap();
        store.activate(id).unwrap();
        id
    }

    async fn enroll_one(fx: &Fixture, journey_id: Uuid, now: DateTime<Utc>) -> Uuid {
        enroll_contact(fx, journey_id, "c-1", now).await
    }

    async fn enroll_contact(
        fx: &Fixture,
        journey_id: Uuid,
        contact_id: &str,
        now: DateTime<Utc>,
    ) -> Uuid {
        let report = fx
            .enrollment
            .enroll_at(journey_id, &[contact_id.to_string()], now)
            .await;
        report.created[0]
    }

    #[tokio::test]
    async fn test_zero_delay_steps_chain_within_one_tick() {
        let fx = fixture(JourneyConfig::default());
        let journey_id = instant_journey(&fx.store);
        let now = Utc::now();
        let run_id = enroll_one(&fx, journey_id, now).await;

        let report = fx.scheduler.tick(now).await;
        assert_eq!(report.claimed, 1);
        assert_eq!(report.steps, 3);
        assert_eq!(report.completed, 1);

        let run = fx.runs.get(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.history.len(), 4);
        assert_eq!(fx.sender.sent_to("c-1").len(), 2);
        assert_eq!(fx.sink.count_type(EventType::RunCompleted), 1);
        assert_eq!(fx.sink.count_type(EventType::NodeExecuted), 3);
    }

    #[tokio::test]
    async fn test_inline_chaining_is_bounded() {
        let fx = fixture(JourneyConfig {
            max_inline_steps: 1,
            ..JourneyConfig::default()
        });
        let journey_id = instant_journey(&fx.store);
        let now = Utc::now();
        let run_id = enroll_one(&fx, journey_id, now).await;

        let report = fx.scheduler.tick(now).await;
        assert_eq!(report.steps, 1);
        let run = fx.runs.get(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Active);
        assert_eq!(run.current_node_id, "thanks");
        assert!(fx.sender.sent().is_empty());

        fx.scheduler.tick(now).await;
        assert_eq!(fx.runs.get(run_id).unwrap().current_node_id, "receipt");
    }

    #[tokio::test]
    async fn test_inactive_journey_runs_are_parked() {
        let fx = fixture(JourneyConfig::default());
        let journey_id = instant_journey(&fx.store);
        let now = Utc::now();
        let run_id = enroll_one(&fx, journey_id, now).await;
        fx.store.deactivate(journey_id).unwrap();

        let report = fx.scheduler.tick(now).await;
        assert_eq!(report.candidates, 1);
        assert_eq!(report.parked, 1);
        assert_eq!(report.claimed, 0);
        let run = fx.runs.get(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Active);
        assert!(run.history.is_empty());

        fx.store.activate(journey_id).unwrap();
        let report = fx.scheduler.tick(now).await;
        assert_eq!(report.completed, 1);
    }

    #[tokio::test]
    async fn test_paused_backlog_does_not_starve_active_journeys() {
        let fx = fixture(JourneyConfig {
            max_runs_per_tick: 1,
            ..JourneyConfig::default()
        });
        let paused = instant_journey(&fx.store);
        let live = instant_journey(&fx.store);
        let now = Utc::now();

        let backlog = enroll_contact(&fx, paused, "c-1", now - Duration::hours(1)).await;
        fx.store.deactivate(paused).unwrap();
        let run_id = enroll_contact(&fx, live, "c-2", now).await;

        for _ in 0..2 {
            let report = fx.scheduler.tick(now).await;
            assert_eq!(report.parked, 1);
        }

        assert_eq!(fx.runs.get(run_id).unwrap().status, RunStatus::Completed);
        assert_eq!(fx.sender.sent_to("c-2").len(), 2);
        let parked = fx.runs.get(backlog).unwrap();
        assert_eq!(parked.status, RunStatus::Active);
        assert!(parked.history.is_empty());
    }

    #[tokio::test]
    async fn test_runs_claimed_late_in_a_tick_carry_late_timestamps() {
        let fx = fixture_with_sender(
            JourneyConfig {
                worker_pool_size: 1,
                ..JourneyConfig::default()
            },
            ScriptedChannelSender::new().with_latency(std::time::Duration::from_millis(200)),
        );
        let journey_id = instant_journey(&fx.store);
        let now = Utc::now();
        let first = enroll_contact(&fx, journey_id, "c-1", now - Duration::seconds(1)).await;
        let second = enroll_contact(&fx, journey_id, "c-2", now).await;

        let report = fx.scheduler.tick(now).await;
        assert_eq!(report.completed, 2);

        let entered = |run_id: Uuid| fx.runs.get(run_id).unwrap().history[0].entered_at;
        // The second run waited for both of the first run's sends.
        assert!(entered(second) - now >= Duration::milliseconds(350));
        assert!(entered(second) > entered(first));

        let finished = fx.runs.get(second).unwrap();
        assert!(finished.updated_at > entered(second));
    }

    #[tokio::test]
    async fn test_stale_claim_is_swept_and_processed() {
        let fx = fixture(JourneyConfig::default());
        let journey_id = instant_journey(&fx.store);
        let start = Utc::now();
        let run_id = enroll_one(&fx, journey_id, start).await;

        // A worker claims the run and never comes back.
        let version = fx.runs.get(run_id).unwrap().version;
        assert!(matches!(
            fx.runs.try_claim(run_id, version, start),
            ClaimOutcome::Claimed(_)
        ));

        let early = fx.scheduler.tick(start + Duration::seconds(30)).await;
        assert_eq!(early.swept, 0);
        assert_eq!(early.candidates, 0);

        let later = start + Duration::seconds(601);
        let report = fx.scheduler.tick(later).await;
        assert_eq!(report.swept, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(fx.runs.get(run_id).unwrap().status, RunStatus::Completed);
        assert_eq!(
            fx.sink.timeline(run_id),
            vec![
                EventType::RunEnrolled,
                EventType::StaleClaimSwept,
                EventType::NodeExecuted,
                EventType::NodeExecuted,
                EventType::NodeExecuted,
                EventType::RunCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn test_scheduler_stops_on_shutdown() {
        let fx = fixture(JourneyConfig::default());
        let journey_id = instant_journey(&fx.store);
        let run_id = enroll_one(&fx, journey_id, Utc::now()).await;

        let (tx, rx) = watch::channel(false);
        let scheduler = fx.scheduler.clone();
        let handle = tokio::spawn(async move { scheduler.run(rx).await });

        // The first interval tick fires immediately.
        for _ in 0..50 {
            if fx.runs.get(run_id).unwrap().status == RunStatus::Completed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(fx.runs.get(run_id).unwrap().status, RunStatus::Completed);

        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
