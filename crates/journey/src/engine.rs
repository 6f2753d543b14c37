use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use donorflow_core::config::JourneyConfig;
use donorflow_core::event_bus::{make_event, noop_sink, EventSink};
use donorflow_core::types::{ContactId, EventType};

use crate::collaborators::{ChannelSender, ContactDirectory, DonationRepository};
use crate::enrollment::EnrollmentService;
use crate::error::{JourneyError, JourneyResult};
use crate::executor::{NodeExecutor, RetryPolicy};
use crate::repository::{CancelOutcome, InMemoryRunRepository, RunRepository};
use crate::scheduler::{JourneyScheduler, TickReport};
use crate::store::DefinitionStore;
use crate::types::{EnrollmentReport, JourneyDefinition, JourneyStats, Run, RunStatus, RunSummary};

/// External services the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub channel_sender: Arc<dyn ChannelSender>,
    pub donations: Arc<dyn DonationRepository>,
    pub contacts: Arc<dyn ContactDirectory>,
    pub event_sink: Arc<dyn EventSink>,
    pub runs: Arc<dyn RunRepository>,
}

impl Collaborators {
    /// In-memory run storage and no event sink by default.
    pub fn new(
        channel_sender: Arc<dyn ChannelSender>,
        donations: Arc<dyn DonationRepository>,
        contacts: Arc<dyn ContactDirectory>,
    ) -> Self {
        Self {
            channel_sender,
            donations,
            contacts,
            event_sink: noop_sink(),
            runs: Arc::new(InMemoryRunRepository::new()),
        }
    }

    /// Attach an event sink for run lifecycle events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Use a different run store.
    pub fn with_run_repository(mut self, runs: Arc<dyn RunRepository>) -> Self {
        self.runs = runs;
        self
    }
}

/// Journey automation engine: definitions, enrollment, run read model and
/// the scheduler, behind one handle.
#[derive(Clone)]
pub struct JourneyEngine {
    store: Arc<DefinitionStore>,
    runs: Arc<dyn RunRepository>,
    enrollment: EnrollmentService,
    scheduler: JourneyScheduler,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for JourneyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JourneyEngine")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl JourneyEngine {
    pub fn new(config: JourneyConfig, collaborators: Collaborators) -> Self {
        let store = Arc::new(DefinitionStore::new());
        let Collaborators {
            channel_sender,
            donations,
            contacts,
            event_sink,
            runs,
        } = collaborators;

        let enrollment = EnrollmentService::new(
            store.clone(),
            runs.clone(),
            contacts.clone(),
            event_sink.clone(),
        );
        let executor = Arc::new(NodeExecutor::new(
            channel_sender,
            donations,
            contacts,
            enrollment.clone(),
            RetryPolicy::from_config(&config),
        ));
        let scheduler = JourneyScheduler::new(
            store.clone(),
            runs.clone(),
            executor,
            event_sink.clone(),
            config,
        );

        Self {
            store,
            runs,
            enrollment,
            scheduler,
            event_sink,
        }
    }

    // ── Definitions ────────────────────────────────────────────────────

    /// Stores a journey as a draft and returns its id.
    pub fn create_journey(&self, definition: JourneyDefinition) -> JourneyResult<Uuid> {
        self.store.create(definition)
    }

    /// Replaces the graph of a draft or inactive journey.
    pub fn update_journey(&self, definition: JourneyDefinition) -> JourneyResult<()> {
        self.store.update(definition)
    }

    pub fn get_journey(&self, id: Uuid) -> Option<JourneyDefinition> {
        self.store.get(id)
    }

    pub fn list_journeys(&self) -> Vec<JourneyDefinition> {
        self.store.list()
    }

    pub fn activate(&self, id: Uuid) -> JourneyResult<()> {
        self.store.activate(id)?;
        self.event_sink
            .emit(make_event(EventType::JourneyActivated, id, None, None));
        Ok(())
    }

    /// Stops scheduling for the journey. Parked runs resume on reactivation.
    pub fn deactivate(&self, id: Uuid) -> JourneyResult<()> {
        self.store.deactivate(id)?;
        self.event_sink
            .emit(make_event(EventType::JourneyDeactivated, id, None, None));
        Ok(())
    }

    // ── Runs ───────────────────────────────────────────────────────────

    pub async fn enroll(&self, journey_id: Uuid, contact_ids: &[ContactId]) -> EnrollmentReport {
        self.enrollment.enroll(journey_id, contact_ids).await
    }

    pub fn get_runs(&self, journey_id: Uuid) -> Vec<RunSummary> {
        self.runs
            .list_for_journey(journey_id)
            .iter()
            .map(Run::summary)
            .collect()
    }

    /// Full run including history.
    pub fn get_run(&self, run_id: Uuid) -> Option<Run> {
        self.runs.get(run_id)
    }

    /// Cancels a run. A run mid-execution is cancelled when its worker
    /// commits; the returned status is then still `processing`.
    pub fn cancel_run(&self, run_id: Uuid) -> JourneyResult<RunStatus> {
        match self.runs.request_cancel(run_id, Utc::now())? {
            CancelOutcome::Cancelled(run) => {
                info!(run_id = %run_id, "Run cancelled");
                self.event_sink.emit(make_event(
                    EventType::RunCancelled,
                    run.journey_id,
                    Some(run.id),
                    Some(run.contact_id.clone()),
                ));
                Ok(RunStatus::Cancelled)
            }
            CancelOutcome::Deferred => {
                info!(run_id = %run_id, "Run is processing, cancellation deferred");
                Ok(RunStatus::Processing)
            }
            CancelOutcome::AlreadyTerminal(status) => Err(JourneyError::InvalidRunTransition {
                id: run_id,
                from: status,
                to: RunStatus::Cancelled,
            }),
        }
    }

    pub fn stats(&self, journey_id: Uuid) -> JourneyStats {
        let mut stats = JourneyStats {
            journey_id,
            ..JourneyStats::default()
        };
        for run in self.runs.list_for_journey(journey_id) {
            stats.total_enrolled += 1;
            match run.status {
                RunStatus::Active => stats.active += 1,
                RunStatus::WaitingDelay => stats.waiting += 1,
                RunStatus::Processing => stats.processing += 1,
                RunStatus::Completed => stats.completed += 1,
                RunStatus::Cancelled => stats.cancelled += 1,
                RunStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    // ── Scheduling ─────────────────────────────────────────────────────

    /// Runs one scheduler pass as of `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        self.scheduler.tick(now).await
    }

    /// Spawns the periodic ticker onto the current runtime.
    pub fn spawn_scheduler(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    }
}
