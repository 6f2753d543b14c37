//! Engine event bus.
//!
//! The journey engine reports run transitions through an `Arc<dyn EventSink>`.
//! Hosts plug in whatever forwards them on (audit log, queue, webhook).

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::types::{ContactId, EngineEvent, EventType};

/// Receives engine events. Called inline on worker tasks, so `emit` must
/// not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Drops every event.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// Writes each event as a structured `tracing` record.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: EngineEvent) {
        info!(
            target: "donorflow::events",
            event_type = ?event.event_type,
            journey_id = %event.journey_id,
            run_id = ?event.run_id,
            contact_id = ?event.contact_id,
            detail = ?event.detail,
            "Engine event"
        );
    }
}

/// Keeps every event in memory, in emission order.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    /// Event types recorded for one run, oldest first.
    pub fn timeline(&self, run_id: Uuid) -> Vec<EventType> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.run_id == Some(run_id))
            .map(|e| e.event_type)
            .collect()
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().push(event);
    }
}

pub fn make_event(
    event_type: EventType,
    journey_id: Uuid,
    run_id: Option<Uuid>,
    contact_id: Option<ContactId>,
) -> EngineEvent {
    EngineEvent {
        event_id: Uuid::new_v4(),
        event_type,
        journey_id,
        run_id,
        contact_id,
        detail: None,
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
