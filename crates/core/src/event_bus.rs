//! Engine event bus — trait for emitting lifecycle notifications from any module.
//!
//! Components accept an `Arc<dyn EventSink>` so campaign transitions, dispatches
//! and enrollment progress can be routed to an audit trail or message bus.

use crate::types::{EngineEvent, EngineEventType, StoreId};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// No-op sink for components that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// Sink that forwards every event to `tracing` at debug level.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: EngineEvent) {
        tracing::debug!(
            event_type = ?event.event_type,
            store_id = %event.store_id,
            subject_id = %event.subject_id,
            detail = event.detail.as_deref().unwrap_or(""),
            "engine event"
        );
    }
}

/// In-memory sink that captures events for testing.
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

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: EngineEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience builder for creating an `EngineEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EngineEventType,
    store_id: StoreId,
    subject_id: impl ToString,
    detail: Option<String>,
) -> EngineEvent {
    EngineEvent {
        event_id: Uuid::new_v4(),
        event_type,
        store_id,
        subject_id: subject_id.to_string(),
        detail,
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
