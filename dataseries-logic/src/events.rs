use crate::types::VersionStamp;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeEventType {
    DataPointCreated,
    DataPointUpdated,
    DataPointDeleted,
    DataSeriesTruncated,
}

impl ChangeEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeEventType::DataPointCreated => "DATA_POINT_CREATED",
            ChangeEventType::DataPointUpdated => "DATA_POINT_UPDATED",
            ChangeEventType::DataPointDeleted => "DATA_POINT_DELETED",
            ChangeEventType::DataSeriesTruncated => "DATA_SERIES_TRUNCATED",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChangeEvent {
    pub tenant_id: Uuid,
    pub data_series_id: Uuid,
    pub event_type: ChangeEventType,
    pub payload: JsonValue,
    pub stamp: VersionStamp,
}

/// Fire-and-forget change notification. Retry/backoff lives with the
/// consumer-dispatch subsystem, not here.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ChangeEvent);
}

pub struct NullEventSink;

#[async_trait::async_trait]
impl EventSink for NullEventSink {
    async fn emit(&self, _event: ChangeEvent) {}
}

/// Buffers events in memory. Used by tests to assert on emitted changes.
#[derive(Default)]
pub struct RecordingEventSink {
    events: tokio::sync::Mutex<Vec<ChangeEvent>>,
}

impl RecordingEventSink {
    pub async fn take(&self) -> Vec<ChangeEvent> {
        std::mem::take(&mut *self.events.lock().await)
    }
}

#[async_trait::async_trait]
impl EventSink for RecordingEventSink {
    async fn emit(&self, event: ChangeEvent) {
        self.events.lock().await.push(event);
    }
}
