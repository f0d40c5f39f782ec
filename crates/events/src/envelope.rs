use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use wms_core::{EventId, Payload};

/// Envelope for a warehouse event (shipment created, batch job finished, ...).
///
/// Notes:
/// - `event_type` names what happened (`shipment.created`).
/// - `source` names who emitted it (`fulfillment_controller`, `scheduler`).
/// - `occurred_at` is informational; it is never part of a deduplication key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<E = Payload> {
    event_id: EventId,
    event_type: String,
    source: String,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: E) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            source: source.into(),
            occurred_at: Utc::now(),
            payload,
        }
    }

    /// Override the event id (redeliveries keep the original id).
    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
