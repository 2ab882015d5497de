//! Job event types and their wire envelope.
//!
//! Every event crosses process boundaries as an [`EventEnvelope`]
//! (`{type, job_id, data, timestamp}`). Inside the process it is a
//! [`JobEvent`] whose payload is a tagged union; envelopes with an unknown
//! `type` are carried as [`EventPayload::Raw`] and forwarded verbatim.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::JobStatus;
use crate::types::{JobId, Timestamp};

/// A single output line.
pub const EVENT_TYPE_LOG: &str = "log";

/// Any subset of the job's status fields changed.
pub const EVENT_TYPE_STATUS: &str = "status";

/// Out-of-band failure notice.
pub const EVENT_TYPE_ERROR: &str = "error";

/// Sent by the gateway right after a client connects.
pub const MSG_TYPE_CONNECTED: &str = "connected";

/// Client heartbeat token.
pub const MSG_TYPE_PING: &str = "ping";

/// Gateway heartbeat acknowledgement.
pub const MSG_TYPE_PONG: &str = "pong";

/// Pub/sub channel prefix; one channel per job.
pub const EVENT_CHANNEL_PREFIX: &str = "events:";

/// Pattern covering every job's event channel.
pub const EVENT_CHANNEL_PATTERN: &str = "events:*";

/// Channel name for a job's events.
pub fn event_channel(job_id: &str) -> String {
    format!("{EVENT_CHANNEL_PREFIX}{job_id}")
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub message: String,
}

/// Status fields written by one update. Absent fields are omitted on the
/// wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl StatusEvent {
    pub fn is_empty(&self) -> bool {
        *self == StatusEvent::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub error_message: String,
    #[serde(default)]
    pub error_code: Option<String>,
}

/// Event payload, one variant per event type.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Log(LogEvent),
    Status(StatusEvent),
    Error(ErrorEvent),
    /// An event type this build does not know about, kept as-is.
    Raw { event_type: String, data: Value },
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// On-the-wire representation of a job event.
///
/// `timestamp` stays a string so envelopes from other producers are
/// forwarded without reformatting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub job_id: JobId,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// A job event as handled inside a process.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub job_id: JobId,
    pub timestamp: String,
    pub payload: EventPayload,
}

impl JobEvent {
    fn now(job_id: impl Into<JobId>, payload: EventPayload) -> Self {
        Self {
            job_id: job_id.into(),
            timestamp: Utc::now().to_rfc3339(),
            payload,
        }
    }

    pub fn log(job_id: impl Into<JobId>, message: impl Into<String>) -> Self {
        Self::now(
            job_id,
            EventPayload::Log(LogEvent {
                message: message.into(),
            }),
        )
    }

    pub fn status(job_id: impl Into<JobId>, status: StatusEvent) -> Self {
        Self::now(job_id, EventPayload::Status(status))
    }

    pub fn error(
        job_id: impl Into<JobId>,
        error_message: impl Into<String>,
        error_code: Option<String>,
    ) -> Self {
        Self::now(
            job_id,
            EventPayload::Error(ErrorEvent {
                error_message: error_message.into(),
                error_code,
            }),
        )
    }

    /// The envelope `type` string.
    pub fn event_type(&self) -> &str {
        match &self.payload {
            EventPayload::Log(_) => EVENT_TYPE_LOG,
            EventPayload::Status(_) => EVENT_TYPE_STATUS,
            EventPayload::Error(_) => EVENT_TYPE_ERROR,
            EventPayload::Raw { event_type, .. } => event_type,
        }
    }

    /// Convert an envelope into a typed event.
    ///
    /// A known type whose `data` does not fit its schema is kept as
    /// [`EventPayload::Raw`] rather than rejected.
    pub fn from_envelope(envelope: EventEnvelope) -> Self {
        let payload = match envelope.event_type.as_str() {
            EVENT_TYPE_LOG => serde_json::from_value(envelope.data.clone())
                .map(EventPayload::Log)
                .ok(),
            EVENT_TYPE_STATUS => serde_json::from_value(envelope.data.clone())
                .map(EventPayload::Status)
                .ok(),
            EVENT_TYPE_ERROR => serde_json::from_value(envelope.data.clone())
                .map(EventPayload::Error)
                .ok(),
            _ => None,
        };

        let payload = payload.unwrap_or(EventPayload::Raw {
            event_type: envelope.event_type,
            data: envelope.data,
        });

        Self {
            job_id: envelope.job_id,
            timestamp: envelope.timestamp,
            payload,
        }
    }

    pub fn to_envelope(&self) -> Result<EventEnvelope, serde_json::Error> {
        let data = match &self.payload {
            EventPayload::Log(log) => serde_json::to_value(log)?,
            EventPayload::Status(status) => serde_json::to_value(status)?,
            EventPayload::Error(error) => serde_json::to_value(error)?,
            EventPayload::Raw { data, .. } => data.clone(),
        };

        Ok(EventEnvelope {
            event_type: self.event_type().to_string(),
            job_id: self.job_id.clone(),
            data,
            timestamp: self.timestamp.clone(),
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_envelope()?)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let envelope: EventEnvelope = serde_json::from_str(raw)?;
        Ok(Self::from_envelope(envelope))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
