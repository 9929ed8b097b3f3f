use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::JobId;

/// Event type carried on a job's stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Progress,
    Section,
    CacheHit,
    Complete,
    Error,
    Heartbeat,
}

impl EventKind {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Section => "section",
            Self::CacheHit => "cache-hit",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Parse a wire name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "progress" => Some(Self::Progress),
            "section" => Some(Self::Section),
            "cache-hit" => Some(Self::CacheHit),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            "heartbeat" => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Generation phase reported through `progress` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Initializing,
    Loading,
    Generating,
    Formatting,
    Caching,
    Completed,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Loading => "loading",
            Self::Generating => "generating",
            Self::Formatting => "formatting",
            Self::Caching => "caching",
            Self::Completed => "completed",
        }
    }
}

/// An event before the log assigns it a sequence
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub kind: EventKind,
    pub data: Value,
}

impl NewEvent {
    pub fn progress(phase: Phase, percent: Option<u8>) -> Self {
        let mut data = json!({ "phase": phase.name() });
        if let Some(percent) = percent {
            data["percent"] = json!(percent.min(100));
        }
        Self {
            kind: EventKind::Progress,
            data,
        }
    }

    pub fn section(index: usize, content: Value) -> Self {
        Self {
            kind: EventKind::Section,
            data: json!({ "index": index, "content": content }),
        }
    }

    pub fn cache_hit(result: Value, tier: &str, saved_ms: Option<u64>) -> Self {
        Self {
            kind: EventKind::CacheHit,
            data: json!({ "result": result, "tier": tier, "savedMs": saved_ms }),
        }
    }

    pub fn complete(result: Value) -> Self {
        Self {
            kind: EventKind::Complete,
            data: json!({ "result": result }),
        }
    }

    pub fn error(message: &str, retryable: bool, attempt: u32) -> Self {
        Self {
            kind: EventKind::Error,
            data: json!({ "message": message, "retryable": retryable, "attempt": attempt }),
        }
    }
}

/// A sequenced event in a job's stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub job_id: JobId,

    /// Monotonic, gap-free per job, starting at 1. Heartbeats carry the
    /// latest logged sequence instead of a new one.
    pub sequence: u64,

    #[serde(rename = "type")]
    pub kind: EventKind,

    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    pub fn new(job_id: JobId, sequence: u64, event: NewEvent) -> Self {
        Self {
            job_id,
            sequence,
            kind: event.kind,
            data: event.data,
            timestamp: Utc::now(),
        }
    }

    pub fn heartbeat(job_id: JobId, last_sequence: u64) -> Self {
        Self {
            job_id,
            sequence: last_sequence,
            kind: EventKind::Heartbeat,
            data: Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Whether the stream closes after this event
    pub fn is_terminal(&self) -> bool {
        match self.kind {
            EventKind::Complete | EventKind::CacheHit => true,
            EventKind::Error => !self.data["retryable"].as_bool().unwrap_or(false),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in [
            EventKind::Progress,
            EventKind::Section,
            EventKind::CacheHit,
            EventKind::Complete,
            EventKind::Error,
            EventKind::Heartbeat,
        ] {
            assert_eq!(EventKind::from_name(kind.name()), Some(kind));
            assert_eq!(serde_json::to_value(kind).unwrap(), kind.name());
        }
    }

    #[test]
    fn test_retryable_error_keeps_stream_open() {
        let job = JobId::from("j1");
        let retrying = StreamEvent::new(job.clone(), 3, NewEvent::error("timeout", true, 1));
        let fatal = StreamEvent::new(job.clone(), 4, NewEvent::error("bad input", false, 2));
        assert!(!retrying.is_terminal());
        assert!(fatal.is_terminal());
        assert!(StreamEvent::new(job, 5, NewEvent::complete(json!("ok"))).is_terminal());
    }

    #[test]
    fn test_event_serializes_type_field() {
        let event = StreamEvent::new(JobId::from("j1"), 1, NewEvent::progress(Phase::Loading, Some(20)));
        let encoded = serde_json::to_value(&event).unwrap();
        assert_eq!(encoded["type"], "progress");
        assert_eq!(encoded["jobId"], "j1");
        assert_eq!(encoded["data"]["phase"], "loading");
    }
}
