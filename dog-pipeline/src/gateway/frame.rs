use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{EventKind, JobId, StreamEvent, StreamTransportError};

/// Wire frame for one stream event (server-sent-events layout).
///
/// `event` is the event type, `id` the sequence and `data` a JSON body
/// `{type, data}`. Bodies written here also carry `sequence`; decoding falls
/// back to `id` when it is absent. An `error` frame without a body is the
/// transport's own failure signal, not a job error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    pub id: Option<u64>,
    pub data: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct FrameBody {
    #[serde(rename = "type")]
    kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sequence: Option<u64>,
    #[serde(default)]
    data: Value,
}

impl Frame {
    pub fn from_event(event: &StreamEvent) -> Result<Self, serde_json::Error> {
        let body = FrameBody {
            kind: event.kind,
            sequence: Some(event.sequence),
            data: event.data.clone(),
        };
        Ok(Self {
            event: event.kind.name().to_string(),
            id: Some(event.sequence),
            data: Some(serde_json::to_string(&body)?),
        })
    }

    /// Body-less error frame
    pub fn transport_error() -> Self {
        Self {
            event: EventKind::Error.name().to_string(),
            id: None,
            data: None,
        }
    }

    /// Whether this frame signals a broken transport
    pub fn is_transport_error(&self) -> bool {
        self.event == EventKind::Error.name() && self.data.as_deref().map_or(true, |d| d.trim().is_empty())
    }

    /// Decode into a stream event for `job_id`
    pub fn into_event(self, job_id: &JobId) -> Result<StreamEvent, StreamTransportError> {
        if self.is_transport_error() {
            return Err(StreamTransportError::Disconnected);
        }
        let raw = self
            .data
            .ok_or_else(|| StreamTransportError::Malformed(format!("{} frame without body", self.event)))?;
        let body: FrameBody =
            serde_json::from_str(&raw).map_err(|e| StreamTransportError::Malformed(e.to_string()))?;

        if body.kind.name() != self.event {
            return Err(StreamTransportError::Malformed(format!(
                "frame named {} carries a {} body",
                self.event, body.kind
            )));
        }

        let sequence = body.sequence.or(self.id).ok_or_else(|| {
            StreamTransportError::Malformed(format!("{} frame without sequence or id", self.event))
        })?;

        Ok(StreamEvent {
            job_id: job_id.clone(),
            sequence,
            kind: body.kind,
            data: body.data,
            timestamp: Utc::now(),
        })
    }

    /// Render as server-sent-events text
    pub fn encode(&self) -> String {
        let mut out = format!("event: {}\n", self.event);
        if let Some(id) = self.id {
            out.push_str(&format!("id: {}\n", id));
        }
        if let Some(data) = &self.data {
            for line in data.lines() {
                out.push_str(&format!("data: {}\n", line));
            }
        }
        out.push('\n');
        out
    }

    /// Parse one server-sent-events block
    pub fn decode(block: &str) -> Result<Self, StreamTransportError> {
        let mut event = None;
        let mut id = None;
        let mut data: Option<String> = None;

        for line in block.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = line.split_once(':').unwrap_or((line, ""));
            let value = value.strip_prefix(' ').unwrap_or(value);
            match field {
                "event" => event = Some(value.to_string()),
                "id" => {
                    id = Some(
                        value
                            .parse::<u64>()
                            .map_err(|_| StreamTransportError::Malformed(format!("bad id {:?}", value)))?,
                    )
                }
                "data" => match data.as_mut() {
                    Some(existing) => {
                        existing.push('\n');
                        existing.push_str(value);
                    }
                    None => data = Some(value.to_string()),
                },
                _ => {}
            }
        }

        Ok(Self {
            event: event.unwrap_or_else(|| "message".to_string()),
            id,
            data,
        })
    }
}
