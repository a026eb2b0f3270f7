//! Inbound event representation and multi-frame assembly.

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::{ProtocolError, events};

/// An event received from the server.
///
/// `frames` and `event_id` are stripped from the parameter map at parse
/// time: `frames` drives payload assembly and `event_id` is session engine
/// bookkeeping; neither is part of the event's caller-visible parameters.
#[derive(Debug)]
pub struct Event {
    params: Map<String, Value>,
    payload: Vec<Bytes>,
    event_id: Option<i64>,
    frames_expected: usize,
}

impl Event {
    /// Parse a header frame.
    pub fn parse(header: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(header)?;
        let Value::Object(mut params) = value else {
            return Err(ProtocolError::HeaderNotObject);
        };
        if !params.get("event").is_some_and(Value::is_string) {
            return Err(ProtocolError::MissingEventName);
        }
        let frames_expected = match params.remove("frames") {
            None => 0,
            Some(v) => usize::try_from(v.as_u64().ok_or(ProtocolError::InvalidFrameCount)?)
                .map_err(|_| ProtocolError::InvalidFrameCount)?,
        };
        let event_id = params.remove("event_id").and_then(|v| v.as_i64());
        Ok(Event {
            params,
            payload: Vec::with_capacity(frames_expected),
            event_id,
            frames_expected,
        })
    }

    /// The event name (the `"event"` parameter).
    pub fn name(&self) -> &str {
        self.params.get("event").and_then(Value::as_str).unwrap_or("")
    }

    pub fn action_id(&self) -> Option<i64> {
        self.params.get("action_id").and_then(Value::as_i64)
    }

    pub fn event_id(&self) -> Option<i64> {
        self.event_id
    }

    /// Present on interim replies to a history load; its absence marks the
    /// final reply of the stream.
    pub fn history_length(&self) -> Option<i64> {
        self.params.get("history_length").and_then(Value::as_i64)
    }

    pub fn error_type(&self) -> Option<&str> {
        self.params.get("error_type").and_then(Value::as_str)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.params.get("session_id").and_then(Value::as_str)
    }

    pub fn session_host(&self) -> Option<&str> {
        self.params.get("session_host").and_then(Value::as_str)
    }

    pub fn is_error(&self) -> bool {
        self.name() == events::ERROR
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn payload(&self) -> &[Bytes] {
        &self.payload
    }

    /// Split into the caller-visible parts for dispatch.
    pub fn into_parts(self) -> (Map<String, Value>, Vec<Bytes>) {
        (self.params, self.payload)
    }

    fn push_payload(&mut self, frame: Bytes) {
        self.payload.push(frame);
    }

    fn is_complete(&self) -> bool {
        self.payload.len() >= self.frames_expected
    }
}

/// Reassembles events from the frame stream: one header frame, then the
/// declared number of payload frames.
#[derive(Debug, Default)]
pub struct EventAssembler {
    partial: Option<Event>,
}

impl EventAssembler {
    pub fn new() -> Self {
        EventAssembler::default()
    }

    /// Feed one frame; returns a completed event when the frame finishes
    /// one.  Empty frames between events are keep-alives and are swallowed.
    pub fn push_frame(&mut self, frame: Bytes) -> Result<Option<Event>, ProtocolError> {
        if let Some(mut event) = self.partial.take() {
            event.push_payload(frame);
            if event.is_complete() {
                return Ok(Some(event));
            }
            self.partial = Some(event);
            return Ok(None);
        }

        if frame.is_empty() {
            return Ok(None);
        }

        let event = Event::parse(&frame)?;
        if event.is_complete() {
            Ok(Some(event))
        } else {
            self.partial = Some(event);
            Ok(None)
        }
    }

    /// Whether a header has been consumed but its payload frames have not
    /// all arrived.  Checked on disconnect to report truncated events.
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Discard any partially-assembled event.
    pub fn reset(&mut self) {
        self.partial = None;
    }
}
