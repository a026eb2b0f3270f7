//! Outbound action representation.
//!
//! An action is a parameter map (always containing `"action"`) plus an
//! ordered list of payload frames.  The `frames` parameter mirrors the
//! payload length and is maintained here; callers never set it directly.

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::actions;

/// An action to be sent to the server.
///
/// Reusing an `Action` across sessions is supported: the acknowledgement
/// `event_id` is recomputed before every (re)send via [`Action::set_event_id`].
#[derive(Debug, Clone)]
pub struct Action {
    params: Map<String, Value>,
    payload: Vec<Bytes>,
}

impl Action {
    /// Build an action from a prepared parameter map (which must already
    /// contain the `"action"` name) and payload frames.
    ///
    /// Maintains the invariant that `frames` is present iff the payload is
    /// non-empty, in which case it equals the payload length.
    pub fn new(mut params: Map<String, Value>, payload: Vec<Bytes>) -> Self {
        if payload.is_empty() {
            params.remove("frames");
        } else {
            params.insert("frames".to_owned(), Value::from(payload.len() as u64));
        }
        Action { params, payload }
    }

    /// The `create_session` seed action.  `params` is the credential /
    /// subscription bundle configured by the caller.
    pub fn create_session(params: Map<String, Value>) -> Self {
        let mut params = params;
        params.insert(
            "action".to_owned(),
            Value::from(actions::CREATE_SESSION),
        );
        Action::new(params, Vec::new())
    }

    /// The `resume_session` seed action, carrying the session to continue
    /// and the highest event id already observed (if any).
    pub fn resume_session(session_id: &str, event_id: Option<i64>) -> Self {
        let mut params = Map::new();
        params.insert(
            "action".to_owned(),
            Value::from(actions::RESUME_SESSION),
        );
        params.insert("session_id".to_owned(), Value::from(session_id));
        if let Some(id) = event_id {
            params.insert("event_id".to_owned(), Value::from(id));
        }
        Action::new(params, Vec::new())
    }

    pub fn close_session() -> Self {
        let mut params = Map::new();
        params.insert(
            "action".to_owned(),
            Value::from(actions::CLOSE_SESSION),
        );
        Action::new(params, Vec::new())
    }

    /// The action name (the `"action"` parameter).
    pub fn name(&self) -> &str {
        self.params.get("action").and_then(Value::as_str).unwrap_or("")
    }

    pub fn action_id(&self) -> Option<i64> {
        self.params.get("action_id").and_then(Value::as_i64)
    }

    /// Attach (or detach) the acknowledgement event id.  Recomputed by the
    /// send loop before every transmission, so stale values from a previous
    /// server session never leak onto the wire.
    pub fn set_event_id(&mut self, event_id: Option<i64>) {
        match event_id {
            Some(id) => {
                self.params.insert("event_id".to_owned(), Value::from(id));
            }
            None => {
                self.params.remove("event_id");
            }
        }
    }

    /// Encode the header frame: compact JSON, no insignificant whitespace.
    pub fn header(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.params)
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn payload(&self) -> &[Bytes] {
        &self.payload
    }

    /// Whether replies to this action arrive as a stream terminated by a
    /// final event (history loads) rather than as a single event.
    pub fn expects_multiple_replies(&self) -> bool {
        self.name() == actions::LOAD_HISTORY
    }
}
