//! Public session facade: configuration, callbacks, and the send surface.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use ninchat_api::{ParameterError, Schema, ValidateAction};
use ninchat_proto::{Action, DEFAULT_SESSION_HOST, SOCKET_PATH};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::engine::{Command, Engine, Outbound};
use crate::lock;
use crate::registry::{ReplyEntry, ReplyRegistry};

// ---------------------------------------------------------------------------
// Callback types
// ---------------------------------------------------------------------------

/// Invoked with the params of `session_created` (and of fatal `error`
/// events that end session establishment).
pub type SessionEventFn = Box<dyn FnMut(Map<String, Value>) + Send>;
/// Invoked with every other event's params, payload, and whether it was the
/// last reply to its action.
pub type EventFn = Box<dyn FnMut(Map<String, Value>, Vec<Bytes>, bool) + Send>;
/// Per-action reply callback; `None` params signal cancellation at close.
pub type ReplyFn = Box<dyn FnMut(Option<Map<String, Value>>, Vec<Bytes>, bool) + Send>;
/// Invoked once when a close initiated via [`Session::close`] completes.
pub type CloseFn = Box<dyn FnOnce() + Send>;
pub type ConnStateFn = Box<dyn FnMut(ConnState) + Send>;
pub type ConnActiveFn = Box<dyn FnMut() + Send>;
/// One-shot `open` callback; `None` when the session closes before a
/// server session could be established.
pub type ReadyFn = Box<dyn FnOnce(Option<Map<String, Value>>) + Send>;

/// Connection-level state, reported via the `on_conn_state` signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Disconnected => "disconnected",
        })
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initialized => "initialized",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        })
    }
}

/// Errors surfaced synchronously by [`Session::send`] and friends.
#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Parameter(#[from] ParameterError),
    #[error("\"action_id\" cannot be suppressed when a reply callback is supplied")]
    ActionIdSuppressed,
    #[error("transient action requires an established server session")]
    NoServerSession,
    #[error("session is closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub server_host: String,
    /// Total sends per action (first send included).
    pub retry_count: u32,
    pub retry_timeout: Duration,
    pub connect_backoff_floor: Duration,
    pub connect_backoff_cap: Duration,
    /// Consecutive connect failures before a server-supplied host is
    /// abandoned for the default.
    pub host_reset_failures: u32,
    /// Dial `ws://` instead of `wss://`; for tests against local servers.
    pub insecure_transport: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_host: DEFAULT_SESSION_HOST.to_owned(),
            retry_count: 3,
            retry_timeout: Duration::from_secs(15),
            connect_backoff_floor: Duration::from_millis(500),
            connect_backoff_cap: Duration::from_secs(10),
            host_reset_failures: 5,
            insecure_transport: false,
        }
    }
}

impl Config {
    pub fn socket_url(&self, host: &str) -> String {
        let scheme = if self.insecure_transport { "ws" } else { "wss" };
        format!("{scheme}://{host}{SOCKET_PATH}")
    }
}

#[derive(Default)]
pub(crate) struct Callbacks {
    pub on_session_event: Option<SessionEventFn>,
    pub on_event: Option<EventFn>,
    pub on_close: Option<CloseFn>,
    pub on_conn_state: Option<ConnStateFn>,
    pub on_conn_active: Option<ConnActiveFn>,
}

/// State shared between the facade and the engine task.
pub(crate) struct Shared {
    pub next_action_id: AtomicI64,
    pub session_id: Mutex<Option<String>>,
    pub create_params: Mutex<Map<String, Value>>,
    pub state: Mutex<SessionState>,
    pub close_requested: AtomicBool,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures and constructs a [`Session`].
pub struct SessionBuilder {
    config: Config,
    callbacks: Callbacks,
    validator: Arc<dyn ValidateAction>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        SessionBuilder {
            config: Config::default(),
            callbacks: Callbacks::default(),
            validator: Arc::new(Schema::builtin().clone()),
        }
    }
}

impl SessionBuilder {
    pub fn new() -> Self {
        SessionBuilder::default()
    }

    pub fn server_host(mut self, host: impl Into<String>) -> Self {
        self.config.server_host = host.into();
        self
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.config.retry_count = count;
        self
    }

    pub fn retry_timeout(mut self, timeout: Duration) -> Self {
        self.config.retry_timeout = timeout;
        self
    }

    /// Dial `ws://` instead of `wss://`.  For tests against local servers.
    pub fn insecure_transport(mut self) -> Self {
        self.config.insecure_transport = true;
        self
    }

    /// Replace the stock schema validator.
    pub fn validator(mut self, validator: Arc<dyn ValidateAction>) -> Self {
        self.validator = validator;
        self
    }

    pub fn on_session_event(
        mut self,
        f: impl FnMut(Map<String, Value>) + Send + 'static,
    ) -> Self {
        self.callbacks.on_session_event = Some(Box::new(f));
        self
    }

    pub fn on_event(
        mut self,
        f: impl FnMut(Map<String, Value>, Vec<Bytes>, bool) + Send + 'static,
    ) -> Self {
        self.callbacks.on_event = Some(Box::new(f));
        self
    }

    pub fn on_close(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.callbacks.on_close = Some(Box::new(f));
        self
    }

    pub fn on_conn_state(mut self, f: impl FnMut(ConnState) + Send + 'static) -> Self {
        self.callbacks.on_conn_state = Some(Box::new(f));
        self
    }

    pub fn on_conn_active(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.callbacks.on_conn_active = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Session {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Session {
            shared: Arc::new(Shared {
                next_action_id: AtomicI64::new(0),
                session_id: Mutex::new(None),
                create_params: Mutex::new(Map::new()),
                state: Mutex::new(SessionState::Uninitialized),
                close_requested: AtomicBool::new(false),
            }),
            registry: Arc::new(Mutex::new(ReplyRegistry::default())),
            cmd_tx,
            validator: self.validator,
            engine: Mutex::new(Some(EngineParts {
                cmd_rx,
                callbacks: self.callbacks,
                config: self.config,
            })),
        }
    }
}

struct EngineParts {
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    callbacks: Callbacks,
    config: Config,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A client session.  Outlives individual server sessions: the engine
/// reconnects and resumes (or recreates) the server session as needed.
pub struct Session {
    shared: Arc<Shared>,
    registry: Arc<Mutex<ReplyRegistry>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    validator: Arc<dyn ValidateAction>,
    engine: Mutex<Option<EngineParts>>,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Set or replace the params used for the next `create_session` action
    /// (credentials, message-type subscriptions, ...).  May be called
    /// before [`Session::open`] or between a failed create and its retry.
    pub fn set_params(&self, params: Map<String, Value>) {
        *lock(&self.shared.create_params) = params;
    }

    /// Start the engine.  Legal only once, in the uninitialized state; must
    /// be called inside a tokio runtime.
    pub fn open(&self) {
        self.start_engine(None);
    }

    /// Like [`Session::open`]; additionally invokes `on_ready` with the
    /// first `session_created` event's params, or with `None` if the
    /// session closes before a server session could be established.
    pub fn open_with(
        &self,
        on_ready: impl FnOnce(Option<Map<String, Value>>) + Send + 'static,
    ) {
        self.start_engine(Some(Box::new(on_ready)));
    }

    fn start_engine(&self, on_ready: Option<ReadyFn>) {
        let Some(parts) = lock(&self.engine).take() else {
            error!("session opened more than once");
            return;
        };
        *lock(&self.shared.state) = SessionState::Initialized;
        let engine = Engine::new(
            parts.config,
            parts.callbacks,
            on_ready,
            parts.cmd_rx,
            Arc::clone(&self.shared),
            Arc::clone(&self.registry),
        );
        tokio::spawn(engine.run());
    }

    /// Close the session.  Idempotent; a no-op before [`Session::open`].
    /// Completion is signalled via the `on_close` callback.
    pub fn close(&self) {
        match *lock(&self.shared.state) {
            SessionState::Uninitialized => {
                debug!("close before open ignored");
                return;
            }
            SessionState::Closed => return,
            _ => {}
        }
        if !self.shared.close_requested.swap(true, Ordering::SeqCst) {
            let _ = self.cmd_tx.send(Command::Close);
        }
    }

    /// Validate and enqueue a fire-and-forget or id-carrying action.
    ///
    /// An `action_id` is assigned when the caller passed an explicit
    /// integer id or the schema requires one; an explicit `"action_id":
    /// null` entry suppresses assignment.  Returns the assigned id, or 0
    /// for fire-and-forget actions.
    pub fn send(&self, params: Map<String, Value>, payload: Vec<Bytes>) -> Result<i64, SendError> {
        self.send_inner(params, payload, None, false)
    }

    /// Like [`Session::send`], and registers `on_reply` for the action's
    /// reply event(s).  The callback is invoked once per reply, with
    /// `last_reply` marking the final one; if the session closes first it
    /// is invoked once with `None` params.
    pub fn send_with_reply(
        &self,
        params: Map<String, Value>,
        payload: Vec<Bytes>,
        on_reply: impl FnMut(Option<Map<String, Value>>, Vec<Bytes>, bool) + Send + 'static,
    ) -> Result<i64, SendError> {
        self.send_inner(params, payload, Some(Box::new(on_reply)), false)
    }

    /// Send an action relevant only to the current server session; it is
    /// dropped rather than replayed if the server session is reset.
    pub fn send_transient(
        &self,
        params: Map<String, Value>,
        payload: Vec<Bytes>,
    ) -> Result<i64, SendError> {
        self.send_inner(params, payload, None, true)
    }

    pub fn send_transient_with_reply(
        &self,
        params: Map<String, Value>,
        payload: Vec<Bytes>,
        on_reply: impl FnMut(Option<Map<String, Value>>, Vec<Bytes>, bool) + Send + 'static,
    ) -> Result<i64, SendError> {
        self.send_inner(params, payload, Some(Box::new(on_reply)), true)
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    /// The server session id currently held, if any.
    pub fn server_session_id(&self) -> Option<String> {
        lock(&self.shared.session_id).clone()
    }

    fn send_inner(
        &self,
        mut params: Map<String, Value>,
        payload: Vec<Bytes>,
        on_reply: Option<ReplyFn>,
        transient: bool,
    ) -> Result<i64, SendError> {
        if *lock(&self.shared.state) == SessionState::Closed {
            return Err(SendError::Closed);
        }

        let suppressed = matches!(params.get("action_id"), Some(Value::Null));
        if suppressed {
            if on_reply.is_some() {
                return Err(SendError::ActionIdSuppressed);
            }
            params.remove("action_id");
        }

        let name = params
            .get("action")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or(ParameterError::MissingAction)?;

        let explicit = params.get("action_id").and_then(Value::as_i64);
        let action_id = if suppressed {
            None
        } else if let Some(id) = explicit {
            Some(id)
        } else if on_reply.is_some() || self.validator.requires_action_id(&name) {
            let id = self.shared.next_action_id.fetch_add(1, Ordering::SeqCst) + 1;
            params.insert("action_id".to_owned(), Value::from(id));
            Some(id)
        } else {
            None
        };

        self.validator.validate_action(&params, &payload)?;

        let transient_for = if transient {
            Some(
                lock(&self.shared.session_id)
                    .clone()
                    .ok_or(SendError::NoServerSession)?,
            )
        } else {
            None
        };

        let action = Action::new(params, payload);

        if let (Some(id), Some(callback)) = (action_id, on_reply) {
            lock(&self.registry).insert(
                id,
                ReplyEntry {
                    callback,
                    multi_reply: action.expects_multiple_replies(),
                    transient_for: transient_for.clone(),
                },
            );
        }

        if self
            .cmd_tx
            .send(Command::Action(Outbound { action, transient_for }))
            .is_err()
        {
            debug!(action = %name, "send after engine shutdown");
            if let Some(id) = action_id {
                let _ = lock(&self.registry).take(id);
            }
            return Err(SendError::Closed);
        }

        Ok(action_id.unwrap_or(0))
    }
}
