//! Session engine: owns the transport, the send loop, and event dispatch.
//!
//! One cooperative tokio task plays both the sender and the receiver role.
//! The inner loop selects over the socket, the nearest pending-retry
//! deadline, and the outbound command queue, in that priority order, so
//! that due retries always go out ahead of newly queued actions.  The
//! pending set and event-id bookkeeping are confined to this task; the
//! reply registry is the only structure shared with the facade.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use ninchat_proto::{Action, Event, EventAssembler, error_types, events};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};

use crate::lock;
use crate::pending::{PendingAction, PendingSet};
use crate::registry::ReplyRegistry;
use crate::session::{Callbacks, Config, ConnState, ReadyFn, ReplyFn, SessionState, Shared};
use crate::transport::{self, SocketSink, SocketStream};

pub(crate) enum Command {
    Action(Outbound),
    Close,
}

pub(crate) struct Outbound {
    pub action: Action,
    pub transient_for: Option<String>,
}

/// Why the inner loop ended.
enum Drive {
    Reconnect,
    Terminate,
}

pub(crate) struct Engine {
    cfg: Config,
    callbacks: Callbacks,
    on_ready: Option<ReadyFn>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
    registry: Arc<Mutex<ReplyRegistry>>,

    pending: PendingSet,
    assembler: EventAssembler,
    session_id: Option<String>,
    session_host: String,
    last_received_event_id: Option<i64>,
    last_acked_event_id: Option<i64>,
    /// True from sending `create_session` until its outcome arrives;
    /// outbound actions are blocked meanwhile.
    awaiting_create: bool,
    /// Leave the inner loop and reconnect (set on session reset).
    reset: bool,
    closing: bool,
    /// A fire-and-forget action whose send failed mid-write; resent first
    /// on the next connection.
    carry: Option<Outbound>,
    conn_state: Option<ConnState>,
    connect_failures: u32,
}

impl Engine {
    pub(crate) fn new(
        cfg: Config,
        callbacks: Callbacks,
        on_ready: Option<ReadyFn>,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        shared: Arc<Shared>,
        registry: Arc<Mutex<ReplyRegistry>>,
    ) -> Self {
        let session_host = cfg.server_host.clone();
        Engine {
            cfg,
            callbacks,
            on_ready,
            cmd_rx,
            shared,
            registry,
            pending: PendingSet::new(),
            assembler: EventAssembler::new(),
            session_id: None,
            session_host,
            last_received_event_id: None,
            last_acked_event_id: None,
            awaiting_create: false,
            reset: false,
            closing: false,
            carry: None,
            conn_state: None,
            connect_failures: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            if self.closing {
                break;
            }

            self.set_state(SessionState::Connecting);
            let seed = if let Some(session_id) = self.session_id.clone() {
                // The resume itself acknowledges everything seen so far.
                self.last_acked_event_id = self.last_received_event_id;
                Action::resume_session(&session_id, self.last_received_event_id)
            } else {
                self.session_host = self.cfg.server_host.clone();
                self.last_received_event_id = None;
                self.last_acked_event_id = None;
                self.awaiting_create = true;
                Action::create_session(lock(&self.shared.create_params).clone())
            };

            let Some((mut sink, mut stream)) = self.establish(&seed).await else {
                break;
            };
            self.set_conn_state(ConnState::Connected);
            if !self.awaiting_create {
                self.set_state(SessionState::Connected);
            }

            // Replays go first, so the server observes action ids in order.
            if !self.pending.is_empty() {
                debug!(pending = self.pending.len(), "scheduling pending replays");
            }
            self.pending.make_all_due(Instant::now());

            let outcome = self.drive(&mut sink, &mut stream).await;
            let _ = sink.close().await;
            match outcome {
                Drive::Terminate => break,
                Drive::Reconnect => {
                    if self.awaiting_create {
                        // The connection died before the create outcome
                        // arrived; pace the next attempt.
                        self.awaiting_create = false;
                        tokio::time::sleep(self.cfg.connect_backoff_floor).await;
                    }
                }
            }
        }
        self.shutdown();
    }

    /// Connect and send the seed action, retrying with bounded backoff.
    /// Returns `None` when a close request arrives while disconnected.
    async fn establish(&mut self, seed: &Action) -> Option<(SocketSink, SocketStream)> {
        loop {
            if self.shared.close_requested.load(Ordering::SeqCst) {
                return None;
            }
            self.set_conn_state(ConnState::Connecting);
            let url = self.cfg.socket_url(&self.session_host);
            match transport::connect(&url).await {
                Ok(socket) => {
                    let (mut sink, stream) = socket.split();
                    match transport::send_action(&mut sink, seed).await {
                        Ok(()) => {
                            self.connect_failures = 0;
                            return Some((sink, stream));
                        }
                        Err(e) => {
                            warn!(error = %e, "seed action send failed");
                            let _ = sink.close().await;
                        }
                    }
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "websocket connect failed");
                }
            }
            self.connect_failures += 1;
            if self.connect_failures >= self.cfg.host_reset_failures
                && self.session_host != self.cfg.server_host
            {
                info!(host = %self.cfg.server_host, "reverting to the default host");
                self.session_host = self.cfg.server_host.clone();
            }
            let delay = backoff_delay(
                self.cfg.connect_backoff_floor,
                self.cfg.connect_backoff_cap,
                self.connect_failures,
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn drive(&mut self, sink: &mut SocketSink, stream: &mut SocketStream) -> Drive {
        if let Some(out) = self.carry.take() {
            if self.transmit(sink, out, 0).await.is_err() {
                return self.disconnected();
            }
        }

        loop {
            if self.reset {
                self.reset = false;
                return Drive::Reconnect;
            }

            let retry_at = if self.awaiting_create {
                None
            } else {
                self.pending.next_deadline()
            };
            let retry_sleep = retry_at.unwrap_or_else(Instant::now);

            tokio::select! {
                biased;

                msg = stream.next() => match msg {
                    None => return self.disconnected(),
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket receive failed");
                        return self.disconnected();
                    }
                    Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                        self.ingest(msg.into_data());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        self.signal_conn_active();
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => return self.disconnected(),
                    Some(Ok(_)) => {}
                },

                () = tokio::time::sleep_until(retry_sleep), if retry_at.is_some() => {
                    if let Some(entry) = self.pending.take_due(Instant::now()) {
                        let attempts = entry.attempts;
                        let out = Outbound {
                            action: entry.action,
                            transient_for: entry.transient_for,
                        };
                        debug!(
                            action = %out.action.name(),
                            action_id = ?out.action.action_id(),
                            attempts,
                            "resending unacknowledged action"
                        );
                        if self.transmit(sink, out, attempts).await.is_err() {
                            return self.disconnected();
                        }
                    }
                }

                cmd = self.cmd_rx.recv(), if !self.awaiting_create && !self.closing => {
                    match cmd {
                        None | Some(Command::Close) => {
                            self.closing = true;
                            self.set_state(SessionState::Closing);
                            let close = Outbound {
                                action: Action::close_session(),
                                transient_for: None,
                            };
                            if self.transmit(sink, close, 0).await.is_err() {
                                return Drive::Terminate;
                            }
                            // Keep reading until the server closes the
                            // transport.
                        }
                        Some(Command::Action(out)) => {
                            if self.transmit(sink, out, 0).await.is_err() {
                                return self.disconnected();
                            }
                        }
                    }
                }
            }
        }
    }

    /// Send one action, maintaining acknowledgement and pending-set
    /// bookkeeping.  `prior_attempts` counts earlier sends of the same
    /// action.  An error means the connection is unusable.
    async fn transmit(
        &mut self,
        sink: &mut SocketSink,
        out: Outbound,
        prior_attempts: u32,
    ) -> Result<(), ()> {
        let Outbound { mut action, transient_for } = out;

        if let Some(ref session) = transient_for {
            if self.session_id.as_deref() != Some(session.as_str()) {
                debug!(action = %action.name(), "dropping transient action for a lost session");
                return Ok(());
            }
        }

        let ack = if self.last_received_event_id != self.last_acked_event_id {
            self.last_received_event_id
        } else {
            None
        };
        action.set_event_id(ack);

        if let Err(e) = transport::send_action(sink, &action).await {
            warn!(action = %action.name(), error = %e, "websocket send failed");
            action.set_event_id(None);
            if action.action_id().is_some() {
                self.pending.insert(PendingAction {
                    action,
                    transient_for,
                    attempts: prior_attempts,
                    deadline: Instant::now(),
                });
            } else {
                self.carry = Some(Outbound { action, transient_for });
            }
            return Err(());
        }

        if action.action_id().is_some() {
            let attempts = prior_attempts + 1;
            if attempts < self.cfg.retry_count {
                self.pending.insert(PendingAction {
                    action,
                    transient_for,
                    attempts,
                    deadline: Instant::now() + self.cfg.retry_timeout,
                });
            } else {
                debug!(
                    action_id = ?action.action_id(),
                    attempts,
                    "retry budget exhausted, dropping from pending"
                );
            }
        }

        if ack.is_some() {
            self.last_acked_event_id = ack;
        }
        Ok(())
    }

    fn disconnected(&mut self) -> Drive {
        if self.assembler.in_progress() {
            warn!("websocket closed in mid-event");
            self.assembler.reset();
        }
        self.set_conn_state(ConnState::Disconnected);
        if self.closing {
            Drive::Terminate
        } else {
            Drive::Reconnect
        }
    }

    fn ingest(&mut self, frame: Bytes) {
        self.signal_conn_active();
        match self.assembler.push_frame(frame) {
            Ok(Some(event)) => self.dispatch(event),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "dropping undecodable frame"),
        }
    }

    fn dispatch(&mut self, event: Event) {
        enum Route {
            Session,
            Event,
            Internal,
        }

        let name = event.name().to_owned();
        let route = if self.awaiting_create {
            match name.as_str() {
                events::SESSION_CREATED => {
                    self.adopt_session(&event);
                    Route::Session
                }
                events::ERROR => {
                    // No session exists yet, so there is nothing to recover.
                    warn!(error_type = ?event.error_type(), "session creation failed");
                    self.awaiting_create = false;
                    self.closing = true;
                    self.reset = true;
                    Route::Session
                }
                _ => {
                    warn!(event = %name, "dropping event received before session_created");
                    Route::Internal
                }
            }
        } else if name == events::SESSION_CREATED {
            self.adopt_session(&event);
            Route::Session
        } else if event.is_error()
            && event.error_type() == Some(error_types::SESSION_NOT_FOUND)
            && self.session_id.is_some()
        {
            self.reset_session();
            Route::Internal
        } else {
            Route::Event
        };

        if let Some(event_id) = event.event_id() {
            if self.last_received_event_id.is_none_or(|cur| event_id > cur) {
                self.last_received_event_id = Some(event_id);
            }
        }

        if let Some(action_id) = event.action_id() {
            self.pending.ack(action_id, event.history_length().is_some());
        }

        match route {
            Route::Internal => {}
            Route::Session => self.deliver_session_event(event),
            Route::Event => self.deliver_event(event),
        }
    }

    fn adopt_session(&mut self, event: &Event) {
        if let Some(session_id) = event.session_id() {
            self.session_id = Some(session_id.to_owned());
            *lock(&self.shared.session_id) = Some(session_id.to_owned());
        }
        if let Some(host) = event.session_host() {
            if !host.is_empty() {
                self.session_host = host.to_owned();
            }
        }
        self.awaiting_create = false;
        self.set_state(SessionState::Connected);
        info!(session_id = ?self.session_id, host = %self.session_host, "server session established");

        // Replies can no longer arrive for actions tied to an older session.
        let stale = lock(&self.registry).take_transients_not_for(self.session_id.as_deref());
        for (action_id, mut entry) in stale {
            debug!(action_id, "cancelling reply of a superseded transient action");
            invoke_reply(&mut entry.callback, None, Vec::new(), true);
        }
    }

    fn reset_session(&mut self) {
        info!("server session not found, creating a new one");
        self.session_id = None;
        *lock(&self.shared.session_id) = None;
        self.pending.purge_transient();
        self.reset = true;
    }

    fn deliver_session_event(&mut self, event: Event) {
        let (params, _payload) = event.into_parts();
        if params.get("event").and_then(Value::as_str) == Some(events::SESSION_CREATED) {
            if let Some(on_ready) = self.on_ready.take() {
                let snapshot = params.clone();
                guard("session ready callback", move || on_ready(Some(snapshot)));
            }
        }
        if let Some(on_session_event) = self.callbacks.on_session_event.as_mut() {
            guard("session event callback", || on_session_event(params));
        }
    }

    fn deliver_event(&mut self, event: Event) {
        let action_id = event.action_id();
        let interim = event.history_length().is_some();
        let multi = action_id.and_then(|id| lock(&self.registry).is_multi(id));
        let last_reply = match multi {
            Some(false) => true,
            Some(true) | None => !interim,
        };

        let (params, payload) = event.into_parts();

        if let Some(action_id) = action_id {
            let entry = lock(&self.registry).take(action_id);
            if let Some(mut entry) = entry {
                invoke_reply(&mut entry.callback, Some(params.clone()), payload.clone(), last_reply);
                if !last_reply {
                    lock(&self.registry).restore(action_id, entry);
                }
            }
        }

        if let Some(on_event) = self.callbacks.on_event.as_mut() {
            guard("event callback", || on_event(params, payload, last_reply));
        }
    }

    fn shutdown(&mut self) {
        self.set_conn_state(ConnState::Disconnected);
        self.set_state(SessionState::Closed);

        if let Some(on_ready) = self.on_ready.take() {
            guard("session ready callback", move || on_ready(None));
        }
        let outstanding = lock(&self.registry).drain_all();
        for (action_id, mut entry) in outstanding {
            debug!(action_id, "cancelling reply at session close");
            invoke_reply(&mut entry.callback, None, Vec::new(), true);
        }
        if let Some(on_close) = self.callbacks.on_close.take() {
            guard("close callback", move || on_close());
        }
        info!("session closed");
    }

    fn set_state(&mut self, state: SessionState) {
        let mut current = lock(&self.shared.state);
        let leaving = matches!(*current, SessionState::Closing | SessionState::Closed);
        let entering = matches!(state, SessionState::Closing | SessionState::Closed);
        if leaving && !entering {
            return;
        }
        *current = state;
    }

    fn set_conn_state(&mut self, state: ConnState) {
        if self.conn_state == Some(state) {
            return;
        }
        self.conn_state = Some(state);
        if let Some(on_conn_state) = self.callbacks.on_conn_state.as_mut() {
            guard("connection state callback", || on_conn_state(state));
        }
    }

    fn signal_conn_active(&mut self) {
        if let Some(on_conn_active) = self.callbacks.on_conn_active.as_mut() {
            guard("connection activity callback", || on_conn_active());
        }
    }
}

/// Exponential backoff from `floor`, doubling per failure, capped at `cap`.
fn backoff_delay(floor: Duration, cap: Duration, failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    floor.saturating_mul(1u32 << shift).min(cap)
}

/// Run a user callback; a panicking callback must not corrupt engine state.
fn guard<F: FnOnce()>(what: &str, f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(callback = what, "callback panicked");
    }
}

fn invoke_reply(
    callback: &mut ReplyFn,
    params: Option<Map<String, Value>>,
    payload: Vec<Bytes>,
    last_reply: bool,
) {
    guard("action reply callback", move || {
        callback(params, payload, last_reply);
    });
}
