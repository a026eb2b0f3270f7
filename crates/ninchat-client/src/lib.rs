//! Ninchat client session engine.
//!
//! A long-lived conversational session layered above the framed WebSocket
//! transport of the Ninchat v2 API: reliable action delivery with retries
//! and acknowledgements, ordered event consumption, automatic session
//! resumption across transport drops, and reply routing that survives
//! server-session resets.
//!
//! # Concurrency model
//!
//! Each [`Session`] is driven by a single cooperative tokio task spawned by
//! [`Session::open`].  That task owns the transport, the send loop, and the
//! pending set, and it invokes every configured callback inline; callbacks
//! therefore never race each other.  A callback that panics is caught and
//! logged, and the engine carries on.  The facade methods themselves are
//! safe to call from any thread.

mod engine;
mod pending;
mod registry;
mod session;
mod transport;

pub mod call;

pub use ninchat_api::{ParameterError, Schema, SchemaError, ValidateAction};
pub use ninchat_proto::{DEFAULT_SESSION_HOST, WS_SUBPROTOCOL};
pub use session::{
    CloseFn, ConnActiveFn, ConnState, ConnStateFn, EventFn, ReadyFn, ReplyFn, SendError, Session,
    SessionBuilder, SessionEventFn, SessionState,
};

/// Mutex lock that recovers from poisoning instead of propagating it.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
