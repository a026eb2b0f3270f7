// ninchat-proto: Ninchat v2 wire protocol primitives.
//
// Every action and event on the socket occupies one header frame (a compact
// UTF-8 JSON object) followed by zero or more opaque payload frames.  The
// header's `frames` field declares the payload frame count.  Empty frames
// are keep-alives and carry no meaning.

mod action;
mod event;

pub use action::Action;
pub use event::{Event, EventAssembler};

use thiserror::Error;

/// Default API endpoint host; the server may redirect a session elsewhere
/// via the `session_host` field of `session_created`.
pub const DEFAULT_SESSION_HOST: &str = "api.ninchat.com";

/// WebSocket subprotocol spoken on the socket.
pub const WS_SUBPROTOCOL: &str = "ninchat.com-1";

/// WebSocket endpoint path.
pub const SOCKET_PATH: &str = "/v2/socket";

/// Session lifecycle action names.
pub mod actions {
    pub const CREATE_SESSION: &str = "create_session";
    pub const RESUME_SESSION: &str = "resume_session";
    pub const CLOSE_SESSION: &str = "close_session";
    /// The one known multi-reply action.
    pub const LOAD_HISTORY: &str = "load_history";
}

/// Session lifecycle event names.
pub mod events {
    pub const SESSION_CREATED: &str = "session_created";
    pub const ERROR: &str = "error";
}

/// `error_type` values with engine-level meaning.
pub mod error_types {
    /// The server no longer knows the session; recoverable by creating a
    /// fresh one.
    pub const SESSION_NOT_FOUND: &str = "session_not_found";
}

/// Errors produced while decoding a header frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("header frame is not valid JSON: {0}")]
    HeaderSyntax(#[from] serde_json::Error),
    #[error("header frame is not a JSON object")]
    HeaderNotObject,
    #[error("event header is missing the \"event\" field")]
    MissingEventName,
    #[error("invalid \"frames\" count in event header")]
    InvalidFrameCount,
}
