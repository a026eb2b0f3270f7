// mock_server: A mock Ninchat API server for integration testing.
//
// Speaks the framed protocol: accepts create_session / resume_session,
// answers describe_conn, echoes send_message back as message_received, and
// closes on close_session.  Each test spins up its own isolated instance.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::wire::{ServerSocket, recv_action, send_event};

/// Accept `connections` WebSocket connections on a random port, driving
/// each in turn with the handler (invoked with the connection index).
/// Returns the bound address and the server task handle.
///
/// The workhorse of scripted integration tests; for canned behavior use
/// [`MockServer`].
pub async fn serve_script<F, Fut>(connections: usize, handler: F) -> (SocketAddr, JoinHandle<()>)
where
    F: Fn(usize, ServerSocket) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        for i in 0..connections {
            let (stream, _peer) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            handler(i, ws).await;
        }
    });
    (addr, task)
}

/// A canned mock server.
///
/// # Protocol behavior
///
/// - `create_session` yields a `session_created` event with a fresh
///   `session_id`, a fixed `user_id`, and an empty `session_host`.
/// - `resume_session` of a known session is accepted silently; of an
///   unknown one it yields `error` / `session_not_found`.
/// - `describe_conn` yields `conn_described` echoing the `action_id`.
/// - `send_message` yields `message_received` echoing `message_type` and
///   the payload frames, with a fresh `event_id`.
/// - `close_session` closes the connection.
/// - Anything else is ignored.
pub struct MockServer {
    addr: SocketAddr,
    /// Handle to the background accept loop; dropped with the server.
    _task: JoinHandle<()>,
}

struct ServerState {
    sessions: Mutex<HashSet<String>>,
    next_event_id: AtomicI64,
}

impl MockServer {
    /// Start the mock server, binding to a random available port.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(ServerState {
            sessions: Mutex::new(HashSet::new()),
            next_event_id: AtomicI64::new(0),
        });

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                                // Connection errors are expected in tests
                                // (clients drop at will); swallow them.
                                let _ = Self::handle_connection(ws, state).await;
                            }
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self { addr, _task: task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Host string for a session builder pointed at this server.
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    // -- internal --

    async fn handle_connection(
        mut ws: ServerSocket,
        state: Arc<ServerState>,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        while let Some(action) = recv_action(&mut ws).await {
            match action.name() {
                "create_session" => {
                    let session_id = uuid::Uuid::new_v4().to_string();
                    state
                        .sessions
                        .lock()
                        .unwrap()
                        .insert(session_id.clone());
                    send_event(
                        &mut ws,
                        json!({
                            "event": "session_created",
                            "session_id": session_id,
                            "session_host": "",
                            "user_id": "mock-user",
                            "user_auth": "mock-auth",
                        }),
                        &[],
                    )
                    .await?;
                }
                "resume_session" => {
                    let known = action
                        .session_id()
                        .map(|id| state.sessions.lock().unwrap().contains(id))
                        .unwrap_or(false);
                    if !known {
                        send_event(
                            &mut ws,
                            json!({
                                "event": "error",
                                "error_type": "session_not_found",
                            }),
                            &[],
                        )
                        .await?;
                    }
                }
                "close_session" => break,
                "describe_conn" => {
                    send_event(
                        &mut ws,
                        json!({
                            "event": "conn_described",
                            "action_id": action.action_id(),
                        }),
                        &[],
                    )
                    .await?;
                }
                "send_message" => {
                    let event_id = state.next_event_id.fetch_add(1, Ordering::SeqCst) + 1;
                    let payload: Vec<&[u8]> =
                        action.payload.iter().map(|b| b.as_ref()).collect();
                    send_event(
                        &mut ws,
                        json!({
                            "event": "message_received",
                            "event_id": event_id,
                            "action_id": action.action_id(),
                            "message_id": format!("msg-{event_id}"),
                            "message_type": action.params.get("message_type"),
                        }),
                        &payload,
                    )
                    .await?;
                }
                other => {
                    // Unhandled action kinds are fine in tests.
                    let _ = other;
                }
            }
        }
        Ok(())
    }
}
