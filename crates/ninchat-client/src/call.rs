//! Thin awaitable wrappers over the callback core.
//!
//! There is exactly one engine; these helpers just resolve a future from
//! the corresponding callback.

use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::session::{SendError, Session};

/// One reply event of a call.
#[derive(Debug)]
pub struct Reply {
    pub params: Map<String, Value>,
    pub payload: Vec<Bytes>,
}

/// Open the session and wait for the first `session_created` event's
/// params.  Resolves to `None` if the session closes before a server
/// session could be established.
pub async fn open(session: &Session) -> Option<Map<String, Value>> {
    let (tx, rx) = oneshot::channel();
    session.open_with(move |params| {
        let _ = tx.send(params);
    });
    rx.await.ok().flatten()
}

/// Send an action and wait for all of its replies: one event for ordinary
/// actions, the interim events plus the terminator for history loads.
/// Resolves to `None` when the session closes before the final reply.
pub async fn call(
    session: &Session,
    params: Map<String, Value>,
    payload: Vec<Bytes>,
) -> Result<Option<Vec<Reply>>, SendError> {
    let (tx, rx) = oneshot::channel();
    let mut tx = Some(tx);
    let mut replies = Vec::new();
    session.send_with_reply(params, payload, move |params, payload, last_reply| {
        match params {
            None => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(None);
                }
            }
            Some(params) => {
                replies.push(Reply { params, payload });
                if last_reply {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(Some(std::mem::take(&mut replies)));
                    }
                }
            }
        }
    })?;
    Ok(rx.await.ok().flatten())
}
