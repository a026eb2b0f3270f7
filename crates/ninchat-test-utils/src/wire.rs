//! Low-level wire helpers for server-side test scripts: read framed
//! actions, send framed events.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Message;

/// Server side of an accepted test connection.
pub type ServerSocket = WebSocketStream<tokio::net::TcpStream>;

/// An action as observed by the server: parameter map plus payload frames.
#[derive(Debug, Clone)]
pub struct RecvAction {
    pub params: Map<String, Value>,
    pub payload: Vec<Bytes>,
}

impl RecvAction {
    pub fn name(&self) -> &str {
        self.params.get("action").and_then(Value::as_str).unwrap_or("")
    }

    pub fn action_id(&self) -> Option<i64> {
        self.params.get("action_id").and_then(Value::as_i64)
    }

    /// The acknowledgement event id the client attached, if any.
    pub fn event_id(&self) -> Option<i64> {
        self.params.get("event_id").and_then(Value::as_i64)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.params.get("session_id").and_then(Value::as_str)
    }
}

/// Read one action (header frame plus its declared payload frames),
/// transparently answering pings and skipping keep-alive frames.  Returns
/// `None` when the client closes the connection.
pub async fn recv_action(ws: &mut ServerSocket) -> Option<RecvAction> {
    let mut params = loop {
        match ws.next().await? {
            Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
                let data = msg.into_data();
                if data.is_empty() {
                    continue;
                }
                let value: Value =
                    serde_json::from_slice(&data).expect("action header is JSON");
                match value {
                    Value::Object(map) => break map,
                    other => panic!("action header is not an object: {other:?}"),
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = ws.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    };

    let frames = params
        .remove("frames")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let mut payload = Vec::with_capacity(frames as usize);
    while (payload.len() as u64) < frames {
        match ws.next().await? {
            Ok(msg @ (Message::Text(_) | Message::Binary(_))) => payload.push(msg.into_data()),
            Ok(Message::Ping(data)) => {
                let _ = ws.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }

    Some(RecvAction { params, payload })
}

/// Send an event: header frame plus payload frames.  `params` must be a
/// JSON object; `frames` is filled in from the payload.
pub async fn send_event(
    ws: &mut ServerSocket,
    params: Value,
    payload: &[&[u8]],
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let mut map = match params {
        Value::Object(map) => map,
        other => panic!("event params must be an object: {other:?}"),
    };
    if !payload.is_empty() {
        map.insert("frames".to_owned(), Value::from(payload.len() as u64));
    }
    let header = Value::Object(map).to_string();
    ws.send(Message::Text(header.into())).await?;
    for frame in payload {
        ws.send(Message::Binary(Bytes::copy_from_slice(frame))).await?;
    }
    Ok(())
}
