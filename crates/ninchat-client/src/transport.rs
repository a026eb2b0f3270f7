//! WebSocket transport: endpoint dialing and framed action sends.

use futures_util::SinkExt;
use futures_util::stream::{SplitSink, SplitStream};
use ninchat_proto::{Action, WS_SUBPROTOCOL};
use thiserror::Error;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::debug;

pub(crate) type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub(crate) type SocketSink = SplitSink<Socket, Message>;
pub(crate) type SocketStream = SplitStream<Socket>;

#[derive(Debug, Error)]
pub(crate) enum TransportError {
    #[error("websocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("header encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Dial the endpoint, offering the Ninchat subprotocol on the upgrade.
pub(crate) async fn connect(url: &str) -> Result<Socket, TransportError> {
    let mut request = url.into_client_request()?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(WS_SUBPROTOCOL),
    );
    let (socket, response) = tokio_tungstenite::connect_async(request).await?;
    debug!(url = %url, status = ?response.status(), "websocket connected");
    Ok(socket)
}

/// Send an action: header frame first, then its payload frames in order.
pub(crate) async fn send_action<S>(sink: &mut S, action: &Action) -> Result<(), TransportError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let header = action.header()?;
    sink.send(Message::Text(header.into())).await?;
    for frame in action.payload() {
        sink.send(Message::Binary(frame.clone())).await?;
    }
    Ok(())
}
