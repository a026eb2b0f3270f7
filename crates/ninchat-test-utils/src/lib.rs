// ninchat-test-utils: Shared test utilities for the client suite.
//
// Provides a canned mock Ninchat server plus low-level wire helpers for
// scripting bespoke server behavior in integration tests.

pub mod mock_server;
pub mod wire;

pub use mock_server::{MockServer, serve_script};
pub use wire::{RecvAction, ServerSocket, recv_action, send_event};

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::SinkExt;
    use serde_json::json;
    use tokio_tungstenite::tungstenite::protocol::Message;

    // -----------------------------------------------------------------------
    // Wire helper tests, driven through a scripted server
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn recv_action_reassembles_payload_frames() {
        let (addr, task) = serve_script(1, |_i, mut ws| async move {
            let action = recv_action(&mut ws).await.expect("an action");
            assert_eq!(action.name(), "send_message");
            assert_eq!(action.action_id(), Some(1));
            assert_eq!(action.payload.len(), 2);
            assert_eq!(&action.payload[0][..], b"one");
            assert_eq!(&action.payload[1][..], b"two");
        })
        .await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        ws.send(Message::Text(
            r#"{"action":"send_message","action_id":1,"frames":2}"#.into(),
        ))
        .await
        .unwrap();
        ws.send(Message::Binary(b"one".as_slice().into())).await.unwrap();
        ws.send(Message::Binary(b"two".as_slice().into())).await.unwrap();

        task.await.unwrap();
    }

    #[tokio::test]
    async fn send_event_declares_frames_only_with_payload() {
        let (addr, task) = serve_script(1, |_i, mut ws| async move {
            send_event(&mut ws, json!({"event": "conn_described"}), &[])
                .await
                .unwrap();
            send_event(
                &mut ws,
                json!({"event": "message_received"}),
                &[b"payload".as_slice()],
            )
            .await
            .unwrap();
        })
        .await;

        use futures_util::StreamExt;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();

        let first = ws.next().await.unwrap().unwrap();
        let header: serde_json::Value =
            serde_json::from_slice(&first.into_data()).unwrap();
        assert!(header.get("frames").is_none());

        let second = ws.next().await.unwrap().unwrap();
        let header: serde_json::Value =
            serde_json::from_slice(&second.into_data()).unwrap();
        assert_eq!(header.get("frames").and_then(|v| v.as_u64()), Some(1));
        let frame = ws.next().await.unwrap().unwrap();
        assert_eq!(&frame.into_data()[..], b"payload");

        task.await.unwrap();
    }

    // -----------------------------------------------------------------------
    // Canned server tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn mock_server_creates_sessions() {
        let server = MockServer::start().await.unwrap();
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", server.local_addr()))
            .await
            .unwrap();

        ws.send(Message::Text(
            r#"{"action":"create_session","message_types":["*"]}"#.into(),
        ))
        .await
        .unwrap();

        use futures_util::StreamExt;
        let reply = ws.next().await.unwrap().unwrap();
        let header: serde_json::Value = serde_json::from_slice(&reply.into_data()).unwrap();
        assert_eq!(header.get("event").and_then(|v| v.as_str()), Some("session_created"));
        assert!(header.get("session_id").and_then(|v| v.as_str()).is_some());
        assert!(header.get("user_id").and_then(|v| v.as_str()).is_some());
    }

    #[tokio::test]
    async fn mock_server_rejects_resume_of_unknown_session() {
        let server = MockServer::start().await.unwrap();
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", server.local_addr()))
            .await
            .unwrap();

        ws.send(Message::Text(
            r#"{"action":"resume_session","session_id":"nope"}"#.into(),
        ))
        .await
        .unwrap();

        use futures_util::StreamExt;
        let reply = ws.next().await.unwrap().unwrap();
        let header: serde_json::Value = serde_json::from_slice(&reply.into_data()).unwrap();
        assert_eq!(header.get("event").and_then(|v| v.as_str()), Some("error"));
        assert_eq!(
            header.get("error_type").and_then(|v| v.as_str()),
            Some("session_not_found")
        );
    }
}
