use std::time::Duration;

use ninchat_client::Session;
use ninchat_test_utils::serve_script;
use ninchat_test_utils::wire::{recv_action, send_event};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

fn obj(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other:?}"),
    }
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a callback")
        .expect("callback channel closed")
}

async fn join_server_task(task: JoinHandle<()>) {
    timeout(Duration::from_secs(5), task)
        .await
        .expect("server task timed out")
        .expect("server task panicked");
}

#[tokio::test]
async fn dropped_transport_resumes_with_last_event_id() {
    let (resume_tx, mut resume_rx) = mpsc::unbounded_channel();
    let (addr, task) = serve_script(2, move |i, mut ws| {
        let resume_tx = resume_tx.clone();
        async move {
            if i == 0 {
                let hello = recv_action(&mut ws).await.expect("create_session");
                assert_eq!(hello.name(), "create_session");
                send_event(
                    &mut ws,
                    json!({
                        "event": "session_created",
                        "session_id": "s1",
                        "session_host": "",
                        "user_id": "u1",
                    }),
                    &[],
                )
                .await
                .unwrap();
                send_event(
                    &mut ws,
                    json!({"event": "message_received", "event_id": 7}),
                    &[b"hi".as_slice()],
                )
                .await
                .unwrap();
                // Drop the connection under the client.
            } else {
                let resume = recv_action(&mut ws).await.expect("resume_session");
                let _ = resume_tx.send(resume);
                // Drop the socket once the client asks to close.
                while let Some(action) = recv_action(&mut ws).await {
                    if action.name() == "close_session" {
                        break;
                    }
                }
            }
        }
    })
    .await;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let session = Session::builder()
        .server_host(addr.to_string())
        .insecure_transport()
        .on_session_event(|_| {})
        .on_event(move |params, payload, _| {
            let _ = event_tx.send((params, payload));
        })
        .build();
    session.set_params(obj(json!({"message_types": ["*"]})));
    session.open();

    let (params, payload) = recv(&mut event_rx).await;
    assert_eq!(
        params.get("event").and_then(Value::as_str),
        Some("message_received")
    );
    assert_eq!(&payload[0][..], b"hi");

    let resume = recv(&mut resume_rx).await;
    assert_eq!(resume.name(), "resume_session");
    assert_eq!(resume.session_id(), Some("s1"));
    assert_eq!(resume.event_id(), Some(7));

    session.close();
    join_server_task(task).await;
}

#[tokio::test]
async fn session_reset_replays_pending_actions_in_order() {
    let (order_tx, mut order_rx) = mpsc::unbounded_channel();
    let (addr, task) = serve_script(2, move |i, mut ws| {
        let order_tx = order_tx.clone();
        async move {
            if i == 0 {
                let hello = recv_action(&mut ws).await.expect("create_session");
                assert_eq!(hello.name(), "create_session");
                send_event(
                    &mut ws,
                    json!({
                        "event": "session_created",
                        "session_id": "s1",
                        "session_host": "",
                        "user_id": "u1",
                    }),
                    &[],
                )
                .await
                .unwrap();
                // Swallow three actions unacknowledged, then kill the
                // server session.
                for _ in 0..3 {
                    let action = recv_action(&mut ws).await.expect("an action");
                    assert_eq!(action.name(), "describe_conn");
                }
                send_event(
                    &mut ws,
                    json!({"event": "error", "error_type": "session_not_found"}),
                    &[],
                )
                .await
                .unwrap();
                while recv_action(&mut ws).await.is_some() {}
            } else {
                let hello = recv_action(&mut ws).await.expect("create_session");
                assert_eq!(hello.name(), "create_session");
                send_event(
                    &mut ws,
                    json!({
                        "event": "session_created",
                        "session_id": "s2",
                        "session_host": "",
                        "user_id": "u1",
                    }),
                    &[],
                )
                .await
                .unwrap();
                for _ in 0..4 {
                    let action = recv_action(&mut ws).await.expect("a replayed action");
                    let _ = order_tx.send(action.action_id().unwrap());
                    send_event(
                        &mut ws,
                        json!({
                            "event": "conn_described",
                            "action_id": action.action_id(),
                        }),
                        &[],
                    )
                    .await
                    .unwrap();
                }
                while let Some(action) = recv_action(&mut ws).await {
                    if action.name() == "close_session" {
                        break;
                    }
                }
            }
        }
    })
    .await;

    let (session_tx, mut session_rx) = mpsc::unbounded_channel();
    let session = Session::builder()
        .server_host(addr.to_string())
        .insecure_transport()
        .on_session_event(move |params| {
            let _ = session_tx.send(params);
        })
        .build();
    session.set_params(obj(json!({"message_types": ["*"]})));
    session.open();

    let first = recv(&mut session_rx).await;
    assert_eq!(
        first.get("session_id").and_then(Value::as_str),
        Some("s1")
    );

    for _ in 0..3 {
        session
            .send_with_reply(obj(json!({"action": "describe_conn"})), Vec::new(), |_, _, _| {})
            .unwrap();
    }

    // The reset is internal; the caller only observes a second
    // session_created.
    let second = recv(&mut session_rx).await;
    assert_eq!(
        second.get("session_id").and_then(Value::as_str),
        Some("s2")
    );
    assert_eq!(session.server_session_id().as_deref(), Some("s2"));

    // A newly enqueued action goes out after the replays.
    let fourth = session
        .send_with_reply(obj(json!({"action": "describe_conn"})), Vec::new(), |_, _, _| {})
        .unwrap();
    assert_eq!(fourth, 4);

    let mut order = Vec::new();
    for _ in 0..4 {
        order.push(recv(&mut order_rx).await);
    }
    assert_eq!(order, vec![1, 2, 3, 4]);

    session.close();
    join_server_task(task).await;
}

#[tokio::test]
async fn transient_action_is_dropped_on_reset() {
    let (conn1_tx, mut conn1_rx) = mpsc::unbounded_channel();
    let (addr, task) = serve_script(2, move |i, mut ws| {
        let conn1_tx = conn1_tx.clone();
        async move {
            if i == 0 {
                let hello = recv_action(&mut ws).await.expect("create_session");
                assert_eq!(hello.name(), "create_session");
                send_event(
                    &mut ws,
                    json!({
                        "event": "session_created",
                        "session_id": "s1",
                        "session_host": "",
                        "user_id": "u1",
                    }),
                    &[],
                )
                .await
                .unwrap();
                // Receive the transient action, never ack it, then reset.
                let transient = recv_action(&mut ws).await.expect("transient action");
                assert_eq!(transient.action_id(), Some(1));
                send_event(
                    &mut ws,
                    json!({"event": "error", "error_type": "session_not_found"}),
                    &[],
                )
                .await
                .unwrap();
                while recv_action(&mut ws).await.is_some() {}
            } else {
                let hello = recv_action(&mut ws).await.expect("create_session");
                assert_eq!(hello.name(), "create_session");
                send_event(
                    &mut ws,
                    json!({
                        "event": "session_created",
                        "session_id": "s2",
                        "session_host": "",
                        "user_id": "u1",
                    }),
                    &[],
                )
                .await
                .unwrap();
                // Every action arriving on the new session is reported.
                while let Some(action) = recv_action(&mut ws).await {
                    if action.name() == "close_session" {
                        break;
                    }
                    let _ = conn1_tx.send(action.action_id());
                    send_event(
                        &mut ws,
                        json!({
                            "event": "conn_described",
                            "action_id": action.action_id(),
                        }),
                        &[],
                    )
                    .await
                    .unwrap();
                }
            }
        }
    })
    .await;

    let (session_tx, mut session_rx) = mpsc::unbounded_channel();
    let session = Session::builder()
        .server_host(addr.to_string())
        .insecure_transport()
        .on_session_event(move |params| {
            let _ = session_tx.send(params);
        })
        .build();
    session.set_params(obj(json!({"message_types": ["*"]})));
    session.open();

    let first = recv(&mut session_rx).await;
    assert_eq!(first.get("session_id").and_then(Value::as_str), Some("s1"));

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    session
        .send_transient_with_reply(
            obj(json!({"action": "describe_conn"})),
            Vec::new(),
            move |params, _, last_reply| {
                let _ = reply_tx.send((params.is_none(), last_reply));
            },
        )
        .unwrap();

    let second = recv(&mut session_rx).await;
    assert_eq!(second.get("session_id").and_then(Value::as_str), Some("s2"));

    // The transient's reply is cancelled when the replacement session
    // arrives.
    let (cancelled, last_reply) = recv(&mut reply_rx).await;
    assert!(cancelled);
    assert!(last_reply);

    // Only the fresh action reaches the new session; the transient is
    // never replayed.
    let id = session
        .send_with_reply(obj(json!({"action": "describe_conn"})), Vec::new(), |_, _, _| {})
        .unwrap();
    assert_eq!(id, 2);
    assert_eq!(recv(&mut conn1_rx).await, Some(2));

    session.close();
    join_server_task(task).await;
}

#[tokio::test]
async fn second_session_created_updates_identity_without_resetting_event_ids() {
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
    let (addr, task) = serve_script(1, move |_i, mut ws| {
        let ack_tx = ack_tx.clone();
        async move {
            let hello = recv_action(&mut ws).await.expect("create_session");
            assert_eq!(hello.name(), "create_session");
            send_event(
                &mut ws,
                json!({
                    "event": "session_created",
                    "session_id": "s1",
                    "session_host": "",
                    "user_id": "u1",
                }),
                &[],
            )
            .await
            .unwrap();
            send_event(&mut ws, json!({"event": "message_received", "event_id": 5}), &[])
                .await
                .unwrap();
            send_event(
                &mut ws,
                json!({
                    "event": "session_created",
                    "session_id": "s2",
                    "session_host": "",
                    "user_id": "u1",
                }),
                &[],
            )
            .await
            .unwrap();
            let action = recv_action(&mut ws).await.expect("an action");
            let _ = ack_tx.send(action.event_id());
            while let Some(action) = recv_action(&mut ws).await {
                if action.name() == "close_session" {
                    break;
                }
            }
        }
    })
    .await;

    let (session_tx, mut session_rx) = mpsc::unbounded_channel();
    let session = Session::builder()
        .server_host(addr.to_string())
        .insecure_transport()
        .on_session_event(move |params| {
            let _ = session_tx.send(params);
        })
        .on_event(|_, _, _| {})
        .build();
    session.set_params(obj(json!({"message_types": ["*"]})));
    session.open();

    let first = recv(&mut session_rx).await;
    assert_eq!(first.get("session_id").and_then(Value::as_str), Some("s1"));
    let second = recv(&mut session_rx).await;
    assert_eq!(second.get("session_id").and_then(Value::as_str), Some("s2"));
    assert_eq!(session.server_session_id().as_deref(), Some("s2"));

    // The next outbound action still acknowledges the event observed
    // before the identity change.
    session.send(obj(json!({"action": "describe_conn", "action_id": null})), Vec::new()).unwrap();
    assert_eq!(recv(&mut ack_rx).await, Some(5));

    session.close();
    join_server_task(task).await;
}
