//! WebSocket backend against a local server speaking the JSON protocol.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use talkgate_core::config::WebSocketConfig;
use talkgate_core::{
    Channel, ConnectRequest, Direction, Directive, Message as HistoryMessage, Options, Packet,
    RecordingTracer, SessionIdentity, TalkError, TalkResult, Tracer,
};
use talkgate_executor::{Communication, Executor, WebSocketExecutor};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

struct Collector {
    identity: SessionIdentity,
    tracer: Arc<RecordingTracer>,
    packets: mpsc::UnboundedSender<Packet>,
}

#[async_trait]
impl Communication for Collector {
    fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    fn histories(&self) -> Vec<HistoryMessage> {
        Vec::new()
    }

    fn args(&self) -> Options {
        Options::new().with("party_size", 2)
    }

    fn options(&self) -> Options {
        Options::new()
    }

    fn tracer(&self) -> Arc<dyn Tracer> {
        self.tracer.clone()
    }

    async fn on_packet(&self, packet: Packet) -> TalkResult<()> {
        self.packets.send(packet).map_err(|_| TalkError::SessionClosed)
    }
}

async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Option<Value> {
    while let Some(Ok(frame)) = ws.next().await {
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).ok();
        }
    }
    None
}

async fn send_json(ws: &mut WebSocketStream<TcpStream>, kind: &str, data: Value) {
    let frame = json!({ "type": kind, "timestamp": 0, "data": data }).to_string();
    ws.send(Message::Text(frame)).await.unwrap();
}

#[tokio::test]
async fn streamed_turn_completes_with_full_text_then_hangs_up() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

        let config = next_json(&mut ws).await.unwrap();
        assert_eq!(config["type"], "configuration");
        assert_eq!(config["data"]["conversation_id"], 42);
        assert_eq!(config["data"]["args"]["party_size"], 2);

        send_json(&mut ws, "ping", Value::Null).await;

        let mut seen_pong = false;
        let mut request_id = None;
        while !(seen_pong && request_id.is_some()) {
            let msg = next_json(&mut ws).await.unwrap();
            match msg["type"].as_str() {
                Some("pong") => seen_pong = true,
                Some("user_message") => {
                    assert_eq!(msg["data"]["content"], "a table please");
                    request_id = msg["data"]["id"].as_str().map(str::to_string);
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
        let id = request_id.unwrap();

        for chunk in ["Table ", "for ", "two"] {
            send_json(&mut ws, "stream", json!({ "id": id, "content": chunk })).await;
        }
        send_json(
            &mut ws,
            "complete",
            json!({ "id": id, "content": "", "metrics": [{ "name": "tokens", "value": 3.0, "unit": "count" }] }),
        )
        .await;
        send_json(&mut ws, "close", json!({ "reason": "booked", "action": "hangup" })).await;

        while let Some(Ok(_)) = ws.next().await {}
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let comm: Arc<dyn Communication> = Arc::new(Collector {
        identity: SessionIdentity {
            conversation_id: 42,
            assistant_id: 7,
            provider_model_id: 1,
            channel: Channel::Web,
            direction: Direction::Inbound,
            start_time: chrono::Utc::now(),
        },
        tracer: Arc::new(RecordingTracer::new()),
        packets: tx,
    });

    let executor = WebSocketExecutor::new(
        format!("ws://{addr}"),
        BTreeMap::new(),
        WebSocketConfig::default(),
    );
    executor
        .initialize(Arc::clone(&comm), &ConnectRequest::new(7, Channel::Web))
        .await
        .unwrap();
    executor
        .execute(
            Arc::clone(&comm),
            Packet::UserText {
                context_id: "turn-1".into(),
                text: "a table please".into(),
            },
        )
        .await
        .unwrap();

    let mut streamed = String::new();
    loop {
        match rx.recv().await.unwrap() {
            Packet::Delta { context_id, text } => {
                assert_eq!(context_id, "turn-1");
                streamed.push_str(&text);
            }
            Packet::Done { text, .. } => {
                assert_eq!(text, "Table for two");
                assert_eq!(text, streamed);
                break;
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    match rx.recv().await.unwrap() {
        Packet::Metric { metrics, .. } => {
            let names: Vec<_> = metrics.iter().map(|m| m.name.as_str()).collect();
            assert_eq!(names, vec!["TIME_TAKEN", "tokens"]);
            assert_eq!(metrics[1].value, "3.000000");
        }
        other => panic!("unexpected {other:?}"),
    }

    match rx.recv().await.unwrap() {
        Packet::Directive {
            directive, args, ..
        } => {
            assert_eq!(directive, Directive::EndConversation);
            assert_eq!(args.get_string("reason").unwrap(), "booked");
        }
        other => panic!("unexpected {other:?}"),
    }

    executor.close().await.unwrap();
    let _ = server.await;

    assert!(executor
        .execute(
            comm,
            Packet::UserText {
                context_id: "turn-2".into(),
                text: "hello?".into(),
            },
        )
        .await
        .is_err());
}

#[tokio::test]
async fn unreachable_server_fails_initialize() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let comm: Arc<dyn Communication> = Arc::new(Collector {
        identity: SessionIdentity {
            conversation_id: 1,
            assistant_id: 1,
            provider_model_id: 1,
            channel: Channel::Web,
            direction: Direction::Inbound,
            start_time: chrono::Utc::now(),
        },
        tracer: Arc::new(RecordingTracer::new()),
        packets: tx,
    });
    let executor = WebSocketExecutor::new(
        "ws://127.0.0.1:1".into(),
        BTreeMap::new(),
        WebSocketConfig::default(),
    );
    assert!(executor
        .initialize(comm, &ConnectRequest::new(1, Channel::Web))
        .await
        .is_err());
}

#[tokio::test]
async fn close_with_a_custom_action_still_ends_the_conversation() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let config = next_json(&mut ws).await.unwrap();
        assert_eq!(config["type"], "configuration");
        send_json(
            &mut ws,
            "close",
            json!({ "reason": "shift over", "action": "hold" }),
        )
        .await;
        let _ = ws.close(None).await;
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let comm: Arc<dyn Communication> = Arc::new(Collector {
        identity: SessionIdentity {
            conversation_id: 9,
            assistant_id: 7,
            provider_model_id: 1,
            channel: Channel::Web,
            direction: Direction::Inbound,
            start_time: chrono::Utc::now(),
        },
        tracer: Arc::new(RecordingTracer::new()),
        packets: tx,
    });
    let executor = WebSocketExecutor::new(
        format!("ws://{addr}"),
        BTreeMap::new(),
        WebSocketConfig::default(),
    );
    tokio_test::assert_ok!(
        executor
            .initialize(Arc::clone(&comm), &ConnectRequest::new(7, Channel::Web))
            .await
    );

    let mut directives = Vec::new();
    while let Some(Packet::Directive {
        directive, args, ..
    }) = rx.recv().await
    {
        let ended = directive == Directive::EndConversation;
        directives.push((directive, args.get_string("reason").unwrap()));
        if ended {
            break;
        }
    }
    assert_eq!(
        directives,
        vec![
            (Directive::Other("hold".into()), "shift over".to_string()),
            (Directive::EndConversation, "shift over".to_string()),
        ]
    );

    executor.close().await.unwrap();
    let _ = server.await;
}
