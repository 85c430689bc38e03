//! WebSocket backend: JSON messages `{type, timestamp, data}` in both directions.
//!
//! Engine → server: `configuration`, `user_message`, `interruption`, `pong`.
//! Server → engine: `stream`, `complete`, `tool_call`, `interruption`, `close`, `error`,
//! `ping`. Messages without an id belong to the conversation as a whole.

use crate::accumulate::DeltaAccumulator;
use crate::error::{ExecutorError, ExecutorResult};
use crate::{Communication, Executor};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use talkgate_core::config::WebSocketConfig;
use talkgate_core::{
    ConnectRequest, Directive, InterruptionSource, Metric, Options, Packet, Stage,
};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as ProtocolConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Serialize)]
struct Outgoing {
    #[serde(rename = "type")]
    kind: &'static str,
    timestamp: i64,
    #[serde(skip_serializing_if = "Value::is_null")]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct Incoming {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Option<ErrorData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TextData {
    id: String,
    content: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CompleteData {
    id: String,
    content: String,
    metrics: Vec<RemoteMetric>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RemoteMetric {
    name: String,
    value: f64,
    unit: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ToolCallData {
    id: String,
    name: String,
    params: Option<serde_json::Map<String, Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InterruptionData {
    id: String,
    source: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CloseData {
    reason: String,
    action: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorData {
    id: String,
    code: i64,
    message: String,
}

fn parse<T: Default + for<'de> Deserialize<'de>>(data: Value) -> T {
    serde_json::from_value(data).unwrap_or_else(|e| {
        debug!(error = %e, "malformed message data");
        T::default()
    })
}

/// State shared between the executor and its reader task.
struct Shared {
    writer: tokio::sync::Mutex<Option<SplitSink<WsStream, Message>>>,
    accumulator: DeltaAccumulator,
    request_times: DashMap<String, Instant>,
    current: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl Shared {
    async fn send(&self, kind: &'static str, data: Value) -> ExecutorResult<()> {
        let frame = serde_json::to_string(&Outgoing {
            kind,
            timestamp: chrono::Utc::now().timestamp_millis(),
            data,
        })?;
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(ExecutorError::NotInitialized)?;
        sink.send(Message::Text(frame)).await?;
        Ok(())
    }

    /// Close out a request: full-text `Done` plus its metrics.
    fn complete(&self, context_id: &str, content: &str, remote: Vec<RemoteMetric>) -> Vec<Packet> {
        let mut packets = vec![self.accumulator.done(context_id, content)];
        let mut metrics: Vec<Metric> = self
            .request_times
            .remove(context_id)
            .map(|(_, started)| Metric::time_taken(started.elapsed()))
            .into_iter()
            .collect();
        metrics.extend(
            remote
                .into_iter()
                .map(|m| Metric::new(m.name, format!("{:.6}", m.value), m.unit)),
        );
        if !metrics.is_empty() {
            packets.push(Packet::Metric {
                context_id: context_id.to_string(),
                metrics,
            });
        }
        packets
    }

    fn current(&self) -> Option<String> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Turn one server message into packets for the engine.
    async fn handle(&self, message: Incoming, conversation: &str) -> Vec<Packet> {
        let id_or = |id: String| if id.is_empty() { conversation.to_string() } else { id };

        if let Some(err) = message.error {
            error!(code = err.code, message = %err.message, "server error");
            return self.fail_turn(err.id);
        }

        match message.kind.as_str() {
            "stream" => {
                let d: TextData = parse(message.data);
                vec![self.accumulator.delta(&id_or(d.id), &d.content)]
            }
            "complete" => {
                let d: CompleteData = parse(message.data);
                self.complete(&id_or(d.id), &d.content, d.metrics)
            }
            "tool_call" => {
                let d: ToolCallData = parse(message.data);
                let args: Options = d.params.unwrap_or_default().into_iter().collect();
                vec![Packet::Directive {
                    context_id: id_or(d.id),
                    directive: Directive::parse(&d.name),
                    args,
                }]
            }
            "interruption" => {
                let d: InterruptionData = parse(message.data);
                let context_id = id_or(d.id);
                self.accumulator.discard(&context_id);
                vec![Packet::Interruption {
                    context_id,
                    source: if d.source == "vad" {
                        InterruptionSource::Vad
                    } else {
                        InterruptionSource::Word
                    },
                }]
            }
            "close" => {
                let d: CloseData = parse(message.data);
                self.closed.store(true, Ordering::SeqCst);
                let mut packets = Vec::with_capacity(2);
                // a close always terminates; a non-ending action is relayed first
                match d.action.as_deref().map(Directive::parse) {
                    None | Some(Directive::EndConversation) => {}
                    Some(directive) => packets.push(Packet::Directive {
                        context_id: conversation.to_string(),
                        directive,
                        args: Options::new().with("reason", d.reason.clone()),
                    }),
                }
                packets.push(Packet::end_conversation(conversation, d.reason));
                packets
            }
            "error" => {
                let d: ErrorData = parse(message.data);
                error!(code = d.code, message = %d.message, "server error");
                self.fail_turn(d.id)
            }
            "ping" => {
                if let Err(e) = self.send("pong", Value::Null).await {
                    warn!(error = %e, "pong not sent");
                }
                Vec::new()
            }
            other => {
                debug!(kind = other, "unhandled message type");
                Vec::new()
            }
        }
    }

    /// Complete an in-flight turn with whatever was streamed before the error.
    fn fail_turn(&self, id: String) -> Vec<Packet> {
        let context_id = if id.is_empty() { self.current() } else { Some(id) };
        match context_id {
            Some(ctx) if self.request_times.contains_key(&ctx) => self.complete(&ctx, "", Vec::new()),
            _ => Vec::new(),
        }
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    comm: Arc<dyn Communication>,
    mut reader: SplitStream<WsStream>,
    cancel: CancellationToken,
    poll: Duration,
) {
    let conversation = comm.identity().conversation_id.to_string();
    let reason = loop {
        if cancel.is_cancelled() {
            return;
        }
        let frame = match tokio::time::timeout(poll, reader.next()).await {
            Err(_) => continue,
            Ok(None) => break "server closed".to_string(),
            Ok(Some(Err(e))) => break e.to_string(),
            Ok(Some(Ok(frame))) => frame,
        };
        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Message::Close(_) => break "server closed".to_string(),
            _ => continue,
        };
        let message: Incoming = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "invalid response");
                continue;
            }
        };
        for packet in shared.handle(message, &conversation).await {
            if let Err(e) = comm.on_packet(packet).await {
                debug!(error = %e, "engine stopped accepting packets");
                return;
            }
        }
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }
    };
    if cancel.is_cancelled() {
        return;
    }
    warn!(%reason, "executor socket terminated");
    shared.closed.store(true, Ordering::SeqCst);
    if let Err(e) = comm
        .on_packet(Packet::end_conversation(conversation, reason))
        .await
    {
        debug!(error = %e, "end of conversation not delivered");
    }
}

pub struct WebSocketExecutor {
    url: String,
    headers: BTreeMap<String, String>,
    config: WebSocketConfig,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketExecutor {
    pub fn new(url: String, headers: BTreeMap<String, String>, config: WebSocketConfig) -> Self {
        Self {
            url,
            headers,
            config,
            shared: Arc::new(Shared {
                writer: tokio::sync::Mutex::new(None),
                accumulator: DeltaAccumulator::new(),
                request_times: DashMap::new(),
                current: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
            cancel: CancellationToken::new(),
            reader: Mutex::new(None),
        }
    }

    async fn connect(&self) -> ExecutorResult<WsStream> {
        let mut request = self.url.as_str().into_client_request()?;
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ExecutorError::Connect(format!("header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ExecutorError::Connect(format!("header value: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let mut protocol = ProtocolConfig::default();
        protocol.max_message_size = Some(self.config.max_message_bytes);

        let handshake = Duration::from_secs(self.config.handshake_timeout_secs);
        let (stream, _) = tokio::time::timeout(
            handshake,
            tokio_tungstenite::connect_async_with_config(request, Some(protocol), false),
        )
        .await
        .map_err(|_| ExecutorError::Handshake(format!("no handshake within {handshake:?}")))?
        .map_err(|e| ExecutorError::Connect(e.to_string()))?;
        Ok(stream)
    }
}

#[async_trait]
impl Executor for WebSocketExecutor {
    fn name(&self) -> &str {
        "websocket"
    }

    #[instrument(skip_all, fields(url = %self.url))]
    async fn initialize(
        &self,
        comm: Arc<dyn Communication>,
        config: &ConnectRequest,
    ) -> ExecutorResult<()> {
        let tracer = comm.tracer();
        let span = tracer.start_span(Stage::Connect);
        tracer.add_attributes(span, &[("executor", self.name().to_string())]);

        let result = async {
            let (writer, reader) = self.connect().await?.split();
            *self.shared.writer.lock().await = Some(writer);

            let handle = tokio::spawn(read_loop(
                Arc::clone(&self.shared),
                Arc::clone(&comm),
                reader,
                self.cancel.clone(),
                Duration::from_millis(self.config.read_poll_ms.max(1)),
            ));
            *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

            let identity = comm.identity();
            self.shared
                .send(
                    "configuration",
                    json!({
                        "assistant_id": identity.assistant_id,
                        "conversation_id": identity.conversation_id,
                        "channel": config.channel,
                        "args": comm.args(),
                    }),
                )
                .await
        }
        .await;

        tracer.end_span(span);
        if result.is_ok() {
            info!("✅ Executor socket open");
        }
        result
    }

    async fn execute(&self, comm: Arc<dyn Communication>, packet: Packet) -> ExecutorResult<()> {
        let tracer = comm.tracer();
        let span = tracer.start_span(Stage::Execute);
        tracer.add_attributes(span, &[("context_id", packet.context_id().to_string())]);

        let result = match packet {
            Packet::UserText { context_id, text } => {
                if self.shared.closed.load(Ordering::SeqCst) {
                    Err(ExecutorError::Closed)
                } else {
                    self.shared
                        .request_times
                        .insert(context_id.clone(), Instant::now());
                    *self
                        .shared
                        .current
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(context_id.clone());
                    self.shared
                        .send("user_message", json!({ "id": context_id, "content": text }))
                        .await
                }
            }
            Packet::Interruption { context_id, source } => {
                self.shared.accumulator.discard(&context_id);
                self.shared
                    .send(
                        "interruption",
                        json!({ "id": context_id, "source": source.as_str() }),
                    )
                    .await
            }
            other => {
                debug!(kind = other.kind(), "packet not forwarded to socket executor");
                Ok(())
            }
        };
        tracer.end_span(span);
        result
    }

    async fn close(&self) -> ExecutorResult<()> {
        self.cancel.cancel();
        let writer = self.shared.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if !self.shared.closed.swap(true, Ordering::SeqCst) {
                if let Err(e) = writer.send(Message::Close(None)).await {
                    debug!(error = %e, "close frame not sent");
                }
            }
            let _ = writer.close().await;
        }
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "socket reader task failed");
            }
        }
        Ok(())
    }
}
