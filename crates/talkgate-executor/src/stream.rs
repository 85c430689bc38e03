//! Bidirectional gRPC stream backend.
//!
//! One `Talk` stream per session. Requests go out through an unbounded channel wrapped as
//! the request stream; a background task reads responses and hands them to the engine.
//! However the stream ends, the engine receives a terminal `END_CONVERSATION` directive.

use crate::accumulate::DeltaAccumulator;
use crate::error::{ExecutorError, ExecutorResult};
use crate::mtls;
use crate::proto::{
    talk_request, talk_response, Configuration, HistoryEntry, Interruption, TalkRequest,
    TalkResponse, TalkServiceClient, UserMessage,
};
use crate::{Communication, Executor};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use talkgate_core::{
    ConnectRequest, Directive, InterruptionSource, Metric, Options, Packet, Stage, StreamTls,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;
use tonic::{Code, Status};
use tracing::{debug, info, instrument, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct StreamExecutor {
    endpoint: String,
    tls: StreamTls,
    outbound: Mutex<Option<mpsc::UnboundedSender<TalkRequest>>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    accumulator: Arc<DeltaAccumulator>,
}

impl StreamExecutor {
    pub fn new(endpoint: String, tls: StreamTls) -> Self {
        Self {
            endpoint,
            tls,
            outbound: Mutex::new(None),
            receiver: Mutex::new(None),
            cancel: CancellationToken::new(),
            accumulator: Arc::new(DeltaAccumulator::new()),
        }
    }

    fn uri(&self) -> String {
        if self.endpoint.contains("://") {
            return self.endpoint.clone();
        }
        match self.tls {
            StreamTls::Insecure => format!("http://{}", self.endpoint),
            StreamTls::Tls { .. } => format!("https://{}", self.endpoint),
        }
    }

    fn send(&self, request: talk_request::Request) -> ExecutorResult<()> {
        let guard = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(ExecutorError::NotInitialized)?;
        tx.send(TalkRequest {
            request: Some(request),
        })
        .map_err(|_| ExecutorError::Closed)
    }
}

fn flatten(options: &Options) -> HashMap<String, String> {
    options
        .iter()
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect()
}

fn configuration(comm: &dyn Communication, config: &ConnectRequest) -> Configuration {
    let identity = comm.identity();
    Configuration {
        assistant_id: identity.assistant_id,
        conversation_id: identity.conversation_id,
        provider_model_id: identity.provider_model_id,
        channel: config.channel.as_str().to_string(),
        args: flatten(&comm.args()),
        options: flatten(&comm.options()),
        history: comm
            .histories()
            .into_iter()
            .map(|m| HistoryEntry {
                role: m.role.as_str().to_string(),
                content: m.contents,
            })
            .collect(),
    }
}

/// Map one response onto the packet the engine should see.
pub(crate) fn to_packet(response: TalkResponse, acc: &DeltaAccumulator) -> Option<Packet> {
    use talk_response::Response;
    match response.response? {
        Response::Delta(chunk) => Some(acc.delta(&chunk.context_id, &chunk.text)),
        Response::Done(chunk) => Some(acc.done(&chunk.context_id, &chunk.text)),
        Response::Interruption(i) => {
            acc.discard(&i.context_id);
            Some(Packet::Interruption {
                context_id: i.context_id,
                source: if i.source.eq_ignore_ascii_case("vad") {
                    InterruptionSource::Vad
                } else {
                    InterruptionSource::Word
                },
            })
        }
        Response::Directive(d) => Some(Packet::Directive {
            context_id: d.context_id,
            directive: Directive::parse(&d.name),
            args: d
                .args
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect(),
        }),
        Response::Metrics(batch) => Some(Packet::Metric {
            context_id: batch.context_id,
            metrics: batch
                .metrics
                .into_iter()
                .map(|m| Metric::new(m.name, m.value, m.description))
                .collect(),
        }),
        Response::Error(e) => {
            warn!(code = e.code, message = %e.message, "executor reported an error");
            None
        }
    }
}

fn termination_reason(status: &Status) -> String {
    match status.code() {
        Code::Cancelled => "stream cancelled".to_string(),
        Code::Unavailable => format!("executor unavailable: {}", status.message()),
        code => format!("stream failed ({code:?}): {}", status.message()),
    }
}

/// Pump responses into the engine until the stream ends or `cancel` fires, then report
/// the end of the conversation.
pub(crate) async fn receive_loop<S>(
    comm: Arc<dyn Communication>,
    mut inbound: S,
    cancel: CancellationToken,
    acc: Arc<DeltaAccumulator>,
) where
    S: Stream<Item = Result<TalkResponse, Status>> + Unpin + Send,
{
    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break "executor closed".to_string(),
            next = inbound.next() => match next {
                None => break "stream ended".to_string(),
                Some(Err(status)) => break termination_reason(&status),
                Some(Ok(response)) => {
                    let Some(packet) = to_packet(response, &acc) else { continue };
                    if let Err(e) = comm.on_packet(packet).await {
                        debug!(error = %e, "engine stopped accepting packets");
                        return;
                    }
                }
            }
        }
    };
    info!(%reason, "executor stream terminated");
    let context_id = comm.identity().conversation_id.to_string();
    if let Err(e) = comm
        .on_packet(Packet::end_conversation(context_id, reason))
        .await
    {
        debug!(error = %e, "end of conversation not delivered");
    }
}

#[async_trait]
impl Executor for StreamExecutor {
    fn name(&self) -> &str {
        "stream"
    }

    #[instrument(skip_all, fields(endpoint = %self.endpoint))]
    async fn initialize(
        &self,
        comm: Arc<dyn Communication>,
        config: &ConnectRequest,
    ) -> ExecutorResult<()> {
        let tracer = comm.tracer();
        let span = tracer.start_span(Stage::Connect);
        tracer.add_attributes(span, &[("executor", self.name().to_string())]);

        let result = async {
            let mut endpoint = Endpoint::from_shared(self.uri())
                .map_err(|e| ExecutorError::Connect(e.to_string()))?
                .connect_timeout(CONNECT_TIMEOUT);
            if let Some(tls) = mtls::client_tls(&self.tls)? {
                endpoint = endpoint.tls_config(tls)?;
            }
            let channel = endpoint
                .connect()
                .await
                .map_err(|e| ExecutorError::Connect(format!("{}: {e}", self.endpoint)))?;

            let (tx, rx) = mpsc::unbounded_channel();
            tx.send(TalkRequest {
                request: Some(talk_request::Request::Configuration(configuration(
                    comm.as_ref(),
                    config,
                ))),
            })
            .map_err(|_| ExecutorError::Closed)?;

            let mut client = TalkServiceClient::new(channel);
            let inbound = client
                .talk(UnboundedReceiverStream::new(rx))
                .await?
                .into_inner();

            let handle = tokio::spawn(receive_loop(
                Arc::clone(&comm),
                inbound,
                self.cancel.clone(),
                Arc::clone(&self.accumulator),
            ));
            *self.receiver.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
            Ok(())
        }
        .await;

        tracer.end_span(span);
        if result.is_ok() {
            info!("✅ Executor stream open");
        }
        result
    }

    async fn execute(&self, comm: Arc<dyn Communication>, packet: Packet) -> ExecutorResult<()> {
        let tracer = comm.tracer();
        let span = tracer.start_span(Stage::Execute);
        tracer.add_attributes(span, &[("context_id", packet.context_id().to_string())]);
        let result = match packet {
            Packet::UserText { context_id, text } => {
                self.send(talk_request::Request::Message(UserMessage { context_id, text }))
            }
            Packet::Interruption { context_id, source } => {
                self.accumulator.discard(&context_id);
                self.send(talk_request::Request::Interruption(Interruption {
                    context_id,
                    source: source.as_str().to_string(),
                }))
            }
            other => {
                debug!(kind = other.kind(), "packet not forwarded to stream executor");
                Ok(())
            }
        };
        tracer.end_span(span);
        result
    }

    async fn close(&self) -> ExecutorResult<()> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.cancel.cancel();
        let handle = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "stream receiver task failed");
            }
        }
        Ok(())
    }
}
