//! Asterisk AudioSocket listener: every TCP connection is one inbound call.

use anyhow::Context;
use std::sync::Arc;
use talkgate_core::{MediaChannel, Options, RecordingTracer};
use talkgate_session::{SessionDeps, TalkEngine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const PROVIDER: &str = "audiosocket";
const MEDIA_BUFFER: usize = 64;

/// Accept calls until the task is dropped.
pub async fn serve(
    listener: TcpListener,
    deps: SessionDeps,
    assistant_id: u64,
    api_key: String,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "📞 AudioSocket listener ready");
    loop {
        let (tcp, peer) = listener.accept().await.context("accept call")?;
        let request = Options::new()
            .with("assistant_id", assistant_id)
            .with("auth_token", api_key.clone())
            .with("from", peer.to_string());
        let deps = deps.clone();
        tokio::spawn(async move {
            if let Err(e) = answer(tcp, deps, request).await {
                error!(%peer, error = %e, "call failed");
            }
        });
    }
}

async fn answer(tcp: TcpStream, deps: SessionDeps, request: Options) -> anyhow::Result<()> {
    let context_id = deps
        .telephony
        .receive_call(PROVIDER, &request)
        .await
        .context("register call")?;
    let (mut reader, mut writer) = tcp.into_split();
    let (socket_in, inbound) = mpsc::channel(MEDIA_BUFFER);
    let (outbound, mut socket_out) = mpsc::channel::<Vec<u8>>(MEDIA_BUFFER);

    let pump_in = tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if socket_in.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "call socket read failed");
                    break;
                }
            }
        }
    });
    let pump_out = tokio::spawn(async move {
        while let Some(bytes) = socket_out.recv().await {
            if let Err(e) = writer.write_all(&bytes).await {
                debug!(error = %e, "caller gone, media dropped");
                break;
            }
        }
    });

    let result = TalkEngine::answer_call(
        deps,
        Arc::new(RecordingTracer::new()),
        &context_id,
        MediaChannel { inbound, outbound },
    )
    .await;
    pump_in.abort();
    let engine = result.context("serve call")?;
    if let Some(identity) = engine.identity() {
        info!(conversation_id = identity.conversation_id, "call ended");
    }
    // releases the outbound sender so the writer drains and stops
    drop(engine);
    if let Err(e) = pump_out.await {
        warn!(error = %e, "media writer failed");
    }
    Ok(())
}
