//! Text-only transport over the process's stdin and stdout.

use async_trait::async_trait;
use talkgate_core::{AudioConfig, ConnectRequest, Inbound, Outbound, Streamer, TalkResult};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin, Stdout};
use tokio::sync::Mutex;

/// Typing `/quit` (or closing stdin) hangs up.
const QUIT: &str = "/quit";

pub struct ConsoleStreamer {
    configuration: std::sync::Mutex<Option<ConnectRequest>>,
    lines: Mutex<Lines<BufReader<Stdin>>>,
    out: Mutex<Stdout>,
}

impl ConsoleStreamer {
    /// `configuration` is delivered as the first inbound frame.
    pub fn new(configuration: ConnectRequest) -> Self {
        Self {
            configuration: std::sync::Mutex::new(Some(configuration)),
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
            out: Mutex::new(tokio::io::stdout()),
        }
    }
}

#[async_trait]
impl Streamer for ConsoleStreamer {
    async fn recv(&self) -> TalkResult<Option<Inbound>> {
        let configuration = self
            .configuration
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(request) = configuration {
            return Ok(Some(Inbound::Configuration(request)));
        }

        let mut lines = self.lines.lock().await;
        loop {
            let Some(line) = lines.next_line().await? else {
                return Ok(None);
            };
            let line = line.trim();
            if line == QUIT {
                return Ok(None);
            }
            if !line.is_empty() {
                return Ok(Some(Inbound::Text(line.to_string())));
            }
        }
    }

    async fn send(&self, frame: Outbound) -> TalkResult<()> {
        let mut line = serde_json::to_vec(&frame)?;
        line.push(b'\n');
        let mut out = self.out.lock().await;
        out.write_all(&line).await?;
        out.flush().await?;
        Ok(())
    }

    fn config(&self) -> Option<AudioConfig> {
        None
    }
}
