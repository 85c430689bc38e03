//! Analyzer contracts and the VAD-backed audio analyzer.

use crate::audio::{decode_samples, rms_energy};
use crate::error::{VoiceError, VoiceResult};
use crate::turn::{TurnConfig, TurnTracker, Window};
use crate::vad::{EnergyClassifier, FrameClassifier, VadConfig, VadDetector};
use async_trait::async_trait;
use std::sync::mpsc as std_mpsc;
use std::sync::{Mutex, PoisonError};
use std::thread;
use talkgate_core::{Activity, AudioConfig};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Consumes audio frames and reports speech activity.
#[async_trait]
pub trait AudioAnalyzer: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&self, activities: mpsc::UnboundedSender<Activity>) -> VoiceResult<()>;

    async fn analyze(&self, frame: &[u8]) -> VoiceResult<()>;

    async fn close(&self) -> VoiceResult<()>;
}

/// Consumes transcript text and reports utterance boundaries.
#[async_trait]
pub trait TextAnalyzer: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&self, activities: mpsc::UnboundedSender<Activity>) -> VoiceResult<()>;

    async fn analyze(&self, text: &str, completed: bool) -> VoiceResult<()>;

    async fn close(&self) -> VoiceResult<()>;
}

type ClassifierFactory =
    Box<dyn FnOnce() -> VoiceResult<Box<dyn FrameClassifier>> + Send + 'static>;

struct Running {
    frames: std_mpsc::Sender<Vec<u8>>,
    worker: thread::JoinHandle<()>,
}

/// Audio analyzer running voice activity detection on its own thread.
///
/// The WebRTC handle cannot cross threads, so the classifier is built on the worker
/// thread and frames are handed over in order through a channel.
pub struct VadAnalyzer {
    audio: AudioConfig,
    turn: TurnConfig,
    threshold: f32,
    factory: Mutex<Option<ClassifierFactory>>,
    running: Mutex<Option<Running>>,
}

impl VadAnalyzer {
    /// WebRTC VAD for supported sample rates, energy detection otherwise.
    pub fn new(audio: AudioConfig, mode: u8, turn: TurnConfig) -> Self {
        let vad = VadConfig {
            sample_rate: audio.sample_rate,
            mode,
        };
        let factory: ClassifierFactory = Box::new(move || {
            match VadDetector::new(&vad) {
                Ok(detector) => Ok(Box::new(detector) as Box<dyn FrameClassifier>),
                Err(VoiceError::VadInit(reason)) => {
                    warn!(%reason, "WebRTC VAD unavailable, falling back to energy detection");
                    Ok(Box::new(EnergyClassifier { threshold: 0.02 }) as Box<dyn FrameClassifier>)
                }
                Err(e) => Err(e),
            }
        });
        Self::with_classifier(audio, turn, factory)
    }

    pub fn with_classifier(audio: AudioConfig, turn: TurnConfig, factory: ClassifierFactory) -> Self {
        Self {
            audio,
            turn,
            threshold: 0.5,
            factory: Mutex::new(Some(factory)),
            running: Mutex::new(None),
        }
    }
}

fn run_detection(
    audio: AudioConfig,
    turn: TurnConfig,
    threshold: f32,
    mut classifier: Box<dyn FrameClassifier>,
    frames: std_mpsc::Receiver<Vec<u8>>,
    activities: mpsc::UnboundedSender<Activity>,
) {
    let window = (audio.sample_rate as usize * 30) / 1000;
    let rate = audio.sample_rate as f64;
    let mut tracker = TurnTracker::new(turn, threshold);
    let mut pending: Vec<i16> = Vec::with_capacity(window * 2);
    let mut consumed: u64 = 0;

    while let Ok(frame) = frames.recv() {
        let samples = match decode_samples(&frame, audio.encoding) {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "undecodable frame skipped");
                continue;
            }
        };
        pending.extend_from_slice(&samples);
        while pending.len() >= window {
            let chunk: Vec<i16> = pending.drain(..window).collect();
            let start = consumed as f64 / rate;
            consumed += window as u64;
            let probability = match classifier.classify(&chunk) {
                Ok(p) => p,
                Err(e) => {
                    debug!(error = %e, "VAD window skipped");
                    continue;
                }
            };
            let activity = tracker.process(Window {
                start,
                end: consumed as f64 / rate,
                probability,
                energy: rms_energy(&chunk),
            });
            if let Some(activity) = activity {
                if activities.send(activity).is_err() {
                    debug!("activity receiver gone, stopping VAD thread");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl AudioAnalyzer for VadAnalyzer {
    fn name(&self) -> &str {
        "vad"
    }

    async fn initialize(&self, activities: mpsc::UnboundedSender<Activity>) -> VoiceResult<()> {
        let factory = self
            .factory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| VoiceError::VadInit("analyzer already initialized".into()))?;
        let (frames_tx, frames_rx) = std_mpsc::channel::<Vec<u8>>();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<VoiceResult<()>>();
        let audio = self.audio;
        let turn = self.turn.clone();
        let threshold = self.threshold;

        let worker = thread::Builder::new()
            .name("talkgate-vad".into())
            .spawn(move || {
                let classifier = match factory() {
                    Ok(c) => {
                        let _ = ready_tx.send(Ok(()));
                        c
                    }
                    Err(e) => {
                        error!(error = %e, "VAD init failed");
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                run_detection(audio, turn, threshold, classifier, frames_rx, activities);
            })
            .map_err(|e| VoiceError::VadInit(e.to_string()))?;

        ready_rx
            .await
            .map_err(|_| VoiceError::VadInit("VAD thread exited during init".into()))??;

        info!(sample_rate = audio.sample_rate, "VAD analyzer listening (30ms windows)");
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(Running {
            frames: frames_tx,
            worker,
        });
        Ok(())
    }

    async fn analyze(&self, frame: &[u8]) -> VoiceResult<()> {
        let guard = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let running = guard
            .as_ref()
            .ok_or_else(|| VoiceError::NotInitialized("vad".into()))?;
        running
            .frames
            .send(frame.to_vec())
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }

    async fn close(&self) -> VoiceResult<()> {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Running { frames, worker }) = running {
            drop(frames);
            tokio::task::spawn_blocking(move || worker.join())
                .await
                .map_err(|e| VoiceError::VadProcessing(e.to_string()))?
                .map_err(|_| VoiceError::VadProcessing("VAD thread panicked".into()))?;
        }
        Ok(())
    }
}
