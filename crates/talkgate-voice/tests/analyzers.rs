//! Analyzer behaviour through the public trait objects, as the session engine drives them.

use std::sync::Arc;
use std::time::Duration;
use talkgate_core::{Activity, AudioConfig, AudioEncoding};
use talkgate_voice::{
    AudioAnalyzer, EnergyClassifier, FrameClassifier, SilenceEndOfSpeech, TextAnalyzer,
    TurnConfig, VadAnalyzer,
};
use tokio::sync::mpsc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[tokio::test]
async fn telephony_silence_produces_no_activity() {
    init_tracing();
    let analyzer: Arc<dyn AudioAnalyzer> = Arc::new(VadAnalyzer::new(
        AudioConfig::telephony(),
        2,
        TurnConfig::default(),
    ));
    let (tx, mut rx) = mpsc::unbounded_channel();
    analyzer.initialize(tx).await.unwrap();

    // 2s of mu-law digital silence in 20ms frames
    for _ in 0..100 {
        tokio_test::assert_ok!(analyzer.analyze(&[0xff; 160]).await);
    }
    analyzer.close().await.unwrap();

    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn unsupported_rate_falls_back_to_energy_detection() {
    init_tracing();
    let audio = AudioConfig {
        sample_rate: 22050,
        encoding: AudioEncoding::Linear16,
        channels: 1,
    };
    let analyzer = VadAnalyzer::new(audio, 2, TurnConfig::default());
    let (tx, _rx) = mpsc::unbounded_channel();
    analyzer.initialize(tx).await.unwrap();
    analyzer.analyze(&[0u8; 882]).await.unwrap();
    analyzer.close().await.unwrap();
}

#[tokio::test]
async fn second_initialize_is_rejected() {
    let analyzer = VadAnalyzer::with_classifier(
        AudioConfig::default(),
        TurnConfig::default(),
        Box::new(|| Ok(Box::new(EnergyClassifier { threshold: 0.1 }) as Box<dyn FrameClassifier>)),
    );
    let (tx, _rx) = mpsc::unbounded_channel();
    analyzer.initialize(tx.clone()).await.unwrap();
    assert!(analyzer.initialize(tx).await.is_err());
    analyzer.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn end_of_speech_restarts_after_each_utterance() {
    init_tracing();
    let eos: Arc<dyn TextAnalyzer> = Arc::new(SilenceEndOfSpeech::new(Duration::from_millis(400)));
    let (tx, mut rx) = mpsc::unbounded_channel();
    eos.initialize(tx).await.unwrap();

    eos.analyze("hello", true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    eos.analyze("what time is it", true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut transcripts = Vec::new();
    while let Ok(activity) = rx.try_recv() {
        if let Activity::SpeechEnd { transcript, .. } = activity {
            transcripts.push(transcript);
        }
    }
    assert_eq!(transcripts, vec!["hello", "what time is it"]);
    eos.close().await.unwrap();
}
