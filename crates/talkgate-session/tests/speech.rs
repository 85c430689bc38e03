//! Audio in, audio out: the listen and speak pipelines over fake providers.

mod common;

use common::{eventually, principal, voice_assistant, Harness, ASSISTANT_ID};
use talkgate_core::{
    AudioConfig, Channel, ConnectRequest, ConversationStore, Outbound, Recording, Role,
};

/// The single recording saved when the session closed.
async fn saved_recording(h: &Harness) -> Recording {
    let conversation_id = h.engine.identity().unwrap().conversation_id;
    let mut record = h
        .store
        .get_conversation(ASSISTANT_ID, conversation_id)
        .await
        .unwrap();
    assert_eq!(record.recordings.len(), 1);
    record.recordings.remove(0)
}

async fn connected_voice() -> Harness {
    let h = Harness::new(voice_assistant(), Some(AudioConfig::default()));
    h.engine
        .connect(&principal(), ConnectRequest::new(ASSISTANT_ID, Channel::Phone))
        .await
        .unwrap();
    h
}

#[tokio::test]
async fn audio_frames_reach_the_transcriber_in_order() {
    let h = connected_voice().await;
    for i in 0..40u8 {
        h.engine.listen_audio(&[i; 320]).await.unwrap();
    }

    eventually(|| h.speech.frames().len() == 40).await;
    for (i, frame) in h.speech.frames().iter().enumerate() {
        assert_eq!(frame, &vec![i as u8; 320]);
    }
    h.engine.disconnect().await.unwrap();

    let recording = saved_recording(&h).await;
    assert_eq!(recording.user_audio.len(), 40 * 320);
    assert_eq!(&recording.user_audio[..320], &[0u8; 320][..]);
    assert_eq!(&recording.user_audio[39 * 320..], &[39u8; 320][..]);
    assert!(recording.assistant_audio.is_empty());
}

#[tokio::test]
async fn finished_utterance_becomes_one_turn() {
    let mut h = connected_voice().await;
    h.speech.transcribe("book a", false);
    h.speech.transcribe("book a table", true);
    h.speech.transcribe("for two", true);

    let mut echoed = Vec::new();
    let reply = loop {
        match h.next_frame().await {
            Outbound::UserTranscript { text, completed } => echoed.push((text, completed)),
            Outbound::Text {
                text,
                completed: true,
                ..
            } => break text,
            _ => {}
        }
    };
    assert_eq!(
        echoed,
        vec![
            ("book a".to_string(), false),
            ("book a table".to_string(), true),
            ("for two".to_string(), true),
        ]
    );
    assert_eq!(reply, "ok: book a table for two");

    eventually(|| h.engine.session_state().history_len() == 2).await;
    let users: Vec<_> = h
        .engine
        .session_state()
        .histories()
        .into_iter()
        .filter(|m| m.role == Role::User)
        .collect();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].contents, "book a table for two");
}

#[tokio::test]
async fn replies_are_spoken_sentence_by_sentence_without_markdown() {
    let mut h = connected_voice().await;
    h.engine
        .listen_text("**two** people. thanks!")
        .await
        .unwrap();

    let mut audio = Vec::new();
    loop {
        if let Outbound::Audio {
            data, completed, ..
        } = h.next_frame().await
        {
            if completed {
                break;
            }
            audio.push(String::from_utf8(data).unwrap());
        }
    }

    assert_eq!(h.speech.spoken(), vec!["ok: two people.", "thanks!"]);
    assert_eq!(audio, h.speech.spoken());

    eventually(|| h.engine.session_state().history_len() == 2).await;
    h.engine.disconnect().await.unwrap();
    let recording = saved_recording(&h).await;
    assert_eq!(recording.assistant_audio, b"ok: two people.thanks!".to_vec());
    assert_eq!(recording.transcript.len(), 2);
}

#[tokio::test]
async fn text_only_channel_skips_speech_providers() {
    let mut h = Harness::new(voice_assistant(), None);
    h.engine
        .connect(&principal(), ConnectRequest::new(ASSISTANT_ID, Channel::Web))
        .await
        .unwrap();
    h.engine.listen_audio(&[1; 320]).await.unwrap();
    h.engine.listen_text("hello").await.unwrap();
    assert_eq!(h.next_reply().await, "ok: hello");

    assert!(h.speech.frames().is_empty());
    assert!(h.speech.spoken().is_empty());
    assert!(!h
        .drain()
        .iter()
        .any(|f| matches!(f, Outbound::Audio { .. })));
}
