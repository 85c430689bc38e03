//! # Talkgate Session
//!
//! The talk session engine. A [`TalkEngine`] binds one transport ([`talkgate_core::Streamer`])
//! to one conversation and drives it through
//! `Idle → Connecting → Active → Disconnecting → Closed`:
//!
//! ```text
//!  transport ──audio──▶ listen ──▶ STT ──transcripts──▶ end-of-speech ─┐
//!      │                  └──▶ VAD ──activities (barge-in, breaks)─────┤
//!      └──text───────────────────────────────────────────────────────▶ on_packet ──▶ executor
//!                                                                          ▲            │
//!  transport ◀──text/audio── speak ◀── tokenizer ◀── deltas/done ── dispatcher ◀─packets┘
//! ```
//!
//! Executor output is delivered through one ordered queue, so a turn's deltas are always
//! handled before its done. Persistence runs on a bounded background worker and never
//! gates the conversation.

mod behavior;
pub mod deps;
mod dispatch;
pub mod engine;
mod lifecycle;
mod link;
mod listen;
mod recorder;
mod speak;
mod talk;
#[cfg(test)]
mod testing;
mod turns;

pub use deps::SessionDeps;
pub use engine::TalkEngine;
