//! Incremental sentence segmentation of streamed assistant text.
//!
//! The tokenizer holds one buffer for the current context. Text for another context
//! flushes the old buffer first, so sentences never bleed across turns. Boundary markers
//! come from the `speaker.sentence.boundaries` option; without them text is only
//! released on completion.

use crate::error::{TalkError, TalkResult};
use crate::options::Options;
use regex::Regex;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

pub const BOUNDARIES_OPTION: &str = "speaker.sentence.boundaries";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub context_id: String,
    pub text: String,
}

#[derive(Debug, Default)]
struct Buffer {
    context_id: String,
    text: String,
}

impl Buffer {
    fn flush_into(&mut self, out: &mut Vec<Sentence>) {
        let text = self.text.trim();
        if !text.is_empty() {
            out.push(Sentence {
                context_id: self.context_id.clone(),
                text: text.to_string(),
            });
        }
        self.text.clear();
    }

    fn drain_into(&mut self, boundary: &Regex, out: &mut Vec<Sentence>) {
        let mut consumed = 0;
        for m in boundary.find_iter(&self.text) {
            let sentence = self.text[consumed..m.end()].trim();
            if !sentence.is_empty() {
                out.push(Sentence {
                    context_id: self.context_id.clone(),
                    text: sentence.to_string(),
                });
            }
            consumed = m.end();
        }
        if consumed > 0 {
            self.text.drain(..consumed);
        }
    }
}

/// Sentence tokenizer for one session. Expects a single writer (the speak pipeline).
#[derive(Debug)]
pub struct SentenceTokenizer {
    boundary: Option<Regex>,
    buffer: Mutex<Buffer>,
}

impl SentenceTokenizer {
    pub fn new<S: AsRef<str>>(boundaries: &[S]) -> TalkResult<Self> {
        let parts: Vec<String> = boundaries
            .iter()
            .map(|b| b.as_ref().trim())
            .filter(|b| !b.is_empty())
            .map(regex::escape)
            .collect();
        let boundary = if parts.is_empty() {
            debug!("no sentence boundaries configured, emitting on completion only");
            None
        } else {
            let pattern = format!(r"({})\s*", parts.join("|"));
            Some(Regex::new(&pattern).map_err(|e| {
                TalkError::Validation(format!("invalid sentence boundary pattern: {e}"))
            })?)
        };
        Ok(Self {
            boundary,
            buffer: Mutex::new(Buffer::default()),
        })
    }

    pub fn from_options(options: &Options) -> TalkResult<Self> {
        match options.get_list(BOUNDARIES_OPTION) {
            Ok(boundaries) => Self::new(&boundaries),
            Err(TalkError::NotFound(_)) => Self::new::<&str>(&[]),
            Err(e) => Err(e),
        }
    }

    pub fn has_boundaries(&self) -> bool {
        self.boundary.is_some()
    }

    /// Append `text` for `context_id` and return every sentence that became complete.
    pub fn tokenize(&self, context_id: &str, text: &str, completed: bool) -> Vec<Sentence> {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = Vec::new();
        if buffer.context_id != context_id {
            buffer.flush_into(&mut out);
            buffer.context_id = context_id.to_string();
        }
        buffer.text.push_str(text);
        if let Some(boundary) = &self.boundary {
            buffer.drain_into(boundary, &mut out);
        }
        if completed {
            buffer.flush_into(&mut out);
        }
        out
    }

    /// Release whatever is buffered for the current context.
    pub fn flush(&self) -> Vec<Sentence> {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = Vec::new();
        buffer.flush_into(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(sentences: &[Sentence]) -> Vec<&str> {
        sentences.iter().map(|s| s.text.as_str()).collect()
    }

    #[test]
    fn streamed_sentences_are_released_at_boundaries() {
        let t = SentenceTokenizer::new(&[".", "!", "?"]).unwrap();
        let first = t.tokenize("c1", "Hello there. How are", false);
        assert_eq!(texts(&first), vec!["Hello there."]);
        let second = t.tokenize("c1", " you?", true);
        assert_eq!(texts(&second), vec!["How are you?"]);
        assert!(t.flush().is_empty());
    }

    #[test]
    fn several_sentences_in_one_chunk() {
        let t = SentenceTokenizer::new(&[".", "!"]).unwrap();
        let out = t.tokenize("c1", "One. Two! Thr", false);
        assert_eq!(texts(&out), vec!["One.", "Two!"]);
        assert_eq!(texts(&t.flush()), vec!["Thr"]);
    }

    #[test]
    fn context_switch_flushes_previous_buffer() {
        let t = SentenceTokenizer::new(&["."]).unwrap();
        assert!(t.tokenize("a", "partial without end", false).is_empty());
        let out = t.tokenize("b", "Next", false);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].context_id, "a");
        assert_eq!(out[0].text, "partial without end");
        let rest = t.flush();
        assert_eq!(rest[0].context_id, "b");
        assert_eq!(rest[0].text, "Next");
    }

    #[test]
    fn flushing_empty_buffer_is_noop() {
        let t = SentenceTokenizer::new(&["."]).unwrap();
        assert!(t.flush().is_empty());
        assert!(t.tokenize("a", "", true).is_empty());
    }

    #[test]
    fn without_boundaries_only_completion_emits() {
        let t = SentenceTokenizer::from_options(&Options::new()).unwrap();
        assert!(!t.has_boundaries());
        assert!(t.tokenize("a", "Hello. There.", false).is_empty());
        assert_eq!(texts(&t.tokenize("a", " Bye.", true)), vec!["Hello. There. Bye."]);
    }

    #[test]
    fn boundaries_are_read_from_options() {
        let opts = Options::new().with(BOUNDARIES_OPTION, serde_json::json!(["|", "?"]));
        let t = SentenceTokenizer::from_options(&opts).unwrap();
        assert_eq!(texts(&t.tokenize("a", "a|b?c", false)), vec!["a|", "b?"]);
    }
}
