//! Text clean-up applied to each sentence before it reaches text-to-speech.

use crate::error::{TalkError, TalkResult};
use crate::options::Options;
use regex::Regex;
use serde_json::Value;

pub const PRONUNCIATION_OPTION: &str = "speaker.pronunciation.dictionary";

pub trait Synthesizer: Send + Sync {
    fn name(&self) -> &'static str;
    fn synthesize(&self, text: &str) -> String;
}

/// Strips markdown that a model tends to emit and that a voice should never read out.
pub struct NormalizeSynthesizer {
    link: Regex,
    heading: Regex,
    emphasis: Regex,
    whitespace: Regex,
}

impl NormalizeSynthesizer {
    pub fn new() -> TalkResult<Self> {
        Ok(Self {
            link: compile(r"\[([^\]]*)\]\([^)]*\)")?,
            heading: compile(r"(?m)^\s*#{1,6}\s*")?,
            emphasis: compile(r"(\*\*|__|\*|`{1,3}|~~)")?,
            whitespace: compile(r"\s+")?,
        })
    }
}

impl Synthesizer for NormalizeSynthesizer {
    fn name(&self) -> &'static str {
        "normalize"
    }

    fn synthesize(&self, text: &str) -> String {
        let text = self.link.replace_all(text, "$1");
        let text = self.heading.replace_all(&text, "");
        let text = self.emphasis.replace_all(&text, "");
        self.whitespace.replace_all(text.trim(), " ").into_owned()
    }
}

/// Applies the pronunciation dictionary and spells out symbols.
pub struct FormatSynthesizer {
    replacements: Vec<(Regex, String)>,
}

impl FormatSynthesizer {
    pub fn from_options(options: &Options) -> TalkResult<Self> {
        let mut replacements = Vec::new();
        if let Some(Value::Object(dictionary)) = options.get(PRONUNCIATION_OPTION) {
            for (word, spoken) in dictionary {
                let Some(spoken) = spoken.as_str() else {
                    continue;
                };
                let pattern = format!(r"(?i)\b{}\b", regex::escape(word));
                replacements.push((compile(&pattern)?, spoken.to_string()));
            }
        }
        for (symbol, spoken) in [("&", " and "), ("%", " percent"), ("@", " at ")] {
            replacements.push((compile(&regex::escape(symbol))?, spoken.to_string()));
        }
        Ok(Self { replacements })
    }
}

impl Synthesizer for FormatSynthesizer {
    fn name(&self) -> &'static str {
        "format"
    }

    fn synthesize(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (pattern, spoken) in &self.replacements {
            out = pattern.replace_all(&out, spoken.as_str()).into_owned();
        }
        out.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// Ordered synthesizers: normalize, then format.
pub struct SynthesizerChain {
    stages: Vec<Box<dyn Synthesizer>>,
}

impl SynthesizerChain {
    pub fn from_options(options: &Options) -> TalkResult<Self> {
        Ok(Self {
            stages: vec![
                Box::new(NormalizeSynthesizer::new()?),
                Box::new(FormatSynthesizer::from_options(options)?),
            ],
        })
    }

    pub fn run(&self, text: &str) -> String {
        self.stages
            .iter()
            .fold(text.to_string(), |acc, stage| stage.synthesize(&acc))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

fn compile(pattern: &str) -> TalkResult<Regex> {
    Regex::new(pattern).map_err(|e| TalkError::Validation(format!("synthesizer pattern: {e}")))
}
