//! Loosely-typed key/value options attached to assistants and sessions.
//!
//! Keys are dotted paths such as `speaker.sentence.boundaries` or
//! `microphone.eos.timeout`. Lookups are typed on the way out so callers never have to
//! match on `serde_json::Value` themselves.

use crate::error::{TalkError, TalkResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Separator used when a list option is supplied as a single string.
pub const LIST_SEPARATOR: &str = "<|||>";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Options(BTreeMap<String, Value>);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn get_string(&self, key: &str) -> TalkResult<String> {
        match self.0.get(key) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(Value::Bool(b)) => Ok(b.to_string()),
            Some(other) => Err(TalkError::Validation(format!(
                "option {key} is not a string: {other}"
            ))),
            None => Err(TalkError::NotFound(format!("option {key}"))),
        }
    }

    pub fn get_u64(&self, key: &str) -> TalkResult<u64> {
        match self.0.get(key) {
            Some(Value::Number(n)) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
                .ok_or_else(|| TalkError::Validation(format!("option {key} is not unsigned"))),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map_err(|_| TalkError::Validation(format!("option {key} is not a number: {s}"))),
            Some(other) => Err(TalkError::Validation(format!(
                "option {key} is not a number: {other}"
            ))),
            None => Err(TalkError::NotFound(format!("option {key}"))),
        }
    }

    pub fn get_bool(&self, key: &str) -> TalkResult<bool> {
        match self.0.get(key) {
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(TalkError::Validation(format!("option {key} is not a bool: {s}"))),
            },
            Some(other) => Err(TalkError::Validation(format!(
                "option {key} is not a bool: {other}"
            ))),
            None => Err(TalkError::NotFound(format!("option {key}"))),
        }
    }

    /// A list option: either a JSON array of strings or one string joined by
    /// [`LIST_SEPARATOR`]. Blank entries are dropped.
    pub fn get_list(&self, key: &str) -> TalkResult<Vec<String>> {
        let raw: Vec<String> = match self.0.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(s)) => s.split(LIST_SEPARATOR).map(str::to_string).collect(),
            Some(other) => {
                return Err(TalkError::Validation(format!(
                    "option {key} is not a list: {other}"
                )))
            }
            None => return Err(TalkError::NotFound(format!("option {key}"))),
        };
        Ok(raw
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect())
    }

    /// Overlay `other` on top of `self`; keys in `other` win.
    pub fn merged(&self, other: &Options) -> Options {
        let mut out = self.clone();
        for (k, v) in other.iter() {
            out.0.insert(k.clone(), v.clone());
        }
        out
    }
}

impl FromIterator<(String, Value)> for Options {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Options(iter.into_iter().collect())
    }
}

impl IntoIterator for Options {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn list_accepts_array_and_separated_string() {
        let opts = Options::new()
            .with("a", json!([".", " ", "!"]))
            .with("b", format!(".{LIST_SEPARATOR}?{LIST_SEPARATOR} "));
        assert_eq!(opts.get_list("a").unwrap(), vec![".", "!"]);
        assert_eq!(opts.get_list("b").unwrap(), vec![".", "?"]);
        assert!(opts.get_list("missing").is_err());
    }

    #[test]
    fn numbers_parse_from_strings() {
        let opts = Options::new().with("t", "1500").with("n", 7);
        assert_eq!(opts.get_u64("t").unwrap(), 1500);
        assert_eq!(opts.get_u64("n").unwrap(), 7);
        assert_eq!(opts.get_string("n").unwrap(), "7");
    }

    #[test]
    fn merged_prefers_overlay() {
        let base = Options::new().with("k", "base").with("only", true);
        let over = Options::new().with("k", "over");
        let merged = base.merged(&over);
        assert_eq!(merged.get_string("k").unwrap(), "over");
        assert!(merged.get_bool("only").unwrap());
    }
}
