//! Synthesis requests and their normalized form.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::fingerprint::Fingerprint;
use super::{Result, SynthesisError};

/// Longest voice id accepted before the request is rejected.
pub const MAX_VOICE_ID_LEN: usize = 128;

/// A scalar synthesis option (`seed`, `promptId`, `temperature`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl OptionValue {
    /// Parse a command-line style value: booleans, integers and floats are
    /// recognised, anything else is kept as a string.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed {
            "true" => return Self::Bool(true),
            "false" => return Self::Bool(false),
            _ => {}
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Self::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            if f.is_finite() {
                return Self::Float(f);
            }
        }
        Self::Str(raw.to_string())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Value::from(*f),
            Self::Str(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// A text-to-speech request as handed over by a command handler.
///
/// Immutable once built; options are kept in a sorted map so their
/// insertion order never affects the fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    text: String,
    voice_id: String,
    #[serde(default)]
    options: BTreeMap<String, OptionValue>,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>, voice_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice_id: voice_id.into(),
            options: BTreeMap::new(),
        }
    }

    /// Return a copy of the request with one more option set.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn voice_id(&self) -> &str {
        &self.voice_id
    }

    pub fn options(&self) -> &BTreeMap<String, OptionValue> {
        &self.options
    }

    /// Validate and canonicalize the request.
    pub fn normalize(&self) -> Result<NormalizedRequest> {
        let text = self.text.trim();
        if text.is_empty() {
            return Err(SynthesisError::Validation("text must not be empty".to_string()));
        }

        let voice_id = self.voice_id.trim();
        validate_voice_id(voice_id)?;

        let mut options = BTreeMap::new();
        for (key, value) in &self.options {
            let key = key.trim();
            if key.is_empty() {
                return Err(SynthesisError::Validation(
                    "option names must not be empty".to_string(),
                ));
            }
            if let OptionValue::Float(f) = value {
                if !f.is_finite() {
                    return Err(SynthesisError::Validation(format!(
                        "option '{key}' must be a finite number"
                    )));
                }
            }
            if options.insert(key.to_string(), value.clone()).is_some() {
                return Err(SynthesisError::Validation(format!(
                    "option '{key}' is given more than once"
                )));
            }
        }

        let fingerprint = Fingerprint::from_canonical(text, voice_id, &options);
        Ok(NormalizedRequest {
            text: text.to_string(),
            voice_id: voice_id.to_string(),
            options,
            fingerprint,
        })
    }
}

fn validate_voice_id(voice_id: &str) -> Result<()> {
    if voice_id.is_empty() {
        return Err(SynthesisError::Validation("voice id must not be empty".to_string()));
    }
    if voice_id.len() > MAX_VOICE_ID_LEN {
        return Err(SynthesisError::Validation(format!(
            "voice id longer than {MAX_VOICE_ID_LEN} characters"
        )));
    }
    if let Some(bad) = voice_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(SynthesisError::Validation(format!(
            "voice id contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

/// A validated request with its fingerprint precomputed.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRequest {
    text: String,
    voice_id: String,
    options: BTreeMap<String, OptionValue>,
    fingerprint: Fingerprint,
}

impl NormalizedRequest {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn voice_id(&self) -> &str {
        &self.voice_id
    }

    pub fn options(&self) -> &BTreeMap<String, OptionValue> {
        &self.options
    }

    pub fn option(&self, key: &str) -> Option<&OptionValue> {
        self.options.get(key)
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_trims_text_and_voice() {
        let req = SynthesisRequest::new("  hello world \n", " v1 ");
        let normalized = req.normalize().unwrap();
        assert_eq!(normalized.text(), "hello world");
        assert_eq!(normalized.voice_id(), "v1");
    }

    #[test]
    fn test_normalize_rejects_empty_text() {
        let err = SynthesisRequest::new("   ", "v1").normalize().unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_normalize_rejects_bad_voice_ids() {
        for voice in ["", "   ", "has space", "slash/id", "emoji🙂"] {
            let err = SynthesisRequest::new("hi", voice).normalize().unwrap_err();
            assert!(
                matches!(err, SynthesisError::Validation(_)),
                "voice {voice:?} should be rejected"
            );
        }
        let long = "a".repeat(MAX_VOICE_ID_LEN + 1);
        assert!(SynthesisRequest::new("hi", long).normalize().is_err());
    }

    #[test]
    fn test_normalize_accepts_uuid_like_voice_id() {
        let req = SynthesisRequest::new("hi", "3f2a9c1e-77b0-4c1d-9a55-0b6c2d1e8f00");
        assert!(req.normalize().is_ok());
    }

    #[test]
    fn test_normalize_rejects_non_finite_option() {
        let req = SynthesisRequest::new("hi", "v1").with_option("temperature", f64::NAN);
        assert!(req.normalize().is_err());
    }

    #[test]
    fn test_normalize_rejects_blank_option_key() {
        let req = SynthesisRequest::new("hi", "v1").with_option("  ", 1i64);
        assert!(req.normalize().is_err());
    }

    #[test]
    fn test_normalize_rejects_keys_equal_after_trim() {
        let req = SynthesisRequest::new("hello", "v1")
            .with_option("seed", 1i64)
            .with_option(" seed", 2i64);
        let err = req.normalize().unwrap_err();
        assert!(matches!(err, SynthesisError::Validation(ref m) if m.contains("seed")));
    }

    #[test]
    fn test_option_value_parse() {
        assert_eq!(OptionValue::parse("true"), OptionValue::Bool(true));
        assert_eq!(OptionValue::parse("-1"), OptionValue::Int(-1));
        assert_eq!(OptionValue::parse("0.5"), OptionValue::Float(0.5));
        assert_eq!(OptionValue::parse("default"), OptionValue::Str("default".into()));
        assert_eq!(OptionValue::parse("NaN"), OptionValue::Str("NaN".into()));
    }

    #[test]
    fn test_option_value_deserializes_untagged() {
        let value: BTreeMap<String, OptionValue> =
            serde_json::from_str(r#"{"a": true, "b": 3, "c": 1.5, "d": "x"}"#).unwrap();
        assert_eq!(value["a"], OptionValue::Bool(true));
        assert_eq!(value["b"], OptionValue::Int(3));
        assert_eq!(value["c"], OptionValue::Float(1.5));
        assert_eq!(value["d"], OptionValue::Str("x".into()));
    }
}
