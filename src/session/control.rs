//! # Control Channel
//!
//! The control channel carries `KEY>value` text tokens, e.g.
//! `NAME>alice PERSONALITY>cheerful GENDER>female SOURCEMATERIAL>notes`.
//!
//! ## Parsing Rules:
//! - A marker is a run of upper-case ASCII letters followed by `>`
//! - A value runs up to the next marker or the end of the message, trimmed
//! - Text before the first marker is ignored
//! - A message with no marker at all is a protocol error
//!
//! Session metadata accumulates across messages; a session is ready for audio
//! processing once every required key has been seen.

use crate::error::{EngineError, EngineResult};
use regex::{Captures, Regex};
use serde::Serialize;
use std::sync::LazyLock;

/// Sent to the client once the segmenter is running.
pub const TRANSCRIBER_WARMED_UP: &str = "<TRANSCRIBERWARMEDUP>";

pub const KEY_NAME: &str = "NAME";
pub const KEY_PERSONALITY: &str = "PERSONALITY";
pub const KEY_GENDER: &str = "GENDER";
pub const KEY_SOURCE_MATERIAL: &str = "SOURCEMATERIAL";

/// A run of upper-case ASCII letters followed by `>`.
static MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Z]+)>").expect("control marker pattern compiles"));

/// Extract every `KEY>value` pair in order of appearance.
pub fn parse_control_message(message: &str) -> EngineResult<Vec<(String, String)>> {
    let markers: Vec<Captures<'_>> = MARKER.captures_iter(message).collect();
    if markers.is_empty() {
        return Err(EngineError::Protocol(format!(
            "no KEY> marker in control message ({} bytes)",
            message.len()
        )));
    }

    // A value runs from the end of its marker to the start of the next one
    let pairs = markers
        .iter()
        .enumerate()
        .map(|(index, captures)| {
            let value_start = captures.get(0).map_or(0, |m| m.end());
            let value_end = markers
                .get(index + 1)
                .and_then(|next| next.get(0))
                .map_or(message.len(), |m| m.start());
            (
                captures[1].to_string(),
                message[value_start..value_end].trim().to_string(),
            )
        })
        .collect();

    Ok(pairs)
}

/// Persona fields passed through to the response backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionMetadata {
    pub name: String,
    pub personality: String,
    pub gender: String,
    pub source_material: String,
}

/// Accumulates metadata fields across control messages.
#[derive(Debug, Clone, Default)]
pub struct MetadataBuilder {
    name: Option<String>,
    personality: Option<String>,
    gender: Option<String>,
    source_material: Option<String>,
}

impl MetadataBuilder {
    /// Record the known keys among `pairs`. Later values overwrite earlier ones.
    ///
    /// ## Returns:
    /// The number of known keys applied
    pub fn apply(&mut self, pairs: &[(String, String)]) -> usize {
        let mut applied = 0;
        for (key, value) in pairs {
            let slot = match key.as_str() {
                KEY_NAME => &mut self.name,
                KEY_PERSONALITY => &mut self.personality,
                KEY_GENDER => &mut self.gender,
                KEY_SOURCE_MATERIAL => &mut self.source_material,
                _ => continue,
            };
            *slot = Some(value.clone());
            applied += 1;
        }
        applied
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Required keys not yet seen.
    pub fn missing(&self) -> Vec<&'static str> {
        [
            (KEY_NAME, self.name.is_none()),
            (KEY_PERSONALITY, self.personality.is_none()),
            (KEY_GENDER, self.gender.is_none()),
            (KEY_SOURCE_MATERIAL, self.source_material.is_none()),
        ]
        .into_iter()
        .filter_map(|(key, missing)| missing.then_some(key))
        .collect()
    }

    /// Complete metadata, once every required key is present.
    pub fn build(&self) -> Option<SessionMetadata> {
        Some(SessionMetadata {
            name: self.name.clone()?,
            personality: self.personality.clone()?,
            gender: self.gender.clone()?,
            source_material: self.source_material.clone()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(message: &str) -> Vec<(String, String)> {
        parse_control_message(message).unwrap()
    }

    #[test]
    fn test_parse_full_metadata_message() {
        let parsed = pairs("NAME>alice PERSONALITY>cheerful and kind GENDER>female SOURCEMATERIAL>notes.txt");
        assert_eq!(
            parsed,
            vec![
                ("NAME".to_string(), "alice".to_string()),
                ("PERSONALITY".to_string(), "cheerful and kind".to_string()),
                ("GENDER".to_string(), "female".to_string()),
                ("SOURCEMATERIAL".to_string(), "notes.txt".to_string()),
            ]
        );
    }

    #[test]
    fn test_marker_inside_lowercase_word_splits_value() {
        let parsed = pairs("NAME>bobGENDER>male");
        assert_eq!(parsed[0], ("NAME".to_string(), "bob".to_string()));
        assert_eq!(parsed[1], ("GENDER".to_string(), "male".to_string()));
    }

    #[test]
    fn test_uppercase_without_arrow_stays_in_value() {
        let parsed = pairs("NAME>DJ Alice  ");
        assert_eq!(parsed, vec![("NAME".to_string(), "DJ Alice".to_string())]);
    }

    #[test]
    fn test_empty_value_and_leading_text() {
        let parsed = pairs("hello NAME>   GENDER>x");
        assert_eq!(parsed[0], ("NAME".to_string(), String::new()));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_no_marker_is_protocol_error() {
        assert!(matches!(
            parse_control_message("just some words"),
            Err(EngineError::Protocol(_))
        ));
        assert!(parse_control_message("").is_err());
        assert!(parse_control_message("lower>case").is_err());
    }

    #[test]
    fn test_marker_is_the_uppercase_run_touching_the_arrow() {
        let parsed = pairs("AB CD>v xNAME>a>b");
        assert_eq!(
            parsed,
            vec![
                ("CD".to_string(), "v x".to_string()),
                ("NAME".to_string(), "a>b".to_string()),
            ]
        );
    }

    #[test]
    fn test_non_ascii_values_survive() {
        let parsed = pairs("NAME>José PERSONALITY>😀 upbeat");
        assert_eq!(parsed[0].1, "José");
        assert_eq!(parsed[1].1, "😀 upbeat");
    }

    #[test]
    fn test_metadata_accumulates_across_messages() {
        let mut builder = MetadataBuilder::default();
        assert_eq!(builder.apply(&pairs("NAME>alice COLOR>blue")), 1);
        assert!(builder.build().is_none());
        assert_eq!(builder.missing(), vec![KEY_PERSONALITY, KEY_GENDER, KEY_SOURCE_MATERIAL]);

        builder.apply(&pairs("PERSONALITY>dry GENDER>f SOURCEMATERIAL>none"));
        let metadata = builder.build().unwrap();
        assert_eq!(metadata.name, "alice");
        assert_eq!(metadata.source_material, "none");
        assert!(builder.missing().is_empty());
    }
}
