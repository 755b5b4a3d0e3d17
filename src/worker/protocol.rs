//! Worker line protocol
//!
//! Workers report on stderr/stdout one message per line, in one of two
//! accepted shapes (both are valid during the migration window):
//!
//! - `[TAG] field field message…` progress lines, e.g.
//!   `[PROGRESS] loading 42 downloading segmentation model`
//! - a JSON object with a `type` discriminator, e.g.
//!   `{"type":"segment","speaker_id":"SPEAKER_0",…}`
//!
//! This module classifies lines without assigning domain meaning; the
//! diarizer and transcriber clients deserialize the JSON payloads into
//! their own closed event enums. Lines matching neither shape are returned
//! as [`ControlLine::Unrecognized`] so the owner can log them — they are
//! never dropped silently.

use serde_json::Value;

/// One classified protocol line
#[derive(Debug, Clone, PartialEq)]
pub enum ControlLine {
    /// `[PROGRESS] <phase> <percent> <message>`
    Progress {
        phase: String,
        percent: f32,
        message: String,
    },
    /// `[ERROR] <id> <message>`
    Error { id: String, message: String },
    /// `[COMPLETE] <id>`
    Complete { id: String },
    /// `[LICENSE_REQUIRED] <id> <url>`
    LicenseRequired { id: String, url: String },
    /// JSON object carrying a `type` discriminator; payload is left for the
    /// owning client to deserialize
    Event { kind: String, payload: Value },
    /// Anything else — surfaced, not swallowed
    Unrecognized(String),
}

/// Classify a single protocol line.
pub fn parse_line(line: &str) -> ControlLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ControlLine::Unrecognized(String::new());
    }

    if trimmed.starts_with('[') {
        return parse_tag_line(trimmed);
    }

    if trimmed.starts_with('{') {
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => {
                if let Some(kind) = value.get("type").and_then(Value::as_str) {
                    return ControlLine::Event {
                        kind: kind.to_string(),
                        payload: value,
                    };
                }
                return ControlLine::Unrecognized(trimmed.to_string());
            }
            Err(_) => return ControlLine::Unrecognized(trimmed.to_string()),
        }
    }

    ControlLine::Unrecognized(trimmed.to_string())
}

/// Parse a `[TAG] …` line. Walks the line once: tag, then the tag-specific
/// fixed fields, then the free-text remainder.
fn parse_tag_line(line: &str) -> ControlLine {
    let close = match line.find(']') {
        Some(i) => i,
        None => return ControlLine::Unrecognized(line.to_string()),
    };
    let tag = &line[1..close];
    let rest = line[close + 1..].trim_start();
    let mut fields = rest.splitn(3, ' ');

    match tag {
        "PROGRESS" => {
            let phase = fields.next().unwrap_or_default().to_string();
            let percent = fields
                .next()
                .and_then(|p| p.trim_end_matches('%').parse::<f32>().ok());
            let message = fields.next().unwrap_or_default().trim().to_string();
            match percent {
                Some(percent) if !phase.is_empty() => ControlLine::Progress {
                    phase,
                    percent,
                    message,
                },
                _ => ControlLine::Unrecognized(line.to_string()),
            }
        }
        "ERROR" => {
            let id = fields.next().unwrap_or_default().to_string();
            if id.is_empty() {
                return ControlLine::Unrecognized(line.to_string());
            }
            let message = rest[id.len()..].trim().to_string();
            ControlLine::Error { id, message }
        }
        "COMPLETE" => {
            let id = fields.next().unwrap_or_default().to_string();
            if id.is_empty() {
                return ControlLine::Unrecognized(line.to_string());
            }
            ControlLine::Complete { id }
        }
        "LICENSE_REQUIRED" => {
            let id = fields.next().unwrap_or_default().to_string();
            let url = fields.next().unwrap_or_default().trim().to_string();
            if id.is_empty() || url.is_empty() {
                return ControlLine::Unrecognized(line.to_string());
            }
            ControlLine::LicenseRequired { id, url }
        }
        _ => ControlLine::Unrecognized(line.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_line() {
        let line = parse_line("[PROGRESS] loading 42 downloading segmentation model");
        assert_eq!(
            line,
            ControlLine::Progress {
                phase: "loading".to_string(),
                percent: 42.0,
                message: "downloading segmentation model".to_string(),
            }
        );
    }

    #[test]
    fn parses_progress_without_message() {
        let line = parse_line("[PROGRESS] warmup 100");
        match line {
            ControlLine::Progress { phase, percent, message } => {
                assert_eq!(phase, "warmup");
                assert_eq!(percent, 100.0);
                assert!(message.is_empty());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn parses_error_line() {
        let line = parse_line("[ERROR] pyannote-community-1 model files not found");
        assert_eq!(
            line,
            ControlLine::Error {
                id: "pyannote-community-1".to_string(),
                message: "model files not found".to_string(),
            }
        );
    }

    #[test]
    fn parses_complete_and_license_lines() {
        assert_eq!(
            parse_line("[COMPLETE] diarize-batch"),
            ControlLine::Complete {
                id: "diarize-batch".to_string()
            }
        );
        assert_eq!(
            parse_line("[LICENSE_REQUIRED] pyannote https://example.com/gate"),
            ControlLine::LicenseRequired {
                id: "pyannote".to_string(),
                url: "https://example.com/gate".to_string(),
            }
        );
    }

    #[test]
    fn parses_json_event_envelope() {
        let line = parse_line(r#"{"type":"segment","speaker_id":"SPEAKER_0","start_ms":0}"#);
        match line {
            ControlLine::Event { kind, payload } => {
                assert_eq!(kind, "segment");
                assert_eq!(payload["speaker_id"], "SPEAKER_0");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn json_without_type_is_unrecognized() {
        match parse_line(r#"{"speaker_id":"SPEAKER_0"}"#) {
            ControlLine::Unrecognized(_) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn garbage_is_unrecognized_not_dropped() {
        match parse_line("Traceback (most recent call last):") {
            ControlLine::Unrecognized(text) => {
                assert!(text.starts_with("Traceback"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        match parse_line("[WHATEVER] 1 2 3") {
            ControlLine::Unrecognized(_) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn malformed_progress_is_unrecognized() {
        match parse_line("[PROGRESS] loading notanumber msg") {
            ControlLine::Unrecognized(_) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}
