//! Prompt construction and model-output parsing for insight extraction
//!
//! Two-stage contract: an extraction pass returns tagged candidates as a
//! JSON array, then a filtering pass discards candidates unrelated to the
//! meeting subject. Model output is treated as hostile input — fenced,
//! prefixed, or chatty responses are tolerated, but anything that does not
//! contain a valid candidate array is a parse error, not an empty result.

use crate::insights::types::{InsightCandidate, NoteKind};
use serde_json::Value;

/// Render a transcript position as `[mm:ss]` for prompt text.
pub fn format_timestamp(ms: u64) -> String {
    let total_secs = ms / 1000;
    format!("[{:02}:{:02}]", total_secs / 60, total_secs % 60)
}

/// System prompt for the candidate-extraction stage.
pub fn extraction_system_prompt() -> String {
    r#"You extract structured insights from meeting transcript excerpts. Respond with a JSON array only, no prose.

Each element: {"kind": "summary|action_item|decision|key_point|topic|sentiment", "body": "...", "start_ms": <int>, "end_ms": <int>, "confidence": <0.0-1.0>}

Rules:
- start_ms/end_ms must point at the transcript lines the insight is grounded in; use the bracketed timestamps.
- body is one self-contained sentence; action_item bodies start with a verb.
- Emit nothing for small talk. An empty array is a valid answer."#
        .to_string()
}

/// User prompt for the candidate-extraction stage.
pub fn extraction_user_prompt(batch_text: &str) -> String {
    format!(
        "Transcript excerpt (timestamps are milliseconds into the meeting):\n\n{}\n\nJSON array of insight candidates:",
        batch_text
    )
}

/// Prompt for the subject-filter stage: which candidate indices survive.
pub fn subject_filter_prompt(subject: &str, candidates: &[InsightCandidate]) -> String {
    let listing = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. [{}] {}", i, c.kind, c.body))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"The meeting subject is: "{}"

Candidates:
{}

Return a JSON array of the indices that are relevant to the subject, e.g. [0,2,3]. Discard tangents, private asides, and anything unrelated. JSON array only."#,
        subject, listing
    )
}

/// Per-kind prompt for the orchestrated finalization pass.
pub fn section_prompt(kind: NoteKind, full_transcript: &str) -> (String, String) {
    let instruction = match kind {
        NoteKind::Summary => {
            "Write 1-3 summary entries covering the whole meeting, each a short paragraph."
        }
        NoteKind::ActionItem => {
            "List every concrete action item with an owner when one was named. Bodies start with a verb."
        }
        NoteKind::Decision => "List every decision that was actually made (not merely discussed).",
        NoteKind::KeyPoint => "List the key points an absent teammate would need.",
        NoteKind::Topic => "List the distinct topics discussed, one entry per topic.",
        NoteKind::Sentiment => {
            "Describe the overall sentiment and any notable shifts, 1-2 entries."
        }
    };
    let system = format!(
        r#"You produce final meeting notes of one kind from a complete transcript. Respond with a JSON array only.

Each element: {{"kind": "{}", "body": "...", "start_ms": <int>, "end_ms": <int>, "confidence": <0.0-1.0>}}

{}"#,
        kind.as_str(),
        instruction
    );
    let user = format!(
        "Full transcript (timestamps are milliseconds into the meeting):\n\n{}\n\nJSON array:",
        full_transcript
    );
    (system, user)
}

/// Pull the candidate array out of a model response, tolerating fences and
/// surrounding prose.
pub fn parse_candidates(response: &str) -> Result<Vec<InsightCandidate>, String> {
    let json = extract_json_array(response)
        .ok_or_else(|| format!("no JSON array in response: {:.120}", response))?;
    let values: Vec<Value> =
        serde_json::from_str(json).map_err(|e| format!("candidate array not valid JSON: {}", e))?;

    let mut candidates = Vec::with_capacity(values.len());
    for value in values {
        match serde_json::from_value::<InsightCandidate>(value.clone()) {
            Ok(candidate) => {
                if candidate.body.trim().is_empty() {
                    continue;
                }
                if !(0.0..=1.0).contains(&candidate.confidence) || candidate.end_ms < candidate.start_ms
                {
                    return Err(format!("candidate out of range: {}", value));
                }
                candidates.push(candidate);
            }
            // One malformed element poisons the batch; a silent skip would
            // hide a schema drift in the model output
            Err(e) => return Err(format!("malformed candidate {}: {}", value, e)),
        }
    }
    Ok(candidates)
}

/// Parse the index list from the subject-filter stage.
pub fn parse_kept_indices(response: &str, candidate_count: usize) -> Result<Vec<usize>, String> {
    let json = extract_json_array(response)
        .ok_or_else(|| format!("no JSON array in filter response: {:.120}", response))?;
    let indices: Vec<usize> =
        serde_json::from_str(json).map_err(|e| format!("filter indices not valid JSON: {}", e))?;
    if indices.iter().any(|&i| i >= candidate_count) {
        return Err(format!(
            "filter index out of range (candidates: {})",
            candidate_count
        ));
    }
    Ok(indices)
}

/// Find the outermost `[...]` in a response, skipping code fences.
fn extract_json_array(response: &str) -> Option<&str> {
    let trimmed = response.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```"))
        .unwrap_or(trimmed);
    let start = body.find('[')?;
    let end = body.rfind(']')?;
    (end > start).then(|| &body[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_render_as_minutes_seconds() {
        assert_eq!(format_timestamp(0), "[00:00]");
        assert_eq!(format_timestamp(135_000), "[02:15]");
        assert_eq!(format_timestamp(3_601_000), "[60:01]");
    }

    #[test]
    fn parses_clean_candidate_array() {
        let response = r#"[
            {"kind":"decision","body":"Use the new queue","start_ms":1000,"end_ms":9000,"confidence":0.9},
            {"kind":"action_item","body":"Write the migration plan","start_ms":9000,"end_ms":15000,"confidence":0.8}
        ]"#;
        let candidates = parse_candidates(response).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].kind, NoteKind::Decision);
    }

    #[test]
    fn parses_fenced_and_chatty_responses() {
        let response = "Here are the insights:\n```json\n[{\"kind\":\"topic\",\"body\":\"Hiring\",\"start_ms\":0,\"end_ms\":5000,\"confidence\":0.7}]\n```";
        let candidates = parse_candidates(response).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].body, "Hiring");
    }

    #[test]
    fn empty_array_is_a_valid_answer() {
        assert!(parse_candidates("[]").unwrap().is_empty());
    }

    #[test]
    fn malformed_candidate_is_an_error_not_a_skip() {
        let response = r#"[{"kind":"decision","body":"ok","start_ms":0,"end_ms":1,"confidence":0.5},
                           {"kind":"hallucination","body":"??","start_ms":0,"end_ms":1,"confidence":0.5}]"#;
        assert!(parse_candidates(response).is_err());
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        let response =
            r#"[{"kind":"topic","body":"x","start_ms":0,"end_ms":1000,"confidence":1.4}]"#;
        assert!(parse_candidates(response).is_err());
    }

    #[test]
    fn filter_indices_parse_and_bounds_check() {
        assert_eq!(parse_kept_indices("[0, 2]", 3).unwrap(), vec![0, 2]);
        assert!(parse_kept_indices("[5]", 3).is_err());
        assert!(parse_kept_indices("keep all of them", 3).is_err());
    }
}
