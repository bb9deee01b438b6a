//! Fail-safe decoding of model output into a [`Decision`].
//!
//! [`parse_decision`] never fails. When no usable structured block is found
//! the result is a decision that requires a human, so malformed output can
//! only ever stop the agent, never let it act.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use warden_types::{Decision, HelpRequest, NextAction, ToolCall};

/// Reason shown to the operator when the model output cannot be decoded.
pub const CLARIFICATION_REASON: &str = "The model's response could not be read as a decision. \
Review the response and tell the agent how to proceed.";

static DECISION_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```decision\s*\n(.*?)\n\s*```").expect("decision block pattern is valid")
});

/// Options offered alongside [`CLARIFICATION_REASON`].
pub fn clarification_options() -> Vec<String> {
    vec!["continue".to_string(), "abort".to_string()]
}

/// Decode `text` into a [`Decision`].
///
/// Tries, in order: a fenced block tagged `decision`, then the first JSON
/// object in the text that carries a `task_complete` key. If neither yields
/// an object, returns the fail-safe decision.
pub fn parse_decision(text: &str) -> Decision {
    if let Some(caps) = DECISION_BLOCK.captures(text) {
        let body = caps.get(1).map_or("", |m| m.as_str()).trim();
        match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(map)) => return decision_from_map(&map),
            Ok(_) => debug!("decision block is not a JSON object"),
            Err(e) => debug!(error = %e, "decision block is not valid JSON"),
        }
    }

    if let Some(map) = find_object_with_key(text, "task_complete") {
        debug!("decision recovered from bare JSON object");
        return decision_from_map(&map);
    }

    warn!(chars = text.len(), "no decision found in model output, requiring human review");
    fail_safe()
}

/// The decision returned whenever model output cannot be decoded.
pub fn fail_safe() -> Decision {
    let mut decision = Decision {
        next_action: NextAction {
            title: "Clarification needed".to_string(),
            description: String::new(),
        },
        ..Decision::default()
    };
    decision.require_human(CLARIFICATION_REASON, clarification_options());
    decision
}

/// Body of the first fenced block tagged `tag` (three backticks followed by
/// the tag), trimmed.
pub fn extract_fenced_block<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let pattern = format!(r"(?s)```{}\s*\n(.*?)\n\s*```", regex::escape(tag));
    let re = Regex::new(&pattern).ok()?;
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
}

/// First JSON object embedded in `text` whose top level contains `key`.
pub fn find_object_with_key(text: &str, key: &str) -> Option<Map<String, Value>> {
    for (start, _) in text.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        if let Some(Ok(Value::Object(map))) = stream.next()
            && map.contains_key(key)
        {
            return Some(map);
        }
    }
    None
}

// ─────────────────────────────────────────────────────────────────────────────
// Lenient field extraction
// ─────────────────────────────────────────────────────────────────────────────

fn decision_from_map(map: &Map<String, Value>) -> Decision {
    Decision {
        next_action: next_action(map.get("next_action")),
        tool_calls: tool_calls(map.get("tool_calls")),
        human_required: map.get("human_required").is_some_and(truthy),
        human_reason: non_empty(map.get("human_reason")),
        options: string_list(map.get("options")),
        task_complete: map.get("task_complete").is_some_and(truthy),
        confidence: confidence(map.get("confidence")),
        reflection: non_empty(map.get("reflection")),
        help_request: help_request(map.get("help_request")),
        subtask_complete: map.get("subtask_complete").is_some_and(truthy),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    let text = text_of(value?);
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .map(text_of)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn confidence(value: Option<&Value>) -> f64 {
    let raw = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match raw {
        Some(c) if c.is_finite() => c.clamp(0.0, 1.0),
        _ => 0.5,
    }
}

fn next_action(value: Option<&Value>) -> NextAction {
    match value {
        Some(Value::Object(map)) => NextAction {
            title: map.get("title").map(text_of).unwrap_or_default(),
            description: map.get("description").map(text_of).unwrap_or_default(),
        },
        Some(Value::String(s)) => NextAction {
            title: s.clone(),
            description: String::new(),
        },
        _ => NextAction::default(),
    }
}

fn tool_calls(value: Option<&Value>) -> Vec<ToolCall> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let entry = item.as_object()?;
            let name = entry
                .get("tool")
                .or_else(|| entry.get("name"))
                .and_then(Value::as_str)?
                .trim();
            if name.is_empty() {
                return None;
            }
            let args = entry
                .get("args")
                .or_else(|| entry.get("parameters"))
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            Some(ToolCall::new(name, args))
        })
        .collect()
}

fn help_request(value: Option<&Value>) -> Option<HelpRequest> {
    let map = value?.as_object()?;
    if map.is_empty() {
        return None;
    }
    Some(HelpRequest {
        missing_information: string_list(map.get("missing_information")),
        attempted_approaches: string_list(map.get("attempted_approaches")),
        specific_question: map
            .get("specific_question")
            .map(text_of)
            .unwrap_or_default(),
        suggested_human_actions: string_list(map.get("suggested_human_actions")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fenced(tag: &str, body: &str) -> String {
        format!("Thinking first.\n```{tag}\n{body}\n```\ntrailing words")
    }

    #[test]
    fn malformed_inputs_always_require_a_human() {
        let samples = [
            String::new(),
            "just prose, no structure".to_string(),
            fenced("decision", "not json at all"),
            fenced("decision", "[1, 2, 3]"),
            fenced("decision", "{\"next_action\": "),
            "{\"task_complete\": ".to_string(),
            "{ unbalanced { braces".to_string(),
            "```decision\n".to_string(),
            "\u{0}\u{1}binary-ish".to_string(),
        ];
        for sample in samples {
            let d = parse_decision(&sample);
            assert!(d.human_required, "expected fail-safe for {sample:?}");
            assert_eq!(d.human_reason.as_deref(), Some(CLARIFICATION_REASON));
            assert_eq!(d.options, clarification_options());
            assert!(d.tool_calls.is_empty());
            assert!(!d.task_complete);
        }
    }

    #[test]
    fn parses_fenced_decision() {
        let text = fenced(
            "decision",
            r#"{
                "next_action": {"title": "Read notes", "description": "open the file"},
                "tool_calls": [{"tool": "file_read", "args": {"path": "notes.md"}}],
                "confidence": 0.8,
                "reflection": "first look"
            }"#,
        );
        let d = parse_decision(&text);
        assert!(!d.human_required);
        assert_eq!(d.next_action.title, "Read notes");
        assert_eq!(d.tool_calls.len(), 1);
        assert_eq!(d.tool_calls[0].str_arg("path"), Some("notes.md"));
        assert!((d.confidence - 0.8).abs() < 1e-9);
        assert_eq!(d.reflection.as_deref(), Some("first look"));
    }

    #[test]
    fn accepts_name_and_parameters_aliases() {
        let text = fenced(
            "decision",
            r#"{"tool_calls": [{"name": "search", "parameters": {"q": "rust"}}, {"args": {}}]}"#,
        );
        let d = parse_decision(&text);
        assert_eq!(d.tool_calls.len(), 1, "nameless entries are dropped");
        assert_eq!(d.tool_calls[0].tool, "search");
        assert_eq!(d.tool_calls[0].str_arg("q"), Some("rust"));
    }

    #[test]
    fn falls_back_to_bare_object_with_task_complete() {
        let text = r#"Here you go: {"task_complete": true, "confidence": 0.9, "next_action": {"title": "Done"}} bye"#;
        let d = parse_decision(text);
        assert!(d.task_complete);
        assert!(!d.human_required);
        assert_eq!(d.next_action.title, "Done");
    }

    #[test]
    fn bare_object_may_nest() {
        let text = r#"{"task_complete": false, "tool_calls": [{"tool": "t", "args": {"deep": {"x": 1}}}]}"#;
        let d = parse_decision(text);
        assert_eq!(d.tool_calls.len(), 1);
        assert_eq!(d.tool_calls[0].args["deep"]["x"], 1);
    }

    #[test]
    fn confidence_is_clamped_and_defaulted() {
        assert!((parse_decision(&fenced("decision", r#"{"confidence": 7}"#)).confidence - 1.0).abs() < 1e-9);
        assert!(parse_decision(&fenced("decision", r#"{"confidence": -2}"#)).confidence.abs() < 1e-9);
        assert!((parse_decision(&fenced("decision", r#"{"confidence": "0.25"}"#)).confidence - 0.25).abs() < 1e-9);
        assert!((parse_decision(&fenced("decision", r#"{"confidence": "high"}"#)).confidence - 0.5).abs() < 1e-9);
        assert!((parse_decision(&fenced("decision", "{}")).confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn string_booleans_and_next_action_strings() {
        let d = parse_decision(&fenced(
            "decision",
            r#"{"human_required": "true", "next_action": "Ask the user", "options": "yes"}"#,
        ));
        assert!(d.human_required);
        assert_eq!(d.next_action.title, "Ask the user");
        assert_eq!(d.options, vec!["yes".to_string()]);
    }

    #[test]
    fn help_request_is_decoded() {
        let d = parse_decision(&fenced(
            "decision",
            r#"{"help_request": {"specific_question": "Which account?", "missing_information": ["account id"], "suggested_human_actions": ["give the id"]}}"#,
        ));
        let help = d.help_request.expect("help request");
        assert_eq!(help.specific_question, "Which account?");
        assert_eq!(help.missing_information, vec!["account id".to_string()]);
        assert_eq!(help.suggested_human_actions, vec!["give the id".to_string()]);
    }

    #[test]
    fn empty_help_request_is_ignored() {
        let d = parse_decision(&fenced("decision", r#"{"help_request": {}}"#));
        assert!(d.help_request.is_none());
    }

    #[test]
    fn extracts_other_fenced_blocks() {
        let text = "```plan\n{\"subtasks\": []}\n```";
        assert_eq!(extract_fenced_block(text, "plan"), Some("{\"subtasks\": []}"));
        assert_eq!(extract_fenced_block(text, "memory"), None);
    }
}
