//! The structured proposal decoded from one model response.
//!
//! A [`Decision`] exists for exactly one [`Step`][crate::Step]. Validation
//! happens once, at the parse boundary in `warden-kernel`; downstream code
//! trusts the field types here.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tool::canonical_json;

fn default_confidence() -> f64 {
    0.5
}

/// What the model intends to do next.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NextAction {
    /// Short title of the step, shown to the operator.
    #[serde(default)]
    pub title: String,
    /// One or two sentences describing the intended action.
    #[serde(default)]
    pub description: String,
}

/// A single proposed tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolCall {
    /// Tool name as listed under available tools.
    pub tool: String,
    /// Arguments keyed by the tool's declared parameter names.
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            tool: tool.into(),
            args,
        }
    }

    /// Canonical `{"a":..,"t":..}` encoding with sorted argument keys.
    pub fn signature(&self) -> String {
        let mut entry = Map::new();
        entry.insert("t".into(), Value::String(self.tool.clone()));
        entry.insert("a".into(), Value::Object(self.args.clone()));
        canonical_json(&Value::Object(entry))
    }

    /// String value of argument `key`, if present and a string.
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }
}

/// Structured "I am stuck" signal raised by the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HelpRequest {
    /// Information the model needs but does not have.
    #[serde(default)]
    pub missing_information: Vec<String>,
    /// Approaches already tried without success.
    #[serde(default)]
    pub attempted_approaches: Vec<String>,
    /// The concrete question for the operator.
    #[serde(default)]
    pub specific_question: String,
    /// Actions the operator could take, offered as reply options.
    #[serde(default)]
    pub suggested_human_actions: Vec<String>,
}

/// Next-step proposal decoded from model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Decision {
    /// The step the model is about to take.
    #[serde(default)]
    pub next_action: NextAction,
    /// Tools to call in this step, in order.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Set when the operator must weigh in before continuing.
    #[serde(default)]
    pub human_required: bool,
    /// Why operator input is needed.
    #[serde(default)]
    pub human_reason: Option<String>,
    /// Reply options offered to the operator.
    #[serde(default)]
    pub options: Vec<String>,
    /// Set when the goal is achieved and confirmed.
    #[serde(default)]
    pub task_complete: bool,
    /// Self-assessed confidence between 0 and 1.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// What the model learned from the previous step.
    #[serde(default)]
    pub reflection: Option<String>,
    /// Structured help request; forces operator involvement.
    #[serde(default)]
    pub help_request: Option<HelpRequest>,
    /// Set when the current subtask's success criteria are met.
    #[serde(default)]
    pub subtask_complete: bool,
}

impl Default for Decision {
    fn default() -> Self {
        Self {
            next_action: NextAction::default(),
            tool_calls: Vec::new(),
            human_required: false,
            human_reason: None,
            options: Vec::new(),
            task_complete: false,
            confidence: default_confidence(),
            reflection: None,
            help_request: None,
            subtask_complete: false,
        }
    }
}

impl Decision {
    /// Force operator involvement with the given reason and reply options.
    pub fn require_human(&mut self, reason: impl Into<String>, options: Vec<String>) {
        self.human_required = true;
        self.human_reason = Some(reason.into());
        self.options = options;
    }

    /// Title to show for the step, falling back to a generic label.
    pub fn title(&self) -> &str {
        if self.next_action.title.is_empty() {
            "Step"
        } else {
            &self.next_action.title
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn signature_is_stable_under_key_order() {
        let a = ToolCall::new("file_read", args(json!({"path": "a", "limit": 3})));
        let b = ToolCall::new("file_read", args(json!({"limit": 3, "path": "a"})));
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn signature_distinguishes_arguments() {
        let a = ToolCall::new("file_read", args(json!({"path": "a"})));
        let b = ToolCall::new("file_read", args(json!({"path": "b"})));
        assert_ne!(a.signature(), b.signature());
    }

    #[test]
    fn missing_fields_take_defaults() {
        let d: Decision = serde_json::from_str("{}").unwrap();
        assert!((d.confidence - 0.5).abs() < f64::EPSILON);
        assert!(!d.human_required);
        assert!(d.tool_calls.is_empty());
        assert_eq!(d.title(), "Step");
    }

    #[test]
    fn require_human_sets_reason_and_options() {
        let mut d = Decision::default();
        d.require_human("need input", vec!["abort".into()]);
        assert!(d.human_required);
        assert_eq!(d.human_reason.as_deref(), Some("need input"));
        assert_eq!(d.options, vec!["abort".to_string()]);
    }

    #[test]
    fn schema_mentions_every_field() {
        let schema = serde_json::to_value(schemars::schema_for!(Decision)).unwrap();
        let props = schema["properties"].as_object().unwrap();
        for field in ["tool_calls", "human_required", "confidence", "help_request"] {
            assert!(props.contains_key(field), "schema is missing {field}");
        }
    }
}
