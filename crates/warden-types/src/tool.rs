//! Tool schemas, results and canonical argument encoding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Description of one tool the agent may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema object describing the accepted arguments.
    #[serde(default)]
    pub parameters: Value,
    /// `true` when the tool was discovered from a remote tool server rather
    /// than shipped as a built-in.
    #[serde(default)]
    pub remote: bool,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            remote: false,
        }
    }

    /// Mark this schema as coming from a remote tool source.
    pub fn remote(mut self) -> Self {
        self.remote = true;
        self
    }

    /// Names of the declared argument properties, if the schema has any.
    pub fn declared_properties(&self) -> Option<Vec<&str>> {
        let props = self.parameters.get("properties")?.as_object()?;
        if props.is_empty() {
            return None;
        }
        Some(props.keys().map(String::as_str).collect())
    }
}

/// Outcome status reported by a tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Error,
    /// The operator declined the call.
    Rejected,
    /// The firewall refused the call before dispatch.
    Blocked,
    #[serde(other)]
    Unknown,
}

/// Result of one tool execution as returned by the tool capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub status: ToolStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(output: impl Into<Value>) -> Self {
        Self {
            status: ToolStatus::Ok,
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            output: None,
            error: Some(message.into()),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Rejected,
            output: None,
            error: Some(message.into()),
        }
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Blocked,
            output: None,
            error: Some(message.into()),
        }
    }
}

/// What the step log keeps about one dispatched (or refused) tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub tool: String,
    pub status: ToolStatus,
    pub summary: String,
}

/// Encode `value` as compact JSON with object keys sorted at every depth.
///
/// Two argument maps that differ only in key order produce the same string,
/// which makes the result usable as a call signature.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&sorted(value)).unwrap_or_default()
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let ordered: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, sorted(v))).collect();
            let mut out = serde_json::Map::new();
            for (k, v) in ordered {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_ignores_key_order() {
        let a = json!({"b": 1, "a": {"z": true, "y": [ {"d": 1, "c": 2} ]}});
        let b = json!({"a": {"y": [ {"c": 2, "d": 1} ], "z": true}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert!(canonical_json(&a).starts_with("{\"a\""));
    }

    #[test]
    fn declared_properties_requires_non_empty_properties() {
        let none = ToolSchema::new("x", "", json!({"type": "object"}));
        assert!(none.declared_properties().is_none());

        let empty = ToolSchema::new("x", "", json!({"properties": {}}));
        assert!(empty.declared_properties().is_none());

        let some = ToolSchema::new("x", "", json!({"properties": {"path": {"type": "string"}}}));
        assert_eq!(some.declared_properties(), Some(vec!["path"]));
    }

    #[test]
    fn unknown_status_deserializes_to_unknown() {
        let result: ToolResult =
            serde_json::from_str(r#"{"status": "timeout", "error": "slow"}"#).unwrap();
        assert_eq!(result.status, ToolStatus::Unknown);
        assert_eq!(result.error.as_deref(), Some("slow"));
    }
}
