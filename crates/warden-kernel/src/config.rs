//! [`FirewallConfig`] – tunables for the firewall, passed in at construction.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use warden_types::PermissionLevel;

use crate::policy_store::DEFAULT_KEY;

/// Repeat limits for loop detection.
///
/// The `low_confidence_*` limits apply when the average of the confidence
/// window is below `confidence_pivot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopThresholds {
    #[serde(default = "default_exact_repeat")]
    pub exact_repeat: u32,
    #[serde(default = "default_name_repeat")]
    pub name_repeat: u32,
    #[serde(default = "default_low_exact_repeat")]
    pub low_confidence_exact_repeat: u32,
    #[serde(default = "default_low_name_repeat")]
    pub low_confidence_name_repeat: u32,
    #[serde(default = "default_confidence_pivot")]
    pub confidence_pivot: f64,
}

fn default_exact_repeat() -> u32 {
    2
}
fn default_name_repeat() -> u32 {
    3
}
fn default_low_exact_repeat() -> u32 {
    1
}
fn default_low_name_repeat() -> u32 {
    2
}
fn default_confidence_pivot() -> f64 {
    0.5
}

impl Default for LoopThresholds {
    fn default() -> Self {
        Self {
            exact_repeat: default_exact_repeat(),
            name_repeat: default_name_repeat(),
            low_confidence_exact_repeat: default_low_exact_repeat(),
            low_confidence_name_repeat: default_low_name_repeat(),
            confidence_pivot: default_confidence_pivot(),
        }
    }
}

impl LoopThresholds {
    /// `(exact, name)` limits for the given average confidence.
    pub fn limits_for(&self, average_confidence: f64) -> (u32, u32) {
        if average_confidence >= self.confidence_pivot {
            (self.exact_repeat, self.name_repeat)
        } else {
            (self.low_confidence_exact_repeat, self.low_confidence_name_repeat)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// Number of recent confidence scores checked by the circuit breaker.
    #[serde(default = "default_low_confidence_window")]
    pub low_confidence_window: usize,
    #[serde(default = "default_low_confidence_threshold")]
    pub low_confidence_threshold: f64,
    #[serde(default)]
    pub loop_thresholds: LoopThresholds,
    /// Consecutive rejections of one tool before it is escalated.
    #[serde(default = "default_escalate_after_rejects")]
    pub escalate_after_rejects: u32,
    #[serde(default = "default_max_constraint_hints")]
    pub max_constraint_hints: usize,
    /// Admin permission layer. `default` and `remote_default` are fallbacks.
    #[serde(default = "default_tool_permissions")]
    pub tool_permissions: BTreeMap<String, PermissionLevel>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_readable_paths")]
    pub readable_paths: Vec<String>,
    /// Tools that only read. Their raw path arguments are checked against
    /// `readable_paths` before sandboxing; a miss needs approval.
    #[serde(default = "default_read_only_tools")]
    pub read_only_tools: Vec<String>,
}

fn default_low_confidence_window() -> usize {
    3
}
fn default_low_confidence_threshold() -> f64 {
    0.3
}
fn default_escalate_after_rejects() -> u32 {
    3
}
fn default_max_constraint_hints() -> usize {
    10
}
fn default_tool_permissions() -> BTreeMap<String, PermissionLevel> {
    BTreeMap::from([(DEFAULT_KEY.to_string(), PermissionLevel::Confirm)])
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}
fn default_readable_paths() -> Vec<String> {
    vec!["output/".to_string(), ".".to_string()]
}
fn default_read_only_tools() -> Vec<String> {
    vec!["file_read".to_string(), "file_list".to_string()]
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            low_confidence_window: default_low_confidence_window(),
            low_confidence_threshold: default_low_confidence_threshold(),
            loop_thresholds: LoopThresholds::default(),
            escalate_after_rejects: default_escalate_after_rejects(),
            max_constraint_hints: default_max_constraint_hints(),
            tool_permissions: default_tool_permissions(),
            output_dir: default_output_dir(),
            readable_paths: default_readable_paths(),
            read_only_tools: default_read_only_tools(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = FirewallConfig::default();
        assert_eq!(cfg.low_confidence_window, 3);
        assert!((cfg.low_confidence_threshold - 0.3).abs() < f64::EPSILON);
        assert_eq!(cfg.escalate_after_rejects, 3);
        assert_eq!(cfg.tool_permissions.get("default"), Some(&PermissionLevel::Confirm));
    }

    #[test]
    fn limits_tighten_under_low_confidence() {
        let t = LoopThresholds::default();
        assert_eq!(t.limits_for(0.5), (2, 3));
        assert_eq!(t.limits_for(0.49), (1, 2));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: FirewallConfig =
            serde_json::from_str(r#"{"escalate_after_rejects": 5, "tool_permissions": {"shell": "approve"}}"#)
                .unwrap();
        assert_eq!(cfg.escalate_after_rejects, 5);
        assert_eq!(cfg.low_confidence_window, 3);
        assert_eq!(cfg.tool_permissions.get("shell"), Some(&PermissionLevel::Approve));
        assert!(cfg.tool_permissions.get("default").is_none());
    }
}
