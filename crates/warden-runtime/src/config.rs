//! [`RuntimeConfig`] – loop tunables, passed to every
//! [`Orchestrator`][crate::orchestrator::Orchestrator] at construction.
//!
//! Every field has a serde default, so a partial TOML or JSON document is
//! enough to override a single value.

use serde::{Deserialize, Serialize};
use warden_kernel::FirewallConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Review the plan whenever a subtask completes.
    #[serde(default = "default_true")]
    pub checkpoint_on_subtask_complete: bool,
    /// Compress findings into working memory whenever a subtask completes.
    #[serde(default = "default_true")]
    pub compress_after_subtask: bool,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            checkpoint_on_subtask_complete: true,
            compress_after_subtask: true,
        }
    }
}

/// Thresholds for turning approval history into stored preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceConfig {
    #[serde(default = "default_min_observations")]
    pub min_observations: u32,
    #[serde(default = "default_avoid_reject_rate")]
    pub avoid_reject_rate: f64,
    #[serde(default = "default_trust_approve_rate")]
    pub trust_approve_rate: f64,
    #[serde(default = "default_trust_min_observations")]
    pub trust_min_observations: u32,
}

impl Default for PreferenceConfig {
    fn default() -> Self {
        Self {
            min_observations: default_min_observations(),
            avoid_reject_rate: default_avoid_reject_rate(),
            trust_approve_rate: default_trust_approve_rate(),
            trust_min_observations: default_trust_min_observations(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Estimated token budget of the task state before compression.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_keep_recent_findings")]
    pub keep_recent_findings: usize,
    #[serde(default = "default_tool_summary_chars")]
    pub tool_summary_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            keep_recent_findings: default_keep_recent_findings(),
            tool_summary_chars: default_tool_summary_chars(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Step budget; 0 disables it.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Reflect every N steps; 0 disables reflection.
    #[serde(default = "default_reflection_interval")]
    pub reflection_interval: u32,
    #[serde(default = "default_hesitation_threshold_secs")]
    pub hesitation_threshold_secs: f64,
    /// Capacity of the perception confidence window.
    #[serde(default = "default_confidence_window")]
    pub confidence_window: usize,
    /// Memories retrieved per prompt.
    #[serde(default = "default_memory_limit")]
    pub memory_limit: usize,
    #[serde(default)]
    pub planning: PlanningConfig,
    #[serde(default)]
    pub preferences: PreferenceConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub firewall: FirewallConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            reflection_interval: default_reflection_interval(),
            hesitation_threshold_secs: default_hesitation_threshold_secs(),
            confidence_window: default_confidence_window(),
            memory_limit: default_memory_limit(),
            planning: PlanningConfig::default(),
            preferences: PreferenceConfig::default(),
            context: ContextConfig::default(),
            firewall: FirewallConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_steps() -> u32 {
    50
}
fn default_reflection_interval() -> u32 {
    5
}
fn default_hesitation_threshold_secs() -> f64 {
    30.0
}
fn default_confidence_window() -> usize {
    warden_kernel::perception::DEFAULT_CONFIDENCE_WINDOW
}
fn default_memory_limit() -> usize {
    3
}
fn default_min_observations() -> u32 {
    3
}
fn default_avoid_reject_rate() -> f64 {
    0.7
}
fn default_trust_approve_rate() -> f64 {
    0.1
}
fn default_trust_min_observations() -> u32 {
    5
}
fn default_max_tokens() -> usize {
    8000
}
fn default_keep_recent_findings() -> usize {
    3
}
fn default_tool_summary_chars() -> usize {
    1500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, RuntimeConfig::default());
        assert_eq!(cfg.max_steps, 50);
        assert_eq!(cfg.confidence_window, 10);
        assert!(cfg.planning.enabled);
    }

    #[test]
    fn nested_sections_override_independently() {
        let cfg: RuntimeConfig = serde_json::from_str(
            r#"{"planning": {"enabled": false}, "firewall": {"low_confidence_window": 4}}"#,
        )
        .unwrap();
        assert!(!cfg.planning.enabled);
        assert!(cfg.planning.compress_after_subtask);
        assert_eq!(cfg.firewall.low_confidence_window, 4);
        assert_eq!(cfg.firewall.escalate_after_rejects, 3);
    }
}
