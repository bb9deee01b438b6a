//! [`PerceptionBus`] – behavioral signal recorder.
//!
//! Records approval outcomes, confidence scores, tool-result shapes and
//! stagnation hints, and exposes aggregate [`PerceptionStats`]. It never
//! decides anything; the firewall is the only component that turns these
//! numbers into action.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use warden_types::{ToolResult, ToolStatus, canonical_json};

/// Number of confidence scores kept by default.
pub const DEFAULT_CONFIDENCE_WINDOW: usize = 10;

/// Phrases in reflection text that suggest the agent is not progressing.
const STAGNATION_INDICATORS: [&str; 6] = [
    "no progress",
    "not making progress",
    "stuck",
    "same result",
    "going in circles",
    "repeated",
];

// ─────────────────────────────────────────────────────────────────────────────
// Classification enums
// ─────────────────────────────────────────────────────────────────────────────

/// Shape of one tool result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    Success,
    Error,
    Empty,
    Partial,
}

impl ResultClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultClass::Success => "success",
            ResultClass::Error => "error",
            ResultClass::Empty => "empty",
            ResultClass::Partial => "partial",
        }
    }

    /// Bracketed tag prefixed to merged tool findings, e.g. `[error]`.
    pub fn tag(&self) -> String {
        format!("[{}]", self.as_str())
    }
}

/// How a tool output compares with the previous output of the same call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatStatus {
    /// First time this exact call was seen.
    Unseen,
    Same,
    Changed,
}

impl RepeatStatus {
    /// Note appended to the merged finding.
    pub fn note(&self) -> &'static str {
        match self {
            RepeatStatus::Unseen => "",
            RepeatStatus::Same => " [SAME as previous call - no new information]",
            RepeatStatus::Changed => " [CHANGED from previous call]",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PerceptionStats
// ─────────────────────────────────────────────────────────────────────────────

/// Aggregate statistics read by the firewall.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerceptionStats {
    pub approvals: BTreeMap<String, u32>,
    pub rejections: BTreeMap<String, u32>,
    pub consecutive_rejects: BTreeMap<String, u32>,
    /// Seconds the operator took to answer, per tool.
    pub approval_latencies: BTreeMap<String, Vec<f64>>,
    /// Most recent confidence scores, oldest first.
    pub confidence_window: Vec<f64>,
    pub stagnation_count: u32,
}

impl PerceptionStats {
    pub fn consecutive_rejects(&self, tool: &str) -> u32 {
        self.consecutive_rejects.get(tool).copied().unwrap_or(0)
    }

    /// Approvals plus rejections recorded for `tool`.
    pub fn total_decisions(&self, tool: &str) -> u32 {
        self.approvals.get(tool).copied().unwrap_or(0) + self.rejections.get(tool).copied().unwrap_or(0)
    }

    pub fn approval_rate(&self, tool: &str) -> Option<f64> {
        let total = self.total_decisions(tool);
        (total > 0).then(|| f64::from(self.approvals.get(tool).copied().unwrap_or(0)) / f64::from(total))
    }

    pub fn mean_latency(&self, tool: &str) -> Option<f64> {
        let times = self.approval_latencies.get(tool)?;
        (!times.is_empty()).then(|| times.iter().sum::<f64>() / times.len() as f64)
    }

    /// Mean of the whole confidence window.
    pub fn average_confidence(&self) -> Option<f64> {
        let w = &self.confidence_window;
        (!w.is_empty()).then(|| w.iter().sum::<f64>() / w.len() as f64)
    }

    /// The last `n` confidence scores, or `None` if fewer were recorded.
    pub fn recent_confidence(&self, n: usize) -> Option<&[f64]> {
        let len = self.confidence_window.len();
        (n > 0 && len >= n).then(|| &self.confidence_window[len - n..])
    }

    /// Tools that have received at least one approve/reject decision.
    pub fn observed_tools(&self) -> Vec<&str> {
        let mut tools: Vec<&str> = self
            .approvals
            .keys()
            .chain(self.rejections.keys())
            .map(String::as_str)
            .collect();
        tools.sort_unstable();
        tools.dedup();
        tools
    }
}

/// Loop-local part of the bus that is carried through checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerceptionSnapshot {
    pub confidence_window: Vec<f64>,
    pub tool_outputs: BTreeMap<String, String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// PerceptionBus
// ─────────────────────────────────────────────────────────────────────────────

/// Owned by exactly one orchestrator; never shared across tasks.
#[derive(Debug, Clone)]
pub struct PerceptionBus {
    stats: PerceptionStats,
    tool_outputs: BTreeMap<String, String>,
    window_capacity: usize,
}

impl Default for PerceptionBus {
    fn default() -> Self {
        Self::with_window_capacity(DEFAULT_CONFIDENCE_WINDOW)
    }
}

impl PerceptionBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window_capacity(window_capacity: usize) -> Self {
        Self {
            stats: PerceptionStats::default(),
            tool_outputs: BTreeMap::new(),
            window_capacity: window_capacity.max(1),
        }
    }

    pub fn stats(&self) -> &PerceptionStats {
        &self.stats
    }

    /// Record an operator decision on `tool` that took `elapsed_secs`.
    pub fn record_approval(&mut self, tool: &str, approved: bool, elapsed_secs: f64) {
        let s = &mut self.stats;
        if approved {
            *s.approvals.entry(tool.to_string()).or_default() += 1;
            s.consecutive_rejects.insert(tool.to_string(), 0);
        } else {
            *s.rejections.entry(tool.to_string()).or_default() += 1;
            *s.consecutive_rejects.entry(tool.to_string()).or_default() += 1;
        }
        s.approval_latencies
            .entry(tool.to_string())
            .or_default()
            .push(elapsed_secs.max(0.0));
        debug!(tool, approved, elapsed_secs, "approval recorded");
    }

    /// Record a confidence score, keeping only the most recent ones.
    pub fn record_confidence(&mut self, score: f64) {
        let score = if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.5 };
        let window = &mut self.stats.confidence_window;
        window.push(score);
        if window.len() > self.window_capacity {
            let excess = window.len() - self.window_capacity;
            window.drain(..excess);
        }
    }

    pub fn record_stagnation(&mut self, text: &str) {
        self.stats.stagnation_count += 1;
        debug!(count = self.stats.stagnation_count, hint = text, "stagnation recorded");
    }

    /// Classify a tool result. An error status always wins.
    pub fn classify_result(result: &ToolResult) -> ResultClass {
        match result.status {
            ToolStatus::Error => ResultClass::Error,
            ToolStatus::Ok if is_blank(result.output.as_ref()) => ResultClass::Empty,
            ToolStatus::Ok => ResultClass::Success,
            _ if has_error_body(result) => ResultClass::Error,
            _ => ResultClass::Partial,
        }
    }

    /// Compare `output` with the previous output of the same call.
    ///
    /// Calls are keyed by tool name plus canonical arguments, so the same
    /// tool called with different arguments is never reported as a repeat.
    pub fn detect_repeat(&mut self, tool: &str, args: &Map<String, Value>, output: &str) -> RepeatStatus {
        let key = if args.is_empty() {
            tool.to_string()
        } else {
            format!("{tool}:{}", canonical_json(&Value::Object(args.clone())))
        };
        let status = match self.tool_outputs.get(&key) {
            None => RepeatStatus::Unseen,
            Some(previous) if previous == output => RepeatStatus::Same,
            Some(_) => RepeatStatus::Changed,
        };
        self.tool_outputs.insert(key, output.to_string());
        status
    }

    /// Human-readable approval history, or `None` when nothing was recorded.
    pub fn approval_summary(&self) -> Option<String> {
        let tools = self.stats.observed_tools();
        if tools.is_empty() {
            return None;
        }
        let mut lines = vec!["User approval patterns:".to_string()];
        for tool in tools {
            let total = self.stats.total_decisions(tool);
            let approved = self.stats.approvals.get(tool).copied().unwrap_or(0);
            let rate = self.stats.approval_rate(tool).unwrap_or(0.0);
            lines.push(format!(
                "  {tool}: {approved}/{total} approved ({:.0}%)",
                rate * 100.0
            ));
        }
        Some(lines.join("\n"))
    }

    /// First stagnation phrase found in `text`, if any.
    pub fn stagnation_indicator(text: &str) -> Option<&'static str> {
        let lower = text.to_lowercase();
        STAGNATION_INDICATORS
            .iter()
            .copied()
            .find(|phrase| lower.contains(phrase))
    }

    /// Note for a slow operator answer, when `elapsed_secs` reaches
    /// `threshold_secs`. A zero threshold disables the check.
    pub fn hesitation_note(tool: &str, elapsed_secs: f64, threshold_secs: f64) -> Option<String> {
        (threshold_secs > 0.0 && elapsed_secs >= threshold_secs).then(|| {
            format!("User hesitated {elapsed_secs:.0}s before deciding on '{tool}'; consider a less risky alternative.")
        })
    }

    pub fn clear_consecutive_rejects(&mut self, tool: &str) {
        self.stats.consecutive_rejects.insert(tool.to_string(), 0);
    }

    pub fn clear_confidence_window(&mut self) {
        self.stats.confidence_window.clear();
    }

    pub fn snapshot(&self) -> PerceptionSnapshot {
        PerceptionSnapshot {
            confidence_window: self.stats.confidence_window.clone(),
            tool_outputs: self.tool_outputs.clone(),
        }
    }

    /// Replace the loop-local state with `snapshot`.
    pub fn restore(&mut self, snapshot: PerceptionSnapshot) {
        let mut window = snapshot.confidence_window;
        if window.len() > self.window_capacity {
            window.drain(..window.len() - self.window_capacity);
        }
        self.stats.confidence_window = window;
        self.tool_outputs = snapshot.tool_outputs;
    }

    /// Forget everything. Only called on explicit operator request.
    pub fn reset(&mut self) {
        self.stats = PerceptionStats::default();
        self.tool_outputs.clear();
    }
}

fn is_blank(output: Option<&Value>) -> bool {
    match output {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

fn has_error_body(result: &ToolResult) -> bool {
    if result.error.as_deref().is_some_and(|e| !e.trim().is_empty()) {
        return true;
    }
    match &result.output {
        Some(Value::Object(map)) => map.contains_key("error"),
        Some(Value::String(s)) => s.trim_start().to_lowercase().starts_with("error"),
        _ => false,
    }
}
