//! Versioned snapshot of loop-local state.
//!
//! A [`Checkpoint`] holds what the orchestrator keeps outside
//! [`TaskState`][crate::TaskState] while a task runs: loop-detection
//! counters, the confidence window, the tool-output cache, the consecutive
//! stop counter and the request a human still owes an answer to. It is
//! written right before every suspension point and consumed exactly once on
//! resume.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::decision::ToolCall;

/// Current checkpoint layout version. Readers discard newer versions.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Why a task stopped making progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    HitlWait,
    ToolConfirmWait,
    LlmFailure,
    ToolFailure,
    StepLimitExceeded,
    UserStop,
    Error,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReason::HitlWait => "hitl_wait",
            PauseReason::ToolConfirmWait => "tool_confirm_wait",
            PauseReason::LlmFailure => "llm_failure",
            PauseReason::ToolFailure => "tool_failure",
            PauseReason::StepLimitExceeded => "step_limit_exceeded",
            PauseReason::UserStop => "user_stop",
            PauseReason::Error => "error",
        }
    }
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Loop-detection signatures and counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopState {
    #[serde(default)]
    pub last_signature: String,
    #[serde(default)]
    pub repeat_count: u32,
    #[serde(default)]
    pub last_tool_names: String,
    #[serde(default)]
    pub name_repeat_count: u32,
}

/// A question the operator has not answered yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingRequest {
    /// The model (or the firewall) asked for a human decision.
    HumanDecision {
        step: u32,
        reason: String,
        options: Vec<String>,
    },
    /// A tool call is waiting for confirmation.
    ToolConfirmation {
        step: u32,
        call: ToolCall,
        needs_preview: bool,
    },
}

impl PendingRequest {
    pub fn step(&self) -> u32 {
        match self {
            PendingRequest::HumanDecision { step, .. } => *step,
            PendingRequest::ToolConfirmation { step, .. } => *step,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub reason: PauseReason,
    pub paused_at_step: u32,
    #[serde(default)]
    pub elapsed_secs: f64,
    #[serde(default)]
    pub loop_state: LoopState,
    #[serde(default)]
    pub confidence_window: Vec<f64>,
    #[serde(default)]
    pub tool_outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub consecutive_stops: u32,
    #[serde(default)]
    pub announced_subtask: Option<u32>,
    #[serde(default)]
    pub wrap_up_injected: bool,
    #[serde(default)]
    pub completion_confirmed: bool,
    #[serde(default)]
    pub pending: Option<PendingRequest>,
}

impl Checkpoint {
    pub fn new(reason: PauseReason, paused_at_step: u32) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            reason,
            paused_at_step,
            elapsed_secs: 0.0,
            loop_state: LoopState::default(),
            confidence_window: Vec::new(),
            tool_outputs: BTreeMap::new(),
            consecutive_stops: 0,
            announced_subtask: None,
            wrap_up_injected: false,
            completion_confirmed: false,
            pending: None,
        }
    }

    /// Whether this build understands the checkpoint's layout.
    pub fn is_supported(&self) -> bool {
        self.version <= CHECKPOINT_VERSION
    }
}
