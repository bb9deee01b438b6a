//! Tasks, their mutable state, and the per-iteration step log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::decision::{Decision, ToolCall};
use crate::error::WardenError;
use crate::plan::{TaskPlan, WorkingMemory};
use crate::tool::ToolOutcome;

// ─────────────────────────────────────────────────────────────────────────────
// TaskStatus
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Running,
    Paused,
    Completed,
    Aborted,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Aborted => "aborted",
            TaskStatus::Failed => "failed",
        }
    }

    /// Completed, aborted and failed tasks are never resumed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Aborted | TaskStatus::Failed
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(TaskStatus::Created),
            "running" => Ok(TaskStatus::Running),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "aborted" => Ok(TaskStatus::Aborted),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(WardenError::Serialization(format!(
                "unknown task status: {other}"
            ))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StepStatus
// ─────────────────────────────────────────────────────────────────────────────

/// Where a [`Step`] is in its propose → evaluate → act cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    RunningLlm,
    RunningTool,
    AwaitingHuman,
    Approved,
    Rejected,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::RunningLlm => "running_llm",
            StepStatus::RunningTool => "running_tool",
            StepStatus::AwaitingHuman => "awaiting_human",
            StepStatus::Approved => "approved",
            StepStatus::Rejected => "rejected",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running_llm" => Ok(StepStatus::RunningLlm),
            "running_tool" => Ok(StepStatus::RunningTool),
            "awaiting_human" => Ok(StepStatus::AwaitingHuman),
            "approved" => Ok(StepStatus::Approved),
            "rejected" => Ok(StepStatus::Rejected),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            other => Err(WardenError::Serialization(format!(
                "unknown step status: {other}"
            ))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task
// ─────────────────────────────────────────────────────────────────────────────

/// One entry of the append-only findings log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub step: u32,
    pub key: String,
    pub value: String,
}

/// Mutable state carried by a [`Task`] across steps and pauses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub step_count: u32,
    #[serde(default)]
    pub plan: Option<TaskPlan>,
    #[serde(default)]
    pub working_memory: Option<WorkingMemory>,
    #[serde(default)]
    pub last_reflection: Option<String>,
    /// Files written by the agent, as sandboxed paths.
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub checkpoint: Option<Checkpoint>,
}

impl TaskState {
    /// Append a finding for `step`.
    pub fn push_finding(&mut self, step: u32, key: impl Into<String>, value: impl Into<String>) {
        self.findings.push(Finding {
            step,
            key: key.into(),
            value: value.into(),
        });
    }

    /// Findings whose key equals `key`, oldest first.
    pub fn findings_with_key<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Finding> {
        self.findings.iter().filter(move |f| f.key == key)
    }
}

/// One goal-directed agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub goal: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(goal: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            goal: goal.into(),
            description: description.into(),
            status: TaskStatus::Created,
            state: TaskState::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Step
// ─────────────────────────────────────────────────────────────────────────────

/// Record of one loop iteration. Append-only once finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub task_id: Uuid,
    pub sequence: u32,
    #[serde(default)]
    pub title: String,
    pub status: StepStatus,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub llm_response: String,
    #[serde(default)]
    pub decision: Option<Decision>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub tool_results: Vec<ToolOutcome>,
    #[serde(default)]
    pub human_decision: Option<String>,
    #[serde(default)]
    pub human_input: Option<String>,
    /// Human-readable reason attached when the step fails.
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Step {
    pub fn new(task_id: Uuid, sequence: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id,
            sequence,
            title: format!("Step {sequence}"),
            status: StepStatus::Pending,
            prompt: String::new(),
            llm_response: String::new(),
            decision: None,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            human_decision: None,
            human_input: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: StepStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Mark the step failed with a reason the operator can read.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.failure_reason = Some(reason.into());
        self.set_status(StepStatus::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_string_roundtrip() {
        for status in [
            TaskStatus::Created,
            TaskStatus::Running,
            TaskStatus::Paused,
            TaskStatus::Completed,
            TaskStatus::Aborted,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("sleeping".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn step_status_matches_serde_names() {
        let json = serde_json::to_string(&StepStatus::AwaitingHuman).unwrap();
        assert_eq!(json, format!("\"{}\"", StepStatus::AwaitingHuman.as_str()));
        assert_eq!(
            "running_tool".parse::<StepStatus>().unwrap(),
            StepStatus::RunningTool
        );
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Aborted.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
    }

    #[test]
    fn new_task_starts_created_and_empty() {
        let task = Task::new("write a report", "");
        assert_eq!(task.status, TaskStatus::Created);
        assert_eq!(task.state.step_count, 0);
        assert!(task.state.checkpoint.is_none());
    }

    #[test]
    fn fail_records_reason() {
        let mut step = Step::new(Uuid::new_v4(), 3);
        step.fail("model unreachable");
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.failure_reason.as_deref(), Some("model unreachable"));
        assert_eq!(step.title, "Step 3");
    }

    #[test]
    fn findings_filter_by_key() {
        let mut state = TaskState::default();
        state.push_finding(1, "tool:file_read", "[success] ok");
        state.push_finding(2, "human_decision", "go on");
        state.push_finding(3, "tool:file_read", "[empty] ");
        assert_eq!(state.findings_with_key("tool:file_read").count(), 2);
    }

    #[test]
    fn task_state_tolerates_missing_fields() {
        let state: TaskState = serde_json::from_str("{\"step_count\": 4}").unwrap();
        assert_eq!(state.step_count, 4);
        assert!(state.findings.is_empty());
    }
}
