//! Task decomposition and compressed working memory.

use serde::{Deserialize, Serialize};

use crate::task::TaskState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Skipped,
}

/// One unit of a [`TaskPlan`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: u32,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub success_criteria: String,
    #[serde(default)]
    pub suggested_tools: Vec<String>,
    #[serde(default = "default_estimated_steps")]
    pub estimated_steps: u32,
    #[serde(default)]
    pub status: SubtaskStatus,
    #[serde(default)]
    pub result_summary: Option<String>,
}

fn default_estimated_steps() -> u32 {
    3
}

impl Subtask {
    pub fn new(id: u32, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            description: String::new(),
            success_criteria: String::new(),
            suggested_tools: Vec::new(),
            estimated_steps: default_estimated_steps(),
            status: SubtaskStatus::Pending,
            result_summary: None,
        }
    }

    fn is_settled(&self) -> bool {
        matches!(self.status, SubtaskStatus::Completed | SubtaskStatus::Skipped)
    }
}

/// Ordered decomposition of a task's goal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub subtasks: Vec<Subtask>,
    #[serde(default)]
    pub overall_strategy: String,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub created_at_step: u32,
    #[serde(default)]
    pub revision_count: u32,
}

/// Compressed summary of everything learned so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkingMemory {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_findings: Vec<String>,
    #[serde(default)]
    pub failed_approaches: Vec<String>,
    #[serde(default)]
    pub open_questions: Vec<String>,
    #[serde(default)]
    pub last_updated_step: u32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Plan bookkeeping on TaskState
// ─────────────────────────────────────────────────────────────────────────────

impl TaskState {
    /// Install `plan` and start its first subtask.
    pub fn install_plan(&mut self, mut plan: TaskPlan) {
        plan.created_at_step = self.step_count;
        if let Some(first) = plan.subtasks.first_mut() {
            first.status = SubtaskStatus::InProgress;
        }
        self.plan = Some(plan);
    }

    /// The subtask currently in progress, if any.
    pub fn current_subtask(&self) -> Option<&Subtask> {
        self.plan
            .as_ref()?
            .subtasks
            .iter()
            .find(|s| s.status == SubtaskStatus::InProgress)
    }

    /// Complete the current subtask with `summary` and start the next pending
    /// one. Returns the newly started subtask.
    pub fn advance_subtask(&mut self, summary: &str) -> Option<&Subtask> {
        let plan = self.plan.as_mut()?;
        if let Some(current) = plan
            .subtasks
            .iter_mut()
            .find(|s| s.status == SubtaskStatus::InProgress)
        {
            current.status = SubtaskStatus::Completed;
            current.result_summary = Some(summary.to_string());
        }
        let next = plan
            .subtasks
            .iter_mut()
            .find(|s| s.status == SubtaskStatus::Pending)?;
        next.status = SubtaskStatus::InProgress;
        Some(&*next)
    }

    /// Replace the unfinished part of the plan with `revised`.
    ///
    /// Completed and skipped subtasks are kept as history; the revised
    /// subtasks are renumbered after them and the first one is started.
    pub fn apply_plan_revision(&mut self, revised: Vec<Subtask>) {
        let Some(plan) = self.plan.as_mut() else {
            return;
        };
        let mut kept: Vec<Subtask> = plan
            .subtasks
            .iter()
            .filter(|s| s.is_settled())
            .cloned()
            .collect();
        let mut next_id = kept.iter().map(|s| s.id).max().unwrap_or(0) + 1;
        for mut subtask in revised {
            subtask.id = next_id;
            subtask.status = SubtaskStatus::Pending;
            subtask.result_summary = None;
            next_id += 1;
            kept.push(subtask);
        }
        if let Some(first) = kept.iter_mut().find(|s| s.status == SubtaskStatus::Pending) {
            first.status = SubtaskStatus::InProgress;
        }
        plan.subtasks = kept;
        plan.revision_count += 1;
    }

    /// `true` when a plan exists and every subtask is completed or skipped.
    pub fn all_subtasks_done(&self) -> bool {
        self.plan
            .as_ref()
            .is_some_and(|p| !p.subtasks.is_empty() && p.subtasks.iter().all(Subtask::is_settled))
    }

    /// `(settled, total)` subtask counts.
    pub fn plan_progress(&self) -> (usize, usize) {
        match &self.plan {
            Some(p) => (
                p.subtasks.iter().filter(|s| s.is_settled()).count(),
                p.subtasks.len(),
            ),
            None => (0, 0),
        }
    }
}
