//! [`LlmPlanner`] – task decomposition and subtask-boundary review through
//! the registered [`LlmCapability`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{info, warn};
use warden_kernel::decision_parser::{extract_fenced_block, find_object_with_key};
use warden_types::{Subtask, SubtaskStatus, Task, TaskPlan, ToolSchema, WardenError};

use crate::capabilities::{LlmCapability, PlanningCapability};

pub struct LlmPlanner {
    llm: Arc<dyn LlmCapability>,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmCapability>) -> Self {
        Self { llm }
    }

    pub fn plan_prompt(task: &Task, memories: &[String], tools: &[ToolSchema]) -> String {
        let tool_list = if tools.is_empty() {
            "No tools available".to_string()
        } else {
            tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>().join(", ")
        };
        let description = if task.description.is_empty() {
            "N/A"
        } else {
            task.description.as_str()
        };
        let mut prompt = format!(
            "## Goal\n{}\n\n## Description\n{description}\n\n## Available Tools\n{tool_list}\n",
            task.goal
        );
        if !memories.is_empty() {
            prompt.push_str("\n## Relevant Memories\n");
            for m in memories {
                prompt.push_str(&format!("- {m}\n"));
            }
        }
        prompt.push_str("\nDecompose this goal into an executable subtask plan.");
        prompt
    }

    pub fn checkpoint_prompt(task: &Task) -> String {
        let state = &task.state;
        let mut lines = Vec::new();
        let mut strategy = "N/A";
        if let Some(plan) = &state.plan {
            for sub in &plan.subtasks {
                let status = serde_json::to_value(sub.status)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_owned))
                    .unwrap_or_default();
                let mut line = format!("- [{status}] {}", sub.title);
                if let Some(summary) = &sub.result_summary {
                    line.push_str(&format!(" -> {summary}"));
                }
                lines.push(line);
            }
            if !plan.overall_strategy.is_empty() {
                strategy = plan.overall_strategy.as_str();
            }
        }
        let mut prompt = format!(
            "## Goal\n{}\n\n## Plan Status\n{}\n\n## Overall Strategy\n{strategy}\n",
            task.goal,
            lines.join("\n")
        );
        if let Some(wm) = &state.working_memory {
            prompt.push_str(&format!("\n## Working Memory Summary\n{}\n", wm.summary));
        }
        prompt.push_str("\nAssess progress and decide whether the plan needs revision.");
        prompt
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lenient block parsing
// ─────────────────────────────────────────────────────────────────────────────

fn block_object(text: &str, tag: &str, fallback_key: &str) -> Option<Map<String, Value>> {
    match extract_fenced_block(text, tag) {
        Some(body) => match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        },
        None => find_object_with_key(text, fallback_key),
    }
}

/// Subtasks from a JSON array. Missing ids are assigned by position, missing
/// titles by id; entries that are not objects are dropped.
fn parse_subtasks(value: &Value) -> Vec<Subtask> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| {
            let mut obj = item.as_object()?.clone();
            let id = obj
                .get("id")
                .and_then(Value::as_u64)
                .unwrap_or(i as u64 + 1);
            obj.insert("id".into(), Value::from(id));
            if !obj.get("title").is_some_and(Value::is_string) {
                obj.insert("title".into(), Value::String(format!("Subtask {id}")));
            }
            obj.remove("status");
            match serde_json::from_value::<Subtask>(Value::Object(obj)) {
                Ok(mut sub) => {
                    sub.status = SubtaskStatus::Pending;
                    Some(sub)
                }
                Err(e) => {
                    warn!(error = %e, index = i, "dropping unreadable subtask");
                    None
                }
            }
        })
        .collect()
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(str::to_owned).collect())
        .unwrap_or_default()
}

/// Parse the `plan` block of a planning answer.
pub fn parse_plan(text: &str) -> Option<TaskPlan> {
    let map = block_object(text, "plan", "subtasks")?;
    let subtasks = parse_subtasks(map.get("subtasks")?);
    if subtasks.is_empty() {
        return None;
    }
    Some(TaskPlan {
        subtasks,
        overall_strategy: map
            .get("overall_strategy")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        risks: string_list(map.get("risks")),
        ..TaskPlan::default()
    })
}

/// Parse the `checkpoint` block of a review answer. `Some` carries the
/// replacement subtasks when the plan was declared invalid.
pub fn parse_checkpoint(text: &str) -> Option<Vec<Subtask>> {
    let map = block_object(text, "checkpoint", "plan_still_valid")?;
    if let Some(assessment) = map.get("progress_assessment").and_then(Value::as_str) {
        info!(assessment, "checkpoint assessment");
    }
    let still_valid = match map.get("plan_still_valid") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.eq_ignore_ascii_case("false"),
        _ => true,
    };
    if still_valid {
        return None;
    }
    let revision = map.get("revised_subtasks").or_else(|| map.get("revision"))?;
    let list = match revision {
        Value::Object(inner) => inner.get("subtasks")?,
        other => other,
    };
    let subtasks = parse_subtasks(list);
    (!subtasks.is_empty()).then_some(subtasks)
}

#[async_trait]
impl PlanningCapability for LlmPlanner {
    async fn generate_plan(
        &self,
        task: &Task,
        memories: &[String],
        tools: &[ToolSchema],
    ) -> Result<Option<TaskPlan>, WardenError> {
        let answer = self.llm.plan(&Self::plan_prompt(task, memories, tools)).await?;
        let plan = parse_plan(&answer);
        match &plan {
            Some(p) => info!(task_id = %task.id, subtasks = p.subtasks.len(), "plan generated"),
            None => warn!(task_id = %task.id, "planner returned no usable plan"),
        }
        Ok(plan)
    }

    async fn checkpoint_reflect(&self, task: &Task) -> Result<Option<Vec<Subtask>>, WardenError> {
        if task.state.plan.is_none() {
            return Ok(None);
        }
        let answer = self.llm.checkpoint(&Self::checkpoint_prompt(task)).await?;
        Ok(parse_checkpoint(&answer))
    }
}
