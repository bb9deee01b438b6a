//! Capability traits – the narrow interfaces the orchestrator consumes.
//!
//! Each trait is one replaceable collaborator. None of them carries any
//! security logic: permissions, sandboxing and approval belong to the
//! kernel. Implementations are registered in the
//! [`PluginRegistry`][crate::plugin_registry::PluginRegistry] as
//! `Arc<dyn Trait>`.
//!
//! | Trait | Shipped implementation |
//! |---|---|
//! | [`LlmCapability`] | [`LlmDriver`][crate::llm_driver::LlmDriver] |
//! | [`ToolCapability`] | built-in file tools in `warden-cli` |
//! | [`PlanningCapability`] | [`LlmPlanner`][crate::planner::LlmPlanner] |
//! | [`MemoryCapability`] | `SqliteMemoryStore` in `warden-memory` |
//! | [`ContextCapability`] | [`DefaultContext`][crate::context::DefaultContext] |
//! | [`TaskStore`] | [`InMemoryTaskStore`][crate::store::InMemoryTaskStore], `SqliteTaskStore` |

use async_trait::async_trait;
use uuid::Uuid;
use warden_types::{
    Step, Subtask, Task, TaskPlan, TaskState, ToolCall, ToolResult, ToolSchema, WardenError,
};

/// Pure reasoning. Transport failures come back as [`WardenError::Llm`].
#[async_trait]
pub trait LlmCapability: Send + Sync {
    /// Ask for the next decision.
    async fn call(&self, prompt: &str, system_prompt: &str) -> Result<String, WardenError>;

    /// Ask for an honest assessment of progress so far.
    async fn reflect(&self, state: &TaskState) -> Result<String, WardenError>;

    /// Decompose a goal; the answer carries a `plan` fenced block.
    async fn plan(&self, prompt: &str) -> Result<String, WardenError>;

    /// Compress history; the answer carries a `memory` fenced block.
    async fn compress(&self, prompt: &str) -> Result<String, WardenError>;

    /// Review a finished subtask; the answer carries a `checkpoint` fenced block.
    async fn checkpoint(&self, prompt: &str) -> Result<String, WardenError>;

    /// Release connections. Called once when a run ends for any reason.
    async fn close(&self) {}
}

/// Tool discovery and execution. No permission checks, no path rewriting.
#[async_trait]
pub trait ToolCapability: Send + Sync {
    /// Connect to tool sources. Returns informational lines for the operator.
    async fn connect(&self) -> Result<Vec<String>, WardenError> {
        Ok(Vec::new())
    }

    async fn disconnect(&self) {}

    fn list_tools(&self) -> Vec<ToolSchema>;

    /// Run one call. `Err` means the transport failed; a tool-level failure
    /// is an `Ok` result with an error status.
    async fn execute(&self, call: &ToolCall) -> Result<ToolResult, WardenError>;
}

/// Task decomposition. Optional: the loop falls back to flat execution.
#[async_trait]
pub trait PlanningCapability: Send + Sync {
    async fn generate_plan(
        &self,
        task: &Task,
        memories: &[String],
        tools: &[ToolSchema],
    ) -> Result<Option<TaskPlan>, WardenError>;

    /// Review the plan at a subtask boundary. `Some` carries replacement
    /// subtasks for everything not yet finished.
    async fn checkpoint_reflect(&self, task: &Task) -> Result<Option<Vec<Subtask>>, WardenError>;

    /// Complete the current subtask and start the next one.
    fn advance_subtask(&self, state: &mut TaskState, summary: &str) -> Option<Subtask> {
        state.advance_subtask(summary).cloned()
    }
}

/// Long-term memory shared across tasks.
pub trait MemoryCapability: Send + Sync {
    fn retrieve_relevant(&self, query: &str, limit: usize) -> Result<Vec<String>, WardenError>;

    fn save(&self, category: &str, content: &str, tags: &[String]) -> Result<(), WardenError>;

    /// Keep anything worth remembering from one model response.
    fn extract(&self, _task_id: Uuid, _response: &str, _step_title: &str) -> Result<(), WardenError> {
        Ok(())
    }
}

/// Everything [`ContextCapability::build_prompt`] needs besides the task.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub memories: &'a [String],
    pub tools: &'a [ToolSchema],
    pub constraints: &'a [String],
    pub elapsed_secs: f64,
    /// Step budget; 0 means unlimited.
    pub max_steps: u32,
}

/// Prompt assembly and context compression.
pub trait ContextCapability: Send + Sync {
    fn build_prompt(&self, task: &Task, inputs: &PromptInputs<'_>) -> String;

    fn merge_finding(&self, state: &mut TaskState, step: u32, key: &str, value: &str) {
        state.push_finding(step, key, value);
    }

    /// Fold old findings when the state grows too large. Returns `true` if
    /// anything was compressed.
    fn compress_if_needed(&self, state: &mut TaskState) -> bool;

    /// Short text form of a tool result for the findings log.
    fn summarize_tool_result(&self, tool: &str, result: &ToolResult) -> String;

    /// Prompt for working-memory compression, or `None` when there is too
    /// little history to be worth it.
    fn compression_prompt(&self, _task: &Task) -> Option<String> {
        None
    }
}

/// Persistence for tasks and their steps.
pub trait TaskStore: Send + Sync {
    fn load_task(&self, id: Uuid) -> Result<Task, WardenError>;

    /// Insert or replace.
    fn save_task(&self, task: &Task) -> Result<(), WardenError>;

    /// Insert or replace.
    fn save_step(&self, step: &Step) -> Result<(), WardenError>;

    /// Steps of `task_id` ordered by sequence.
    fn steps(&self, task_id: Uuid) -> Result<Vec<Step>, WardenError>;

    /// All tasks, most recently updated first.
    fn list_tasks(&self) -> Result<Vec<Task>, WardenError>;
}
