//! [`DefaultContext`] – prompt assembly and context compression.
//!
//! The prompt is plain Markdown: one `##` section per concern, empty
//! sections omitted. Compression is purely mechanical here; LLM-backed
//! working-memory compression is driven by the orchestrator through
//! [`ContextCapability::compression_prompt`] and [`parse_working_memory`].

use std::fmt::Write as _;

use serde_json::{Map, Value, json};
use tracing::{info, warn};
use warden_kernel::decision_parser::{extract_fenced_block, find_object_with_key};
use warden_types::{Finding, Task, TaskState, ToolResult, ToolSchema, ToolStatus, WorkingMemory};

use crate::capabilities::{ContextCapability, PromptInputs};
use crate::config::ContextConfig;

/// Key of the finding that replaces folded history.
pub const COMPRESSED_KEY: &str = "system:compressed";
/// Key of the finding recorded when a paused task is resumed.
pub const RESUMED_KEY: &str = "system:resumed";

/// Findings with these key prefixes survive compression.
const PRIORITY_PREFIXES: [&str; 3] = ["human_decision", "perception:", "system:"];

/// Remaining-step count at which the prompt warns about the budget.
const BUDGET_WARNING_STEPS: u32 = 5;

/// Minimum findings before working-memory compression is worth a model call.
const MIN_FINDINGS_TO_COMPRESS: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct DefaultContext {
    config: ContextConfig,
}

impl DefaultContext {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    /// Rough token count: four characters per token.
    pub fn estimate_tokens(text: &str) -> usize {
        text.chars().count() / 4
    }

    fn is_priority(finding: &Finding) -> bool {
        finding.key != COMPRESSED_KEY
            && PRIORITY_PREFIXES
                .iter()
                .any(|p| finding.key.starts_with(p))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Prompt sections
// ─────────────────────────────────────────────────────────────────────────────

fn format_finding(f: &Finding) -> String {
    format!("- Step {}: [{}] {}", f.step, f.key, f.value)
}

fn format_tools(tools: &[&ToolSchema]) -> String {
    let mut out = String::new();
    for tool in tools {
        let _ = write!(out, "- **{}**: {}", tool.name, tool.description);
        let required: Vec<&str> = tool
            .parameters
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if let Some(props) = tool.parameters.get("properties").and_then(Value::as_object) {
            for (name, info) in props {
                let ty = info.get("type").and_then(Value::as_str).unwrap_or("string");
                let desc = info.get("description").and_then(Value::as_str).unwrap_or("");
                let req = if required.contains(&name.as_str()) { ", required" } else { "" };
                let _ = write!(out, "\n    - `{name}` ({ty}{req}): {desc}");
            }
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn working_memory_section(wm: &WorkingMemory) -> String {
    let mut parts = Vec::new();
    if !wm.summary.is_empty() {
        parts.push(format!("Summary: {}", wm.summary));
    }
    for (label, items) in [
        ("Key Findings", &wm.key_findings),
        ("Failed Approaches", &wm.failed_approaches),
        ("Open Questions", &wm.open_questions),
    ] {
        if !items.is_empty() {
            parts.push(format!("{label}:\n{}", bullet_list(items)));
        }
    }
    parts.join("\n")
}

const INSTRUCTIONS: &str = "Based on the context above, decide the next step toward the goal. \
Call tools by their exact name from the tool list and only with the listed parameters. \
Set human_required with a reason when you need the operator, and use help_request when \
critical information is missing. Write files under the \"output/\" directory.";

impl ContextCapability for DefaultContext {
    fn build_prompt(&self, task: &Task, inputs: &PromptInputs<'_>) -> String {
        let state = &task.state;
        let mut parts = vec![format!("## Goal\n{}", task.goal)];

        if !task.description.is_empty() {
            parts.push(format!("## Description\n{}", task.description));
        }

        let current = state.current_subtask();
        if let Some(sub) = current {
            let (_, total) = state.plan_progress();
            let criteria = if sub.success_criteria.is_empty() {
                "N/A"
            } else {
                sub.success_criteria.as_str()
            };
            parts.push(format!(
                "## Current Subtask ({} of {total})\n**{}**\n{}\nSuccess criteria: {criteria}",
                sub.id, sub.title, sub.description
            ));
        }

        let mut resources = vec![
            format!("- Steps completed: {}", state.step_count),
            format!("- Elapsed time: {:.1} min", inputs.elapsed_secs / 60.0),
        ];
        if inputs.max_steps > 0 {
            let remaining = inputs.max_steps.saturating_sub(state.step_count);
            resources.push(format!(
                "- Steps remaining: {remaining} (limit: {})",
                inputs.max_steps
            ));
            if remaining <= BUDGET_WARNING_STEPS {
                resources.push("- WARNING: approaching the step limit, prioritize essential work".into());
            }
        }
        parts.push(format!("## Resource Status\n{}", resources.join("\n")));

        if !inputs.tools.is_empty() {
            let suggested: &[String] = current.map(|s| s.suggested_tools.as_slice()).unwrap_or(&[]);
            let (focus, others): (Vec<&ToolSchema>, Vec<&ToolSchema>) = inputs
                .tools
                .iter()
                .partition(|t| suggested.contains(&t.name));
            if focus.is_empty() {
                let all: Vec<&ToolSchema> = inputs.tools.iter().collect();
                parts.push(format!("## Available Tools\n{}", format_tools(&all)));
            } else {
                parts.push(format!(
                    "## Suggested Tools (for this subtask)\n{}",
                    format_tools(&focus)
                ));
                if !others.is_empty() {
                    let names: Vec<&str> = others.iter().map(|t| t.name.as_str()).collect();
                    parts.push(format!("## Other Available Tools\n{}", names.join(", ")));
                }
            }
        }

        if let Some(wm) = &state.working_memory {
            parts.push(format!(
                "## Working Memory (compressed from steps 1-{})\n{}",
                wm.last_updated_step,
                working_memory_section(wm)
            ));
            let recent: Vec<String> = state
                .findings
                .iter()
                .filter(|f| f.step > wm.last_updated_step)
                .map(format_finding)
                .collect();
            if !recent.is_empty() {
                parts.push(format!(
                    "## Recent Findings (steps {}-{})\n{}",
                    wm.last_updated_step + 1,
                    state.step_count,
                    recent.join("\n")
                ));
            }
        } else if !state.findings.is_empty() {
            let all: Vec<String> = state.findings.iter().map(format_finding).collect();
            parts.push(format!(
                "## Accumulated Findings (steps completed: {})\n{}",
                state.step_count,
                all.join("\n")
            ));
        }

        if !inputs.constraints.is_empty() {
            parts.push(format!(
                "## Constraints (do NOT repeat these mistakes)\n{}",
                bullet_list(inputs.constraints)
            ));
        }

        if !state.artifacts.is_empty() {
            parts.push(format!("## Artifacts Produced\n{}", bullet_list(&state.artifacts)));
        }

        if let Some(reflection) = &state.last_reflection {
            parts.push(format!("## Last Reflection\n{reflection}"));
        }

        if let Some(resumed) = state.findings_with_key(RESUMED_KEY).last() {
            parts.push(format!("## Resume Notice\n{}", resumed.value));
        }

        if !inputs.memories.is_empty() {
            parts.push(format!(
                "## Relevant Memories from Past Tasks\n{}",
                bullet_list(inputs.memories)
            ));
        }

        parts.push(format!("## Instructions\n{INSTRUCTIONS}"));
        parts.join("\n\n")
    }

    fn compress_if_needed(&self, state: &mut TaskState) -> bool {
        let serialized = serde_json::to_string(&*state).unwrap_or_default();
        let estimate = Self::estimate_tokens(&serialized);
        let keep = self.config.keep_recent_findings;
        if estimate <= self.config.max_tokens || state.findings.len() <= keep {
            return false;
        }

        let before = state.findings.len();
        let split = before - keep;
        let recent = state.findings.split_off(split);
        let older = std::mem::take(&mut state.findings);
        let (priority, compressible): (Vec<Finding>, Vec<Finding>) =
            older.into_iter().partition(Self::is_priority);

        if let Some(last) = compressible.last() {
            let summary = compressible
                .iter()
                .map(|f| {
                    let head: String = f.value.chars().take(80).collect();
                    format!("Step {}: {} = {head}", f.step, f.key)
                })
                .collect::<Vec<_>>()
                .join("; ");
            state.findings.push(Finding {
                step: last.step,
                key: COMPRESSED_KEY.into(),
                value: summary,
            });
        }
        state.findings.extend(priority);
        state.findings.extend(recent);

        info!(
            before,
            after = state.findings.len(),
            estimated_tokens = estimate,
            budget = self.config.max_tokens,
            "compressed findings"
        );
        true
    }

    fn summarize_tool_result(&self, tool: &str, result: &ToolResult) -> String {
        summarize(tool, result, self.config.tool_summary_chars)
    }

    fn compression_prompt(&self, task: &Task) -> Option<String> {
        let state = &task.state;
        if state.findings.len() < MIN_FINDINGS_TO_COMPRESS {
            return None;
        }
        let history: Vec<String> = state.findings.iter().map(format_finding).collect();
        Some(format!(
            "## Goal\n{}\n\n## Execution History ({} findings, {} steps)\n{}",
            task.goal,
            state.findings.len(),
            state.step_count,
            history.join("\n")
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool result summaries
// ─────────────────────────────────────────────────────────────────────────────

fn status_str(status: ToolStatus) -> &'static str {
    match status {
        ToolStatus::Ok => "ok",
        ToolStatus::Error => "error",
        ToolStatus::Rejected => "rejected",
        ToolStatus::Blocked => "blocked",
        ToolStatus::Unknown => "unknown",
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let head: String = text.chars().take(max).collect();
    format!("{head}...")
}

/// Keep the first and last five lines of a long text.
fn elide_middle_lines(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= 10 {
        return text.to_string();
    }
    let omitted = format!("... ({} lines omitted) ...", lines.len() - 10);
    let mut kept: Vec<&str> = lines[..5].to_vec();
    kept.push(&omitted);
    kept.extend_from_slice(&lines[lines.len() - 5..]);
    kept.join("\n")
}

fn shrink_output(tool: &str, output: &Value, max: usize) -> Value {
    let size = output.to_string().chars().count();
    if size <= max {
        return output.clone();
    }
    match output {
        Value::String(s) if tool == "file_read" => Value::String(elide_middle_lines(s)),
        Value::Object(map) => {
            let mut summary = Map::new();
            let mut budget = max as isize;
            for (k, v) in map {
                let text = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let text = truncate_chars(&text, 200);
                budget -= (k.len() + text.len()) as isize;
                summary.insert(k.clone(), Value::String(text));
                if budget <= 0 {
                    break;
                }
            }
            Value::Object(summary)
        }
        Value::Array(items) if items.len() > 5 => {
            let mut head: Vec<Value> = items[..5].to_vec();
            head.push(Value::String(format!("... ({} more items)", items.len() - 5)));
            Value::Array(head)
        }
        other => other.clone(),
    }
}

/// Structure-aware summary of a tool result, at most about `max` characters.
pub fn summarize(tool: &str, result: &ToolResult, max: usize) -> String {
    let status = status_str(result.status);

    if result.status == ToolStatus::Error {
        let error = result
            .error
            .clone()
            .or_else(|| result.output.as_ref().map(|o| o.to_string()))
            .unwrap_or_default();
        return json!({"status": status, "error": truncate_chars(&error, max)}).to_string();
    }

    let output = match &result.output {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(v) => Some(v),
    };
    let Some(output) = output else {
        return match &result.error {
            Some(e) if !e.is_empty() => json!({"status": status, "error": e}).to_string(),
            _ => json!({"status": status, "output": "(empty)"}).to_string(),
        };
    };

    let text = json!({"status": status, "output": shrink_output(tool, output, max)}).to_string();
    truncate_chars(&text, max)
}

/// Parse the `memory` block of a compression answer.
pub fn parse_working_memory(text: &str) -> Option<WorkingMemory> {
    let parsed = match extract_fenced_block(text, "memory") {
        Some(body) => serde_json::from_str::<WorkingMemory>(body).ok(),
        None => find_object_with_key(text, "summary")
            .and_then(|map| serde_json::from_value(Value::Object(map)).ok()),
    };
    if parsed.is_none() {
        warn!("compression answer carried no readable memory block");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_types::{Subtask, TaskPlan};

    fn inputs<'a>(tools: &'a [ToolSchema], constraints: &'a [String]) -> PromptInputs<'a> {
        PromptInputs {
            memories: &[],
            tools,
            constraints,
            elapsed_secs: 90.0,
            max_steps: 10,
        }
    }

    fn read_tool() -> ToolSchema {
        ToolSchema::new(
            "file_read",
            "Read a file",
            json!({"properties": {"path": {"type": "string", "description": "File path"}}, "required": ["path"]}),
        )
    }

    #[test]
    fn prompt_has_goal_resources_and_instructions() {
        let mut task = Task::new("summarize the logs", "only errors");
        task.state.step_count = 7;
        let tools = [read_tool()];
        let prompt = DefaultContext::default().build_prompt(&task, &inputs(&tools, &[]));
        assert!(prompt.starts_with("## Goal\nsummarize the logs"));
        assert!(prompt.contains("## Description\nonly errors"));
        assert!(prompt.contains("Elapsed time: 1.5 min"));
        assert!(prompt.contains("Steps remaining: 3 (limit: 10)"));
        assert!(prompt.contains("WARNING"));
        assert!(prompt.contains("`path` (string, required): File path"));
        assert!(prompt.ends_with(INSTRUCTIONS));
    }

    #[test]
    fn subtask_narrows_tool_listing() {
        let mut task = Task::new("g", "");
        let mut sub = Subtask::new(1, "read inputs");
        sub.suggested_tools = vec!["file_read".into()];
        task.state.install_plan(TaskPlan {
            subtasks: vec![sub, Subtask::new(2, "write")],
            ..TaskPlan::default()
        });
        let tools = [read_tool(), ToolSchema::new("file_write", "Write", json!({}))];
        let prompt = DefaultContext::default().build_prompt(&task, &inputs(&tools, &[]));
        assert!(prompt.contains("## Current Subtask (1 of 2)"));
        assert!(prompt.contains("## Suggested Tools (for this subtask)\n- **file_read**"));
        assert!(prompt.contains("## Other Available Tools\nfile_write"));
    }

    #[test]
    fn working_memory_hides_old_findings() {
        let mut task = Task::new("g", "");
        task.state.push_finding(1, "tool:a", "old");
        task.state.push_finding(4, "tool:b", "new");
        task.state.step_count = 4;
        task.state.working_memory = Some(WorkingMemory {
            summary: "did a".into(),
            failed_approaches: vec!["guessing paths".into()],
            last_updated_step: 2,
            ..WorkingMemory::default()
        });
        let prompt = DefaultContext::default().build_prompt(&task, &inputs(&[], &[]));
        assert!(prompt.contains("Working Memory (compressed from steps 1-2)"));
        assert!(prompt.contains("Failed Approaches:\n- guessing paths"));
        assert!(prompt.contains("- Step 4: [tool:b] new"));
        assert!(!prompt.contains("old"));
    }

    #[test]
    fn resume_notice_and_constraints_appear() {
        let mut task = Task::new("g", "");
        task.state.push_finding(3, RESUMED_KEY, "first resume");
        task.state.push_finding(5, RESUMED_KEY, "second resume");
        let constraints = vec!["avoid file_write".to_string()];
        let prompt = DefaultContext::default().build_prompt(&task, &inputs(&[], &constraints));
        assert!(prompt.contains("## Resume Notice\nsecond resume"));
        assert!(prompt.contains("- avoid file_write"));
    }

    #[test]
    fn compression_keeps_priority_and_recent() {
        let ctx = DefaultContext::new(ContextConfig {
            max_tokens: 10,
            keep_recent_findings: 2,
            tool_summary_chars: 100,
        });
        let mut state = TaskState::default();
        state.push_finding(1, "tool:a", "x".repeat(100));
        state.push_finding(2, "human_decision", "keep me");
        state.push_finding(3, "tool:b", "y".repeat(100));
        state.push_finding(4, "tool:c", "recent one");
        state.push_finding(5, "tool:d", "recent two");

        assert!(ctx.compress_if_needed(&mut state));
        let keys: Vec<&str> = state.findings.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec![COMPRESSED_KEY, "human_decision", "tool:c", "tool:d"]);
        assert_eq!(state.findings[0].step, 3);
        assert!(state.findings[0].value.contains("Step 1: tool:a"));
    }

    #[test]
    fn small_state_is_left_alone() {
        let ctx = DefaultContext::default();
        let mut state = TaskState::default();
        state.push_finding(1, "tool:a", "short");
        assert!(!ctx.compress_if_needed(&mut state));
        assert_eq!(state.findings.len(), 1);
    }

    #[test]
    fn error_results_keep_the_message() {
        let s = summarize("file_read", &ToolResult::error("no such file"), 1500);
        let v: Value = serde_json::from_str(&s).unwrap();
        assert_eq!(v["status"], "error");
        assert_eq!(v["error"], "no such file");
    }

    #[test]
    fn long_reads_lose_their_middle() {
        let body: Vec<String> = (0..40).map(|i| format!("line {i} {}", "z".repeat(40))).collect();
        let s = summarize("file_read", &ToolResult::ok(body.join("\n")), 1500);
        assert!(s.contains("30 lines omitted"));
        assert!(s.contains("line 0"));
        assert!(s.contains("line 39"));
    }

    #[test]
    fn long_lists_are_cut_to_five() {
        let items: Vec<Value> = (0..200).map(|i| json!(format!("entry-{i}"))).collect();
        let s = summarize("file_list", &ToolResult::ok(Value::Array(items)), 300);
        assert!(s.contains("195 more items"));
        assert!(!s.contains("entry-5\""));
    }

    #[test]
    fn empty_output_is_marked() {
        let s = summarize("file_list", &ToolResult::ok(""), 100);
        assert!(s.contains("(empty)"));
    }

    #[test]
    fn compression_prompt_needs_history() {
        let ctx = DefaultContext::default();
        let mut task = Task::new("g", "");
        task.state.push_finding(1, "tool:a", "v");
        assert!(ctx.compression_prompt(&task).is_none());
        for i in 2..=4 {
            task.state.push_finding(i, "tool:a", "v");
        }
        let prompt = ctx.compression_prompt(&task).unwrap();
        assert!(prompt.contains("Execution History (4 findings"));
    }

    #[test]
    fn memory_block_parses() {
        let text = "Done.\n```memory\n{\"summary\": \"read two files\", \"key_findings\": [\"a\"]}\n```";
        let wm = parse_working_memory(text).unwrap();
        assert_eq!(wm.summary, "read two files");
        assert_eq!(wm.key_findings, vec!["a".to_string()]);
        assert!(parse_working_memory("nothing here").is_none());
    }
}
