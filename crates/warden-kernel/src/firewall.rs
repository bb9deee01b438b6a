//! [`FirewallEngine`] – the single decision authority.
//!
//! Every model proposal passes through [`FirewallEngine::evaluate`] before
//! any side effect happens, and every tool call passes through
//! [`FirewallEngine::check_tool_permission`] and
//! [`FirewallEngine::sandbox_args`] right before dispatch.
//!
//! # Evaluation layers
//!
//! 1. Help-request escalation.
//! 2. Confidence circuit breaker.
//! 3. Loop detection with confidence-dependent limits.
//! 4. Per-tool permission, checked per call at dispatch time.
//! 5. Completion gate, enforced by the orchestrator.
//!
//! The first layer that forces human involvement ends the pass.

use std::collections::HashSet;

use serde_json::{Map, Value};
use tracing::{info, warn};
use warden_types::{
    Decision, LoopState, PermissionLevel, TaskState, ToolCall, ToolOutcome, ToolSchema,
    ToolStatus,
};

use crate::config::FirewallConfig;
use crate::decision_parser;
use crate::perception::PerceptionStats;
use crate::policy_store::PolicyStore;
use crate::prompt_policy;
use crate::sandbox::{self, Sandbox};

/// Finding key under which escalation notices are merged.
pub const TOOL_AVOIDANCE_KEY: &str = "perception:tool_avoidance";

const SAME_CALL_MARKER: &str = "[SAME as previous call";

// ─────────────────────────────────────────────────────────────────────────────
// Verdict
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictAction {
    Allow,
    NeedsHuman,
    Block,
}

/// Which layer intervened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Trip {
    HelpRequest,
    /// The circuit breaker fired; the caller should clear the confidence window.
    LowConfidence { average: f64 },
    LoopDetected { exact: bool },
    /// Every proposed call named a tool that does not exist.
    UnknownTools,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub action: VerdictAction,
    pub reason: Option<String>,
    /// The decision after any mutation by the firewall.
    pub decision: Decision,
    pub trip: Option<Trip>,
    /// Calls removed because they named unknown tools.
    pub blocked_calls: Vec<ToolCall>,
}

/// Result of a per-call permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionCheck {
    pub level: PermissionLevel,
    pub needs_approval: bool,
    pub needs_preview: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// FirewallEngine
// ─────────────────────────────────────────────────────────────────────────────

/// Composes the policy store, the sandbox and loop-detection state.
///
/// One engine per task; it holds no shared state.
#[derive(Debug, Clone)]
pub struct FirewallEngine {
    config: FirewallConfig,
    policy: PolicyStore,
    sandbox: Sandbox,
    loop_state: LoopState,
    available_tools: Option<HashSet<String>>,
}

impl FirewallEngine {
    /// Build an engine whose sandbox resolves paths against the process
    /// working directory.
    pub fn new(config: FirewallConfig) -> Self {
        let sandbox = Sandbox::new(config.output_dir.clone(), config.readable_paths.clone());
        Self::with_sandbox(config, sandbox)
    }

    pub fn with_sandbox(config: FirewallConfig, sandbox: Sandbox) -> Self {
        let policy = PolicyStore::from_admin(config.tool_permissions.clone());
        Self {
            config,
            policy,
            sandbox,
            loop_state: LoopState::default(),
            available_tools: None,
        }
    }

    pub fn config(&self) -> &FirewallConfig {
        &self.config
    }

    pub fn policy(&self) -> &PolicyStore {
        &self.policy
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Tell the engine which tools exist and which of them are remote.
    pub fn register_tools(&mut self, tools: &[ToolSchema]) {
        self.available_tools = Some(tools.iter().map(|t| t.name.clone()).collect());
        self.policy
            .set_remote_tools(tools.iter().filter(|t| t.remote).map(|t| t.name.clone()));
    }

    /// Fail-safe decision parsing; see [`decision_parser::parse_decision`].
    pub fn parse_decision(&self, text: &str) -> Decision {
        decision_parser::parse_decision(text)
    }

    pub fn system_prompt(&self) -> String {
        prompt_policy::system_prompt()
    }

    /// Run the evaluation layers over `decision`.
    pub fn evaluate(&mut self, decision: Decision, stats: &PerceptionStats) -> Verdict {
        let mut decision = decision;
        let blocked_calls = self.strip_unknown_tools(&mut decision);

        // Layer 1: the model says it is missing information.
        if !decision.human_required
            && let Some(help) = decision.help_request.clone()
        {
            let reason = help_reason(&help);
            let mut options = help.suggested_human_actions.clone();
            options.extend(["skip this step".to_string(), "abort".to_string()]);
            decision.require_human(reason.clone(), options);
            info!("help request escalated to the operator");
            return Verdict {
                action: VerdictAction::NeedsHuman,
                reason: Some(reason),
                decision,
                trip: Some(Trip::HelpRequest),
                blocked_calls,
            };
        }

        // Layer 2: sustained low confidence.
        if !decision.human_required
            && !decision.task_complete
            && let Some(recent) = stats.recent_confidence(self.config.low_confidence_window)
            && recent.iter().all(|c| *c < self.config.low_confidence_threshold)
        {
            let average = recent.iter().sum::<f64>() / recent.len() as f64;
            let reason = format!(
                "Confidence has stayed low for the last {} steps (average {:.2}); the current \
                 approach may not be working. Please choose a direction.",
                recent.len(),
                average
            );
            decision.require_human(
                reason.clone(),
                vec![
                    "try a different approach".to_string(),
                    "provide more information".to_string(),
                    "abort".to_string(),
                ],
            );
            warn!(average, "confidence circuit breaker tripped");
            return Verdict {
                action: VerdictAction::NeedsHuman,
                reason: Some(reason),
                decision,
                trip: Some(Trip::LowConfidence { average }),
                blocked_calls,
            };
        }

        // Layer 3: repeated tool calls.
        if !decision.tool_calls.is_empty()
            && let Some(exact) = self.detect_loop(&decision.tool_calls, stats)
        {
            let reason = if exact {
                "Loop detected (exact args)"
            } else {
                "Loop detected (same tool)"
            };
            decision.tool_calls.clear();
            decision.require_human(
                "The same tool calls keep being proposed; the tool may not be returning useful \
                 data. Please choose the next step.",
                vec!["continue differently".to_string(), "abort".to_string()],
            );
            warn!(exact, "tool call loop detected");
            return Verdict {
                action: VerdictAction::NeedsHuman,
                reason: Some(reason.to_string()),
                decision,
                trip: Some(Trip::LoopDetected { exact }),
                blocked_calls,
            };
        }

        if decision.human_required {
            let reason = decision.human_reason.clone();
            return Verdict {
                action: VerdictAction::NeedsHuman,
                reason,
                decision,
                trip: None,
                blocked_calls,
            };
        }

        if !blocked_calls.is_empty() && decision.tool_calls.is_empty() && !decision.task_complete {
            let names: Vec<&str> = blocked_calls.iter().map(|c| c.tool.as_str()).collect();
            return Verdict {
                action: VerdictAction::Block,
                reason: Some(format!("Unknown tool(s): {}", names.join(", "))),
                decision,
                trip: Some(Trip::UnknownTools),
                blocked_calls,
            };
        }

        Verdict {
            action: VerdictAction::Allow,
            reason: None,
            decision,
            trip: None,
            blocked_calls,
        }
    }

    /// Permission for one call, including the readable-path escalation for
    /// read-only tools.
    pub fn check_tool_permission(&self, call: &ToolCall) -> PermissionCheck {
        let level = self.policy.effective_permission(&call.tool);
        let mut needs_approval = level.requires_approval();
        if !needs_approval
            && self.is_read_only(&call.tool)
            && let Some(path) = sandbox::path_argument(call)
            && !self.sandbox.is_path_readable(path)
        {
            info!(tool = %call.tool, path, "read outside readable paths needs approval");
            needs_approval = true;
        }
        PermissionCheck {
            level,
            needs_approval,
            needs_preview: level == PermissionLevel::Approve,
        }
    }

    /// Drop arguments not declared in `schema`. Returns the kept arguments
    /// and the names of the removed ones.
    pub fn filter_args(
        args: &Map<String, Value>,
        schema: Option<&ToolSchema>,
    ) -> (Map<String, Value>, Vec<String>) {
        let Some(declared) = schema.and_then(ToolSchema::declared_properties) else {
            return (args.clone(), Vec::new());
        };
        let mut kept = Map::new();
        let mut removed = Vec::new();
        for (key, value) in args {
            if declared.contains(&key.as_str()) {
                kept.insert(key.clone(), value.clone());
            } else {
                removed.push(key.clone());
            }
        }
        (kept, removed)
    }

    /// Rewrite every path argument into the output directory. The
    /// readable-path check in [`Self::check_tool_permission`] runs on the
    /// raw path before this.
    pub fn sandbox_args(&self, call: &ToolCall) -> ToolCall {
        self.sandbox.sandbox_call(call)
    }

    /// Escalate `tool` to `approve` in the user layer once it has been
    /// rejected `escalate_after_rejects` times in a row.
    pub fn should_escalate(&mut self, tool: &str, stats: &PerceptionStats) -> Option<PermissionLevel> {
        let limit = self.config.escalate_after_rejects;
        let rejects = stats.consecutive_rejects(tool);
        if limit == 0 || rejects < limit {
            return None;
        }
        self.policy.set_user_permission(tool, PermissionLevel::Approve);
        warn!(tool, rejects, "tool escalated to approve after consecutive rejections");
        Some(PermissionLevel::Approve)
    }

    /// Hints that warn the model before it repeats a known mistake.
    pub fn build_constraints(&self, state: &TaskState) -> Vec<String> {
        let mut hints: Vec<String> = Vec::new();
        let mut push = |hint: String| {
            if !hints.contains(&hint) {
                hints.push(hint);
            }
        };

        if let Some(memory) = &state.working_memory {
            for approach in &memory.failed_approaches {
                push(format!("Previously failed approach: {approach}"));
            }
        }

        let mut failed_tools: HashSet<&str> = HashSet::new();
        for finding in &state.findings {
            if finding.key == TOOL_AVOIDANCE_KEY {
                push(finding.value.clone());
                continue;
            }
            let Some(tool) = finding.key.strip_prefix("tool:") else {
                continue;
            };
            if finding.value.starts_with("[error]") && failed_tools.insert(tool) {
                let detail: String = finding.value.chars().skip(8).take(72).collect();
                push(format!("Tool '{tool}' previously failed: {detail}..."));
            }
            if finding.value.contains(SAME_CALL_MARKER) {
                push(format!(
                    "Calling '{tool}' with the same arguments returned identical results. \
                     Use different arguments or another tool."
                ));
            }
        }

        if self.loop_state.repeat_count > 0 {
            push(
                "The last step repeated the previous tool calls exactly. Change approach or \
                 ask for help."
                    .to_string(),
            );
        }

        hints.truncate(self.config.max_constraint_hints);
        hints
    }

    /// Warning when the outcomes of a tool batch do not serve `intent`.
    pub fn check_deviation(intent: &str, outcomes: &[ToolOutcome]) -> Option<String> {
        if outcomes.is_empty() {
            return None;
        }
        let failed = outcomes
            .iter()
            .filter(|o| matches!(o.status, ToolStatus::Error | ToolStatus::Blocked))
            .count();
        let empty = outcomes
            .iter()
            .filter(|o| o.summary.starts_with("[empty]"))
            .count();
        let total = outcomes.len();
        if failed == total {
            Some(format!(
                "All {total} tool call(s) for '{intent}' failed. Reconsider the approach before retrying."
            ))
        } else if empty == total {
            Some(format!(
                "All {total} tool call(s) for '{intent}' returned nothing. The data may not exist where expected."
            ))
        } else if failed > 0 {
            Some(format!(
                "{failed} of {total} tool call(s) for '{intent}' failed. Check the errors before continuing."
            ))
        } else {
            None
        }
    }

    pub fn loop_state(&self) -> &LoopState {
        &self.loop_state
    }

    pub fn restore_loop_state(&mut self, state: LoopState) {
        self.loop_state = state;
    }

    /// Start a clean slate, e.g. when a new subtask begins.
    pub fn reset_loop_state(&mut self) {
        self.loop_state = LoopState::default();
    }

    fn is_read_only(&self, tool: &str) -> bool {
        self.config.read_only_tools.iter().any(|t| t == tool)
    }

    fn strip_unknown_tools(&self, decision: &mut Decision) -> Vec<ToolCall> {
        let Some(known) = &self.available_tools else {
            return Vec::new();
        };
        let (kept, blocked): (Vec<ToolCall>, Vec<ToolCall>) = decision
            .tool_calls
            .drain(..)
            .partition(|c| known.contains(&c.tool));
        decision.tool_calls = kept;
        for call in &blocked {
            warn!(tool = %call.tool, "blocked call to unknown tool");
        }
        blocked
    }

    /// Update the repeat counters. Returns `Some(exact)` when a limit is hit.
    fn detect_loop(&mut self, calls: &[ToolCall], stats: &PerceptionStats) -> Option<bool> {
        let signature = calls.iter().map(ToolCall::signature).collect::<Vec<_>>().join("\n");
        let mut names: Vec<&str> = calls.iter().map(|c| c.tool.as_str()).collect();
        names.sort_unstable();
        let names = names.join(",");

        let st = &mut self.loop_state;
        if signature == st.last_signature {
            st.repeat_count += 1;
        } else {
            st.repeat_count = 0;
            st.last_signature = signature;
        }
        if names == st.last_tool_names {
            st.name_repeat_count += 1;
        } else {
            st.name_repeat_count = 0;
            st.last_tool_names = names;
        }

        let average = stats.average_confidence().unwrap_or(0.5);
        let (exact_limit, name_limit) = self.config.loop_thresholds.limits_for(average);
        if self.loop_state.repeat_count >= exact_limit {
            Some(true)
        } else if self.loop_state.name_repeat_count >= name_limit {
            Some(false)
        } else {
            None
        }
    }
}

fn help_reason(help: &warden_types::HelpRequest) -> String {
    let mut parts = Vec::new();
    if !help.specific_question.trim().is_empty() {
        parts.push(format!("Question: {}", help.specific_question.trim()));
    }
    if !help.attempted_approaches.is_empty() {
        parts.push(format!("Already tried: {}", help.attempted_approaches.join("; ")));
    }
    if !help.missing_information.is_empty() {
        parts.push(format!("Missing information: {}", help.missing_information.join("; ")));
    }
    if parts.is_empty() {
        "The agent needs help to make progress.".to_string()
    } else {
        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::PerceptionBus;
    use serde_json::json;
    use warden_types::{HelpRequest, WorkingMemory};

    fn engine() -> FirewallEngine {
        let config = FirewallConfig::default();
        let sandbox = Sandbox::with_working_dir("/srv/out", config.readable_paths.clone(), "/home/agent");
        FirewallEngine::with_sandbox(config, sandbox)
    }

    fn call(tool: &str, args: Value) -> ToolCall {
        ToolCall::new(tool, args.as_object().cloned().unwrap_or_default())
    }

    fn proposing(calls: Vec<ToolCall>) -> Decision {
        Decision {
            tool_calls: calls,
            ..Decision::default()
        }
    }

    fn bus_with(scores: &[f64]) -> PerceptionBus {
        let mut bus = PerceptionBus::new();
        for s in scores {
            bus.record_confidence(*s);
        }
        bus
    }

    // ── Layer 1 ──────────────────────────────────────────────────────────────

    #[test]
    fn help_request_forces_human_with_synthesized_options() {
        let mut fw = engine();
        let decision = Decision {
            help_request: Some(HelpRequest {
                specific_question: "Which region?".into(),
                attempted_approaches: vec!["guessing".into()],
                missing_information: vec!["region".into()],
                suggested_human_actions: vec!["name the region".into()],
            }),
            ..Decision::default()
        };
        let v = fw.evaluate(decision, PerceptionBus::new().stats());
        assert_eq!(v.action, VerdictAction::NeedsHuman);
        assert_eq!(v.trip, Some(Trip::HelpRequest));
        assert!(v.decision.human_required);
        let reason = v.decision.human_reason.unwrap();
        assert!(reason.contains("Which region?"));
        assert!(reason.contains("guessing"));
        assert_eq!(
            v.decision.options,
            vec!["name the region", "skip this step", "abort"]
        );
    }

    // ── Layer 2 ──────────────────────────────────────────────────────────────

    #[test]
    fn circuit_breaker_fires_on_three_low_scores() {
        let mut fw = engine();
        let bus = bus_with(&[0.2, 0.25, 0.1]);
        let v = fw.evaluate(Decision::default(), bus.stats());
        assert_eq!(v.action, VerdictAction::NeedsHuman);
        assert!(v.decision.human_required);
        match v.trip {
            Some(Trip::LowConfidence { average }) => {
                assert!((average - (0.55 / 3.0)).abs() < 1e-9)
            }
            other => panic!("unexpected trip {other:?}"),
        }
    }

    #[test]
    fn circuit_breaker_needs_a_full_window() {
        let mut fw = engine();
        let v = fw.evaluate(Decision::default(), bus_with(&[0.1, 0.1]).stats());
        assert_eq!(v.action, VerdictAction::Allow);
    }

    #[test]
    fn circuit_breaker_ignores_one_good_score() {
        let mut fw = engine();
        let v = fw.evaluate(Decision::default(), bus_with(&[0.1, 0.9, 0.1]).stats());
        assert_eq!(v.action, VerdictAction::Allow);
    }

    #[test]
    fn circuit_breaker_skips_completed_decisions() {
        let mut fw = engine();
        let decision = Decision {
            task_complete: true,
            ..Decision::default()
        };
        let v = fw.evaluate(decision, bus_with(&[0.1, 0.1, 0.1]).stats());
        assert_eq!(v.action, VerdictAction::Allow);
        assert!(!v.decision.human_required);
    }

    // ── Layer 3 ──────────────────────────────────────────────────────────────

    #[test]
    fn exact_repeat_trips_on_second_repeat_with_high_confidence() {
        let mut fw = engine();
        let bus = bus_with(&[0.9, 0.9, 0.9]);
        let c = || vec![call("search", json!({"q": "rust"}))];

        assert_eq!(fw.evaluate(proposing(c()), bus.stats()).action, VerdictAction::Allow);
        assert_eq!(fw.evaluate(proposing(c()), bus.stats()).action, VerdictAction::Allow);
        let v = fw.evaluate(proposing(c()), bus.stats());
        assert_eq!(v.action, VerdictAction::NeedsHuman);
        assert_eq!(v.trip, Some(Trip::LoopDetected { exact: true }));
        assert!(v.decision.tool_calls.is_empty());
        assert_eq!(v.reason.as_deref(), Some("Loop detected (exact args)"));
    }

    #[test]
    fn exact_repeat_trips_on_first_repeat_with_low_confidence() {
        let mut fw = engine();
        let bus = bus_with(&[0.4, 0.45]);
        let c = || vec![call("search", json!({"q": "rust"}))];

        assert_eq!(fw.evaluate(proposing(c()), bus.stats()).action, VerdictAction::Allow);
        let v = fw.evaluate(proposing(c()), bus.stats());
        assert_eq!(v.trip, Some(Trip::LoopDetected { exact: true }));
    }

    #[test]
    fn exact_repeat_matches_calls_by_signature() {
        let mut fw = engine();
        let bus = bus_with(&[0.4]);
        let first = call("file_read", json!({"path": "a.md", "limit": 3}));
        let second = call("file_read", json!({"limit": 3, "path": "a.md"}));

        fw.evaluate(proposing(vec![first.clone()]), bus.stats());
        assert_eq!(fw.loop_state().last_signature, first.signature());
        let v = fw.evaluate(proposing(vec![second]), bus.stats());
        assert_eq!(v.trip, Some(Trip::LoopDetected { exact: true }));
    }

    #[test]
    fn same_tool_with_new_args_trips_name_limit() {
        let mut fw = engine();
        let bus = bus_with(&[0.9]);
        for q in ["a", "b", "c"] {
            let v = fw.evaluate(proposing(vec![call("search", json!({ "q": q }))]), bus.stats());
            assert_eq!(v.action, VerdictAction::Allow, "q={q}");
        }
        let v = fw.evaluate(proposing(vec![call("search", json!({"q": "d"}))]), bus.stats());
        assert_eq!(v.trip, Some(Trip::LoopDetected { exact: false }));
    }

    #[test]
    fn loop_counters_persist_across_a_trip() {
        let mut fw = engine();
        let bus = bus_with(&[0.9]);
        let c = || vec![call("search", json!({"q": "x"}))];
        for _ in 0..3 {
            fw.evaluate(proposing(c()), bus.stats());
        }
        assert_eq!(fw.loop_state().repeat_count, 2);
        let v = fw.evaluate(proposing(c()), bus.stats());
        assert_eq!(v.trip, Some(Trip::LoopDetected { exact: true }));
        assert_eq!(fw.loop_state().repeat_count, 3);

        fw.reset_loop_state();
        assert_eq!(fw.loop_state(), &LoopState::default());
    }

    #[test]
    fn argument_order_does_not_hide_a_repeat() {
        let mut fw = engine();
        let bus = bus_with(&[0.2]);
        fw.evaluate(proposing(vec![call("t", json!({"a": 1, "b": 2}))]), bus.stats());
        let v = fw.evaluate(proposing(vec![call("t", json!({"b": 2, "a": 1}))]), bus.stats());
        assert_eq!(v.trip, Some(Trip::LoopDetected { exact: true }));
    }

    // ── Unknown tools ────────────────────────────────────────────────────────

    #[test]
    fn unknown_tools_are_blocked() {
        let mut fw = engine();
        fw.register_tools(&[ToolSchema::new("file_read", "", json!({}))]);
        let v = fw.evaluate(
            proposing(vec![call("rm_rf", json!({}))]),
            PerceptionBus::new().stats(),
        );
        assert_eq!(v.action, VerdictAction::Block);
        assert_eq!(v.blocked_calls.len(), 1);
        assert!(v.decision.tool_calls.is_empty());
    }

    #[test]
    fn known_calls_survive_next_to_unknown_ones() {
        let mut fw = engine();
        fw.register_tools(&[ToolSchema::new("file_read", "", json!({}))]);
        let v = fw.evaluate(
            proposing(vec![call("rm_rf", json!({})), call("file_read", json!({"path": "a"}))]),
            PerceptionBus::new().stats(),
        );
        assert_eq!(v.action, VerdictAction::Allow);
        assert_eq!(v.decision.tool_calls.len(), 1);
        assert_eq!(v.blocked_calls.len(), 1);
    }

    #[test]
    fn model_requested_human_passes_through() {
        let mut fw = engine();
        let mut d = Decision::default();
        d.require_human("pick one", vec!["a".into(), "b".into()]);
        let v = fw.evaluate(d, PerceptionBus::new().stats());
        assert_eq!(v.action, VerdictAction::NeedsHuman);
        assert_eq!(v.reason.as_deref(), Some("pick one"));
        assert!(v.trip.is_none());
    }

    // ── Permissions and sandbox ──────────────────────────────────────────────

    #[test]
    fn traversal_write_is_sandboxed_and_needs_confirmation() {
        let fw = engine();
        let proposed = call("file_write", json!({"path": "../../etc/passwd", "content": "x"}));

        let check = fw.check_tool_permission(&proposed);
        assert_eq!(check.level, PermissionLevel::Confirm);
        assert!(check.needs_approval);
        assert!(!check.needs_preview);

        let sandboxed = fw.sandbox_args(&proposed);
        assert_eq!(sandboxed.str_arg("path"), Some("/srv/out/passwd"));
    }

    #[test]
    fn reads_outside_readable_paths_escalate() {
        let mut config = FirewallConfig::default();
        config
            .tool_permissions
            .insert("file_read".into(), PermissionLevel::Auto);
        let sandbox = Sandbox::with_working_dir("/srv/out", config.readable_paths.clone(), "/home/agent");
        let fw = FirewallEngine::with_sandbox(config, sandbox);

        let inside = fw.check_tool_permission(&call("file_read", json!({"path": "notes.md"})));
        assert!(!inside.needs_approval);

        let outside = fw.check_tool_permission(&call("file_read", json!({"path": "/etc/passwd"})));
        assert!(outside.needs_approval);
        assert_eq!(outside.level, PermissionLevel::Auto);

        let rewritten = fw.sandbox_args(&call("file_read", json!({"path": "/etc/passwd"})));
        assert_eq!(rewritten.str_arg("path"), Some("/srv/out/passwd"));
    }

    #[test]
    fn read_only_tools_cannot_traverse_out_of_the_sandbox() {
        let fw = engine();
        for tool in ["file_read", "file_list"] {
            let rewritten = fw.sandbox_args(&call(tool, json!({"path": "../../etc/passwd"})));
            assert_eq!(rewritten.str_arg("path"), Some("/srv/out/passwd"), "{tool}");
        }
    }

    #[test]
    fn approve_level_needs_preview() {
        let mut config = FirewallConfig::default();
        config
            .tool_permissions
            .insert("shell".into(), PermissionLevel::Approve);
        let fw = FirewallEngine::with_sandbox(config, Sandbox::with_working_dir("/o", vec![], "/w"));
        let check = fw.check_tool_permission(&call("shell", json!({"cmd": "ls"})));
        assert!(check.needs_approval && check.needs_preview);
    }

    #[test]
    fn filter_args_drops_undeclared_keys() {
        let schema = ToolSchema::new(
            "file_write",
            "",
            json!({"type": "object", "properties": {"path": {}, "content": {}}}),
        );
        let args = call("file_write", json!({"path": "a", "content": "b", "query": "c"})).args;
        let (kept, removed) = FirewallEngine::filter_args(&args, Some(&schema));
        assert_eq!(kept.len(), 2);
        assert_eq!(removed, vec!["query".to_string()]);

        let (all, none) = FirewallEngine::filter_args(&args, None);
        assert_eq!(all.len(), 3);
        assert!(none.is_empty());
    }

    // ── Escalation ───────────────────────────────────────────────────────────

    #[test]
    fn three_rejections_escalate_to_approve() {
        let mut fw = engine();
        let mut bus = PerceptionBus::new();
        for n in 1..=3 {
            bus.record_approval("delete_file", false, 1.0);
            let escalated = fw.should_escalate("delete_file", bus.stats());
            if n < 3 {
                assert!(escalated.is_none());
            } else {
                assert_eq!(escalated, Some(PermissionLevel::Approve));
            }
        }
        assert_eq!(fw.policy().user_permission("delete_file"), Some(PermissionLevel::Approve));
        assert_eq!(fw.policy().effective_permission("delete_file"), PermissionLevel::Approve);

        bus.clear_consecutive_rejects("delete_file");
        assert_eq!(bus.stats().consecutive_rejects("delete_file"), 0);
        assert!(fw.should_escalate("delete_file", bus.stats()).is_none());
    }

    // ── Constraints and deviation ────────────────────────────────────────────

    #[test]
    fn constraints_surface_failures_and_repeats() {
        let mut fw = engine();
        let mut state = TaskState::default();
        state.working_memory = Some(WorkingMemory {
            failed_approaches: vec!["scraping the site".into()],
            ..WorkingMemory::default()
        });
        state.push_finding(1, "tool:fetch", "[error] connection refused");
        state.push_finding(2, "tool:fetch", "[error] connection refused again");
        state.push_finding(3, "tool:file_read", "[success] [SAME as previous call - no new information] x");
        state.push_finding(4, TOOL_AVOIDANCE_KEY, "Stop using delete_file.");

        let bus = bus_with(&[0.9]);
        fw.evaluate(proposing(vec![call("t", json!({}))]), bus.stats());
        fw.evaluate(proposing(vec![call("t", json!({}))]), bus.stats());

        let hints = fw.build_constraints(&state);
        assert!(hints.iter().any(|h| h.contains("scraping the site")));
        assert_eq!(hints.iter().filter(|h| h.contains("'fetch' previously failed")).count(), 1);
        assert!(hints.iter().any(|h| h.contains("'file_read' with the same arguments")));
        assert!(hints.iter().any(|h| h == "Stop using delete_file."));
        assert!(hints.iter().any(|h| h.contains("repeated the previous tool calls")));
    }

    #[test]
    fn constraints_are_capped() {
        let fw = engine();
        let mut state = TaskState::default();
        for i in 0..20 {
            state.push_finding(i, format!("tool:t{i}"), "[error] nope");
        }
        assert_eq!(fw.build_constraints(&state).len(), 10);
    }

    #[test]
    fn deviation_messages() {
        let outcome = |status, summary: &str| ToolOutcome {
            tool: "t".into(),
            status,
            summary: summary.into(),
        };
        assert!(FirewallEngine::check_deviation("read", &[]).is_none());
        assert!(
            FirewallEngine::check_deviation("read", &[outcome(ToolStatus::Error, "[error] x")])
                .unwrap()
                .starts_with("All 1 tool call(s)")
        );
        assert!(
            FirewallEngine::check_deviation("read", &[outcome(ToolStatus::Ok, "[empty] ")])
                .unwrap()
                .contains("returned nothing")
        );
        assert!(
            FirewallEngine::check_deviation(
                "read",
                &[outcome(ToolStatus::Ok, "[success] a"), outcome(ToolStatus::Error, "[error] b")]
            )
            .unwrap()
            .starts_with("1 of 2")
        );
        assert!(
            FirewallEngine::check_deviation("read", &[outcome(ToolStatus::Ok, "[success] a")]).is_none()
        );
    }
}
