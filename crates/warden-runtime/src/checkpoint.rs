//! Checkpoint capture and restore.
//!
//! [`LoopKernel`] bundles the per-task kernel components whose loop-local
//! state does not live in [`TaskState`][warden_types::TaskState]: loop
//! counters, the confidence window, the tool-output cache and the
//! consecutive-stop counter. [`LoopKernel::capture`] freezes that state
//! into a [`Checkpoint`]; [`LoopKernel::restore`] thaws it.

use tracing::{info, warn};
use warden_kernel::perception::PerceptionSnapshot;
use warden_kernel::{FirewallEngine, HumanGate, PerceptionBus};
use warden_types::{Checkpoint, PauseReason, PendingRequest};

/// Orchestrator-owned values that survive a pause.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopLocals {
    /// Seconds spent in earlier runs of this task.
    pub elapsed_offset: f64,
    pub announced_subtask: Option<u32>,
    pub wrap_up_injected: bool,
    pub completion_confirmed: bool,
}

/// What a consumed checkpoint hands back to the loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Resumed {
    pub reason: PauseReason,
    pub paused_at_step: u32,
    pub locals: LoopLocals,
    pub pending: Option<PendingRequest>,
}

#[derive(Debug)]
pub struct LoopKernel {
    pub firewall: FirewallEngine,
    pub perception: PerceptionBus,
    pub gate: HumanGate,
}

impl LoopKernel {
    pub fn new(firewall: FirewallEngine, perception: PerceptionBus) -> Self {
        Self {
            firewall,
            perception,
            gate: HumanGate::new(),
        }
    }

    pub fn capture(
        &self,
        reason: PauseReason,
        step: u32,
        elapsed_secs: f64,
        locals: &LoopLocals,
        pending: Option<PendingRequest>,
    ) -> Checkpoint {
        let snapshot = self.perception.snapshot();
        let mut cp = Checkpoint::new(reason, step);
        cp.elapsed_secs = elapsed_secs;
        cp.loop_state = self.firewall.loop_state().clone();
        cp.confidence_window = snapshot.confidence_window;
        cp.tool_outputs = snapshot.tool_outputs;
        cp.consecutive_stops = self.gate.consecutive_stops();
        cp.announced_subtask = locals.announced_subtask;
        cp.wrap_up_injected = locals.wrap_up_injected;
        cp.completion_confirmed = locals.completion_confirmed;
        cp.pending = pending;
        cp
    }

    /// Load `cp` into the kernel components. Returns `None` for a checkpoint
    /// written by a newer build; it is then ignored.
    pub fn restore(&mut self, cp: &Checkpoint) -> Option<Resumed> {
        if !cp.is_supported() {
            warn!(version = cp.version, "discarding checkpoint with unsupported version");
            return None;
        }
        self.firewall.restore_loop_state(cp.loop_state.clone());
        self.perception.restore(PerceptionSnapshot {
            confidence_window: cp.confidence_window.clone(),
            tool_outputs: cp.tool_outputs.clone(),
        });
        self.gate.restore_consecutive_stops(cp.consecutive_stops);
        info!(step = cp.paused_at_step, reason = %cp.reason, "checkpoint restored");
        Some(Resumed {
            reason: cp.reason,
            paused_at_step: cp.paused_at_step,
            locals: LoopLocals {
                elapsed_offset: cp.elapsed_secs,
                announced_subtask: cp.announced_subtask,
                wrap_up_injected: cp.wrap_up_injected,
                completion_confirmed: cp.completion_confirmed,
            },
            pending: cp.pending.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};
    use warden_kernel::human_gate::HumanReply;
    use warden_kernel::{FirewallConfig, Sandbox};
    use warden_types::{CHECKPOINT_VERSION, Decision, ToolCall};

    fn kernel() -> LoopKernel {
        let sandbox = Sandbox::with_working_dir("/out", vec![], "/work");
        LoopKernel::new(
            FirewallEngine::with_sandbox(FirewallConfig::default(), sandbox),
            PerceptionBus::new(),
        )
    }

    fn busy_kernel() -> LoopKernel {
        let mut k = kernel();
        k.perception.record_confidence(0.4);
        k.perception.record_confidence(0.7);
        k.perception.detect_repeat("search", &Map::new(), "three hits");
        let call = ToolCall::new("search", json!({"q": "x"}).as_object().cloned().unwrap_or_default());
        let decision = Decision {
            tool_calls: vec![call],
            ..Decision::default()
        };
        k.firewall.evaluate(decision.clone(), k.perception.stats());
        k.firewall.evaluate(decision, k.perception.stats());
        k.gate.parse_intent(&HumanReply::new("feedback", "stop"));
        k
    }

    #[test]
    fn save_restore_save_is_identical() {
        let locals = LoopLocals {
            elapsed_offset: 0.0,
            announced_subtask: Some(2),
            wrap_up_injected: true,
            completion_confirmed: false,
        };
        let pending = PendingRequest::HumanDecision {
            step: 7,
            reason: "pick".into(),
            options: vec!["a".into(), "b".into()],
        };
        let source = busy_kernel();
        let first = source.capture(PauseReason::HitlWait, 7, 12.5, &locals, Some(pending.clone()));
        assert_eq!(first.loop_state.repeat_count, 1);
        assert_eq!(first.consecutive_stops, 1);

        let mut target = kernel();
        let resumed = target.restore(&first).unwrap();
        assert_eq!(resumed.pending, Some(pending.clone()));
        assert_eq!(resumed.locals.elapsed_offset, 12.5);
        assert_eq!(resumed.locals.announced_subtask, Some(2));

        let second = target.capture(PauseReason::HitlWait, 7, 12.5, &locals, Some(pending));
        assert_eq!(first, second);
    }

    #[test]
    fn checkpoint_survives_json() {
        let cp = busy_kernel().capture(PauseReason::ToolConfirmWait, 3, 1.0, &LoopLocals::default(), None);
        let text = serde_json::to_string(&cp).unwrap();
        let back: Checkpoint = serde_json::from_str(&text).unwrap();
        assert_eq!(back, cp);
        assert_eq!(back.version, CHECKPOINT_VERSION);
    }

    #[test]
    fn newer_checkpoints_are_discarded() {
        let mut cp = Checkpoint::new(PauseReason::UserStop, 4);
        cp.version = CHECKPOINT_VERSION + 1;
        cp.consecutive_stops = 1;
        let mut k = kernel();
        assert!(k.restore(&cp).is_none());
        assert_eq!(k.gate.consecutive_stops(), 0);
    }
}
