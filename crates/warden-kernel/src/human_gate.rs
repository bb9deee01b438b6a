//! [`HumanGate`] – the single channel between the agent and its operator.
//!
//! Each task owns one gate. The gate is a single-slot rendezvous: the
//! orchestrator arms it with [`HumanGate::open_request`], announces the
//! request to the UI, and awaits [`HumanGate::wait_for_human`]. The UI
//! answers through a cloneable [`HumanResponder`].
//!
//! Arming drains any stale reply, so a response can only satisfy the
//! request it was given for. A reply that arrives after arming but before
//! the orchestrator starts awaiting is buffered, not lost.
//!
//! # Example
//!
//! ```
//! use warden_kernel::human_gate::{HumanGate, Intent};
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let mut gate = HumanGate::new();
//! let responder = gate.responder();
//!
//! gate.open_request();
//! responder.provide_response("feedback", "use the staging database").unwrap();
//!
//! let reply = gate.wait_for_human().await;
//! assert_eq!(gate.parse_intent(&reply), Intent::FreeText);
//! # });
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};
use warden_types::WardenError;

const ABORT_WORDS: &[&str] = &[
    "abort", "stop", "quit", "exit", "end", "cancel", "finish", "enough", "terminate", "中止",
    "停止", "终止", "结束", "取消", "退出", "够了",
];

const CONFIRM_WORDS: &[&str] = &["confirm", "confirmed", "done", "lgtm", "确认", "完成", "可以了"];

const APPROVE_WORDS: &[&str] = &["approve", "approved", "yes", "y", "ok", "continue", "proceed"];

const REJECT_WORDS: &[&str] = &["reject", "rejected", "deny", "no", "n"];

/// Cues inside free text that suggest the operator wants to wrap up.
const STOP_CUES: &[&str] = &[
    "stop", "quit", "enough", "end", "done", "finish", "cancel", "exit", "terminate", "wrap up",
    "停", "结束", "够了", "不用了", "算了",
];

const CONFIRM_NOTE: &str = "[System note: the user confirmed the task is complete. \
Summarize the result and set task_complete to true.]";

const IMPLICIT_STOP_NOTE: &str = "[System note: the user appears to want to stop. \
Wrap up now: summarize what was done and set task_complete to true.]";

/// Decision value whose text carries the operator's words.
pub const FEEDBACK: &str = "feedback";

/// One operator response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanReply {
    pub decision: String,
    #[serde(default)]
    pub text: String,
}

impl HumanReply {
    pub fn new(decision: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            decision: decision.into(),
            text: text.into(),
        }
    }

    /// Stand-in for an answer that never arrived. Classifies as a rejection.
    pub fn no_response() -> Self {
        Self::new("reject", "no response received")
    }
}

/// Classified operator intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Approve,
    Reject,
    /// First stop request: let the model wrap up.
    Abort,
    /// Second consecutive stop request: terminate now.
    ForceAbort,
    ConfirmComplete,
    ImplicitStop,
    FreeText,
}

// ─────────────────────────────────────────────────────────────────────────────
// HumanResponder
// ─────────────────────────────────────────────────────────────────────────────

/// UI-side handle used to answer the gate's current request.
#[derive(Debug, Clone)]
pub struct HumanResponder {
    tx: mpsc::Sender<HumanReply>,
    armed: Arc<AtomicBool>,
}

impl HumanResponder {
    /// Deliver a response without blocking.
    ///
    /// Fails with [`WardenError::NotAwaitingHuman`] when no request is armed
    /// or when a response for the current request is already queued.
    pub fn provide_response(
        &self,
        decision: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<(), WardenError> {
        if !self.armed.load(Ordering::SeqCst) {
            return Err(WardenError::NotAwaitingHuman);
        }
        self.tx
            .try_send(HumanReply::new(decision, text))
            .map_err(|_| WardenError::NotAwaitingHuman)
    }

    /// Whether the gate is waiting for an answer.
    pub fn is_waiting(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HumanGate
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct HumanGate {
    rx: mpsc::Receiver<HumanReply>,
    tx: mpsc::Sender<HumanReply>,
    armed: Arc<AtomicBool>,
    consecutive_stops: u32,
}

impl Default for HumanGate {
    fn default() -> Self {
        Self::new()
    }
}

impl HumanGate {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            rx,
            tx,
            armed: Arc::new(AtomicBool::new(false)),
            consecutive_stops: 0,
        }
    }

    pub fn responder(&self) -> HumanResponder {
        HumanResponder {
            tx: self.tx.clone(),
            armed: Arc::clone(&self.armed),
        }
    }

    /// Drop any stale reply and start accepting one for a new request.
    pub fn open_request(&mut self) {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "discarded stale human replies");
        }
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Suspend until the operator answers. There is no timeout.
    ///
    /// Arms the gate first if [`HumanGate::open_request`] was not called.
    pub async fn wait_for_human(&mut self) -> HumanReply {
        if !self.is_armed() {
            self.open_request();
        }
        let reply = self.rx.recv().await;
        self.armed.store(false, Ordering::SeqCst);
        // The gate holds its own sender, so the channel cannot close.
        reply.unwrap_or_else(HumanReply::no_response)
    }

    /// Classify `reply`, tracking consecutive stop requests.
    ///
    /// A second abort in a row becomes [`Intent::ForceAbort`]; any other
    /// intent resets the sequence.
    pub fn parse_intent(&mut self, reply: &HumanReply) -> Intent {
        let intent = classify(reply);
        if intent != Intent::Abort {
            self.consecutive_stops = 0;
            return intent;
        }
        self.consecutive_stops += 1;
        if self.consecutive_stops >= 2 {
            info!(stops = self.consecutive_stops, "repeated stop request, forcing abort");
            Intent::ForceAbort
        } else {
            info!("stop requested, asking the model to wrap up");
            Intent::Abort
        }
    }

    /// Text merged into the task state for `reply`.
    pub fn build_decision_text(reply: &HumanReply, intent: Intent) -> String {
        let base = if normalize(&reply.decision) == FEEDBACK || reply.decision.trim().is_empty() {
            reply.text.trim().to_string()
        } else if reply.text.trim().is_empty() {
            reply.decision.trim().to_string()
        } else {
            format!("{}: {}", reply.decision.trim(), reply.text.trim())
        };
        match intent {
            Intent::ConfirmComplete => format!("{base}\n{CONFIRM_NOTE}"),
            Intent::ImplicitStop => format!("{base}\n{IMPLICIT_STOP_NOTE}"),
            _ => base,
        }
    }

    pub fn consecutive_stops(&self) -> u32 {
        self.consecutive_stops
    }

    pub fn restore_consecutive_stops(&mut self, count: u32) {
        self.consecutive_stops = count;
    }
}

fn normalize(s: &str) -> String {
    s.trim()
        .trim_end_matches(['.', '!', '。', '！'])
        .trim()
        .to_lowercase()
}

fn classify(reply: &HumanReply) -> Intent {
    let decision = normalize(&reply.decision);
    let subject = if decision == FEEDBACK {
        normalize(&reply.text)
    } else {
        decision
    };
    let word = subject.as_str();

    if ABORT_WORDS.contains(&word) {
        Intent::Abort
    } else if CONFIRM_WORDS.contains(&word) {
        Intent::ConfirmComplete
    } else if REJECT_WORDS.contains(&word) {
        Intent::Reject
    } else if APPROVE_WORDS.contains(&word) {
        Intent::Approve
    } else if contains_stop_cue(&reply.text) {
        Intent::ImplicitStop
    } else {
        Intent::FreeText
    }
}

/// ASCII cues match whole words; other cues match as substrings.
fn contains_stop_cue(text: &str) -> bool {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    STOP_CUES.iter().any(|cue| {
        if cue.is_ascii() {
            if cue.contains(' ') {
                lower.contains(cue)
            } else {
                words.contains(cue)
            }
        } else {
            lower.contains(cue)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn reply(decision: &str, text: &str) -> HumanReply {
        HumanReply::new(decision, text)
    }

    #[test]
    fn two_aborts_in_a_row_force_abort() {
        let mut gate = HumanGate::new();
        assert_eq!(gate.parse_intent(&reply("abort", "")), Intent::Abort);
        assert_eq!(gate.parse_intent(&reply("stop", "")), Intent::ForceAbort);
    }

    #[test]
    fn non_abort_between_aborts_resets_sequence() {
        for interleaved in [reply("reject", ""), reply("feedback", "try the other file")] {
            let mut gate = HumanGate::new();
            assert_eq!(gate.parse_intent(&reply("abort", "")), Intent::Abort);
            gate.parse_intent(&interleaved);
            assert_eq!(gate.consecutive_stops(), 0);
            assert_eq!(gate.parse_intent(&reply("abort", "")), Intent::Abort);
        }
    }

    #[test]
    fn feedback_text_is_classified() {
        let mut gate = HumanGate::new();
        assert_eq!(gate.parse_intent(&reply("feedback", "Quit.")), Intent::Abort);
        let mut gate = HumanGate::new();
        assert_eq!(gate.parse_intent(&reply("feedback", "lgtm")), Intent::ConfirmComplete);
        assert_eq!(gate.parse_intent(&reply("feedback", "退出")), Intent::Abort);
    }

    #[test]
    fn approve_reject_and_free_text() {
        let mut gate = HumanGate::new();
        assert_eq!(gate.parse_intent(&reply("approve", "")), Intent::Approve);
        assert_eq!(gate.parse_intent(&reply("reject", "too risky")), Intent::Reject);
        assert_eq!(
            gate.parse_intent(&reply("feedback", "please recommend a vendor")),
            Intent::FreeText,
            "'end' inside 'recommend' is not a stop cue"
        );
    }

    #[test]
    fn implicit_stop_from_cue_words() {
        let mut gate = HumanGate::new();
        assert_eq!(
            gate.parse_intent(&reply("feedback", "that is enough for today, thanks")),
            Intent::ImplicitStop
        );
        assert_eq!(
            gate.parse_intent(&reply("continue differently", "ok let's wrap up soon")),
            Intent::ImplicitStop
        );
        assert_eq!(gate.parse_intent(&reply("feedback", "好的，算了吧")), Intent::ImplicitStop);
    }

    #[test]
    fn decision_text_formats() {
        assert_eq!(
            HumanGate::build_decision_text(&reply("feedback", " use v2 "), Intent::FreeText),
            "use v2"
        );
        assert_eq!(
            HumanGate::build_decision_text(&reply("provide more information", "the id is 7"), Intent::FreeText),
            "provide more information: the id is 7"
        );
        let confirm = HumanGate::build_decision_text(&reply("confirm", ""), Intent::ConfirmComplete);
        assert!(confirm.starts_with("confirm\n"));
        assert!(confirm.contains("task_complete"));
        let stop = HumanGate::build_decision_text(&reply("feedback", "enough"), Intent::ImplicitStop);
        assert!(stop.contains("want to stop"));
    }

    #[test]
    fn only_approve_words_approve() {
        for answer in [
            reply("approve", ""),
            reply(" Yes ", ""),
            reply("feedback", "ok"),
        ] {
            assert_eq!(HumanGate::new().parse_intent(&answer), Intent::Approve, "{answer:?}");
        }
        for answer in [
            reply("abort", ""),
            reply("cancel", ""),
            reply("", ""),
            reply("feedback", "what does this tool do?"),
            reply(" Deny ", ""),
            HumanReply::no_response(),
        ] {
            assert_ne!(HumanGate::new().parse_intent(&answer), Intent::Approve, "{answer:?}");
        }
        assert_eq!(HumanGate::new().parse_intent(&HumanReply::no_response()), Intent::Reject);
    }

    #[test]
    fn response_without_request_is_refused() {
        let gate = HumanGate::new();
        let responder = gate.responder();
        assert_eq!(
            responder.provide_response("approve", ""),
            Err(WardenError::NotAwaitingHuman)
        );
    }

    #[test]
    fn second_response_for_same_request_is_refused() {
        let mut gate = HumanGate::new();
        let responder = gate.responder();
        gate.open_request();
        assert!(responder.provide_response("approve", "").is_ok());
        assert_eq!(
            responder.provide_response("reject", ""),
            Err(WardenError::NotAwaitingHuman)
        );
    }

    #[tokio::test]
    async fn response_between_arming_and_waiting_is_kept() {
        let mut gate = HumanGate::new();
        let responder = gate.responder();
        gate.open_request();
        responder.provide_response("approve", "go").unwrap();
        let got = gate.wait_for_human().await;
        assert_eq!(got, reply("approve", "go"));
        assert!(!gate.is_armed());
    }

    #[tokio::test]
    async fn stale_reply_cannot_satisfy_a_new_request() {
        let mut gate = HumanGate::new();
        let responder = gate.responder();

        gate.open_request();
        responder.provide_response("approve", "old").unwrap();
        // A new request replaces the unanswered one.
        gate.open_request();

        let waiter = {
            let responder = responder.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                responder.provide_response("reject", "new").unwrap();
            })
        };
        let got = gate.wait_for_human().await;
        waiter.await.unwrap();
        assert_eq!(got, reply("reject", "new"));
    }

    #[tokio::test]
    async fn wait_arms_the_gate_itself() {
        let mut gate = HumanGate::new();
        let responder = gate.responder();
        let answer = tokio::spawn(async move {
            while !responder.is_waiting() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            responder.provide_response("feedback", "hi").unwrap();
        });
        let got = gate.wait_for_human().await;
        answer.await.unwrap();
        assert_eq!(got.text, "hi");
    }

    #[test]
    fn restore_consecutive_stops_continues_sequence() {
        let mut gate = HumanGate::new();
        gate.restore_consecutive_stops(1);
        assert_eq!(gate.parse_intent(&reply("abort", "")), Intent::ForceAbort);
    }
}
