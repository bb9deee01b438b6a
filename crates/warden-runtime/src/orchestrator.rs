//! [`Orchestrator`] – the cognitive loop that drives one Task.
//!
//! Each step:
//!
//! 1. **Budget** – past `max_steps` the model gets one wrap-up step; if it
//!    still has not finished by the next one the Task is force-paused.
//! 2. **Prompt** – the context capability assembles the prompt from the task
//!    state, retrieved memories, the tool list and the firewall's constraint
//!    hints.
//! 3. **Decide** – the LLM answers; the answer is parsed and evaluated by the
//!    [`FirewallEngine`]. A transport failure pauses the Task.
//! 4. **Act** – allowed tool calls are filtered, permission-checked,
//!    confirmed by the operator when required, sandboxed and executed. Each
//!    result is classified and merged into the task state; a tool transport
//!    failure pauses the Task.
//! 5. **Gatekeep** – human-required decisions and unconfirmed completions
//!    wait on the [`HumanGate`].
//! 6. **Maintain** – periodic reflection, subtask bookkeeping and context
//!    compression.
//!
//! # Checkpoints
//!
//! A checkpoint is written before every human wait and on every pause. On
//! the next [`Orchestrator::run`] it is restored and deleted, and a request
//! that was pending when the run stopped is presented again before the loop
//! continues.
//!
//! # Cancellation
//!
//! Every suspension point races the run's [`CancellationToken`]. A cancelled
//! run writes a `user_stop` checkpoint that keeps the pending request, marks
//! the Task paused and returns [`WardenError::Cancelled`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use warden_runtime::config::RuntimeConfig;
//! use warden_runtime::orchestrator::Orchestrator;
//! use warden_runtime::plugin_registry::PluginRegistry;
//! use warden_runtime::store::InMemoryTaskStore;
//!
//! # async fn demo(registry: PluginRegistry, task_id: uuid::Uuid) {
//! let store = Arc::new(InMemoryTaskStore::new());
//! let mut orchestrator = Orchestrator::new(RuntimeConfig::default(), Arc::new(registry), store);
//! let outcome = orchestrator.run(task_id, CancellationToken::new()).await;
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use warden_kernel::sandbox;
use warden_kernel::{
    FirewallEngine, HumanGate, HumanResponder, Intent, PerceptionBus, PermissionCheck,
    TOOL_AVOIDANCE_KEY, Trip, VerdictAction,
};
use warden_types::{
    PauseReason, PendingRequest, Step, StepStatus, Task, TaskStatus, ToolCall, ToolOutcome,
    ToolSchema, ToolStatus, WardenError,
};

use crate::capabilities::{
    ContextCapability, LlmCapability, MemoryCapability, PlanningCapability, PromptInputs,
    TaskStore, ToolCapability,
};
use crate::checkpoint::{LoopKernel, LoopLocals};
use crate::config::RuntimeConfig;
use crate::context::{RESUMED_KEY, parse_working_memory};
use crate::events::{EventBus, KernelEvent};
use crate::plugin_registry::PluginRegistry;

// ─────────────────────────────────────────────────────────────────────────────
// Finding keys and notes
// ─────────────────────────────────────────────────────────────────────────────

pub const HUMAN_DECISION_KEY: &str = "human_decision";
pub const STEP_LIMIT_KEY: &str = "system:step_limit";
pub const USER_STOP_KEY: &str = "system:user_stop_request";
pub const DEVIATION_KEY: &str = "system:deviation";
pub const BLOCKED_KEY: &str = "system:blocked";
pub const PLAN_KEY: &str = "system:plan";
pub const HESITATION_KEY: &str = "perception:hesitation";
pub const META_KEY: &str = "perception:meta";
pub const APPROVAL_PATTERNS_KEY: &str = "perception:approval_patterns";
pub const RESPONSE_KEY: &str = "response";

/// Memory category under which approval preferences are stored.
pub const PREFERENCE_CATEGORY: &str = "preference";
const PREFERENCE_TAG: &str = "implicit_preference";

const WRAP_UP_NOTE: &str = "This is your final step. Summarize what has been done and set \
task_complete to true.";

const USER_STOP_NOTE: &str = "The user asked to stop. Do not start new work: summarize what has \
been done and set task_complete to true.";

const CONFIRM_REASON: &str = "The model reports the task as complete. Confirm to finish, or \
revise to keep working.";

const RESPONSE_CHARS: usize = 300;

// ─────────────────────────────────────────────────────────────────────────────
// Public types
// ─────────────────────────────────────────────────────────────────────────────

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Aborted,
    /// The Task is paused with a checkpoint and can be run again.
    Paused(PauseReason),
}

// ─────────────────────────────────────────────────────────────────────────────
// Run-local state
// ─────────────────────────────────────────────────────────────────────────────

struct Capabilities {
    llm: Arc<dyn LlmCapability>,
    tools: Arc<dyn ToolCapability>,
    context: Arc<dyn ContextCapability>,
    memory: Arc<dyn MemoryCapability>,
    planner: Option<Arc<dyn PlanningCapability>>,
}

impl Capabilities {
    /// Every capability the loop needs. The planner is only required when
    /// planning is enabled.
    fn resolve(registry: &PluginRegistry, planning: bool) -> Result<Self, WardenError> {
        let planner = if planning {
            Some(registry.get::<dyn PlanningCapability>()?)
        } else {
            None
        };
        Ok(Self {
            llm: registry.get::<dyn LlmCapability>()?,
            tools: registry.get::<dyn ToolCapability>()?,
            context: registry.get::<dyn ContextCapability>()?,
            memory: registry.get::<dyn MemoryCapability>()?,
            planner,
        })
    }
}

struct RunState {
    locals: LoopLocals,
    started: Instant,
    /// The request the loop is currently waiting on, if any.
    pending: Option<PendingRequest>,
}

impl RunState {
    fn new() -> Self {
        Self {
            locals: LoopLocals::default(),
            started: Instant::now(),
            pending: None,
        }
    }

    /// Seconds spent on the task across every run.
    fn elapsed(&self) -> f64 {
        self.locals.elapsed_offset + self.started.elapsed().as_secs_f64()
    }
}

/// What the operator's answer to a human request means for the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HumanTurn {
    Continue,
    /// First stop request. The wrap-up note is in place; the step ends
    /// without plan or reflection bookkeeping.
    WrapUp,
    ForceAbort,
}

/// How one proposed tool call ended.
#[derive(Debug)]
enum ToolTurn {
    Done(ToolOutcome),
    /// Refused because the operator asked to stop.
    WrapUp(ToolOutcome),
    ForceAbort,
    /// The tool capability itself failed.
    TransportFailed(String),
}

/// Race `fut` against cancellation.
async fn suspend<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, WardenError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WardenError::Cancelled),
        out = fut => Ok(out),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push_str("...");
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

/// Drives one Task. Construct one per Task; instances share nothing.
pub struct Orchestrator {
    config: RuntimeConfig,
    registry: Arc<PluginRegistry>,
    store: Arc<dyn TaskStore>,
    kernel: LoopKernel,
    events: EventBus,
}

impl Orchestrator {
    pub fn new(config: RuntimeConfig, registry: Arc<PluginRegistry>, store: Arc<dyn TaskStore>) -> Self {
        let firewall = FirewallEngine::new(config.firewall.clone());
        let perception = PerceptionBus::with_window_capacity(config.confidence_window);
        Self {
            config,
            registry,
            store,
            kernel: LoopKernel::new(firewall, perception),
            events: EventBus::default(),
        }
    }

    /// Swap in a prepared firewall, e.g. one with a custom sandbox root.
    pub fn with_firewall(mut self, firewall: FirewallEngine) -> Self {
        self.kernel.firewall = firewall;
        self
    }

    /// Handle for answering human requests from the UI.
    pub fn responder(&self) -> HumanResponder {
        self.kernel.gate.responder()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run `task_id` until it completes, aborts, pauses or fails.
    ///
    /// # Errors
    ///
    /// - [`WardenError::TaskNotFound`] / [`WardenError::TaskFinished`] before
    ///   anything runs.
    /// - [`WardenError::CapabilityMissing`] when a required capability is not
    ///   registered.
    /// - [`WardenError::Cancelled`] after the cancellation checkpoint.
    /// - Any other error after the Task was marked failed.
    #[instrument(skip(self, cancel), fields(task_id = %task_id))]
    pub async fn run(&mut self, task_id: Uuid, cancel: CancellationToken) -> Result<RunOutcome, WardenError> {
        let mut task = self.store.load_task(task_id)?;
        if task.status.is_terminal() {
            return Err(WardenError::TaskFinished(task_id));
        }
        let caps = Capabilities::resolve(&self.registry, self.config.planning.enabled)?;
        let mut run = RunState::new();

        let result = self.drive(&mut task, &mut run, &caps, &cancel).await;
        let result = match result {
            Ok(outcome) => {
                info!(?outcome, steps = task.state.step_count, "run finished");
                Ok(outcome)
            }
            Err(WardenError::Cancelled) => {
                self.on_cancel(&mut task, &run, caps.memory.as_ref());
                Err(WardenError::Cancelled)
            }
            Err(e) => {
                self.on_failure(&mut task, &run, &e);
                Err(e)
            }
        };

        caps.tools.disconnect().await;
        caps.llm.close().await;
        result
    }

    // ── Run phases ───────────────────────────────────────────────────────────

    async fn drive(
        &mut self,
        task: &mut Task,
        run: &mut RunState,
        caps: &Capabilities,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, WardenError> {
        match suspend(cancel, caps.tools.connect()).await? {
            Ok(lines) => {
                for line in lines {
                    self.events.info(task.id, line);
                }
            }
            Err(e) => warn!(error = %e, "tool connection failed; continuing with available tools"),
        }
        let tools = caps.tools.list_tools();
        self.kernel.firewall.register_tools(&tools);

        task.set_status(TaskStatus::Running);
        let resumed = task
            .state
            .checkpoint
            .take()
            .and_then(|cp| self.kernel.restore(&cp));
        let mut pending = None;
        if let Some(resumed) = resumed {
            run.locals = resumed.locals;
            task.state.push_finding(
                task.state.step_count,
                RESUMED_KEY,
                format!(
                    "Task resumed after a pause ({}) at step {}. Do not repeat work that is \
                     already done; continue from where it stopped.",
                    resumed.reason, resumed.paused_at_step
                ),
            );
            self.events.info(task.id, format!("Resuming from step {}", resumed.paused_at_step));
            pending = resumed.pending;
        }
        self.persist(task)?;

        if task.state.plan.is_none()
            && let Some(planner) = &caps.planner
        {
            self.plan(task, planner.as_ref(), caps.memory.as_ref(), &tools, cancel)
                .await?;
        }

        if let Some(request) = pending
            && let Some(outcome) = self.represent(task, run, caps, request, cancel).await?
        {
            return Ok(outcome);
        }

        loop {
            if let Some(outcome) = self.step(task, run, caps, &tools, cancel).await? {
                return Ok(outcome);
            }
        }
    }

    async fn plan(
        &mut self,
        task: &mut Task,
        planner: &dyn PlanningCapability,
        memory: &dyn MemoryCapability,
        tools: &[ToolSchema],
        cancel: &CancellationToken,
    ) -> Result<(), WardenError> {
        let memories = self.memories(memory, &task.goal);
        match suspend(cancel, planner.generate_plan(task, &memories, tools)).await? {
            Ok(Some(plan)) => {
                let count = plan.subtasks.len();
                task.state.install_plan(plan);
                self.events.info(task.id, format!("Plan created with {count} subtasks"));
                self.persist(task)?;
            }
            Ok(None) => info!("no plan produced; running without one"),
            Err(e) => warn!(error = %e, "planning failed; running without a plan"),
        }
        Ok(())
    }

    /// Present the request that was pending when the previous run stopped.
    async fn represent(
        &mut self,
        task: &mut Task,
        run: &mut RunState,
        caps: &Capabilities,
        request: PendingRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<RunOutcome>, WardenError> {
        let mut step = self.load_step(task.id, request.step())?;
        info!(step = step.sequence, "re-presenting pending request");
        let force_abort = match request {
            PendingRequest::HumanDecision { reason, options, .. } => {
                self.ask_human(task, run, &mut step, reason, options, cancel).await? == HumanTurn::ForceAbort
            }
            PendingRequest::ToolConfirmation { call, needs_preview, .. } => {
                let mut check = self.kernel.firewall.check_tool_permission(&call);
                check.needs_preview = needs_preview;
                let turn = match self.confirm_tool(task, run, &mut step, &call, check, cancel).await? {
                    Some(refused) => refused,
                    None => self.execute_tool(task, &mut step, caps, call, &[], cancel).await?,
                };
                match turn {
                    ToolTurn::Done(outcome) | ToolTurn::WrapUp(outcome) => {
                        step.tool_results.push(outcome);
                        false
                    }
                    ToolTurn::ForceAbort => true,
                    ToolTurn::TransportFailed(message) => {
                        return self
                            .fail_and_pause(task, run, &mut step, PauseReason::ToolFailure, &message)
                            .map(Some);
                    }
                }
            }
        };
        if force_abort {
            self.store.save_step(&step)?;
            return self.abort(task, caps.memory.as_ref()).map(Some);
        }
        self.end_step(task, &mut step)?;
        Ok(None)
    }

    /// One iteration of the loop. `Some` ends the run.
    async fn step(
        &mut self,
        task: &mut Task,
        run: &mut RunState,
        caps: &Capabilities,
        tools: &[ToolSchema],
        cancel: &CancellationToken,
    ) -> Result<Option<RunOutcome>, WardenError> {
        let number = task.state.step_count + 1;

        let max = self.config.max_steps;
        if max > 0 && number > max {
            if !run.locals.wrap_up_injected {
                warn!(step = number, max_steps = max, "step budget exhausted; requesting wrap-up");
                task.state.push_finding(number, STEP_LIMIT_KEY, WRAP_UP_NOTE);
                run.locals.wrap_up_injected = true;
                run.locals.completion_confirmed = true;
            } else if number > max + 1 {
                warn!(step = number, "model did not wrap up; pausing task");
                self.persist_preferences(caps.memory.as_ref());
                return self
                    .pause(task, run, PauseReason::StepLimitExceeded, "Step limit exceeded")
                    .map(Some);
            }
        }

        task.state.step_count = number;
        self.announce_subtask(task, run);

        let mut step = Step::new(task.id, number);
        step.set_status(StepStatus::RunningLlm);
        let query = task
            .state
            .current_subtask()
            .map(|s| s.title.clone())
            .unwrap_or_else(|| task.goal.clone());
        let memories = self.memories(caps.memory.as_ref(), &query);
        let constraints = self.kernel.firewall.build_constraints(&task.state);
        let prompt = caps.context.build_prompt(
            task,
            &PromptInputs {
                memories: &memories,
                tools,
                constraints: &constraints,
                elapsed_secs: run.elapsed(),
                max_steps: max,
            },
        );
        step.prompt = prompt.clone();
        self.store.save_step(&step)?;
        self.emit_step(&step);

        let system = self.kernel.firewall.system_prompt();
        let response = match suspend(cancel, caps.llm.call(&prompt, &system)).await? {
            Ok(text) => text,
            Err(e) => {
                return self
                    .fail_and_pause(task, run, &mut step, PauseReason::LlmFailure, &format!("LLM call failed: {e}"))
                    .map(Some);
            }
        };
        step.llm_response = response.clone();

        // ── Decide ──
        let parsed = self.kernel.firewall.parse_decision(&response);
        self.kernel.perception.record_confidence(parsed.confidence);
        let verdict = self
            .kernel
            .firewall
            .evaluate(parsed, self.kernel.perception.stats());
        if let Some(Trip::LowConfidence { .. }) = verdict.trip {
            self.kernel.perception.clear_confidence_window();
        }
        let mut decision = verdict.decision;
        step.title = decision.title().to_string();
        step.tool_calls = decision.tool_calls.clone();
        if let Some(reflection) = &decision.reflection {
            task.state.last_reflection = Some(reflection.clone());
        }
        debug!(action = ?verdict.action, confidence = decision.confidence, "decision evaluated");

        let mut outcomes: Vec<ToolOutcome> = verdict
            .blocked_calls
            .iter()
            .map(|call| {
                let summary = format!("[blocked] Unknown tool '{}'", call.tool);
                task.state.push_finding(number, format!("tool:{}", call.tool), summary.clone());
                ToolOutcome {
                    tool: call.tool.clone(),
                    status: ToolStatus::Blocked,
                    summary,
                }
            })
            .collect();
        if verdict.action == VerdictAction::Block
            && let Some(reason) = &verdict.reason
        {
            task.state.push_finding(number, BLOCKED_KEY, reason.clone());
        }

        // ── Act ──
        let mut wrap_up = false;
        if verdict.action == VerdictAction::Allow {
            for call in decision.tool_calls.clone() {
                match self.run_tool(task, run, caps, tools, &mut step, call, cancel).await? {
                    ToolTurn::Done(outcome) => outcomes.push(outcome),
                    ToolTurn::WrapUp(outcome) => {
                        outcomes.push(outcome);
                        wrap_up = true;
                        break;
                    }
                    ToolTurn::ForceAbort => {
                        step.tool_results = outcomes;
                        step.decision = Some(decision);
                        step.set_status(StepStatus::Completed);
                        self.store.save_step(&step)?;
                        self.emit_step(&step);
                        return self.abort(task, caps.memory.as_ref()).map(Some);
                    }
                    ToolTurn::TransportFailed(message) => {
                        step.tool_results = outcomes;
                        step.decision = Some(decision);
                        return self
                            .fail_and_pause(task, run, &mut step, PauseReason::ToolFailure, &message)
                            .map(Some);
                    }
                }
            }
        }
        if let Some(warning) = FirewallEngine::check_deviation(decision.title(), &outcomes) {
            task.state.push_finding(number, DEVIATION_KEY, warning);
        }
        step.tool_results = outcomes;
        if wrap_up {
            step.decision = Some(decision);
            self.end_step(task, &mut step)?;
            return Ok(None);
        }

        // ── Gatekeep ──
        let mut needs_human = verdict.action == VerdictAction::NeedsHuman;
        if decision.task_complete && !needs_human {
            if run.locals.completion_confirmed {
                step.decision = Some(decision);
                step.set_status(StepStatus::Completed);
                self.store.save_step(&step)?;
                self.emit_step(&step);
                return self.complete(task, caps.memory.as_ref()).map(Some);
            }
            decision.require_human(CONFIRM_REASON, vec!["confirm".to_string(), "revise".to_string()]);
            needs_human = true;
        }
        step.decision = Some(decision.clone());

        if needs_human {
            let reason = decision
                .human_reason
                .clone()
                .unwrap_or_else(|| "The model needs your input.".to_string());
            match self
                .ask_human(task, run, &mut step, reason, decision.options.clone(), cancel)
                .await?
            {
                HumanTurn::Continue => {}
                HumanTurn::WrapUp => {
                    self.end_step(task, &mut step)?;
                    return Ok(None);
                }
                HumanTurn::ForceAbort => {
                    self.store.save_step(&step)?;
                    return self.abort(task, caps.memory.as_ref()).map(Some);
                }
            }
        } else if step.tool_calls.is_empty() {
            let text = if decision.next_action.description.is_empty() {
                response.as_str()
            } else {
                decision.next_action.description.as_str()
            };
            task.state.push_finding(number, RESPONSE_KEY, truncate(text, RESPONSE_CHARS));
        }

        // ── Maintain ──
        let interval = self.config.reflection_interval;
        if interval > 0 && number % interval == 0 {
            self.reflect(task, caps, &step.title, cancel).await?;
        }
        if decision.subtask_complete && task.state.plan.is_some() {
            self.finish_subtask(task, caps, decision.title(), cancel).await?;
        }
        caps.context.compress_if_needed(&mut task.state);

        self.end_step(task, &mut step)?;
        Ok(None)
    }

    // ── Tools ────────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn run_tool(
        &mut self,
        task: &mut Task,
        run: &mut RunState,
        caps: &Capabilities,
        tools: &[ToolSchema],
        step: &mut Step,
        call: ToolCall,
        cancel: &CancellationToken,
    ) -> Result<ToolTurn, WardenError> {
        let schema = tools.iter().find(|t| t.name == call.tool);
        let (args, removed) = FirewallEngine::filter_args(&call.args, schema);
        if !removed.is_empty() {
            warn!(tool = %call.tool, removed = ?removed, "dropped undeclared tool arguments");
        }
        let call = ToolCall::new(call.tool, args);

        let check = self.kernel.firewall.check_tool_permission(&call);
        if check.needs_approval
            && let Some(refused) = self.confirm_tool(task, run, step, &call, check, cancel).await?
        {
            return Ok(refused);
        }
        self.execute_tool(task, step, caps, call, &removed, cancel).await
    }

    /// Ask the operator about `call`. `None` means approved; only an approve
    /// word approves. `Some` carries how the refused call ended.
    async fn confirm_tool(
        &mut self,
        task: &mut Task,
        run: &mut RunState,
        step: &mut Step,
        call: &ToolCall,
        check: PermissionCheck,
        cancel: &CancellationToken,
    ) -> Result<Option<ToolTurn>, WardenError> {
        step.set_status(StepStatus::AwaitingHuman);
        self.store.save_step(step)?;
        self.emit_step(step);

        run.pending = Some(PendingRequest::ToolConfirmation {
            step: step.sequence,
            call: call.clone(),
            needs_preview: check.needs_preview,
        });
        task.set_status(TaskStatus::Paused);
        self.checkpoint(task, run, PauseReason::ToolConfirmWait)?;

        self.kernel.gate.open_request();
        self.events.publish(KernelEvent::ToolConfirmRequired {
            task_id: task.id,
            step: step.sequence,
            call: call.clone(),
            level: check.level,
            needs_preview: check.needs_preview,
        });
        let asked = Instant::now();
        let reply = suspend(cancel, self.kernel.gate.wait_for_human()).await?;
        let latency = asked.elapsed().as_secs_f64();

        run.pending = None;
        task.state.checkpoint = None;
        task.set_status(TaskStatus::Running);

        let intent = self.kernel.gate.parse_intent(&reply);
        if let Some(note) = PerceptionBus::hesitation_note(&call.tool, latency, self.config.hesitation_threshold_secs) {
            task.state.push_finding(step.sequence, HESITATION_KEY, note);
        }
        step.human_decision = Some(reply.decision.clone());
        if !reply.text.trim().is_empty() {
            step.human_input = Some(reply.text.clone());
        }

        match intent {
            Intent::Approve => {
                info!(tool = %call.tool, "tool call approved");
                self.kernel.perception.record_approval(&call.tool, true, latency);
                step.set_status(StepStatus::Approved);
                self.persist(task)?;
                return Ok(None);
            }
            Intent::ForceAbort => {
                info!(tool = %call.tool, "tool call refused; repeated stop request");
                step.set_status(StepStatus::Rejected);
                self.persist(task)?;
                return Ok(Some(ToolTurn::ForceAbort));
            }
            Intent::Abort => {
                info!(tool = %call.tool, "tool call refused; stop requested");
                step.set_status(StepStatus::Rejected);
                let summary = "[rejected] the user asked to stop".to_string();
                task.state.push_finding(step.sequence, format!("tool:{}", call.tool), summary.clone());
                task.state.push_finding(step.sequence, USER_STOP_KEY, USER_STOP_NOTE);
                run.locals.completion_confirmed = true;
                self.persist(task)?;
                return Ok(Some(ToolTurn::WrapUp(ToolOutcome {
                    tool: call.tool.clone(),
                    status: ToolStatus::Rejected,
                    summary,
                })));
            }
            _ => {}
        }

        info!(tool = %call.tool, ?intent, "tool call rejected");
        self.kernel.perception.record_approval(&call.tool, false, latency);
        step.set_status(StepStatus::Rejected);
        let reason = match reply.text.trim() {
            "" => "rejected by the user",
            text => text,
        };
        let summary = format!("[rejected] {reason}");
        task.state.push_finding(step.sequence, format!("tool:{}", call.tool), summary.clone());
        if intent == Intent::ImplicitStop {
            run.locals.completion_confirmed = true;
            task.state
                .push_finding(step.sequence, HUMAN_DECISION_KEY, HumanGate::build_decision_text(&reply, intent));
        }

        if let Some(level) = self
            .kernel
            .firewall
            .should_escalate(&call.tool, self.kernel.perception.stats())
        {
            self.kernel.perception.clear_consecutive_rejects(&call.tool);
            let note = format!(
                "Tool '{}' was rejected {} times in a row and now always needs approval ({level}). \
                 Prefer another approach.",
                call.tool, self.config.firewall.escalate_after_rejects
            );
            self.events.info(task.id, note.clone());
            task.state.push_finding(step.sequence, TOOL_AVOIDANCE_KEY, note);
        }
        self.persist(task)?;
        Ok(Some(ToolTurn::Done(ToolOutcome {
            tool: call.tool.clone(),
            status: ToolStatus::Rejected,
            summary,
        })))
    }

    async fn execute_tool(
        &mut self,
        task: &mut Task,
        step: &mut Step,
        caps: &Capabilities,
        call: ToolCall,
        removed: &[String],
        cancel: &CancellationToken,
    ) -> Result<ToolTurn, WardenError> {
        let call = self.kernel.firewall.sandbox_args(&call);
        step.set_status(StepStatus::RunningTool);
        self.emit_step(step);

        let result = match suspend(cancel, caps.tools.execute(&call)).await? {
            Ok(result) => result,
            Err(e) => {
                task.state.push_finding(
                    step.sequence,
                    format!("tool:{}", call.tool),
                    format!("[error] transport failed: {e}"),
                );
                return Ok(ToolTurn::TransportFailed(format!("Tool '{}' failed: {e}", call.tool)));
            }
        };

        if result.status == ToolStatus::Ok
            && !self.kernel.firewall.config().read_only_tools.contains(&call.tool)
            && let Some(path) = sandbox::path_argument(&call)
            && !task.state.artifacts.iter().any(|a| a == path)
        {
            task.state.artifacts.push(path.to_string());
        }

        let mut summary = caps.context.summarize_tool_result(&call.tool, &result);
        let class = PerceptionBus::classify_result(&result);
        let repeat = self.kernel.perception.detect_repeat(&call.tool, &call.args, &summary);
        if !removed.is_empty() {
            summary.push_str(&format!(" [warning: undeclared parameters removed: {}]", removed.join(", ")));
        }
        let value = format!("{} {summary}{}", class.tag(), repeat.note());
        task.state
            .push_finding(step.sequence, format!("tool:{}", call.tool), value.clone());
        debug!(tool = %call.tool, class = class.as_str(), "tool result merged");

        Ok(ToolTurn::Done(ToolOutcome {
            tool: call.tool,
            status: result.status,
            summary: value,
        }))
    }

    // ── Human requests ───────────────────────────────────────────────────────

    async fn ask_human(
        &mut self,
        task: &mut Task,
        run: &mut RunState,
        step: &mut Step,
        reason: String,
        options: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<HumanTurn, WardenError> {
        step.set_status(StepStatus::AwaitingHuman);
        self.store.save_step(step)?;
        self.emit_step(step);

        run.pending = Some(PendingRequest::HumanDecision {
            step: step.sequence,
            reason: reason.clone(),
            options: options.clone(),
        });
        task.set_status(TaskStatus::Paused);
        self.checkpoint(task, run, PauseReason::HitlWait)?;

        self.kernel.gate.open_request();
        self.events.publish(KernelEvent::HumanRequired {
            task_id: task.id,
            step: step.sequence,
            reason,
            options,
        });
        let reply = suspend(cancel, self.kernel.gate.wait_for_human()).await?;

        run.pending = None;
        task.state.checkpoint = None;
        task.set_status(TaskStatus::Running);

        let intent = self.kernel.gate.parse_intent(&reply);
        info!(?intent, "human replied");
        step.human_decision = Some(reply.decision.clone());
        if !reply.text.trim().is_empty() {
            step.human_input = Some(reply.text.clone());
        }
        if intent == Intent::ForceAbort {
            step.set_status(StepStatus::Completed);
            return Ok(HumanTurn::ForceAbort);
        }

        if intent == Intent::Abort {
            task.state.push_finding(step.sequence, USER_STOP_KEY, USER_STOP_NOTE);
            run.locals.completion_confirmed = true;
            self.persist(task)?;
            return Ok(HumanTurn::WrapUp);
        }
        if matches!(intent, Intent::ConfirmComplete | Intent::ImplicitStop) {
            run.locals.completion_confirmed = true;
        }
        let text = HumanGate::build_decision_text(&reply, intent);
        task.state.push_finding(step.sequence, HUMAN_DECISION_KEY, text);
        step.set_status(StepStatus::Approved);
        self.persist(task)?;
        Ok(HumanTurn::Continue)
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    async fn reflect(
        &mut self,
        task: &mut Task,
        caps: &Capabilities,
        step_title: &str,
        cancel: &CancellationToken,
    ) -> Result<(), WardenError> {
        let number = task.state.step_count;
        match suspend(cancel, caps.llm.reflect(&task.state)).await? {
            Ok(text) => {
                if let Some(phrase) = PerceptionBus::stagnation_indicator(&text) {
                    warn!(phrase, "reflection indicates stagnation");
                    self.kernel.perception.record_stagnation(phrase);
                    task.state.push_finding(
                        number,
                        META_KEY,
                        format!(
                            "Reflection suggests no progress ('{phrase}'). Change strategy or ask \
                             the user for help."
                        ),
                    );
                }
                if let Err(e) = caps.memory.extract(task.id, &text, step_title) {
                    warn!(error = %e, "memory extraction failed");
                }
                task.state.last_reflection = Some(text);
            }
            Err(e) => warn!(error = %e, "reflection failed"),
        }
        if let Some(summary) = self.kernel.perception.approval_summary() {
            task.state.findings.retain(|f| f.key != APPROVAL_PATTERNS_KEY);
            task.state.push_finding(number, APPROVAL_PATTERNS_KEY, summary);
        }
        Ok(())
    }

    async fn finish_subtask(
        &mut self,
        task: &mut Task,
        caps: &Capabilities,
        summary: &str,
        cancel: &CancellationToken,
    ) -> Result<(), WardenError> {
        let number = task.state.step_count;
        let next = match &caps.planner {
            Some(planner) => planner.advance_subtask(&mut task.state, summary),
            None => task.state.advance_subtask(summary).cloned(),
        };
        let (done, total) = task.state.plan_progress();
        info!(done, total, "subtask completed");

        if let Some(planner) = &caps.planner
            && self.config.planning.checkpoint_on_subtask_complete
        {
            match suspend(cancel, planner.checkpoint_reflect(task)).await? {
                Ok(Some(revised)) => {
                    info!(subtasks = revised.len(), "plan revised");
                    self.events.info(task.id, format!("Plan revised: {} new subtasks", revised.len()));
                    task.state.apply_plan_revision(revised);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "plan checkpoint failed"),
            }
        }

        if self.config.planning.compress_after_subtask
            && let Some(prompt) = caps.context.compression_prompt(task)
        {
            let memory = match suspend(cancel, caps.llm.compress(&prompt)).await? {
                Ok(text) => parse_working_memory(&text),
                Err(e) => {
                    warn!(error = %e, "working-memory compression failed");
                    None
                }
            };
            match memory {
                Some(mut memory) => {
                    memory.last_updated_step = number;
                    task.state.working_memory = Some(memory);
                }
                None => {
                    caps.context.compress_if_needed(&mut task.state);
                }
            }
        }

        self.kernel.firewall.reset_loop_state();
        if next.is_none() && task.state.all_subtasks_done() {
            task.state.push_finding(
                number,
                PLAN_KEY,
                "Every subtask is complete. Summarize the result and set task_complete to true.",
            );
        }
        Ok(())
    }

    fn announce_subtask(&self, task: &Task, run: &mut RunState) {
        let Some(sub) = task.state.current_subtask() else {
            return;
        };
        if run.locals.announced_subtask == Some(sub.id) {
            return;
        }
        let (done, total) = task.state.plan_progress();
        self.events.info(
            task.id,
            format!("Subtask {} ({}/{total}): {}", sub.id, done + 1, sub.title),
        );
        run.locals.announced_subtask = Some(sub.id);
    }

    fn memories(&self, memory: &dyn MemoryCapability, query: &str) -> Vec<String> {
        memory
            .retrieve_relevant(query, self.config.memory_limit)
            .unwrap_or_else(|e| {
                warn!(error = %e, "memory retrieval failed");
                Vec::new()
            })
    }

    /// Store durable approval habits as preference memories.
    fn persist_preferences(&self, memory: &dyn MemoryCapability) {
        let prefs = &self.config.preferences;
        let stats = self.kernel.perception.stats();
        for tool in stats.observed_tools() {
            let total = stats.total_decisions(tool);
            let Some(approve_rate) = stats.approval_rate(tool) else {
                continue;
            };
            let reject_rate = 1.0 - approve_rate;
            let content = if total >= prefs.min_observations && reject_rate >= prefs.avoid_reject_rate {
                format!(
                    "User usually rejects tool '{tool}' ({:.0}% of {total} requests); prefer alternatives.",
                    reject_rate * 100.0
                )
            } else if total >= prefs.trust_min_observations && reject_rate <= prefs.trust_approve_rate {
                format!(
                    "User usually approves tool '{tool}' ({:.0}% of {total} requests).",
                    approve_rate * 100.0
                )
            } else {
                continue;
            };

            let marker = format!("tool '{tool}'");
            match memory.retrieve_relevant(&format!("{PREFERENCE_CATEGORY} {tool}"), 10) {
                Ok(existing) if existing.iter().any(|m| m.contains(&marker)) => continue,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "preference lookup failed");
                    continue;
                }
            }
            let tags = [PREFERENCE_TAG.to_string(), tool.to_string()];
            match memory.save(PREFERENCE_CATEGORY, &content, &tags) {
                Ok(()) => info!(tool, "preference stored"),
                Err(e) => warn!(tool, error = %e, "preference could not be stored"),
            }
        }
    }

    // ── Endings ──────────────────────────────────────────────────────────────

    fn complete(&mut self, task: &mut Task, memory: &dyn MemoryCapability) -> Result<RunOutcome, WardenError> {
        self.persist_preferences(memory);
        self.finish(task, TaskStatus::Completed)?;
        Ok(RunOutcome::Completed)
    }

    fn abort(&mut self, task: &mut Task, memory: &dyn MemoryCapability) -> Result<RunOutcome, WardenError> {
        warn!("task aborted by the user");
        self.persist_preferences(memory);
        self.finish(task, TaskStatus::Aborted)?;
        Ok(RunOutcome::Aborted)
    }

    fn finish(&mut self, task: &mut Task, status: TaskStatus) -> Result<(), WardenError> {
        task.state.checkpoint = None;
        task.set_status(status);
        self.store.save_task(task)?;
        self.events.publish(KernelEvent::Completed {
            task_id: task.id,
            status,
        });
        Ok(())
    }

    fn pause(
        &mut self,
        task: &mut Task,
        run: &RunState,
        reason: PauseReason,
        message: &str,
    ) -> Result<RunOutcome, WardenError> {
        task.set_status(TaskStatus::Paused);
        self.checkpoint(task, run, reason)?;
        self.events.publish(KernelEvent::Error {
            task_id: task.id,
            message: message.to_string(),
        });
        Ok(RunOutcome::Paused(reason))
    }

    fn fail_and_pause(
        &mut self,
        task: &mut Task,
        run: &RunState,
        step: &mut Step,
        reason: PauseReason,
        message: &str,
    ) -> Result<RunOutcome, WardenError> {
        error!(step = step.sequence, %reason, detail = message, "transport failure; pausing task");
        step.fail(message);
        self.store.save_step(step)?;
        self.emit_step(step);
        self.pause(task, run, reason, message)
    }

    fn on_cancel(&mut self, task: &mut Task, run: &RunState, memory: &dyn MemoryCapability) {
        warn!(pending = run.pending.is_some(), "run cancelled");
        self.persist_preferences(memory);
        task.set_status(TaskStatus::Paused);
        if let Err(e) = self.checkpoint(task, run, PauseReason::UserStop) {
            error!(error = %e, "cancellation checkpoint could not be saved");
        }
        self.events.info(task.id, "Run cancelled; the task can be resumed");
    }

    fn on_failure(&mut self, task: &mut Task, run: &RunState, err: &WardenError) {
        error!(error = %err, "run failed");
        match self.store.steps(task.id) {
            Ok(steps) => {
                if let Some(mut last) = steps.into_iter().last() {
                    last.fail(err.to_string());
                    if let Err(e) = self.store.save_step(&last) {
                        warn!(error = %e, "failure reason could not be recorded");
                    }
                }
            }
            Err(e) => warn!(error = %e, "steps could not be loaded"),
        }
        task.set_status(TaskStatus::Failed);
        if let Err(e) = self.checkpoint(task, run, PauseReason::Error) {
            error!(error = %e, "failure checkpoint could not be saved");
        }
        self.events.publish(KernelEvent::Error {
            task_id: task.id,
            message: err.to_string(),
        });
    }

    // ── Persistence helpers ──────────────────────────────────────────────────

    fn checkpoint(&self, task: &mut Task, run: &RunState, reason: PauseReason) -> Result<(), WardenError> {
        let cp = self.kernel.capture(
            reason,
            task.state.step_count,
            run.elapsed(),
            &run.locals,
            run.pending.clone(),
        );
        info!(reason = %reason, step = cp.paused_at_step, pending = cp.pending.is_some(), "checkpoint written");
        task.state.checkpoint = Some(cp);
        self.persist(task)
    }

    fn persist(&self, task: &mut Task) -> Result<(), WardenError> {
        task.touch();
        self.store.save_task(task)
    }

    fn end_step(&self, task: &mut Task, step: &mut Step) -> Result<(), WardenError> {
        step.set_status(StepStatus::Completed);
        self.store.save_step(step)?;
        self.emit_step(step);
        self.persist(task)
    }

    fn load_step(&self, task_id: Uuid, sequence: u32) -> Result<Step, WardenError> {
        Ok(self
            .store
            .steps(task_id)?
            .into_iter()
            .find(|s| s.sequence == sequence)
            .unwrap_or_else(|| Step::new(task_id, sequence)))
    }

    fn emit_step(&self, step: &Step) {
        self.events.publish(KernelEvent::StepUpdate {
            task_id: step.task_id,
            step: step.sequence,
            title: step.title.clone(),
            status: step.status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_appends_ellipsis_only_when_cut() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("ééé", 2), "éé...");
    }

    #[tokio::test]
    async fn suspend_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = suspend(&cancel, async { 1 }).await;
        assert_eq!(out, Err(WardenError::Cancelled));
    }

    #[tokio::test]
    async fn suspend_passes_output_through() {
        let cancel = CancellationToken::new();
        assert_eq!(suspend(&cancel, async { 7 }).await, Ok(7));
    }

    #[test]
    fn elapsed_includes_earlier_runs() {
        let mut run = RunState::new();
        run.locals.elapsed_offset = 100.0;
        assert!(run.elapsed() >= 100.0);
    }

    #[test]
    fn resolve_fails_fast_on_empty_registry() {
        let registry = PluginRegistry::new();
        assert!(matches!(
            Capabilities::resolve(&registry, false),
            Err(WardenError::CapabilityMissing(_))
        ));
    }
}
