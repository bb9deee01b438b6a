//! `warden-runtime` – The Cognitive Loop
//!
//! Drives a Task from goal to completion through replaceable capabilities,
//! with every proposal judged by `warden-kernel` on the way.
//!
//! # Modules
//!
//! - [`orchestrator`] – [`Orchestrator`][orchestrator::Orchestrator]: the
//!   per-Task loop (prompt, decide, act, gatekeep, maintain) with
//!   checkpoint/resume and cancellation.
//! - [`capabilities`] – the narrow traits the loop consumes:
//!   [`LlmCapability`], [`ToolCapability`], [`PlanningCapability`],
//!   [`MemoryCapability`], [`ContextCapability`] and [`TaskStore`].
//! - [`plugin_registry`] – [`PluginRegistry`][plugin_registry::PluginRegistry]:
//!   a typed map from capability trait to implementation.
//! - [`checkpoint`] – [`LoopKernel`][checkpoint::LoopKernel]: freezing and
//!   thawing the kernel's loop-local state.
//! - [`events`] – [`EventBus`][events::EventBus]: the broadcast stream UI
//!   front-ends subscribe to.
//! - [`context`] – [`DefaultContext`][context::DefaultContext]: prompt
//!   assembly, tool-result summaries and findings compression.
//! - [`planner`] – [`LlmPlanner`][planner::LlmPlanner]: plan generation and
//!   subtask-boundary review through the LLM.
//! - [`llm_driver`] – [`LlmDriver`][llm_driver::LlmDriver]: an
//!   OpenAI-compatible chat client. [`STABILITY_GUIDELINES`] are prepended to
//!   the first system message of every request.
//! - [`store`] – [`InMemoryTaskStore`][store::InMemoryTaskStore].
//! - [`config`] – [`RuntimeConfig`][config::RuntimeConfig].
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: the global
//!   `tracing` subscriber with an optional OTLP span exporter.
//!
//! # Kernel gating
//!
//! Capabilities carry no security logic. Every tool call the loop dispatches
//! has passed [`FirewallEngine`] evaluation, the permission check and the
//! sandbox rewrite first. The kernel types are re-exported here so
//! embedders need no direct dependency on `warden-kernel`.

pub mod capabilities;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod events;
pub mod llm_driver;
pub mod orchestrator;
pub mod planner;
pub mod plugin_registry;
pub mod store;
pub mod telemetry;

pub use capabilities::{
    ContextCapability, LlmCapability, MemoryCapability, PlanningCapability, PromptInputs,
    TaskStore, ToolCapability,
};
pub use checkpoint::{LoopKernel, LoopLocals, Resumed};
pub use config::{ContextConfig, PlanningConfig, PreferenceConfig, RuntimeConfig};
pub use context::DefaultContext;
pub use events::{EventBus, KernelEvent};
pub use llm_driver::{ChatMessage, LlmDriver, LlmError, Role, STABILITY_GUIDELINES};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use planner::LlmPlanner;
pub use plugin_registry::PluginRegistry;
pub use store::InMemoryTaskStore;
pub use telemetry::{TracerProviderGuard, init_tracing};

pub use warden_kernel::{FirewallConfig, FirewallEngine, HumanResponder};
