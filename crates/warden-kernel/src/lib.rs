//! `warden-kernel` – Action Firewall & Human Gate
//!
//! The part of warden that says no. It never calls a model or a tool
//! itself; it judges proposals, rewrites arguments and arbitrates operator
//! input so that the runtime can stay a plain loop.
//!
//! # Modules
//!
//! - [`firewall`] – [`FirewallEngine`][firewall::FirewallEngine]: the
//!   layered evaluation every [`Decision`][warden_types::Decision] passes
//!   through (help requests, confidence circuit breaker, loop detection),
//!   plus per-call permission checks, sandboxing and escalation.
//! - [`decision_parser`] – fail-safe decoding of model text into a
//!   [`Decision`][warden_types::Decision]. Never errors; unreadable output
//!   becomes a request for human clarification.
//! - [`policy_store`] – [`PolicyStore`][policy_store::PolicyStore]: the
//!   admin and user permission layers and their `max` composition.
//! - [`sandbox`] – [`Sandbox`][sandbox::Sandbox]: output-directory path
//!   rewriting and the readable-path check.
//! - [`perception`] – [`PerceptionBus`][perception::PerceptionBus]: result
//!   classification, repeat detection, approval and confidence statistics.
//! - [`human_gate`] – [`HumanGate`][human_gate::HumanGate]: the single-slot
//!   rendezvous with the operator and intent classification of replies.
//! - [`prompt_policy`] – the system prompt that states the decision format
//!   and the completion and help protocols.
//! - [`config`] – [`FirewallConfig`][config::FirewallConfig].

pub mod config;
pub mod decision_parser;
pub mod firewall;
pub mod human_gate;
pub mod perception;
pub mod policy_store;
pub mod prompt_policy;
pub mod sandbox;

pub use config::{FirewallConfig, LoopThresholds};
pub use firewall::{FirewallEngine, PermissionCheck, TOOL_AVOIDANCE_KEY, Trip, Verdict, VerdictAction};
pub use human_gate::{HumanGate, HumanReply, HumanResponder, Intent};
pub use perception::{PerceptionBus, PerceptionSnapshot, PerceptionStats, RepeatStatus, ResultClass};
pub use policy_store::PolicyStore;
pub use sandbox::Sandbox;
