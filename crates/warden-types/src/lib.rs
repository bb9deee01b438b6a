//! `warden-types` – shared data model for the warden agent kernel.
//!
//! Every other crate in the workspace speaks in these types: the kernel
//! evaluates [`Decision`]s, the runtime drives [`Task`]s one [`Step`] at a
//! time, and the memory crate persists both.
//!
//! # Modules
//!
//! - [`task`] – [`Task`], [`TaskState`], [`Step`] and their lifecycle enums.
//! - [`decision`] – the structured [`Decision`] decoded from model output.
//! - [`plan`] – [`TaskPlan`], [`Subtask`] and [`WorkingMemory`], plus the
//!   plan bookkeeping helpers on [`TaskState`].
//! - [`tool`] – tool schemas, results and the canonical JSON form used for
//!   signatures.
//! - [`permission`] – the ordered [`PermissionLevel`] tiers.
//! - [`checkpoint`] – the versioned [`Checkpoint`] written before every
//!   suspension point.
//! - [`error`] – [`WardenError`], the cross-crate error type.

pub mod checkpoint;
pub mod decision;
pub mod error;
pub mod permission;
pub mod plan;
pub mod task;
pub mod tool;

pub use checkpoint::{CHECKPOINT_VERSION, Checkpoint, LoopState, PauseReason, PendingRequest};
pub use decision::{Decision, HelpRequest, NextAction, ToolCall};
pub use error::WardenError;
pub use permission::PermissionLevel;
pub use plan::{Subtask, SubtaskStatus, TaskPlan, WorkingMemory};
pub use task::{Finding, Step, StepStatus, Task, TaskState, TaskStatus};
pub use tool::{ToolOutcome, ToolResult, ToolSchema, ToolStatus, canonical_json};
