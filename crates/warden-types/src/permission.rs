use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::WardenError;

/// Strictness tier for a tool, ordered `Auto < Notify < Confirm < Approve`.
///
/// The derived [`Ord`] follows declaration order, so the effective level of
/// two policy layers is simply their `max`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    /// Execute without asking.
    Auto,
    /// Execute and tell the operator afterwards.
    Notify,
    /// Ask the operator before executing.
    Confirm,
    /// Ask the operator and show a preview of the call.
    Approve,
}

impl PermissionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::Auto => "auto",
            PermissionLevel::Notify => "notify",
            PermissionLevel::Confirm => "confirm",
            PermissionLevel::Approve => "approve",
        }
    }

    /// Whether a call at this level must wait for a human response.
    pub fn requires_approval(&self) -> bool {
        matches!(self, PermissionLevel::Confirm | PermissionLevel::Approve)
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionLevel {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(PermissionLevel::Auto),
            "notify" => Ok(PermissionLevel::Notify),
            "confirm" => Ok(PermissionLevel::Confirm),
            "approve" => Ok(PermissionLevel::Approve),
            other => Err(WardenError::Config(format!(
                "unknown permission level: {other}"
            ))),
        }
    }
}
