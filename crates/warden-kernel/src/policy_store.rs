//! [`PolicyStore`] – two-layer tool permission resolution.
//!
//! The admin layer comes from configuration and never changes at runtime.
//! The user layer is adaptive: only auto-escalation writes to it. A tool's
//! effective level is the stricter of the two.

use std::collections::{BTreeMap, HashMap, HashSet};

use warden_types::PermissionLevel;

/// Admin key holding the fallback level for unlisted tools.
pub const DEFAULT_KEY: &str = "default";
/// Admin key holding the fallback level for unlisted remote tools.
pub const REMOTE_DEFAULT_KEY: &str = "remote_default";

/// Resolves the effective [`PermissionLevel`] for a tool.
///
/// # Example
///
/// ```
/// use warden_kernel::policy_store::PolicyStore;
/// use warden_types::PermissionLevel;
///
/// let mut store = PolicyStore::from_admin([("file_read".to_string(), PermissionLevel::Auto)]);
/// assert_eq!(store.effective_permission("file_read"), PermissionLevel::Auto);
/// assert_eq!(store.effective_permission("shell"), PermissionLevel::Confirm);
///
/// store.set_user_permission("file_read", PermissionLevel::Approve);
/// assert_eq!(store.effective_permission("file_read"), PermissionLevel::Approve);
/// ```
#[derive(Debug, Clone, Default)]
pub struct PolicyStore {
    admin: HashMap<String, PermissionLevel>,
    user: HashMap<String, PermissionLevel>,
    remote_tools: HashSet<String>,
}

impl PolicyStore {
    /// Create a store with an empty admin layer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose admin layer holds `entries`.
    pub fn from_admin(entries: impl IntoIterator<Item = (String, PermissionLevel)>) -> Self {
        Self {
            admin: entries.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Record which tools were discovered from a remote tool source.
    pub fn set_remote_tools(&mut self, names: impl IntoIterator<Item = String>) {
        self.remote_tools = names.into_iter().collect();
    }

    pub fn is_remote(&self, tool: &str) -> bool {
        self.remote_tools.contains(tool)
    }

    /// Admin-layer level for `tool`, applying the configured fallbacks.
    pub fn admin_permission(&self, tool: &str) -> PermissionLevel {
        if let Some(level) = self.admin.get(tool) {
            return *level;
        }
        if self.is_remote(tool) {
            self.admin
                .get(REMOTE_DEFAULT_KEY)
                .copied()
                .unwrap_or(PermissionLevel::Auto)
        } else {
            self.admin
                .get(DEFAULT_KEY)
                .copied()
                .unwrap_or(PermissionLevel::Confirm)
        }
    }

    pub fn user_permission(&self, tool: &str) -> Option<PermissionLevel> {
        self.user.get(tool).copied()
    }

    /// Override the user layer for `tool`.
    pub fn set_user_permission(&mut self, tool: &str, level: PermissionLevel) {
        self.user.insert(tool.to_string(), level);
    }

    pub fn clear_user_permission(&mut self, tool: &str) {
        self.user.remove(tool);
    }

    /// `max(admin, user)` under `auto < notify < confirm < approve`.
    pub fn effective_permission(&self, tool: &str) -> PermissionLevel {
        let admin = self.admin_permission(tool);
        match self.user_permission(tool) {
            Some(user) => admin.max(user),
            None => admin,
        }
    }

    /// User-layer overrides, sorted by tool name.
    pub fn user_overrides(&self) -> BTreeMap<&str, PermissionLevel> {
        self.user.iter().map(|(k, v)| (k.as_str(), *v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEVELS: [PermissionLevel; 4] = [
        PermissionLevel::Auto,
        PermissionLevel::Notify,
        PermissionLevel::Confirm,
        PermissionLevel::Approve,
    ];

    #[test]
    fn effective_is_stricter_layer_for_every_combination() {
        for admin in LEVELS {
            for user in LEVELS {
                let mut store = PolicyStore::from_admin([("tool".to_string(), admin)]);
                store.set_user_permission("tool", user);
                let expected = if admin >= user { admin } else { user };
                assert_eq!(
                    store.effective_permission("tool"),
                    expected,
                    "admin={admin} user={user}"
                );
            }
        }
    }

    #[test]
    fn admin_alone_when_no_user_override() {
        for admin in LEVELS {
            let store = PolicyStore::from_admin([("tool".to_string(), admin)]);
            assert_eq!(store.effective_permission("tool"), admin);
        }
    }

    #[test]
    fn unknown_local_tool_defaults_to_confirm() {
        let store = PolicyStore::new();
        assert_eq!(store.effective_permission("anything"), PermissionLevel::Confirm);
    }

    #[test]
    fn unknown_remote_tool_defaults_to_auto() {
        let mut store = PolicyStore::new();
        store.set_remote_tools(["web_search".to_string()]);
        assert_eq!(store.effective_permission("web_search"), PermissionLevel::Auto);
        assert_eq!(store.effective_permission("shell"), PermissionLevel::Confirm);
    }

    #[test]
    fn fallbacks_are_overridable_in_admin_policy() {
        let mut store = PolicyStore::from_admin([
            (DEFAULT_KEY.to_string(), PermissionLevel::Approve),
            (REMOTE_DEFAULT_KEY.to_string(), PermissionLevel::Notify),
        ]);
        store.set_remote_tools(["web_search".to_string()]);
        assert_eq!(store.effective_permission("shell"), PermissionLevel::Approve);
        assert_eq!(store.effective_permission("web_search"), PermissionLevel::Notify);
    }

    #[test]
    fn explicit_admin_entry_beats_remote_fallback() {
        let mut store = PolicyStore::from_admin([("web_search".to_string(), PermissionLevel::Confirm)]);
        store.set_remote_tools(["web_search".to_string()]);
        assert_eq!(store.effective_permission("web_search"), PermissionLevel::Confirm);
    }

    #[test]
    fn clearing_user_override_restores_admin_level() {
        let mut store = PolicyStore::from_admin([("tool".to_string(), PermissionLevel::Auto)]);
        store.set_user_permission("tool", PermissionLevel::Approve);
        store.clear_user_permission("tool");
        assert_eq!(store.effective_permission("tool"), PermissionLevel::Auto);
        assert!(store.user_overrides().is_empty());
    }
}
