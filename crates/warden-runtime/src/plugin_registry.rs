//! [`PluginRegistry`] – typed lookup of capability implementations.
//!
//! Capabilities are keyed by their trait object type, so a lookup can only
//! ever return the implementation registered for exactly that trait.
//!
//! ```
//! use std::sync::Arc;
//! use warden_runtime::capabilities::ContextCapability;
//! use warden_runtime::context::DefaultContext;
//! use warden_runtime::plugin_registry::PluginRegistry;
//!
//! let mut registry = PluginRegistry::new();
//! registry.register::<dyn ContextCapability>(Arc::new(DefaultContext::default()));
//!
//! assert!(registry.get::<dyn ContextCapability>().is_ok());
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use warden_types::WardenError;

struct Entry {
    name: &'static str,
    value: Box<dyn Any + Send + Sync>,
}

#[derive(Default)]
pub struct PluginRegistry {
    entries: HashMap<TypeId, Entry>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("registered", &self.list_registered())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `implementation` for capability `T`, replacing any earlier one.
    pub fn register<T>(&mut self, implementation: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let name = std::any::type_name::<T>();
        debug!(capability = name, "registered capability");
        self.entries.insert(
            TypeId::of::<T>(),
            Entry {
                name,
                value: Box::new(implementation),
            },
        );
    }

    /// Look up capability `T`.
    ///
    /// # Errors
    ///
    /// [`WardenError::CapabilityMissing`] when nothing is registered for `T`.
    pub fn get<T>(&self) -> Result<Arc<T>, WardenError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|e| e.value.downcast_ref::<Arc<T>>())
            .cloned()
            .ok_or_else(|| WardenError::CapabilityMissing(std::any::type_name::<T>().to_string()))
    }

    pub fn has<T>(&self) -> bool
    where
        T: ?Sized + 'static,
    {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    /// Names of the registered capability types, sorted.
    pub fn list_registered(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.entries.values().map(|e| e.name).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    trait Counter: Send + Sync {}

    struct English;
    impl Greeter for English {
        fn greet(&self) -> String {
            "hello".into()
        }
    }

    struct French;
    impl Greeter for French {
        fn greet(&self) -> String {
            "bonjour".into()
        }
    }

    #[test]
    fn get_returns_registered_implementation() {
        let mut registry = PluginRegistry::new();
        registry.register::<dyn Greeter>(Arc::new(English));
        let greeter = registry.get::<dyn Greeter>().unwrap();
        assert_eq!(greeter.greet(), "hello");
    }

    #[test]
    fn missing_capability_is_an_error() {
        let registry = PluginRegistry::new();
        match registry.get::<dyn Counter>() {
            Err(WardenError::CapabilityMissing(name)) => assert!(name.contains("Counter")),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("expected an error"),
        }
        assert!(!registry.has::<dyn Counter>());
    }

    #[test]
    fn register_replaces_previous_implementation() {
        let mut registry = PluginRegistry::new();
        registry.register::<dyn Greeter>(Arc::new(English));
        registry.register::<dyn Greeter>(Arc::new(French));
        assert_eq!(registry.get::<dyn Greeter>().unwrap().greet(), "bonjour");
        assert_eq!(registry.list_registered().len(), 1);
    }

    #[test]
    fn list_registered_names_capabilities() {
        let mut registry = PluginRegistry::new();
        registry.register::<dyn Greeter>(Arc::new(English));
        let names = registry.list_registered();
        assert_eq!(names.len(), 1);
        assert!(names[0].contains("Greeter"));
    }
}
