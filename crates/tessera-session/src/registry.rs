//! Name to provider lookup, built once at startup.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::provider::Provider;

/// Providers available to [`Manager`](crate::Manager) construction.
///
/// Each name can be registered once. The registry is an ordinary value the
/// host builds and passes to the manager; there is no process-wide table.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a provider available under `name`.
    ///
    /// Registering a name twice is a configuration error.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) -> Result<()> {
        let name = name.into();
        if self.providers.contains_key(&name) {
            return Err(Error::DuplicateProvider(name));
        }
        debug!(provider = %name, "Registered session provider");
        self.providers.insert(name, provider);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownProvider(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}
