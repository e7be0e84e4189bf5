use std::collections::BTreeMap;

use crate::{
    entry::{Entry, KeySet},
    error::CryptoError,
};

/// Hooks a storage plugin exposes to the host store.
///
/// `get` and `set` either transform every eligible entry or fail as a whole.
/// Failures are also attached to `parent`, the host's error-reporting entry.
pub trait Plugin {
    /// Short name used for logging and registry lookups.
    fn name(&self) -> &'static str;

    fn open(&mut self, parent: &mut Entry) -> Result<(), CryptoError>;

    fn close(&mut self, parent: &mut Entry) -> Result<(), CryptoError>;

    fn get(&mut self, entries: &mut KeySet, parent: &mut Entry) -> Result<(), CryptoError>;

    fn set(&mut self, entries: &mut KeySet, parent: &mut Entry) -> Result<(), CryptoError>;

    /// Cleanup after the host saw a failed `set`.
    fn error(&mut self, entries: &mut KeySet, parent: &mut Entry) -> Result<(), CryptoError>;

    /// The plugin's configuration, including any private state it persisted there.
    fn config(&self) -> &KeySet;
}

/// Constructs an opened plugin from its configuration.
pub type PluginFactory = fn(KeySet) -> Result<Box<dyn Plugin>, CryptoError>;

/// Explicit registry of available plugins.
#[derive(Debug, Default, Clone)]
pub struct Modules {
    factories: BTreeMap<&'static str, PluginFactory>,
}

impl Modules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &'static str, factory: PluginFactory) {
        self.factories.insert(name, factory);
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    /// Look up a plugin by name and open it with `config`.
    pub fn open(&self, name: &str, config: KeySet) -> Result<Box<dyn Plugin>, CryptoError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| CryptoError::plugin_open(format!("unknown plugin: {name}")))?;
        factory(config)
    }
}
