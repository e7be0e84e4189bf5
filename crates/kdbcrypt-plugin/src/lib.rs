//! The `crypto` storage plugin: encrypts flagged entries on `set` and decrypts them on `get`.

use kdbcrypt_core::{
    config::PluginConfig,
    entry::{Entry, KeySet},
    error::CryptoError,
    plugin::{Modules, Plugin},
    wrapper::KeyWrapper,
};
use kdbcrypt_engine::{engine, master_key::MasterKeyManager};
use kdbcrypt_gpg::GpgBackend;
use tracing::{debug, instrument, warn};

pub const PLUGIN_NAME: &str = "crypto";

/// Open handle of the crypto plugin.
///
/// The configuration keyset lives for the whole handle and also stores the wrapped
/// master key. Parsed options and the unwrapped key only live between `open` and `close`.
#[derive(Debug)]
pub struct CryptoPlugin<W = GpgBackend> {
    config: KeySet,
    settings: Option<PluginConfig>,
    backend: Option<W>,
    keys: MasterKeyManager,
}

impl<W: KeyWrapper> CryptoPlugin<W> {
    /// Construct the handle and run the `open` hook.
    pub fn load(config: KeySet) -> Result<Self, CryptoError> {
        let mut plugin = Self {
            config,
            settings: None,
            backend: None,
            keys: MasterKeyManager::new(),
        };
        let mut parent = Entry::new("system");
        plugin.open(&mut parent)?;
        Ok(plugin)
    }

    pub fn is_open(&self) -> bool {
        self.settings.is_some()
    }

    pub fn settings(&self) -> Option<&PluginConfig> {
        self.settings.as_ref()
    }

    pub fn backend(&self) -> Option<&W> {
        self.backend.as_ref()
    }

    /// Generation of the session master key, if one is loaded.
    pub fn key_generation(&self) -> Option<u32> {
        self.keys.current().map(|k| k.generation())
    }

    pub fn into_config(self) -> KeySet {
        self.config
    }

    fn run_set(&mut self, entries: &mut KeySet) -> Result<(), CryptoError> {
        let settings = self
            .settings
            .as_ref()
            .ok_or_else(|| CryptoError::plugin_open("plugin is not open"))?;
        // Rejected before a key exists, so a failed write never strands ciphertext.
        engine::validate_for_write(entries)?;
        if !engine::needs_encryption(entries) {
            debug!("nothing to encrypt");
            return Ok(());
        }
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| CryptoError::plugin_open("backend not connected"))?;

        let key = self
            .keys
            .obtain(&mut self.config, &settings.recipient, backend)?;
        engine::encrypt_entries(entries, key)?;
        self.keys.commit();
        Ok(())
    }

    fn run_get(&mut self, entries: &mut KeySet) -> Result<(), CryptoError> {
        if self.settings.is_none() {
            return Err(CryptoError::plugin_open("plugin is not open"));
        }
        if !engine::needs_decryption(entries) {
            debug!("nothing to decrypt");
            return Ok(());
        }
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| CryptoError::plugin_open("backend not connected"))?;

        let key = self.keys.recover(&self.config, backend)?;
        engine::decrypt_entries(entries, key)?;
        Ok(())
    }
}

fn reported(result: Result<(), CryptoError>, parent: &mut Entry) -> Result<(), CryptoError> {
    if let Err(err) = &result {
        warn!(number = err.number(), "{err}");
        err.report(parent);
    }
    result
}

impl<W: KeyWrapper> Plugin for CryptoPlugin<W> {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    #[instrument(skip_all)]
    fn open(&mut self, parent: &mut Entry) -> Result<(), CryptoError> {
        let settings = match PluginConfig::from_keyset(&self.config) {
            Ok(settings) => settings,
            Err(err) => return reported(Err(err), parent),
        };
        if self.backend.is_none() {
            self.backend = Some(W::connect(&settings));
        }
        self.keys.clear();
        self.settings = Some(settings);
        debug!("opened");
        Ok(())
    }

    #[instrument(skip_all)]
    fn close(&mut self, _parent: &mut Entry) -> Result<(), CryptoError> {
        self.keys.clear();
        if let Some(settings) = self.settings.take() {
            if settings.shutdown {
                self.backend = None;
                debug!("backend shut down");
            }
        }
        debug!("closed");
        Ok(())
    }

    #[instrument(skip_all, fields(entries = entries.len()))]
    fn get(&mut self, entries: &mut KeySet, parent: &mut Entry) -> Result<(), CryptoError> {
        let result = self.run_get(entries);
        reported(result, parent)
    }

    #[instrument(skip_all, fields(entries = entries.len()))]
    fn set(&mut self, entries: &mut KeySet, parent: &mut Entry) -> Result<(), CryptoError> {
        let result = self.run_set(entries);
        reported(result, parent)
    }

    #[instrument(skip_all)]
    fn error(&mut self, _entries: &mut KeySet, _parent: &mut Entry) -> Result<(), CryptoError> {
        if self.keys.discard_pending(&mut self.config) {
            debug!("removed master key of failed write");
        }
        Ok(())
    }

    fn config(&self) -> &KeySet {
        &self.config
    }
}

fn open_crypto(config: KeySet) -> Result<Box<dyn Plugin>, CryptoError> {
    Ok(Box::new(CryptoPlugin::<GpgBackend>::load(config)?))
}

/// Register the gpg-backed `crypto` plugin.
pub fn register(modules: &mut Modules) {
    modules.register(PLUGIN_NAME, open_crypto);
}
