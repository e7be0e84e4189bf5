use std::{
    fs,
    path::{Path, PathBuf},
};

use color_eyre::Result;
use dirs::config_dir;
use kdbcrypt_core::{
    config::{
        PARAM_GPG_BINARY, PARAM_GPG_TEST_KEY, PARAM_GPG_TIMEOUT, PARAM_RECIPIENT, PARAM_SHUTDOWN,
        PARAM_UNIT_TEST,
    },
    entry::{Entry, KeySet},
};
use serde::{Deserialize, Serialize};

/// User-level configuration loaded from `~/.config/kdbcrypt/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Override for the directory holding the plugin's private state.
    pub data_dir: Option<PathBuf>,
    /// Crypto plugin options.
    pub crypto: Option<CryptoConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CryptoConfig {
    /// gpg key id the master key is wrapped for.
    pub recipient: Option<String>,
    #[serde(default)]
    pub unit_test: bool,
    #[serde(default)]
    pub shutdown: bool,
    pub gpg_binary: Option<String>,
    pub gpg_timeout_ms: Option<u64>,
    pub test_key: Option<PathBuf>,
}

impl Config {
    /// Plugin configuration keyset; the recipient falls back to `KDBCRYPT_RECIPIENT`.
    pub fn plugin_keyset(&self) -> KeySet {
        let crypto = self.crypto.clone().unwrap_or_default();
        let recipient = crypto
            .recipient
            .or_else(|| std::env::var("KDBCRYPT_RECIPIENT").ok());

        let mut ks = KeySet::new();
        if let Some(recipient) = recipient {
            ks.append(Entry::new(PARAM_RECIPIENT).with_string(recipient));
        }
        if crypto.unit_test {
            ks.append(Entry::new(PARAM_UNIT_TEST).with_string("1"));
        }
        if crypto.shutdown {
            ks.append(Entry::new(PARAM_SHUTDOWN).with_string("1"));
        }
        if let Some(binary) = crypto.gpg_binary {
            ks.append(Entry::new(PARAM_GPG_BINARY).with_string(binary));
        }
        if let Some(timeout) = crypto.gpg_timeout_ms {
            ks.append(Entry::new(PARAM_GPG_TIMEOUT).with_string(timeout.to_string()));
        }
        if let Some(key) = crypto.test_key {
            ks.append(Entry::new(PARAM_GPG_TEST_KEY).with_string(key.to_string_lossy()));
        }
        ks
    }
}

/// Load config from the default path; if missing, return defaults.
pub fn load() -> Result<Config> {
    let path = default_path()?;
    load_from_path(path)
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("kdbcrypt").join("config.toml"))
}

/// Write `config` to the default path unless a file is already there.
pub fn write_default_if_missing(config: &Config) -> Result<PathBuf> {
    write_if_missing(config, &default_path()?)
}

fn write_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}
