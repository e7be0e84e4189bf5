use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use color_eyre::{eyre::eyre, Result};
use dirs::data_dir;
use kdbcrypt_core::{
    config::{PRIVATE_GENERATION, PRIVATE_MASTER_KEY, PRIVATE_RECIPIENT},
    entry::{Entry, KeySet, Value},
};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::config::Config;

const STATE_FILE: &str = "plugin.json";
const PRIVATE_KEYS: [&str; 3] = [PRIVATE_MASTER_KEY, PRIVATE_GENERATION, PRIVATE_RECIPIENT];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum StoredKind {
    #[default]
    String,
    Binary,
}

/// On-disk shape of one entry. Binary values are base64.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    name: String,
    #[serde(rename = "type", default)]
    kind: StoredKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    meta: BTreeMap<String, String>,
}

impl StoredEntry {
    fn from_entry(entry: &Entry) -> Self {
        let (kind, value) = match entry.value() {
            Value::String(s) => (StoredKind::String, Some(s.clone())),
            Value::Binary(bytes) => (
                StoredKind::Binary,
                bytes.as_ref().map(|b| STANDARD.encode(b)),
            ),
        };
        Self {
            name: entry.name().to_string(),
            kind,
            value,
            meta: entry
                .meta_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn into_entry(self) -> Result<Entry> {
        let mut entry = match self.kind {
            StoredKind::String => {
                Entry::new(self.name).with_string(self.value.unwrap_or_default())
            }
            StoredKind::Binary => {
                let bytes = self
                    .value
                    .map(|v| STANDARD.decode(v))
                    .transpose()
                    .map_err(|e| eyre!("invalid base64 value for {}: {e}", self.name))?;
                Entry::new(self.name).with_binary(bytes)
            }
        };
        for (k, v) in self.meta {
            entry.set_meta(k, v);
        }
        entry.clear_sync();
        Ok(entry)
    }
}

/// Resolve the default data directory for kdbcrypt.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| eyre!("no data dir available"))?;
    Ok(base.join("kdbcrypt"))
}

/// Location of the plugin's private state (wrapped master key and generation).
pub fn state_path(config: &Config) -> Result<PathBuf> {
    let root = match &config.data_dir {
        Some(root) => root.clone(),
        None => default_data_dir()?,
    };
    Ok(root.join(STATE_FILE))
}

/// Read a keyset file; a missing file is an error.
pub fn read_keyset(path: &Path) -> Result<KeySet> {
    let mut file =
        File::open(path).map_err(|e| eyre!("cannot open keyset {}: {e}", path.display()))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let stored: Vec<StoredEntry> = serde_json::from_slice(&buf)?;
    stored.into_iter().map(StoredEntry::into_entry).collect()
}

/// Atomically replace `path` with the serialized keyset.
pub fn write_keyset(path: &Path, keys: &KeySet) -> Result<()> {
    let json = keyset_to_json(keys)?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(json.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Pretty JSON rendering of a keyset, as written by [`write_keyset`].
pub fn keyset_to_json(keys: &KeySet) -> Result<String> {
    let stored: Vec<StoredEntry> = keys.iter().map(StoredEntry::from_entry).collect();
    Ok(serde_json::to_string_pretty(&stored)?)
}

/// Plugin configuration: user options plus any persisted private state.
pub fn plugin_config(config: &Config) -> Result<KeySet> {
    let mut keys = config.plugin_keyset();
    let path = state_path(config)?;
    if path.exists() {
        debug!(?path, "loading plugin state");
        for entry in read_keyset(&path)? {
            if PRIVATE_KEYS.contains(&entry.name()) {
                keys.append(entry);
            }
        }
    }
    Ok(keys)
}

/// Persist the private entries of a plugin configuration keyset.
pub fn save_plugin_state(config: &Config, plugin_config: &KeySet) -> Result<()> {
    let path = state_path(config)?;
    let private: KeySet = plugin_config
        .iter()
        .filter(|e| PRIVATE_KEYS.contains(&e.name()))
        .cloned()
        .collect();
    if private.is_empty() && !path.exists() {
        return Ok(());
    }
    debug!(?path, entries = private.len(), "saving plugin state");
    write_keyset(&path, &private)
}
