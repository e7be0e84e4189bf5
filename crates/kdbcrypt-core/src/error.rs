use thiserror::Error;

use crate::entry::Entry;

/// Module name recorded on the error-reporting entry.
pub const ERROR_MODULE: &str = "crypto";

/// Fatal failures of the crypto plugin. Any of these aborts the enclosing call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Configuration missing or invalid, or the handle is not open.
    #[error("plugin open failed: {reason}")]
    PluginOpen { reason: String },
    /// The master key could not be generated or recovered.
    #[error("master key unavailable: {reason}")]
    MasterKeyUnavailable { reason: String },
    /// The external backend was unreachable, timed out or reported failure.
    #[error("gpg call failed: {reason}")]
    GpgCall { reason: String },
    /// Ciphertext failed authentication or is malformed.
    #[error("decryption failed for {name}: {reason}")]
    Decryption { name: String, reason: String },
    /// Entry type or content does not fit the requested transformation.
    #[error("encoding error for {name}: {reason}")]
    Encoding { name: String, reason: String },
}

impl CryptoError {
    pub fn plugin_open(reason: impl Into<String>) -> Self {
        Self::PluginOpen {
            reason: reason.into(),
        }
    }

    pub fn master_key(reason: impl Into<String>) -> Self {
        Self::MasterKeyUnavailable {
            reason: reason.into(),
        }
    }

    pub fn gpg_call(reason: impl Into<String>) -> Self {
        Self::GpgCall {
            reason: reason.into(),
        }
    }

    pub fn decryption(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decryption {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn encoding(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Encoding {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Stable number used on the error-reporting entry.
    pub fn number(&self) -> u32 {
        match self {
            Self::PluginOpen { .. } => 1,
            Self::MasterKeyUnavailable { .. } => 2,
            Self::GpgCall { .. } => 3,
            Self::Decryption { .. } => 4,
            Self::Encoding { .. } => 5,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::PluginOpen { .. } => "invalid plugin configuration",
            Self::MasterKeyUnavailable { .. } => "master key unavailable",
            Self::GpgCall { .. } => "external gpg call failed",
            Self::Decryption { .. } => "decryption failed",
            Self::Encoding { .. } => "entry encoding mismatch",
        }
    }

    /// Attach this error to the host's error-reporting entry.
    pub fn report(&self, parent: &mut Entry) {
        let number = self.number().to_string();
        let reason = self.to_string();
        parent.set_meta(
            "error",
            format!(
                "number {number} description {} reason {reason} module {ERROR_MODULE}",
                self.description()
            ),
        );
        parent.set_meta("error/number", number);
        parent.set_meta("error/description", self.description());
        parent.set_meta("error/reason", reason);
        parent.set_meta("error/module", ERROR_MODULE);
    }
}
