use std::sync::{Arc, Mutex};

use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::PluginConfig;

/// Failures of the asymmetric backend that protects the master key.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The tool could not be started or its pipes failed.
    #[error("backend unreachable: {reason}")]
    Unreachable { reason: String },
    /// The tool did not finish within the configured wait.
    #[error("backend timed out after {millis} ms")]
    Timeout { millis: u128 },
    /// The tool ran and reported failure.
    #[error("backend exited with status {status}: {stderr}")]
    Failed { status: i32, stderr: String },
}

/// Wraps and unwraps master key material for a recipient.
/// Production uses an external gpg tool; tests use [`MaskingWrapper`].
pub trait KeyWrapper {
    /// Build a wrapper for the given plugin configuration.
    fn connect(config: &PluginConfig) -> Self
    where
        Self: Sized;

    fn wrap(&mut self, recipient: &str, key: &[u8]) -> Result<Vec<u8>, BackendError>;

    fn unwrap(&mut self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, BackendError>;
}

const MASK_PREFIX: &[u8] = b"masked:";
const MASK_BYTE: u8 = 0xA5;

#[derive(Debug, Default)]
struct MaskingState {
    wraps: usize,
    unwraps: usize,
    locked: bool,
}

/// In-memory wrapper that masks key bytes instead of encrypting them.
/// Not cryptographically secure; for tests and offline smoke runs only.
#[derive(Debug, Default, Clone)]
pub struct MaskingWrapper {
    state: Arc<Mutex<MaskingState>>,
}

impl MaskingWrapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every unwrap fail as if the private key were missing.
    pub fn lock(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.locked = true;
        }
    }

    pub fn wraps(&self) -> usize {
        self.state.lock().map(|s| s.wraps).unwrap_or_default()
    }

    pub fn unwraps(&self) -> usize {
        self.state.lock().map(|s| s.unwraps).unwrap_or_default()
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut MaskingState) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let mut state = self.state.lock().map_err(|err| BackendError::Unreachable {
            reason: format!("lock poisoned: {err}"),
        })?;
        f(&mut state)
    }
}

impl KeyWrapper for MaskingWrapper {
    fn connect(_config: &PluginConfig) -> Self {
        Self::new()
    }

    fn wrap(&mut self, recipient: &str, key: &[u8]) -> Result<Vec<u8>, BackendError> {
        self.with_state(|state| {
            state.wraps += 1;
            let mut out = MASK_PREFIX.to_vec();
            out.extend_from_slice(recipient.as_bytes());
            out.push(0);
            out.extend(key.iter().map(|b| b ^ MASK_BYTE));
            Ok(out)
        })
    }

    fn unwrap(&mut self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, BackendError> {
        self.with_state(|state| {
            state.unwraps += 1;
            if state.locked {
                return Err(BackendError::Failed {
                    status: 2,
                    stderr: "no secret key".to_string(),
                });
            }
            let body = wrapped
                .strip_prefix(MASK_PREFIX)
                .and_then(|rest| rest.iter().position(|b| *b == 0).map(|i| &rest[i + 1..]))
                .ok_or_else(|| BackendError::Failed {
                    status: 2,
                    stderr: "no valid OpenPGP data found".to_string(),
                })?;
            Ok(Zeroizing::new(body.iter().map(|b| b ^ MASK_BYTE).collect()))
        })
    }
}
