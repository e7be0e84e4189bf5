use std::fmt;

use kdbcrypt_core::{
    config::{PRIVATE_GENERATION, PRIVATE_MASTER_KEY, PRIVATE_RECIPIENT},
    entry::{Entry, KeySet},
    error::CryptoError,
    wrapper::{BackendError, KeyWrapper},
};
use rand::{rngs::OsRng, RngCore};
use tracing::{debug, instrument, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_LEN: usize = 32;

/// Session master key. Zeroized on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_LEN],
    generation: u32,
}

impl MasterKey {
    pub fn from_bytes(bytes: &[u8], generation: u32) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::master_key(format!(
                "expected {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(bytes);
        Ok(Self {
            bytes: out,
            generation,
        })
    }

    pub(crate) fn bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// The session key together with its persisted, wrapped form.
#[derive(Debug, Clone)]
pub struct MasterKeyRecord {
    pub key: MasterKey,
    pub wrapped: Vec<u8>,
    /// Recipient the key was wrapped for, when known.
    pub recipient: Option<String>,
}

/// A key generated in the current call that has not been committed yet.
#[derive(Debug)]
struct Pending {
    previous_generation: Option<Entry>,
}

/// Owns the session master key: recovers it from the plugin's private config or creates it.
#[derive(Debug, Default)]
pub struct MasterKeyManager {
    record: Option<MasterKeyRecord>,
    pending: Option<Pending>,
}

impl MasterKeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&MasterKey> {
        self.record.as_ref().map(|r| &r.key)
    }

    pub fn record(&self) -> Option<&MasterKeyRecord> {
        self.record.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether a wrapped key is stored in `config`.
    pub fn has_persisted(config: &KeySet) -> bool {
        config
            .lookup(PRIVATE_MASTER_KEY)
            .and_then(Entry::binary)
            .is_some_and(|b| !b.is_empty())
    }

    /// Session key for reading: never creates one.
    #[instrument(skip_all)]
    pub fn recover<W: KeyWrapper + ?Sized>(
        &mut self,
        config: &KeySet,
        wrapper: &mut W,
    ) -> Result<&MasterKey, CryptoError> {
        if self.record.is_none() {
            let wrapped = config
                .lookup(PRIVATE_MASTER_KEY)
                .and_then(Entry::binary)
                .filter(|b| !b.is_empty())
                .ok_or_else(|| CryptoError::master_key("no wrapped master key in configuration"))?
                .to_vec();
            let generation = stored_generation(config)?
                .ok_or_else(|| CryptoError::master_key("wrapped master key has no generation"))?;

            let plain = wrapper.unwrap(&wrapped).map_err(unwrap_error)?;
            let key = MasterKey::from_bytes(&plain, generation)?;
            debug!(generation, "master key recovered");
            self.record = Some(MasterKeyRecord {
                key,
                wrapped,
                recipient: config
                    .lookup(PRIVATE_RECIPIENT)
                    .and_then(Entry::string)
                    .map(str::to_string),
            });
        }
        self.current()
            .ok_or_else(|| CryptoError::master_key("master key missing after recovery"))
    }

    /// Session key for writing: recovers a persisted key or creates, wraps and persists a new one.
    #[instrument(skip_all, fields(recipient = %recipient))]
    pub fn obtain<W: KeyWrapper + ?Sized>(
        &mut self,
        config: &mut KeySet,
        recipient: &str,
        wrapper: &mut W,
    ) -> Result<&MasterKey, CryptoError> {
        if self.record.is_none() {
            if Self::has_persisted(config) {
                self.recover(config, wrapper)?;
            } else {
                self.create(config, recipient, wrapper)?;
            }
        }
        self.current()
            .ok_or_else(|| CryptoError::master_key("master key missing after creation"))
    }

    fn create<W: KeyWrapper + ?Sized>(
        &mut self,
        config: &mut KeySet,
        recipient: &str,
        wrapper: &mut W,
    ) -> Result<(), CryptoError> {
        let previous_generation = config.lookup(PRIVATE_GENERATION).cloned();
        let generation = stored_generation(config)
            .ok()
            .flatten()
            .map_or(1, |g| g.wrapping_add(1).max(1));

        let key = generate_key(generation)?;
        let wrapped = wrapper
            .wrap(recipient, key.bytes())
            .map_err(|e| CryptoError::gpg_call(format!("wrapping master key: {e}")))?;

        config.append(Entry::new(PRIVATE_MASTER_KEY).with_binary(Some(wrapped.clone())));
        config.append(Entry::new(PRIVATE_GENERATION).with_string(generation.to_string()));
        config.append(Entry::new(PRIVATE_RECIPIENT).with_string(recipient));
        debug!(generation, "master key created");

        self.record = Some(MasterKeyRecord {
            key,
            wrapped,
            recipient: Some(recipient.to_string()),
        });
        self.pending = Some(Pending {
            previous_generation,
        });
        Ok(())
    }

    /// The call that created the key succeeded; keep it.
    pub fn commit(&mut self) {
        self.pending = None;
    }

    /// Drop a key created by a failed call and remove its wrapped form from `config`.
    /// Returns whether anything was discarded.
    pub fn discard_pending(&mut self, config: &mut KeySet) -> bool {
        let Some(pending) = self.pending.take() else {
            return false;
        };
        config.remove(PRIVATE_MASTER_KEY);
        config.remove(PRIVATE_RECIPIENT);
        match pending.previous_generation {
            Some(entry) => {
                config.append(entry);
            }
            None => {
                config.remove(PRIVATE_GENERATION);
            }
        }
        self.record = None;
        warn!("discarded uncommitted master key");
        true
    }

    /// Forget the session key; its bytes are zeroized as it drops.
    pub fn clear(&mut self) {
        self.record = None;
        self.pending = None;
    }
}

fn stored_generation(config: &KeySet) -> Result<Option<u32>, CryptoError> {
    match config.lookup(PRIVATE_GENERATION).and_then(Entry::string) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| CryptoError::master_key("stored key generation is corrupt")),
        None => Ok(None),
    }
}

fn generate_key(generation: u32) -> Result<MasterKey, CryptoError> {
    let mut bytes = [0u8; KEY_LEN];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CryptoError::master_key(format!("random generator: {e}")))?;
    let key = MasterKey {
        bytes,
        generation,
    };
    bytes.zeroize();
    Ok(key)
}

/// The tool ran but could not unwrap: the key is unavailable. Anything else is a call failure.
fn unwrap_error(err: BackendError) -> CryptoError {
    match err {
        BackendError::Failed { .. } => {
            CryptoError::master_key(format!("unwrapping master key: {err}"))
        }
        other => CryptoError::gpg_call(format!("unwrapping master key: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use kdbcrypt_core::wrapper::MaskingWrapper;
    use zeroize::Zeroizing;

    use super::*;

    struct Unreachable;

    impl KeyWrapper for Unreachable {
        fn connect(_config: &kdbcrypt_core::config::PluginConfig) -> Self {
            Unreachable
        }
        fn wrap(&mut self, _recipient: &str, _key: &[u8]) -> Result<Vec<u8>, BackendError> {
            Err(BackendError::Unreachable {
                reason: "gpg2: not found".into(),
            })
        }
        fn unwrap(&mut self, _wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, BackendError> {
            Err(BackendError::Timeout { millis: 5 })
        }
    }

    #[test]
    fn creates_persists_and_reuses_key() {
        let mut config = KeySet::new();
        let mut wrapper = MaskingWrapper::new();
        let mut manager = MasterKeyManager::new();

        let first = manager
            .obtain(&mut config, "ABCD", &mut wrapper)
            .expect("create")
            .clone();
        assert_eq!(first.generation(), 1);
        assert!(MasterKeyManager::has_persisted(&config));
        assert!(manager.is_pending());
        assert_eq!(
            config.lookup(PRIVATE_RECIPIENT).and_then(Entry::string),
            Some("ABCD")
        );

        let again = manager
            .obtain(&mut config, "ABCD", &mut wrapper)
            .expect("reuse")
            .clone();
        assert_eq!(again.bytes(), first.bytes());
        assert_eq!(wrapper.wraps(), 1);
    }

    #[test]
    fn persisted_key_never_holds_plaintext() {
        let mut config = KeySet::new();
        let mut manager = MasterKeyManager::new();
        let key = manager
            .obtain(&mut config, "ABCD", &mut MaskingWrapper::new())
            .expect("create")
            .clone();
        for entry in config.iter() {
            let stored = entry.binary().unwrap_or_default();
            assert!(!stored.windows(KEY_LEN).any(|w| w == key.bytes()));
        }
    }

    #[test]
    fn fresh_session_recovers_the_same_key() {
        let mut config = KeySet::new();
        let mut wrapper = MaskingWrapper::new();
        let mut writer = MasterKeyManager::new();
        let written = writer
            .obtain(&mut config, "ABCD", &mut wrapper)
            .expect("create")
            .clone();
        writer.commit();

        let mut reader = MasterKeyManager::new();
        let recovered = reader.recover(&config, &mut wrapper).expect("recover");
        assert_eq!(recovered.bytes(), written.bytes());
        assert_eq!(recovered.generation(), written.generation());
        assert!(!reader.is_pending());
        assert_eq!(wrapper.unwraps(), 1);
    }

    #[test]
    fn recover_without_wrapped_key_is_unavailable() {
        let err = MasterKeyManager::new()
            .recover(&KeySet::new(), &mut MaskingWrapper::new())
            .expect_err("nothing to recover");
        assert!(matches!(err, CryptoError::MasterKeyUnavailable { .. }));
    }

    #[test]
    fn rejected_or_corrupt_wrapped_key_is_unavailable() {
        let mut config = KeySet::new();
        let mut wrapper = MaskingWrapper::new();
        MasterKeyManager::new()
            .obtain(&mut config, "ABCD", &mut wrapper)
            .expect("create");

        let locked = wrapper.clone();
        locked.lock();
        let err = MasterKeyManager::new()
            .recover(&config, &mut wrapper)
            .expect_err("locked");
        assert!(matches!(err, CryptoError::MasterKeyUnavailable { .. }));

        let mut config = KeySet::new();
        config.append(
            Entry::new(PRIVATE_MASTER_KEY).with_binary(Some(b"masked:ABCD\0short".to_vec())),
        );
        config.append(Entry::new(PRIVATE_GENERATION).with_string("1"));
        let err = MasterKeyManager::new()
            .recover(&config, &mut MaskingWrapper::new())
            .expect_err("wrong length");
        assert!(matches!(err, CryptoError::MasterKeyUnavailable { .. }));
    }

    #[test]
    fn backend_failures_are_gpg_call_errors() {
        let mut config = KeySet::new();
        let err = MasterKeyManager::new()
            .obtain(&mut config, "ABCD", &mut Unreachable)
            .expect_err("wrap fails");
        assert!(matches!(err, CryptoError::GpgCall { .. }));
        assert!(!MasterKeyManager::has_persisted(&config));

        MasterKeyManager::new()
            .obtain(&mut config, "ABCD", &mut MaskingWrapper::new())
            .expect("create");
        let err = MasterKeyManager::new()
            .recover(&config, &mut Unreachable)
            .expect_err("unwrap times out");
        assert!(matches!(err, CryptoError::GpgCall { .. }));
    }

    #[test]
    fn discard_pending_restores_config() {
        let mut config = KeySet::new();
        config.append(Entry::new("crypto/key").with_string("ABCD"));
        let before = config.clone();

        let mut manager = MasterKeyManager::new();
        manager
            .obtain(&mut config, "ABCD", &mut MaskingWrapper::new())
            .expect("create");
        assert!(manager.discard_pending(&mut config));
        assert_eq!(config, before);
        assert!(manager.current().is_none());
        assert!(!manager.discard_pending(&mut config));
    }

    #[test]
    fn committed_key_is_not_discarded() {
        let mut config = KeySet::new();
        let mut manager = MasterKeyManager::new();
        manager
            .obtain(&mut config, "ABCD", &mut MaskingWrapper::new())
            .expect("create");
        manager.commit();
        assert!(!manager.discard_pending(&mut config));
        assert!(MasterKeyManager::has_persisted(&config));
        assert!(manager.current().is_some());
    }

    #[test]
    fn new_key_after_lost_wrapped_key_gets_next_generation() {
        let mut config = KeySet::new();
        config.append(Entry::new(PRIVATE_GENERATION).with_string("4"));
        let mut manager = MasterKeyManager::new();
        let key = manager
            .obtain(&mut config, "ABCD", &mut MaskingWrapper::new())
            .expect("create");
        assert_eq!(key.generation(), 5);
    }

    #[test]
    fn debug_output_hides_key_bytes() {
        let key = MasterKey::from_bytes(&[0x42; KEY_LEN], 3).expect("key");
        let printed = format!("{key:?}");
        assert!(printed.contains("generation: 3"));
        assert!(!printed.contains("66"));
    }
}
