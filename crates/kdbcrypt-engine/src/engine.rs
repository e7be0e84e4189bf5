use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use kdbcrypt_core::{
    entry::{Entry, KeySet, Value},
    error::CryptoError,
    META_CIPHERTEXT, META_ENCRYPT,
};
use tracing::{debug, instrument};

use crate::{
    master_key::MasterKey,
    payload::{
        decode_plaintext, encode_plaintext, has_magic, Algorithm, EncryptedPayload, PayloadError,
        PayloadHeader, NONCE_LEN,
    },
};

/// What `set` should do with an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteAction {
    Encrypt,
    AlreadyEncrypted,
    Skip,
}

fn write_action(entry: &Entry) -> WriteAction {
    if entry.meta(META_CIPHERTEXT).is_some() {
        WriteAction::AlreadyEncrypted
    } else if entry.meta_flag(META_ENCRYPT) {
        WriteAction::Encrypt
    } else {
        WriteAction::Skip
    }
}

/// Whether `set` on these entries will need the master key.
pub fn needs_encryption(entries: &KeySet) -> bool {
    entries
        .iter()
        .any(|e| write_action(e) == WriteAction::Encrypt)
}

/// Whether `get` on these entries will need the master key.
pub fn needs_decryption(entries: &KeySet) -> bool {
    entries.iter().any(is_ciphertext)
}

pub fn is_ciphertext(entry: &Entry) -> bool {
    entry.meta(META_CIPHERTEXT).is_some()
}

/// Reject entries whose reserved ciphertext marker sits on a value this plugin did not produce.
pub fn validate_for_write(entries: &KeySet) -> Result<(), CryptoError> {
    entries.iter().try_for_each(check_reserved_marker)
}

/// Encrypt every entry flagged with `crypto/encrypt = 1`. Returns how many were encrypted.
///
/// Every entry is validated and sealed before any is replaced, so a failure leaves
/// `entries` untouched.
#[instrument(skip_all, fields(entries = entries.len(), generation = key.generation()))]
pub fn encrypt_entries(entries: &mut KeySet, key: &MasterKey) -> Result<usize, CryptoError> {
    validate_for_write(entries)?;
    let cipher = build_cipher(key)?;
    let mut sealed = Vec::new();
    for entry in entries.iter() {
        if write_action(entry) == WriteAction::Encrypt {
            sealed.push((entry.name().to_string(), seal(&cipher, entry, key.generation())?));
        }
    }

    let count = sealed.len();
    for (name, payload) in sealed {
        if let Some(entry) = entries.lookup_mut(&name) {
            apply_ciphertext(entry, payload, key.generation());
        }
    }
    debug!(count, "entries encrypted");
    Ok(count)
}

/// Decrypt every entry carrying the ciphertext marker. Returns how many were decrypted.
#[instrument(skip_all, fields(entries = entries.len(), generation = key.generation()))]
pub fn decrypt_entries(entries: &mut KeySet, key: &MasterKey) -> Result<usize, CryptoError> {
    let cipher = build_cipher(key)?;
    let mut count = 0;
    for entry in entries.iter_mut() {
        if decrypt_with(&cipher, entry, key.generation())? {
            count += 1;
        }
    }
    debug!(count, "entries decrypted");
    Ok(count)
}

/// Encrypt a single entry if it is flagged. Returns whether it changed.
pub fn encrypt_entry(entry: &mut Entry, key: &MasterKey) -> Result<bool, CryptoError> {
    encrypt_with(&build_cipher(key)?, entry, key.generation())
}

/// Decrypt a single entry if it carries the ciphertext marker. Returns whether it changed.
pub fn decrypt_entry(entry: &mut Entry, key: &MasterKey) -> Result<bool, CryptoError> {
    decrypt_with(&build_cipher(key)?, entry, key.generation())
}

fn encrypt_with(
    cipher: &Aes256Gcm,
    entry: &mut Entry,
    generation: u32,
) -> Result<bool, CryptoError> {
    check_reserved_marker(entry)?;
    if write_action(entry) != WriteAction::Encrypt {
        return Ok(false);
    }
    let payload = seal(cipher, entry, generation)?;
    apply_ciphertext(entry, payload, generation);
    Ok(true)
}

fn check_reserved_marker(entry: &Entry) -> Result<(), CryptoError> {
    if write_action(entry) != WriteAction::AlreadyEncrypted {
        return Ok(());
    }
    if entry.binary().is_some_and(has_magic) {
        debug!(name = entry.name(), "already encrypted");
        return Ok(());
    }
    Err(CryptoError::encoding(
        entry.name(),
        format!("{META_CIPHERTEXT} set on a value that is not ciphertext"),
    ))
}

/// Serialized payload for the entry's current value.
fn seal(cipher: &Aes256Gcm, entry: &Entry, generation: u32) -> Result<Vec<u8>, CryptoError> {
    let plaintext = encode_plaintext(entry.value());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(nonce.as_slice());
    let header = PayloadHeader {
        algorithm: Algorithm::Aes256Gcm,
        generation,
        nonce: nonce_bytes,
    };
    let aad = header.to_bytes();
    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext.as_slice(),
                aad: &aad,
            },
        )
        .map_err(|e| CryptoError::encoding(entry.name(), format!("encrypt failed: {e}")))?;

    Ok(EncryptedPayload { header, ciphertext }.to_bytes())
}

fn apply_ciphertext(entry: &mut Entry, payload: Vec<u8>, generation: u32) {
    entry.set_binary(Some(payload));
    entry.set_meta(META_CIPHERTEXT, generation.to_string());
    debug!(name = entry.name(), "entry encrypted");
}

fn decrypt_with(
    cipher: &Aes256Gcm,
    entry: &mut Entry,
    generation: u32,
) -> Result<bool, CryptoError> {
    let Some(marker) = entry.meta(META_CIPHERTEXT) else {
        return Ok(false);
    };
    let name = entry.name().to_string();
    let marked_generation: u32 = marker.parse().map_err(|_| {
        CryptoError::decryption(&name, format!("corrupt {META_CIPHERTEXT} marker"))
    })?;

    let bytes = match entry.value() {
        Value::Binary(Some(bytes)) => bytes,
        _ => {
            return Err(CryptoError::encoding(
                &name,
                "ciphertext marker on a value that is not binary",
            ))
        }
    };
    let payload = EncryptedPayload::parse(bytes)
        .map_err(|e| CryptoError::decryption(&name, e.to_string()))?;

    if payload.header.generation != marked_generation {
        return Err(CryptoError::decryption(
            &name,
            "payload generation does not match its marker",
        ));
    }
    if payload.header.generation != generation {
        return Err(CryptoError::decryption(
            &name,
            format!(
                "written under key generation {}, session key is generation {generation}",
                payload.header.generation
            ),
        ));
    }

    let aad = payload.header.to_bytes();
    let plaintext = zeroize::Zeroizing::new(
        cipher
            .decrypt(
                Nonce::from_slice(&payload.header.nonce),
                Payload {
                    msg: payload.ciphertext.as_slice(),
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::decryption(&name, "authentication failed"))?,
    );
    let value = decode_plaintext(&plaintext).map_err(|e| match e {
        PayloadError::InvalidUtf8 | PayloadError::UnknownKind(_) | PayloadError::EmptyPlaintext => {
            CryptoError::encoding(&name, e.to_string())
        }
        other => CryptoError::decryption(&name, other.to_string()),
    })?;

    entry.set_value(value);
    entry.remove_meta(META_CIPHERTEXT);
    debug!(name = %name, "entry decrypted");
    Ok(true)
}

fn build_cipher(key: &MasterKey) -> Result<Aes256Gcm, CryptoError> {
    Aes256Gcm::new_from_slice(key.bytes())
        .map_err(|e| CryptoError::master_key(format!("cipher init failed: {e}")))
}
