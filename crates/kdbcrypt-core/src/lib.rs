//! Core abstractions for kdbcrypt: the entry model, plugin contract, configuration
//! and the key-wrapping seam. Kept small so backends and hosts share one vocabulary.

pub mod config;
pub mod entry;
pub mod error;
pub mod plugin;
pub mod wrapper;

/// Metadata flag a user sets to `"1"` to have an entry encrypted.
pub const META_ENCRYPT: &str = "crypto/encrypt";

/// Plugin-private metadata marking a value as ciphertext of a key generation.
pub const META_CIPHERTEXT: &str = "internal/crypto/generation";
