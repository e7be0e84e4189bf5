//! Selective encryption of configuration entries.
//! Values are sealed with AES-256-GCM under a per-store master key that is itself
//! wrapped by an external asymmetric backend.

pub mod engine;
pub mod master_key;
pub mod payload;
