//! Wraps the master key through an external gpg-compatible tool run as a subprocess.
//! No asymmetric cryptography happens in-process.

pub mod backend;
pub mod runner;

pub use backend::GpgBackend;
pub use runner::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
