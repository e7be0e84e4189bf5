use std::{io, process::Stdio, time::Duration};

use kdbcrypt_core::wrapper::BackendError;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, instrument};
use zeroize::Zeroizing;

/// A fully described subprocess invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Bytes delivered on the child's stdin; may be key material.
    pub stdin: Zeroizing<Vec<u8>>,
    pub timeout: Duration,
}

/// Result of a finished subprocess.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code; `-1` when the child was terminated by a signal.
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Executes commands on behalf of the backend (real processes in production, scripts in tests).
pub trait CommandRunner {
    fn run(&mut self, spec: &CommandSpec) -> Result<CommandOutput, BackendError>;
}

/// Runs commands as child processes with a bounded wait.
/// Blocking; must not be called from inside an async runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&mut self, spec: &CommandSpec) -> Result<CommandOutput, BackendError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(unreachable)?;
        runtime.block_on(run_process(spec))
    }
}

#[instrument(skip_all, fields(program = %spec.program))]
async fn run_process(spec: &CommandSpec) -> Result<CommandOutput, BackendError> {
    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(unreachable)?;

    let mut stdin = child.stdin.take().ok_or_else(|| BackendError::Unreachable {
        reason: "child stdin unavailable".to_string(),
    })?;
    let input = spec.stdin.as_slice();
    let feed = async move {
        stdin.write_all(input).await?;
        stdin.shutdown().await?;
        Ok::<_, io::Error>(())
    };

    // Dropping the child on timeout kills it.
    let finished = tokio::time::timeout(spec.timeout, async {
        tokio::join!(feed, child.wait_with_output())
    })
    .await;

    let (fed, output) = match finished {
        Ok(pair) => pair,
        Err(_) => {
            debug!(timeout_ms = spec.timeout.as_millis(), "command timed out");
            return Err(BackendError::Timeout {
                millis: spec.timeout.as_millis(),
            });
        }
    };
    let output = output.map_err(unreachable)?;

    // A tool may exit without reading its input; only other pipe errors matter.
    if let Err(err) = fed {
        if err.kind() != io::ErrorKind::BrokenPipe {
            return Err(unreachable(err));
        }
    }

    let status = output.status.code().unwrap_or(-1);
    debug!(status, "command finished");
    Ok(CommandOutput {
        status,
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

fn unreachable<E: ToString>(err: E) -> BackendError {
    BackendError::Unreachable {
        reason: err.to_string(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spec(program: &str, args: &[&str], stdin: &[u8], timeout: Duration) -> CommandSpec {
        CommandSpec {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            stdin: Zeroizing::new(stdin.to_vec()),
            timeout,
        }
    }

    #[test]
    fn pipes_stdin_to_stdout() {
        let output = ProcessRunner
            .run(&spec("cat", &[], b"payload", Duration::from_secs(5)))
            .expect("cat should run");
        assert!(output.success());
        assert_eq!(output.stdout, b"payload");
    }

    #[test]
    fn reports_nonzero_exit() {
        let output = ProcessRunner
            .run(&spec("false", &[], b"", Duration::from_secs(5)))
            .expect("false should run");
        assert!(!output.success());
        assert_ne!(output.status, 0);
    }

    #[test]
    fn missing_program_is_unreachable() {
        let err = ProcessRunner
            .run(&spec(
                "/nonexistent/kdbcrypt-gpg",
                &[],
                b"",
                Duration::from_secs(5),
            ))
            .expect_err("should not spawn");
        assert!(matches!(err, BackendError::Unreachable { .. }));
    }

    #[test]
    fn exceeding_the_wait_times_out() {
        let err = ProcessRunner
            .run(&spec("sleep", &["5"], b"", Duration::from_millis(100)))
            .expect_err("should time out");
        assert_eq!(err, BackendError::Timeout { millis: 100 });
    }
}
