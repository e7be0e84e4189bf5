use std::{path::PathBuf, time::Duration};

use kdbcrypt_core::{
    config::PluginConfig,
    wrapper::{BackendError, KeyWrapper},
};
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

use crate::runner::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};

/// gpg-compatible backend that wraps master keys for a recipient.
#[derive(Debug)]
pub struct GpgBackend<R = ProcessRunner> {
    runner: R,
    binary: String,
    timeout: Duration,
    unit_test: bool,
    test_key: Option<PathBuf>,
    provisioned: bool,
}

impl<R: CommandRunner> GpgBackend<R> {
    pub fn with_runner(config: &PluginConfig, runner: R) -> Self {
        Self {
            runner,
            binary: config.gpg_binary.clone(),
            timeout: config.gpg_timeout,
            unit_test: config.unit_test,
            test_key: config.gpg_test_key.clone(),
            provisioned: false,
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Run the tool with `args`, feeding `input` on stdin. Exit status 0 is success.
    pub fn call(&mut self, args: Vec<String>, input: &[u8]) -> Result<CommandOutput, BackendError> {
        let spec = CommandSpec {
            program: self.binary.clone(),
            args,
            stdin: Zeroizing::new(input.to_vec()),
            timeout: self.timeout,
        };
        debug!(binary = %spec.program, args = ?spec.args, "invoking gpg");
        let output = self.runner.run(&spec)?;
        if !output.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(status = output.status, "gpg reported failure");
            return Err(BackendError::Failed {
                status: output.status,
                stderr,
            });
        }
        Ok(output)
    }

    /// Import the configured test keypair so later calls need no passphrase.
    #[instrument(skip_all)]
    pub fn import_test_key(&mut self) -> Result<(), BackendError> {
        let Some(path) = self.test_key.clone() else {
            return Ok(());
        };
        let args = vec![
            "-a".to_string(),
            "--import".to_string(),
            path.to_string_lossy().into_owned(),
        ];
        self.call(args, &[])?;
        debug!(key = %path.display(), "test key imported");
        Ok(())
    }

    fn ensure_provisioned(&mut self) -> Result<(), BackendError> {
        if self.unit_test && !self.provisioned {
            self.import_test_key()?;
        }
        self.provisioned = true;
        Ok(())
    }

    fn mode_args(&self, mode: &[&str]) -> Vec<String> {
        let mut args = vec!["--batch".to_string(), "--yes".to_string()];
        if self.unit_test {
            args.push("--trust-model".to_string());
            args.push("always".to_string());
        }
        args.extend(mode.iter().map(|s| s.to_string()));
        args
    }
}

impl<R: CommandRunner + Default> KeyWrapper for GpgBackend<R> {
    fn connect(config: &PluginConfig) -> Self {
        Self::with_runner(config, R::default())
    }

    #[instrument(skip_all, fields(recipient = %recipient))]
    fn wrap(&mut self, recipient: &str, key: &[u8]) -> Result<Vec<u8>, BackendError> {
        self.ensure_provisioned()?;
        let mut args = self.mode_args(&["-a", "-e"]);
        args.extend(["--recipient".to_string(), recipient.to_string()]);
        args.extend(["-o".to_string(), "-".to_string()]);
        let output = self.call(args, key)?;
        if output.stdout.is_empty() {
            return Err(BackendError::Failed {
                status: output.status,
                stderr: "empty output".to_string(),
            });
        }
        Ok(output.stdout)
    }

    #[instrument(skip_all)]
    fn unwrap(&mut self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, BackendError> {
        self.ensure_provisioned()?;
        let args = self.mode_args(&["-d", "-o", "-"]);
        let output = self.call(args, wrapped)?;
        Ok(Zeroizing::new(output.stdout))
    }
}
