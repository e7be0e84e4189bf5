use std::{path::PathBuf, time::Duration};

use crate::{entry::KeySet, error::CryptoError};

pub const PARAM_RECIPIENT: &str = "crypto/key";
pub const PARAM_UNIT_TEST: &str = "crypto/unittest";
pub const PARAM_SHUTDOWN: &str = "crypto/shutdown";
pub const PARAM_GPG_BINARY: &str = "crypto/gpg/binary";
pub const PARAM_GPG_TIMEOUT: &str = "crypto/gpg/timeout";
pub const PARAM_GPG_TEST_KEY: &str = "crypto/gpg/testkey";

/// Private subtree of the plugin configuration holding the wrapped master key.
pub const PRIVATE_MASTER_KEY: &str = "crypto/private/masterkey";
pub const PRIVATE_GENERATION: &str = "crypto/private/generation";
pub const PRIVATE_RECIPIENT: &str = "crypto/private/recipient";

pub const DEFAULT_GPG_BINARY: &str = "gpg2";
pub const DEFAULT_GPG_TIMEOUT: Duration = Duration::from_secs(30);

/// Options recognised by the crypto plugin, parsed from its configuration keyset at open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginConfig {
    /// Asymmetric key that wraps the master key.
    pub recipient: String,
    /// Skip interactive prompts and trust decisions in the backend.
    pub unit_test: bool,
    /// Tear the backend down on close, not just the session key.
    pub shutdown: bool,
    pub gpg_binary: String,
    pub gpg_timeout: Duration,
    /// Key file imported into the backend before first use in unit-test mode.
    pub gpg_test_key: Option<PathBuf>,
}

impl PluginConfig {
    pub fn from_keyset(config: &KeySet) -> Result<Self, CryptoError> {
        let recipient = string_param(config, PARAM_RECIPIENT)
            .ok_or_else(|| CryptoError::plugin_open(format!("missing {PARAM_RECIPIENT}")))?;
        validate_recipient(recipient)?;

        let gpg_timeout = match string_param(config, PARAM_GPG_TIMEOUT) {
            Some(raw) => {
                let millis: u64 = raw.trim().parse().map_err(|_| {
                    CryptoError::plugin_open(format!("{PARAM_GPG_TIMEOUT} is not a number: {raw}"))
                })?;
                if millis == 0 {
                    return Err(CryptoError::plugin_open(format!(
                        "{PARAM_GPG_TIMEOUT} must be positive"
                    )));
                }
                Duration::from_millis(millis)
            }
            None => DEFAULT_GPG_TIMEOUT,
        };

        Ok(Self {
            recipient: recipient.to_string(),
            unit_test: flag_param(config, PARAM_UNIT_TEST),
            shutdown: flag_param(config, PARAM_SHUTDOWN),
            gpg_binary: string_param(config, PARAM_GPG_BINARY)
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_GPG_BINARY)
                .to_string(),
            gpg_timeout,
            gpg_test_key: string_param(config, PARAM_GPG_TEST_KEY)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        })
    }
}

fn string_param<'a>(config: &'a KeySet, name: &str) -> Option<&'a str> {
    config.lookup(name).and_then(|e| e.string())
}

fn flag_param(config: &KeySet, name: &str) -> bool {
    string_param(config, name) == Some("1")
}

/// Recipient ids are passed to the backend as an argument, so they must not look like flags.
fn validate_recipient(recipient: &str) -> Result<(), CryptoError> {
    if recipient.trim().is_empty() {
        return Err(CryptoError::plugin_open(format!("{PARAM_RECIPIENT} is empty")));
    }
    if recipient.starts_with('-') {
        return Err(CryptoError::plugin_open(format!(
            "{PARAM_RECIPIENT} must not start with '-'"
        )));
    }
    if recipient.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(CryptoError::plugin_open(format!(
            "{PARAM_RECIPIENT} contains whitespace or control characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;

    fn config(pairs: &[(&str, &str)]) -> KeySet {
        pairs
            .iter()
            .map(|(k, v)| Entry::new(*k).with_string(*v))
            .collect()
    }

    #[test]
    fn parses_defaults() {
        let cfg = PluginConfig::from_keyset(&config(&[(PARAM_RECIPIENT, "DDEBEF9E")]))
            .expect("valid config");
        assert_eq!(cfg.recipient, "DDEBEF9E");
        assert!(!cfg.unit_test);
        assert!(!cfg.shutdown);
        assert_eq!(cfg.gpg_binary, DEFAULT_GPG_BINARY);
        assert_eq!(cfg.gpg_timeout, DEFAULT_GPG_TIMEOUT);
        assert_eq!(cfg.gpg_test_key, None);
    }

    #[test]
    fn parses_all_options() {
        let cfg = PluginConfig::from_keyset(&config(&[
            (PARAM_RECIPIENT, "user@example.com"),
            (PARAM_UNIT_TEST, "1"),
            (PARAM_SHUTDOWN, "1"),
            (PARAM_GPG_BINARY, "/usr/bin/gpg"),
            (PARAM_GPG_TIMEOUT, "1500"),
            (PARAM_GPG_TEST_KEY, "/tmp/test.asc"),
        ]))
        .expect("valid config");
        assert!(cfg.unit_test);
        assert!(cfg.shutdown);
        assert_eq!(cfg.gpg_binary, "/usr/bin/gpg");
        assert_eq!(cfg.gpg_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.gpg_test_key, Some(PathBuf::from("/tmp/test.asc")));
    }

    #[test]
    fn flags_other_than_one_are_false() {
        let cfg = PluginConfig::from_keyset(&config(&[
            (PARAM_RECIPIENT, "ABCD"),
            (PARAM_UNIT_TEST, "true"),
            (PARAM_SHUTDOWN, "0"),
        ]))
        .expect("valid config");
        assert!(!cfg.unit_test);
        assert!(!cfg.shutdown);
    }

    #[test]
    fn rejects_missing_or_malformed_recipient() {
        for cfg in [
            config(&[]),
            config(&[(PARAM_RECIPIENT, "")]),
            config(&[(PARAM_RECIPIENT, "  ")]),
            config(&[(PARAM_RECIPIENT, "--homedir")]),
            config(&[(PARAM_RECIPIENT, "AB CD")]),
        ] {
            let err = PluginConfig::from_keyset(&cfg).expect_err("should reject");
            assert!(matches!(err, CryptoError::PluginOpen { .. }), "{err}");
        }
    }

    #[test]
    fn rejects_binary_recipient_and_bad_timeout() {
        let mut ks = KeySet::new();
        ks.append(Entry::new(PARAM_RECIPIENT).with_binary(Some(b"ABCD".to_vec())));
        assert!(PluginConfig::from_keyset(&ks).is_err());

        let ks = config(&[(PARAM_RECIPIENT, "ABCD"), (PARAM_GPG_TIMEOUT, "soon")]);
        assert!(PluginConfig::from_keyset(&ks).is_err());

        let ks = config(&[(PARAM_RECIPIENT, "ABCD"), (PARAM_GPG_TIMEOUT, "0")]);
        assert!(PluginConfig::from_keyset(&ks).is_err());
    }
}
