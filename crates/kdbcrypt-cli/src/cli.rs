use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "kdbcrypt",
    about = "Selective encryption of configuration keysets",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Encrypt every entry marked with crypto/encrypt=1 in a keyset file.
    Encrypt {
        /// Keyset file (JSON).
        file: PathBuf,
    },
    /// Decrypt a keyset file in place, or print the plaintext.
    Decrypt {
        file: PathBuf,
        /// Print the decrypted keyset instead of rewriting the file.
        #[arg(long)]
        stdout: bool,
    },
    /// Mark an entry for encryption (or unmark it with --off).
    Mark {
        file: PathBuf,
        /// Entry name, e.g. user/app/password.
        name: String,
        #[arg(long)]
        off: bool,
    },
    /// Round-trip a probe keyset through the plugin.
    Health,
    /// Print version and exit.
    Version,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_encrypt_subcommand() {
        let cli = Cli::try_parse_from(["kdbcrypt", "encrypt", "keys.json"]).expect("parse");
        assert_eq!(
            cli.command,
            Command::Encrypt {
                file: PathBuf::from("keys.json")
            }
        );
    }

    #[test]
    fn parses_decrypt_with_stdout() {
        let cli =
            Cli::try_parse_from(["kdbcrypt", "decrypt", "keys.json", "--stdout"]).expect("parse");
        assert_eq!(
            cli.command,
            Command::Decrypt {
                file: PathBuf::from("keys.json"),
                stdout: true
            }
        );
    }

    #[test]
    fn parses_mark_off() {
        let cli = Cli::try_parse_from(["kdbcrypt", "mark", "keys.json", "user/a", "--off"])
            .expect("parse");
        assert_eq!(
            cli.command,
            Command::Mark {
                file: PathBuf::from("keys.json"),
                name: "user/a".into(),
                off: true
            }
        );
    }

    #[test]
    fn parses_config_init_subcommand() {
        let cli = Cli::try_parse_from(["kdbcrypt", "config", "init"]).expect("parse");
        assert_eq!(cli.command, Command::Config(ConfigCommand::Init));
    }

    #[test]
    fn requires_a_subcommand() {
        assert!(Cli::try_parse_from(["kdbcrypt"]).is_err());
    }
}
