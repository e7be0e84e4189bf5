mod cli;
mod config;
mod storage;

use std::path::Path;

use crate::cli::ConfigCommand;
use clap::Parser;
use color_eyre::{
    eyre::{bail, eyre},
    Result,
};
use kdbcrypt_core::{
    entry::{Entry, KeySet},
    plugin::{Modules, Plugin},
    META_CIPHERTEXT, META_ENCRYPT,
};
use kdbcrypt_plugin::PLUGIN_NAME;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Entry point wiring the CLI to the crypto plugin.
fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    match cli.command {
        cli::Command::Encrypt { file } => run_encrypt(&file, &config)?,
        cli::Command::Decrypt { file, stdout } => run_decrypt(&file, stdout, &config)?,
        cli::Command::Mark { file, name, off } => run_mark(&file, &name, !off)?,
        cli::Command::Health => run_health_check(&config)?,
        cli::Command::Version => print_version(),
        cli::Command::Config(ConfigCommand::Init) => init_config(&config)?,
    }

    Ok(())
}

fn init_tracing() {
    // Logs go to stderr so `decrypt --stdout` output stays clean.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("kdbcrypt {}", env!("CARGO_PKG_VERSION"));
}

fn open_plugin(config: &config::Config) -> Result<Box<dyn Plugin>> {
    let mut modules = Modules::new();
    kdbcrypt_plugin::register(&mut modules);
    let plugin_config = storage::plugin_config(config)?;
    Ok(modules.open(PLUGIN_NAME, plugin_config)?)
}

fn run_encrypt(file: &Path, config: &config::Config) -> Result<()> {
    let mut keys = storage::read_keyset(file)?;
    let mut plugin = open_plugin(config)?;
    let mut parent = Entry::new(file.display().to_string());

    let result = encrypt_keyset(plugin.as_mut(), &mut keys, &mut parent);
    if result.is_ok() {
        storage::save_plugin_state(config, plugin.config())?;
    }
    plugin.close(&mut parent)?;
    let encrypted = result?;

    storage::write_keyset(file, &keys)?;
    info!(entries = encrypted, path = %file.display(), "keyset encrypted");
    println!("Encrypted {encrypted} entries in {}", file.display());
    Ok(())
}

/// Run the plugin's `set` hook and return how many entries it turned into ciphertext.
/// On failure the `error` hook rolls back plugin state.
fn encrypt_keyset(plugin: &mut dyn Plugin, keys: &mut KeySet, parent: &mut Entry) -> Result<usize> {
    let plain: Vec<String> = keys
        .iter()
        .filter(|e| e.meta(META_CIPHERTEXT).is_none())
        .map(|e| e.name().to_string())
        .collect();
    if let Err(err) = plugin.set(keys, parent) {
        if let Err(rollback) = plugin.error(keys, parent) {
            warn!("error hook failed: {rollback}");
        }
        return Err(err.into());
    }
    let encrypted = plain
        .iter()
        .filter_map(|name| keys.lookup(name))
        .filter(|e| e.meta(META_CIPHERTEXT).is_some())
        .count();
    Ok(encrypted)
}

fn run_decrypt(file: &Path, stdout: bool, config: &config::Config) -> Result<()> {
    let mut keys = storage::read_keyset(file)?;
    let mut plugin = open_plugin(config)?;
    let mut parent = Entry::new(file.display().to_string());

    let result = plugin.get(&mut keys, &mut parent);
    plugin.close(&mut parent)?;
    result?;

    if stdout {
        println!("{}", storage::keyset_to_json(&keys)?);
    } else {
        storage::write_keyset(file, &keys)?;
        println!("Decrypted {}", file.display());
    }
    Ok(())
}

fn run_mark(file: &Path, name: &str, on: bool) -> Result<()> {
    let mut keys = storage::read_keyset(file)?;
    mark_entry(&mut keys, name, on)?;
    storage::write_keyset(file, &keys)?;
    let state = if on { "marked" } else { "unmarked" };
    println!("{name} {state} for encryption");
    Ok(())
}

fn mark_entry(keys: &mut KeySet, name: &str, on: bool) -> Result<()> {
    let entry = keys
        .lookup_mut(name)
        .ok_or_else(|| eyre!("no entry named {name}"))?;
    if on {
        entry.set_meta(META_ENCRYPT, "1");
    } else {
        entry.remove_meta(META_ENCRYPT);
    }
    Ok(())
}

/// Runs a quick round trip through the configured plugin and gpg.
fn run_health_check(config: &config::Config) -> Result<()> {
    let mut plugin = open_plugin(config)?;
    let result = run_plugin_health(plugin.as_mut());
    let mut parent = Entry::new("health");
    plugin.close(&mut parent)?;
    result?;
    println!("Crypto: ok");
    Ok(())
}

fn run_plugin_health(plugin: &mut dyn Plugin) -> Result<()> {
    let probe_key = "health/probe";
    let payload = "ok";
    let mut keys: KeySet = [Entry::new(probe_key)
        .with_string(payload)
        .with_meta(META_ENCRYPT, "1")]
    .into_iter()
    .collect();
    let mut parent = Entry::new("health");

    plugin.set(&mut keys, &mut parent)?;
    let sealed = keys
        .lookup(probe_key)
        .is_some_and(|e| e.is_binary() && e.string().is_none());
    if !sealed {
        bail!("probe value was not encrypted");
    }

    plugin.get(&mut keys, &mut parent)?;
    let round_trip = keys.lookup(probe_key).and_then(Entry::string);
    if round_trip != Some(payload) {
        bail!("crypto round-trip failed");
    }
    Ok(())
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use kdbcrypt_core::{
        config::{PARAM_RECIPIENT, PRIVATE_MASTER_KEY},
        wrapper::MaskingWrapper,
    };
    use kdbcrypt_plugin::CryptoPlugin;

    use super::*;

    fn masking_plugin() -> CryptoPlugin<MaskingWrapper> {
        let config: KeySet = [Entry::new(PARAM_RECIPIENT).with_string("ABCD")]
            .into_iter()
            .collect();
        CryptoPlugin::load(config).expect("open")
    }

    #[test]
    fn health_round_trips_through_plugin() {
        let mut plugin = masking_plugin();
        run_plugin_health(&mut plugin).expect("health");
    }

    #[test]
    fn health_fails_on_closed_plugin() {
        let mut plugin = masking_plugin();
        plugin.close(&mut Entry::new("t")).expect("close");
        assert!(run_plugin_health(&mut plugin).is_err());
    }

    #[test]
    fn encrypt_counts_only_newly_encrypted_entries() {
        let mut plugin = masking_plugin();
        let mut keys: KeySet = [
            Entry::new("user/a")
                .with_string("one")
                .with_meta(META_ENCRYPT, "1"),
            Entry::new("user/b").with_string("two"),
        ]
        .into_iter()
        .collect();

        let n = encrypt_keyset(&mut plugin, &mut keys, &mut Entry::new("t")).expect("encrypt");
        assert_eq!(n, 1);
        assert!(keys.lookup("user/a").is_some_and(Entry::is_binary));
        assert_eq!(keys.lookup("user/b").and_then(Entry::string), Some("two"));

        keys.append(
            Entry::new("user/c")
                .with_string("three")
                .with_meta(META_ENCRYPT, "1"),
        );
        let n = encrypt_keyset(&mut plugin, &mut keys, &mut Entry::new("t")).expect("again");
        assert_eq!(n, 1);
    }

    #[test]
    fn failed_encrypt_leaves_no_master_key() {
        let mut plugin = masking_plugin();
        let mut keys: KeySet = [
            Entry::new("user/a")
                .with_string("not ciphertext")
                .with_meta(META_ENCRYPT, "1")
                .with_meta(META_CIPHERTEXT, "1"),
            Entry::new("user/b")
                .with_string("secret")
                .with_meta(META_ENCRYPT, "1"),
        ]
        .into_iter()
        .collect();
        let mut parent = Entry::new("t");

        let original = keys.clone();
        assert!(encrypt_keyset(&mut plugin, &mut keys, &mut parent).is_err());
        assert!(parent.meta("error/number").is_some());
        assert_eq!(keys, original);
        assert!(plugin.config().lookup(PRIVATE_MASTER_KEY).is_none());
    }

    #[test]
    fn mark_and_unmark_entry() {
        let mut keys: KeySet = [Entry::new("user/a").with_string("x")].into_iter().collect();
        mark_entry(&mut keys, "user/a", true).expect("mark");
        assert!(keys.lookup("user/a").is_some_and(|e| e.meta_flag(META_ENCRYPT)));
        mark_entry(&mut keys, "user/a", false).expect("unmark");
        assert_eq!(keys.lookup("user/a").and_then(|e| e.meta(META_ENCRYPT)), None);
        assert!(mark_entry(&mut keys, "user/missing", true).is_err());
    }
}
