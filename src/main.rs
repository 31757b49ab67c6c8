//! stashkv - command-line access to a file-backed store
//!
//! The local store lives in a JSON file; the session store lives in memory
//! for the duration of the process.

use anyhow::{bail, Context};
use serde_json::Value;
use stashkv::{
    FileStore, KeyValueStore, MemoryStore, RuntimeMode, SettingsPatch, StorageKind,
    StorageUtilities, Stores,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// CLI configuration
struct Config {
    /// Path of the local store file
    file: String,
    /// Key prefix override
    prefix: Option<String>,
    /// The command and its arguments
    command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            file: "stashkv.json".to_string(),
            prefix: None,
            command: Vec::new(),
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> anyhow::Result<Self> {
        let mut config = Config::default();
        let mut args = std::env::args().skip(1);

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--file" | "-f" => {
                    config.file = args.next().context("--file requires a value")?;
                }
                "--prefix" | "-p" => {
                    config.prefix = Some(args.next().context("--prefix requires a value")?);
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("stashkv version {}", stashkv::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    config.command.push(arg);
                    config.command.extend(args.by_ref());
                }
            }
        }

        Ok(config)
    }
}

fn print_help() {
    println!(
        r#"
stashkv - Typed key-value storage with TTL envelopes

USAGE:
    stashkv [OPTIONS] <COMMAND>

OPTIONS:
    -f, --file <PATH>      Local store file (default: stashkv.json)
    -p, --prefix <PREFIX>  Key prefix (default: $STASHKV_KEY_PREFIX or none)
    -v, --version          Print version information
    -h, --help             Print this help message

COMMANDS:
    set <KEY> <JSON> [--ttl <MS>]   Store a value, optionally expiring
    get <KEY>                       Print a value (null if missing or expired)
    rm <KEY>...                     Remove values
    update <KEY> <PROP> <JSON>      Set a property, keeping the expiry
    unset <KEY> <PROP>              Remove a property, keeping the expiry
    keys | values | items           List the namespace
    purge                           Remove expired values
    clear                           Remove every value in the namespace

EXAMPLES:
    stashkv set p1 '{{"id":1,"name":"Desk"}}' --ttl 60000
    stashkv --prefix shop- keys
"#
    );
}

/// Parses a JSON argument, falling back to a JSON string.
fn parse_value(arg: &str) -> Value {
    serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_string()))
}

fn print_json<V: serde::Serialize>(value: &V) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(config: Config) -> anyhow::Result<()> {
    let local = FileStore::open(&config.file)
        .with_context(|| format!("failed to open store {}", config.file))?;
    info!(path = %config.file, keys = local.len(), "Store opened");

    let stores = Stores::new()
        .with_mode(RuntimeMode::Strict)
        .with_store(StorageKind::Local, Arc::new(local))
        .with_store(StorageKind::Session, Arc::new(MemoryStore::new()));

    let mut patch = SettingsPatch::from_env()?;
    if config.prefix.is_some() {
        patch.key_prefix = config.prefix.clone();
    }
    let stash: StorageUtilities<Value> = StorageUtilities::new(stores, patch)?;

    let args: Vec<&str> = config.command.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["set", key, json] => stash.add_item(key, &parse_value(json), None, None)?,
        ["set", key, json, "--ttl", ms] => {
            let ms: u64 = ms.parse().context("--ttl expects milliseconds")?;
            stash.add_item(key, &parse_value(json), Some(Duration::from_millis(ms)), None)?
        }
        ["get", key] => print_json(&stash.get_item(key, None)?)?,
        ["rm", keys @ ..] if !keys.is_empty() => stash.remove_items(keys, None)?,
        ["update", key, prop, json] => {
            print_json(&stash.update_item_property(key, prop, &parse_value(json), None)?)?
        }
        ["unset", key, prop] => print_json(&stash.remove_item_property(key, prop, None)?)?,
        ["keys"] => print_json(&stash.list_keys(None)?)?,
        ["values"] => print_json(&stash.list_values(None)?)?,
        ["items"] => print_json(&stash.list_items(None)?)?,
        ["purge"] => println!("{}", stash.purge_expired(None)?),
        ["clear"] => stash.clear_all(None)?,
        [] => {
            print_help();
            bail!("no command given");
        }
        other => bail!("unknown command: {}", other.join(" ")),
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    // Set up logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_args()?;
    run(config)
}
