//! lexicache - warm, inspect and repair the vocabulary cache from a shell.
//!
//! Reads `~/.config/lexicache/config.json` (plus `.env` and `LEXICACHE_*`
//! overrides), builds a [`VocabularyCache`] on top of it and runs one
//! command. Results are printed as JSON on stdout; logs go to stderr and a
//! daily log file in the cache directory.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lexicache_core::cascade::{FAILURE_COUNTER_KEY, FAILURE_LOCK_KEY};
use lexicache_core::settings::SETTINGS_STORAGE_KEY;
use lexicache_core::{
    ChunkRegistry, Collaborators, Config, CrossTabMutex, FileStorage, MutexOptions, SharedStorage,
    VocabularyCache,
};

// ============================================================================
// Constants
// ============================================================================

/// Log file prefix inside `<cache_dir>/logs`
const LOG_FILE_PREFIX: &str = "lexicache.log";

const USAGE: &str = "\
Usage: lexicache <command> [args]

Commands:
  ensure <key>...    Resolve keys through the cache and print the records
  get <key>          Print one record
  preload            Warm critical chunks, run one smart preload, print the report
  stats              Print loader, cache and degradation statistics
  unlock [--reset]   Force-release the failure counter lock; --reset also
                     clears the counter and re-enables chunked loading
  config             Print the effective configuration
";

/// Initialize the tracing subscriber for logging.
///
/// Use RUST_LOG to control the level (e.g. RUST_LOG=lexicache_core=debug).
/// The returned guard flushes the file log and must outlive `main`'s work.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir.map(|dir| (dir, std::fs::create_dir_all(dir))) {
        Some((dir, Ok(()))) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprint!("{}", USAGE);
        return Ok(());
    };
    if matches!(command, "-h" | "--help" | "help") {
        print!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load().context("Failed to load configuration")?;
    let log_dir = config.cache_dir().ok().map(|dir| dir.join("logs"));
    let _guard = init_tracing(log_dir.as_deref());
    info!(command = command, "lexicache starting");

    let rest = &args[1..];
    match command {
        "ensure" => ensure(&config, rest).await,
        "get" => get(&config, rest).await,
        "preload" => preload(&config).await,
        "stats" => stats(&config),
        "unlock" => unlock(&config, rest),
        "config" => show_config(&config),
        other => {
            eprint!("{}", USAGE);
            bail!("Unknown command: {}", other)
        }
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_registry(config: &Config) -> Result<ChunkRegistry> {
    match &config.registry_path {
        Some(path) => ChunkRegistry::load(path),
        None => {
            warn!("No registry configured, every key goes through the heuristic");
            Ok(ChunkRegistry::default())
        }
    }
}

fn build_cache(config: &Config) -> Result<VocabularyCache> {
    let registry = load_registry(config)?;
    let collaborators = Collaborators::from_config(config)?;
    Ok(VocabularyCache::builder(collaborators)
        .registry(registry)
        .config(config)
        .build())
}

fn open_storage(config: &Config) -> Result<Arc<dyn SharedStorage>> {
    let dir: PathBuf = config.storage_dir()?;
    let storage = FileStorage::new(dir.clone())
        .with_context(|| format!("Failed to open shared storage at {}", dir.display()))?;
    Ok(Arc::new(storage))
}

async fn ensure(config: &Config, keys: &[String]) -> Result<()> {
    if keys.is_empty() {
        bail!("ensure needs at least one key");
    }
    let cache = build_cache(config)?;
    let records = cache.ensure_loaded(keys).await;
    print_json(&records)
}

async fn get(config: &Config, args: &[String]) -> Result<()> {
    let [key] = args else {
        bail!("get takes exactly one key");
    };
    let cache = build_cache(config)?;
    let records = cache.ensure_loaded(std::slice::from_ref(key)).await;
    match records.into_iter().find(|record| &record.key == key) {
        Some(record) => print_json(&record),
        None => bail!("No record for {}", key),
    }
}

async fn preload(config: &Config) -> Result<()> {
    let cache = build_cache(config)?;
    let critical = cache.start().await;
    let report = cache.preload_now().await;
    cache.stop().await;

    let mut value = serde_json::to_value(&report)?;
    if let Value::Object(map) = &mut value {
        map.insert("critical_chunks".to_string(), Value::from(critical));
        map.insert("loaded_chunks".to_string(), Value::from(cache.loader().loaded_ids()));
    }
    print_json(&value)
}

fn stats(config: &Config) -> Result<()> {
    let cache = build_cache(config)?;
    print_json(&cache.stats())
}

fn unlock(config: &Config, args: &[String]) -> Result<()> {
    let reset = match args {
        [] => false,
        [flag] if flag == "--reset" => true,
        _ => bail!("unlock takes only --reset"),
    };

    let storage = open_storage(config)?;
    let mutex = CrossTabMutex::new(Arc::clone(&storage), FAILURE_LOCK_KEY, MutexOptions::default());
    mutex.force_release();

    if reset {
        storage.remove(FAILURE_COUNTER_KEY)?;
        storage.remove(SETTINGS_STORAGE_KEY)?;
        info!("Chunk failure counter and degraded settings cleared");
    }
    println!("{}", if reset { "unlocked and reset" } else { "unlocked" });
    Ok(())
}

fn show_config(config: &Config) -> Result<()> {
    let mut value = serde_json::to_value(config)?;
    if let Value::Object(map) = &mut value {
        let path = Config::config_path()?;
        map.insert("config_path".to_string(), Value::from(path.display().to_string()));
    }
    print_json(&value)
}
