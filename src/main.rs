//! chatter-cache - profile lookaside cache for chat overlays
//!
//! Main entry point for the chatter-cache CLI.

use chatter_cache::config::{validate_config_result, ChatterCacheConfig};
use chatter_cache::store::{PersistentStore, SqliteStore};
use chatter_cache::{LookasideCache, ProfileRecord};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

/// Resolve chat usernames to display names and avatars, caching in SQLite
#[derive(Parser, Debug)]
#[command(name = "chatter-cache")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/chatter-cache/config.yaml)
    #[arg(short, long, env = "CHATTER_CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Resolve usernames, looking up and caching any that are missing
    Resolve {
        /// Usernames to resolve (resolved concurrently)
        #[arg(required = true)]
        keys: Vec<String>,

        /// Print records as JSON lines
        #[arg(long)]
        json: bool,

        /// Print Prometheus metrics after resolving
        #[arg(long)]
        metrics: bool,
    },

    /// Show the stored record for a username without calling the API
    Show {
        key: String,

        #[arg(long)]
        json: bool,
    },

    /// List every stored record
    List {
        #[arg(long)]
        json: bool,
    },

    /// Delete the stored record for a username
    Forget { key: String },

    /// Show database location and record count
    Stats,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    if let Err(e) = chatter_cache::logging::init_with_default(default_level) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> chatter_cache::Result<()> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(ChatterCacheConfig::default_path);

    // Init is the only command that runs without a config file
    let load_config = || ChatterCacheConfig::load(&config_path);

    match cli.command {
        Commands::Init { force } => handle_init(&config_path, force),
        Commands::Resolve {
            keys,
            json,
            metrics,
        } => handle_resolve(&load_config()?, keys, json, metrics).await,
        Commands::Show { key, json } => {
            let store = SqliteStore::open(&load_config()?.storage)?;
            match store.find_by_key(&key).await? {
                Some(record) => print_record(&record, json),
                None => {
                    println!("No stored record for '{}'", key);
                    Ok(())
                }
            }
        }
        Commands::List { json } => {
            let store = SqliteStore::open(&load_config()?.storage)?;
            for stored in store.list().await? {
                if json {
                    println!("{}", serde_json::to_string(&stored)?);
                } else {
                    let when = chrono::DateTime::from_timestamp_millis(stored.cached_at)
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "?".to_string());
                    println!(
                        "{:<25} {:<25} {}  {}",
                        stored.record.key, stored.record.display_name, when, stored.record.avatar_url
                    );
                }
            }
            Ok(())
        }
        Commands::Forget { key } => {
            let store = SqliteStore::open(&load_config()?.storage)?;
            if store.remove(&key).await? {
                println!("Forgot '{}'", key);
            } else {
                println!("No stored record for '{}'", key);
            }
            Ok(())
        }
        Commands::Stats => {
            let config = load_config()?;
            let store = SqliteStore::open(&config.storage)?;
            let location = store
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ":memory:".to_string());
            println!("Database:  {}", location);
            println!("Records:   {}", store.count().await?);
            println!("On storage error: {:?}", config.on_storage_error);
            Ok(())
        }
    }
}

fn handle_init(path: &std::path::Path, force: bool) -> chatter_cache::Result<()> {
    if path.exists() && !force {
        return Err(chatter_cache::CacheError::Config(format!(
            "Config already exists at {} (use --force to overwrite)",
            path.display()
        )));
    }

    ChatterCacheConfig::new().save(path)?;
    println!("Wrote {}", path.display());
    println!("Set twitch.client_id there and export TWITCH_CLIENT_SECRET before resolving.");
    Ok(())
}

async fn handle_resolve(
    config: &ChatterCacheConfig,
    keys: Vec<String>,
    json: bool,
    show_metrics: bool,
) -> chatter_cache::Result<()> {
    validate_config_result(config)?;

    let (cache, _store) = LookasideCache::from_config(config)?;
    let cache = Arc::new(cache);

    let tasks: Vec<_> = keys
        .into_iter()
        .map(|key| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                let result = cache.resolve(&key).await;
                (key, result)
            })
        })
        .collect();

    let mut failures = 0;
    for task in tasks {
        let (key, result) = task
            .await
            .map_err(|e| chatter_cache::CacheError::Other(format!("resolve task failed: {}", e)))?;
        match result {
            Ok(record) => print_record(&record, json)?,
            Err(e) => {
                failures += 1;
                eprintln!("{}: {}", key, e);
            }
        }
    }

    // Let background inserts land before the process exits
    cache.flush().await;

    let stats = cache.stats();
    tracing::info!(
        hits = stats.hits,
        misses = stats.misses,
        lookups = stats.lookups,
        write_failures = stats.write_failures,
        "Resolve finished"
    );

    if show_metrics {
        print!("{}", chatter_cache::metrics::encode_metrics()?);
    }

    if failures > 0 {
        return Err(chatter_cache::CacheError::Other(format!(
            "{} key(s) could not be resolved",
            failures
        )));
    }
    Ok(())
}

fn print_record(record: &ProfileRecord, json: bool) -> chatter_cache::Result<()> {
    if json {
        println!("{}", serde_json::to_string(record)?);
    } else {
        println!(
            "{:<25} {:<25} {}",
            record.key, record.display_name, record.avatar_url
        );
    }
    Ok(())
}
