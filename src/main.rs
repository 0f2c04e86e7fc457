//! Main module for the Awful Recall CLI application (ajr).
//!
//! This module provides the main function for the CLI. It handles command parsing,
//! configuration loading and store initialization, then dispatches to the requested
//! command.
//!
//! # Examples
//!
//! ```sh
//! ajr init
//! ajr add -u alice --content "How do I read a file in Rust?"
//! ajr search -u alice -q "reading files"
//! ajr interactive -u alice
//! ```

use awful_recall::{
    MemoryStore,
    autosave::Autosave,
    commands::{Cli, Commands},
    config::{self, RecallConfig},
    config_dir,
    conversation::Role,
    embeddings::provider_from_config,
};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::{error::Error, fs, path::PathBuf, sync::Arc, time::Duration};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

static TRACING: OnceCell<()> = OnceCell::new();

fn main() -> Result<(), Box<dyn Error>> {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    });
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run())
}

/// One entry of an `import` file.
#[derive(Debug, Deserialize)]
struct ImportTurn {
    user: String,
    role: Role,
    content: String,
}

fn config_path(cli: &Cli) -> Result<PathBuf, Box<dyn Error>> {
    match &cli.config {
        Some(path) => Ok(path.clone()),
        None => Ok(config_dir()?.join("config.yaml")),
    }
}

fn load_or_default(path: &PathBuf) -> Result<RecallConfig, Box<dyn Error>> {
    if path.exists() {
        debug!("Loading config from: {}", path.display());
        Ok(config::load_config(&path.to_string_lossy())?)
    } else {
        warn!(
            "No config at {}; using defaults (run `ajr init` to create one)",
            path.display()
        );
        Ok(RecallConfig::default())
    }
}

/// Main asynchronous function of the Awful Recall CLI application.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded, the store cannot be opened,
/// or a hard error (bad user id, out-of-range lookup) reaches the command.
async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let path = config_path(&cli)?;
    let open_store = || -> Result<Arc<MemoryStore>, Box<dyn Error>> {
        let config = load_or_default(&path)?;
        let provider = provider_from_config(&config);
        Ok(Arc::new(MemoryStore::open(config, provider)?))
    };

    match cli.command {
        Commands::Init => init(&path)?,
        Commands::Add {
            user,
            role,
            content,
        } => {
            let store = open_store()?;
            match store.add_to_conversation(&user, role, content) {
                Ok(position) => println!("{user}#{position}"),
                Err(e) if e.is_hard() => return Err(e.into()),
                Err(e) => warn!("Turn stored but not indexed: {e}"),
            }
            // Already logged on failure; the next run retries.
            let _ = store.save();
        }
        Commands::History { user, json } => {
            let store = open_store()?;
            let history = store.get_conversation_history(&user)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&history)?);
            } else {
                for turn in history {
                    println!("{}: {}", turn.role, turn.content);
                }
            }
        }
        Commands::Search { user, query, top_k } => {
            let store = open_store()?;
            for hit in store.search_hits(&user, &query, top_k)? {
                println!("[{:.4}] #{} {}", hit.distance, hit.position, hit.turn.content);
            }
        }
        Commands::Import { file } => {
            let store = open_store()?;
            import(&store, &file)?;
            let _ = store.save();
        }
        Commands::Stats { json } => {
            let stats = open_store()?.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!(
                    "users: {}\nturns: {}\nindexed: {}\npending: {}\ntrained: {}\ntraining events: {}",
                    stats.users,
                    stats.turns,
                    stats.indexed,
                    stats.pending,
                    stats.trained,
                    stats.training_events
                );
            }
        }
        Commands::Interactive { user, top_k } => interactive(open_store()?, &user, top_k).await?,
    }

    Ok(())
}

fn import(store: &MemoryStore, file: &PathBuf) -> Result<(), Box<dyn Error>> {
    let turns: Vec<ImportTurn> = serde_yaml::from_str(&fs::read_to_string(file)?)?;
    info!("Importing {} turns from {}", turns.len(), file.display());

    let bar = ProgressBar::new(turns.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("##-"),
    );

    let mut unindexed = 0usize;
    for turn in turns {
        match store.add_to_conversation(&turn.user, turn.role, turn.content) {
            Ok(_) => {}
            Err(e) if e.is_hard() => return Err(e.into()),
            Err(_) => unindexed += 1,
        }
        bar.inc(1);
    }
    bar.finish_with_message(format!("done ({unindexed} not indexed)"));
    Ok(())
}

async fn interactive(store: Arc<MemoryStore>, user: &str, top_k: usize) -> Result<(), Box<dyn Error>> {
    let prior = store.get_conversation_history(user)?;
    println!("({} earlier turns for {user})", prior.len());

    let interval = Duration::from_secs(store.config().autosave_interval_secs);
    let autosave = Autosave::spawn(Arc::clone(&store), interval);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(note) = line.strip_prefix('!') {
            store.add_memory(note.trim(), true);
            println!("(remembered)");
            continue;
        }

        for past in store.search(user, line, top_k)? {
            println!("  related: {past}");
        }
        for memory in store.get_relevant_memories(line) {
            println!("  memory: {memory}");
        }

        if let Err(e) = store.add_to_conversation(user, Role::User, line) {
            if e.is_hard() {
                autosave.shutdown().await;
                return Err(e.into());
            }
            warn!("Turn stored but not indexed: {e}");
        }
        store.add_memory(line, false);
    }

    autosave.shutdown().await;
    Ok(())
}

/// Writes a default configuration file.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be created, or the configuration
/// cannot be serialized to YAML.
fn init(path: &PathBuf) -> Result<(), Box<dyn Error>> {
    if let Some(dir) = path.parent() {
        info!("Creating config directory: {}", dir.display());
        fs::create_dir_all(dir)?;
    }
    if path.exists() {
        warn!("Config already exists at {}; leaving it untouched", path.display());
        return Ok(());
    }

    info!("Creating config file: {}", path.display());
    let config_yaml = serde_yaml::to_string(&RecallConfig::default())?;
    fs::write(path, config_yaml)?;
    println!("{}", path.display());
    Ok(())
}
