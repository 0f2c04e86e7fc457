//! This module defines the command-line interface for the application using `clap`.
//!
//! It provides a `Cli` struct that represents the parsed command-line arguments,
//! and a `Commands` enum that represents the available subcommands and their
//! options.
//!
//! # Examples
//!
//! Parsing command-line arguments:
//!
//! ```no_run
//! use clap::Parser;
//! use awful_recall::commands::{Cli, Commands};
//!
//! let cli = Cli::parse();
//! if let Commands::Search { user, query, top_k } = cli.command {
//!     println!("{user} asked {query:?} (top {top_k})");
//! }
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::conversation::Role;

/// Represents the parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Always)]
pub struct Cli {
    /// Configuration file; defaults to `config.yaml` in the platform config directory.
    #[arg(short = 'c', long = "config", global = true, env = "AJR_CONFIG")]
    pub config: Option<PathBuf>,

    /// The parsed subcommand and its options.
    #[command(subcommand)]
    pub command: Commands,
}

/// Represents the available subcommands and their options.
#[derive(Subcommand, Debug)]
#[command(about, long_about = None, color = clap::ColorChoice::Always)]
pub enum Commands {
    /// Write a default configuration file.
    Init,

    /// Append one turn to a user's conversation.
    #[clap(name = "add", alias = "a")]
    Add {
        #[arg(short = 'u', long = "user")]
        user: String,

        #[arg(short = 'r', long = "role", default_value = "user", value_parser = parse_role)]
        role: Role,

        #[arg(long = "content")]
        content: String,
    },

    /// Print a user's conversation history.
    #[clap(name = "history", alias = "h")]
    History {
        #[arg(short = 'u', long = "user")]
        user: String,

        /// Emit JSON instead of text.
        #[arg(long = "json")]
        json: bool,
    },

    /// Find the user's past turns closest to a query.
    #[clap(name = "search", alias = "s")]
    Search {
        #[arg(short = 'u', long = "user")]
        user: String,

        #[arg(short = 'q', long = "query")]
        query: String,

        #[arg(short = 'k', long = "top-k", default_value_t = 3)]
        top_k: usize,
    },

    /// Bulk-ingest a YAML list of `{user, role, content}` turns.
    Import { file: PathBuf },

    /// Show store counters.
    Stats {
        #[arg(long = "json")]
        json: bool,
    },

    /// Read lines from stdin as one user's turns, recalling related memory for each.
    ///
    /// Lines starting with `!` are stored as important short-term memories only.
    #[clap(name = "interactive", alias = "i")]
    Interactive {
        #[arg(short = 'u', long = "user")]
        user: String,

        #[arg(short = 'k', long = "top-k", default_value_t = 3)]
        top_k: usize,
    },
}

fn parse_role(s: &str) -> Result<Role, String> {
    s.parse()
}
