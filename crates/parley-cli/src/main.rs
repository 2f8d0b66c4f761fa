//! # parley-cli
//!
//! Command-line interface for inspecting and editing Parley sessions.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use parley_core::{config::StorageBackendKind, error::format_error_with_suggestion, Config};
use parley_core::{CompressionStrategy, Role};

mod commands;

/// Parley - durable chat sessions with context compaction
#[derive(Parser)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Override the data directory
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Override the storage backend
    #[arg(long, global = true, value_enum)]
    backend: Option<BackendArg>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Session management
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand)]
pub enum SessionAction {
    /// List sessions, most recently used first
    List {
        /// Maximum sessions to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show session details
    Show {
        /// Session ID or unique prefix
        id: String,
        /// Number of recent messages to print
        #[arg(short, long, default_value = "5")]
        messages: usize,
    },
    /// Create an empty session
    New {
        /// Initial title
        #[arg(short, long)]
        title: Option<String>,
        /// Link the session to an assistant
        #[arg(long, group = "link")]
        assistant: Option<String>,
        /// Link the session to a scheduled task
        #[arg(long, group = "link")]
        task: Option<String>,
        /// Link the session to a pipeline
        #[arg(long, group = "link")]
        pipeline: Option<String>,
    },
    /// Append a message, creating a session if none is given
    Add {
        /// Message text
        text: String,
        /// Session ID or unique prefix
        #[arg(short, long)]
        session: Option<String>,
        /// Message role
        #[arg(short, long, value_enum, default_value = "user")]
        role: RoleArg,
        /// Provider-reported token count
        #[arg(long)]
        tokens: Option<u32>,
        /// Compact afterwards if the session crossed its threshold
        #[arg(long)]
        compact: bool,
        /// Context window used by token-based compaction
        #[arg(long)]
        context_window: Option<u64>,
    },
    /// Show or change a session title
    Title {
        /// Session ID or unique prefix
        id: String,
        /// New title
        title: Option<String>,
        /// Remove the title
        #[arg(long, conflicts_with = "title")]
        clear: bool,
    },
    /// Drop the active history, keeping the archive
    Clear {
        /// Session ID or unique prefix
        id: String,
    },
    /// Duplicate a session
    Copy {
        /// Session ID or unique prefix
        id: String,
    },
    /// Delete a session
    Delete {
        /// Session ID or unique prefix
        id: String,
    },
    /// Compact a session's history
    Compact {
        /// Session ID or unique prefix
        id: String,
        /// Switch the session to this strategy first
        #[arg(short, long)]
        strategy: Option<CompressionStrategy>,
        /// Context window used by token-based compaction
        #[arg(long)]
        context_window: Option<u64>,
        /// Compact even below the threshold
        #[arg(short, long)]
        force: bool,
    },
    /// Export a session
    Export {
        /// Session ID or unique prefix
        id: String,
        /// Output format
        #[arg(short, long, value_enum, default_value = "json")]
        format: ExportFormat,
        /// Include archived messages in markdown output
        #[arg(long)]
        archive: bool,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Check the configuration for errors
    Validate,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum RoleArg {
    User,
    Assistant,
    System,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::User => Role::User,
            RoleArg::Assistant => Role::Assistant,
            RoleArg::System => Role::System,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Json,
    Sqlite,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    Json,
    Markdown,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<parley_core::Error>() {
            Some(err) => eprintln!("Error: {}", format_error_with_suggestion(err)),
            None => eprintln!("Error: {:#}", e),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Load configuration
    let mut config = Config::load().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config, using defaults: {}", e);
        Config::default()
    });

    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = Some(dir);
    }
    if let Some(backend) = cli.backend {
        config.storage.backend = match backend {
            BackendArg::Json => StorageBackendKind::Json,
            BackendArg::Sqlite => StorageBackendKind::Sqlite,
        };
    }

    match cli.command {
        Commands::Session { action } => {
            commands::session::handle(action, &config).await?;
        }
        Commands::Config { action } => {
            commands::config::handle(action, &config)?;
        }
        Commands::Version => {
            println!("parley {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
