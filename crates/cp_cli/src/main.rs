//! ClassPoints CLI - inspect a persisted ClassPoints cache
//!
//! Usage: classpoints <command> [options]

mod commands;

use clap::{Parser, Subcommand};
use cp_common::{Collection, CpError, EXIT_CONFIG_ERROR, EXIT_ERROR};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "classpoints",
    version = "0.1.0",
    about = "Inspect the ClassPoints local cache"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Workspace root (defaults to $CLASSPOINTS_WORKSPACE, then the current directory)
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print one cached collection of a class
    Show {
        /// students, praise_log, emotion_log or notifications
        collection: Collection,

        /// Teacher account id
        #[arg(long)]
        owner: String,

        /// Class id
        #[arg(long = "class")]
        class_id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List writes waiting in the offline queue
    Queue {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the owner scopes present in the cache
    Scopes,

    /// Check cached collections of a class for ordering and duplicate ids
    Doctor {
        /// Teacher account id
        #[arg(long)]
        owner: String,

        /// Class id
        #[arg(long = "class")]
        class_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let root = match cli.workspace.clone() {
        Some(root) => root,
        None => match std::env::var_os("CLASSPOINTS_WORKSPACE") {
            Some(root) => PathBuf::from(root),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        },
    };

    let config = match cp_config::Config::load(&root) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    cp_common::telemetry::init_tracing(cli.verbose || config.logging.verbose, config.logging.json);
    tracing::debug!("ClassPoints CLI started in {:?}", root);

    let result = match cli.command {
        Commands::Show {
            collection,
            owner,
            class_id,
            json,
        } => commands::cmd_show(&config, collection, &owner, &class_id, json),
        Commands::Queue { json } => commands::cmd_queue(&config, json),
        Commands::Scopes => commands::cmd_scopes(&config),
        Commands::Doctor { owner, class_id } => commands::cmd_doctor(&config, &owner, &class_id),
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(EXIT_ERROR),
        Err(e) => {
            eprintln!("Error: {}", e);
            let code = match e.downcast_ref::<CpError>() {
                Some(CpError::ConfigError(_)) => EXIT_CONFIG_ERROR,
                _ => EXIT_ERROR,
            };
            std::process::exit(code);
        }
    }
}
