use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

use crate::auth::LocalAuth;
use crate::config::ConfigLoader;
use crate::storage;

pub mod commands;

use self::commands::{AddArgs, CliContext, CredentialArgs, EditArgs, IdArgs, ListArgs, WatchArgs};

#[derive(Parser, Debug)]
#[command(
    name = "notes-sync",
    version,
    about = "Notes with a live, filterable list"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Override the config file location (takes precedence over NOTESYNC_CONFIG)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the data directory (takes precedence over NOTESYNC_DATA)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create an account (does not sign in)
    Signup(CredentialArgs),
    /// Sign in and remember the session
    Login(CredentialArgs),
    /// Forget the stored session
    Logout,
    /// Show the signed-in account
    Whoami,
    /// Create a note
    Add(AddArgs),
    /// Change fields of an existing note
    Edit(EditArgs),
    /// Mark a note as completed
    Done(IdArgs),
    /// Delete a note
    Rm(IdArgs),
    /// Print the current note list
    List(ListArgs),
    /// Follow the note list and reprint it on every change
    Watch(WatchArgs),
    /// Show the color palette
    Colors,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        env::set_var("NOTESYNC_CONFIG", path);
    }
    if let Some(path) = &cli.data_dir {
        env::set_var("NOTESYNC_DATA", path);
    }

    let loader = ConfigLoader::discover()?;
    loader.paths().ensure_directories()?;
    let paths = loader.paths().clone();
    init_tracing(&cli.log_level)
        .with_context(|| format!("initialising logging at level {}", cli.log_level))?;
    let config = loader.load_or_init()?;

    if let Commands::Colors = cli.command {
        return commands::print_colors();
    }

    let storage = storage::init(&paths, &config.storage)?;
    let auth = LocalAuth::open(storage.clone(), paths.session_file.clone())
        .context("restoring session")?;
    let ctx = CliContext {
        config: Arc::new(config),
        storage,
        auth: Arc::new(auth),
    };

    match cli.command {
        Commands::Signup(args) => commands::signup(&ctx, args),
        Commands::Login(args) => commands::login(&ctx, args),
        Commands::Logout => commands::logout(&ctx),
        Commands::Whoami => commands::whoami(&ctx),
        Commands::Add(args) => commands::add_note(&ctx, args),
        Commands::Edit(args) => commands::edit_note(&ctx, args),
        Commands::Done(args) => commands::complete_note(&ctx, args),
        Commands::Rm(args) => commands::remove_note(&ctx, args),
        Commands::List(args) => commands::list_notes(&ctx, args),
        Commands::Watch(args) => commands::watch_notes(&ctx, args),
        Commands::Colors => commands::print_colors(),
    }
}

fn init_tracing(level: &str) -> Result<()> {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_try_init(|| {
        let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        Ok(())
    })
    .map(|_| ())
}
