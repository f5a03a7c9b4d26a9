// Trellis server binary: serve a catalog over HTTP, or initialize the
// catalog database schema.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use trellis::catalog::migrations;
use trellis::catalog::translate::Dialect;
use trellis::{init_logging_with_level, ServerConfig, TreeError};

#[derive(Parser)]
#[command(name = "trellis", version, about = "Structured-data access service")]
struct Cli {
    /// Show debug output
    #[arg(long, global = true)]
    verbose: bool,
    /// Suppress everything except errors
    #[arg(long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server
    Serve {
        /// Path to a JSON configuration document
        #[arg(long, env = "TRELLIS_CONFIG")]
        config: PathBuf,
    },
    /// Create or upgrade the catalog database schema
    InitCatalog {
        /// Database URI, e.g. sqlite:catalog.db or postgres://...
        #[arg(long)]
        database: String,
    },
}

fn load_config(path: &PathBuf) -> Result<ServerConfig, TreeError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| TreeError::Config(format!("cannot read {}: {e}", path.display())))?;
    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == "yaml" || ext == "yml");
    if is_yaml {
        serde_yaml::from_str(&text)
            .map_err(|e| TreeError::Config(format!("cannot parse {}: {e}", path.display())))
    } else {
        serde_json::from_str(&text)
            .map_err(|e| TreeError::Config(format!("cannot parse {}: {e}", path.display())))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_logging_with_level(cli.verbose, cli.quiet) {
        eprintln!("failed to initialize logging: {err}");
        std::process::exit(1);
    }
    let result = match cli.command {
        Command::Serve { config } => match load_config(&config) {
            Ok(config) => trellis::run(config).await,
            Err(err) => Err(err),
        },
        Command::InitCatalog { database } => init_catalog(&database).await,
    };
    if let Err(err) = result {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn init_catalog(database: &str) -> Result<(), TreeError> {
    sqlx::any::install_default_drivers();
    let dialect = Dialect::from_uri(database)?;
    let pool = sqlx::any::AnyPoolOptions::new()
        .max_connections(1)
        .connect(database)
        .await?;
    migrations::initialize_database(&pool, dialect).await?;
    println!("catalog initialized at revision {}", migrations::REQUIRED_REVISION);
    pool.close().await;
    Ok(())
}
