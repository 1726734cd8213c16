use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mcp_query_pipeline::{
    cli::{execute_command, Cli, Commands},
    config::{Config, LogFormat},
    langbase::{LangbaseClient, LangbaseGenerator},
    search::SearchClient,
    server::{AppState, McpServer},
    storage::SqliteStorage,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config);

    // Initialize storage
    let storage = match SqliteStorage::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database initialized");
            s
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            return Err(e.into());
        }
    };

    match cli.command {
        Some(Commands::Inspect(command)) => {
            let result = execute_command(command, &storage).await;
            println!("{}", result.message);
            std::process::exit(result.exit_code);
        }
        Some(Commands::Serve) | None => serve(config, storage).await,
    }
}

async fn serve(config: Config, storage: SqliteStorage) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "MCP query pipeline server starting..."
    );

    // Initialize Langbase client
    let langbase = match LangbaseClient::new(&config.langbase, config.request.clone()) {
        Ok(c) => {
            info!(base_url = %config.langbase.base_url, "Langbase client initialized");
            c
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize Langbase client");
            return Err(e.into());
        }
    };

    // Ensure required pipes exist (create if needed)
    info!("Ensuring required Langbase pipes exist...");
    if let Err(e) = langbase.ensure_pipes(&config.pipes).await {
        warn!(error = %e, "Failed to ensure pipes exist, continuing with configured names");
    }

    let search = match SearchClient::new(&config.search, config.request.clone()) {
        Ok(c) => {
            info!(base_url = %config.search.base_url, "Search client initialized");
            c
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize search client");
            return Err(e.into());
        }
    };

    let generator = LangbaseGenerator::new(langbase, config.pipes.clone());
    let state = AppState::new(config, Arc::new(generator), Arc::new(search))
        .with_storage(Arc::new(storage));

    // Start MCP server
    let server = McpServer::new(Arc::new(state));

    info!("Server ready, waiting for requests on stdin...");

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
///
/// Logs go to stderr; stdout carries JSON-RPC.
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
