//! reviewbot CLI: loads configuration, wires the core components together,
//! and runs either the HTTP surface + orchestrator (`serve`) or a one-shot
//! migration check (`migrate`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use reviewbot_agent::{Orchestrator, ReviewAgentDeps};
use reviewbot_analyzer::AnalyzerClient;
use reviewbot_core::config::Config;
use reviewbot_core::{BoundedConcurrency, CircuitBreakers, Database};
use reviewbot_platform::AzureDevOpsClient;
use reviewbot_web::AppState;

fn init_logging(verbose: u8, quiet: bool, json: bool) -> Result<()> {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env().add_directive(format!("reviewbot={level}").parse()?);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 2)
        .with_file(verbose >= 3)
        .with_line_number(verbose >= 3);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "reviewbot")]
#[command(about = "Automated code review service for Azure DevOps pull requests")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Output logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook ingestor, admin API, and orchestrator worker pool
    Serve {
        /// Path to the TOML config file
        #[arg(long, env = "REVIEWBOT_CONFIG", default_value = "reviewbot.toml")]
        config: PathBuf,

        /// Number of orchestrator worker loops
        #[arg(long, default_value_t = 3)]
        workers: usize,
    },
    /// Open the database and run pending migrations, then exit
    Migrate {
        #[arg(long, env = "REVIEWBOT_CONFIG", default_value = "reviewbot.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet, cli.log_json)?;

    match cli.command {
        Commands::Serve { config, workers } => serve(config, workers).await,
        Commands::Migrate { config } => migrate(config).await,
    }
}

async fn migrate(config_path: PathBuf) -> Result<()> {
    let config = Config::load(&config_path).context("loading config")?;
    let _db = Database::new(&config.database.path).await.context("running migrations")?;
    info!(path = %config.database.path, "migrations applied");
    Ok(())
}

async fn serve(config_path: PathBuf, workers: usize) -> Result<()> {
    let config = Config::load(&config_path).context("loading config")?;

    let db = Arc::new(Database::new(&config.database.path).await.context("opening database")?);

    let platform = Arc::new(AzureDevOpsClient::new(
        config.azure_devops.organization_url.clone(),
        config.azure_devops.personal_access_token.clone(),
    ));
    let analyzer = Arc::new(AnalyzerClient::new(
        config.analyzer.endpoint.clone(),
        config.analyzer.api_key.clone(),
        config.analyzer.model.clone(),
    ));
    let breakers = Arc::new(CircuitBreakers::new(config.circuit_breaker.clone()));
    let concurrency = Arc::new(BoundedConcurrency::new(config.analysis_concurrency));
    let retry = config.retry.clone();

    let deps_db = db.clone();
    let deps_factory: Arc<dyn Fn() -> ReviewAgentDeps + Send + Sync> = Arc::new(move || ReviewAgentDeps {
        database: deps_db.clone(),
        platform: platform.clone(),
        analyzer: analyzer.clone(),
        breakers: breakers.clone(),
        retry: retry.clone(),
        concurrency: concurrency.clone(),
    });

    let orchestrator = Arc::new(Orchestrator::new(db.clone(), deps_factory, workers));
    orchestrator.recover_on_boot().await.context("recovering stale agents on boot")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let orchestrator_handle = tokio::spawn(orchestrator.run(shutdown_rx));

    let webhook_secret = Some(config.server.webhook_secret.clone());
    let admin_api_key = std::env::var("REVIEWBOT_ADMIN_API_KEY").ok().map(secrecy::SecretString::from);
    let state = Arc::new(AppState::new(db.clone(), webhook_secret, admin_api_key));
    let app = reviewbot_web::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.server.bind_addr))?;
    info!(bind_addr = %config.server.bind_addr, "reviewbot listening");

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    let _ = shutdown_tx.send(());
    let _ = orchestrator_handle.await;
    serve_result.context("http server error")?;

    info!("reviewbot stopped");
    Ok(())
}
