use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tracelink_core::config::Config as _;
use tracelink_core::tracing::{LogFormat, init_tracing};
use tracelink_relay::config::RelayConfig;
use tracelink_relay::domain::types::ProjectScope;
use tracelink_relay::infra::stream::ensure_stream;
use tracelink_relay::router::build_router;
use tracelink_relay::state::AppState;
use tracelink_relay::usecase::health::OutboxHealthUseCase;
use tracelink_relay::usecase::poll::PollOutboxUseCase;
use tracelink_relay::usecase::sweep::RetrySweepUseCase;
use tracelink_relay::worker::{poll_settings, spawn_relay_tasks};
use tracelink_relay_migration::{Migrator, MigratorTrait};

#[derive(Parser)]
#[command(name = "tracelink-relay", about = "Outbox relay for the tracelink event stream")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize the stream, run the background workers and the operator API (default).
    Serve,
    /// Apply pending outbox migrations.
    Migrate,
    /// Create the stream and consumer groups, then exit.
    InitStream,
    /// Print the outbox health report as JSON.
    Health {
        #[arg(long)]
        project_id: Option<String>,
    },
    /// Requeue retryable FAILED rows and run one poll tick.
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Serve);
    let format = match command {
        Command::Serve => LogFormat::from_env(),
        _ => LogFormat::Pretty,
    };
    init_tracing("info,sqlx=warn", format);

    let config = RelayConfig::try_from_env().context("failed to load relay configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid relay configuration: {e}"))?;

    let db = connect(&config).await?;
    if let Command::Migrate = command {
        Migrator::up(&db, None).await.context("failed to run migrations")?;
        info!("outbox migrations applied");
        return Ok(());
    }

    let redis = deadpool_redis::Config::from_url(&config.redis_url)
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .context("failed to create Redis pool")?;
    let state = AppState {
        db,
        redis,
        config: Arc::new(config),
    };

    match command {
        Command::Serve => serve(state).await,
        Command::InitStream => init_stream(&state).await,
        Command::Health { project_id } => print_health(&state, project_id.as_deref()).await,
        Command::Sweep => sweep_once(&state).await,
        Command::Migrate => Ok(()),
    }
}

async fn connect(config: &RelayConfig) -> anyhow::Result<DatabaseConnection> {
    let mut options = ConnectOptions::new(&config.database_url);
    options.sqlx_logging(false);
    Database::connect(options)
        .await
        .context("failed to connect to database")
}

async fn init_stream(state: &AppState) -> anyhow::Result<()> {
    ensure_stream(
        &state.redis,
        &state.config.stream_key,
        &state.config.consumer_groups,
        &state.config.consumer_group_start_id,
    )
    .await
    .context("failed to initialize event stream")?;
    if let Some(max_len) = state.config.stream_max_len {
        warn!(
            stream = %state.config.stream_key,
            max_len,
            "stream trimming enabled; unacknowledged entries beyond the cap are lost to consumer groups"
        );
    }
    Ok(())
}

async fn serve(state: AppState) -> anyhow::Result<()> {
    init_stream(&state).await?;

    let cancel = CancellationToken::new();
    let mut tasks = spawn_relay_tasks(&state, &cancel);

    let addr = format!("0.0.0.0:{}", state.config.relay_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("relay listening on {addr}");

    let shutdown = cancel.clone();
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown.cancel();
        })
        .await
        .context("server error")?;

    cancel.cancel();
    while tasks.join_next().await.is_some() {}
    info!("relay stopped");
    Ok(())
}

async fn print_health(state: &AppState, project_id: Option<&str>) -> anyhow::Result<()> {
    let project_id = project_id
        .map(str::parse)
        .transpose()
        .context("invalid --project-id")?;
    let usecase = OutboxHealthUseCase {
        store: state.outbox_store(),
        lag_threshold: state.config.lag_threshold(),
        max_retries: state.config.max_retries,
    };
    let health = usecase
        .execute(ProjectScope { project_id })
        .await
        .map_err(|e| anyhow::anyhow!(e.diagnostic()))?;
    println!("{}", serde_json::to_string_pretty(&health)?);
    Ok(())
}

async fn sweep_once(state: &AppState) -> anyhow::Result<()> {
    let sweep = RetrySweepUseCase {
        store: state.outbox_store(),
        max_retries: state.config.max_retries,
    };
    let requeued = sweep
        .execute()
        .await
        .map_err(|e| anyhow::anyhow!(e.diagnostic()))?;

    let poller = PollOutboxUseCase {
        store: state.outbox_store(),
        publisher: state.stream_publisher(),
        settings: poll_settings(state),
    };
    let report = poller
        .execute()
        .await
        .map_err(|e| anyhow::anyhow!(e.diagnostic()))?;
    info!(requeued, published = report.published, failed = report.failed, "manual sweep finished");
    Ok(())
}
