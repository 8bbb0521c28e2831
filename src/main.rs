use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlagent::config::AgentConfig;
use sqlagent::driver::mysql::MySqlDriver;
use sqlagent::routes;
use sqlagent::session::{Agent, AgentPolicy};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = AgentConfig::load().context("failed to load configuration")?;
    let _log_guard = init_tracing(&config).context("failed to initialize logging")?;
    let addr = config
        .bind_addr()
        .context("failed to resolve bind address")?;

    let driver = Arc::new(MySqlDriver::from_config(&config));
    let agent = Agent::new(driver, AgentPolicy::from_config(&config));
    let router = routes::router(Arc::clone(&agent), &config);

    info!(%addr, version = sqlagent::about::version(), "starting sql agent");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(agent))
        .await
        .context("server terminated unexpectedly")
}

async fn shutdown_signal(agent: Arc<Agent>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
    agent.shutdown().await;
}

/// JSON-lines logging to a rolling file under the agent's state
/// directory; stdout when no directory can be resolved.
fn init_tracing(config: &AgentConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let log_dir = config.log_dir.clone().or_else(default_log_dir);
    let Some(log_dir) = log_dir else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
        return Ok(None);
    };

    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(sqlagent::APP_NAME)
        .filename_suffix("log")
        .max_log_files(config.log_max_files)
        .build(&log_dir)
        .context("failed to create rolling log file")?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    match config.log_format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .with_writer(writer)
            .init(),
    }
    Ok(Some(guard))
}

fn default_log_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(format!(".{}", sqlagent::APP_NAME)))
}
