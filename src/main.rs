use anyhow::{Context, Result};
use toolchain_session_host::config::Config;
use toolchain_session_host::host::handler::serve;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

fn setup_logging(log_level_str: &str) {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("toolchain_session_host={}", level)));

    // stdout carries the protocol, so logs go to stderr.
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    setup_logging(&config.log_level);

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "Starting toolchain session host");
    tracing::debug!("Loaded configuration: {:?}", config);
    match &config.toolchain_bin {
        Some(bin) => tracing::info!(toolchain = %bin.display(), project_root = %config.project_root.display(), "Toolchain located"),
        None => tracing::warn!("No toolchain executable configured; run_job will fail"),
    }

    serve(config).await?;

    tracing::info!("Host shutdown.");
    Ok(())
}
