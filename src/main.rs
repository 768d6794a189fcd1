/*!
 * Fleet Agent - Main Entry Point
 *
 * Queue-driven execution agent:
 * - Polls a work-distribution queue over one long-lived session
 * - Runs each job in an isolated worker child process
 * - Self-updates in place and restarts via exit code 3
 */

use anyhow::{bail, Context};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleet_agent::{
    run_worker, AgentConfig, HttpQueueService, JobDispatcher, MessageListener, RunLoop,
    SelfUpdater, Updater,
};

/// Initialize structured tracing.
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - FLEET_AGENT_LOG_JSON: Enable JSON output (default: false)
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var("FLEET_AGENT_LOG_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_line_number(true)
                    .with_file(true),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .compact(),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    match run().await {
        Ok(code) => std::process::ExitCode::from((code & 0xff) as u8),
        Err(e) => {
            error!("{e:#}");
            std::process::ExitCode::from(1)
        }
    }
}

async fn run() -> anyhow::Result<i32> {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("worker") => {
            let handle_out = args.get(2).context("missing channel output handle")?;
            let handle_in = args.get(3).context("missing channel input handle")?;
            Ok(run_worker(handle_out, handle_in).await)
        }
        Some("run") | None => run_agent().await,
        Some(other) => bail!("unknown mode '{other}', expected 'run' or 'worker'"),
    }
}

async fn run_agent() -> anyhow::Result<i32> {
    let config = AgentConfig::from_env()?;
    info!(
        "Fleet agent {} starting (agent id {})",
        env!("CARGO_PKG_VERSION"),
        config.agent_id
    );

    let service = HttpQueueService::new(&config.server_url, &config.agent_id)?;
    let listener = Arc::new(MessageListener::new(Arc::new(service)));

    let worker_exe = std::env::current_exe().context("resolving the agent executable")?;
    let dispatcher = Arc::new(JobDispatcher::new(worker_exe, config.channel_timeout));
    let updater: Arc<dyn Updater> = Arc::new(SelfUpdater::new(
        env!("CARGO_PKG_VERSION"),
        config.staging_dir.clone(),
    ));

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let run_loop = RunLoop::new(listener, dispatcher, updater, config.update_disabled);
    let exit = run_loop.run(shutdown).await;
    info!("Fleet agent exiting: {exit:?}");
    Ok(exit.code())
}

/// Ctrl-C or SIGTERM cancels the shutdown token; everything below the
/// run loop stops cooperatively.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let sigterm = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, shutting down"),
            _ = sigterm => info!("SIGTERM received, shutting down"),
        }
        shutdown.cancel();
    });
}
