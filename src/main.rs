mod config;
mod metrics;
mod prober;
mod server;
mod util;

use config::ConfigManager;
use metrics::initialize_metrics;
use prober::{CancelHandle, NonBlockingConnector, TrustDnsResolver};
use server::{AppState, bind_listener};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

// lets handlers answer 503 before the runtime shuts down
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    // Load config first to get log level
    let config_mgr = ConfigManager::start().await?;
    let cfg = config_mgr.config.read().await.clone();
    cfg.validate()?;
    let log_level = cfg.get_tracing_level()?;

    println!("Starting connect_probe");

    initialize_metrics(cfg.enable_latency_history);

    if cfg.enable_latency_history {
        println!("Latency history tracking enabled");
    } else {
        println!("Latency history tracking disabled - showing current latency only");
    }

    // Init tracing with configured log level
    let directive = format!("connect_probe={}", log_level.as_str().to_lowercase());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    let metrics_addr: SocketAddr = ([0, 0, 0, 0], cfg.metrics_port).into();
    let api_addr: SocketAddr = ([0, 0, 0, 0], cfg.listen_port).into();
    let metrics_listener = bind_listener(metrics_addr, "metrics endpoint").await?;
    let api_listener = bind_listener(api_addr, "probe api").await?;

    let resolver = Arc::new(TrustDnsResolver::new(&cfg.dns_upstream, cfg.dns_timeout())?);
    let cancel = CancelHandle::new();
    let state = AppState::new(
        resolver,
        Arc::new(NonBlockingConnector),
        config_mgr.config.clone(),
        cancel.signal(),
    );

    info!(%api_addr, %metrics_addr, max_attempts = cfg.max_attempts, poll_interval_ms = cfg.poll_interval_ms, "serving probe api");
    let mut metrics_task = tokio::spawn(metrics::serve_metrics(metrics_listener));
    let mut api_task = tokio::spawn(server::serve(api_listener, state));

    tokio::select! {
        res = &mut api_task => {
            metrics_task.abort();
            return Err(anyhow::anyhow!("probe api server exited: {:?}", res));
        }
        res = &mut metrics_task => {
            api_task.abort();
            return Err(anyhow::anyhow!("metrics server exited: {:?}", res));
        }
        res = tokio::signal::ctrl_c() => res?,
    }

    info!("shutdown requested, cancelling in-flight probes");
    cancel.cancel();
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    api_task.abort();
    metrics_task.abort();

    Ok(())
}
