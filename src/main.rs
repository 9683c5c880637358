use anyhow::{anyhow, Context, Result};
use meshroute::api::create_api_router;
use meshroute::config::SetupNodeConfig;
use meshroute::control::AdmissionControl;
use meshroute::keys::PubKey;
use meshroute::setup::SetupNode;
use meshroute::transport::tcp::{TcpDialer, TcpSetupListener};
use meshroute::transport::{Listener, SETUP_PORT};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing().context("initialize tracing subscriber")?;

    if let Err(err) = run().await {
        tracing::error!(error = ?err, "fatal setup node error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<()> {
    let config = SetupNodeConfig::load().context("load setup node configuration")?;
    let signing_key = config.signing_key()?;
    let local_pk = PubKey::from(&signing_key);
    info!(
        setup_node = %local_pk,
        visors = config.visors.len(),
        max_inflight = config.max_inflight,
        "starting setup node"
    );

    let dialer = Arc::new(TcpDialer::new(signing_key, config.visors.clone()));
    let listener = TcpSetupListener::bind(config.listen_addr, SETUP_PORT)
        .await
        .with_context(|| format!("bind setup listener {}", config.listen_addr))?;
    let listener: Arc<dyn Listener> = Arc::new(listener);

    let node = Arc::new(SetupNode::new(
        local_pk,
        dialer,
        config.rpc_timeout(),
        AdmissionControl::new(config.max_inflight, config.rate_per_sec),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serving = tokio::spawn(node.clone().serve(listener, shutdown_rx));

    if let Some(api_addr) = config.api_addr {
        let api_router = create_api_router(node.clone());
        let api_listener = tokio::net::TcpListener::bind(api_addr)
            .await
            .with_context(|| format!("bind API server address {api_addr}"))?;
        info!(address = %api_addr, "HTTP API server starting");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(api_listener, api_router).await {
                warn!(error = %e, "API server error");
            }
        });
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = node.stats();
                info!(
                    total = stats.total_requests,
                    successful = stats.successful_requests,
                    failed = stats.failed_requests,
                    success_rate = stats.success_rate,
                    avg_setup_ms = ?stats.avg_setup_time_ms,
                    closed_loops = stats.closed_loops,
                    "setup node heartbeat"
                );
            }
            res = tokio::signal::ctrl_c() => {
                if let Err(err) = res {
                    warn!(error = %err, "ctrl_c listener error");
                }
                info!("Shutdown signal received, exiting");
                break;
            }
        }
    }

    shutdown_tx.send_replace(true);
    serving.await.context("setup node task panicked")?;
    Ok(())
}

fn init_tracing() -> Result<()> {
    let env_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,hyper=warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("tracing subscriber init: {err}"))
}
