use std::net::SocketAddr;

use tracing::info;

use tpn_daemon::scheduler::Scheduler;
use tpn_daemon::NodeConfig;
use tpn_web::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = NodeConfig::load()?;
    let bind_addr: SocketAddr = config.bind_addr.parse()?;

    info!(run_mode = ?config.run_mode, %bind_addr, "starting tpnd");

    let state = AppState::build(config).await?;

    let scheduler = Scheduler::spawn(
        state.config().run_mode,
        state.wg_leases.clone(),
        state.wg_driver.clone(),
        state.socks5_leases.clone(),
        state.dante_driver.clone(),
        state.worker_scorer.clone(),
        state.worker_fetcher.clone(),
        Some(state.pool_scorer.clone()),
        Some(state.federation.clone()),
        Some(state.validators.clone()),
    );

    let result = tpn_web::server::serve(state, bind_addr).await;
    scheduler.shutdown();
    result
}
