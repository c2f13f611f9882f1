use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use progminer::config::MinerConfig;
use progminer::dag::DagCoordinator;
use progminer::device::open_devices;
use progminer::epoch::{EthashEpochs, SeedResolver};
use progminer::error_handling::FatalPolicy;
use progminer::farm::Farm;
use progminer::health::HealthChecker;
use progminer::logging;
use progminer::metrics::MetricsCollector;
use progminer::pool::{PoolManager, StratumClient};
use progminer::prometheus_metrics::PrometheusMetrics;
use progminer::server::{ApiContext, ApiServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = MinerConfig::from_env().context("loading configuration")?;
    config.validate().context("validating configuration")?;
    logging::init(&config.log_level);

    info!(version = progminer::pool::CLIENT_VERSION, backend = %config.backend, "starting");

    let metrics = Arc::new(MetricsCollector::new());
    let (farm, solutions) = Farm::new(metrics.clone(), FatalPolicy::new(config.exit_on_error));

    let devices = open_devices(config.backend, &config.devices, config.cpu_memory_bytes())
        .context("opening devices")?;
    let participants: Vec<usize> = devices.iter().map(|d| d.info().ordinal).collect();
    for device in &devices {
        let info = device.info();
        info!(ordinal = info.ordinal, name = %info.name, memory = info.total_memory, "device");
    }
    let coordinator = Arc::new(DagCoordinator::new(
        config.dag_load_mode,
        config.dag_builder,
        participants,
        config.get_dag_turn_timeout(),
    ));
    farm.start(devices, config.engine_settings(), coordinator, Arc::new(EthashEpochs::new()))
        .context("starting farm")?;

    let client = StratumClient::new(
        config.endpoint().context("parsing pool url")?,
        config.session_settings(),
        Arc::new(SeedResolver::new()),
    );
    let manager = PoolManager::new(client, farm.clone(), config.retry_config(), config.get_hashrate_interval());
    let pool = manager.handle();

    let shutdown = CancellationToken::new();

    if config.api_port != 0 {
        let context = ApiContext {
            farm: farm.clone(),
            pool: Some(pool),
            health: Arc::new(HealthChecker::new(metrics.clone(), config.clone())),
            prometheus: Arc::new(PrometheusMetrics::new()),
            readonly: config.api_readonly,
        };
        let server = ApiServer::new(context, config.api_bind.clone(), config.api_port);
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start(token).await {
                error!(error = %e, "api server failed");
            }
        });
    }

    let mut pool_task = tokio::spawn(manager.run(solutions, shutdown.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            shutdown.cancel();
            if let Err(e) = (&mut pool_task).await {
                warn!(error = %e, "pool task panicked");
            }
        }
        finished = &mut pool_task => {
            shutdown.cancel();
            match finished {
                Ok(Ok(())) => info!("pool manager finished"),
                Ok(Err(e)) => error!(error = %e, "pool connection abandoned"),
                Err(e) => warn!(error = %e, "pool task panicked"),
            }
        }
    }

    let farm = farm.clone();
    tokio::task::spawn_blocking(move || farm.stop()).await?;
    info!("stopped");
    Ok(())
}
