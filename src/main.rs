mod api;
mod broker;
mod config;
mod db;
mod detector;
mod ingest;
mod messages;
mod mirror;
mod rules;
mod sim;
mod supervisor;

use anyhow::Result;
use std::future::{Future, IntoFuture};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{
    broker::Broker,
    config::Config,
    db::models::SensorType,
    detector::FaultDetector,
    ingest::IngestService,
    mirror::MirrorClient,
    sim::Simulator,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env (ignore error if file absent — env vars may be set externally)
    let _ = dotenvy::dotenv();

    // Initialise tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    // Load config
    let config = Config::from_env()?;

    // Connect to DB and run migrations
    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    info!("Database ready");

    // In-process message fabric shared by simulators, detector and ingest
    let broker = Broker::new();

    // Optional downstream mirror store
    let mirror = config
        .mirror_base_url
        .clone()
        .map(|base_url| MirrorClient::new(base_url, config.mirror_api_key.clone()));

    // Declare exchanges, queues and bindings up front so no message published
    // after startup can miss a queue.
    let detector = FaultDetector::new(broker.clone());
    detector.declare_topology()?;
    let ingest = IngestService::new(broker.clone(), pool.clone(), mirror);
    ingest.declare_topology()?;

    let mut detector_task = tokio::spawn(detector.run());
    let mut ingest_task = tokio::spawn(ingest.run());

    // Spawn one simulator per sensor class
    if config.simulators_enabled {
        let interval = Duration::from_secs(config.sim_interval_secs);
        for sensor_type in [SensorType::Iaq, SensorType::Power, SensorType::Presence] {
            let sim = Simulator::new(
                broker.clone(),
                sensor_type,
                config.floors,
                config.rooms_per_floor,
                interval,
            );
            tokio::spawn(sim.run());
        }
        info!(
            interval_secs = config.sim_interval_secs,
            floors = config.floors,
            rooms_per_floor = config.rooms_per_floor,
            "Simulators started"
        );
    }

    // Start HTTP server
    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "HTTP server listening");

    let serve = axum::serve(listener, api::router(pool))
        .with_graceful_shutdown(shutdown_signal(broker.clone()));

    run_until_shutdown(&broker, serve.into_future(), detector_task, ingest_task).await?;
    info!("Shutdown complete");

    Ok(())
}

/// Drive the HTTP server and both pipeline tasks to completion.
///
/// During shutdown the signal handler closes the broker before the server
/// finishes draining, so the pipeline tasks routinely complete first; that
/// only counts as a clean exit. A pipeline task finishing while the broker is
/// still open is fatal: the process is no longer doing its job and should
/// exit non-zero so it gets restarted.
async fn run_until_shutdown<S>(
    broker: &Broker,
    serve: S,
    mut detector_task: JoinHandle<Result<()>>,
    mut ingest_task: JoinHandle<Result<()>>,
) -> Result<()>
where
    S: Future<Output = std::io::Result<()>>,
{
    tokio::pin!(serve);
    let mut detector_done = false;
    let mut ingest_done = false;

    loop {
        tokio::select! {
            res = &mut serve => {
                res?;
                break;
            }
            res = &mut detector_task, if !detector_done => {
                res??;
                detector_done = true;
                if !broker.is_closed() {
                    anyhow::bail!("fault detector exited unexpectedly");
                }
            }
            res = &mut ingest_task, if !ingest_done => {
                res??;
                ingest_done = true;
                if !broker.is_closed() {
                    anyhow::bail!("ingest service exited unexpectedly");
                }
            }
        }
    }

    if !detector_done {
        detector_task.await??;
    }
    if !ingest_done {
        ingest_task.await??;
    }
    Ok(())
}

async fn shutdown_signal(broker: Broker) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
    broker.close();
}
