use std::env;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use ipnet::Ipv4Net;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

mod api;
mod error;
mod ha;
mod persist;
mod pool;
mod registry;
mod synth;

use api::{AppState, SharedState};
use ha::{Cluster, ClusterConfig};
use registry::Registry;

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn cluster_config_from_env() -> ClusterConfig {
    let peers: Vec<String> = env::var("HUBNET_CLUSTER_PEERS")
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(|p| p.trim().trim_end_matches('/').to_string())
                .filter(|p| !p.is_empty())
                .collect()
        })
        .unwrap_or_default();

    ClusterConfig {
        node_id: env::var("HUBNET_NODE_ID").unwrap_or_else(|_| "controller".to_string()),
        cluster_id: env::var("HUBNET_CLUSTER_ID").unwrap_or_else(|_| "hubnet".to_string()),
        peers,
        heartbeat_interval: Duration::from_secs(env_parsed(
            "HUBNET_HEARTBEAT_INTERVAL_SECS",
            ha::DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
        )),
        election_timeout: Duration::from_secs(env_parsed(
            "HUBNET_ELECTION_TIMEOUT_SECS",
            ha::DEFAULT_ELECTION_TIMEOUT.as_secs(),
        )),
    }
}

fn spawn_logged<F>(name: &'static str, task: F)
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = task.await {
            error!("{name} task exited with error: {err:#}");
        }
    });
}

/// Periodically marks nodes that stopped reporting as INACTIVE. Runs on
/// the leader only, since the transition is a mutation.
async fn run_sweep_loop(
    state: SharedState,
    threshold: chrono::Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut tick = tokio::time::interval(Duration::from_secs(30));

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => return Ok(()),
        }

        if !state.cluster.is_leader() {
            continue;
        }

        let swept = {
            let mut registry = state.registry.lock().unwrap();
            let swept = registry.sweep_inactive(Utc::now(), threshold);
            if swept > 0 {
                if let Some(path) = &state.state_file {
                    if let Err(err) = persist::save(&registry, path) {
                        tracing::warn!("failed to persist registry state: {err:#}");
                    }
                }
            }
            swept
        };

        if swept > 0 {
            info!(count = swept, "liveness sweep marked nodes inactive");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let subnet: Ipv4Net = env::var("HUBNET_SUBNET")
        .unwrap_or_else(|_| "10.100.0.0/16".to_string())
        .parse()?;

    let api_port: u16 = env_parsed("HUBNET_API_PORT", 8008);
    let token = env::var("HUBNET_BEARER_TOKEN").ok();
    let state_file = env::var("HUBNET_STATE_FILE").ok().map(PathBuf::from);

    let inactivity_threshold =
        chrono::Duration::seconds(env_parsed("HUBNET_INACTIVITY_THRESHOLD_SECS", 90));

    let registry = match &state_file {
        Some(path) => persist::load(subnet, path)?,
        None => Registry::new(subnet),
    };
    info!(
        subnet = %subnet,
        nodes = registry.len(),
        "registry ready"
    );

    let cluster = Arc::new(Cluster::new(cluster_config_from_env()));
    let state: SharedState = Arc::new(AppState {
        registry: Mutex::new(registry),
        cluster: cluster.clone(),
        state_file,
        token,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    spawn_logged(
        "ha-heartbeat",
        ha::run_heartbeat_loop(cluster.clone(), shutdown_rx.clone()),
    );
    spawn_logged(
        "ha-election",
        ha::run_election_loop(cluster.clone(), shutdown_rx.clone()),
    );
    spawn_logged(
        "ha-announce",
        ha::run_announce_loop(cluster.clone(), shutdown_rx.clone()),
    );
    spawn_logged(
        "liveness-sweep",
        run_sweep_loop(state.clone(), inactivity_threshold, shutdown_rx.clone()),
    );

    let app = api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", api_port).parse()?;
    info!("hubnet controller API listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    Ok(())
}
