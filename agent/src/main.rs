mod api;
mod config;
mod tunnel;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::Parser;

use api::{ControllerClient, RegisterBody};
use config::{AgentConfig, NodeType};
use tunnel::ApplyOutcome;

#[derive(Parser, Debug)]
#[command(
    name = "hubnet-agent",
    version,
    about = "hubnet edge agent: registers the local node and reconciles the WireGuard tunnel"
)]
struct Cli {
    /// Path to the persistent agent config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Controller base URL, e.g. http://controller:8008
    #[arg(long)]
    controller_url: Option<String>,

    /// Globally unique node name
    #[arg(long)]
    node_name: Option<String>,

    #[arg(long, value_enum)]
    node_type: Option<NodeType>,

    /// Publicly reachable host peers dial (required for hubs)
    #[arg(long)]
    endpoint: Option<String>,

    /// WireGuard listen port advertised with the endpoint
    #[arg(long)]
    port: Option<u16>,

    /// Tunnel interface name
    #[arg(long)]
    interface: Option<String>,

    /// Bearer token for the controller API
    #[arg(long)]
    token: Option<String>,

    /// Persistent keepalive in seconds; 0 disables
    #[arg(long)]
    keepalive: Option<u16>,

    /// Tunnel MTU
    #[arg(long)]
    mtu: Option<u16>,

    /// Run the periodic reconcile loop instead of a single pass
    #[arg(long)]
    daemon: bool,
}

fn load_or_init_config(path: &Path, cli: &Cli) -> Result<AgentConfig> {
    let mut cfg = match AgentConfig::load(path)? {
        Some(existing) => existing,
        None => {
            let hostname = hostname::get()?.to_string_lossy().into_owned();
            let (private_key, public_key) = config::generate_keypair();
            println!("[agent] generated WireGuard keypair for {}", hostname);

            AgentConfig {
                controller_url: std::env::var("HUBNET_CONTROLLER_URL")
                    .unwrap_or_else(|_| config::DEFAULT_CONTROLLER_URL.to_string()),
                node_name: hostname,
                node_type: NodeType::Spoke,
                endpoint: None,
                port: None,
                keepalive: config::DEFAULT_KEEPALIVE_SECS,
                mtu: config::DEFAULT_MTU,
                interface: config::DEFAULT_INTERFACE.to_string(),
                token: std::env::var("HUBNET_TOKEN").ok(),
                private_key,
                public_key,
                node_id: None,
                heartbeat_secs: config::DEFAULT_HEARTBEAT_SECS,
                config_refresh_secs: config::DEFAULT_CONFIG_REFRESH_SECS,
            }
        }
    };

    if let Some(url) = &cli.controller_url {
        cfg.controller_url = url.trim_end_matches('/').to_string();
    }
    if let Some(name) = &cli.node_name {
        cfg.node_name = name.clone();
    }
    if let Some(node_type) = cli.node_type {
        cfg.node_type = node_type;
    }
    if let Some(endpoint) = &cli.endpoint {
        cfg.endpoint = Some(endpoint.clone());
    }
    if let Some(port) = cli.port {
        cfg.port = Some(port);
    }
    if let Some(interface) = &cli.interface {
        cfg.interface = interface.clone();
    }
    if let Some(token) = &cli.token {
        cfg.token = Some(token.clone());
    }
    if let Some(keepalive) = cli.keepalive {
        cfg.keepalive = keepalive;
    }
    if let Some(mtu) = cli.mtu {
        cfg.mtu = mtu;
    }

    if cfg.node_type == NodeType::Hub && cfg.endpoint.is_none() {
        bail!("hub nodes require --endpoint so peers can reach them");
    }

    cfg.persist(path)?;
    Ok(cfg)
}

/// Registers the local node once and persists the assigned id.
fn ensure_registered(
    path: &Path,
    cfg: &mut AgentConfig,
    client: &ControllerClient,
) -> Result<String> {
    if let Some(id) = &cfg.node_id {
        return Ok(id.clone());
    }

    let body = RegisterBody {
        name: cfg.node_name.clone(),
        role: cfg.node_type.as_str(),
        public_key: cfg.public_key.clone(),
        endpoint: cfg.endpoint.clone(),
        port: cfg.port,
        keepalive: cfg.keepalive,
        mtu: cfg.mtu,
    };

    let node = client.register(&body)?;
    println!(
        "[agent] registered {} as node {} with overlay address {}",
        cfg.node_name, node.id, node.address
    );

    cfg.node_id = Some(node.id.clone());
    cfg.persist(path)?;
    Ok(node.id)
}

/// One full reconciliation: fetch the synthesized config, swap the
/// tunnel file if it changed, and converge interface state. Safe to run
/// repeatedly: unchanged content never restarts the interface.
fn reconcile(path: &Path, cfg: &mut AgentConfig, client: &ControllerClient) -> Result<()> {
    let id = ensure_registered(path, cfg, client)?;

    let node_config = client.fetch_config(&id)?;
    let contents = tunnel::render(&node_config, &cfg.private_key);
    let conf_path = tunnel::config_path(&cfg.interface);

    match tunnel::apply(&conf_path, &contents)? {
        ApplyOutcome::Applied => {
            println!(
                "[reconcile] tunnel config updated at {:?} ({} peers)",
                conf_path,
                node_config.peers.len()
            );
            tunnel::restart(&cfg.interface, &conf_path)?;

            // Best effort: a failed status report must never take the
            // tunnel down.
            if let Err(err) = client.report_status(&id, "active") {
                eprintln!("[reconcile] status report failed: {:#}", err);
            }
        }
        ApplyOutcome::Unchanged => {
            tunnel::ensure_up(&cfg.interface, &conf_path)?;
        }
    }

    Ok(())
}

/// Sleeps in one-second slices so a shutdown request is honored quickly.
/// Returns false when shutdown was requested.
fn sleep_interruptible(secs: u64, shutdown: &AtomicBool) -> bool {
    for _ in 0..secs {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        thread::sleep(Duration::from_secs(1));
    }
    !shutdown.load(Ordering::SeqCst)
}

fn run_once(path: &Path, cfg: &mut AgentConfig, client: &ControllerClient) -> Result<()> {
    let cap = Duration::from_secs(cfg.config_refresh_secs);
    api::with_backoff("reconcile", api::MAX_RETRIES, api::BACKOFF_BASE, cap, || {
        reconcile(path, cfg, client)
    })
}

fn run_daemon(path: &Path, mut cfg: AgentConfig, client: ControllerClient) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let flag = shutdown.clone();
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::SeqCst);
        })?;
    }

    let cap = Duration::from_secs(cfg.config_refresh_secs);

    // Registration must succeed before the heartbeat loop can report.
    let node_id = loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        match api::with_backoff(
            "registration",
            api::MAX_RETRIES,
            api::BACKOFF_BASE,
            cap,
            || ensure_registered(path, &mut cfg, &client),
        ) {
            Ok(id) => break id,
            Err(err) => {
                eprintln!("[agent] registration failed: {:#}; waiting for next window", err);
                if !sleep_interruptible(cfg.config_refresh_secs, &shutdown) {
                    return Ok(());
                }
            }
        }
    };

    // Heartbeat and reconcile share one lock so reconciliation never
    // overlaps itself or a liveness report.
    let reconcile_lock = Arc::new(Mutex::new(()));

    let heartbeat = {
        let client = client.clone();
        let shutdown = shutdown.clone();
        let lock = reconcile_lock.clone();
        let node_id = node_id.clone();
        let interval = cfg.heartbeat_secs;

        thread::spawn(move || {
            let mut last_contact: Option<Instant> = None;

            while !shutdown.load(Ordering::SeqCst) {
                {
                    let _guard = lock.lock().unwrap();
                    let result = api::with_backoff(
                        "heartbeat",
                        api::MAX_RETRIES,
                        api::BACKOFF_BASE,
                        cap,
                        || client.report_status(&node_id, "active"),
                    );

                    match result {
                        Ok(()) => last_contact = Some(Instant::now()),
                        Err(err) => {
                            let silence = last_contact
                                .map(|t| t.elapsed().as_secs())
                                .unwrap_or(0);
                            eprintln!(
                                "[heartbeat] controller unreachable for {}s: {:#}",
                                silence, err
                            );
                        }
                    }
                }

                if !sleep_interruptible(interval, &shutdown) {
                    break;
                }
            }
        })
    };

    // Reconcile loop on the main thread.
    while !shutdown.load(Ordering::SeqCst) {
        {
            let _guard = reconcile_lock.lock().unwrap();
            let result = api::with_backoff(
                "reconcile",
                api::MAX_RETRIES,
                api::BACKOFF_BASE,
                cap,
                || reconcile(path, &mut cfg, &client),
            );
            if let Err(err) = result {
                eprintln!(
                    "[reconcile] giving up until next tick: {:#}",
                    err
                );
            }
        }

        if !sleep_interruptible(cfg.config_refresh_secs, &shutdown) {
            break;
        }
    }

    // Any in-flight heartbeat finishes; nothing new is started.
    println!("[agent] shutdown requested");
    let _ = heartbeat.join();
    println!("[agent] exiting");

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = match &cli.config {
        Some(path) => path.clone(),
        None => config::default_config_path()?,
    };

    let mut cfg = load_or_init_config(&path, &cli)?;
    println!(
        "[agent] {} ({}) -> {}",
        cfg.node_name,
        cfg.node_type.as_str(),
        cfg.controller_url
    );

    let client = ControllerClient::new(&cfg.controller_url, cfg.token.clone())?;

    if cli.daemon {
        run_daemon(&path, cfg, client)
    } else {
        run_once(&path, &mut cfg, &client)
    }
}
