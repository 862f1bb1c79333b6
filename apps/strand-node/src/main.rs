use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use serde_json::json;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use strand_adapter::{Cluster, Emitter, LocalSocket, MemoryLocalAdapter, NamespaceAdapter};
use strand_core::{BroadcastOptions, NamespaceName, Packet, Session};
use strand_log::{LogStore, MemoryLog};
use tracing::{error, info, warn};

mod config;

use crate::config::NodeConfig;

#[derive(Parser)]
#[command(name = "strand-node", about = "Runs simulated processes over a shared event log")]
struct Cli {
    /// Path to a .toml/.yaml/.json config file or a .env file.
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Overrides the configured number of processes.
    #[arg(long, env = "STRAND_NODES")]
    nodes: Option<usize>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Starts the processes and broadcasts on every tick (default).
    Run,
    /// Prints the effective configuration as JSON and exits.
    ShowConfig,
}

struct Process {
    cluster: Arc<Cluster>,
    local: Arc<MemoryLocalAdapter>,
    adapter: Arc<NamespaceAdapter>,
}

#[tokio::main]
async fn main() {
    let filter = std::env::var("STRAND_LOG").unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut cfg = match NodeConfig::new(cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load config: {err}");
            std::process::exit(2);
        }
    };
    if let Some(nodes) = cli.nodes {
        cfg.nodes = nodes.max(1);
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::ShowConfig => match serde_json::to_string_pretty(&cfg) {
            Ok(rendered) => println!("{rendered}"),
            Err(err) => error!("failed to render config: {err}"),
        },
        Commands::Run => run(cfg).await,
    }
}

/// Flag set by SIGTERM or SIGINT. A signal whose handler cannot be
/// installed is logged and left at its default action.
fn shutdown_flag() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    for (name, signal) in [("SIGTERM", SIGTERM), ("SIGINT", SIGINT)] {
        if let Err(err) = flag::register(signal, Arc::clone(&shutdown)) {
            warn!("failed to register {name} handler: {err}");
        }
    }
    shutdown
}

async fn run(cfg: NodeConfig) {
    let shutdown = shutdown_flag();

    let log = Arc::new(MemoryLog::with_retention(cfg.log_retention()));
    let namespace = NamespaceName::from(cfg.namespace.clone());

    let mut processes = Vec::with_capacity(cfg.nodes);
    for index in 0..cfg.nodes {
        let cluster = Cluster::new(log.clone(), cfg.adapter_config(index));
        let local = Arc::new(MemoryLocalAdapter::new().with_recovery(cfg.recovery));
        local.set_server_side_reply(Some(json!("pong")));
        local.connect(
            LocalSocket::new(format!("{}-sock", cluster.uid())).in_rooms(cfg.rooms.clone()),
        );
        let adapter = cluster.attach(namespace.clone(), local.clone()).await;
        info!(node = index, uid = %cluster.uid(), namespace = %namespace, "process attached");
        processes.push(Process {
            cluster,
            local,
            adapter,
        });
    }

    let emitter = Emitter::new(log.clone())
        .with_created_at_field(cfg.adapter_config(0).add_created_at_field)
        .of(namespace.clone());

    info!(
        nodes = cfg.nodes,
        retention = ?cfg.retention,
        tick = ?cfg.tick_interval,
        "strand node running"
    );

    let mut tick: u64 = 0;
    let mut last_health_log = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        tokio::time::sleep(cfg.tick_interval).await;
        tick += 1;

        let sender = &processes[(tick as usize) % processes.len()];
        let mut opts = BroadcastOptions::default();
        if let Some(room) = cfg.rooms.first() {
            opts = opts.to(room.clone());
        }
        let packet = Packet::event(namespace.as_str(), "tick", vec![json!(tick)]);
        if let Err(err) = sender.adapter.broadcast(packet, &opts).await {
            warn!(uid = %sender.cluster.uid(), "broadcast failed: {err}");
        }

        if tick % 5 == 0 {
            match sender.adapter.fetch_sockets(&BroadcastOptions::default()).await {
                Ok(sockets) => info!(uid = %sender.cluster.uid(), sockets = sockets.len(), "fetched sockets"),
                Err(err) => warn!(uid = %sender.cluster.uid(), "fetch_sockets: {err}"),
            }
            match sender
                .adapter
                .server_side_emit_with_ack(vec![json!("ping"), json!(tick)])
                .await
            {
                Ok(replies) => info!(uid = %sender.cluster.uid(), replies = replies.len(), "server side ping"),
                Err(err) => warn!(uid = %sender.cluster.uid(), "server side ping: {err}"),
            }
            if let Err(err) = emitter.emit("announcement", vec![json!({ "tick": tick })]).await {
                warn!("emitter failed: {err}");
            }
        }

        if cfg.recovery && tick % 10 == 0 {
            check_recovery(sender).await;
        }

        if last_health_log.elapsed() >= cfg.health_log_interval {
            let health = log.health_snapshot();
            info!(
                appended = health.records_appended,
                retained = health.records_retained,
                evicted = health.records_evicted,
                feeds_active = health.feeds_active,
                "log health"
            );
            for process in &processes {
                info!(
                    uid = %process.cluster.uid(),
                    feed = ?process.cluster.feed_state(),
                    servers = process.adapter.server_count(),
                    sockets = process.local.socket_count(),
                    "process health"
                );
            }
            last_health_log = Instant::now();
        }
    }

    info!("shutting down");
    for process in &processes {
        process.cluster.close().await;
    }
}

/// Persists a session for the process socket and restores it from the
/// last offset it received.
async fn check_recovery(process: &Process) {
    let socket_id = format!("{}-sock", process.cluster.uid());
    let Some(offset) = process
        .local
        .inbox(&socket_id)
        .iter()
        .rev()
        .find_map(|packet| packet.last().and_then(|v| v.as_str()).map(str::to_string))
    else {
        return;
    };
    let private_id = format!("{socket_id}-private");
    let session = Session::new(private_id.clone(), socket_id.clone())
        .with_rooms(process.local.rooms_of(&socket_id));
    if let Err(err) = process.adapter.persist_session(session).await {
        warn!(uid = %process.cluster.uid(), "persist session: {err}");
        return;
    }
    match process.adapter.restore_session(&private_id, &offset).await {
        Ok(session) => info!(
            uid = %process.cluster.uid(),
            missed = session.missed_packets.len(),
            "session restored"
        ),
        Err(err) => warn!(uid = %process.cluster.uid(), "restore session: {err}"),
    }
}
