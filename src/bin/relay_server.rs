//! Relay server: accepts pose producers over TCP and forwards every pose
//! update as an OSC `/wek/inputs` datagram.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;

use pose_relay::config::{Config, DEFAULT_CONFIG_PATH};
use pose_relay::dispatch::{Endpoint, UdpDispatcher};
use pose_relay::log;
use pose_relay::logging::Logger;
use pose_relay::osc::{RelayEncoder, WireSchema};
use pose_relay::relay::{ingress_queue, RelayServer, RelayStats, RelayWorker};

#[derive(Parser, Debug)]
#[command(about = "Relay normalized poses from TCP producers to an OSC consumer")]
struct Args {
    /// TOML config file (defaults are used when it does not exist)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load_or_default(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let logger = Logger::open("relay", config.verbose).context("failed to open log file")?;

    log!(logger, "Relay Server ({})", env!("GIT_VERSION"));
    log!(logger, "[config] listen={} osc={}:{}{} queue={}",
        config.relay.listen_addr, config.relay.osc_host, config.relay.osc_port,
        config.relay.osc_address, config.relay.queue_capacity);

    let endpoint = Endpoint::new(config.relay.osc_host.clone(), config.relay.osc_port);
    let dispatcher = UdpDispatcher::new(&endpoint)
        .await
        .with_context(|| format!("failed to set up UDP dispatcher for {endpoint}"))?;
    log!(logger, "[udp] sending to {}", dispatcher.target());

    let stats = Arc::new(RelayStats::default());
    let (tx, rx) = ingress_queue(config.relay.queue_capacity);
    let encoder = RelayEncoder::new(WireSchema::pose(config.relay.osc_address.clone()));
    let worker = RelayWorker::new(encoder, dispatcher, Arc::clone(&stats), logger.clone());
    let worker_task = tokio::spawn(worker.run(rx));

    let listener = TcpListener::bind(&config.relay.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.relay.listen_addr))?;
    log!(logger, "[tcp] listening on {}", listener.local_addr()?);

    let server = RelayServer::new(config.relay.greeting.clone(), tx, Arc::clone(&stats), logger.clone());
    tokio::select! {
        _ = server.serve(listener) => {}
        _ = tokio::signal::ctrl_c() => {
            log!(logger, "Shutting down...");
        }
    }

    drop(server);
    worker_task.abort();
    log!(logger, "[stats] connections={} received={} sent={} failed={} dropped={} rejected={}",
        RelayStats::get(&stats.connections), RelayStats::get(&stats.received),
        RelayStats::get(&stats.sent), RelayStats::get(&stats.failed),
        RelayStats::get(&stats.dropped), RelayStats::get(&stats.rejected));
    Ok(())
}
