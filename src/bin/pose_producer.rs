//! Pose producer: runs the estimator on a fixed cadence, normalizes each
//! pose and streams it to the relay server. Reconnects when the relay
//! goes away.
//!
//! The estimator here replays recorded PoseNet output (`producer.replay_file`).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use pose_relay::capture::{CaptureLoop, Trigger};
use pose_relay::config::{Config, DEFAULT_CONFIG_PATH};
use pose_relay::log;
use pose_relay::logging::Logger;
use pose_relay::pose::ReplayEstimator;
use pose_relay::producer::run_with_reconnect;

#[derive(Parser, Debug)]
#[command(about = "Stream normalized poses to a relay server")]
struct Args {
    /// TOML config file (defaults are used when it does not exist)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Override `producer.replay_file`
    #[arg(long)]
    replay: Option<PathBuf>,
}

/// SIGUSR1 or `t` + Enter raises the flag
fn install_manual_trigger(flag: &Arc<AtomicBool>, logger: &Logger) -> Result<()> {
    signal_hook::flag::register(signal_hook::consts::SIGUSR1, Arc::clone(flag))
        .context("failed to register SIGUSR1")?;

    let console_flag = Arc::clone(flag);
    let console_logger = logger.clone();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) if line.trim() == "t" => {
                    log!(console_logger, "[input] capture triggered");
                    console_flag.store(true, Ordering::Release);
                }
                Ok(_) => {}
            }
        }
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load_or_default(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let logger = Logger::open("producer", config.verbose).context("failed to open log file")?;

    log!(logger, "Pose Producer ({})", env!("GIT_VERSION"));
    log!(logger, "[config] relay={} capture={}x{} period={}ms warmup={}ms timeout={}ms trigger={:?}",
        config.producer.server_addr, config.capture.width, config.capture.height,
        config.timing.period_ms, config.timing.warmup_ms, config.timing.inference_timeout_ms,
        config.capture.trigger);

    let replay_path = args
        .replay
        .unwrap_or_else(|| PathBuf::from(&config.producer.replay_file));
    let estimator = ReplayEstimator::open(&replay_path, config.producer.replay_loop)
        .with_context(|| format!("failed to open replay file {}", replay_path.display()))?;
    log!(logger, "[replay] {} poses from {}", estimator.len(), replay_path.display());

    let (trigger, flag) = Trigger::from_mode(config.capture.trigger);
    if let Some(flag) = &flag {
        install_manual_trigger(flag, &logger)?;
        log!(logger, "Manual trigger: send SIGUSR1 or type 't' + Enter");
    }

    let mut capture = CaptureLoop::new(&config, estimator, trigger, logger.clone());
    let reconnect_delay = Duration::from_millis(config.producer.reconnect_delay_ms);

    tokio::select! {
        result = run_with_reconnect(&mut capture, &config.producer.server_addr, reconnect_delay, &logger) => {
            result.context("capture stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            log!(logger, "Shutting down...");
        }
    }
    log!(logger, "[stats] frames={} pending_failures={}",
        capture.context().frames(), capture.controller().consecutive_failures());
    Ok(())
}
