use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{RelayError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "pose_relay.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    /// Per-frame log lines
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// One inference per period
    Periodic,
    /// One inference per external trigger (SIGUSR1 or console)
    Manual,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    /// Normalization divisor for x
    #[serde(default = "default_width")]
    pub width: u32,
    /// Normalization divisor for y
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_trigger")]
    pub trigger: TriggerMode,
}

fn default_width() -> u32 { 1280 }
fn default_height() -> u32 { 720 }
fn default_trigger() -> TriggerMode { TriggerMode::Periodic }

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            trigger: default_trigger(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,
    #[serde(default = "default_inference_timeout_ms")]
    pub inference_timeout_ms: u64,
    /// Upper bound of the retry delay after consecutive failures
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_period_ms() -> u64 { 33 }
fn default_warmup_ms() -> u64 { 1000 }
fn default_inference_timeout_ms() -> u64 { 1000 }
fn default_max_backoff_ms() -> u64 { 1000 }

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            period_ms: default_period_ms(),
            warmup_ms: default_warmup_ms(),
            inference_timeout_ms: default_inference_timeout_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl TimingConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_osc_host")]
    pub osc_host: String,
    #[serde(default = "default_osc_port")]
    pub osc_port: u16,
    #[serde(default = "default_osc_address")]
    pub osc_address: String,
    /// Ingress queue depth shared by all producer connections
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Payload of the greeting sent to each new connection
    #[serde(default = "default_greeting")]
    pub greeting: String,
}

fn default_listen_addr() -> String { "0.0.0.0:3000".to_string() }
fn default_osc_host() -> String { "127.0.0.1".to_string() }
fn default_osc_port() -> u16 { 3333 }
fn default_osc_address() -> String { "/wek/inputs".to_string() }
fn default_queue_capacity() -> usize { 64 }
fn default_greeting() -> String { "world".to_string() }

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            osc_host: default_osc_host(),
            osc_port: default_osc_port(),
            osc_address: default_osc_address(),
            queue_capacity: default_queue_capacity(),
            greeting: default_greeting(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProducerConfig {
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Recorded poses, one PoseNet-style JSON object per line
    #[serde(default = "default_replay_file")]
    pub replay_file: String,
    /// Start over at end of file instead of reporting failures
    #[serde(default = "default_replay_loop")]
    pub replay_loop: bool,
}

fn default_server_addr() -> String { "127.0.0.1:3000".to_string() }
fn default_reconnect_delay_ms() -> u64 { 2000 }
fn default_replay_file() -> String { "poses.jsonl".to_string() }
fn default_replay_loop() -> bool { true }

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            replay_file: default_replay_file(),
            replay_loop: default_replay_loop(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    /// Missing file means defaults; a file that exists must parse.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| RelayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(RelayError::Config(format!(
                "capture resolution must be non-zero, got {}x{}",
                self.capture.width, self.capture.height
            )));
        }
        if self.timing.period_ms == 0 {
            return Err(RelayError::Config("timing.period_ms must be > 0".into()));
        }
        if self.timing.inference_timeout_ms == 0 {
            return Err(RelayError::Config("timing.inference_timeout_ms must be > 0".into()));
        }
        if self.relay.queue_capacity == 0 {
            return Err(RelayError::Config("relay.queue_capacity must be > 0".into()));
        }
        if !self.relay.osc_address.starts_with('/') {
            return Err(RelayError::Config(format!(
                "relay.osc_address must start with '/', got {:?}",
                self.relay.osc_address
            )));
        }
        Ok(())
    }
}
