use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for Sumi-Sluice
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    pub store: StoreConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub source: SourceConfig,
}

/// How the termination monitor treats an idle pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum IdleMode {
    /// Raise stop once every queue has stayed empty through a settle delay
    #[serde(rename = "finite")]
    Finite,

    /// Keep waiting for new work, never raising stop on idleness
    #[serde(rename = "long-running")]
    LongRunning,
}

impl Default for IdleMode {
    fn default() -> Self {
        Self::Finite
    }
}

/// Pipeline sizing and retry policy
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Number of worker threads running the extractor
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Number of scheduler instances (each runs a replenish and a dispatch loop)
    #[serde(default = "default_schedulers")]
    pub schedulers: usize,

    /// A seed is dropped once its retry count reaches this value
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// Durable ready occupancy above which replenishment backs off
    #[serde(rename = "scheduler-size-cap")]
    pub scheduler_size_cap: u64,

    /// In-memory seed queue length at which dispatch backs off
    #[serde(rename = "queue-length-threshold")]
    pub queue_length_threshold: usize,

    /// Number of items persisted per sink batch
    #[serde(rename = "sink-batch-length")]
    pub sink_batch_length: usize,

    /// Behaviour once the pipeline is idle
    #[serde(rename = "idle-mode", default)]
    pub idle_mode: IdleMode,
}

fn default_workers() -> usize {
    4
}

fn default_schedulers() -> usize {
    2
}

/// Poll and backoff intervals, all in milliseconds
#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    /// Short sleep when a queue is empty
    #[serde(rename = "poll-wait", default = "default_poll_wait")]
    pub poll_wait_ms: u64,

    /// Longer sleep when the in-memory seed queue is full
    #[serde(rename = "poll-block", default = "default_poll_block")]
    pub poll_block_ms: u64,

    /// Replenishment backoff while the durable ready set is saturated
    #[serde(rename = "seed-backoff", default = "default_seed_backoff")]
    pub seed_backoff_ms: u64,

    /// Sink sleep when no batch is ready
    #[serde(rename = "sink-backoff", default = "default_sink_backoff")]
    pub sink_backoff_ms: u64,

    /// Delay before the monitor starts sampling
    #[serde(rename = "monitor-grace", default = "default_monitor_grace")]
    pub monitor_grace_ms: u64,

    /// Sleep between monitor samples
    #[serde(rename = "monitor-interval", default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,

    /// Wait between raising drain and re-sampling
    #[serde(rename = "settle-delay", default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Monitor cadence while idle in long-running mode
    #[serde(rename = "idle-wait", default = "default_idle_wait")]
    pub idle_wait_ms: u64,

    /// Interval between durable store heartbeats
    #[serde(rename = "heartbeat-interval", default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_wait_ms: default_poll_wait(),
            poll_block_ms: default_poll_block(),
            seed_backoff_ms: default_seed_backoff(),
            sink_backoff_ms: default_sink_backoff(),
            monitor_grace_ms: default_monitor_grace(),
            monitor_interval_ms: default_monitor_interval(),
            settle_delay_ms: default_settle_delay(),
            idle_wait_ms: default_idle_wait(),
            heartbeat_interval_ms: default_heartbeat_interval(),
        }
    }
}

impl TimingConfig {
    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    pub fn poll_block(&self) -> Duration {
        Duration::from_millis(self.poll_block_ms)
    }

    pub fn seed_backoff(&self) -> Duration {
        Duration::from_millis(self.seed_backoff_ms)
    }

    pub fn sink_backoff(&self) -> Duration {
        Duration::from_millis(self.sink_backoff_ms)
    }

    pub fn monitor_grace(&self) -> Duration {
        Duration::from_millis(self.monitor_grace_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

fn default_poll_wait() -> u64 {
    500
}

fn default_poll_block() -> u64 {
    2_000
}

fn default_seed_backoff() -> u64 {
    15_000
}

fn default_sink_backoff() -> u64 {
    1_000
}

fn default_monitor_grace() -> u64 {
    30_000
}

fn default_monitor_interval() -> u64 {
    3_000
}

fn default_settle_delay() -> u64 {
    3_000
}

fn default_idle_wait() -> u64 {
    60_000
}

fn default_heartbeat_interval() -> u64 {
    10_000
}

/// Durable seed store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite seed database
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// How long the replenishment lock is held before it expires (milliseconds)
    #[serde(rename = "lock-ttl", default = "default_lock_ttl")]
    pub lock_ttl_ms: u64,
}

fn default_lock_ttl() -> u64 {
    30_000
}

/// Item sink configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// Path to the SQLite item database
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// When set, items are appended to this JSON-lines file instead of SQLite
    #[serde(rename = "jsonl-path", default)]
    pub jsonl_path: Option<String>,

    /// Logical destinations, one sink loop each
    pub destinations: Vec<String>,
}

/// Upstream seed producer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Seed payloads listed inline
    #[serde(default)]
    pub seeds: Vec<String>,

    /// File with one seed payload per line
    #[serde(rename = "seed-file", default)]
    pub seed_file: Option<String>,

    /// Seeds pulled from the source per replenishment round
    #[serde(rename = "replenish-batch", default = "default_replenish_batch")]
    pub replenish_batch: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            seed_file: None,
            replenish_batch: default_replenish_batch(),
        }
    }
}

fn default_replenish_batch() -> usize {
    100
}
