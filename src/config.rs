//! Environment-driven configuration (§6). Centralizes the env vars the core
//! reads instead of scattering `std::env::var` calls through the job loops.

use std::time::Duration;

/// Runtime configuration for the job runtime (C7) and its jobs. Construct with
/// [`Config::from_env`]; every field has the default named in the spec.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cadence of the probe scheduler tick (§4.2). Default 30s.
    pub probe_tick: Duration,
    /// Cadence of the alert evaluator tick (§4.4). Default 60s.
    pub eval_tick: Duration,
    /// Cadence of the notification dispatcher tick (§4.5). Default 30s.
    pub notify_tick: Duration,
    /// Bound on concurrent probes (§4.3). Default 10.
    pub probe_worker_pool_size: usize,
    /// Per-subscriber buffer capacity on the event bus (§4.6). Default 10.
    pub event_subscriber_buffer: usize,
    /// Evaluator lookback window for "latest check per monitor" (§4.4). Default 5 min.
    pub eval_window: Duration,
    /// Target URL for cross-process event fan-out, if the event bus edge runs
    /// out of process (§6). `None` means in-process delivery only.
    pub broadcast_target_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            probe_tick: Duration::from_secs(30),
            eval_tick: Duration::from_secs(60),
            notify_tick: Duration::from_secs(30),
            probe_worker_pool_size: 10,
            event_subscriber_buffer: 10,
            eval_window: Duration::from_secs(5 * 60),
            broadcast_target_url: None,
        }
    }
}

impl Config {
    /// Load from environment, falling back to spec defaults for anything
    /// unset or unparseable. Call `dotenvy::dotenv().ok()` before this if a
    /// `.env` file should be consulted.
    pub fn from_env() -> Self {
        let default = Config::default();
        Config {
            probe_tick: env_secs("PROBE_TICK_SECONDS").unwrap_or(default.probe_tick),
            eval_tick: env_secs("EVAL_TICK_SECONDS").unwrap_or(default.eval_tick),
            notify_tick: env_secs("NOTIFY_TICK_SECONDS").unwrap_or(default.notify_tick),
            probe_worker_pool_size: std::env::var("PROBE_WORKER_POOL_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.probe_worker_pool_size),
            event_subscriber_buffer: std::env::var("EVENT_SUBSCRIBER_BUFFER")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.event_subscriber_buffer),
            eval_window: default.eval_window,
            broadcast_target_url: std::env::var("BROADCAST_TARGET_URL").ok(),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}
