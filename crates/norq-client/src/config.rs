// Client defaults, environment overrides, and the optional YAML override file.
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::error::{Error, Result};

pub(crate) const DEFAULT_LOOKUP_INTERVAL_SECS: u64 = 60;
pub(crate) const DEFAULT_MAX_LOOKUP_FAILURES_BEFORE_ERROR: u32 = 5;
pub(crate) const DEFAULT_MAX_IN_FLIGHT: usize = 200;
pub(crate) const DEFAULT_MAX_FLUSH_DELAY_MILLIS: u64 = 2000;
pub(crate) const DEFAULT_BACKOFF_BASE_MILLIS: u64 = 1000;
pub(crate) const DEFAULT_BACKOFF_CEILING_MILLIS: u64 = 120_000;
pub(crate) const DEFAULT_FAILURE_BACKOFF_MILLIS: u64 = 10_000;
pub(crate) const DEFAULT_CONNECT_TIMEOUT_MILLIS: u64 = 5_000;
pub(crate) const DEFAULT_LOOKUP_TIMEOUT_MILLIS: u64 = 30_000;

/// Hard safety cap for any single broker frame.
///
/// The frame reader allocates a buffer sized by the length prefix; the cap
/// is enforced before that allocation so a buggy or hostile peer cannot
/// advertise an enormous length. Override with `NORQ_MAX_FRAME_BYTES`.
pub(crate) const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Default TCP port of a broker node.
pub(crate) const DEFAULT_NSQD_PORT: u16 = 4150;
/// Default HTTP port of the discovery service.
pub(crate) const DEFAULT_LOOKUPD_PORT: u16 = 4161;

/// Requests queued on one publisher connection worker.
pub(crate) const PUBLISH_QUEUE_DEPTH: usize = 256;
/// Commands and connection events queued on one subscription control task.
pub(crate) const SUBSCRIPTION_QUEUE_DEPTH: usize = 1024;
/// How long a stopping subscription waits for brokers to acknowledge CLS.
pub(crate) const CLS_DRAIN_TIMEOUT_MILLIS: u64 = 250;
/// Poll cadence of `await_no_messages_in_flight`.
pub(crate) const AWAIT_IN_FLIGHT_POLL_MILLIS: u64 = 500;
/// Window within which repeated failure marks on one node collapse.
pub(crate) const MARK_FAILURE_WINDOW_MILLIS: u64 = 5_000;

/// Tunables shared by publishers and subscribers.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Seconds between discovery polls.
    pub lookup_interval_secs: u64,
    /// Consecutive per-URL lookup failures at which warn escalates to error.
    pub max_lookup_failures_before_error: u32,
    /// Initial max-in-flight for new subscriptions.
    pub default_max_in_flight: usize,
    /// Cap on the computed requeue delay.
    pub max_flush_delay_millis: u64,
    /// Broker-side attempt count at which a message is dead-lettered.
    /// `u16::MAX` means unbounded.
    pub max_attempts: u16,
    /// First delivery pause after a handler failure.
    pub backoff_base_millis: u64,
    /// Ceiling for the doubling delivery pause.
    pub backoff_ceiling_millis: u64,
    /// How long a publisher node stays skipped after a failure mark.
    pub failure_backoff_millis: u64,
    pub connect_timeout_millis: u64,
    /// Connect and read timeout for discovery HTTP calls.
    pub lookup_timeout_millis: u64,
    pub max_frame_bytes: usize,
    /// If true, batch publishes never fall back to per-message delivery.
    pub atomic: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            lookup_interval_secs: DEFAULT_LOOKUP_INTERVAL_SECS,
            max_lookup_failures_before_error: DEFAULT_MAX_LOOKUP_FAILURES_BEFORE_ERROR,
            default_max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_flush_delay_millis: DEFAULT_MAX_FLUSH_DELAY_MILLIS,
            max_attempts: u16::MAX,
            backoff_base_millis: DEFAULT_BACKOFF_BASE_MILLIS,
            backoff_ceiling_millis: DEFAULT_BACKOFF_CEILING_MILLIS,
            failure_backoff_millis: DEFAULT_FAILURE_BACKOFF_MILLIS,
            connect_timeout_millis: DEFAULT_CONNECT_TIMEOUT_MILLIS,
            lookup_timeout_millis: DEFAULT_LOOKUP_TIMEOUT_MILLIS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            atomic: false,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    lookup_interval_secs: Option<u64>,
    max_lookup_failures_before_error: Option<u32>,
    default_max_in_flight: Option<usize>,
    max_flush_delay_millis: Option<u64>,
    max_attempts: Option<u16>,
    backoff_base_millis: Option<u64>,
    backoff_ceiling_millis: Option<u64>,
    failure_backoff_millis: Option<u64>,
    connect_timeout_millis: Option<u64>,
    lookup_timeout_millis: Option<u64>,
    max_frame_bytes: Option<usize>,
    atomic: Option<bool>,
}

impl ClientConfig {
    /// Defaults layered with `NORQ_*` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_u64_env("NORQ_LOOKUP_INTERVAL_SECS") {
            config.lookup_interval_secs = value;
        }
        if let Some(value) = read_u64_env("NORQ_MAX_LOOKUP_FAILURES") {
            config.max_lookup_failures_before_error = value as u32;
        }
        if let Some(value) = read_usize_env("NORQ_DEFAULT_MAX_IN_FLIGHT") {
            config.default_max_in_flight = value;
        }
        if let Some(value) = read_u64_env("NORQ_MAX_FLUSH_DELAY_MILLIS") {
            config.max_flush_delay_millis = value;
        }
        if let Some(value) = read_u64_env("NORQ_MAX_ATTEMPTS") {
            config.max_attempts = value.min(u16::MAX as u64) as u16;
        }
        if let Some(value) = read_u64_env("NORQ_BACKOFF_BASE_MILLIS") {
            config.backoff_base_millis = value;
        }
        if let Some(value) = read_u64_env("NORQ_BACKOFF_CEILING_MILLIS") {
            config.backoff_ceiling_millis = value;
        }
        if let Some(value) = read_u64_env("NORQ_FAILURE_BACKOFF_MILLIS") {
            config.failure_backoff_millis = value;
        }
        if let Some(value) = read_u64_env("NORQ_CONNECT_TIMEOUT_MILLIS") {
            config.connect_timeout_millis = value;
        }
        if let Some(value) = read_u64_env("NORQ_LOOKUP_TIMEOUT_MILLIS") {
            config.lookup_timeout_millis = value;
        }
        if let Some(value) = read_usize_env("NORQ_MAX_FRAME_BYTES") {
            config.max_frame_bytes = value;
        }
        if let Some(value) = read_bool_env("NORQ_ATOMIC_PUBLISH") {
            config.atomic = value;
        }
        config
    }

    /// Environment layering plus an optional YAML override file, either the
    /// given path or `NORQ_CLIENT_CONFIG`.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("NORQ_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents = fs::read_to_string(path).map_err(Error::Transport)?;
            let override_cfg: ClientConfigOverride = serde_yaml::from_str(&contents)
                .map_err(|err| Error::Protocol(format!("parse client config yaml: {err}")))?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_millis)
    }

    pub(crate) fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_millis)
    }

    pub(crate) fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_millis)
    }

    pub(crate) fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_millis)
    }

    pub(crate) fn backoff_ceiling(&self) -> Duration {
        Duration::from_millis(self.backoff_ceiling_millis)
    }

    pub(crate) fn max_flush_delay(&self) -> Duration {
        Duration::from_millis(self.max_flush_delay_millis)
    }
}

impl ClientConfigOverride {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(value) = self.lookup_interval_secs {
            if value > 0 {
                config.lookup_interval_secs = value;
            }
        }
        if let Some(value) = self.max_lookup_failures_before_error {
            if value > 0 {
                config.max_lookup_failures_before_error = value;
            }
        }
        if let Some(value) = self.default_max_in_flight {
            config.default_max_in_flight = value;
        }
        if let Some(value) = self.max_flush_delay_millis {
            config.max_flush_delay_millis = value;
        }
        if let Some(value) = self.max_attempts {
            if value > 0 {
                config.max_attempts = value;
            }
        }
        if let Some(value) = self.backoff_base_millis {
            if value > 0 {
                config.backoff_base_millis = value;
            }
        }
        if let Some(value) = self.backoff_ceiling_millis {
            if value > 0 {
                config.backoff_ceiling_millis = value;
            }
        }
        if let Some(value) = self.failure_backoff_millis {
            config.failure_backoff_millis = value;
        }
        if let Some(value) = self.connect_timeout_millis {
            if value > 0 {
                config.connect_timeout_millis = value;
            }
        }
        if let Some(value) = self.lookup_timeout_millis {
            if value > 0 {
                config.lookup_timeout_millis = value;
            }
        }
        if let Some(value) = self.max_frame_bytes {
            if value > 0 {
                config.max_frame_bytes = value;
            }
        }
        if let Some(value) = self.atomic {
            config.atomic = value;
        }
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
}

fn read_bool_env(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
}
