use std::env;
use std::time::Duration;
use tracing::warn;

/// What to do when candidate gathering does not finish inside the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringTimeoutPolicy {
    /// Publish whatever candidates have gathered so far (the default; mobile
    /// networks are slow and a partial description often still connects).
    PublishPartial,
    /// Fail the session instead of publishing a partial description.
    FailSession,
}

/// Tether runtime configuration. Every field has a sensible default and an
/// environment override (`TETHER_*`).
#[derive(Debug, Clone)]
pub struct Config {
    /// How long to wait for the transport to report gathering complete
    /// before applying `gathering_timeout_policy`.
    pub gathering_timeout: Duration,
    pub gathering_timeout_policy: GatheringTimeoutPolicy,
    /// How long a renegotiation cycle may wait for the peer's response.
    pub renegotiation_timeout: Duration,
    /// Interval between outbound telemetry batch flushes.
    pub batch_flush_interval: Duration,
    /// Batch is flushed immediately once it holds this many envelopes.
    pub batch_capacity: usize,
    /// Per-origin telemetry ceiling within one rate-limit window.
    pub rate_limit_ceiling: u32,
    pub rate_limit_window: Duration,
    /// How long a transport failure must persist before the watchdog asks
    /// the coordinator to restart.
    pub watchdog_debounce: Duration,
    /// Partial chunked messages older than this are discarded.
    pub reassembly_ttl: Duration,
    /// ICE server URLs handed to the transport.
    pub ice_servers: Vec<String>,
    /// Label of the control data channel.
    pub channel_label: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gathering_timeout: Duration::from_secs(20),
            gathering_timeout_policy: GatheringTimeoutPolicy::PublishPartial,
            renegotiation_timeout: Duration::from_secs(20),
            batch_flush_interval: Duration::from_millis(200),
            batch_capacity: 32,
            rate_limit_ceiling: 100,
            rate_limit_window: Duration::from_secs(60),
            watchdog_debounce: Duration::from_secs(10),
            reassembly_ttl: Duration::from_secs(10),
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            channel_label: "tether-ctl".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ice_servers = if env::var("TETHER_LOCALHOST_ONLY").is_ok() {
            // No STUN/TURN when both peers are on the same host.
            Vec::new()
        } else {
            defaults.ice_servers.clone()
        };
        Self {
            gathering_timeout: parse_millis(
                "TETHER_GATHERING_TIMEOUT_MS",
                defaults.gathering_timeout,
            ),
            gathering_timeout_policy: parse_timeout_policy(defaults.gathering_timeout_policy),
            renegotiation_timeout: parse_millis(
                "TETHER_RENEGOTIATION_TIMEOUT_MS",
                defaults.renegotiation_timeout,
            ),
            batch_flush_interval: parse_millis(
                "TETHER_BATCH_FLUSH_MS",
                defaults.batch_flush_interval,
            ),
            batch_capacity: parse_usize("TETHER_BATCH_CAPACITY", defaults.batch_capacity, 1),
            rate_limit_ceiling: parse_usize(
                "TETHER_RATE_CEILING",
                defaults.rate_limit_ceiling as usize,
                1,
            ) as u32,
            rate_limit_window: parse_millis("TETHER_RATE_WINDOW_MS", defaults.rate_limit_window),
            watchdog_debounce: parse_millis(
                "TETHER_WATCHDOG_DEBOUNCE_MS",
                defaults.watchdog_debounce,
            ),
            reassembly_ttl: parse_millis("TETHER_REASSEMBLY_TTL_MS", defaults.reassembly_ttl),
            ice_servers,
            channel_label: env::var("TETHER_CHANNEL_LABEL")
                .unwrap_or_else(|_| defaults.channel_label.clone()),
        }
    }
}

fn parse_millis(var: &str, default: Duration) -> Duration {
    match env::var(var) {
        Ok(value) => match value.trim().parse::<u64>() {
            Ok(ms) if ms > 0 => Duration::from_millis(ms),
            Ok(_) => {
                warn!(target: "tether::config", var, "zero duration ignored; using default");
                default
            }
            Err(err) => {
                warn!(target: "tether::config", var, error = %err, "failed to parse duration; using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_usize(var: &str, default: usize, min: usize) -> usize {
    match env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(target: "tether::config", var, parsed, min, "value below minimum; using default");
                default
            }
            Err(err) => {
                warn!(target: "tether::config", var, error = %err, "failed to parse; using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_timeout_policy(default: GatheringTimeoutPolicy) -> GatheringTimeoutPolicy {
    match env::var("TETHER_GATHERING_ON_TIMEOUT").as_deref() {
        Ok("fail") => GatheringTimeoutPolicy::FailSession,
        Ok("publish") => GatheringTimeoutPolicy::PublishPartial,
        Ok(other) => {
            warn!(target: "tether::config", value = other, "unknown gathering timeout policy; using default");
            default
        }
        Err(_) => default,
    }
}
