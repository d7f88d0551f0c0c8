//! Configuration types.
//!
//! All sections implement [`Default`] with the documented fallback
//! values, so a host can run with no config file at all.

use serde::{Deserialize, Serialize};

/// Unified orchestrator configuration after merging all layers.
///
/// # Example
///
/// ```
/// use apiary_runtime::config::ApiaryConfig;
///
/// let config = ApiaryConfig::default();
/// assert_eq!(config.scheduling.ready_queue_capacity, 1000);
/// assert_eq!(config.limits.burst_limit, 3);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiaryConfig {
    /// Scheduler and queue tuning.
    pub scheduling: SchedulingConfig,
    /// Domain limiter tuning.
    pub limits: LimitsConfig,
    /// Intervention session tuning.
    pub intervention: InterventionConfig,
    /// Server-level settings enforced by the transport.
    pub server: ServerConfig,
}

impl ApiaryConfig {
    /// Creates a config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes to TOML.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Deserializes from TOML.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Merges another config into this one.
    ///
    /// Values from `other` override values in `self` only where they
    /// differ from the defaults, enabling layered configuration.
    pub fn merge(&mut self, other: &Self) {
        self.scheduling.merge(&other.scheduling);
        self.limits.merge(&other.limits);
        self.intervention.merge(&other.intervention);
        self.server.merge(&other.server);
    }
}

macro_rules! merge_fields {
    ($self:ident, $other:ident, $default:ident, [$($field:ident),+ $(,)?]) => {
        $(
            if $other.$field != $default.$field {
                $self.$field = $other.$field.clone();
            }
        )+
    };
}

/// Scheduler and queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Capacity of the global ready queue.
    pub ready_queue_capacity: usize,
    /// Capacity of each drone's dispatch queue.
    pub per_drone_queue_capacity: usize,
    /// Pacing-token permits per drone (in-flight command cap).
    pub max_in_flight_per_drone: usize,
    /// Seconds a drone has to acknowledge a published command.
    pub ack_timeout_sec: u64,
    /// Expected heartbeat interval from a healthy drone.
    pub heartbeat_expect_sec: u64,
    /// Grace beyond the expected heartbeat before a drone is considered
    /// disconnected.
    pub disconnect_grace_sec: u64,
    /// Pacing of the housekeeping loops (metrics reporter, worker
    /// respawn backoff).
    pub dispatch_loop_delay_ms: u64,
    /// Retries granted to a task whose persona cannot be loaded.
    pub persona_missing_max_retries: u32,
    /// Base delay of the persona-missing backoff.
    pub persona_missing_base_delay_sec: u64,
    /// Ceiling of the persona-missing backoff.
    pub persona_missing_max_backoff_sec: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            ready_queue_capacity: 1000,
            per_drone_queue_capacity: 10,
            max_in_flight_per_drone: 1,
            ack_timeout_sec: 20,
            heartbeat_expect_sec: 30,
            disconnect_grace_sec: 60,
            dispatch_loop_delay_ms: 100,
            persona_missing_max_retries: 5,
            persona_missing_base_delay_sec: 5,
            persona_missing_max_backoff_sec: 120,
        }
    }
}

impl SchedulingConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();
        merge_fields!(
            self,
            other,
            default,
            [
                ready_queue_capacity,
                per_drone_queue_capacity,
                max_in_flight_per_drone,
                ack_timeout_sec,
                heartbeat_expect_sec,
                disconnect_grace_sec,
                dispatch_loop_delay_ms,
                persona_missing_max_retries,
                persona_missing_base_delay_sec,
                persona_missing_max_backoff_sec,
            ]
        );
    }
}

/// Domain limiter tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Global cap on concurrent sessions per registrable domain.
    pub max_concurrent_sessions: u32,
    /// Concurrent sessions one drone may hold on one domain.
    pub concurrency_per_drone: u32,
    /// Requests per second one drone may open against one domain.
    pub qps_per_drone: f64,
    /// Acquires within the cooldown window that trigger a cooldown.
    /// Zero disables burst tracking.
    pub burst_limit: u32,
    /// Length of the burst window and of the cooldown it triggers.
    pub cooldown_seconds: u64,
    /// Idle time after which per-domain state is swept.
    pub domain_state_ttl_seconds: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 25,
            concurrency_per_drone: 1,
            qps_per_drone: 2.0,
            burst_limit: 3,
            cooldown_seconds: 30,
            domain_state_ttl_seconds: 600,
        }
    }
}

impl LimitsConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();
        merge_fields!(
            self,
            other,
            default,
            [
                max_concurrent_sessions,
                concurrency_per_drone,
                burst_limit,
                cooldown_seconds,
                domain_state_ttl_seconds,
            ]
        );
        if (other.qps_per_drone - default.qps_per_drone).abs() > f64::EPSILON {
            self.qps_per_drone = other.qps_per_drone;
        }
    }
}

/// Intervention session tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InterventionConfig {
    /// Capture a screenshot when a session opens.
    pub attach_screenshot: bool,
    /// Seconds an intervention window may stay open in total.
    pub window_ttl_sec: u64,
    /// Seconds allowed between operator steps.
    pub step_ttl_sec: u64,
}

impl Default for InterventionConfig {
    fn default() -> Self {
        Self {
            attach_screenshot: true,
            window_ttl_sec: 120,
            step_ttl_sec: 30,
        }
    }
}

impl InterventionConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();
        merge_fields!(
            self,
            other,
            default,
            [attach_screenshot, window_ttl_sec, step_ttl_sec]
        );
    }
}

/// Server-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Key drones must present in the `X-API-Key` header. The transport
    /// refuses connections that do not match; empty means unset.
    pub api_key: String,
}

impl ServerConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();
        merge_fields!(self, other, default, [api_key]);
    }
}
