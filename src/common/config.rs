//! Configuration for the fleet coordinator

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Coordinator configuration.
///
/// All durations are stored as milliseconds so the struct round-trips
/// cleanly through TOML and environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bind address for the HTTP RPC ingress and admin API.
    pub bind_addr: SocketAddr,

    /// Peer coordinator for the read-only compute fleet, if one is running.
    #[serde(default)]
    pub peer_addr: Option<SocketAddr>,

    /// Persistence service address, if one is running.
    #[serde(default)]
    pub db_addr: Option<SocketAddr>,

    /// Client-facing gateway address, used to trigger fleet shutdown.
    #[serde(default)]
    pub gateway_addr: Option<SocketAddr>,

    /// Load above which a host is considered overloaded.
    #[serde(default = "default_overload_level")]
    pub overload_level: f32,

    /// How long the fleet must stay over `overload_level` before entity
    /// creation is refused.
    #[serde(default = "default_overload_tolerance")]
    pub overload_tolerance_ms: u64,

    /// Creations admitted after overload begins before refusing anyway,
    /// even inside the tolerance window.
    #[serde(default = "default_overload_admit_budget")]
    pub overload_admit_budget: u32,

    /// Number of hosts per create-anywhere destination host.
    #[serde(default = "default_create_ratio")]
    pub create_ratio: f32,

    /// Ticks between create-anywhere destination recomputes.
    #[serde(default = "default_create_info_period")]
    pub create_info_period_ticks: u32,

    /// Period of the coordinator tick (liveness, placement, best-host).
    #[serde(default = "default_tick")]
    pub tick_ms: u64,

    /// Silence after which a host is declared dead.
    #[serde(default = "default_host_timeout")]
    pub host_timeout_ms: u64,

    /// When every host has gone quiet, assume the coordinator itself is
    /// unhealthy and defer death handling instead of killing the fleet.
    #[serde(default = "default_true")]
    pub dead_host_safeguard: bool,

    /// Ask the discovery service to hard-kill a dead host's process so a
    /// standby can take over its port.
    #[serde(default)]
    pub hard_kill_on_death: bool,

    /// Trigger a controlled fleet shutdown on any host death.
    #[serde(default)]
    pub shutdown_on_death: bool,

    /// Trigger a controlled fleet shutdown when a host dies with no usable
    /// backup.
    #[serde(default = "default_true")]
    pub shutdown_on_bad_state: bool,

    /// Outbound request timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Logging level used when RUST_LOG is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_overload_level() -> f32 {
    0.8
}
fn default_overload_tolerance() -> u64 {
    5_000
}
fn default_overload_admit_budget() -> u32 {
    10
}
fn default_create_ratio() -> f32 {
    4.0
}
fn default_create_info_period() -> u32 {
    5
}
fn default_tick() -> u64 {
    1_000
}
fn default_host_timeout() -> u64 {
    5_000
}
fn default_request_timeout() -> u64 {
    5_000
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7000".parse().expect("static addr"),
            peer_addr: None,
            db_addr: None,
            gateway_addr: None,
            overload_level: default_overload_level(),
            overload_tolerance_ms: default_overload_tolerance(),
            overload_admit_budget: default_overload_admit_budget(),
            create_ratio: default_create_ratio(),
            create_info_period_ticks: default_create_info_period(),
            tick_ms: default_tick(),
            host_timeout_ms: default_host_timeout(),
            dead_host_safeguard: default_true(),
            hard_kill_on_death: false,
            shutdown_on_death: false,
            shutdown_on_bad_state: default_true(),
            request_timeout_ms: default_request_timeout(),
            log_level: default_log_level(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from a TOML file (if present) merged with
    /// `FLEETMGR_*` environment variables. CLI overrides are applied by the
    /// binary afterwards.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        } else {
            builder = builder.add_source(config::File::with_name("fleetmgr").required(false));
        }

        builder = builder.add_source(config::Environment::with_prefix("FLEETMGR"));

        let cfg = builder
            .build()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;

        cfg.try_deserialize()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))
    }

    pub fn overload_tolerance(&self) -> Duration {
        Duration::from_millis(self.overload_tolerance_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn host_timeout(&self) -> Duration {
        Duration::from_millis(self.host_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
