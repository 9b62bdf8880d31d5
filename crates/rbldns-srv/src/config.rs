//! Server configuration for rbldnsd.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::netlist::CidrPolicy;
use crate::protocol::DEFAULT_TTL;

/// Configuration for one rbldnsd instance.
///
/// Everything can come from a TOML file; command-line flags override it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UDP listen address (default: 0.0.0.0:53).
    pub listen: SocketAddr,

    /// TTL of answer records, in seconds.
    pub ttl: u32,

    /// How often to check zone files for changes (seconds, 0 disables).
    pub reload_interval_secs: u64,

    /// Mask host bits of CIDRs like `127.0.0.1/8` instead of rejecting them.
    pub accept_in_cidr: bool,

    /// Start answering before zones are loaded.
    pub quickstart: bool,

    /// Log reload timing and memory usage.
    pub telemetry: bool,

    /// Netlist of clients allowed to query; absent means everyone.
    pub access: Option<String>,

    /// Zone declarations, `name:type:file,file...`.
    pub zones: Vec<String>,

    /// Query logging.
    pub query_log: QueryLogSection,
}

/// `[query_log]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryLogSection {
    /// Log file; a leading `+` flushes after every line.
    pub path: Option<String>,

    /// Netlist of clients whose queries are logged; absent means everyone.
    pub filter: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            ttl: DEFAULT_TTL,
            reload_interval_secs: default_reload_interval(),
            accept_in_cidr: false,
            quickstart: false,
            telemetry: false,
            access: None,
            zones: Vec::new(),
            query_log: QueryLogSection::default(),
        }
    }
}

impl ServerConfig {
    /// Load config from a TOML file; keys it leaves out keep their defaults.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::SrvError::Config(format!("{}: {e}", path.display()))
        })?;
        Ok(toml::from_str(&content)?)
    }

    #[must_use]
    pub const fn cidr_policy(&self) -> CidrPolicy {
        CidrPolicy::from_accept_in_cidr(self.accept_in_cidr)
    }

    #[must_use]
    pub const fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }
}

// Default value functions for serde.
const fn default_reload_interval() -> u64 {
    60
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 53))
}
