//! rbldns-srv: core of a DNSBL (realtime blocklist) daemon.
//!
//! Answers `d.c.b.a.<zone>` queries over UDP from an in-memory dataset that
//! is reloaded from zone files while the server keeps answering.
//!
//! # Architecture
//!
//! Everything runs on one logical flow, the [`server::RequestLoop`]:
//! - `netlist` - ordered first-match network rules for access and log filters
//! - `signals` - OS signals and the reload timer folded into a pending-event bitset
//! - `reload` - zone reload orchestration and atomic snapshot publication
//! - `stats` - per-outcome datagram and byte counters
//! - `querylog` - filtered, rotatable query log
//!
//! The DNS wire layer (`protocol`) and the dataset (`zone`) sit behind
//! traits so the loop only sees bytes in, bytes out, and snapshots.

pub mod config;
pub mod error;
pub mod netlist;
pub mod protocol;
pub mod querylog;
pub mod reload;
pub mod server;
pub mod signals;
pub mod stats;
pub mod telemetry;
pub mod zone;

// Re-exports for convenience.
pub use config::ServerConfig;
pub use error::SrvError;

/// Result type for rbldns-srv operations.
pub type Result<T> = std::result::Result<T, SrvError>;
