//! Error types for the rbldns server core.

use thiserror::Error;

/// Errors that can occur in rbldns-srv operations.
#[derive(Error, Debug)]
pub enum SrvError {
    /// Netlist, CIDR, zone spec or config file is invalid.
    #[error("config error: {0}")]
    Config(String),

    /// A zone source could not be read or parsed.
    #[error("zone load error: {0}")]
    Reload(String),

    /// Socket bind, receive or send failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or unanswerable DNS packet.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Query log could not be opened or written.
    #[error("query log error: {0}")]
    LogIo(String),

    /// Memory could not be reserved while loading a zone.
    #[error("out of memory loading zone {0}")]
    ResourceExhaustion(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML config parse error.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl SrvError {
    /// Whether a runtime reload hitting this error should degrade the zone
    /// to empty instead of keeping the previous snapshot.
    #[must_use]
    pub const fn is_exhaustion(&self) -> bool {
        matches!(self, Self::ResourceExhaustion(_))
    }
}
