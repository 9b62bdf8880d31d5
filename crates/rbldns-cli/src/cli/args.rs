//! Command-line argument definitions using clap.

use clap::Parser;
use rbldns_srv::zone::DATASET_TYPES;
use rbldns_srv::ServerConfig;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// DNS port used when `-b` gives only an address.
const DNS_PORT: u16 = 53;

/// DNSBL daemon
///
/// Answers `d.c.b.a.<zone>` queries from ip4set zone files, reloading them
/// when they change. Zones are given as `name:type:file,file...`; only the
/// `ip4set` type is available.
///
/// Signals: HUP reloads zones and reopens the query log, USR1 logs
/// statistics, USR2 logs and resets them, TERM/INT exit.
#[derive(Parser, Debug)]
#[command(name = "rbldnsd")]
#[command(author, version, about, long_about = None)]
#[command(after_help = dataset_help())]
pub struct Cli {
    /// Address to listen on, `addr` or `addr:port`
    #[arg(short, long, value_name = "ADDR", value_parser = parse_bind)]
    pub bind: Option<SocketAddr>,

    /// TTL of answer records in seconds
    #[arg(short, long, value_name = "SECS")]
    pub ttl: Option<u32>,

    /// Check zone files for changes every SECS seconds (0 disables)
    #[arg(short = 'c', long = "check", value_name = "SECS")]
    pub check_interval: Option<u64>,

    /// Accept CIDRs with host bits set (`127.0.0.1/8`) by masking them
    #[arg(short = 'e', long)]
    pub accept_in_cidr: bool,

    /// Start answering before zones are loaded
    #[arg(short, long)]
    pub quickstart: bool,

    /// Log reload timing and memory usage
    #[arg(short = 's', long = "stats")]
    pub telemetry: bool,

    /// Query log file; prefix with `+` to flush after every line
    #[arg(short = 'l', long = "logfile", value_name = "FILE")]
    pub log_file: Option<String>,

    /// Only log queries from clients this netlist allows
    #[arg(short = 'L', long, value_name = "NETLIST")]
    pub log_filter: Option<String>,

    /// Only answer clients this netlist allows, e.g. `127.0.0.1,!127/8`
    #[arg(short, long, value_name = "NETLIST")]
    pub access: Option<String>,

    /// TOML config file; flags override its values
    #[arg(long, value_name = "FILE", env = "RBLDNSD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Zone declarations, `name:type:file,file...`
    #[arg(value_name = "ZONESPEC")]
    pub zones: Vec<String>,
}

impl Cli {
    /// Overlay the flags that were given on top of `config`.
    ///
    /// Zones from the command line are added after those from the file.
    pub fn apply(self, config: &mut ServerConfig) {
        if let Some(bind) = self.bind {
            config.listen = bind;
        }
        if let Some(ttl) = self.ttl {
            config.ttl = ttl;
        }
        if let Some(secs) = self.check_interval {
            config.reload_interval_secs = secs;
        }
        config.accept_in_cidr |= self.accept_in_cidr;
        config.quickstart |= self.quickstart;
        config.telemetry |= self.telemetry;
        if self.access.is_some() {
            config.access = self.access;
        }
        if self.log_file.is_some() {
            config.query_log.path = self.log_file;
        }
        if self.log_filter.is_some() {
            config.query_log.filter = self.log_filter;
        }
        config.zones.extend(self.zones);
    }

    /// Default tracing directive for the `-v` count.
    #[must_use]
    pub const fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Dataset types accepted in ZONESPEC, for the end of `--help`.
fn dataset_help() -> String {
    let mut help = String::from("Dataset types:\n");
    for (name, description) in DATASET_TYPES {
        help.push_str(&format!("  {name:<10}{description}\n"));
    }
    help.push_str("Other rbldnsd dataset types (dnset, ip4trie, generic, ...) are not supported.");
    help
}

/// Parse `-b`: a socket address, or a bare IP on the DNS port.
fn parse_bind(text: &str) -> Result<SocketAddr, String> {
    if let Ok(addr) = text.parse::<SocketAddr>() {
        return Ok(addr);
    }
    text.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .map_err(|_| format!("invalid listen address `{text}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bind() {
        assert_eq!(parse_bind("127.0.0.1").unwrap().port(), 53);
        assert_eq!(parse_bind("127.0.0.1:5353").unwrap().port(), 5353);
        assert_eq!(parse_bind("[::1]:5300").unwrap().port(), 5300);
        assert!(parse_bind("localhost").is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "rbldnsd",
            "-b",
            "127.0.0.1:5353",
            "-e",
            "-c",
            "0",
            "-a",
            "127.0.0.1,!127/8",
            "-l",
            "+/tmp/q.log",
            "bl.example.org:ip4set:/tmp/bl",
        ])
        .unwrap();

        let mut config = ServerConfig {
            ttl: 900,
            zones: vec!["dul.example.org:ip4set:/tmp/dul".into()],
            ..ServerConfig::default()
        };
        cli.apply(&mut config);

        assert_eq!(config.listen.port(), 5353);
        assert_eq!(config.ttl, 900);
        assert_eq!(config.reload_interval_secs, 0);
        assert!(config.accept_in_cidr);
        assert!(!config.quickstart);
        assert_eq!(config.access.as_deref(), Some("127.0.0.1,!127/8"));
        assert_eq!(config.query_log.path.as_deref(), Some("+/tmp/q.log"));
        assert_eq!(config.zones.len(), 2);
    }

    #[test]
    fn test_verbosity_levels() {
        let quiet = Cli::try_parse_from(["rbldnsd"]).unwrap();
        assert_eq!(quiet.log_level(), "info");
        let loud = Cli::try_parse_from(["rbldnsd", "-vv"]).unwrap();
        assert_eq!(loud.log_level(), "trace");
    }

    #[test]
    fn test_rejects_bad_ttl() {
        assert!(Cli::try_parse_from(["rbldnsd", "-t", "forever"]).is_err());
    }

    #[test]
    fn test_help_names_dataset_types() {
        let help = dataset_help();
        assert!(help.contains("ip4set"));
        assert!(help.contains("dnset"));
        assert!(help.contains("not supported"));
    }
}
