//! Query log: one line per answered query, optionally filtered by a netlist.
//!
//! The file is opened in append mode so an external log rotator can move it
//! away; a rotate request (SIGHUP) then closes and reopens the configured
//! path. If opening fails the log is disabled until the next successful
//! rotate, and queries keep being answered.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::netlist::{self, NetMatcher};
use crate::protocol::QuerySummary;
use crate::SrvError;

/// Query log settings: where to write, which clients, how eagerly to flush.
#[derive(Debug, Clone)]
pub struct QueryLogConfig {
    pub path: PathBuf,
    /// Flush after every line instead of relying on buffering.
    pub flush_every_write: bool,
    /// Only clients this matcher allows are logged; `None` logs everyone.
    pub filter: Option<NetMatcher>,
}

impl QueryLogConfig {
    /// Parse a log path, where a leading `+` requests flush-every-write.
    #[must_use]
    pub fn from_spec(spec: &str, filter: Option<NetMatcher>) -> Self {
        let (flush_every_write, path) = match spec.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, spec),
        };
        Self {
            path: PathBuf::from(path),
            flush_every_write,
            filter,
        }
    }
}

/// Append-only query log.
#[derive(Debug, Default)]
pub struct QueryLog {
    config: Option<QueryLogConfig>,
    handle: Option<BufWriter<File>>,
}

impl QueryLog {
    /// A log that drops everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Open the configured log; on failure the log starts disabled.
    #[must_use]
    pub fn open(config: QueryLogConfig) -> Self {
        let mut log = Self {
            config: Some(config),
            handle: None,
        };
        log.rotate();
        log
    }

    /// Whether lines are currently being written.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    /// Close the current file and reopen the configured path.
    ///
    /// Returns whether the log is active afterwards.
    pub fn rotate(&mut self) -> bool {
        let Some(config) = &self.config else {
            return false;
        };

        if let Some(mut old) = self.handle.take() {
            if let Err(e) = old.flush() {
                warn!(
                    path = %config.path.display(),
                    error = %e,
                    "flushing query log before reopen"
                );
            }
        }

        match open_append(&config.path) {
            Ok(file) => {
                debug!(path = %config.path.display(), "query log (re)opened");
                self.handle = Some(BufWriter::new(file));
                true
            }
            Err(e) => {
                warn!(error = %e, "query logging disabled");
                false
            }
        }
    }

    /// Append a line for `client` unless filtered out or disabled.
    pub fn write(&mut self, client: IpAddr, summary: &QuerySummary, reply_len: usize) {
        let (Some(config), Some(handle)) = (&self.config, &mut self.handle) else {
            return;
        };
        if !netlist::allows(config.filter.as_ref(), client) {
            return;
        }

        let ts = chrono::Utc::now().timestamp();
        let result = writeln!(handle, "{ts} {client} {summary}/{reply_len}").and_then(|()| {
            if config.flush_every_write {
                handle.flush()
            } else {
                Ok(())
            }
        });
        if let Err(e) = result {
            warn!(path = %config.path.display(), error = %e, "query log write failed");
        }
    }

    /// Push buffered lines to the file.
    pub fn flush(&mut self) {
        if let Some(handle) = &mut self.handle {
            if let Err(e) = handle.flush() {
                warn!(error = %e, "query log flush failed");
            }
        }
    }
}

fn open_append(path: &Path) -> crate::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            SrvError::LogIo(format!("error (re)opening logfile `{}': {e}", path.display()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlist::NetRule;
    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::{DNSClass, RecordType};
    use std::net::Ipv4Addr;

    fn summary() -> QuerySummary {
        QuerySummary {
            qname: "2.0.0.127.bl.example.org.".into(),
            qtype: RecordType::A,
            qclass: DNSClass::IN,
            rcode: ResponseCode::NoError,
            answers: 1,
        }
    }

    fn client(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, last))
    }

    #[test]
    fn test_plus_prefix_means_flush() {
        let c = QueryLogConfig::from_spec("+/var/log/rbldns.log", None);
        assert!(c.flush_every_write);
        assert_eq!(c.path, PathBuf::from("/var/log/rbldns.log"));
        assert!(!QueryLogConfig::from_spec("q.log", None).flush_every_write);
    }

    #[test]
    fn test_write_with_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queries.log");
        let mut log = QueryLog::open(QueryLogConfig {
            path: path.clone(),
            flush_every_write: true,
            filter: None,
        });
        assert!(log.is_active());

        log.write(client(1), &summary(), 64);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.ends_with(" 192.0.2.1 2.0.0.127.bl.example.org. A IN: NOERROR/1/64\n"));
    }

    #[test]
    fn test_filter_denies_client() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queries.log");
        let deny = NetRule::new(Ipv4Addr::new(192, 0, 2, 1), 32, false);
        let filter = NetMatcher::from_rules(vec![deny]);
        let mut log = QueryLog::open(QueryLogConfig {
            path: path.clone(),
            flush_every_write: true,
            filter: Some(filter),
        });

        log.write(client(1), &summary(), 64);
        log.write(client(2), &summary(), 64);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains(" 192.0.2.2 "));
    }

    #[test]
    fn test_rotate_picks_up_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queries.log");
        let moved = dir.path().join("queries.log.1");
        let mut log = QueryLog::open(QueryLogConfig {
            path: path.clone(),
            flush_every_write: true,
            filter: None,
        });

        log.write(client(1), &summary(), 10);
        std::fs::rename(&path, &moved).unwrap();
        assert!(log.rotate());
        log.write(client(2), &summary(), 20);

        assert_eq!(std::fs::read_to_string(&moved).unwrap().lines().count(), 1);
        let fresh = std::fs::read_to_string(&path).unwrap();
        assert!(fresh.contains(" 192.0.2.2 "));
    }

    #[test]
    fn test_open_failure_disables_until_rotate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("queries.log");
        let mut log = QueryLog::open(QueryLogConfig {
            path: path.clone(),
            flush_every_write: false,
            filter: None,
        });
        assert!(!log.is_active());
        log.write(client(1), &summary(), 10);

        std::fs::create_dir(dir.path().join("missing")).unwrap();
        assert!(log.rotate());
        log.write(client(1), &summary(), 10);
        log.flush();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_disabled_log_ignores_everything() {
        let mut log = QueryLog::disabled();
        assert!(!log.rotate());
        log.write(client(1), &summary(), 10);
        assert!(!log.is_active());
    }
}
