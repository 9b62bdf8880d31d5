//! `ip4set` dataset: IPv4 addresses and CIDR ranges with A/TXT values.
//!
//! File format, one entry per line:
//!
//! ```text
//! # comment
//! :127.0.0.2:Listed, see https://example.org/lookup?$
//! 192.0.2.1
//! 198.51.100.0/24 :3:Spam source
//! 203.0.113.0/24  Free-text reason
//! !198.51.100.7
//! ```
//!
//! A `:A:TXT` line sets the default value for following entries. `A` is a
//! full address or a single number `N` meaning `127.0.0.N`. A leading `!`
//! excludes an address or range from wider listed ranges. The most specific
//! matching entry wins. Invalid lines are skipped with a warning.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::warn;

use crate::netlist::{self, CidrPolicy};
use crate::SrvError;

/// Default A record returned for listed entries.
pub const DEFAULT_LISTED_A: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);

/// Value returned for a listed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListValue {
    pub a: Ipv4Addr,
    /// TXT template; `$` is replaced by the queried address.
    pub txt: Option<String>,
}

impl Default for ListValue {
    fn default() -> Self {
        Self {
            a: DEFAULT_LISTED_A,
            txt: None,
        }
    }
}

impl ListValue {
    /// Parse `:A:TXT`, `:A` or `::TXT`; missing parts come from `base`.
    fn parse_colon(spec: &str, base: &Self) -> Option<Self> {
        let rest = spec.strip_prefix(':')?;
        let (a_part, txt) = match rest.split_once(':') {
            Some((a, t)) => (a.trim(), Some(t.trim())),
            None => (rest.trim(), None),
        };
        let a = if a_part.is_empty() {
            base.a
        } else if let Ok(addr) = a_part.parse::<Ipv4Addr>() {
            addr
        } else {
            Ipv4Addr::new(127, 0, 0, a_part.parse::<u8>().ok()?)
        };
        let txt = match txt {
            Some("") => None,
            Some(t) => Some(t.to_string()),
            None => base.txt.clone(),
        };
        Some(Self { a, txt })
    }

    /// TXT text for a query about `addr`.
    #[must_use]
    pub fn render_txt(&self, addr: Ipv4Addr) -> Option<String> {
        self.txt.as_ref().map(|t| t.replace('$', &addr.to_string()))
    }
}

/// Entries indexed by prefix length; `None` marks an exclusion.
#[derive(Debug, Clone)]
pub struct Ip4Set {
    by_prefix: Vec<HashMap<u32, Option<ListValue>>>,
    entries: usize,
}

impl Default for Ip4Set {
    fn default() -> Self {
        Self {
            by_prefix: vec![HashMap::new(); 33],
            entries: 0,
        }
    }
}

impl Ip4Set {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries (listings and exclusions).
    #[must_use]
    pub const fn len(&self) -> usize {
        self.entries
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Most specific entry containing `addr`, if it is a listing.
    #[must_use]
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<&ListValue> {
        let raw = u32::from(addr);
        (1..=32u8).rev().find_map(|len| {
            self.by_prefix[usize::from(len)]
                .get(&(raw & netlist::prefix_mask(len)))
                .map(Option::as_ref)
        })?
    }

    fn insert(
        &mut self,
        network: Ipv4Addr,
        prefix_len: u8,
        value: Option<ListValue>,
        zone: &str,
    ) -> crate::Result<()> {
        let map = &mut self.by_prefix[usize::from(prefix_len)];
        map.try_reserve(1)
            .map_err(|_| SrvError::ResourceExhaustion(zone.to_string()))?;
        if map.insert(u32::from(network), value).is_none() {
            self.entries += 1;
        }
        Ok(())
    }

    /// Add every entry of `text`, returning how many lines were skipped.
    pub fn load_str(&mut self, text: &str, policy: CidrPolicy, zone: &str) -> crate::Result<usize> {
        let mut default = ListValue::default();
        let mut skipped = 0;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with(':') {
                match ListValue::parse_colon(line, &default) {
                    Some(v) => default = v,
                    None => {
                        warn!(zone, line = lineno + 1, "invalid default value line");
                        skipped += 1;
                    }
                }
                continue;
            }

            let (range, rest) = match line.split_once(char::is_whitespace) {
                Some((r, rest)) => (r, rest.trim()),
                None => (line, ""),
            };
            let (excluded, range) = match range.strip_prefix('!') {
                Some(r) => (true, r),
                None => (false, range),
            };

            let Ok((network, prefix_len)) = netlist::parse_cidr(range, policy) else {
                warn!(zone, line = lineno + 1, entry = range, "invalid ip4set entry");
                skipped += 1;
                continue;
            };

            let value = if excluded {
                None
            } else if rest.is_empty() {
                Some(default.clone())
            } else if rest.starts_with(':') {
                if let Some(v) = ListValue::parse_colon(rest, &default) {
                    Some(v)
                } else {
                    warn!(zone, line = lineno + 1, "invalid entry value");
                    skipped += 1;
                    continue;
                }
            } else {
                Some(ListValue {
                    a: default.a,
                    txt: Some(rest.to_string()),
                })
            };

            self.insert(network, prefix_len, value, zone)?;
        }

        Ok(skipped)
    }

    /// Read and add a zone file. Bytes that are not UTF-8 (legacy comments
    /// and TXT values) are replaced rather than rejecting the file.
    pub fn load_file(
        &mut self,
        path: &Path,
        policy: CidrPolicy,
        zone: &str,
    ) -> crate::Result<usize> {
        let bytes = std::fs::read(path)
            .map_err(|e| SrvError::Reload(format!("{}: {e}", path.display())))?;
        self.load_str(&String::from_utf8_lossy(&bytes), policy, zone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(text: &str) -> Ip4Set {
        let mut set = Ip4Set::new();
        set.load_str(text, CidrPolicy::Strict, "bl.test.").unwrap();
        set
    }

    #[test]
    fn test_plain_entries_use_default_value() {
        let set = load("192.0.2.1\n10.0.0.0/8\n");
        assert_eq!(set.len(), 2);
        assert_eq!(set.lookup(Ipv4Addr::new(192, 0, 2, 1)), Some(&ListValue::default()));
        assert!(set.lookup(Ipv4Addr::new(10, 200, 1, 1)).is_some());
        assert!(set.lookup(Ipv4Addr::new(192, 0, 2, 2)).is_none());
    }

    #[test]
    fn test_default_line_and_per_entry_values() {
        let set = load(
            ":127.0.0.4:Listed $\n192.0.2.1\n192.0.2.2 :9:custom\n192.0.2.3 free text\n",
        );
        let v = set.lookup(Ipv4Addr::new(192, 0, 2, 1)).unwrap();
        assert_eq!(v.a, Ipv4Addr::new(127, 0, 0, 4));
        assert_eq!(
            v.render_txt(Ipv4Addr::new(192, 0, 2, 1)).as_deref(),
            Some("Listed 192.0.2.1")
        );

        let v = set.lookup(Ipv4Addr::new(192, 0, 2, 2)).unwrap();
        assert_eq!(v.a, Ipv4Addr::new(127, 0, 0, 9));
        assert_eq!(v.txt.as_deref(), Some("custom"));

        let v = set.lookup(Ipv4Addr::new(192, 0, 2, 3)).unwrap();
        assert_eq!(v.a, Ipv4Addr::new(127, 0, 0, 4));
        assert_eq!(v.txt.as_deref(), Some("free text"));
    }

    #[test]
    fn test_most_specific_entry_wins() {
        let set = load("10.0.0.0/8 :2:wide\n10.1.0.0/16 :3:narrow\n!10.1.2.3\n");
        let txt = |ip| set.lookup(ip).and_then(|v| v.txt.as_deref());
        assert_eq!(txt(Ipv4Addr::new(10, 9, 0, 1)), Some("wide"));
        assert_eq!(txt(Ipv4Addr::new(10, 1, 9, 9)), Some("narrow"));
        assert!(set.lookup(Ipv4Addr::new(10, 1, 2, 3)).is_none());
    }

    #[test]
    fn test_invalid_lines_are_skipped() {
        let mut set = Ip4Set::new();
        let text = "# header\n\nnot-an-ip\n192.0.2.0/33\n192.0.2.1\n:x:bad\n";
        let skipped = set.load_str(text, CidrPolicy::Strict, "z").unwrap();
        assert_eq!(skipped, 3);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_host_bits_follow_policy() {
        let mut strict = Ip4Set::new();
        assert_eq!(strict.load_str("10.1.2.3/8\n", CidrPolicy::Strict, "z").unwrap(), 1);
        assert!(strict.is_empty());

        let mut lax = Ip4Set::new();
        lax.load_str("10.1.2.3/8\n", CidrPolicy::MaskHostBits, "z").unwrap();
        assert!(lax.lookup(Ipv4Addr::new(10, 7, 7, 7)).is_some());
    }

    #[test]
    fn test_missing_file_is_reload_error() {
        let mut set = Ip4Set::new();
        let err = set
            .load_file(Path::new("/nonexistent/rbldns/zone.txt"), CidrPolicy::Strict, "z")
            .unwrap_err();
        assert!(matches!(err, SrvError::Reload(_)));
    }

    #[test]
    fn test_latin1_file_still_loads() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        // ISO-8859-1 bytes in a comment and in a TXT value.
        f.write_all(b"# Liste gepflegt von J\xfcrgen\n192.0.2.1\n192.0.2.2 caf\xe9\n")
            .unwrap();

        let mut set = Ip4Set::new();
        let skipped = set.load_file(f.path(), CidrPolicy::Strict, "z").unwrap();
        assert_eq!(skipped, 0);
        assert_eq!(set.len(), 2);
        let txt = set.lookup(Ipv4Addr::new(192, 0, 2, 2)).unwrap().txt.clone().unwrap();
        assert_eq!(txt, "caf\u{fffd}");
    }
}
