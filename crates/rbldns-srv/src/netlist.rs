//! Netlists: ordered network-range rules with allow/deny verdicts.
//!
//! A netlist is written by an operator as a short list read top to bottom,
//! e.g. `127.0.0.1,!127/8`. Each token may be negated with `!`, and a
//! catch-all `0/0` rule with the opposite verdict of the last token is
//! appended implicitly. Lookup is a linear first-match scan: a later, more
//! specific rule never overrides an earlier, broader one.
//!
//! Used for the query-access filter (`-a`) and the query-log filter (`-L`).

use async_trait::async_trait;
use hickory_resolver::TokioResolver;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use tokio::sync::OnceCell;

use crate::SrvError;

/// Token separators accepted in a netlist.
const SEPARATORS: &[char] = &[',', ';', ' '];

/// What to do with a CIDR whose address has bits set beyond its prefix
/// (e.g. `127.0.0.1/8`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CidrPolicy {
    /// Reject the range.
    #[default]
    Strict,
    /// Clear the host bits and accept the range (`-e`).
    MaskHostBits,
}

impl CidrPolicy {
    /// Policy for the `accept_in_cidr` config flag.
    #[must_use]
    pub const fn from_accept_in_cidr(accept: bool) -> Self {
        if accept {
            Self::MaskHostBits
        } else {
            Self::Strict
        }
    }
}

/// Netmask for a prefix length, as a host-order integer.
#[must_use]
pub const fn prefix_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len as u32)
    }
}

/// Parse an IPv4 range such as `10.0.0.0/8`, `127/8`, `10.1` or `1.2.3.4`.
///
/// Short forms are allowed: with no `/len`, the prefix is 8 bits per octet
/// given. The prefix must be within 1..=32.
pub fn parse_cidr(text: &str, policy: CidrPolicy) -> crate::Result<(Ipv4Addr, u8)> {
    let invalid = || SrvError::Config(format!("invalid network range `{text}'"));

    let (addr_part, len_part) = match text.split_once('/') {
        Some((a, l)) => (a, Some(l)),
        None => (text, None),
    };

    let mut octets = [0u8; 4];
    let mut count = 0;
    for part in addr_part.split('.') {
        if count == 4 || part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        octets[count] = part.parse().map_err(|_| invalid())?;
        count += 1;
    }

    let prefix_len = match len_part {
        Some(l) if !l.is_empty() && l.bytes().all(|b| b.is_ascii_digit()) => {
            l.parse::<u8>().map_err(|_| invalid())?
        }
        Some(_) => return Err(invalid()),
        // `count` is at most 4 here.
        None => u8::try_from(count * 8).map_err(|_| invalid())?,
    };
    if !(1..=32).contains(&prefix_len) {
        return Err(invalid());
    }

    let raw = u32::from_be_bytes(octets);
    let mask = prefix_mask(prefix_len);
    if raw & !mask != 0 && policy == CidrPolicy::Strict {
        return Err(invalid());
    }

    Ok((Ipv4Addr::from(raw & mask), prefix_len))
}

/// Resolves hostnames appearing in a netlist.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// All IPv4 addresses for `host`. An empty result is treated as unknown.
    async fn resolve_ipv4(&self, host: &str) -> crate::Result<Vec<Ipv4Addr>>;
}

/// Resolver backed by the system configuration (`/etc/resolv.conf`, hosts file).
///
/// The underlying resolver is only created when the first hostname is
/// looked up, so purely numeric netlists never touch the system config.
#[derive(Default)]
pub struct SystemResolver {
    inner: OnceCell<TokioResolver>,
}

impl SystemResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn resolver(&self) -> crate::Result<&TokioResolver> {
        self.inner
            .get_or_try_init(|| async {
                TokioResolver::builder_tokio()
                    .map(|builder| builder.build())
                    .map_err(|e| SrvError::Config(format!("failed to create resolver: {e}")))
            })
            .await
    }
}

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve_ipv4(&self, host: &str) -> crate::Result<Vec<Ipv4Addr>> {
        let lookup = self
            .resolver()
            .await?
            .ipv4_lookup(host)
            .await
            .map_err(|e| SrvError::Config(format!("unknown host/net `{host}': {e}")))?;
        Ok(lookup.iter().map(|a| a.0).collect())
    }
}

/// One network range with its verdict. The network is stored pre-masked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetRule {
    network: Ipv4Addr,
    prefix_len: u8,
    verdict: bool,
}

impl NetRule {
    /// Create a rule, clearing any address bits outside the prefix.
    #[must_use]
    pub fn new(addr: Ipv4Addr, prefix_len: u8, verdict: bool) -> Self {
        let prefix_len = prefix_len.min(32);
        let network = Ipv4Addr::from(u32::from(addr) & prefix_mask(prefix_len));
        Self {
            network,
            prefix_len,
            verdict,
        }
    }

    #[must_use]
    pub const fn network(&self) -> Ipv4Addr {
        self.network
    }

    #[must_use]
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    #[must_use]
    pub const fn verdict(&self) -> bool {
        self.verdict
    }

    /// Whether `addr` falls inside this rule's range.
    #[must_use]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & prefix_mask(self.prefix_len) == u32::from(self.network)
    }
}

impl fmt::Display for NetRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.verdict {
            f.write_str("!")?;
        }
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// A parsed netlist token before hostname expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Net(Ipv4Addr, u8),
    Host(String, u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    accept: bool,
    target: Target,
}

fn parse_token(raw: &str, policy: CidrPolicy) -> crate::Result<Token> {
    let (accept, body) = match raw.strip_prefix('!') {
        Some(rest) => (false, rest),
        None => (true, raw),
    };

    let target = if body.bytes().all(|b| b.is_ascii_digit() || b == b'.' || b == b'/') {
        let (net, len) = parse_cidr(body, policy)?;
        Target::Net(net, len)
    } else {
        let (host, len) = match body.split_once('/') {
            Some((host, bits)) => {
                let len = bits
                    .parse::<u8>()
                    .ok()
                    .filter(|b| (1..=32).contains(b))
                    .ok_or_else(|| SrvError::Config(format!("invalid mask `/{bits}'")))?;
                (host, len)
            }
            None => (body, 32),
        };
        Target::Host(host.to_string(), len)
    };

    Ok(Token { accept, target })
}

/// Ordered first-match rule list with a trailing catch-all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetMatcher {
    rules: Vec<NetRule>,
}

impl NetMatcher {
    /// Build a matcher from a netlist such as `127.0.0.1,!127/8`.
    ///
    /// Hostname tokens expand to one rule per IPv4 address returned by
    /// `resolver`, each with the token's mask and verdict.
    pub async fn build(
        spec: &str,
        policy: CidrPolicy,
        resolver: &dyn HostResolver,
    ) -> crate::Result<Self> {
        let tokens = spec
            .split(SEPARATORS)
            .filter(|t| !t.is_empty())
            .map(|t| parse_token(t, policy))
            .collect::<crate::Result<Vec<_>>>()?;

        let mut rules = Vec::with_capacity(tokens.len() + 1);
        for token in &tokens {
            match &token.target {
                Target::Net(net, len) => rules.push(NetRule::new(*net, *len, token.accept)),
                Target::Host(host, len) => {
                    let addrs = resolver.resolve_ipv4(host).await?;
                    if addrs.is_empty() {
                        return Err(SrvError::Config(format!("unknown host/net `{host}'")));
                    }
                    rules.extend(addrs.into_iter().map(|a| NetRule::new(a, *len, token.accept)));
                }
            }
        }

        let last_accept = tokens.last().map(|t| t.accept);
        Ok(Self::with_catch_all(rules, last_accept))
    }

    /// Build from explicit rules; the catch-all negates the last rule's verdict.
    #[must_use]
    pub fn from_rules(rules: Vec<NetRule>) -> Self {
        let last = rules.last().map(NetRule::verdict);
        Self::with_catch_all(rules, last)
    }

    fn with_catch_all(mut rules: Vec<NetRule>, last_accept: Option<bool>) -> Self {
        // An empty netlist allows everything.
        let fallback = last_accept.map_or(true, |accept| !accept);
        rules.push(NetRule::new(Ipv4Addr::UNSPECIFIED, 0, fallback));
        Self { rules }
    }

    /// Verdict of the first rule containing `addr`.
    #[must_use]
    pub fn matches(&self, addr: Ipv4Addr) -> bool {
        self.rules
            .iter()
            .find(|rule| rule.contains(addr))
            .is_some_and(NetRule::verdict)
    }

    /// Like [`matches`](Self::matches) for any socket address family.
    ///
    /// IPv4-mapped IPv6 addresses are matched as IPv4; other IPv6 addresses
    /// only ever reach the catch-all.
    #[must_use]
    pub fn matches_ip(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => self.matches(v4),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => self.matches(v4),
                None => self.rules.last().is_some_and(NetRule::verdict),
            },
        }
    }

    /// All rules, catch-all last.
    #[must_use]
    pub fn rules(&self) -> &[NetRule] {
        &self.rules
    }
}

impl fmt::Display for NetMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rule) in self.rules.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{rule}")?;
        }
        Ok(())
    }
}

/// Evaluate an optional matcher; no matcher means allow.
#[must_use]
pub fn allows(matcher: Option<&NetMatcher>, addr: IpAddr) -> bool {
    matcher.map_or(true, |m| m.matches_ip(addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct StaticHosts(HashMap<&'static str, Vec<Ipv4Addr>>);

    #[async_trait]
    impl HostResolver for StaticHosts {
        async fn resolve_ipv4(&self, host: &str) -> crate::Result<Vec<Ipv4Addr>> {
            self.0
                .get(host)
                .cloned()
                .ok_or_else(|| SrvError::Config(format!("unknown host/net `{host}'")))
        }
    }

    fn hosts() -> StaticHosts {
        let mut map = HashMap::new();
        map.insert(
            "mx.example.org",
            vec![Ipv4Addr::new(192, 0, 2, 10), Ipv4Addr::new(192, 0, 2, 11)],
        );
        map.insert("empty.example.org", Vec::new());
        StaticHosts(map)
    }

    fn build(spec: &str) -> crate::Result<NetMatcher> {
        tokio_test::block_on(NetMatcher::build(spec, CidrPolicy::Strict, &hosts()))
    }

    #[test]
    fn test_parse_cidr_short_forms() {
        assert_eq!(
            parse_cidr("127/8", CidrPolicy::Strict).unwrap(),
            (Ipv4Addr::new(127, 0, 0, 0), 8)
        );
        assert_eq!(
            parse_cidr("10.1", CidrPolicy::Strict).unwrap(),
            (Ipv4Addr::new(10, 1, 0, 0), 16)
        );
        assert_eq!(
            parse_cidr("192.0.2.7", CidrPolicy::Strict).unwrap(),
            (Ipv4Addr::new(192, 0, 2, 7), 32)
        );
    }

    #[test]
    fn test_parse_cidr_rejects_malformed() {
        let malformed = [
            "", "1.2.3.4.5", "256.1.1.1", "1..2", "1.2.3.4/", "1.2.3.4/33", "0/0", "1.2/x",
        ];
        for bad in malformed {
            assert!(parse_cidr(bad, CidrPolicy::Strict).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn test_host_bits_policy() {
        assert!(parse_cidr("127.0.0.1/8", CidrPolicy::Strict).is_err());
        assert_eq!(
            parse_cidr("127.0.0.1/8", CidrPolicy::MaskHostBits).unwrap(),
            (Ipv4Addr::new(127, 0, 0, 0), 8)
        );
    }

    #[test]
    fn test_first_match_wins() {
        let m = build("127.0.0.1,!127/8").unwrap();
        assert!(m.matches(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(!m.matches(Ipv4Addr::new(127, 0, 0, 2)));
        // Catch-all negates the last token (a deny), so everything else is allowed.
        assert!(m.matches(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_order_beats_specificity() {
        let m = build("!10/8,10.1.2.3").unwrap();
        // The /32 allow comes later and is never reached.
        assert!(!m.matches(Ipv4Addr::new(10, 1, 2, 3)));
        // Last token allows, so the catch-all denies.
        assert!(!m.matches(Ipv4Addr::new(192, 0, 2, 1)));
    }

    #[test]
    fn test_negation_is_per_token() {
        let m = build("!10/8 192.0.2.0/24;172.16/12").unwrap();
        assert!(!m.matches(Ipv4Addr::new(10, 9, 9, 9)));
        assert!(m.matches(Ipv4Addr::new(192, 0, 2, 200)));
        assert!(m.matches(Ipv4Addr::new(172, 20, 0, 1)));
        assert!(!m.matches(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn test_empty_spec_allows_all() {
        let m = build("").unwrap();
        assert_eq!(m.rules().len(), 1);
        assert!(m.matches(Ipv4Addr::new(1, 2, 3, 4)));
        assert!(m.matches(Ipv4Addr::BROADCAST));
    }

    #[test]
    fn test_hostname_expands_to_each_address() {
        let m = build("!mx.example.org/31").unwrap();
        // Two resolved addresses plus catch-all.
        assert_eq!(m.rules().len(), 3);
        assert_eq!(m.rules()[0].to_string(), "!192.0.2.10/31");
        assert!(!m.matches(Ipv4Addr::new(192, 0, 2, 11)));
        assert!(m.matches(Ipv4Addr::new(192, 0, 2, 12)));
    }

    #[test]
    fn test_hostname_errors() {
        assert!(build("nosuch.example.org").is_err());
        assert!(build("empty.example.org").is_err());
        assert!(build("mx.example.org/0").is_err());
        assert!(build("mx.example.org/40").is_err());
        assert!(build("!").is_err());
    }

    #[test]
    fn test_display_round_trips_rules() {
        let m = build("127.0.0.1,!127/8").unwrap();
        assert_eq!(m.to_string(), "127.0.0.1/32,!127.0.0.0/8,0.0.0.0/0");
    }

    #[test]
    fn test_allows_without_matcher() {
        assert!(allows(None, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1))));
        let deny_all = NetMatcher::from_rules(vec![NetRule::new(Ipv4Addr::UNSPECIFIED, 0, false)]);
        assert!(!allows(Some(&deny_all), IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn test_mapped_ipv6_uses_ipv4_rules() {
        let m = build("!192.0.2.0/24").unwrap();
        let mapped = Ipv4Addr::new(192, 0, 2, 5).to_ipv6_mapped();
        assert!(!m.matches_ip(IpAddr::V6(mapped)));
        assert!(m.matches_ip(IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)));
    }
}
