//! Traffic statistics by outcome class.
//!
//! Every datagram that reaches the protocol layer is counted exactly once:
//! either as malformed (no reply built) or under the class of its reply's
//! RCODE. Datagrams dropped by the access filter and receive errors are not
//! counted at all.

use std::fmt;
use std::time::Instant;
use tracing::info;

/// Offset of the flags byte holding the RCODE nibble in a DNS header.
const RCODE_OFFSET: usize = 3;
/// Offset of ANCOUNT in a DNS header.
const ANCOUNT_OFFSET: usize = 6;

const RCODE_NOERROR: u8 = 0;
const RCODE_NXDOMAIN: u8 = 3;

/// Outcome of a fully processed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeClass {
    /// NOERROR reply.
    Answered,
    /// NXDOMAIN reply.
    NotFound,
    /// Any other RCODE (REFUSED, NOTIMP, FORMERR, ...).
    Error,
}

impl OutcomeClass {
    /// Classify a reply by its header, returning the class and answer count.
    ///
    /// Replies shorter than a header are classified as errors.
    #[must_use]
    pub fn classify(reply: &[u8]) -> (Self, u32) {
        if reply.len() < ANCOUNT_OFFSET + 2 {
            return (Self::Error, 0);
        }
        let answers = u32::from(u16::from_be_bytes([
            reply[ANCOUNT_OFFSET],
            reply[ANCOUNT_OFFSET + 1],
        ]));
        let class = match reply[RCODE_OFFSET] & 0x0f {
            RCODE_NOERROR => Self::Answered,
            RCODE_NXDOMAIN => Self::NotFound,
            _ => Self::Error,
        };
        (class, answers)
    }
}

/// Datagram count and byte totals for one class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counter {
    pub packets: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl Counter {
    fn add(&mut self, bytes_in: usize, bytes_out: usize) {
        self.packets += 1;
        self.bytes_in += bytes_in as u64;
        self.bytes_out += bytes_out as u64;
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Seconds since the epoch start (last reset or startup).
    pub elapsed_secs: u64,
    pub answered: Counter,
    /// Answer records sent in NOERROR replies.
    pub answer_records: u64,
    pub not_found: Counter,
    pub errors: Counter,
    /// Datagrams the protocol layer could not answer.
    pub malformed: u64,
    pub malformed_bytes: u64,
}

impl StatsSnapshot {
    /// Sum over the three reply classes plus malformed.
    #[must_use]
    pub const fn total_packets(&self) -> u64 {
        self.answered.packets + self.not_found.packets + self.errors.packets + self.malformed
    }

    #[must_use]
    pub const fn total_bytes_in(&self) -> u64 {
        self.answered.bytes_in + self.not_found.bytes_in + self.errors.bytes_in
    }

    #[must_use]
    pub const fn total_bytes_out(&self) -> u64 {
        self.answered.bytes_out + self.not_found.bytes_out + self.errors.bytes_out
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            concat!(
                "stats for {}sec (num/in/out/ans): tot={}/{}/{}/{} ok={}/{}/{}/{} ",
                "nxd={}/{}/{} err={}/{}/{} bad={}/{}"
            ),
            self.elapsed_secs,
            self.total_packets(),
            self.total_bytes_in(),
            self.total_bytes_out(),
            self.answer_records,
            self.answered.packets,
            self.answered.bytes_in,
            self.answered.bytes_out,
            self.answer_records,
            self.not_found.packets,
            self.not_found.bytes_in,
            self.not_found.bytes_out,
            self.errors.packets,
            self.errors.bytes_in,
            self.errors.bytes_out,
            self.malformed,
            self.malformed_bytes,
        )
    }
}

/// Request counters plus the epoch they were accumulated over.
#[derive(Debug)]
pub struct StatsCollector {
    answered: Counter,
    answer_records: u64,
    not_found: Counter,
    errors: Counter,
    malformed: u64,
    malformed_bytes: u64,
    epoch: Instant,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            answered: Counter::default(),
            answer_records: 0,
            not_found: Counter::default(),
            errors: Counter::default(),
            malformed: 0,
            malformed_bytes: 0,
            epoch: Instant::now(),
        }
    }

    /// Count one answered request.
    pub fn record(&mut self, class: OutcomeClass, bytes_in: usize, bytes_out: usize, answers: u32) {
        match class {
            OutcomeClass::Answered => {
                self.answered.add(bytes_in, bytes_out);
                self.answer_records += u64::from(answers);
            }
            OutcomeClass::NotFound => self.not_found.add(bytes_in, bytes_out),
            OutcomeClass::Error => self.errors.add(bytes_in, bytes_out),
        }
    }

    /// Count a datagram for which no reply could be built.
    pub fn record_malformed(&mut self, bytes_in: usize) {
        self.malformed += 1;
        self.malformed_bytes += bytes_in as u64;
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            elapsed_secs: self.epoch.elapsed().as_secs(),
            answered: self.answered,
            answer_records: self.answer_records,
            not_found: self.not_found,
            errors: self.errors,
            malformed: self.malformed,
            malformed_bytes: self.malformed_bytes,
        }
    }

    /// Log the summary line; with `reset`, zero everything and restart the epoch.
    ///
    /// Taking `&mut self` keeps the read and the reset in one step, so no
    /// request can be counted in both epochs.
    pub fn report(&mut self, reset: bool) -> StatsSnapshot {
        let snapshot = self.snapshot();
        info!(reset, "{snapshot}");
        if reset {
            *self = Self::new();
        }
        snapshot
    }
}
