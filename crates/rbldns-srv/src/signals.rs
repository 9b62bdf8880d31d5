//! Administrative events: OS signals and the reload timer folded into one
//! pending-event bitset.
//!
//! Producers (signal listener tasks, the timer) only ever OR bits in via
//! [`SignalAggregator::raise`]. The request loop is the single consumer and
//! takes the whole set at once with [`SignalAggregator::drain`], an atomic
//! swap with zero. An event raised any number of times before a drain is seen
//! once by that drain; an event raised while a drained batch is being handled
//! lands in the next drain.
//!
//! | Signal          | Events                        |
//! |-----------------|-------------------------------|
//! | SIGHUP          | `ReloadRequest` + `LogRotate` |
//! | timer           | `ReloadTimer`                 |
//! | SIGUSR1         | `StatsReport`                 |
//! | SIGUSR2         | `StatsReportReset`            |
//! | SIGTERM, SIGINT | `Shutdown`                    |

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Kinds of administrative event the request loop reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    /// Periodic zone freshness check.
    ReloadTimer = 0x01,
    /// Operator asked for a reload (SIGHUP).
    ReloadRequest = 0x02,
    /// Operator asked to reopen the query log (SIGHUP).
    LogRotate = 0x04,
    /// Log statistics (SIGUSR1).
    StatsReport = 0x08,
    /// Log statistics and zero them (SIGUSR2).
    StatsReportReset = 0x10,
    /// Terminate (SIGTERM, SIGINT).
    Shutdown = 0x20,
}

impl EventKind {
    /// All kinds, in dispatch priority order.
    pub const ALL: [Self; 6] = [
        Self::Shutdown,
        Self::StatsReportReset,
        Self::StatsReport,
        Self::LogRotate,
        Self::ReloadRequest,
        Self::ReloadTimer,
    ];

    #[must_use]
    pub const fn bit(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::ReloadTimer => "reload-timer",
            Self::ReloadRequest => "reload-request",
            Self::LogRotate => "log-rotate",
            Self::StatsReport => "stats-report",
            Self::StatsReportReset => "stats-report-reset",
            Self::Shutdown => "shutdown",
        }
    }
}

/// A snapshot of pending events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventSet(u8);

impl EventSet {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    #[must_use]
    pub const fn with(self, kind: EventKind) -> Self {
        Self(self.0 | kind.bit())
    }

    /// Either a timer- or operator-triggered reload is pending.
    #[must_use]
    pub const fn wants_reload(self) -> bool {
        self.contains(EventKind::ReloadTimer) || self.contains(EventKind::ReloadRequest)
    }

    /// Pending kinds in dispatch priority order.
    pub fn iter(self) -> impl Iterator<Item = EventKind> {
        EventKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl fmt::Display for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for kind in self.iter() {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(kind.label())?;
            first = false;
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// Pending-event bitset shared between event producers and the request loop.
#[derive(Debug, Default)]
pub struct SignalAggregator {
    pending: AtomicU8,
    wake: Notify,
}

impl SignalAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `kind` pending and wake the request loop.
    pub fn raise(&self, kind: EventKind) {
        self.pending.fetch_or(kind.bit(), Ordering::AcqRel);
        self.wake.notify_one();
    }

    /// Peek at the pending set without clearing it.
    #[must_use]
    pub fn pending(&self) -> EventSet {
        EventSet(self.pending.load(Ordering::Acquire))
    }

    /// Take every pending event, leaving the set empty.
    pub fn drain(&self) -> EventSet {
        EventSet(self.pending.swap(0, Ordering::AcqRel))
    }

    /// Resolves once an event has been raised since the last wait.
    ///
    /// A raise that happens before this is polled is not lost: the stored
    /// permit completes the next wait immediately.
    pub async fn notified(&self) {
        self.wake.notified().await;
    }
}

/// Raise `ReloadTimer` every `interval`, re-arming after each firing.
///
/// Returns `None` when the interval is zero (periodic checks disabled).
pub fn spawn_reload_timer(
    events: Arc<SignalAggregator>,
    interval: Duration,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            debug!(secs = interval.as_secs(), "reload timer fired");
            events.raise(EventKind::ReloadTimer);
        }
    }))
}

/// OS signals the daemon listens for and the events each one raises.
#[cfg(unix)]
pub const SIGNAL_EVENTS: [(tokio::signal::unix::SignalKind, &str, &[EventKind]); 5] = {
    use tokio::signal::unix::SignalKind;
    [
        (
            SignalKind::hangup(),
            "SIGHUP",
            &[EventKind::ReloadRequest, EventKind::LogRotate],
        ),
        (SignalKind::user_defined1(), "SIGUSR1", &[EventKind::StatsReport]),
        (SignalKind::user_defined2(), "SIGUSR2", &[EventKind::StatsReportReset]),
        (SignalKind::terminate(), "SIGTERM", &[EventKind::Shutdown]),
        (SignalKind::interrupt(), "SIGINT", &[EventKind::Shutdown]),
    ]
};

/// Install the OS signal listeners that feed `events`.
#[cfg(unix)]
pub fn spawn_signal_listeners(
    events: &Arc<SignalAggregator>,
) -> crate::Result<Vec<JoinHandle<()>>> {
    use tokio::signal::unix::signal;

    let mut handles = Vec::with_capacity(SIGNAL_EVENTS.len());
    for (kind, name, raises) in SIGNAL_EVENTS {
        let mut stream = signal(kind).map_err(|e| {
            crate::SrvError::Config(format!("cannot install {name} handler: {e}"))
        })?;
        let events = Arc::clone(events);
        handles.push(tokio::spawn(async move {
            while stream.recv().await.is_some() {
                debug!(signal = name, "signal received");
                for event in raises {
                    events.raise(*event);
                }
            }
            warn!(signal = name, "signal stream closed");
        }));
    }
    Ok(handles)
}
