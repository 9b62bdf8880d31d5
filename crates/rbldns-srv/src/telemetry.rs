//! Process memory and reload timing reports (`-s`).

use std::fmt;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{info, warn};

/// Memory usage of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Resident set size in bytes.
    pub resident: u64,
    /// Virtual memory size in bytes.
    pub virtual_size: u64,
}

impl MemoryUsage {
    /// Read the current process's memory usage.
    #[must_use]
    pub fn sample() -> Option<Self> {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::everything(),
        );
        system.process(pid).map(|p| Self {
            resident: p.memory(),
            virtual_size: p.virtual_memory(),
        })
    }
}

impl fmt::Display for MemoryUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "memory usage: rss={}KiB virt={}KiB",
            self.resident / 1024,
            self.virtual_size / 1024
        )
    }
}

/// Log a memory usage line.
pub fn log_memory_usage() {
    match MemoryUsage::sample() {
        Some(usage) => info!(
            rss = usage.resident,
            virt = usage.virtual_size,
            "{usage}"
        ),
        None => warn!("memory usage unavailable"),
    }
}

/// Format a duration as `secs.hundredths`, the way reload times are reported.
#[must_use]
pub fn format_secs(elapsed: Duration) -> String {
    format!("{}.{:02}", elapsed.as_secs(), elapsed.subsec_millis() / 10)
}

/// CPU time consumed by this process so far, all threads included.
#[cfg(unix)]
#[must_use]
pub fn process_cpu_time() -> Option<Duration> {
    use rustix::time::{clock_gettime, ClockId};
    Duration::try_from(clock_gettime(ClockId::ProcessCPUTime)).ok()
}

#[cfg(not(unix))]
#[must_use]
pub const fn process_cpu_time() -> Option<Duration> {
    None
}

/// Wall-clock and CPU time measured from [`Stopwatch::start`].
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    wall: Instant,
    cpu: Option<Duration>,
}

impl Stopwatch {
    #[must_use]
    pub fn start() -> Self {
        Self {
            wall: Instant::now(),
            cpu: process_cpu_time(),
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Elapsed {
        let cpu = self
            .cpu
            .zip(process_cpu_time())
            .map(|(start, now)| now.saturating_sub(start));
        Elapsed {
            wall: self.wall.elapsed(),
            cpu,
        }
    }
}

/// Time spent in one measured operation.
///
/// Displays as `<wall>e/<cpu>u`, or `<wall>e` when CPU time is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed {
    pub wall: Duration,
    pub cpu: Option<Duration>,
}

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}e", format_secs(self.wall))?;
        if let Some(cpu) = self.cpu {
            write!(f, "/{}u", format_secs(cpu))?;
        }
        Ok(())
    }
}
