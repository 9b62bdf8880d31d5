//! Zone reload orchestration.
//!
//! The current [`ZoneSnapshot`] lives in an [`ArcSwap`]. A reload asks the
//! zone subsystem for a new snapshot and, only once it is fully built, swaps
//! it in with a single store. Readers holding the old `Arc` keep a consistent
//! view until they drop it; nothing is ever mutated in place.
//!
//! A failed initial load is fatal; a failed runtime reload is logged and the
//! previous snapshot stays authoritative.

use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::{error, info};

use crate::telemetry::{self, Stopwatch};
use crate::zone::{LoadPhase, ReloadStatus, ZoneSnapshot, ZoneSource};
use crate::SrvError;

/// What a reload attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Sources unchanged, snapshot kept.
    Unchanged,
    /// New snapshot installed.
    Updated { generation: u64, entries: usize },
    /// Sources unreadable, previous snapshot kept.
    Failed,
}

/// Owns the current snapshot and replaces it on reload.
pub struct ReloadController {
    source: Arc<dyn ZoneSource>,
    current: Arc<ArcSwap<ZoneSnapshot>>,
    telemetry: bool,
}

impl ReloadController {
    /// Start with an empty snapshot; call [`initial_load`](Self::initial_load)
    /// or schedule a reload before serving.
    pub fn new(source: Arc<dyn ZoneSource>, telemetry: bool) -> Self {
        Self {
            source,
            current: Arc::new(ArcSwap::from_pointee(ZoneSnapshot::empty())),
            telemetry,
        }
    }

    /// The snapshot new requests should be answered from.
    #[must_use]
    pub fn current(&self) -> Arc<ZoneSnapshot> {
        self.current.load_full()
    }

    /// Whether `-s` style timing and memory reports are enabled.
    #[must_use]
    pub const fn telemetry(&self) -> bool {
        self.telemetry
    }

    /// Load zones before serving. Any failure is returned to the caller.
    pub async fn initial_load(&self) -> crate::Result<ReloadOutcome> {
        self.run(LoadPhase::Startup).await
    }

    /// Reload while serving. Failures are logged, never returned.
    pub async fn reload(&self) -> ReloadOutcome {
        match self.run(LoadPhase::Runtime).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let current = self.current.load();
                error!(
                    error = %e,
                    generation = current.generation(),
                    "zone reload failed, keeping previous data"
                );
                ReloadOutcome::Failed
            }
        }
    }

    /// Run the load on the blocking pool and wait for it; the request loop
    /// handles nothing else meanwhile.
    async fn run(&self, phase: LoadPhase) -> crate::Result<ReloadOutcome> {
        let source = Arc::clone(&self.source);
        let current = Arc::clone(&self.current);
        let telemetry = self.telemetry;
        tokio::task::spawn_blocking(move || apply(source.as_ref(), &current, telemetry, phase))
            .await
            .map_err(|e| SrvError::Reload(format!("reload task failed: {e}")))?
    }
}

fn apply(
    source: &dyn ZoneSource,
    current: &ArcSwap<ZoneSnapshot>,
    telemetry: bool,
    phase: LoadPhase,
) -> crate::Result<ReloadOutcome> {
    let watch = Stopwatch::start();
    let previous = current.load_full();

    let result = match source.reload_all(&previous, phase) {
        ReloadStatus::Unchanged => return Ok(ReloadOutcome::Unchanged),
        ReloadStatus::Failed(e) => Err(e),
        ReloadStatus::Updated(snapshot) => {
            let generation = snapshot.generation();
            let entries = snapshot.entry_count();
            info!(
                generation,
                entries,
                loaded_at = ?snapshot.loaded_at(),
                "zones (re)loaded"
            );
            current.store(Arc::new(snapshot));
            Ok(ReloadOutcome::Updated {
                generation,
                entries,
            })
        }
    };

    // Reported for failed attempts too; only an unchanged check is silent.
    if telemetry {
        info!("zones (re)loaded: {} sec", watch.elapsed());
        telemetry::log_memory_usage();
    }

    result
}
