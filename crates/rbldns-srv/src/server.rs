//! The request loop and daemon bootstrap.
//!
//! [`RequestLoop`] is the single flow that handles both administrative events
//! and DNS datagrams, one at a time. Pending events always win over a waiting
//! datagram, so a reload or shutdown is never starved by traffic.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::config::ServerConfig;
use crate::netlist::{self, CidrPolicy, HostResolver, NetMatcher, SystemResolver};
use crate::protocol::{DnsblResponder, Responder};
use crate::querylog::{QueryLog, QueryLogConfig};
use crate::reload::ReloadController;
use crate::signals::{self, EventKind, EventSet, SignalAggregator};
use crate::stats::{OutcomeClass, StatsCollector, StatsSnapshot};
use crate::telemetry;
use crate::zone::{parse_zone_specs, ZoneSet};
use crate::SrvError;

/// Receive buffer size; large enough for any EDNS0 query.
const MAX_DATAGRAM: usize = 4096;

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Blocked until an event or a datagram arrives.
    Waiting,
    /// Dispatching a drained batch of events.
    EventDrain,
    /// Handling one datagram.
    Processing,
    /// Terminal.
    Shutdown,
}

/// Owns the socket, the filters, the counters and the reload controller.
pub struct RequestLoop {
    socket: UdpSocket,
    events: Arc<SignalAggregator>,
    access: Option<NetMatcher>,
    reload: ReloadController,
    responder: Box<dyn Responder>,
    stats: StatsCollector,
    query_log: QueryLog,
    state: LoopState,
}

impl RequestLoop {
    /// A loop with no access filter and no query log.
    pub fn new(
        socket: UdpSocket,
        events: Arc<SignalAggregator>,
        reload: ReloadController,
        responder: Box<dyn Responder>,
    ) -> Self {
        Self {
            socket,
            events,
            access: None,
            reload,
            responder,
            stats: StatsCollector::new(),
            query_log: QueryLog::disabled(),
            state: LoopState::Waiting,
        }
    }

    /// Only clients `access` allows get a reply; others are dropped silently.
    #[must_use]
    pub fn with_access(mut self, access: Option<NetMatcher>) -> Self {
        self.access = access;
        self
    }

    #[must_use]
    pub fn with_query_log(mut self, query_log: QueryLog) -> Self {
        self.query_log = query_log;
        self
    }

    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| SrvError::Transport(format!("local address: {e}")))
    }

    #[must_use]
    pub const fn state(&self) -> LoopState {
        self.state
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Serve until a shutdown event; returns the final counters.
    pub async fn run(mut self) -> crate::Result<StatsSnapshot> {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            self.state = LoopState::Waiting;

            if !self.events.pending().is_empty() {
                let batch = self.events.drain();
                if self.dispatch(batch).await {
                    self.state = LoopState::Shutdown;
                    return Ok(self.stats.snapshot());
                }
                continue;
            }

            let received = tokio::select! {
                biased;
                () = self.events.notified() => None,
                r = self.socket.recv_from(&mut buf) => Some(r),
            };

            match received {
                // Woken by an event; handled at the top of the loop.
                None => {}
                Some(Ok((0, _))) => {}
                Some(Ok((len, peer))) => {
                    self.state = LoopState::Processing;
                    self.process(&buf[..len], peer).await;
                }
                Some(Err(e)) => debug!(error = %e, "receive failed"),
            }
        }
    }

    /// Handle one drained batch. Returns true on shutdown.
    async fn dispatch(&mut self, batch: EventSet) -> bool {
        self.state = LoopState::EventDrain;
        debug!(events = %batch, "dispatching events");

        if batch.contains(EventKind::Shutdown) {
            self.stats.report(false);
            if self.reload.telemetry() {
                telemetry::log_memory_usage();
            }
            self.query_log.flush();
            info!("terminating");
            return true;
        }

        // A reset report also satisfies a plain report raised in the same batch.
        let reset = batch.contains(EventKind::StatsReportReset);
        if reset || batch.contains(EventKind::StatsReport) {
            self.stats.report(reset);
            if self.reload.telemetry() {
                telemetry::log_memory_usage();
            }
        }

        if batch.contains(EventKind::LogRotate) {
            self.query_log.rotate();
        }

        if batch.wants_reload() {
            self.reload.reload().await;
        }

        false
    }

    async fn process(&mut self, query: &[u8], peer: SocketAddr) {
        if !netlist::allows(self.access.as_ref(), peer.ip()) {
            trace!(client = %peer.ip(), "query refused by access list");
            return;
        }

        let snapshot = self.reload.current();
        let Some(reply) = self.responder.build_reply(query, &snapshot) else {
            trace!(client = %peer.ip(), len = query.len(), "unanswerable datagram");
            self.stats.record_malformed(query.len());
            return;
        };

        self.query_log.write(peer.ip(), &reply.summary, reply.bytes.len());

        let (class, answers) = OutcomeClass::classify(&reply.bytes);
        self.stats.record(class, query.len(), reply.bytes.len(), answers);

        self.send(&reply.bytes, peer).await;
    }

    async fn send(&self, reply: &[u8], peer: SocketAddr) {
        loop {
            match self.socket.send_to(reply, peer).await {
                Ok(_) => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(client = %peer, error = %e, "send failed");
                    return;
                }
            }
        }
    }
}

/// Build a matcher for an optional netlist.
async fn build_matcher(
    spec: Option<&str>,
    policy: CidrPolicy,
    resolver: &dyn HostResolver,
) -> crate::Result<Option<NetMatcher>> {
    let Some(spec) = spec else {
        return Ok(None);
    };
    let matcher = NetMatcher::build(spec, policy, resolver).await?;
    debug!(rules = %matcher, "netlist built");
    Ok(Some(matcher))
}

#[cfg(unix)]
fn spawn_event_sources(
    events: &Arc<SignalAggregator>,
    config: &ServerConfig,
) -> crate::Result<Vec<JoinHandle<()>>> {
    let mut tasks = signals::spawn_signal_listeners(events)?;
    tasks.extend(signals::spawn_reload_timer(Arc::clone(events), config.reload_interval()));
    Ok(tasks)
}

#[cfg(not(unix))]
fn spawn_event_sources(
    events: &Arc<SignalAggregator>,
    config: &ServerConfig,
) -> crate::Result<Vec<JoinHandle<()>>> {
    Ok(signals::spawn_reload_timer(Arc::clone(events), config.reload_interval())
        .into_iter()
        .collect())
}

/// Build the request loop for `config` without starting it.
///
/// Configuration errors and, unless quickstart is on, a failed initial load
/// are returned before any query is answered. With quickstart the first load
/// is queued on `events` and the loop answers REFUSED until it succeeds.
pub async fn prepare(
    config: &ServerConfig,
    events: Arc<SignalAggregator>,
) -> crate::Result<RequestLoop> {
    let policy = config.cidr_policy();

    let specs = parse_zone_specs(&config.zones)?;
    if specs.is_empty() {
        return Err(SrvError::Config("no zones specified".into()));
    }

    let resolver = SystemResolver::new();
    let access = build_matcher(config.access.as_deref(), policy, &resolver).await?;
    let log_filter =
        build_matcher(config.query_log.filter.as_deref(), policy, &resolver).await?;

    let socket = UdpSocket::bind(config.listen)
        .await
        .map_err(|e| SrvError::Transport(format!("UDP bind {}: {e}", config.listen)))?;
    info!(addr = %config.listen, "UDP socket bound");

    let reload = ReloadController::new(Arc::new(ZoneSet::new(specs, policy)), config.telemetry);
    if config.quickstart {
        // First load happens on the first loop iteration.
        events.raise(EventKind::ReloadTimer);
    } else {
        reload.initial_load().await?;
    }

    let query_log = match &config.query_log.path {
        Some(path) => QueryLog::open(QueryLogConfig::from_spec(path, log_filter)),
        None => QueryLog::disabled(),
    };

    Ok(RequestLoop::new(
        socket,
        events,
        reload,
        Box::new(DnsblResponder::new(config.ttl)),
    )
    .with_access(access)
    .with_query_log(query_log))
}

/// Start the daemon with the given configuration and run until shutdown.
///
/// Everything that goes wrong after startup is logged and survived.
pub async fn serve(config: &ServerConfig) -> crate::Result<()> {
    let events = Arc::new(SignalAggregator::new());
    let request_loop = prepare(config, Arc::clone(&events)).await?;
    let tasks = spawn_event_sources(&events, config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        zones = config.zones.len(),
        quickstart = config.quickstart,
        "rbldnsd started"
    );

    let result = request_loop.run().await;

    for task in tasks {
        task.abort();
    }
    result.map(|_| ())
}
