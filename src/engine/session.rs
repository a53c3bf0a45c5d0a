//! Session lifecycle.
//!
//! A `SplitSession` owns the route overrides, the packet handles and the
//! four worker threads (tracker, outbound interceptor, inbound interceptor,
//! NAT sweeper), and guarantees route removal on every exit path: `stop()`
//! removes routes unconditionally after a bounded wait for the workers, and
//! `Drop` invokes `stop()`.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::engine::adapter::{self, AdapterSet};
use crate::engine::interceptor::{self, InterceptCtx};
use crate::engine::nat::{NatTable, NAT_IDLE_TIMEOUT, NAT_SWEEP_INTERVAL};
use crate::engine::policy::{FlowPolicyCache, Mode, PolicyConfig};
use crate::engine::port_lookup::PortResolver;
use crate::engine::process::PidCache;
use crate::engine::routes::RouteManager;
use crate::engine::tracker::{worker::run_tracker, ConnTable};
use crate::engine::{EngineError, EngineResult};

/// How long `stop` waits for workers before proceeding to route cleanup.
/// Route removal must not hang on a worker blocked in a receive call.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared by the session and its workers.
pub(crate) struct SessionShared {
    stop: AtomicBool,
    fault: Mutex<Option<String>>,
    bytes_out: AtomicU64,
    bytes_in: AtomicU64,
    packets_discarded: AtomicU64,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            fault: Mutex::new(None),
            bytes_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            packets_discarded: AtomicU64::new(0),
        }
    }

    pub(crate) fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Record a fault and wind the whole session down. The first fault wins.
    pub(crate) fn fault(&self, message: String) {
        error!("Session fault: {message}");
        let mut slot = self.fault.lock().unwrap();
        if slot.is_none() {
            *slot = Some(message);
        }
        drop(slot);
        self.request_stop();
    }

    pub(crate) fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_discard(&self) {
        self.packets_discarded.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time session counters. Reads only atomics; safe to call from
/// a UI thread at any rate.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub flows_active: usize,
    pub nat_entries: usize,
    pub packets_discarded: u64,
}

/// A running split-tunnel session.
pub struct SplitSession {
    policy: Arc<ArcSwap<PolicyConfig>>,
    shared: Arc<SessionShared>,
    nat: Arc<NatTable>,
    flows: Arc<FlowPolicyCache>,
    routes: Mutex<RouteManager>,
    adapters: AdapterSet,
    workers: Vec<JoinHandle<()>>,
    done_rx: Receiver<&'static str>,
    stopped: bool,
}

impl SplitSession {
    /// Start a session: elevation check, adapter discovery, route install,
    /// packet-handle open, then the four workers. Any failure after the
    /// routes went in rolls them back before returning.
    pub fn start(mode: Mode, targets: HashSet<String>) -> EngineResult<SplitSession> {
        if !crate::utils::is_administrator() {
            return Err(EngineError::NotElevated);
        }

        let adapters = adapter::discover()?;

        let mut routes = RouteManager::new();
        routes.install(adapters.gateway, adapters.physical.ifindex)?;

        // Open both handles before spawning anything; an open failure must
        // leave no routes behind.
        let outbound = match interceptor::open_outbound() {
            Ok(handle) => handle,
            Err(e) => {
                routes.remove_all();
                return Err(e);
            }
        };
        let inbound = match interceptor::open_inbound() {
            Ok(handle) => handle,
            Err(e) => {
                routes.remove_all();
                return Err(e);
            }
        };

        let policy = Arc::new(ArcSwap::from_pointee(PolicyConfig::new(mode, targets)));
        let shared = Arc::new(SessionShared::new());
        let nat = Arc::new(NatTable::new());
        let flows = Arc::new(FlowPolicyCache::new());
        let conn_table = Arc::new(ConnTable::new());
        let pids = Arc::new(PidCache::new());
        let resolver = Arc::new(PortResolver::new(Arc::clone(&pids)));

        let (done_tx, done_rx) = bounded::<&'static str>(4);
        let mut workers = Vec::with_capacity(4);

        let aliases: [Ipv4Addr; 2] = [adapters.vpn.ip, adapters.physical.ip];
        {
            let conn_table = Arc::clone(&conn_table);
            let pids = Arc::clone(&pids);
            let shared = Arc::clone(&shared);
            workers.push(spawn_worker("conn-tracker", done_tx.clone(), move || {
                run_tracker(conn_table, pids, aliases, shared)
            }));
        }

        let ctx = InterceptCtx {
            policy: Arc::clone(&policy),
            conn_table: Arc::clone(&conn_table),
            nat: Arc::clone(&nat),
            flows: Arc::clone(&flows),
            resolver: Arc::clone(&resolver),
            vpn: adapters.vpn.clone(),
            physical: adapters.physical.clone(),
            shared: Arc::clone(&shared),
        };

        {
            let ctx = ctx.clone();
            workers.push(spawn_worker("outbound", done_tx.clone(), move || {
                interceptor::run_outbound(outbound, ctx)
            }));
        }
        {
            let ctx = ctx.clone();
            workers.push(spawn_worker("inbound", done_tx.clone(), move || {
                interceptor::run_inbound(inbound, ctx)
            }));
        }
        {
            let nat = Arc::clone(&nat);
            let flows = Arc::clone(&flows);
            let shared = Arc::clone(&shared);
            workers.push(spawn_worker("nat-sweeper", done_tx, move || {
                run_sweeper(nat, flows, shared)
            }));
        }

        info!(
            "Split session started: mode {:?}, {} targeted apps",
            mode,
            policy.load().target_count()
        );

        Ok(SplitSession {
            policy,
            shared,
            nat,
            flows,
            routes: Mutex::new(routes),
            adapters,
            workers,
            done_rx,
            stopped: false,
        })
    }

    /// Swap the routing mode. Applies to flows without a committed decision.
    pub fn set_mode(&self, mode: Mode) {
        self.policy.rcu(|current| current.with_mode(mode));
        info!("Mode set to {mode:?}");
    }

    /// Swap the target set. Applies to flows without a committed decision.
    pub fn set_targets(&self, targets: HashSet<String>) {
        self.policy
            .rcu(|current| current.with_targets(targets.iter().cloned()));
        info!("Target set updated: {} apps", targets.len());
    }

    pub fn mode(&self) -> Mode {
        self.policy.load().mode
    }

    pub fn adapters(&self) -> &AdapterSet {
        &self.adapters
    }

    /// Lock-free stats snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_out: self.shared.bytes_out.load(Ordering::Relaxed),
            bytes_in: self.shared.bytes_in.load(Ordering::Relaxed),
            flows_active: self.flows.len(),
            nat_entries: self.nat.len(),
            packets_discarded: self.shared.packets_discarded.load(Ordering::Relaxed),
        }
    }

    /// The first recorded worker fault, if any.
    pub fn fault(&self) -> Option<String> {
        self.shared.fault.lock().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.stopped && !self.shared.stopping()
    }

    /// Ordered shutdown: stop flag, bounded wait for workers, then route
    /// removal regardless of whether every worker made it out.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        info!("Stopping split session...");
        self.shared.request_stop();

        let deadline = Instant::now() + JOIN_TIMEOUT;
        let mut remaining = self.workers.len();
        while remaining > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                warn!("{remaining} workers still running at stop timeout; continuing to route cleanup");
                break;
            }
            match self.done_rx.recv_timeout(left) {
                Ok(name) => {
                    debug!("Worker {name} exited");
                    remaining -= 1;
                }
                Err(_) => {
                    warn!("{remaining} workers still running at stop timeout; continuing to route cleanup");
                    break;
                }
            }
        }

        // Join only the threads that already finished; a worker blocked in
        // a receive call must not delay route removal.
        for handle in self.workers.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }

        self.nat.clear();
        self.flows.clear();
        self.routes.lock().unwrap().remove_all();

        info!("Split session stopped");
    }
}

impl Drop for SplitSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_worker(
    name: &'static str,
    done_tx: Sender<&'static str>,
    body: impl FnOnce() + Send + 'static,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            body();
            let _ = done_tx.send(name);
        })
        .unwrap_or_else(|e| panic!("failed to spawn {name} worker: {e}"))
}

/// Low-frequency sweeper for the NAT and flow tables.
fn run_sweeper(nat: Arc<NatTable>, flows: Arc<FlowPolicyCache>, shared: Arc<SessionShared>) {
    info!("NAT sweeper started");

    let mut since_sweep = Duration::ZERO;
    let step = Duration::from_millis(500);

    while !shared.stopping() {
        std::thread::sleep(step);
        since_sweep += step;
        if since_sweep >= NAT_SWEEP_INTERVAL {
            since_sweep = Duration::ZERO;
            nat.sweep();
            flows.sweep(NAT_IDLE_TIMEOUT);
        }
    }

    info!("NAT sweeper stopped");
}
