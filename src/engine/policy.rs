//! Routing policy: session mode, target set, and per-flow decisions.
//!
//! The mode and target set live in one immutable `PolicyConfig` snapshot
//! swapped atomically as a unit, so a packet never observes a mode from one
//! update and targets from another. Per-flow decisions are committed on the
//! first packet of a flow and never flip afterwards; toggling an app only
//! affects flows that have not been decided yet.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::engine::packet::Protocol;

/// Routing mode for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Default egress is the VPN tunnel; targeted apps use the physical adapter.
    Exclude,
    /// Default egress is the physical adapter; targeted apps use the VPN tunnel.
    Include,
}

/// Which adapter a flow should egress through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Egress {
    Vpn,
    Physical,
}

impl Mode {
    /// Egress for apps that are not in the target set.
    pub fn default_egress(self) -> Egress {
        match self {
            Mode::Exclude => Egress::Vpn,
            Mode::Include => Egress::Physical,
        }
    }

    /// Egress for apps that are in the target set.
    pub fn target_egress(self) -> Egress {
        match self {
            Mode::Exclude => Egress::Physical,
            Mode::Include => Egress::Vpn,
        }
    }
}

/// Normalize an executable path for case-insensitive comparison.
///
/// Windows paths compare case-insensitively and accept both separators;
/// every path entering the engine (target set, PID resolution) goes through
/// here so lookups are plain string equality.
pub fn normalize_exe_path(path: &str) -> String {
    path.to_lowercase().replace('/', "\\")
}

/// One immutable policy snapshot: the mode plus the normalized target set.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub mode: Mode,
    targets: HashSet<String>,
}

impl PolicyConfig {
    pub fn new(mode: Mode, targets: impl IntoIterator<Item = String>) -> Self {
        Self {
            mode,
            targets: targets
                .into_iter()
                .map(|p| normalize_exe_path(&p))
                .collect(),
        }
    }

    /// Copy of this snapshot with a different mode.
    pub fn with_mode(&self, mode: Mode) -> Self {
        Self {
            mode,
            targets: self.targets.clone(),
        }
    }

    /// Copy of this snapshot with a different target set.
    pub fn with_targets(&self, targets: impl IntoIterator<Item = String>) -> Self {
        Self::new(self.mode, targets)
    }

    /// Whether a normalized executable path is targeted.
    pub fn is_target(&self, exe: &str) -> bool {
        self.targets.contains(exe)
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }
}

/// Compute the desired egress adapter for a packet's owner.
///
/// Pure: identical inputs always yield identical outputs. An unidentified
/// owner yields None, which callers treat as "reinject unchanged, commit
/// nothing" so the flow can still be classified on a later packet.
pub fn decide_egress(config: &PolicyConfig, exe: Option<&str>) -> Option<Egress> {
    match exe {
        Some(exe) if config.is_target(exe) => Some(config.mode.target_egress()),
        Some(_) => Some(config.mode.default_egress()),
        None => None,
    }
}

/// Identity of a flow as seen on the outbound path, before any rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

/// Committed routing decision for a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    PassThrough,
    RedirectToVpn,
    RedirectToPhysical,
    /// No decision committed yet for this flow.
    Unknown,
}

struct FlowSlot {
    decision: Decision,
    last_seen_ms: AtomicU64,
}

/// Per-flow decision cache.
///
/// `commit` keeps whatever decision was stored first; callers apply the
/// returned decision, so every packet of a flow takes the same path even if
/// the policy changed in between.
pub struct FlowPolicyCache {
    flows: RwLock<HashMap<FlowKey, FlowSlot>>,
    len_gauge: AtomicUsize,
    epoch: Instant,
}

impl FlowPolicyCache {
    pub fn new() -> Self {
        Self {
            flows: RwLock::new(HashMap::new()),
            len_gauge: AtomicUsize::new(0),
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Committed decision for a flow, refreshing its idle timer.
    /// Returns `Decision::Unknown` when nothing has been committed.
    pub fn get(&self, key: &FlowKey) -> Decision {
        let flows = self.flows.read().unwrap();
        match flows.get(key) {
            Some(slot) => {
                slot.last_seen_ms.store(self.now_ms(), Ordering::Relaxed);
                slot.decision
            }
            None => Decision::Unknown,
        }
    }

    /// Commit the decision for a flow. If a decision is already present it
    /// wins; the effective decision is returned either way.
    pub fn commit(&self, key: FlowKey, decision: Decision) -> Decision {
        if decision == Decision::Unknown {
            return self.get(&key);
        }

        let mut flows = self.flows.write().unwrap();
        let now = self.now_ms();
        match flows.get(&key) {
            Some(slot) => {
                slot.last_seen_ms.store(now, Ordering::Relaxed);
                slot.decision
            }
            None => {
                flows.insert(
                    key,
                    FlowSlot {
                        decision,
                        last_seen_ms: AtomicU64::new(now),
                    },
                );
                self.len_gauge.store(flows.len(), Ordering::Relaxed);
                decision
            }
        }
    }

    /// Number of committed flows, readable without the lock.
    pub fn len(&self) -> usize {
        self.len_gauge.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop flows idle for longer than `idle`.
    pub fn sweep(&self, idle: Duration) {
        let cutoff = self.now_ms().saturating_sub(idle.as_millis() as u64);
        let mut flows = self.flows.write().unwrap();
        flows.retain(|_, slot| slot.last_seen_ms.load(Ordering::Relaxed) >= cutoff);
        self.len_gauge.store(flows.len(), Ordering::Relaxed);
    }

    pub fn clear(&self) {
        let mut flows = self.flows.write().unwrap();
        flows.clear();
        self.len_gauge.store(0, Ordering::Relaxed);
    }
}

impl Default for FlowPolicyCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(src_port: u16) -> FlowKey {
        FlowKey {
            protocol: Protocol::Tcp,
            src_ip: Ipv4Addr::new(10, 8, 0, 2),
            src_port,
            dst_ip: Ipv4Addr::new(8, 8, 8, 8),
            dst_port: 443,
        }
    }

    #[test]
    fn test_normalize_exe_path() {
        assert_eq!(
            normalize_exe_path(r"C:\Games\Game.EXE"),
            r"c:\games\game.exe"
        );
        assert_eq!(normalize_exe_path("C:/Games/game.exe"), r"c:\games\game.exe");
    }

    #[test]
    fn test_exclude_mode_decisions() {
        let config = PolicyConfig::new(Mode::Exclude, vec![r"C:\game.exe".to_string()]);
        assert_eq!(
            decide_egress(&config, Some(r"c:\game.exe")),
            Some(Egress::Physical)
        );
        assert_eq!(
            decide_egress(&config, Some(r"c:\browser.exe")),
            Some(Egress::Vpn)
        );
        assert_eq!(decide_egress(&config, None), None);
    }

    #[test]
    fn test_include_mode_decisions() {
        let config = PolicyConfig::new(Mode::Include, vec![r"C:\browser.exe".to_string()]);
        assert_eq!(
            decide_egress(&config, Some(r"c:\browser.exe")),
            Some(Egress::Vpn)
        );
        assert_eq!(
            decide_egress(&config, Some(r"c:\notepad.exe")),
            Some(Egress::Physical)
        );
        assert_eq!(decide_egress(&config, None), None);
    }

    #[test]
    fn test_decision_function_is_pure() {
        let config = PolicyConfig::new(Mode::Exclude, vec![r"C:\game.exe".to_string()]);
        let first = decide_egress(&config, Some(r"c:\game.exe"));
        let second = decide_egress(&config, Some(r"c:\game.exe"));
        assert_eq!(first, second);
    }

    #[test]
    fn test_first_commit_wins() {
        let cache = FlowPolicyCache::new();
        assert_eq!(cache.get(&key(1)), Decision::Unknown);

        let committed = cache.commit(key(1), Decision::RedirectToPhysical);
        assert_eq!(committed, Decision::RedirectToPhysical);

        // A conflicting later commit does not overwrite the flow's decision
        let committed = cache.commit(key(1), Decision::PassThrough);
        assert_eq!(committed, Decision::RedirectToPhysical);
        assert_eq!(cache.get(&key(1)), Decision::RedirectToPhysical);
    }

    #[test]
    fn test_unknown_is_never_stored() {
        let cache = FlowPolicyCache::new();
        assert_eq!(cache.commit(key(2), Decision::Unknown), Decision::Unknown);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_sweep_drops_idle_flows() {
        let cache = FlowPolicyCache::new();
        cache.commit(key(1), Decision::PassThrough);
        cache.commit(key(2), Decision::RedirectToVpn);
        assert_eq!(cache.len(), 2);

        // Nothing is older than an hour
        cache.sweep(Duration::from_secs(3600));
        assert_eq!(cache.len(), 2);

        // Zero idle tolerance clears everything not touched this instant
        std::thread::sleep(Duration::from_millis(5));
        cache.sweep(Duration::from_millis(1));
        assert_eq!(cache.len(), 0);
    }
}
