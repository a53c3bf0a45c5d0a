//! PID to executable path resolution.
//!
//! Every packet classification ends in a PID-to-path lookup, so results are
//! cached. The cache is bounded FIFO: at capacity the oldest entry is
//! evicted. The connection tracker prunes entries for processes that no
//! longer own any connection, which keeps recycled PIDs from resolving to a
//! dead process's path.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

use crate::engine::policy::normalize_exe_path;

/// Cache bound; oldest entries are evicted first.
pub const PID_CACHE_CAPACITY: usize = 4096;

struct Inner {
    system: System,
    paths: HashMap<u32, Arc<str>>,
    order: VecDeque<u32>,
}

/// Bounded PID -> normalized executable path cache.
///
/// Shared between the connection tracker (5 Hz) and the synchronous port
/// resolver; contention on the single lock is negligible at those rates.
pub struct PidCache {
    inner: Mutex<Inner>,
}

impl PidCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                system: System::new(),
                paths: HashMap::with_capacity(256),
                order: VecDeque::with_capacity(256),
            }),
        }
    }

    /// Resolve a PID to its normalized executable path.
    ///
    /// Misses query the OS process table for just that PID. Failures are
    /// not cached; a process that denies access now may be resolvable on a
    /// later attempt.
    pub fn resolve(&self, pid: u32) -> Option<Arc<str>> {
        if pid == 0 {
            return None;
        }

        let mut inner = self.inner.lock().unwrap();

        if let Some(path) = inner.paths.get(&pid) {
            return Some(Arc::clone(path));
        }

        inner.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
            true,
            ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet),
        );

        let raw = inner
            .system
            .process(Pid::from_u32(pid))
            .and_then(|p| p.exe())
            .map(|p| p.to_string_lossy().into_owned())?;

        let path: Arc<str> = Arc::from(normalize_exe_path(&raw));
        Self::remember(&mut inner, pid, Arc::clone(&path));
        Some(path)
    }

    fn remember(inner: &mut Inner, pid: u32, path: Arc<str>) {
        if inner.paths.len() >= PID_CACHE_CAPACITY {
            if let Some(oldest) = inner.order.pop_front() {
                inner.paths.remove(&oldest);
            }
        }
        if inner.paths.insert(pid, path).is_none() {
            inner.order.push_back(pid);
        }
    }

    /// Forget processes that no longer own any connection.
    pub fn retain_alive(&self, alive: &HashSet<u32>) {
        let mut inner = self.inner.lock().unwrap();
        inner.paths.retain(|pid, _| alive.contains(pid));
        inner.order.retain(|pid| alive.contains(pid));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PidCache {
    fn default() -> Self {
        Self::new()
    }
}
