//! Reverse NAT bookkeeping for redirected flows.
//!
//! When an outbound packet is rewritten onto another adapter, the wire-side
//! 5-tuple no longer matches the socket that sent it. Each redirect records
//! the original source address and delivery interface so the inbound worker
//! can restore replies before the stack sees them (strong host model: both
//! the destination address and the interface must match).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use log::debug;

use crate::engine::packet::Protocol;

/// Idle lifetime of a NAT entry.
pub const NAT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Cadence of the background sweep.
pub const NAT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Hard cap on table size; past this the sweep drops the least recently
/// used half regardless of age.
pub const NAT_MAX_ENTRIES: usize = 50_000;

/// Wire-side identity of a redirected flow.
///
/// `local_ip` is the rewritten source address as it appears on the wire.
/// Outbound packets key as (proto, new_src, src_port, dst, dst_port);
/// inbound replies key as (proto, dst, dst_port, src, src_port), which is
/// the same tuple with the remote side swapped into place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NatKey {
    pub protocol: Protocol,
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
}

impl NatKey {
    /// Key for an outbound packet after source rewrite.
    pub fn outbound(
        protocol: Protocol,
        rewritten_src: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> Self {
        Self {
            protocol,
            local_ip: rewritten_src,
            local_port: src_port,
            remote_ip: dst_ip,
            remote_port: dst_port,
        }
    }

    /// Key for an inbound packet (its destination is the rewritten source).
    pub fn inbound(
        protocol: Protocol,
        dst_ip: Ipv4Addr,
        dst_port: u16,
        src_ip: Ipv4Addr,
        src_port: u16,
    ) -> Self {
        Self {
            protocol,
            local_ip: dst_ip,
            local_port: dst_port,
            remote_ip: src_ip,
            remote_port: src_port,
        }
    }
}

struct NatSlot {
    orig_src: Ipv4Addr,
    orig_ifindex: u32,
    created_ms: u64,
    last_used_ms: AtomicU64,
}

/// Restore target for an inbound packet of a redirected flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatEntry {
    pub orig_src: Ipv4Addr,
    pub orig_ifindex: u32,
}

/// The reverse NAT table.
///
/// Lookups take only the read lock and refresh the entry's idle timer
/// through an atomic; inserts take the write lock only when the key is new.
pub struct NatTable {
    entries: RwLock<HashMap<NatKey, NatSlot>>,
    len_gauge: AtomicUsize,
    epoch: Instant,
}

impl NatTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            len_gauge: AtomicUsize::new(0),
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Insert or refresh the entry for a redirected outbound packet.
    pub fn upsert(&self, key: NatKey, orig_src: Ipv4Addr, orig_ifindex: u32) {
        let now = self.now_ms();

        {
            let entries = self.entries.read().unwrap();
            if let Some(slot) = entries.get(&key) {
                slot.last_used_ms.store(now, Ordering::Relaxed);
                return;
            }
        }

        let mut entries = self.entries.write().unwrap();
        entries.entry(key).or_insert_with(|| NatSlot {
            orig_src,
            orig_ifindex,
            created_ms: now,
            last_used_ms: AtomicU64::new(now),
        });
        self.len_gauge.store(entries.len(), Ordering::Relaxed);
    }

    /// Restore target for an inbound packet, refreshing the entry's TTL.
    pub fn lookup(&self, key: &NatKey) -> Option<NatEntry> {
        let entries = self.entries.read().unwrap();
        entries.get(key).map(|slot| {
            slot.last_used_ms.store(self.now_ms(), Ordering::Relaxed);
            NatEntry {
                orig_src: slot.orig_src,
                orig_ifindex: slot.orig_ifindex,
            }
        })
    }

    /// Number of live entries, readable without the lock.
    pub fn len(&self) -> usize {
        self.len_gauge.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop idle entries; if the table is still over the cap afterwards,
    /// drop the least recently used half.
    pub fn sweep(&self) {
        let cutoff = self
            .now_ms()
            .saturating_sub(NAT_IDLE_TIMEOUT.as_millis() as u64);

        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, slot| slot.last_used_ms.load(Ordering::Relaxed) >= cutoff);

        if entries.len() > NAT_MAX_ENTRIES {
            let mut by_age: Vec<(NatKey, u64)> = entries
                .iter()
                .map(|(k, slot)| (*k, slot.last_used_ms.load(Ordering::Relaxed)))
                .collect();
            by_age.sort_by_key(|&(_, used)| used);
            for (key, _) in by_age.iter().take(by_age.len() / 2) {
                entries.remove(key);
            }
        }

        if entries.len() != before {
            debug!("NAT sweep: {} -> {} entries", before, entries.len());
        }
        self.len_gauge.store(entries.len(), Ordering::Relaxed);
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap();
        entries.clear();
        self.len_gauge.store(0, Ordering::Relaxed);
    }

    /// Creation timestamp of an entry, for diagnostics and tests.
    pub fn created_at_ms(&self, key: &NatKey) -> Option<u64> {
        self.entries.read().unwrap().get(key).map(|s| s.created_ms)
    }
}

impl Default for NatTable {
    fn default() -> Self {
        Self::new()
    }
}
