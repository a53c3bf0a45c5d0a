//! Connection table snapshots.
//!
//! A background worker rebuilds two endpoint-to-executable maps from the OS
//! connection tables every tick and publishes them as one immutable pair
//! through an atomic swap. Readers on the packet hot path load the current
//! pair and use it without any locks; both maps always originate from the
//! same tick.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use arc_swap::ArcSwap;

/// Tracker tick cadence.
pub const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);

/// Consecutive failed ticks tolerated before the session is faulted.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// One immutable pair of lookup maps built from a single table snapshot.
#[derive(Debug, Default)]
pub struct ConnMaps {
    by_endpoint: HashMap<(Ipv4Addr, u16), Arc<str>>,
    by_port: HashMap<u16, Arc<str>>,
    /// Tick the pair was built on; diagnostics only.
    pub tick: u64,
}

impl ConnMaps {
    pub fn with_tick(tick: u64) -> Self {
        Self {
            by_endpoint: HashMap::with_capacity(512),
            by_port: HashMap::with_capacity(512),
            tick,
        }
    }

    /// Index one local socket. Sockets bound to 0.0.0.0 are additionally
    /// indexed under each alias address (the session's adapter addresses)
    /// because intercepted packets carry a concrete interface IP.
    pub fn insert(
        &mut self,
        local_ip: Ipv4Addr,
        local_port: u16,
        exe: Arc<str>,
        aliases: &[Ipv4Addr],
    ) {
        if local_ip == Ipv4Addr::UNSPECIFIED {
            for &alias in aliases {
                self.by_endpoint
                    .insert((alias, local_port), Arc::clone(&exe));
            }
        }
        self.by_endpoint
            .insert((local_ip, local_port), Arc::clone(&exe));
        self.by_port.insert(local_port, exe);
    }

    /// Owner of a local endpoint: exact (ip, port) first, then the
    /// port-only fallback. The fallback matters for retransmits whose
    /// observed source has already been rewritten.
    pub fn lookup(&self, local_ip: Ipv4Addr, local_port: u16) -> Option<Arc<str>> {
        self.by_endpoint
            .get(&(local_ip, local_port))
            .or_else(|| self.by_port.get(&local_port))
            .map(Arc::clone)
    }

    pub fn endpoint_count(&self) -> usize {
        self.by_endpoint.len()
    }

    pub fn port_count(&self) -> usize {
        self.by_port.len()
    }
}

/// Shared slot holding the current `ConnMaps` pair.
///
/// Single writer (the tracker), many readers (the interceptors). Readers
/// hold the returned Arc for the duration of one packet; old pairs are
/// reclaimed when the last reader drops its reference.
pub struct ConnTable {
    current: ArcSwap<ConnMaps>,
}

impl ConnTable {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(ConnMaps::default()),
        }
    }

    /// Current pair. Lock-free.
    pub fn load(&self) -> Arc<ConnMaps> {
        self.current.load_full()
    }

    /// Publish a freshly built pair.
    pub fn publish(&self, maps: ConnMaps) {
        self.current.store(Arc::new(maps));
    }
}

impl Default for ConnTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(windows)]
pub(crate) mod worker {
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Instant;

    use log::{info, warn};

    use super::{ConnMaps, ConnTable, MAX_CONSECUTIVE_FAILURES, TICK_INTERVAL};
    use crate::engine::port_lookup::{read_tcp_rows, read_udp_rows};
    use crate::engine::process::PidCache;
    use crate::engine::session::SessionShared;
    use crate::engine::EngineResult;

    /// Tracker loop: rebuild and publish the maps every tick. A failed tick
    /// keeps the previous snapshot current; three consecutive failures
    /// fault the session.
    pub(crate) fn run_tracker(
        table: Arc<ConnTable>,
        pids: Arc<PidCache>,
        aliases: [Ipv4Addr; 2],
        shared: Arc<SessionShared>,
    ) {
        info!("Connection tracker started");

        let mut tick: u64 = 0;
        let mut failures: u32 = 0;

        while !shared.stopping() {
            let started = Instant::now();
            tick += 1;

            match build_snapshot(tick, &pids, &aliases) {
                Ok(maps) => {
                    table.publish(maps);
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    warn!("Connection tracker tick failed ({failures} consecutive): {e}");
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        shared.fault(format!(
                            "connection table query failed {failures} times in a row: {e}"
                        ));
                        break;
                    }
                }
            }

            let elapsed = started.elapsed();
            if elapsed < TICK_INTERVAL {
                std::thread::sleep(TICK_INTERVAL - elapsed);
            }
        }

        info!("Connection tracker stopped");
    }

    fn build_snapshot(
        tick: u64,
        pids: &PidCache,
        aliases: &[Ipv4Addr; 2],
    ) -> EngineResult<ConnMaps> {
        let tcp = read_tcp_rows()?;
        let udp = read_udp_rows()?;

        let mut maps = ConnMaps::with_tick(tick);
        let mut alive: HashSet<u32> = HashSet::with_capacity(tcp.len() + udp.len());

        for row in tcp.iter().chain(udp.iter()) {
            if row.pid == 0 {
                continue;
            }
            alive.insert(row.pid);
            let Some(exe) = pids.resolve(row.pid) else {
                continue;
            };
            maps.insert(row.local_ip, row.local_port, exe, aliases);
        }

        pids.retain_alive(&alive);
        Ok(maps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exe(path: &str) -> Arc<str> {
        Arc::from(path)
    }

    #[test]
    fn test_lookup_prefers_exact_endpoint() {
        let mut maps = ConnMaps::with_tick(1);
        maps.insert(
            Ipv4Addr::new(10, 8, 0, 2),
            50001,
            exe("c:\\game.exe"),
            &[],
        );
        maps.insert(
            Ipv4Addr::new(192, 168, 1, 50),
            50001,
            exe("c:\\other.exe"),
            &[],
        );

        let hit = maps.lookup(Ipv4Addr::new(10, 8, 0, 2), 50001).unwrap();
        assert_eq!(&*hit, "c:\\game.exe");
    }

    #[test]
    fn test_lookup_falls_back_to_port() {
        let mut maps = ConnMaps::with_tick(1);
        maps.insert(Ipv4Addr::new(10, 8, 0, 2), 50001, exe("c:\\game.exe"), &[]);

        // Source was already rewritten; only the port still matches
        let hit = maps.lookup(Ipv4Addr::new(192, 168, 1, 50), 50001).unwrap();
        assert_eq!(&*hit, "c:\\game.exe");
        assert!(maps.lookup(Ipv4Addr::new(192, 168, 1, 50), 1).is_none());
    }

    #[test]
    fn test_wildcard_bind_indexed_under_aliases() {
        let aliases = [Ipv4Addr::new(10, 8, 0, 2), Ipv4Addr::new(192, 168, 1, 50)];
        let mut maps = ConnMaps::with_tick(1);
        maps.insert(Ipv4Addr::UNSPECIFIED, 50001, exe("c:\\game.exe"), &aliases);

        for alias in aliases {
            let hit = maps.lookup(alias, 50001).unwrap();
            assert_eq!(&*hit, "c:\\game.exe");
        }
    }

    #[test]
    fn test_publish_swaps_whole_pair() {
        let table = ConnTable::new();
        assert_eq!(table.load().tick, 0);

        let mut maps = ConnMaps::with_tick(7);
        maps.insert(Ipv4Addr::new(10, 0, 0, 1), 80, exe("c:\\srv.exe"), &[]);
        table.publish(maps);

        let loaded = table.load();
        assert_eq!(loaded.tick, 7);
        assert!(loaded.lookup(Ipv4Addr::new(10, 0, 0, 1), 80).is_some());
    }

    #[test]
    fn test_concurrent_readers_see_consistent_pairs() {
        use std::thread;

        // Each published pair encodes its tick in both maps; a torn pair
        // would show different values through the two lookup paths.
        let table = Arc::new(ConnTable::new());

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for _ in 0..2000 {
                        let maps = table.load();
                        if maps.tick == 0 {
                            continue;
                        }
                        let via_endpoint = maps
                            .lookup(Ipv4Addr::new(127, 0, 0, 1), 9)
                            .expect("published pair missing endpoint entry");
                        let via_port =
                            maps.lookup(Ipv4Addr::new(9, 9, 9, 9), 9).expect("port entry");
                        assert_eq!(via_endpoint, via_port);
                        assert_eq!(&*via_endpoint, format!("exe-{}", maps.tick).as_str());
                    }
                })
            })
            .collect();

        let writer = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for tick in 1..200u64 {
                    let mut maps = ConnMaps::with_tick(tick);
                    maps.insert(
                        Ipv4Addr::new(127, 0, 0, 1),
                        9,
                        Arc::from(format!("exe-{tick}").as_str()),
                        &[],
                    );
                    table.publish(maps);
                }
            })
        };

        for r in readers {
            r.join().expect("reader panicked");
        }
        writer.join().expect("writer panicked");
    }
}
