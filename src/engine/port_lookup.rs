//! Synchronous local-port ownership lookup.
//!
//! The background tracker only knows connections that existed at its last
//! tick, so the first SYN of a brand-new flow always misses it. These
//! helpers query the IPv4 TCP/UDP owner tables directly so the owning
//! process can be identified the moment a packet is intercepted.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::warn;
use windows::Win32::Foundation::{ERROR_INSUFFICIENT_BUFFER, NO_ERROR};
use windows::Win32::NetworkManagement::IpHelper::{
    GetExtendedTcpTable, GetExtendedUdpTable, MIB_TCPTABLE_OWNER_PID, MIB_UDPTABLE_OWNER_PID,
    TCP_TABLE_CLASS, TCP_TABLE_OWNER_PID_ALL, UDP_TABLE_CLASS, UDP_TABLE_OWNER_PID,
};

use crate::engine::packet::Protocol;
use crate::engine::process::PidCache;
use crate::engine::{EngineError, EngineResult};

/// A row of the IPv4 connection owner tables
#[derive(Debug, Clone, Copy)]
pub struct PortRow {
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub pid: u32,
}

/// Lifetime of a burst-cache entry; absorbs the packet burst of a new flow
/// until the tracker's next tick indexes it.
const BURST_CACHE_TTL: Duration = Duration::from_millis(500);

/// Wall-clock budget for one synchronous table query.
const QUERY_BUDGET: Duration = Duration::from_millis(50);

/// Burst-cache bound; cleared wholesale when exceeded.
const BURST_CACHE_MAX: usize = 1024;

const AF_INET: u32 = 2;

/// Read the IPv4 TCP owner table.
pub fn read_tcp_rows() -> EngineResult<Vec<PortRow>> {
    unsafe {
        let mut size: u32 = 0;
        let mut result = GetExtendedTcpTable(
            None,
            &mut size,
            false,
            AF_INET,
            TCP_TABLE_CLASS(TCP_TABLE_OWNER_PID_ALL.0),
            0,
        );

        if result != ERROR_INSUFFICIENT_BUFFER.0 && result != NO_ERROR.0 {
            return Err(EngineError::TableQuery(format!(
                "GetExtendedTcpTable size query failed: 0x{result:08X}"
            )));
        }

        if size == 0 {
            return Ok(Vec::new());
        }

        // The table can grow between the size query and the read
        let mut buffer = vec![0u8; size as usize];
        for _ in 0..3 {
            result = GetExtendedTcpTable(
                Some(buffer.as_mut_ptr() as *mut _),
                &mut size,
                false,
                AF_INET,
                TCP_TABLE_CLASS(TCP_TABLE_OWNER_PID_ALL.0),
                0,
            );
            if result != ERROR_INSUFFICIENT_BUFFER.0 {
                break;
            }
            buffer.resize(size as usize, 0);
        }

        if result != NO_ERROR.0 {
            return Err(EngineError::TableQuery(format!(
                "GetExtendedTcpTable failed: 0x{result:08X}"
            )));
        }

        let table = &*(buffer.as_ptr() as *const MIB_TCPTABLE_OWNER_PID);
        let entries =
            std::slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize);

        Ok(entries
            .iter()
            .map(|entry| PortRow {
                local_ip: Ipv4Addr::from(entry.dwLocalAddr.to_ne_bytes()),
                local_port: u16::from_be(entry.dwLocalPort as u16),
                pid: entry.dwOwningPid,
            })
            .collect())
    }
}

/// Read the IPv4 UDP owner table.
pub fn read_udp_rows() -> EngineResult<Vec<PortRow>> {
    unsafe {
        let mut size: u32 = 0;
        let mut result = GetExtendedUdpTable(
            None,
            &mut size,
            false,
            AF_INET,
            UDP_TABLE_CLASS(UDP_TABLE_OWNER_PID.0),
            0,
        );

        if result != ERROR_INSUFFICIENT_BUFFER.0 && result != NO_ERROR.0 {
            return Err(EngineError::TableQuery(format!(
                "GetExtendedUdpTable size query failed: 0x{result:08X}"
            )));
        }

        if size == 0 {
            return Ok(Vec::new());
        }

        let mut buffer = vec![0u8; size as usize];
        for _ in 0..3 {
            result = GetExtendedUdpTable(
                Some(buffer.as_mut_ptr() as *mut _),
                &mut size,
                false,
                AF_INET,
                UDP_TABLE_CLASS(UDP_TABLE_OWNER_PID.0),
                0,
            );
            if result != ERROR_INSUFFICIENT_BUFFER.0 {
                break;
            }
            buffer.resize(size as usize, 0);
        }

        if result != NO_ERROR.0 {
            return Err(EngineError::TableQuery(format!(
                "GetExtendedUdpTable failed: 0x{result:08X}"
            )));
        }

        let table = &*(buffer.as_ptr() as *const MIB_UDPTABLE_OWNER_PID);
        let entries =
            std::slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize);

        Ok(entries
            .iter()
            .map(|entry| PortRow {
                local_ip: Ipv4Addr::from(entry.dwLocalAddr.to_ne_bytes()),
                local_port: u16::from_be(entry.dwLocalPort as u16),
                pid: entry.dwOwningPid,
            })
            .collect())
    }
}

/// On-demand resolver from local endpoint to owning executable.
pub struct PortResolver {
    pids: Arc<PidCache>,
    recent: Mutex<HashMap<(Protocol, u16), (Option<Arc<str>>, Instant)>>,
}

impl PortResolver {
    pub fn new(pids: Arc<PidCache>) -> Self {
        Self {
            pids,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the executable owning `local_ip:local_port`.
    ///
    /// Hits and misses are both cached for a short window; the window is
    /// well under the tracker tick, so a stale miss only lasts until the
    /// flow would have been indexed anyway.
    pub fn resolve(
        &self,
        protocol: Protocol,
        local_ip: Ipv4Addr,
        local_port: u16,
    ) -> Option<Arc<str>> {
        {
            let recent = self.recent.lock().unwrap();
            if let Some((cached, at)) = recent.get(&(protocol, local_port)) {
                if at.elapsed() < BURST_CACHE_TTL {
                    return cached.clone();
                }
            }
        }

        let started = Instant::now();
        let rows = match protocol {
            Protocol::Tcp => read_tcp_rows(),
            Protocol::Udp => read_udp_rows(),
        };

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Synchronous port lookup failed: {e}");
                return None;
            }
        };

        if started.elapsed() > QUERY_BUDGET {
            warn!(
                "Port table query took {:?}, over the {:?} budget; treating as not found",
                started.elapsed(),
                QUERY_BUDGET
            );
            self.cache(protocol, local_port, None);
            return None;
        }

        let pid = rows
            .iter()
            .find(|row| {
                row.local_port == local_port
                    && (row.local_ip == local_ip || row.local_ip == Ipv4Addr::UNSPECIFIED)
            })
            .map(|row| row.pid)
            .filter(|&pid| pid != 0);

        let exe = pid.and_then(|pid| self.pids.resolve(pid));
        self.cache(protocol, local_port, exe.clone());
        exe
    }

    fn cache(&self, protocol: Protocol, local_port: u16, exe: Option<Arc<str>>) {
        let mut recent = self.recent.lock().unwrap();
        if recent.len() >= BURST_CACHE_MAX {
            recent.clear();
        }
        recent.insert((protocol, local_port), (exe, Instant::now()));
    }
}
