//! Adapter inventory.
//!
//! Resolves the VPN tunnel adapter, the physical default adapter and the
//! real upstream gateway once per session. The physical adapter is the one
//! carrying the lowest-metric default route that is not tunnel-class; the
//! VPN adapter is an active tunnel-class interface with an address of its
//! own. A mid-session adapter change is not handled here; it surfaces as a
//! session fault.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use log::{debug, info};
use serde::Serialize;
use windows::Win32::NetworkManagement::IpHelper::{GetAdaptersInfo, IP_ADAPTER_INFO};

use crate::engine::{EngineError, EngineResult};
use crate::utils::hidden_command;

/// Name/description fragments that identify tunnel-class adapters.
const TUNNEL_ADAPTER_PATTERNS: &[&str] =
    &["tap", "tun", "wintun", "wireguard", "openvpn", "vpn"];

/// Role of an adapter within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterRole {
    Vpn,
    Physical,
}

/// One resolved adapter. Immutable for the session's lifetime.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub ip: Ipv4Addr,
    pub ifindex: u32,
    pub role: AdapterRole,
}

/// Result of a successful discovery
#[derive(Debug, Clone)]
pub struct AdapterSet {
    pub vpn: AdapterInfo,
    pub physical: AdapterInfo,
    pub gateway: Ipv4Addr,
}

#[derive(Debug)]
struct RawAdapter {
    description: String,
    ifindex: u32,
    ip: Ipv4Addr,
}

#[derive(Debug, Clone, Copy)]
struct DefaultRoute {
    ifindex: u32,
    next_hop: Ipv4Addr,
    metric: u32,
}

/// Discover the session's adapters and the physical gateway.
pub fn discover() -> EngineResult<AdapterSet> {
    let routes = default_routes()?;
    let adapters = enumerate_adapters()?;

    for a in &adapters {
        debug!(
            "Adapter if {}: '{}' ip {} (tunnel-class: {})",
            a.ifindex,
            a.description,
            a.ip,
            is_tunnel_class(&a.description)
        );
    }

    // Physical side: lowest-metric default route on a non-tunnel adapter.
    // Routes arrive sorted by metric.
    let mut physical: Option<(&RawAdapter, DefaultRoute)> = None;
    for route in &routes {
        if let Some(adapter) = adapters.iter().find(|a| a.ifindex == route.ifindex) {
            if !is_tunnel_class(&adapter.description) && adapter.ip != Ipv4Addr::UNSPECIFIED {
                physical = Some((adapter, *route));
                break;
            }
        }
    }

    let (phys_adapter, phys_route) = physical.ok_or_else(|| {
        EngineError::AdapterDiscovery(
            "no default route on a physical (non-tunnel) adapter".to_string(),
        )
    })?;

    // VPN side: active tunnel-class adapters that are not the physical one
    let candidates: Vec<&RawAdapter> = adapters
        .iter()
        .filter(|a| {
            is_tunnel_class(&a.description)
                && a.ip != Ipv4Addr::UNSPECIFIED
                && a.ifindex != phys_adapter.ifindex
        })
        .collect();

    let vpn_adapter = match candidates.len() {
        0 => {
            return Err(EngineError::AdapterDiscovery(
                "no active tunnel adapter with an IPv4 address".to_string(),
            ))
        }
        1 => candidates[0],
        _ => pick_vpn_candidate(&candidates, &routes)?,
    };

    let set = AdapterSet {
        vpn: AdapterInfo {
            name: vpn_adapter.description.clone(),
            ip: vpn_adapter.ip,
            ifindex: vpn_adapter.ifindex,
            role: AdapterRole::Vpn,
        },
        physical: AdapterInfo {
            name: phys_adapter.description.clone(),
            ip: phys_adapter.ip,
            ifindex: phys_adapter.ifindex,
            role: AdapterRole::Physical,
        },
        gateway: phys_route.next_hop,
    };

    info!(
        "Discovered adapters: vpn '{}' {} (if {}), physical '{}' {} (if {}), gateway {}",
        set.vpn.name,
        set.vpn.ip,
        set.vpn.ifindex,
        set.physical.name,
        set.physical.ip,
        set.physical.ifindex,
        set.gateway
    );

    Ok(set)
}

/// Poll for a tunnel adapter to come up, for callers that start the engine
/// right after connecting their VPN.
pub fn wait_for_vpn_adapter(timeout: Duration) -> EngineResult<AdapterSet> {
    let deadline = Instant::now() + timeout;
    loop {
        match discover() {
            Ok(set) => return Ok(set),
            Err(e) if Instant::now() >= deadline => return Err(e),
            Err(_) => std::thread::sleep(Duration::from_millis(500)),
        }
    }
}

/// Break a multi-candidate tie by the lowest default-route metric.
fn pick_vpn_candidate<'a>(
    candidates: &[&'a RawAdapter],
    routes: &[DefaultRoute],
) -> EngineResult<&'a RawAdapter> {
    let metric_of = |a: &RawAdapter| -> u32 {
        routes
            .iter()
            .filter(|r| r.ifindex == a.ifindex)
            .map(|r| r.metric)
            .min()
            .unwrap_or(u32::MAX)
    };

    let Some(best) = candidates.iter().min_by_key(|a| metric_of(a)).copied() else {
        return Err(EngineError::AdapterDiscovery(
            "no tunnel adapter candidates".to_string(),
        ));
    };

    let best_metric = metric_of(best);
    let tied = candidates
        .iter()
        .filter(|a| metric_of(a) == best_metric)
        .count();

    if tied > 1 {
        let names: Vec<&str> = candidates.iter().map(|a| a.description.as_str()).collect();
        return Err(EngineError::AmbiguousAdapter(names.join(", ")));
    }

    Ok(best)
}

fn is_tunnel_class(description: &str) -> bool {
    let lower = description.to_lowercase();
    TUNNEL_ADAPTER_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Walk the `GetAdaptersInfo` list into owned rows.
fn enumerate_adapters() -> EngineResult<Vec<RawAdapter>> {
    unsafe {
        let mut len: u32 = 0;
        let _ = GetAdaptersInfo(None, &mut len);

        if len == 0 {
            return Err(EngineError::AdapterDiscovery(
                "GetAdaptersInfo reported no adapters".to_string(),
            ));
        }

        let mut buffer: Vec<u8> = vec![0; len as usize];
        let info_ptr = buffer.as_mut_ptr() as *mut IP_ADAPTER_INFO;

        let result = GetAdaptersInfo(Some(info_ptr), &mut len);
        if result != 0 {
            return Err(EngineError::AdapterDiscovery(format!(
                "GetAdaptersInfo failed: 0x{result:08X}"
            )));
        }

        let mut out = Vec::new();
        let mut current = info_ptr;
        while !current.is_null() {
            let adapter = &*current;

            let description = c_chars_to_string(&adapter.Description);
            let ip = c_chars_to_string(&adapter.IpAddressList.IpAddress.String)
                .parse()
                .unwrap_or(Ipv4Addr::UNSPECIFIED);

            out.push(RawAdapter {
                description,
                ifindex: adapter.Index,
                ip,
            });

            current = adapter.Next;
        }

        Ok(out)
    }
}

/// Default routes (0.0.0.0/0 with a real next hop), sorted by metric.
fn default_routes() -> EngineResult<Vec<DefaultRoute>> {
    let output = hidden_command("powershell")
        .args([
            "-NoProfile",
            "-Command",
            r#"Get-NetRoute -DestinationPrefix '0.0.0.0/0' -ErrorAction SilentlyContinue |
               Where-Object { $_.NextHop -ne '0.0.0.0' } |
               Sort-Object RouteMetric |
               Select-Object NextHop,InterfaceIndex,RouteMetric |
               ConvertTo-Json"#,
        ])
        .output()
        .map_err(|e| EngineError::AdapterDiscovery(format!("failed to run PowerShell: {e}")))?;

    if !output.status.success() {
        return Err(EngineError::AdapterDiscovery(
            "Get-NetRoute query failed".to_string(),
        ));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(EngineError::AdapterDiscovery(
            "no default route present".to_string(),
        ));
    }

    let json: serde_json::Value = serde_json::from_str(trimmed)
        .map_err(|e| EngineError::AdapterDiscovery(format!("bad route JSON: {e}")))?;

    // ConvertTo-Json yields a bare object for a single route
    let rows: Vec<&serde_json::Value> = match &json {
        serde_json::Value::Array(items) => items.iter().collect(),
        single => vec![single],
    };

    let mut routes = Vec::with_capacity(rows.len());
    for row in rows {
        let next_hop = row
            .get("NextHop")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok());
        let ifindex = row.get("InterfaceIndex").and_then(|v| v.as_u64());
        let metric = row.get("RouteMetric").and_then(|v| v.as_u64()).unwrap_or(0);

        if let (Some(next_hop), Some(ifindex)) = (next_hop, ifindex) {
            routes.push(DefaultRoute {
                ifindex: ifindex as u32,
                next_hop,
                metric: metric as u32,
            });
        }
    }

    if routes.is_empty() {
        return Err(EngineError::AdapterDiscovery(
            "no parsable default route".to_string(),
        ));
    }

    Ok(routes)
}

fn c_chars_to_string(chars: &[i8]) -> String {
    let bytes: Vec<u8> = chars
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as u8)
        .collect();
    String::from_utf8_lossy(&bytes).trim().to_string()
}
