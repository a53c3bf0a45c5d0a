//! Host route overrides for redirected traffic.
//!
//! While a VPN holds the default route, packets redirected onto the
//! physical adapter still need a valid path through the real gateway. Two
//! half-space routes (0.0.0.0/1 and 128.0.0.0/1) provide it; their metric
//! of 9999 keeps them out of the way for every packet the engine does not
//! redirect.

use std::net::Ipv4Addr;

use log::{info, warn};

use crate::engine::{EngineError, EngineResult};
use crate::utils::hidden_command;

/// Metric for the override routes.
pub const OVERRIDE_METRIC: u32 = 9999;

/// Half-space destinations, both with mask 128.0.0.0.
const HALF_SPACE_DESTINATIONS: [Ipv4Addr; 2] =
    [Ipv4Addr::new(0, 0, 0, 0), Ipv4Addr::new(128, 0, 0, 0)];
const HALF_SPACE_MASK: Ipv4Addr = Ipv4Addr::new(128, 0, 0, 0);

/// One installed route override, kept for rollback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteHandle {
    pub destination: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub ifindex: u32,
    pub metric: u32,
}

/// Tracks the override routes this session added to the host.
pub struct RouteManager {
    installed: Vec<RouteHandle>,
}

impl RouteManager {
    pub fn new() -> Self {
        Self {
            installed: Vec::new(),
        }
    }

    /// Install both half-space routes via the physical gateway.
    ///
    /// If the second route fails, the first is removed before the error is
    /// returned; install never leaves a partial set behind.
    pub fn install(
        &mut self,
        gateway: Ipv4Addr,
        ifindex: u32,
    ) -> EngineResult<Vec<RouteHandle>> {
        for destination in HALF_SPACE_DESTINATIONS {
            let handle = RouteHandle {
                destination,
                mask: HALF_SPACE_MASK,
                gateway,
                ifindex,
                metric: OVERRIDE_METRIC,
            };

            match route_add(&handle) {
                Ok(()) => {
                    info!(
                        "Added route {}/{} via {} IF {} metric {}",
                        handle.destination, handle.mask, handle.gateway, handle.ifindex,
                        handle.metric
                    );
                    self.installed.push(handle);
                }
                Err(e) => {
                    warn!("Route install failed, rolling back partial set: {e}");
                    self.remove_all();
                    return Err(e);
                }
            }
        }

        Ok(self.installed.clone())
    }

    /// Remove every installed route. Idempotent and best-effort: each
    /// handle is attempted independently and failures only log.
    pub fn remove_all(&mut self) {
        let handles: Vec<RouteHandle> = self.installed.drain(..).collect();
        let total = handles.len();
        let mut failures = 0;

        for handle in &handles {
            match route_delete(handle) {
                Ok(()) => info!(
                    "Removed route {}/{} via {}",
                    handle.destination, handle.mask, handle.gateway
                ),
                Err(e) => {
                    failures += 1;
                    warn!(
                        "Failed to remove route {}/{}: {e}",
                        handle.destination, handle.mask
                    );
                }
            }
        }

        if total > 0 && failures > 0 {
            warn!("Route cleanup: {failures}/{total} removals failed");
        }
    }

    pub fn installed(&self) -> &[RouteHandle] {
        &self.installed
    }
}

impl Default for RouteManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RouteManager {
    fn drop(&mut self) {
        self.remove_all();
    }
}

fn route_add(handle: &RouteHandle) -> EngineResult<()> {
    let output = hidden_command("route")
        .args([
            "add",
            &handle.destination.to_string(),
            "mask",
            &handle.mask.to_string(),
            &handle.gateway.to_string(),
            "metric",
            &handle.metric.to_string(),
            "IF",
            &handle.ifindex.to_string(),
        ])
        .output()
        .map_err(|e| EngineError::RouteInstall(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EngineError::RouteInstall(format!(
            "route add {} failed: {}",
            handle.destination,
            stderr.trim()
        )));
    }

    Ok(())
}

fn route_delete(handle: &RouteHandle) -> EngineResult<()> {
    let output = hidden_command("route")
        .args([
            "delete",
            &handle.destination.to_string(),
            "mask",
            &handle.mask.to_string(),
            &handle.gateway.to_string(),
            "IF",
            &handle.ifindex.to_string(),
        ])
        .output()
        .map_err(|e| EngineError::RouteInstall(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EngineError::RouteInstall(format!(
            "route delete {} failed: {}",
            handle.destination,
            stderr.trim()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_all_on_empty_manager_is_noop() {
        let mut mgr = RouteManager::new();
        mgr.remove_all();
        mgr.remove_all();
        assert!(mgr.installed().is_empty());
    }

    #[test]
    fn test_half_space_destinations() {
        assert_eq!(HALF_SPACE_DESTINATIONS[0], Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(HALF_SPACE_DESTINATIONS[1], Ipv4Addr::new(128, 0, 0, 0));
        assert_eq!(HALF_SPACE_MASK, Ipv4Addr::new(128, 0, 0, 0));
    }
}
