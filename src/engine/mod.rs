//! Split tunneling engine
//!
//! Architecture:
//! - adapter.rs: VPN / physical adapter discovery
//! - routes.rs: half-space override routes via the physical gateway
//! - tracker.rs: periodic connection-table snapshots, published by atomic swap
//! - process.rs: PID to executable path resolution with a bounded cache
//! - port_lookup.rs: synchronous port-owner lookup for brand-new flows
//! - policy.rs: routing mode, target set and per-flow decisions
//! - nat.rs: reverse NAT table for redirected flows
//! - packet.rs: IPv4 packet parsing and in-place rewriting
//! - interceptor.rs: outbound / inbound packet worker loops
//! - session.rs: session lifecycle and the public engine API

pub mod nat;
pub mod packet;
pub mod policy;
pub mod process;
pub mod tracker;

#[cfg(windows)]
pub mod adapter;
#[cfg(windows)]
pub mod interceptor;
#[cfg(windows)]
pub mod port_lookup;
#[cfg(windows)]
pub mod routes;
#[cfg(windows)]
pub mod session;

pub use nat::NatTable;
pub use packet::{PacketInfo, Protocol};
pub use policy::{Decision, FlowPolicyCache, Mode, PolicyConfig};

#[cfg(windows)]
pub use adapter::{AdapterInfo, AdapterRole, AdapterSet};
#[cfg(windows)]
pub use session::{SplitSession, StatsSnapshot};

/// Engine-level errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Adapter discovery failed: {0}")]
    AdapterDiscovery(String),

    #[error("Ambiguous adapter candidates: {0}")]
    AmbiguousAdapter(String),

    #[error("Route install failed: {0}")]
    RouteInstall(String),

    #[error("Failed to open packet source: {0}")]
    PacketSourceOpen(String),

    #[error("Connection table query failed: {0}")]
    TableQuery(String),

    #[error("Packet rewrite failed: {0}")]
    PacketRewrite(String),

    #[error("Session fault: {0}")]
    SessionFault(String),

    #[error("Administrator privileges required")]
    NotElevated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
