//! Packet interception workers.
//!
//! Two threads own the filtered packet handles: one consumes the outbound
//! stream, one the inbound stream. Outbound packets are identified, decided
//! and rewritten; inbound packets are restored through the NAT table. Every
//! packet a worker receives is reinjected (changed or unchanged) or
//! discarded with a counted reason; per-packet errors never escape the
//! loop.

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use log::{info, warn};
use windivert::prelude::*;

use crate::engine::adapter::AdapterInfo;
use crate::engine::nat::{NatKey, NatTable};
use crate::engine::packet::{self, PacketInfo};
use crate::engine::policy::{decide_egress, Decision, Egress, FlowKey, FlowPolicyCache, PolicyConfig};
use crate::engine::port_lookup::PortResolver;
use crate::engine::session::SessionShared;
use crate::engine::tracker::ConnTable;
use crate::engine::{EngineError, EngineResult};

/// Kernel-level filters; loopback traffic never reaches the workers.
pub const OUTBOUND_FILTER: &str = "outbound and ip and (tcp or udp) and not loopback";
pub const INBOUND_FILTER: &str = "inbound and ip and (tcp or udp) and not loopback";

const OUTBOUND_PRIORITY: i16 = 100;
const INBOUND_PRIORITY: i16 = 200;

/// Largest packet the driver will hand us.
const RECV_BUFFER_SIZE: usize = 65535;

/// Consecutive receive errors tolerated before the session is faulted.
/// Transient errors happen; a stream of them means the handle is dead.
const MAX_RECV_ERRORS: u32 = 16;

/// Everything a worker needs, shared with the session.
#[derive(Clone)]
pub(crate) struct InterceptCtx {
    pub policy: Arc<ArcSwap<PolicyConfig>>,
    pub conn_table: Arc<ConnTable>,
    pub nat: Arc<NatTable>,
    pub flows: Arc<FlowPolicyCache>,
    pub resolver: Arc<PortResolver>,
    pub vpn: AdapterInfo,
    pub physical: AdapterInfo,
    pub shared: Arc<SessionShared>,
}

pub(crate) fn open_outbound() -> EngineResult<WinDivert<NetworkLayer>> {
    WinDivert::network(OUTBOUND_FILTER, OUTBOUND_PRIORITY, WinDivertFlags::new()).map_err(|e| {
        EngineError::PacketSourceOpen(format!("outbound handle: {e:?}"))
    })
}

pub(crate) fn open_inbound() -> EngineResult<WinDivert<NetworkLayer>> {
    WinDivert::network(INBOUND_FILTER, INBOUND_PRIORITY, WinDivertFlags::new()).map_err(|e| {
        EngineError::PacketSourceOpen(format!("inbound handle: {e:?}"))
    })
}

/// Outbound worker: identify, decide, rewrite, reinject.
pub(crate) fn run_outbound(handle: WinDivert<NetworkLayer>, ctx: InterceptCtx) {
    info!("Outbound interceptor started");

    let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
    let mut logged_flows: HashSet<FlowKey> = HashSet::new();
    let mut recv_errors: u32 = 0;

    loop {
        if ctx.shared.stopping() {
            break;
        }

        let packet = match handle.recv(Some(&mut buffer)) {
            Ok(packet) => {
                recv_errors = 0;
                packet
            }
            Err(e) => {
                if ctx.shared.stopping() {
                    break;
                }
                recv_errors += 1;
                warn!("Outbound recv error ({recv_errors} consecutive): {e:?}");
                if recv_errors >= MAX_RECV_ERRORS {
                    ctx.shared
                        .fault(format!("outbound packet source failed: {e:?}"));
                    break;
                }
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }
        };

        process_outbound(&handle, packet, &ctx, &mut logged_flows);
    }

    info!("Outbound interceptor stopped");
}

fn process_outbound(
    handle: &WinDivert<NetworkLayer>,
    packet: WinDivertPacket<'_, NetworkLayer>,
    ctx: &InterceptCtx,
    logged_flows: &mut HashSet<FlowKey>,
) {
    let Some(info) = PacketInfo::parse(&packet.data) else {
        // Not IPv4 TCP/UDP; the filter should have excluded it, but the
        // packet still has to go somewhere.
        reinject(handle, &packet, ctx, true);
        return;
    };

    let key = FlowKey {
        protocol: info.protocol,
        src_ip: info.src_ip,
        src_port: info.src_port,
        dst_ip: info.dst_ip,
        dst_port: info.dst_port,
    };

    // Committed decisions short-circuit identification entirely; every
    // later packet of a flow takes the path its first packet took.
    match ctx.flows.get(&key) {
        Decision::PassThrough => {
            reinject(handle, &packet, ctx, true);
            return;
        }
        Decision::RedirectToVpn => {
            redirect(handle, packet, &info, key, &ctx.vpn, ctx, logged_flows);
            return;
        }
        Decision::RedirectToPhysical => {
            redirect(handle, packet, &info, key, &ctx.physical, ctx, logged_flows);
            return;
        }
        Decision::Unknown => {}
    }

    // Identify the owning executable: background maps first, synchronous
    // table query for flows the tracker has not seen yet.
    let exe = {
        let maps = ctx.conn_table.load();
        maps.lookup(info.src_ip, info.src_port)
    }
    .or_else(|| ctx.resolver.resolve(info.protocol, info.src_ip, info.src_port));

    let policy = ctx.policy.load();
    match decide_egress(&policy, exe.as_deref()) {
        // Owner unknown: reinject unchanged and leave the flow undecided so
        // a later packet can still be classified.
        None => reinject(handle, &packet, ctx, true),
        Some(egress) => {
            let target = match egress {
                Egress::Vpn => &ctx.vpn,
                Egress::Physical => &ctx.physical,
            };

            if info.src_ip == target.ip {
                // Already egressing the right adapter
                ctx.flows.commit(key, Decision::PassThrough);
                reinject(handle, &packet, ctx, true);
            } else {
                let decision = match egress {
                    Egress::Vpn => Decision::RedirectToVpn,
                    Egress::Physical => Decision::RedirectToPhysical,
                };
                // commit returns whatever was stored first
                match ctx.flows.commit(key, decision) {
                    Decision::PassThrough | Decision::Unknown => {
                        reinject(handle, &packet, ctx, true)
                    }
                    Decision::RedirectToVpn => {
                        redirect(handle, packet, &info, key, &ctx.vpn, ctx, logged_flows)
                    }
                    Decision::RedirectToPhysical => {
                        redirect(handle, packet, &info, key, &ctx.physical, ctx, logged_flows)
                    }
                }
            }
        }
    }
}

/// Rewrite an outbound packet onto `target` and reinject it, recording the
/// NAT entry that will restore the replies.
fn redirect(
    handle: &WinDivert<NetworkLayer>,
    packet: WinDivertPacket<'_, NetworkLayer>,
    info: &PacketInfo,
    key: FlowKey,
    target: &AdapterInfo,
    ctx: &InterceptCtx,
    logged_flows: &mut HashSet<FlowKey>,
) {
    let mut data = packet.data.to_vec();

    if let Err(e) = packet::rewrite_source(&mut data, target.ip) {
        if logged_flows.insert(key) {
            warn!(
                "Dropping packet of flow {}:{} -> {}:{}: {e}",
                info.src_ip, info.src_port, info.dst_ip, info.dst_port
            );
        }
        if logged_flows.len() > 1024 {
            logged_flows.clear();
        }
        ctx.shared.record_discard();
        return;
    }

    ctx.nat.upsert(
        NatKey::outbound(
            info.protocol,
            target.ip,
            info.src_port,
            info.dst_ip,
            info.dst_port,
        ),
        info.src_ip,
        packet.address.interface_index(),
    );

    let mut address = packet.address.clone();
    address.set_interface_index(target.ifindex);

    let rewritten = WinDivertPacket {
        address,
        data: Cow::Owned(data),
    };

    match handle.send(&rewritten) {
        Ok(_) => ctx.shared.add_bytes_out(rewritten.data.len() as u64),
        Err(e) => {
            warn!("Outbound send failed: {e:?}");
            ctx.shared.record_discard();
        }
    }
}

/// Inbound worker: restore redirected replies through the NAT table.
pub(crate) fn run_inbound(handle: WinDivert<NetworkLayer>, ctx: InterceptCtx) {
    info!("Inbound interceptor started");

    let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
    let mut logged_flows: HashSet<NatKey> = HashSet::new();
    let mut recv_errors: u32 = 0;

    loop {
        if ctx.shared.stopping() {
            break;
        }

        let packet = match handle.recv(Some(&mut buffer)) {
            Ok(packet) => {
                recv_errors = 0;
                packet
            }
            Err(e) => {
                if ctx.shared.stopping() {
                    break;
                }
                recv_errors += 1;
                warn!("Inbound recv error ({recv_errors} consecutive): {e:?}");
                if recv_errors >= MAX_RECV_ERRORS {
                    ctx.shared
                        .fault(format!("inbound packet source failed: {e:?}"));
                    break;
                }
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }
        };

        process_inbound(&handle, packet, &ctx, &mut logged_flows);
    }

    info!("Inbound interceptor stopped");
}

fn process_inbound(
    handle: &WinDivert<NetworkLayer>,
    packet: WinDivertPacket<'_, NetworkLayer>,
    ctx: &InterceptCtx,
    logged_flows: &mut HashSet<NatKey>,
) {
    let Some(info) = PacketInfo::parse(&packet.data) else {
        reinject(handle, &packet, ctx, false);
        return;
    };

    // Inbound destination is the outbound source after NAT
    let key = NatKey::inbound(
        info.protocol,
        info.dst_ip,
        info.dst_port,
        info.src_ip,
        info.src_port,
    );

    let Some(entry) = ctx.nat.lookup(&key) else {
        // Not a flow this engine redirected
        reinject(handle, &packet, ctx, false);
        return;
    };

    if entry.orig_src == info.dst_ip {
        reinject(handle, &packet, ctx, false);
        return;
    }

    let mut data = packet.data.to_vec();
    if let Err(e) = packet::rewrite_destination(&mut data, entry.orig_src) {
        if logged_flows.insert(key) {
            warn!(
                "Dropping reply of flow {}:{} -> {}:{}: {e}",
                info.src_ip, info.src_port, info.dst_ip, info.dst_port
            );
        }
        if logged_flows.len() > 1024 {
            logged_flows.clear();
        }
        ctx.shared.record_discard();
        return;
    }

    // Deliver on the original interface so the host accepts the packet
    let mut address = packet.address.clone();
    address.set_interface_index(entry.orig_ifindex);

    let restored = WinDivertPacket {
        address,
        data: Cow::Owned(data),
    };

    match handle.send(&restored) {
        Ok(_) => ctx.shared.add_bytes_in(restored.data.len() as u64),
        Err(e) => {
            warn!("Inbound send failed: {e:?}");
            ctx.shared.record_discard();
        }
    }
}

/// Reinject a packet unchanged, keeping the byte counters current.
fn reinject(
    handle: &WinDivert<NetworkLayer>,
    packet: &WinDivertPacket<'_, NetworkLayer>,
    ctx: &InterceptCtx,
    outbound: bool,
) {
    match handle.send(packet) {
        Ok(_) => {
            if outbound {
                ctx.shared.add_bytes_out(packet.data.len() as u64);
            } else {
                ctx.shared.add_bytes_in(packet.data.len() as u64);
            }
        }
        Err(e) => {
            warn!("Reinject failed: {e:?}");
            ctx.shared.record_discard();
        }
    }
}
