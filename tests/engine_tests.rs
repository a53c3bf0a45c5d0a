//! Engine core tests
//!
//! Exercises the portable parts of the split-tunnel engine: the decision
//! function, flow stickiness, the NAT round trip and the snapshot tables.
//! Nothing here needs elevation, the packet driver or a live network.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use appdivert::engine::nat::{NatKey, NatTable};
use appdivert::engine::packet::{self, PacketInfo, Protocol};
use appdivert::engine::policy::{
    decide_egress, normalize_exe_path, Decision, Egress, FlowKey, FlowPolicyCache, Mode,
    PolicyConfig,
};
use appdivert::engine::tracker::{ConnMaps, ConnTable};

const VPN_IP: Ipv4Addr = Ipv4Addr::new(10, 8, 0, 2);
const VPN_IFINDEX: u32 = 21;
const PHYS_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);
const REMOTE_IP: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

/// Build a minimal IPv4 TCP packet with valid checksums.
fn tcp_packet(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, src_port: u16, dst_port: u16) -> Vec<u8> {
    let mut p = vec![0u8; 40];
    p[0] = 0x45;
    let len = p.len() as u16;
    p[2..4].copy_from_slice(&len.to_be_bytes());
    p[8] = 64;
    p[9] = 6;
    p[12..16].copy_from_slice(&src_ip.octets());
    p[16..20].copy_from_slice(&dst_ip.octets());
    p[20..22].copy_from_slice(&src_port.to_be_bytes());
    p[22..24].copy_from_slice(&dst_port.to_be_bytes());
    p[32] = 0x50;
    packet::update_checksums(&mut p).expect("valid test packet");
    p
}

mod decision_tests {
    use super::*;

    #[test]
    fn exclude_mode_routes_targets_to_physical() {
        let config = PolicyConfig::new(Mode::Exclude, vec![r"C:\game.exe".to_string()]);

        assert_eq!(
            decide_egress(&config, Some(&normalize_exe_path(r"C:\GAME.EXE"))),
            Some(Egress::Physical)
        );
        assert_eq!(
            decide_egress(&config, Some(r"c:\browser.exe")),
            Some(Egress::Vpn)
        );
    }

    #[test]
    fn include_mode_routes_targets_to_vpn() {
        let config = PolicyConfig::new(Mode::Include, vec![r"C:\browser.exe".to_string()]);

        assert_eq!(
            decide_egress(&config, Some(r"c:\browser.exe")),
            Some(Egress::Vpn)
        );
        // An untargeted app on the physical adapter stays put
        assert_eq!(
            decide_egress(&config, Some(r"c:\notepad.exe")),
            Some(Egress::Physical)
        );
    }

    #[test]
    fn unknown_owner_never_redirects() {
        for mode in [Mode::Exclude, Mode::Include] {
            let config = PolicyConfig::new(mode, vec![r"C:\game.exe".to_string()]);
            assert_eq!(decide_egress(&config, None), None);
        }
    }

    #[test]
    fn decision_function_is_deterministic() {
        let config = PolicyConfig::new(Mode::Exclude, vec![r"C:\game.exe".to_string()]);
        for _ in 0..100 {
            assert_eq!(
                decide_egress(&config, Some(r"c:\game.exe")),
                Some(Egress::Physical)
            );
        }
    }
}

mod flow_stickiness_tests {
    use super::*;

    fn flow() -> FlowKey {
        FlowKey {
            protocol: Protocol::Tcp,
            src_ip: VPN_IP,
            src_port: 50001,
            dst_ip: REMOTE_IP,
            dst_port: 443,
        }
    }

    /// Removing an app from the target set must not change the committed
    /// decision of a flow that already started.
    #[test]
    fn committed_decision_survives_target_removal() {
        let cache = FlowPolicyCache::new();
        let mut config = PolicyConfig::new(Mode::Exclude, vec![r"C:\game.exe".to_string()]);

        // First packet: app targeted, redirect committed
        let egress = decide_egress(&config, Some(r"c:\game.exe")).unwrap();
        assert_eq!(egress, Egress::Physical);
        cache.commit(flow(), Decision::RedirectToPhysical);

        // Operator clears the target set mid-flow
        config = config.with_targets(Vec::<String>::new());
        assert_eq!(
            decide_egress(&config, Some(r"c:\game.exe")),
            Some(Egress::Vpn)
        );

        // The committed decision still governs the flow
        assert_eq!(cache.get(&flow()), Decision::RedirectToPhysical);
        assert_eq!(
            cache.commit(flow(), Decision::PassThrough),
            Decision::RedirectToPhysical
        );
    }

    #[test]
    fn distinct_flows_decide_independently() {
        let cache = FlowPolicyCache::new();
        cache.commit(flow(), Decision::RedirectToPhysical);

        let other = FlowKey {
            src_port: 50002,
            ..flow()
        };
        assert_eq!(cache.get(&other), Decision::Unknown);
    }
}

mod nat_roundtrip_tests {
    use super::*;

    /// Outbound rewrite followed by a synthetic inbound reply restores the
    /// original destination address and interface index exactly.
    #[test]
    fn rewrite_then_restore_roundtrip() {
        let nat = NatTable::new();

        // Outbound: TCP SYN from the VPN-bound socket, redirected onto the
        // physical adapter
        let mut outbound = tcp_packet(VPN_IP, REMOTE_IP, 50001, 443);
        packet::rewrite_source(&mut outbound, PHYS_IP).unwrap();

        let info = PacketInfo::parse(&outbound).unwrap();
        assert_eq!(info.src_ip, PHYS_IP);

        nat.upsert(
            NatKey::outbound(Protocol::Tcp, PHYS_IP, 50001, REMOTE_IP, 443),
            VPN_IP,
            VPN_IFINDEX,
        );

        // Inbound: reply with swapped endpoints
        let mut reply = tcp_packet(REMOTE_IP, PHYS_IP, 443, 50001);
        let reply_info = PacketInfo::parse(&reply).unwrap();

        let entry = nat
            .lookup(&NatKey::inbound(
                Protocol::Tcp,
                reply_info.dst_ip,
                reply_info.dst_port,
                reply_info.src_ip,
                reply_info.src_port,
            ))
            .expect("reply must match the NAT entry");

        assert_eq!(entry.orig_src, VPN_IP);
        assert_eq!(entry.orig_ifindex, VPN_IFINDEX);

        packet::rewrite_destination(&mut reply, entry.orig_src).unwrap();
        let restored = PacketInfo::parse(&reply).unwrap();
        assert_eq!(restored.dst_ip, VPN_IP);
        assert_eq!(restored.src_ip, REMOTE_IP);
        assert_eq!(restored.dst_port, 50001);
    }

    /// A reply for a flow the engine never redirected finds no entry.
    #[test]
    fn unrelated_reply_misses_table() {
        let nat = NatTable::new();
        nat.upsert(
            NatKey::outbound(Protocol::Tcp, PHYS_IP, 50001, REMOTE_IP, 443),
            VPN_IP,
            VPN_IFINDEX,
        );

        assert!(nat
            .lookup(&NatKey::inbound(
                Protocol::Tcp,
                PHYS_IP,
                60000,
                REMOTE_IP,
                443,
            ))
            .is_none());

        // UDP on the same endpoints is a different flow
        assert!(nat
            .lookup(&NatKey::inbound(
                Protocol::Udp,
                PHYS_IP,
                50001,
                REMOTE_IP,
                443,
            ))
            .is_none());
    }

    /// Rewriting preserves everything but the addressed field and checksums.
    #[test]
    fn rewrite_touches_only_address_and_checksums() {
        let original = tcp_packet(VPN_IP, REMOTE_IP, 50001, 443);
        let mut rewritten = original.clone();
        packet::rewrite_source(&mut rewritten, PHYS_IP).unwrap();

        for (i, (a, b)) in original.iter().zip(rewritten.iter()).enumerate() {
            let is_src = (12..16).contains(&i);
            let is_ip_cksum = (10..12).contains(&i);
            let is_tcp_cksum = (36..38).contains(&i);
            if !(is_src || is_ip_cksum || is_tcp_cksum) {
                assert_eq!(a, b, "byte {i} changed unexpectedly");
            }
        }
    }
}

mod conn_maps_tests {
    use super::*;

    #[test]
    fn endpoint_then_port_fallback_order() {
        let mut maps = ConnMaps::with_tick(1);
        maps.insert(VPN_IP, 50001, Arc::from("c:\\game.exe"), &[]);

        assert_eq!(&*maps.lookup(VPN_IP, 50001).unwrap(), "c:\\game.exe");
        // Post-rewrite retransmit: endpoint misses, port matches
        assert_eq!(&*maps.lookup(PHYS_IP, 50001).unwrap(), "c:\\game.exe");
        assert!(maps.lookup(PHYS_IP, 1).is_none());
    }

    #[test]
    fn wildcard_sockets_match_adapter_addresses() {
        let mut maps = ConnMaps::with_tick(1);
        maps.insert(
            Ipv4Addr::UNSPECIFIED,
            50001,
            Arc::from("c:\\game.exe"),
            &[VPN_IP, PHYS_IP],
        );

        assert!(maps.lookup(VPN_IP, 50001).is_some());
        assert!(maps.lookup(PHYS_IP, 50001).is_some());
    }

    #[test]
    fn published_pair_replaces_previous_snapshot() {
        let table = ConnTable::new();

        let mut first = ConnMaps::with_tick(1);
        first.insert(VPN_IP, 50001, Arc::from("c:\\old.exe"), &[]);
        table.publish(first);

        let held = table.load();

        let mut second = ConnMaps::with_tick(2);
        second.insert(VPN_IP, 50001, Arc::from("c:\\new.exe"), &[]);
        table.publish(second);

        // The held snapshot is unchanged; fresh loads see the new pair
        assert_eq!(&*held.lookup(VPN_IP, 50001).unwrap(), "c:\\old.exe");
        assert_eq!(
            &*table.load().lookup(VPN_IP, 50001).unwrap(),
            "c:\\new.exe"
        );
    }
}

mod target_set_tests {
    use super::*;

    #[test]
    fn target_paths_are_case_folded() {
        let config = PolicyConfig::new(
            Mode::Exclude,
            vec![r"C:\Program Files\Game\GAME.exe".to_string()],
        );
        assert!(config.is_target(r"c:\program files\game\game.exe"));
        assert!(!config.is_target(r"c:\program files\game\other.exe"));
    }

    #[test]
    fn with_targets_replaces_the_whole_set() {
        let config = PolicyConfig::new(Mode::Exclude, vec![r"C:\a.exe".to_string()]);
        let swapped = config.with_targets(vec![r"C:\b.exe".to_string()]);

        assert!(!swapped.is_target(r"c:\a.exe"));
        assert!(swapped.is_target(r"c:\b.exe"));
        // The original snapshot is untouched
        assert!(config.is_target(r"c:\a.exe"));
    }

    #[test]
    fn forward_slashes_normalize_to_backslashes() {
        let targets: HashSet<String> = [r"C:/Games/game.exe".to_string()].into();
        let config = PolicyConfig::new(Mode::Exclude, targets);
        assert!(config.is_target(r"c:\games\game.exe"));
    }
}
