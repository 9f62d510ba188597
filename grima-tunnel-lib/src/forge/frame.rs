//! Header construction for synthesised segments.
//!
//! Pure with respect to the capture device so that every field can be checked
//! by parsing the output back; the send handle owns the pcap side.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Flags, MutableIpv4Packet};
use pnet::packet::ipv6::MutableIpv6Packet;
use pnet::packet::tcp::{self, MutableTcpPacket, TcpOption};
use pnet::packet::MutablePacket;
use pnet::util::MacAddr;

use crate::config::NetworkConfig;
use crate::error::{Result, TunnelError};
use crate::forge::TcpFlags;

const ETH_LEN: usize = 14;
const IPV4_LEN: usize = 20;
const IPV6_LEN: usize = 40;
const TCP_LEN: usize = 20;
const SYN_OPTS_LEN: usize = 20;
const ACK_OPTS_LEN: usize = 12;

pub(crate) struct FrameBuilder {
    src_mac: MacAddr,
    v4: Option<(Ipv4Addr, MacAddr)>,
    v6: Option<(Ipv6Addr, MacAddr)>,
    src_port: u16,
    /// Milliseconds at handle creation; seeds both the timestamp option and
    /// the non-SYN sequence numbers.
    ts_base: u32,
    counter: AtomicU32,
}

impl FrameBuilder {
    pub fn new(cfg: &NetworkConfig) -> Self {
        let ts_base = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u32)
            .unwrap_or(0);
        Self {
            src_mac: cfg.interface.mac,
            v4: cfg.ipv4.as_ref().map(|c| (c.addr, c.router_mac)),
            v6: cfg.ipv6.as_ref().map(|c| (c.addr, c.router_mac)),
            src_port: cfg.port,
            ts_base,
            counter: AtomicU32::new(0),
        }
    }

    /// Serialise one Ethernet/IP/TCP frame around `payload` into `buf`,
    /// returning the frame length. `buf` is fully overwritten; nothing from a
    /// previous packet survives.
    pub fn encode(
        &self,
        buf: &mut Vec<u8>,
        dst: SocketAddr,
        flags: TcpFlags,
        payload: &[u8],
    ) -> Result<usize> {
        let c = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let ts_val = self.ts_base.wrapping_add(c >> 3);

        let (options, opts_len, seq, ack): (Vec<TcpOption>, usize, u32, u32) = if flags.syn {
            let seq = 1 + (c & 0x7);
            let ack = if flags.ack { seq + 1 } else { 0 };
            let opts = vec![
                TcpOption::mss(1460),
                TcpOption::sack_perm(),
                TcpOption::timestamp(ts_val, 0),
                TcpOption::nop(),
                TcpOption::wscale(8),
            ];
            (opts, SYN_OPTS_LEN, seq, ack)
        } else {
            let ts_ecr = ts_val.wrapping_sub((c % 200).wrapping_add(50));
            let seq = self.ts_base.wrapping_add(c << 7);
            let ack = seq.wrapping_sub(c & 0x3FF).wrapping_add(1400);
            let opts = vec![
                TcpOption::nop(),
                TcpOption::nop(),
                TcpOption::timestamp(ts_val, ts_ecr),
            ];
            (opts, ACK_OPTS_LEN, seq, ack)
        };

        let tcp_len = TCP_LEN + opts_len;
        match dst {
            SocketAddr::V4(dst4) => {
                let (src_ip, router) = self.v4.ok_or_else(|| {
                    TunnelError::InvalidAddress(format!("no IPv4 source configured for {dst}"))
                })?;
                let total = ETH_LEN + IPV4_LEN + tcp_len + payload.len();
                buf.clear();
                buf.resize(total, 0);

                let mut eth = MutableEthernetPacket::new(buf.as_mut_slice())
                    .ok_or_else(|| TunnelError::Transport("ethernet buffer too small".into()))?;
                eth.set_source(self.src_mac);
                eth.set_destination(router);
                eth.set_ethertype(EtherTypes::Ipv4);

                let mut ip = MutableIpv4Packet::new(eth.payload_mut())
                    .ok_or_else(|| TunnelError::Transport("ipv4 buffer too small".into()))?;
                ip.set_version(4);
                ip.set_header_length(5);
                // TOS 184: DSCP EF, no ECN
                ip.set_dscp(46);
                ip.set_ecn(0);
                ip.set_total_length((IPV4_LEN + tcp_len + payload.len()) as u16);
                ip.set_identification(0);
                ip.set_flags(Ipv4Flags::DontFragment);
                ip.set_fragment_offset(0);
                ip.set_ttl(64);
                ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
                ip.set_source(src_ip);
                ip.set_destination(*dst4.ip());
                ip.set_checksum(0);

                self.fill_tcp(ip.payload_mut(), dst.port(), flags, seq, ack, &options, payload)?;
                {
                    let tcp_pkt = MutableTcpPacket::new(ip.payload_mut())
                        .ok_or_else(|| TunnelError::Transport("tcp buffer too small".into()))?;
                    let csum = tcp::ipv4_checksum(&tcp_pkt.to_immutable(), &src_ip, dst4.ip());
                    drop(tcp_pkt);
                    let mut tcp_pkt = MutableTcpPacket::new(ip.payload_mut())
                        .ok_or_else(|| TunnelError::Transport("tcp buffer too small".into()))?;
                    tcp_pkt.set_checksum(csum);
                }
                let csum = ipv4::checksum(&ip.to_immutable());
                ip.set_checksum(csum);
                Ok(total)
            }
            SocketAddr::V6(dst6) => {
                let (src_ip, router) = self.v6.ok_or_else(|| {
                    TunnelError::InvalidAddress(format!("no IPv6 source configured for {dst}"))
                })?;
                let total = ETH_LEN + IPV6_LEN + tcp_len + payload.len();
                buf.clear();
                buf.resize(total, 0);

                let mut eth = MutableEthernetPacket::new(buf.as_mut_slice())
                    .ok_or_else(|| TunnelError::Transport("ethernet buffer too small".into()))?;
                eth.set_source(self.src_mac);
                eth.set_destination(router);
                eth.set_ethertype(EtherTypes::Ipv6);

                let mut ip = MutableIpv6Packet::new(eth.payload_mut())
                    .ok_or_else(|| TunnelError::Transport("ipv6 buffer too small".into()))?;
                ip.set_version(6);
                ip.set_traffic_class(184);
                ip.set_flow_label(0);
                ip.set_payload_length((tcp_len + payload.len()) as u16);
                ip.set_next_header(IpNextHeaderProtocols::Tcp);
                ip.set_hop_limit(64);
                ip.set_source(src_ip);
                ip.set_destination(*dst6.ip());

                self.fill_tcp(ip.payload_mut(), dst.port(), flags, seq, ack, &options, payload)?;
                let tcp_pkt = MutableTcpPacket::new(ip.payload_mut())
                    .ok_or_else(|| TunnelError::Transport("tcp buffer too small".into()))?;
                let csum = tcp::ipv6_checksum(&tcp_pkt.to_immutable(), &src_ip, dst6.ip());
                drop(tcp_pkt);
                let mut tcp_pkt = MutableTcpPacket::new(ip.payload_mut())
                    .ok_or_else(|| TunnelError::Transport("tcp buffer too small".into()))?;
                tcp_pkt.set_checksum(csum);
                Ok(total)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fill_tcp(
        &self,
        buf: &mut [u8],
        dst_port: u16,
        flags: TcpFlags,
        seq: u32,
        ack: u32,
        options: &[TcpOption],
        payload: &[u8],
    ) -> Result<()> {
        let mut tcp_pkt = MutableTcpPacket::new(buf)
            .ok_or_else(|| TunnelError::Transport("tcp buffer too small".into()))?;
        tcp_pkt.set_source(self.src_port);
        tcp_pkt.set_destination(dst_port);
        tcp_pkt.set_sequence(seq);
        tcp_pkt.set_acknowledgement(ack);
        let header_len = TCP_LEN + if flags.syn { SYN_OPTS_LEN } else { ACK_OPTS_LEN };
        tcp_pkt.set_data_offset((header_len / 4) as u8);
        tcp_pkt.set_reserved(0);
        tcp_pkt.set_flags(flags.bits() as u8);
        tcp_pkt.set_window(65535);
        tcp_pkt.set_checksum(0);
        tcp_pkt.set_urgent_ptr(0);
        tcp_pkt.set_options(options);
        tcp_pkt.set_payload(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InterfaceConfig, Ipv4Config, NetworkConfig, PcapConfig, TcpConfig};
    use pnet::packet::ethernet::EthernetPacket;
    use pnet::packet::ipv4::Ipv4Packet;
    use pnet::packet::tcp::{TcpFlags as PnetFlags, TcpPacket};
    use pnet::packet::Packet;

    fn test_cfg() -> NetworkConfig {
        NetworkConfig {
            interface: InterfaceConfig {
                name: "lo".into(),
                mac: "02:00:00:00:00:01".parse().unwrap(),
            },
            port: 46321,
            ipv4: Some(Ipv4Config {
                addr: "192.0.2.10".parse().unwrap(),
                router_mac: "02:00:00:00:00:02".parse().unwrap(),
            }),
            ipv6: None,
            pcap: PcapConfig::default(),
            tcp: TcpConfig { lf: vec![TcpFlags::default()], rf: vec![] },
        }
    }

    #[test]
    fn syn_frame_parses_back() {
        let builder = FrameBuilder::new(&test_cfg());
        let mut buf = Vec::new();
        let dst: SocketAddr = "198.51.100.7:443".parse().unwrap();
        let flags = TcpFlags { syn: true, ..TcpFlags::default() };
        let n = builder.encode(&mut buf, dst, flags, b"hello").unwrap();
        assert_eq!(n, buf.len());

        let eth = EthernetPacket::new(&buf).unwrap();
        assert_eq!(eth.get_source(), "02:00:00:00:00:01".parse().unwrap());
        assert_eq!(eth.get_destination(), "02:00:00:00:00:02".parse().unwrap());
        assert_eq!(eth.get_ethertype(), EtherTypes::Ipv4);

        let ip = Ipv4Packet::new(eth.payload()).unwrap();
        assert_eq!(ip.get_source(), "192.0.2.10".parse::<Ipv4Addr>().unwrap());
        assert_eq!(ip.get_destination(), "198.51.100.7".parse::<Ipv4Addr>().unwrap());
        assert_eq!(ip.get_ttl(), 64);
        assert_eq!(ip.get_flags(), Ipv4Flags::DontFragment);
        let expected = ipv4::checksum(&ip.to_immutable());
        assert_eq!(ip.get_checksum(), expected);

        let tcp_pkt = TcpPacket::new(ip.payload()).unwrap();
        assert_eq!(tcp_pkt.get_source(), 46321);
        assert_eq!(tcp_pkt.get_destination(), 443);
        assert_eq!(tcp_pkt.get_flags(), PnetFlags::SYN);
        assert_eq!(tcp_pkt.get_window(), 65535);
        // SYN options: MSS, SACK-permitted, TS, NOP, WScale
        assert_eq!(tcp_pkt.get_data_offset(), 10);
        assert_eq!(tcp_pkt.payload(), b"hello");
        let expected =
            tcp::ipv4_checksum(&tcp_pkt, &ip.get_source(), &ip.get_destination());
        assert_eq!(tcp_pkt.get_checksum(), expected);
    }

    #[test]
    fn syn_sequence_stays_in_low_range() {
        let builder = FrameBuilder::new(&test_cfg());
        let dst: SocketAddr = "198.51.100.7:443".parse().unwrap();
        let flags = TcpFlags { syn: true, ack: true, ..TcpFlags::default() };
        for _ in 0..32 {
            let mut buf = Vec::new();
            builder.encode(&mut buf, dst, flags, &[]).unwrap();
            let eth = EthernetPacket::new(&buf).unwrap();
            let ip = Ipv4Packet::new(eth.payload()).unwrap();
            let tcp_pkt = TcpPacket::new(ip.payload()).unwrap();
            let seq = tcp_pkt.get_sequence();
            assert!((1..=8).contains(&seq));
            assert_eq!(tcp_pkt.get_acknowledgement(), seq + 1);
        }
    }

    #[test]
    fn non_syn_ack_tracks_sequence() {
        let builder = FrameBuilder::new(&test_cfg());
        let dst: SocketAddr = "198.51.100.7:443".parse().unwrap();
        let flags = TcpFlags { ack: true, psh: true, ..TcpFlags::default() };
        let mut buf = Vec::new();
        builder.encode(&mut buf, dst, flags, b"x").unwrap();
        let eth = EthernetPacket::new(&buf).unwrap();
        let ip = Ipv4Packet::new(eth.payload()).unwrap();
        let tcp_pkt = TcpPacket::new(ip.payload()).unwrap();
        assert_eq!(tcp_pkt.get_flags(), PnetFlags::ACK | PnetFlags::PSH);
        // ack = seq - (c & 0x3FF) + 1400 for counter value 1
        let seq = tcp_pkt.get_sequence();
        assert_eq!(tcp_pkt.get_acknowledgement(), seq.wrapping_sub(1).wrapping_add(1400));
        assert_eq!(tcp_pkt.get_data_offset(), 8);
    }

    #[test]
    fn unconfigured_family_is_rejected() {
        let builder = FrameBuilder::new(&test_cfg());
        let mut buf = Vec::new();
        let dst: SocketAddr = "[2001:db8::7]:443".parse().unwrap();
        let err = builder.encode(&mut buf, dst, TcpFlags::default(), &[]).unwrap_err();
        assert!(matches!(err, TunnelError::InvalidAddress(_)));
    }
}
