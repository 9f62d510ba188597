//! Receive side of the forge: frame decoding and the capture pump thread.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::thread;

use pcap::{Active, Capture};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::Packet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;

pub(crate) type RecvItem = Result<(Vec<u8>, SocketAddr)>;

/// Decode one captured frame into `(tcp payload, source address)`.
///
/// A frame missing the network, transport or application layer yields an
/// empty payload with a best-effort address; callers tolerate zero-length
/// reads.
pub(crate) fn decode_frame(frame: &[u8]) -> (Vec<u8>, SocketAddr) {
    let mut addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    let Some(eth) = EthernetPacket::new(frame) else {
        return (Vec::new(), addr);
    };

    // Trim to the IP header's own length: short frames arrive padded to the
    // Ethernet minimum and the padding must not leak into the payload.
    let (proto, ip_payload) = match eth.get_ethertype() {
        EtherTypes::Ipv4 => {
            let Some(ip) = Ipv4Packet::new(eth.payload()) else {
                return (Vec::new(), addr);
            };
            addr.set_ip(IpAddr::V4(ip.get_source()));
            let header = usize::from(ip.get_header_length()) * 4;
            let len = usize::from(ip.get_total_length()).saturating_sub(header);
            let payload = &eth.payload()[header.min(eth.payload().len())..];
            (ip.get_next_level_protocol(), &payload[..len.min(payload.len())])
        }
        EtherTypes::Ipv6 => {
            let Some(ip) = Ipv6Packet::new(eth.payload()) else {
                return (Vec::new(), addr);
            };
            addr.set_ip(IpAddr::V6(ip.get_source()));
            let len = usize::from(ip.get_payload_length());
            let payload = &eth.payload()[40.min(eth.payload().len())..];
            (ip.get_next_header(), &payload[..len.min(payload.len())])
        }
        _ => return (Vec::new(), addr),
    };

    if proto != IpNextHeaderProtocols::Tcp {
        return (Vec::new(), addr);
    }
    let Some(tcp) = TcpPacket::new(ip_payload) else {
        return (Vec::new(), addr);
    };
    addr.set_port(tcp.get_source());

    (tcp.payload().to_vec(), addr)
}

/// Run the capture read loop on a dedicated OS thread, feeding decoded
/// datagrams into the forge's channel. Exits on cancellation, on receiver
/// drop, or on a terminal capture error (which is forwarded verbatim).
pub(crate) fn spawn_recv_pump(
    cap: Capture<Active>,
    tx: mpsc::Sender<RecvItem>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let mut cap = cap;
    thread::Builder::new()
        .name("grima-capture".into())
        .spawn(move || {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                match cap.next_packet() {
                    Ok(pkt) => {
                        let item = decode_frame(pkt.data);
                        if tx.blocking_send(Ok(item)).is_err() {
                            break;
                        }
                    }
                    Err(pcap::Error::TimeoutExpired) => continue,
                    Err(e) => {
                        debug!(error = %e, "capture read terminated");
                        let _ = tx.blocking_send(Err(e.into()));
                        break;
                    }
                }
            }
        })
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InterfaceConfig, Ipv4Config, NetworkConfig, PcapConfig, TcpConfig};
    use crate::forge::frame::FrameBuilder;
    use crate::forge::TcpFlags;

    fn cfg() -> NetworkConfig {
        NetworkConfig {
            interface: InterfaceConfig {
                name: "lo".into(),
                mac: "02:00:00:00:00:01".parse().unwrap(),
            },
            port: 40000,
            ipv4: Some(Ipv4Config {
                addr: "10.0.0.1".parse().unwrap(),
                router_mac: "02:00:00:00:00:02".parse().unwrap(),
            }),
            ipv6: None,
            pcap: PcapConfig::default(),
            tcp: TcpConfig { lf: vec![TcpFlags::default()], rf: vec![] },
        }
    }

    #[test]
    fn forged_frame_decodes_to_payload_and_source() {
        let builder = FrameBuilder::new(&cfg());
        let mut buf = Vec::new();
        let dst: SocketAddr = "10.0.0.2:50000".parse().unwrap();
        builder
            .encode(&mut buf, dst, TcpFlags { ack: true, ..TcpFlags::default() }, b"payload")
            .unwrap();

        let (payload, src) = decode_frame(&buf);
        assert_eq!(payload, b"payload");
        assert_eq!(src, "10.0.0.1:40000".parse().unwrap());
    }

    #[test]
    fn truncated_frame_yields_empty_read() {
        let (payload, _) = decode_frame(&[0u8; 10]);
        assert!(payload.is_empty());
    }

    #[test]
    fn non_ip_frame_yields_empty_read() {
        let mut frame = vec![0u8; 60];
        frame[12] = 0x08;
        frame[13] = 0x06; // ARP
        let (payload, addr) = decode_frame(&frame);
        assert!(payload.is_empty());
        assert_eq!(addr.port(), 0);
    }
}
