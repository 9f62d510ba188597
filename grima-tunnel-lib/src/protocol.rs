//! The typed header exchanged once per substream.
//!
//! Wire form: one tag byte, then tag-specific fields. Addresses are a family
//! byte (4 or 6), the raw address bytes and a big-endian port. Flag lists are
//! a count byte followed by big-endian u16 flag records.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TunnelError};
use crate::forge::TcpFlags;

const TAG_PING: u8 = 0x01;
const TAG_PONG: u8 = 0x02;
const TAG_TCPF: u8 = 0x03;
const TAG_TCP: u8 = 0x04;
const TAG_UDP: u8 = 0x05;

/// What a freshly opened substream is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proto {
    Ping,
    Pong,
    /// Remember this flag list for the peer this substream came from
    Tcpf(Vec<TcpFlags>),
    /// Dial TCP to the address, then splice
    Tcp(SocketAddr),
    /// Open a UDP sender to the address, then splice
    Udp(SocketAddr),
}

impl Proto {
    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(32);
        match self {
            Proto::Ping => buf.push(TAG_PING),
            Proto::Pong => buf.push(TAG_PONG),
            Proto::Tcpf(flags) => {
                if flags.len() > usize::from(u8::MAX) {
                    return Err(TunnelError::Protocol("flag list too long".into()));
                }
                buf.push(TAG_TCPF);
                buf.push(flags.len() as u8);
                for f in flags {
                    buf.extend_from_slice(&f.bits().to_be_bytes());
                }
            }
            Proto::Tcp(addr) => {
                buf.push(TAG_TCP);
                put_addr(&mut buf, addr);
            }
            Proto::Udp(addr) => {
                buf.push(TAG_UDP);
                put_addr(&mut buf, addr);
            }
        }
        w.write_all(&buf).await?;
        w.flush().await?;
        Ok(())
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Proto> {
        let tag = r.read_u8().await?;
        match tag {
            TAG_PING => Ok(Proto::Ping),
            TAG_PONG => Ok(Proto::Pong),
            TAG_TCPF => {
                let count = r.read_u8().await?;
                let mut flags = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    let bits = r.read_u16().await?;
                    flags.push(TcpFlags::from_bits(bits));
                }
                Ok(Proto::Tcpf(flags))
            }
            TAG_TCP => Ok(Proto::Tcp(read_addr(r).await?)),
            TAG_UDP => Ok(Proto::Udp(read_addr(r).await?)),
            other => Err(TunnelError::Protocol(format!("unknown protocol tag {other:#04x}"))),
        }
    }
}

/// UDP payloads ride substreams as length-prefixed frames.
pub async fn write_datagram<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> Result<()> {
    if data.len() > usize::from(u16::MAX) {
        return Err(TunnelError::Protocol(format!("datagram of {} bytes too large", data.len())));
    }
    w.write_u16(data.len() as u16).await?;
    w.write_all(data).await?;
    w.flush().await?;
    Ok(())
}

/// Counterpart of [`write_datagram`]; `None` on clean end of stream.
pub async fn read_datagram<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut Vec<u8>,
) -> Result<Option<usize>> {
    let len = match r.read_u16().await {
        Ok(len) => usize::from(len),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    buf.resize(len, 0);
    r.read_exact(buf).await?;
    Ok(Some(len))
}

fn put_addr(buf: &mut Vec<u8>, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.push(4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

async fn read_addr<R: AsyncRead + Unpin>(r: &mut R) -> Result<SocketAddr> {
    let family = r.read_u8().await?;
    let ip = match family {
        4 => {
            let mut octets = [0u8; 4];
            r.read_exact(&mut octets).await?;
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        6 => {
            let mut octets = [0u8; 16];
            r.read_exact(&mut octets).await?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => {
            return Err(TunnelError::Protocol(format!("unknown address family {other}")));
        }
    };
    let port = r.read_u16().await?;
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(p: Proto) -> Proto {
        let (mut a, mut b) = tokio::io::duplex(256);
        p.write(&mut a).await.unwrap();
        Proto::read(&mut b).await.unwrap()
    }

    #[tokio::test]
    async fn all_tags_round_trip() {
        assert_eq!(round_trip(Proto::Ping).await, Proto::Ping);
        assert_eq!(round_trip(Proto::Pong).await, Proto::Pong);

        let flags = vec![
            TcpFlags { syn: true, ..TcpFlags::default() },
            TcpFlags { ack: true, psh: true, ns: true, ..TcpFlags::default() },
        ];
        assert_eq!(round_trip(Proto::Tcpf(flags.clone())).await, Proto::Tcpf(flags));

        let v4: SocketAddr = "203.0.113.9:6000".parse().unwrap();
        assert_eq!(round_trip(Proto::Tcp(v4)).await, Proto::Tcp(v4));

        let v6: SocketAddr = "[2001:db8::9]:6000".parse().unwrap();
        assert_eq!(round_trip(Proto::Udp(v6)).await, Proto::Udp(v6));
    }

    #[tokio::test]
    async fn empty_flag_list_round_trips() {
        assert_eq!(round_trip(Proto::Tcpf(Vec::new())).await, Proto::Tcpf(Vec::new()));
    }

    #[tokio::test]
    async fn unknown_tag_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(16);
        a.write_all(&[0x7f]).await.unwrap();
        let err = Proto::read(&mut b).await.unwrap_err();
        assert!(matches!(err, TunnelError::Protocol(_)));
    }

    #[tokio::test]
    async fn short_read_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(16);
        a.write_all(&[TAG_TCP, 4, 1, 2]).await.unwrap();
        drop(a);
        assert!(Proto::read(&mut b).await.is_err());
    }
}
