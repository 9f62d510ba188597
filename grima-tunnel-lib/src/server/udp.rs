//! Upstream UDP socket and frame/packet splice for `UDP{addr}` substreams.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::error::{Result, TunnelError};
use crate::protocol::{read_datagram, write_datagram};
use crate::transport::Substream;

/// Wire frames from the substream become datagrams to `addr`; replies flow
/// back as frames. The substream ending tears the socket down and vice versa.
pub(crate) async fn handle(
    strm: Substream,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    info!(sid = strm.sid(), %addr, "UDP forward");
    let bind = if addr.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = Arc::new(UdpSocket::bind(bind).await?);
    socket.connect(addr).await?;

    let (mut reader, mut writer) = tokio::io::split(strm);

    let outbound = {
        let socket = socket.clone();
        let cancel = cancel.clone();
        async move {
            let mut buf = Vec::with_capacity(2048);
            loop {
                let n = tokio::select! {
                    _ = cancel.cancelled() => break,
                    n = read_datagram(&mut reader, &mut buf) => match n? {
                        Some(n) => n,
                        None => break,
                    },
                };
                socket.send(&buf[..n]).await?;
            }
            Ok::<_, TunnelError>(())
        }
    };

    let inbound = {
        let socket = socket.clone();
        let cancel = cancel.clone();
        async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = tokio::select! {
                    _ = cancel.cancelled() => break,
                    n = socket.recv(&mut buf) => n?,
                };
                write_datagram(&mut writer, &buf[..n]).await?;
            }
            Ok::<_, TunnelError>(())
        }
    };

    // First direction to finish decides; the other is dropped with the select.
    let result = tokio::select! {
        res = outbound => res,
        res = inbound => res,
    };
    match &result {
        Ok(()) => debug!(%addr, "UDP forward closed"),
        Err(e) => trace!(%addr, error = %e, "UDP forward closed"),
    }
    result
}
