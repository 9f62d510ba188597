//! Local UDP socket bridged into UDP substreams, keyed by source address so
//! replies return on the substream that carried the request out.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{Client, UdpSession};
use crate::error::Result;
use crate::protocol::read_datagram;

pub(crate) async fn listen(
    client: Arc<Client>,
    listen: SocketAddr,
    target: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let socket = Arc::new(UdpSocket::bind(listen).await?);
    info!(%listen, %target, "UDP forwarder listening");

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (n, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(%listen, error = %e, "failed to receive datagram");
                    continue;
                }
            },
        };

        let (session, reused) = match client.udp(peer, target).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(%peer, %target, error = %e, "failed to establish UDP substream");
                continue;
            }
        };
        if !reused {
            spawn_reply_pump(
                client.clone(),
                session.clone(),
                socket.clone(),
                peer,
                cancel.clone(),
            );
        }

        if let Err(e) = session.send_datagram(&buf[..n]).await {
            debug!(%peer, %target, error = %e, "UDP substream write failed, evicting");
            client.close_udp(session.key()).await;
        }
    }
    Ok(())
}

/// Read reply frames off the substream and send them back to the source
/// address that owns this session. Evicts the map entry on stream end.
fn spawn_reply_pump(
    client: Arc<Client>,
    session: Arc<UdpSession>,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let Some(mut reader) = session.take_reader() else {
        return;
    };
    tokio::spawn(async move {
        let mut buf = Vec::with_capacity(2048);
        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => break,
                n = read_datagram(&mut reader, &mut buf) => match n {
                    Ok(Some(n)) => n,
                    Ok(None) => break,
                    Err(e) => {
                        debug!(%peer, error = %e, "UDP reply stream failed");
                        break;
                    }
                },
            };
            if let Err(e) = socket.send_to(&buf[..n], peer).await {
                debug!(%peer, error = %e, "failed to deliver UDP reply");
                break;
            }
        }
        client.close_udp(session.key()).await;
    });
}
