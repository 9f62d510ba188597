//! Per-session substream dispatch.

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use crate::error::Result;
use crate::protocol::Proto;
use crate::transport::{Substream, TunnelConn};

/// Accept substreams until the session dies or the process shuts down. Each
/// substream is handled on its own task; a substream failure never takes the
/// session down.
pub(crate) async fn handle_conn(conn: TunnelConn, cancel: CancellationToken) {
    let tracker = TaskTracker::new();
    loop {
        let strm = tokio::select! {
            _ = cancel.cancelled() => break,
            strm = conn.accept_stream() => match strm {
                Ok(strm) => strm,
                Err(e) => {
                    if !e.is_cancelled() {
                        debug!(remote = %conn.remote_addr(), error = %e, "session ended");
                    }
                    break;
                }
            },
        };
        let peer_flags = PeerFlagInstaller::new(&conn);
        let cancel = cancel.clone();
        tracker.spawn(async move {
            let sid = strm.sid();
            let remote = strm.remote_addr();
            if let Err(e) = handle_stream(strm, peer_flags, cancel).await {
                error!(sid, %remote, error = %e, "substream closed with error");
            } else {
                debug!(sid, %remote, "substream closed");
            }
        });
    }
    conn.close();
    tracker.close();
    tracker.wait().await;
}

/// Everything a substream handler may touch on its owning session: just the
/// flag-override install path, keyed by the session's peer.
pub(crate) struct PeerFlagInstaller {
    forge: std::sync::Arc<crate::forge::Forge>,
    remote: std::net::SocketAddr,
}

impl PeerFlagInstaller {
    fn new(conn: &TunnelConn) -> Self {
        Self { forge: conn.forge(), remote: conn.remote_addr() }
    }

    fn install(&self, list: Vec<crate::forge::TcpFlags>) {
        self.forge.set_peer_flags(&self.remote, list);
    }
}

/// One read decides what the substream is for; unknown tags are terminal for
/// the substream only.
async fn handle_stream(
    mut strm: Substream,
    peer_flags: PeerFlagInstaller,
    cancel: CancellationToken,
) -> Result<()> {
    let proto = Proto::read(&mut strm).await?;
    match proto {
        Proto::Ping => {
            debug!(sid = strm.sid(), "ping");
            Proto::Pong.write(&mut strm).await?;
            let _ = strm.shutdown().await;
            Ok(())
        }
        Proto::Pong => {
            // Only ever sent by servers; receiving one is a peer bug.
            Err(crate::error::TunnelError::Protocol("unexpected PONG header".into()))
        }
        Proto::Tcpf(list) => {
            if !list.is_empty() {
                peer_flags.install(list);
            }
            Ok(())
        }
        Proto::Tcp(addr) => super::tcp::handle(strm, addr, cancel).await,
        Proto::Udp(addr) => super::udp::handle(strm, addr, cancel).await,
    }
}
