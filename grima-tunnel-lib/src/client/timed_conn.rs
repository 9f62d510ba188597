//! One pool slot: a reliable session plus the machinery to rebuild it in
//! place when it dies.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{KcpConfig, NetworkConfig};
use crate::error::{Result, TunnelError};
use crate::forge::TcpFlags;
use crate::protocol::Proto;
use crate::transport::{self, TunnelConn};

/// Lifetime extension granted on every successful rebuild.
const AUTO_EXPIRE: Duration = Duration::from_secs(300);
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

pub(crate) struct TimedConn {
    conn: TunnelConn,
    expire: Instant,
    net: NetworkConfig,
    kcp: KcpConfig,
    rf: Vec<TcpFlags>,
    remote: SocketAddr,
}

impl TimedConn {
    pub async fn connect(
        net: NetworkConfig,
        kcp: KcpConfig,
        rf: Vec<TcpFlags>,
        remote: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let conn = create_conn(&net, &kcp, &rf, remote, cancel).await?;
        Ok(Self { conn, expire: Instant::now() + AUTO_EXPIRE, net, kcp, rf, remote })
    }

    pub fn conn(&self) -> &TunnelConn {
        &self.conn
    }

    /// Fire-and-forget TCPF refresh: open a substream now, let the frame
    /// write and close run detached. Nothing waits on the outcome.
    pub async fn refresh_tcpf(&self) {
        if self.rf.is_empty() {
            return;
        }
        match self.conn.open_stream().await {
            Ok(mut strm) => {
                let rf = self.rf.clone();
                tokio::spawn(async move {
                    let _ = Proto::Tcpf(rf).write(&mut strm).await;
                    let _ = strm.shutdown().await;
                });
            }
            Err(e) => debug!(error = %e, "TCPF refresh skipped"),
        }
    }

    /// Rebuild the session with unbounded retry and 1 s backoff, preserving
    /// this slot's identity. Only cancellation breaks the loop.
    pub async fn replace(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.conn.close();
        loop {
            if cancel.is_cancelled() {
                return Err(TunnelError::Cancelled);
            }
            match create_conn(&self.net, &self.kcp, &self.rf, self.remote, cancel).await {
                Ok(conn) => {
                    self.conn = conn;
                    self.expire = Instant::now() + AUTO_EXPIRE;
                    debug!(expires_at = ?self.expire, "session replaced in place");
                    return Ok(());
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    debug!(error = %e, "redial failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
                        _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                    }
                }
            }
        }
    }

    pub fn close(&self) {
        self.conn.close();
    }
}

/// Dial through a fresh forge, then advertise the reply flag list so the
/// server frames its packets back to us the way we asked.
async fn create_conn(
    net: &NetworkConfig,
    kcp: &KcpConfig,
    rf: &[TcpFlags],
    remote: SocketAddr,
    cancel: &CancellationToken,
) -> Result<TunnelConn> {
    let conn = transport::dial(net, kcp, remote, cancel).await?;
    if !rf.is_empty() {
        let mut strm = conn.open_stream().await?;
        Proto::Tcpf(rf.to_vec()).write(&mut strm).await?;
        let _ = strm.shutdown().await;
    }
    Ok(conn)
}
