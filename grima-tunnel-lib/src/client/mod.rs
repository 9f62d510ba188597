//! Client core: the session pool, round-robin substream acquisition and the
//! UDP session map.

mod round_robin;
mod timed_conn;
mod udp;

pub use udp::UdpSession;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Result, TunnelError};
use crate::protocol::Proto;
use crate::transport::Substream;
use round_robin::RoundRobin;
use timed_conn::TimedConn;
use udp::UdpMap;

pub struct Client {
    pool: Vec<Mutex<TimedConn>>,
    cursor: RoundRobin,
    udp_map: UdpMap,
    cancel: CancellationToken,
}

impl Client {
    /// Establish `transport.conn` sessions up front. Any failure here is a
    /// startup failure; reconnection only begins once the pool exists.
    pub async fn start(cfg: Arc<Config>, cancel: CancellationToken) -> Result<Arc<Client>> {
        let server = cfg
            .server
            .as_ref()
            .ok_or_else(|| TunnelError::Config("client role requires server.addr".into()))?;
        let net = cfg.network.with_resolved_port();

        let mut pool = Vec::with_capacity(cfg.transport.conn);
        for i in 0..cfg.transport.conn {
            let tc = TimedConn::connect(
                net.clone(),
                cfg.transport.kcp.clone(),
                cfg.network.tcp.rf.clone(),
                server.addr,
                &cancel,
            )
            .await?;
            debug!(slot = i + 1, "client session established");
            pool.push(Mutex::new(tc));
        }
        info!(
            local = %net.port,
            server = %server.addr,
            sessions = pool.len(),
            "client started"
        );

        Ok(Arc::new(Client {
            pool,
            cursor: RoundRobin::new(),
            udp_map: UdpMap::new(),
            cancel,
        }))
    }

    /// Acquire a substream: advance the round-robin cursor, fire a TCPF
    /// refresh, probe the slot and replace it in place when dead, then open.
    /// Retries indefinitely; only cancellation stops it.
    async fn new_stream(&self) -> Result<Substream> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(TunnelError::Cancelled);
            }
            let idx = self.cursor.next(self.pool.len());
            let mut slot = self.pool[idx].lock().await;

            slot.refresh_tcpf().await;

            if let Err(e) = slot.conn().ping(false).await {
                info!(slot = idx, error = %e, "session lost, reconnecting");
                slot.replace(&self.cancel).await?;
            }

            match slot.conn().open_stream().await {
                Ok(strm) => return Ok(strm),
                Err(e) => {
                    debug!(slot = idx, error = %e, "failed to open substream, retrying");
                }
            }
        }
    }

    /// Substream carrying one forwarded TCP connection; the header frame is
    /// already written when this returns.
    pub async fn tcp(&self, target: SocketAddr) -> Result<Substream> {
        let mut strm = self.new_stream().await?;
        if let Err(e) = Proto::Tcp(target).write(&mut strm).await {
            debug!(%target, error = %e, "failed to write TCP header");
            let _ = strm.shutdown().await;
            return Err(e);
        }
        debug!(%target, sid = strm.sid(), "TCP substream established");
        Ok(strm)
    }

    /// Substream for `(local, target)`, reusing a live one when present so
    /// upstream NAT mappings survive. The `reused` flag is false when this
    /// call created the substream (the caller then owns its read half).
    pub async fn udp(
        &self,
        local: SocketAddr,
        target: SocketAddr,
    ) -> Result<(Arc<UdpSession>, bool)> {
        if let Some(entry) = self.udp_map.get(local, target) {
            debug!(%local, %target, sid = entry.sid(), "reusing UDP substream");
            return Ok((entry, true));
        }

        let mut strm = self.new_stream().await?;
        if let Err(e) = Proto::Udp(target).write(&mut strm).await {
            debug!(%target, error = %e, "failed to write UDP header");
            let _ = strm.shutdown().await;
            return Err(e);
        }
        let (entry, raced) = self.udp_map.insert(local, target, strm);
        if !raced {
            debug!(%local, %target, sid = entry.sid(), "established UDP substream");
        }
        Ok((entry, raced))
    }

    /// Evict and close the UDP substream for `key`; unknown keys are a no-op.
    pub async fn close_udp(&self, key: u64) {
        self.udp_map.close(key).await;
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}
