//! Server core: accept sessions forever, accept substreams forever, dispatch
//! each by its protocol header.

mod handle;
mod tcp;
mod udp;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{Result, TunnelError};
use crate::transport::Listener;

pub struct Server {
    cfg: Arc<Config>,
}

impl Server {
    pub fn new(cfg: Arc<Config>) -> Self {
        Self { cfg }
    }

    /// Runs until cancellation; returns once every session task has drained.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let listen = self
            .cfg
            .listen
            .as_ref()
            .ok_or_else(|| TunnelError::Config("server role requires listen.addr".into()))?;
        let net = self.cfg.network.with_resolved_port();
        let listener = Listener::bind(&net, &self.cfg.transport.kcp, &cancel)?;
        info!(advertised = %listen.addr, capture = %listener.local_addr(), "server started");

        let tracker = TaskTracker::new();
        loop {
            let conn = tokio::select! {
                _ = cancel.cancelled() => break,
                conn = listener.accept() => match conn {
                    Ok(conn) => conn,
                    Err(TunnelError::Cancelled) => break,
                    Err(e) => {
                        error!(error = %e, "failed to accept session");
                        break;
                    }
                },
            };
            info!(remote = %conn.remote_addr(), "accepted session");
            let cancel = cancel.clone();
            tracker.spawn(async move {
                handle::handle_conn(conn, cancel).await;
            });
        }

        listener.close();
        tracker.close();
        tracker.wait().await;
        info!("server shutdown complete");
        Ok(())
    }
}
