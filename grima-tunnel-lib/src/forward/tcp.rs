//! Local TCP listener bridged into TCP substreams.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::error::Result;
use crate::splice::splice;

pub(crate) async fn listen(
    client: Arc<Client>,
    listen: SocketAddr,
    target: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(listen).await.map_err(|e| {
        error!(%listen, error = %e, "failed to bind TCP forwarder");
        crate::error::TunnelError::Io(e)
    })?;
    info!(%listen, %target, "TCP forwarder listening");

    let tracker = TaskTracker::new();
    loop {
        let (conn, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(%listen, error = %e, "failed to accept connection");
                    continue;
                }
            },
        };
        info!(%peer, %target, "accepted TCP connection");
        let client = client.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            if let Err(e) = handle_conn(client, conn, target, cancel).await {
                if !e.is_cancelled() {
                    error!(%peer, %target, error = %e, "TCP connection closed with error");
                }
            } else {
                debug!(%peer, %target, "TCP connection closed");
            }
        });
    }
    tracker.close();
    tracker.wait().await;
    Ok(())
}

async fn handle_conn(
    client: Arc<Client>,
    mut conn: TcpStream,
    target: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let mut strm = client.tcp(target).await?;
    splice(&mut conn, &mut strm, cancel).await
}
