//! Upstream TCP dial and splice for `TCP{addr}` substreams.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Result, TunnelError};
use crate::splice::splice;
use crate::transport::Substream;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) async fn handle(
    mut strm: Substream,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    info!(sid = strm.sid(), %addr, "TCP forward");
    let upstream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| TunnelError::Transport(format!("dial {addr} timed out")))?
        .map_err(|e| TunnelError::Transport(format!("dial {addr} failed: {e}")))?;
    debug!(sid = strm.sid(), %addr, "upstream connected");

    let mut upstream = upstream;
    splice(&mut strm, &mut upstream, cancel).await
}
