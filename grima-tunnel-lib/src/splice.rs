//! Bidirectional copy shared by the server handlers and the forwarders.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TunnelError};

/// Copy both directions until one side errors or closes; the first failure
/// decides, and cancellation shuts both sides down.
pub(crate) async fn splice<A, B>(a: &mut A, b: &mut B, cancel: CancellationToken) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let result = tokio::select! {
        _ = cancel.cancelled() => Ok((0, 0)),
        res = tokio::io::copy_bidirectional(a, b) => res,
    };

    let _ = a.shutdown().await;
    let _ = b.shutdown().await;
    result.map(|_| ()).map_err(TunnelError::Io)
}
