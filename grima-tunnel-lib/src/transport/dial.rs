//! Client-side session establishment: new forge, then cipher + FEC + ARQ +
//! mux stacked over it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::{KcpConfig, NetworkConfig};
use crate::error::{Result, TunnelError};
use crate::forge::Forge;
use crate::transport::crypt::{self, BlockCrypt};
use crate::transport::fec::{FecDecoder, FecEncoder};
use crate::transport::mux::{MuxConfig, MuxSession};
use crate::transport::session::{KcpSession, OutputSink, SessionHandle};
use crate::transport::TunnelConn;

/// Dial the server through a freshly opened forge. The network config must
/// carry a resolved port.
pub async fn dial(
    net: &NetworkConfig,
    kcp_cfg: &KcpConfig,
    remote: SocketAddr,
    parent: &CancellationToken,
) -> Result<TunnelConn> {
    let forge = Arc::new(Forge::open(net, parent)?);
    let cancel = parent.child_token();
    let conv: u32 = rand::random();
    let crypt = crypt::new_block(&kcp_cfg.block, &kcp_cfg.key);

    let fec_enc = if kcp_cfg.fec_enabled() {
        Some(FecEncoder::new(conv, kcp_cfg.dshard, kcp_cfg.pshard)?)
    } else {
        None
    };
    let fec_dec = if kcp_cfg.fec_enabled() {
        Some(FecDecoder::new(conv, kcp_cfg.dshard, kcp_cfg.pshard)?)
    } else {
        None
    };

    let sink = OutputSink::new(forge.clone(), remote, crypt.clone(), fec_enc);
    let session = KcpSession::new(conv, kcp_cfg, Box::new(sink), cancel.clone());
    let handle = session.handle();

    tokio::spawn(input_pump(
        forge.clone(),
        remote,
        crypt,
        fec_dec,
        handle.clone(),
        cancel.clone(),
    ));

    let mux = MuxSession::new(
        session,
        remote,
        MuxConfig {
            window: kcp_cfg.mux_window,
            keepalive: Duration::from_secs(kcp_cfg.mux_keepalive),
            dialer: true,
        },
        cancel.clone(),
    );

    debug!(%remote, conv, "session dialed");
    Ok(TunnelConn::new(mux, handle, forge, true, cancel, remote))
}

/// Read datagrams off the forge and feed this session's ARQ. The capture
/// sees every frame on the local port, so anything not from the session peer
/// or not carrying our conv is skipped.
async fn input_pump(
    forge: Arc<Forge>,
    remote: SocketAddr,
    crypt: Arc<dyn BlockCrypt>,
    mut fec_dec: Option<FecDecoder>,
    handle: SessionHandle,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; 64 * 1024];
    let mut segments = Vec::new();
    loop {
        if cancel.is_cancelled() || handle.is_dead() {
            break;
        }
        let (n, addr) = match forge.read_from(&mut buf).await {
            Ok(item) => item,
            Err(TunnelError::Cancelled) => break,
            Err(TunnelError::DeadlineExceeded) => continue,
            Err(e) => {
                debug!(error = %e, "forge read terminated, closing session");
                handle.close();
                break;
            }
        };
        if n == 0 || addr != remote {
            continue;
        }
        let plain = match crypt.decrypt(&buf[..n]) {
            Ok(p) => p,
            Err(e) => {
                trace!(error = %e, "dropping undecryptable datagram");
                continue;
            }
        };
        match &mut fec_dec {
            Some(dec) => {
                segments.clear();
                if let Err(e) = dec.decode(&plain, &mut segments) {
                    trace!(error = %e, "dropping malformed FEC datagram");
                    continue;
                }
                for seg in segments.drain(..) {
                    handle.input(&seg);
                }
            }
            None => {
                if plain.len() >= 24 && kcp::get_conv(&plain) == handle.conv() {
                    handle.input(&plain);
                }
            }
        }
    }
}
