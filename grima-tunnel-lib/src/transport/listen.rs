//! Server-side session acceptance: one shared forge, sessions demultiplexed
//! by peer fingerprint and ARQ conv.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{KcpConfig, NetworkConfig};
use crate::error::{Result, TunnelError};
use crate::forge::Forge;
use crate::hash;
use crate::transport::crypt::{self, BlockCrypt};
use crate::transport::fec::{self, FecDecoder, FecEncoder};
use crate::transport::mux::{MuxConfig, MuxSession};
use crate::transport::session::{KcpSession, OutputSink, SessionHandle};
use crate::transport::TunnelConn;

const SESSION_INPUT_DEPTH: usize = 256;
const ACCEPT_DEPTH: usize = 16;
/// Dead-session sweep cadence, in received datagrams.
const SWEEP_EVERY: u32 = 256;

pub struct Listener {
    forge: Arc<Forge>,
    accept_rx: Mutex<mpsc::Receiver<TunnelConn>>,
    cancel: CancellationToken,
}

impl Listener {
    /// Open the forge and start demultiplexing inbound sessions.
    pub fn bind(
        net: &NetworkConfig,
        kcp_cfg: &KcpConfig,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let forge = Arc::new(Forge::open(net, parent)?);
        let cancel = parent.child_token();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_DEPTH);
        tokio::spawn(demux_task(
            forge.clone(),
            kcp_cfg.clone(),
            accept_tx,
            cancel.clone(),
        ));
        Ok(Self { forge, accept_rx: Mutex::new(accept_rx), cancel })
    }

    /// Next freshly established session. Blocks until a previously unseen
    /// `(peer, conv)` pair shows up on the capture.
    pub async fn accept(&self) -> Result<TunnelConn> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TunnelError::Cancelled),
            conn = rx.recv() => {
                conn.ok_or_else(|| TunnelError::Transport("listener closed".into()))
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.forge.local_addr()
    }

    /// Closing the listener cascades to the forge, which unblocks every
    /// session pump.
    pub fn close(&self) {
        self.cancel.cancel();
        self.forge.close();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

struct SessionEntry {
    handle: SessionHandle,
    input_tx: mpsc::Sender<Vec<u8>>,
}

async fn demux_task(
    forge: Arc<Forge>,
    kcp_cfg: KcpConfig,
    accept_tx: mpsc::Sender<TunnelConn>,
    cancel: CancellationToken,
) {
    let crypt = crypt::new_block(&kcp_cfg.block, &kcp_cfg.key);
    let mut sessions: HashMap<(u64, u32), SessionEntry> = HashMap::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut seen: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let (n, addr) = match forge.read_from(&mut buf).await {
            Ok(item) => item,
            Err(TunnelError::Cancelled) => break,
            Err(TunnelError::DeadlineExceeded) => continue,
            Err(e) => {
                debug!(error = %e, "forge read terminated, stopping listener");
                break;
            }
        };
        if n == 0 {
            continue;
        }
        let plain = match crypt.decrypt(&buf[..n]) {
            Ok(p) => p,
            Err(e) => {
                trace!(%addr, error = %e, "dropping undecryptable datagram");
                continue;
            }
        };
        let Some(conv) = peek_conv(&kcp_cfg, &plain) else {
            continue;
        };

        seen = seen.wrapping_add(1);
        if seen % SWEEP_EVERY == 0 {
            sessions.retain(|_, e| !e.handle.is_dead());
        }

        let key = (hash::ip_addr(&addr), conv);
        if let Some(entry) = sessions.get(&key) {
            if entry.handle.is_dead() {
                sessions.remove(&key);
            } else {
                // Datagram semantics under pressure: drop and let the ARQ
                // retransmit rather than stall every other session.
                let _ = entry.input_tx.try_send(plain);
                continue;
            }
        }

        info!(%addr, conv, "accepted new session");
        match spawn_session(&forge, &kcp_cfg, &crypt, addr, conv, &cancel) {
            Ok((entry, conn)) => {
                let _ = entry.input_tx.try_send(plain);
                sessions.insert(key, entry);
                if let Err(e) = accept_tx.try_send(conn) {
                    warn!(%addr, error = %e, "accept queue full, dropping session");
                    sessions.remove(&key);
                }
            }
            Err(e) => {
                warn!(%addr, error = %e, "failed to establish session");
            }
        }
    }
}

/// The conv is the demux key next to the peer address: with FEC it leads the
/// shard header, otherwise it is the ARQ segment's own first field.
fn peek_conv(kcp_cfg: &KcpConfig, plain: &[u8]) -> Option<u32> {
    if kcp_cfg.fec_enabled() {
        fec::parse_header(plain).map(|(conv, _, _)| conv)
    } else if plain.len() >= 24 {
        Some(kcp::get_conv(plain))
    } else {
        None
    }
}

fn spawn_session(
    forge: &Arc<Forge>,
    kcp_cfg: &KcpConfig,
    crypt: &Arc<dyn BlockCrypt>,
    addr: SocketAddr,
    conv: u32,
    parent: &CancellationToken,
) -> Result<(SessionEntry, TunnelConn)> {
    let cancel = parent.child_token();

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

    let sink = OutputSink::new(forge.clone(), addr, crypt.clone(), fec_enc);
    let session = KcpSession::new(conv, kcp_cfg, Box::new(sink), cancel.clone());
    let handle = session.handle();

    let (input_tx, input_rx) = mpsc::channel(SESSION_INPUT_DEPTH);
    tokio::spawn(session_input_task(input_rx, fec_dec, handle.clone(), cancel.clone()));

    let mux = MuxSession::new(
        session,
        addr,
        MuxConfig {
            window: kcp_cfg.mux_window,
            keepalive: Duration::from_secs(kcp_cfg.mux_keepalive),
            dialer: false,
        },
        cancel.clone(),
    );

    let conn = TunnelConn::new(mux, handle.clone(), forge.clone(), false, cancel, addr);
    Ok((SessionEntry { handle, input_tx }, conn))
}

/// Per-session input: unwrap FEC and feed the ARQ.
async fn session_input_task(
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    mut fec_dec: Option<FecDecoder>,
    handle: SessionHandle,
    cancel: CancellationToken,
) {
    let mut segments = Vec::new();
    loop {
        let plain = tokio::select! {
            _ = cancel.cancelled() => break,
            pkt = input_rx.recv() => match pkt {
                Some(p) => p,
                None => break,
            },
        };
        if handle.is_dead() {
            break;
        }
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
            None => handle.input(&plain),
        }
    }
}
