//! The packet forge: a connectionless datagram socket whose wire form is
//! hand-crafted TCP segments injected and captured through libpcap.

mod capture;
mod flags;
pub(crate) mod frame;
mod recv;
mod send;

pub use flags::{FlagIter, TcpFlags};

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pcap::Direction;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::NetworkConfig;
use crate::error::{Result, TunnelError};
use recv::RecvItem;
use send::SendHandle;

const RECV_CHANNEL_DEPTH: usize = 1024;

/// One forge = one send handle + one BPF-filtered receive handle on the
/// configured interface. Presents `read_from`/`write_to` datagram semantics
/// to the reliable layer above.
pub struct Forge {
    send: SendHandle,
    recv: Mutex<mpsc::Receiver<RecvItem>>,
    local: SocketAddr,
    /// Milliseconds since the epoch; 0 means no deadline.
    read_deadline: AtomicU64,
    write_deadline: AtomicU64,
    cancel: CancellationToken,
}

impl Forge {
    /// Open both capture handles. The network config must already carry a
    /// resolved (non-zero) port; `NetworkConfig::with_resolved_port` is
    /// applied once by the client/server startup so that every session shares
    /// one source port.
    pub fn open(cfg: &NetworkConfig, parent: &CancellationToken) -> Result<Self> {
        let cfg = cfg.with_resolved_port();
        let send = SendHandle::new(&cfg)?;

        let mut recv_cap = capture::open_capture(&cfg, Direction::In)?;
        recv_cap.filter(&format!("tcp and dst port {}", cfg.port), true)?;

        let cancel = parent.child_token();
        let (tx, rx) = mpsc::channel(RECV_CHANNEL_DEPTH);
        recv::spawn_recv_pump(recv_cap, tx, cancel.clone())?;

        let local = match (&cfg.ipv4, &cfg.ipv6) {
            (Some(v4), _) => SocketAddr::new(IpAddr::V4(v4.addr), cfg.port),
            (None, Some(v6)) => SocketAddr::new(IpAddr::V6(v6.addr), cfg.port),
            (None, None) => {
                return Err(TunnelError::Config(
                    "at least one of network.ipv4 and network.ipv6 is required".into(),
                ))
            }
        };

        debug!(%local, interface = %cfg.interface.name, "forge opened");
        Ok(Self {
            send,
            recv: Mutex::new(rx),
            local,
            read_deadline: AtomicU64::new(0),
            write_deadline: AtomicU64::new(0),
            cancel,
        })
    }

    /// Receive one datagram. Zero-length reads are normal (frames whose
    /// layers did not fully decode); callers skip them.
    pub async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let mut rx = self.recv.lock().await;
        let item = match deadline_in(&self.read_deadline)? {
            Some(remaining) => tokio::select! {
                _ = self.cancel.cancelled() => return Err(TunnelError::Cancelled),
                item = tokio::time::timeout(remaining, rx.recv()) => {
                    item.map_err(|_| TunnelError::DeadlineExceeded)?
                }
            },
            None => tokio::select! {
                _ = self.cancel.cancelled() => return Err(TunnelError::Cancelled),
                item = rx.recv() => item,
            },
        };
        match item {
            Some(Ok((payload, addr))) => {
                let n = payload.len().min(buf.len());
                buf[..n].copy_from_slice(&payload[..n]);
                Ok((n, addr))
            }
            Some(Err(e)) => Err(e),
            None => Err(TunnelError::Transport("capture handle closed".into())),
        }
    }

    /// Forge one TCP-shaped frame around `payload` and inject it.
    pub fn write_to(&self, payload: &[u8], dst: SocketAddr) -> Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }
        deadline_in(&self.write_deadline)?;
        self.send.write_to(payload, dst)
    }

    /// Install a per-peer flag override learned from a TCPF frame.
    pub fn set_peer_flags(&self, addr: &SocketAddr, list: Vec<TcpFlags>) {
        self.send.set_peer_flags(addr, list);
    }

    /// Configured source address of the preferred family.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn set_read_deadline(&self, deadline: Option<SystemTime>) {
        store_deadline(&self.read_deadline, deadline);
    }

    pub fn set_write_deadline(&self, deadline: Option<SystemTime>) {
        store_deadline(&self.write_deadline, deadline);
    }

    /// Cancels the capture pump and unblocks every pending read.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Forge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Forge exactly one frame without standing up the receive side; the `ping`
/// subcommand's whole job.
pub fn send_raw(cfg: &NetworkConfig, dst: SocketAddr, payload: &[u8]) -> Result<()> {
    let cfg = cfg.with_resolved_port();
    let handle = SendHandle::new(&cfg)?;
    handle.write_to(payload, dst)?;
    Ok(())
}

fn store_deadline(slot: &AtomicU64, deadline: Option<SystemTime>) {
    let ms = deadline
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    slot.store(ms, Ordering::Relaxed);
}

/// Remaining time until the stored deadline: `None` when unset, an error when
/// already expired.
fn deadline_in(slot: &AtomicU64) -> Result<Option<Duration>> {
    let ms = slot.load(Ordering::Relaxed);
    if ms == 0 {
        return Ok(None);
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    if now >= ms {
        return Err(TunnelError::DeadlineExceeded);
    }
    Ok(Some(Duration::from_millis(ms - now)))
}
