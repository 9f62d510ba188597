//! One reliable ARQ leg over the forge: the `kcp` state machine driven by an
//! update task, with the cipher and FEC layers applied in its output sink.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use kcp::Kcp;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::KcpConfig;
use crate::error::TunnelError;
use crate::forge::Forge;
use crate::transport::crypt::BlockCrypt;
use crate::transport::fec::FecEncoder;

/// Largest slice handed to the ARQ per write; keeps segment fragmentation
/// well under the protocol's fragment limit.
const MAX_WRITE: usize = 32 * 1024;

/// Everything the ARQ emits goes through here: FEC sharding, then the
/// cipher, then one forged frame per datagram.
pub(crate) struct OutputSink {
    forge: Arc<Forge>,
    remote: SocketAddr,
    crypt: Arc<dyn BlockCrypt>,
    fec: Option<FecEncoder>,
    stage: Vec<Vec<u8>>,
}

impl OutputSink {
    pub fn new(
        forge: Arc<Forge>,
        remote: SocketAddr,
        crypt: Arc<dyn BlockCrypt>,
        fec: Option<FecEncoder>,
    ) -> Self {
        Self { forge, remote, crypt, fec, stage: Vec::new() }
    }
}

impl Write for OutputSink {
    fn write(&mut self, segment: &[u8]) -> io::Result<usize> {
        self.stage.clear();
        match &mut self.fec {
            Some(fec) => fec.encode(segment, &mut self.stage),
            None => self.stage.push(segment.to_vec()),
        }
        for pkt in self.stage.drain(..) {
            let wire = self.crypt.encrypt(&pkt);
            self.forge
                .write_to(&wire, self.remote)
                .map_err(io::Error::other)?;
        }
        Ok(segment.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Anything the ARQ can flush segments into; the production sink is
/// [`OutputSink`], tests substitute channel-backed writers.
pub(crate) type SegmentSink = Box<dyn Write + Send>;

struct KcpCore {
    kcp: Kcp<SegmentSink>,
    /// Message larger than the caller's buffer, served across reads.
    pending: Vec<u8>,
    pending_off: usize,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

struct SessionInner {
    core: Mutex<KcpCore>,
    update: Notify,
    cancel: CancellationToken,
    dead: AtomicBool,
    conv: u32,
    start: Instant,
    snd_queue_limit: usize,
}

impl SessionInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, KcpCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }

    fn mark_dead(&self) {
        self.dead.store(true, Ordering::Relaxed);
        let (r, w) = {
            let mut core = self.lock();
            (core.read_waker.take(), core.write_waker.take())
        };
        if let Some(w) = r {
            w.wake();
        }
        if let Some(w) = w {
            w.wake();
        }
        self.update.notify_one();
    }
}

/// Owned by the mux; readable/writable ordered byte stream.
pub(crate) struct KcpSession {
    inner: Arc<SessionInner>,
}

/// Cloneable handle used by the datagram input pumps.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl KcpSession {
    pub fn new(conv: u32, cfg: &KcpConfig, sink: SegmentSink, cancel: CancellationToken) -> Self {
        let mut kcp = Kcp::new_stream(conv, sink);
        if let Err(e) = kcp.set_mtu(cfg.mtu) {
            debug!(error = %e, mtu = cfg.mtu, "mtu rejected, keeping default");
        }
        kcp.set_nodelay(true, 10, 2, true);
        kcp.set_wndsize(cfg.sndwnd, cfg.rcvwnd);

        let inner = Arc::new(SessionInner {
            core: Mutex::new(KcpCore {
                kcp,
                pending: Vec::new(),
                pending_off: 0,
                read_waker: None,
                write_waker: None,
            }),
            update: Notify::new(),
            cancel,
            dead: AtomicBool::new(false),
            conv,
            start: Instant::now(),
            snd_queue_limit: usize::from(cfg.sndwnd) * 2,
        });
        spawn_update_task(inner.clone());
        Self { inner }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle { inner: self.inner.clone() }
    }
}

impl Drop for KcpSession {
    fn drop(&mut self) {
        self.inner.mark_dead();
        self.inner.cancel.cancel();
    }
}

impl SessionHandle {
    /// Feed one decoded ARQ segment. A conv mismatch means the peer restarted
    /// with a new session; this one is dead from that point on.
    pub fn input(&self, pkt: &[u8]) {
        if self.is_dead() {
            return;
        }
        let waker = {
            let mut core = self.inner.lock();
            match core.kcp.input(pkt) {
                Ok(_) => {}
                Err(kcp::Error::ConvInconsistent(expected, actual)) => {
                    drop(core);
                    debug!(expected, actual, "conv mismatch, marking session dead");
                    self.inner.mark_dead();
                    return;
                }
                Err(e) => {
                    trace!(error = %e, "discarded undecodable segment");
                    return;
                }
            }
            if core.kcp.peeksize().is_ok() {
                core.read_waker.take()
            } else {
                None
            }
        };
        if let Some(w) = waker {
            w.wake();
        }
        self.inner.update.notify_one();
    }

    pub fn is_dead(&self) -> bool {
        self.inner.dead.load(Ordering::Relaxed) || self.inner.cancel.is_cancelled()
    }

    pub fn conv(&self) -> u32 {
        self.inner.conv
    }

    pub fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.mark_dead();
    }
}

fn spawn_update_task(inner: Arc<SessionInner>) {
    tokio::spawn(async move {
        loop {
            if inner.cancel.is_cancelled() || inner.dead.load(Ordering::Relaxed) {
                break;
            }
            let (delay, read_waker, write_waker) = {
                let mut core = inner.lock();
                let now = inner.now_ms();
                if let Err(e) = core.kcp.update(now) {
                    debug!(error = %e, "ARQ update failed");
                    drop(core);
                    inner.mark_dead();
                    break;
                }
                if core.kcp.is_dead_link() {
                    debug!(conv = inner.conv, "ARQ link declared dead");
                    drop(core);
                    inner.mark_dead();
                    break;
                }
                let next = core.kcp.check(now);
                let read_waker = if core.kcp.peeksize().is_ok() {
                    core.read_waker.take()
                } else {
                    None
                };
                let write_waker = if core.kcp.wait_snd() < inner.snd_queue_limit {
                    core.write_waker.take()
                } else {
                    None
                };
                (next.saturating_sub(now).clamp(1, 100), read_waker, write_waker)
            };
            if let Some(w) = read_waker {
                w.wake();
            }
            if let Some(w) = write_waker {
                w.wake();
            }
            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                _ = inner.update.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(u64::from(delay))) => {}
            }
        }
        inner.mark_dead();
    });
}

impl AsyncRead for KcpSession {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut core = self.inner.lock();

        if core.pending_off < core.pending.len() {
            let n = buf.remaining().min(core.pending.len() - core.pending_off);
            buf.put_slice(&core.pending[core.pending_off..core.pending_off + n]);
            core.pending_off += n;
            if core.pending_off == core.pending.len() {
                core.pending.clear();
                core.pending_off = 0;
            }
            return Poll::Ready(Ok(()));
        }

        match core.kcp.peeksize() {
            Ok(size) => {
                let dst = buf.initialize_unfilled();
                if size <= dst.len() {
                    match core.kcp.recv(dst) {
                        Ok(n) => {
                            buf.advance(n);
                            Poll::Ready(Ok(()))
                        }
                        Err(e) => Poll::Ready(Err(io::Error::other(e))),
                    }
                } else {
                    let KcpCore { kcp, pending, .. } = &mut *core;
                    pending.resize(size, 0);
                    match kcp.recv(pending.as_mut_slice()) {
                        Ok(n) => {
                            pending.truncate(n);
                            core.pending_off = 0;
                            drop(core);
                            // Serve the first chunk from the freshly filled buffer.
                            self.poll_read(cx, buf)
                        }
                        Err(e) => {
                            core.pending.clear();
                            Poll::Ready(Err(io::Error::other(e)))
                        }
                    }
                }
            }
            Err(_) => {
                if self.inner.dead.load(Ordering::Relaxed) || self.inner.cancel.is_cancelled() {
                    // EOF: the link is gone and nothing is buffered.
                    return Poll::Ready(Ok(()));
                }
                core.read_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl AsyncWrite for KcpSession {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.inner.dead.load(Ordering::Relaxed) || self.inner.cancel.is_cancelled() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                TunnelError::Transport("session is dead".into()),
            )));
        }
        let mut core = self.inner.lock();
        if core.kcp.wait_snd() >= self.inner.snd_queue_limit {
            core.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let chunk = &data[..data.len().min(MAX_WRITE)];
        match core.kcp.send(chunk) {
            Ok(n) => {
                drop(core);
                self.inner.update.notify_one();
                Poll::Ready(Ok(n))
            }
            Err(e) => Poll::Ready(Err(io::Error::other(e))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.update.notify_one();
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
