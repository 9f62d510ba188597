//! Stream multiplexing over one reliable byte stream.
//!
//! Frames are `[ver u8][cmd u8][len u16 LE][sid u32 LE]` followed by `len`
//! payload bytes. Commands: SYN opens a substream, FIN closes one, PSH
//! carries data, NOP is a keepalive. The dialing side allocates odd SIDs,
//! the accepting side even ones, so both ends can open streams without
//! coordination.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace};

use crate::error::{Result, TunnelError};

const VERSION: u8 = 1;
const HEADER_LEN: usize = 8;
const CMD_SYN: u8 = 0;
const CMD_FIN: u8 = 1;
const CMD_PSH: u8 = 2;
const CMD_NOP: u8 = 3;

/// Largest payload carried by one PSH frame.
const MAX_FRAME_PAYLOAD: usize = 16 * 1024;
/// Queue between substream writers and the session writer task.
const OUT_QUEUE_DEPTH: usize = 256;
/// Pending accepted-but-unclaimed substreams.
const ACCEPT_QUEUE_DEPTH: usize = 64;

#[derive(Debug)]
struct Frame {
    cmd: u8,
    sid: u32,
    data: Bytes,
}

struct MuxShared {
    streams: StdMutex<HashMap<u32, mpsc::Sender<Bytes>>>,
    next_sid: AtomicU32,
    window: usize,
    remote_addr: SocketAddr,
    out_tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    last_recv: StdMutex<std::time::Instant>,
}

impl MuxShared {
    fn streams(&self) -> std::sync::MutexGuard<'_, HashMap<u32, mpsc::Sender<Bytes>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) struct MuxConfig {
    pub window: usize,
    pub keepalive: Duration,
    pub dialer: bool,
}

/// One multiplexed session over `transport`.
pub(crate) struct MuxSession {
    shared: Arc<MuxShared>,
    accept_rx: Mutex<mpsc::Receiver<Substream>>,
}

impl MuxSession {
    /// Splits `transport` and spawns the reader, writer and keepalive tasks.
    /// `cancel` governs the whole session; cancelling it releases every
    /// substream.
    pub fn new<T>(
        transport: T,
        remote_addr: SocketAddr,
        cfg: MuxConfig,
        cancel: CancellationToken,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        let (out_tx, out_rx) = mpsc::channel(OUT_QUEUE_DEPTH);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);

        let shared = Arc::new(MuxShared {
            streams: StdMutex::new(HashMap::new()),
            next_sid: AtomicU32::new(if cfg.dialer { 1 } else { 2 }),
            window: cfg.window.max(1),
            remote_addr,
            out_tx,
            cancel: cancel.clone(),
            last_recv: StdMutex::new(std::time::Instant::now()),
        });

        tokio::spawn(writer_task(write_half, out_rx, cancel.clone()));
        tokio::spawn(reader_task(read_half, shared.clone(), accept_tx, cancel.clone()));
        if !cfg.keepalive.is_zero() {
            tokio::spawn(keepalive_task(shared.clone(), cfg.keepalive));
        }

        Self { shared, accept_rx: Mutex::new(accept_rx) }
    }

    pub async fn open_stream(&self) -> Result<Substream> {
        if self.shared.cancel.is_cancelled() {
            return Err(TunnelError::Transport("session closed".into()));
        }
        let sid = self.shared.next_sid.fetch_add(2, Ordering::Relaxed);
        // Register before the SYN leaves so an immediate reply finds the slot.
        let stream = register_stream(&self.shared, sid);
        if self
            .shared
            .out_tx
            .send(Frame { cmd: CMD_SYN, sid, data: Bytes::new() })
            .await
            .is_err()
        {
            self.shared.streams().remove(&sid);
            return Err(TunnelError::Transport("session writer gone".into()));
        }
        Ok(stream)
    }

    pub async fn accept_stream(&self) -> Result<Substream> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            _ = self.shared.cancel.cancelled() => Err(TunnelError::Cancelled),
            stream = rx.recv() => {
                stream.ok_or_else(|| TunnelError::Transport("session closed".into()))
            }
        }
    }

    pub fn close(&self) {
        self.shared.cancel.cancel();
        self.shared.streams().clear();
    }
}

fn register_stream(shared: &Arc<MuxShared>, sid: u32) -> Substream {
    let (data_tx, data_rx) = mpsc::channel(shared.window);
    shared.streams().insert(sid, data_tx);
    Substream {
        sid,
        remote_addr: shared.remote_addr,
        rx: data_rx,
        leftover: Bytes::new(),
        out: PollSender::new(shared.out_tx.clone()),
        shared: shared.clone(),
        fin_sent: false,
    }
}

async fn writer_task<W>(
    mut writer: W,
    mut out_rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Send + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = out_rx.recv() => match frame {
                Some(f) => f,
                None => break,
            },
        };
        header[0] = VERSION;
        header[1] = frame.cmd;
        header[2..4].copy_from_slice(&(frame.data.len() as u16).to_le_bytes());
        header[4..8].copy_from_slice(&frame.sid.to_le_bytes());
        if let Err(e) = writer.write_all(&header).await {
            debug!(error = %e, "mux writer failed");
            break;
        }
        if !frame.data.is_empty() {
            if let Err(e) = writer.write_all(&frame.data).await {
                debug!(error = %e, "mux writer failed");
                break;
            }
        }
        if let Err(e) = writer.flush().await {
            debug!(error = %e, "mux writer failed");
            break;
        }
    }
    cancel.cancel();
}

async fn reader_task<R>(
    mut reader: R,
    shared: Arc<MuxShared>,
    accept_tx: mpsc::Sender<Substream>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            r = reader.read_exact(&mut header) => r,
        };
        if read.is_err() {
            break;
        }
        *shared.last_recv.lock().unwrap_or_else(PoisonError::into_inner) =
            std::time::Instant::now();
        if header[0] != VERSION {
            debug!(version = header[0], "unknown mux version");
            break;
        }
        let cmd = header[1];
        let len = usize::from(u16::from_le_bytes([header[2], header[3]]));
        let sid = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let mut data = vec![0u8; len];
        if len != 0 {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                r = reader.read_exact(&mut data) => r,
            };
            if read.is_err() {
                break;
            }
        }

        match cmd {
            CMD_SYN => {
                let stream = register_stream(&shared, sid);
                if accept_tx.try_send(stream).is_err() {
                    debug!(sid, "accept queue full, rejecting substream");
                    shared.streams().remove(&sid);
                }
            }
            CMD_PSH => {
                let tx = shared.streams().get(&sid).cloned();
                if let Some(tx) = tx {
                    // Bounded per-substream buffer: a stalled consumer exerts
                    // backpressure on the whole session here.
                    if tx.send(Bytes::from(data)).await.is_err() {
                        shared.streams().remove(&sid);
                    }
                } else {
                    trace!(sid, "dropping data for unknown substream");
                }
            }
            CMD_FIN => {
                shared.streams().remove(&sid);
            }
            CMD_NOP => {}
            other => {
                debug!(cmd = other, "unknown mux command");
                break;
            }
        }
    }
    // Releasing the senders ends every substream with EOF once buffers drain.
    shared.streams().clear();
    cancel.cancel();
}

/// Send NOP probes and declare the session dead when the peer has been
/// silent for three probe intervals.
async fn keepalive_task(shared: Arc<MuxShared>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let silent = shared
            .last_recv
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed();
        if silent > every * 3 {
            debug!(silent_ms = silent.as_millis() as u64, "peer silent, closing session");
            shared.cancel.cancel();
            break;
        }
        if shared
            .out_tx
            .send(Frame { cmd: CMD_NOP, sid: 0, data: Bytes::new() })
            .await
            .is_err()
        {
            break;
        }
    }
}

/// One bidirectional byte channel over a mux session.
pub struct Substream {
    sid: u32,
    remote_addr: SocketAddr,
    rx: mpsc::Receiver<Bytes>,
    leftover: Bytes,
    out: PollSender<Frame>,
    shared: Arc<MuxShared>,
    fin_sent: bool,
}

impl Substream {
    pub fn sid(&self) -> u32 {
        self.sid
    }

    /// Address of the session peer; the server's TCPF install path keys its
    /// flag overrides by this.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

impl AsyncRead for Substream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.leftover.is_empty() {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.leftover = chunk,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = self.leftover.len().min(buf.remaining());
        buf.put_slice(&self.leftover.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Substream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.shared.cancel.is_cancelled() || self.fin_sent {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        match self.out.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Poll::Pending => return Poll::Pending,
        }
        let n = data.len().min(MAX_FRAME_PAYLOAD);
        let frame = Frame {
            cmd: CMD_PSH,
            sid: self.sid,
            data: Bytes::copy_from_slice(&data[..n]),
        };
        if self.out.send_item(frame).is_err() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.fin_sent || self.shared.cancel.is_cancelled() {
            return Poll::Ready(Ok(()));
        }
        match self.out.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => return Poll::Ready(Ok(())),
            Poll::Pending => return Poll::Pending,
        }
        let sid = self.sid;
        let _ = self.out.send_item(Frame { cmd: CMD_FIN, sid, data: Bytes::new() });
        self.fin_sent = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for Substream {
    fn drop(&mut self) {
        self.shared.streams().remove(&self.sid);
        if !self.fin_sent && !self.shared.cancel.is_cancelled() {
            let _ = self
                .shared
                .out_tx
                .try_send(Frame { cmd: CMD_FIN, sid: self.sid, data: Bytes::new() });
        }
    }
}
