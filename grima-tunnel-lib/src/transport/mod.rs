//! The reliable, encrypted, multiplexed transport between two forges.
//!
//! Composition order is fixed: cipher outside FEC outside ARQ outside forge.

pub(crate) mod crypt;
pub(crate) mod fec;
pub(crate) mod mux;
pub(crate) mod session;

mod dial;
mod listen;

pub use dial::dial;
pub use listen::Listener;
pub use mux::Substream;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TunnelError};
use crate::forge::Forge;
use crate::protocol::Proto;

/// One reliable session leg: ARQ + mux over a forge. Client sessions own
/// their forge; server sessions share the listener's.
pub struct TunnelConn {
    mux: mux::MuxSession,
    session: session::SessionHandle,
    forge: Arc<Forge>,
    owns_forge: bool,
    cancel: CancellationToken,
    remote: SocketAddr,
}

impl TunnelConn {
    pub(crate) fn new(
        mux: mux::MuxSession,
        session: session::SessionHandle,
        forge: Arc<Forge>,
        owns_forge: bool,
        cancel: CancellationToken,
        remote: SocketAddr,
    ) -> Self {
        Self { mux, session, forge, owns_forge, cancel, remote }
    }

    pub async fn open_stream(&self) -> Result<Substream> {
        if self.session.is_dead() {
            return Err(TunnelError::Transport("session is dead".into()));
        }
        self.mux.open_stream().await
    }

    pub async fn accept_stream(&self) -> Result<Substream> {
        self.mux.accept_stream().await
    }

    /// Liveness probe. Without `wait` this only verifies a substream can
    /// still be opened; with it, a PING/PONG is exchanged over the wire.
    pub async fn ping(&self, wait: bool) -> Result<()> {
        let mut strm = self.open_stream().await?;
        if wait {
            Proto::Ping.write(&mut strm).await?;
            match Proto::read(&mut strm).await? {
                Proto::Pong => {}
                other => {
                    return Err(TunnelError::Protocol(format!(
                        "expected PONG, got {other:?}"
                    )))
                }
            }
        }
        let _ = strm.shutdown().await;
        Ok(())
    }

    /// The flag-override install path needs to know which peer a substream
    /// came from; everything on this session shares one remote.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.forge.local_addr()
    }

    /// The forge carrying this session; the server's TCPF install path goes
    /// through it.
    pub(crate) fn forge(&self) -> Arc<Forge> {
        self.forge.clone()
    }

    pub fn is_dead(&self) -> bool {
        self.session.is_dead()
    }

    pub fn close(&self) {
        self.mux.close();
        self.session.close();
        self.cancel.cancel();
        if self.owns_forge {
            self.forge.close();
        }
    }
}

impl Drop for TunnelConn {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::KcpConfig;
    use crate::transport::crypt::{new_block, BlockCrypt};
    use crate::transport::fec::{FecDecoder, FecEncoder};
    use crate::transport::mux::{MuxConfig, MuxSession};
    use crate::transport::session::{KcpSession, SessionHandle};

    const CONV: u32 = 0x55aa_1234;

    fn kcp_cfg(block: &str, dshard: usize, pshard: usize) -> KcpConfig {
        KcpConfig {
            block: block.to_string(),
            key: "chain-test".to_string(),
            dshard,
            pshard,
            mtu: 1350,
            sndwnd: 1024,
            rcvwnd: 1024,
            mux_window: 64,
            mux_keepalive: 0,
        }
    }

    /// One direction of the in-memory wire: FEC-shard, encrypt, maybe drop,
    /// then hand the datagram to the peer's pump.
    struct TestLink {
        fec: Option<FecEncoder>,
        crypt: Arc<dyn BlockCrypt>,
        tx: mpsc::UnboundedSender<Vec<u8>>,
        counter: usize,
        loss_mod: usize,
    }

    impl Write for TestLink {
        fn write(&mut self, segment: &[u8]) -> std::io::Result<usize> {
            let mut pkts = Vec::new();
            match &mut self.fec {
                Some(fec) => fec.encode(segment, &mut pkts),
                None => pkts.push(segment.to_vec()),
            }
            for pkt in pkts {
                self.counter += 1;
                if self.loss_mod != 0 && self.counter % self.loss_mod == 0 {
                    continue;
                }
                let _ = self.tx.send(self.crypt.encrypt(&pkt));
            }
            Ok(segment.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn spawn_pump(
        mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
        crypt: Arc<dyn BlockCrypt>,
        mut fec: Option<FecDecoder>,
        handle: SessionHandle,
    ) {
        tokio::spawn(async move {
            let mut segments = Vec::new();
            while let Some(wire) = rx.recv().await {
                if handle.is_dead() {
                    break;
                }
                let Ok(plain) = crypt.decrypt(&wire) else {
                    continue;
                };
                match &mut fec {
                    Some(dec) => {
                        segments.clear();
                        if dec.decode(&plain, &mut segments).is_ok() {
                            for seg in segments.drain(..) {
                                handle.input(&seg);
                            }
                        }
                    }
                    None => handle.input(&plain),
                }
            }
        });
    }

    /// Two mux sessions joined through the full cipher + FEC + ARQ chain,
    /// with deterministic loss on the client-to-server direction.
    fn build_pair(cfg: &KcpConfig, loss_mod: usize) -> (MuxSession, MuxSession) {
        let addr: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        let crypt = new_block(&cfg.block, &cfg.key);
        let fec_on = cfg.fec_enabled();

        let (a2b_tx, a2b_rx) = mpsc::unbounded_channel();
        let (b2a_tx, b2a_rx) = mpsc::unbounded_channel();

        let make_fec_enc = || {
            fec_on.then(|| FecEncoder::new(CONV, cfg.dshard, cfg.pshard).unwrap())
        };
        let make_fec_dec = || {
            fec_on.then(|| FecDecoder::new(CONV, cfg.dshard, cfg.pshard).unwrap())
        };

        let cancel_a = CancellationToken::new();
        let sess_a = KcpSession::new(
            CONV,
            cfg,
            Box::new(TestLink {
                fec: make_fec_enc(),
                crypt: crypt.clone(),
                tx: a2b_tx,
                counter: 0,
                loss_mod,
            }),
            cancel_a.clone(),
        );
        spawn_pump(b2a_rx, crypt.clone(), make_fec_dec(), sess_a.handle());
        let mux_a = MuxSession::new(
            sess_a,
            addr,
            MuxConfig { window: cfg.mux_window, keepalive: Duration::ZERO, dialer: true },
            cancel_a,
        );

        let cancel_b = CancellationToken::new();
        let sess_b = KcpSession::new(
            CONV,
            cfg,
            Box::new(TestLink {
                fec: make_fec_enc(),
                crypt: crypt.clone(),
                tx: b2a_tx,
                counter: 0,
                loss_mod: 0,
            }),
            cancel_b.clone(),
        );
        spawn_pump(a2b_rx, crypt, make_fec_dec(), sess_b.handle());
        let mux_b = MuxSession::new(
            sess_b,
            addr,
            MuxConfig { window: cfg.mux_window, keepalive: Duration::ZERO, dialer: false },
            cancel_b,
        );

        (mux_a, mux_b)
    }

    async fn echo_once(client: &MuxSession, server: &MuxSession, len: usize) {
        let mut up = client.open_stream().await.unwrap();
        let mut down = server.accept_stream().await.unwrap();

        let payload: Vec<u8> = (0..len).map(|i| (i % 249) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            up.write_all(&payload).await.unwrap();
            up.flush().await.unwrap();
            up
        });

        let mut got = vec![0u8; expected.len()];
        down.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);

        // And back the other way on the same substream.
        down.write_all(b"echo-ack").await.unwrap();
        down.flush().await.unwrap();
        let mut up = writer.await.unwrap();
        let mut ack = [0u8; 8];
        up.read_exact(&mut ack).await.unwrap();
        assert_eq!(&ack, b"echo-ack");
    }

    #[tokio::test]
    async fn plain_chain_round_trips() {
        let cfg = kcp_cfg("none", 0, 0);
        let (client, server) = build_pair(&cfg, 0);
        tokio::time::timeout(Duration::from_secs(10), echo_once(&client, &server, 1024))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn encrypted_fec_chain_survives_packet_loss() {
        let cfg = kcp_cfg("aes", 4, 2);
        // Every 7th client datagram is lost: one per FEC group, always
        // recoverable from parity without waiting for ARQ retransmission.
        let (client, server) = build_pair(&cfg, 7);
        tokio::time::timeout(Duration::from_secs(20), echo_once(&client, &server, 64 * 1024))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn two_substreams_share_one_session() {
        let cfg = kcp_cfg("salsa20", 0, 0);
        let (client, server) = build_pair(&cfg, 0);
        let run = async {
            let mut s1 = client.open_stream().await.unwrap();
            let mut s2 = client.open_stream().await.unwrap();
            assert_ne!(s1.sid(), s2.sid());
            let mut a1 = server.accept_stream().await.unwrap();
            let mut a2 = server.accept_stream().await.unwrap();

            s1.write_all(b"first").await.unwrap();
            s2.write_all(b"second").await.unwrap();
            let mut buf5 = [0u8; 5];
            let mut buf6 = [0u8; 6];
            a1.read_exact(&mut buf5).await.unwrap();
            a2.read_exact(&mut buf6).await.unwrap();
            assert_eq!(&buf5, b"first");
            assert_eq!(&buf6, b"second");
        };
        tokio::time::timeout(Duration::from_secs(10), run).await.unwrap();
    }
}
