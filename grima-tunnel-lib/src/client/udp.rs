//! The UDP session map: `(local, target)` keyed substream reuse so upstream
//! NAT state survives bursts of datagrams from one source.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::hash;
use crate::transport::Substream;

/// One live UDP-carrying substream. The writer is shared by everyone hitting
/// the same key; the read half is taken exactly once by whoever created the
/// entry and pumps replies back to the local socket.
pub struct UdpSession {
    key: u64,
    sid: u32,
    writer: Mutex<WriteHalf<Substream>>,
    reader: StdMutex<Option<ReadHalf<Substream>>>,
}

impl UdpSession {
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn sid(&self) -> u32 {
        self.sid
    }

    pub fn take_reader(&self) -> Option<ReadHalf<Substream>> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Forward one datagram as a length-prefixed frame.
    pub async fn send_datagram(&self, data: &[u8]) -> crate::error::Result<()> {
        let mut w = self.writer.lock().await;
        crate::protocol::write_datagram(&mut *w, data).await
    }
}

pub(crate) struct UdpMap {
    entries: RwLock<HashMap<u64, Arc<UdpSession>>>,
}

impl UdpMap {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    pub fn get(&self, local: SocketAddr, target: SocketAddr) -> Option<Arc<UdpSession>> {
        let key = pair_key(local, target);
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    /// Insert a freshly opened substream. If another task won the race for
    /// this key, the newcomer is dropped (closing it) and the winner is
    /// returned with `reused = true`.
    pub fn insert(
        &self,
        local: SocketAddr,
        target: SocketAddr,
        strm: Substream,
    ) -> (Arc<UdpSession>, bool) {
        let key = pair_key(local, target);
        let sid = strm.sid();
        let (read_half, write_half) = tokio::io::split(strm);
        let session = Arc::new(UdpSession {
            key,
            sid,
            writer: Mutex::new(write_half),
            reader: StdMutex::new(Some(read_half)),
        });
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.entry(key) {
            Entry::Occupied(existing) => (existing.get().clone(), true),
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                (session, false)
            }
        }
    }

    /// Remove and close; the substream is closed exactly once (shutdown here,
    /// FIN-on-drop is suppressed after that). Missing keys are a no-op.
    pub async fn close(&self, key: u64) {
        let entry = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        match entry {
            Some(session) => {
                debug!(sid = session.sid(), "closing UDP session substream");
                let mut w = session.writer.lock().await;
                let _ = w.shutdown().await;
            }
            None => debug!(key, "UDP session key not found for close"),
        }
    }
}

fn pair_key(local: SocketAddr, target: SocketAddr) -> u64 {
    hash::addr_pair(&local.to_string(), &target.to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::transport::mux::{MuxConfig, MuxSession};

    fn mux_pair() -> (MuxSession, MuxSession) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let cfg = |dialer| MuxConfig { window: 16, keepalive: Duration::ZERO, dialer };
        (
            MuxSession::new(a, addr, cfg(true), CancellationToken::new()),
            MuxSession::new(b, addr, cfg(false), CancellationToken::new()),
        )
    }

    fn addrs() -> (SocketAddr, SocketAddr) {
        ("127.0.0.1:5000".parse().unwrap(), "10.0.0.1:53".parse().unwrap())
    }

    #[tokio::test]
    async fn same_key_resolves_to_same_substream() {
        let (client, _server) = mux_pair();
        let (local, target) = addrs();
        let map = UdpMap::new();

        assert!(map.get(local, target).is_none());
        let strm = client.open_stream().await.unwrap();
        let (first, raced) = map.insert(local, target, strm);
        assert!(!raced);

        let again = map.get(local, target).expect("entry should be live");
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.sid(), again.sid());
    }

    #[tokio::test]
    async fn insert_race_keeps_the_first_entry() {
        let (client, _server) = mux_pair();
        let (local, target) = addrs();
        let map = UdpMap::new();

        let first = map.insert(local, target, client.open_stream().await.unwrap()).0;
        let (winner, raced) = map.insert(local, target, client.open_stream().await.unwrap());
        assert!(raced);
        assert!(Arc::ptr_eq(&first, &winner));
    }

    #[tokio::test]
    async fn close_evicts_and_is_idempotent() {
        let (client, server) = mux_pair();
        let (local, target) = addrs();
        let map = UdpMap::new();

        let (entry, _) = map.insert(local, target, client.open_stream().await.unwrap());
        let mut peer = server.accept_stream().await.unwrap();

        let key = entry.key();
        map.close(key).await;
        assert!(map.get(local, target).is_none());

        // Peer observes exactly one close.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        // Second close of the same key is a no-op.
        map.close(key).await;
    }

    #[tokio::test]
    async fn reader_is_taken_exactly_once() {
        let (client, _server) = mux_pair();
        let (local, target) = addrs();
        let map = UdpMap::new();
        let (entry, _) = map.insert(local, target, client.open_stream().await.unwrap());
        assert!(entry.take_reader().is_some());
        assert!(entry.take_reader().is_none());
    }
}
