//! Send side of the forge: flag selection, frame construction, injection.

use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};

use pcap::{Active, Capture, Direction};
use tracing::debug;

use crate::config::NetworkConfig;
use crate::error::Result;
use crate::forge::capture::open_capture;
use crate::forge::flags::FlagBook;
use crate::forge::frame::FrameBuilder;
use crate::forge::{FlagIter, TcpFlags};
use crate::hash;

/// Capture handle plus its serialisation scratch. The scratch lives under the
/// same lock as the handle so every write reuses one buffer; each `encode`
/// overwrites it completely.
struct SendIo {
    cap: Capture<Active>,
    scratch: Vec<u8>,
}

pub(crate) struct SendHandle {
    io: Mutex<SendIo>,
    builder: FrameBuilder,
    flags: FlagBook,
}

impl SendHandle {
    pub fn new(cfg: &NetworkConfig) -> Result<Self> {
        let cap = open_capture(cfg, Direction::Out)?;
        let default_flags = FlagIter::new(cfg.tcp.lf.clone()).ok_or_else(|| {
            crate::error::TunnelError::Config("network.tcp.lf must not be empty".into())
        })?;
        Ok(Self {
            io: Mutex::new(SendIo { cap, scratch: Vec::with_capacity(2048) }),
            builder: FrameBuilder::new(cfg),
            flags: FlagBook::new(default_flags),
        })
    }

    pub fn write_to(&self, payload: &[u8], dst: SocketAddr) -> Result<usize> {
        let flags = self.flags.next(hash::ip_addr(&dst));
        let mut io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        let SendIo { cap, scratch } = &mut *io;
        let len = self.builder.encode(scratch, dst, flags, payload)?;
        cap.sendpacket(&scratch[..len])?;
        Ok(payload.len())
    }

    /// Install a flag override for one peer. Subsequent writes to that peer
    /// draw from the new list starting at its first record; overrides persist
    /// for the lifetime of the forge.
    pub fn set_peer_flags(&self, addr: &SocketAddr, list: Vec<TcpFlags>) {
        self.flags.install(hash::ip_addr(addr), list);
        debug!(peer = %addr, "installed peer flag override");
    }
}
