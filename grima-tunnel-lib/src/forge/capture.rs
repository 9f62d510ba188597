//! pcap handle configuration shared by the send and receive sides.

use pcap::{Active, Capture, Direction};

use crate::config::NetworkConfig;
use crate::error::Result;

/// Poll interval for the capture read loop. libpcap cannot be unblocked from
/// another thread in safe Rust, so the handle wakes up at this cadence to
/// observe cancellation; immediate mode keeps per-packet latency unaffected.
pub(crate) const POLL_TIMEOUT_MS: i32 = 250;

pub(crate) fn open_capture(cfg: &NetworkConfig, direction: Direction) -> Result<Capture<Active>> {
    let cap = Capture::from_device(cfg.interface.name.as_str())?
        .snaplen(65536)
        .buffer_size(cfg.pcap.sockbuf)
        .promisc(true)
        .immediate_mode(true)
        .timeout(POLL_TIMEOUT_MS)
        .open()?;
    cap.direction(direction)?;
    Ok(cap)
}
