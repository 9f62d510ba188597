//! Address fingerprints used as map keys by the forge and the UDP session pool.

use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;

use ahash::RandomState;

/// Fingerprint of a remote `(IP, port)` pair.
///
/// IPv4 packs the address into the high bits so that the v4 and v6
/// representations of the same numeric address never collide. Deterministic
/// for the lifetime of the process (no per-run seed) so that per-peer flag
/// overrides survive session re-dials.
pub fn ip_addr(addr: &SocketAddr) -> u64 {
    let port = u64::from(addr.port());
    match addr.ip() {
        IpAddr::V4(ip) => (u64::from(u32::from_be_bytes(ip.octets())) << 16) | port,
        IpAddr::V6(ip) => {
            let o = ip.octets();
            let hi = u64::from_be_bytes([o[0], o[1], o[2], o[3], o[4], o[5], o[6], o[7]]);
            let lo = u64::from_be_bytes([o[8], o[9], o[10], o[11], o[12], o[13], o[14], o[15]]);
            hi ^ lo ^ (port << 48)
        }
    }
}

fn pair_state() -> &'static RandomState {
    static STATE: OnceLock<RandomState> = OnceLock::new();
    STATE.get_or_init(RandomState::new)
}

/// Key for the client UDP session map: one hash over both address strings,
/// seeded once per process.
pub fn addr_pair(local: &str, target: &str) -> u64 {
    pair_state().hash_one((local, target))
}
