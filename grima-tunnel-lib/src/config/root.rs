use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use pnet::util::MacAddr;
use rand::Rng;
use serde::Deserialize;

use crate::forge::TcpFlags;

/// Which half of the tunnel this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub role: Role,
    /// Capture interface, source addresses and flag sequences
    pub network: NetworkConfig,
    /// Remote peer address (client role only)
    #[serde(default)]
    pub server: Option<ServerConfig>,
    /// Advertised listen address (server role only)
    #[serde(default)]
    pub listen: Option<ListenConfig>,
    /// Local application listeners bridged into the tunnel (client role)
    #[serde(default)]
    pub forward: Vec<ForwardConfig>,
    pub transport: TransportConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ListenConfig {
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardProto {
    Tcp,
    Udp,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ForwardConfig {
    pub proto: ForwardProto,
    /// Local address to accept application traffic on
    pub listen: SocketAddr,
    /// Destination the server dials on our behalf
    pub target: SocketAddr,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    pub interface: InterfaceConfig,
    /// Local TCP port used by the synthesised segments and the BPF filter.
    /// 0 means "pick a random port in [32768, 65535] at startup".
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub ipv4: Option<Ipv4Config>,
    #[serde(default)]
    pub ipv6: Option<Ipv6Config>,
    #[serde(default)]
    pub pcap: PcapConfig,
    pub tcp: TcpConfig,
}

impl NetworkConfig {
    /// Copy of this record with `port == 0` replaced by a random high port.
    /// Resolved once per process so every session shares the same source port.
    pub fn with_resolved_port(&self) -> NetworkConfig {
        let mut cfg = self.clone();
        if cfg.port == 0 {
            cfg.port = rand::rng().random_range(32768..=65535);
        }
        cfg
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InterfaceConfig {
    pub name: String,
    #[serde(with = "mac_addr")]
    pub mac: MacAddr,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Ipv4Config {
    pub addr: Ipv4Addr,
    /// Next-hop hardware address for IPv4 traffic
    #[serde(with = "mac_addr")]
    pub router_mac: MacAddr,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Ipv6Config {
    pub addr: Ipv6Addr,
    /// Next-hop hardware address for IPv6 traffic (may differ from IPv4)
    #[serde(with = "mac_addr")]
    pub router_mac: MacAddr,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PcapConfig {
    /// Capture buffer size in bytes
    #[serde(default = "PcapConfig::default_sockbuf")]
    pub sockbuf: i32,
}

impl PcapConfig {
    fn default_sockbuf() -> i32 {
        4 * 1024 * 1024
    }
}

impl Default for PcapConfig {
    fn default() -> Self {
        Self { sockbuf: Self::default_sockbuf() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TcpConfig {
    /// Default flag sequence for outgoing segments; at least one entry
    pub lf: Vec<TcpFlags>,
    /// Flag sequence advertised to the server via TCPF frames; empty
    /// means "do not advertise"
    #[serde(default)]
    pub rf: Vec<TcpFlags>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    /// Number of parallel reliable sessions (client role)
    #[serde(default = "TransportConfig::default_conn")]
    pub conn: usize,
    pub kcp: KcpConfig,
}

impl TransportConfig {
    fn default_conn() -> usize {
        1
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct KcpConfig {
    /// Datagram cipher selector; unrecognised values carry no cipher
    #[serde(default = "KcpConfig::default_block")]
    pub block: String,
    #[serde(default)]
    pub key: String,
    /// FEC data shards; FEC is disabled unless both shard counts are > 0
    #[serde(default)]
    pub dshard: usize,
    /// FEC parity shards
    #[serde(default)]
    pub pshard: usize,
    #[serde(default = "KcpConfig::default_mtu")]
    pub mtu: usize,
    #[serde(default = "KcpConfig::default_wnd")]
    pub sndwnd: u16,
    #[serde(default = "KcpConfig::default_wnd")]
    pub rcvwnd: u16,
    /// Per-substream receive buffer, in frames
    #[serde(default = "KcpConfig::default_mux_window")]
    pub mux_window: usize,
    /// Seconds between mux NOP keepalives; 0 disables them
    #[serde(default = "KcpConfig::default_mux_keepalive")]
    pub mux_keepalive: u64,
}

impl KcpConfig {
    fn default_block() -> String {
        "none".to_string()
    }

    fn default_mtu() -> usize {
        1350
    }

    fn default_wnd() -> u16 {
        1024
    }

    fn default_mux_window() -> usize {
        256
    }

    fn default_mux_keepalive() -> u64 {
        10
    }

    pub fn fec_enabled(&self) -> bool {
        self.dshard > 0 && self.pshard > 0
    }
}

mod mac_addr {
    use pnet::util::MacAddr;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<MacAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
