mod loader;
mod root;

pub use loader::load_from_path;
pub use root::{
    Config, ForwardConfig, ForwardProto, InterfaceConfig, Ipv4Config, Ipv6Config, KcpConfig,
    ListenConfig, NetworkConfig, PcapConfig, Role, ServerConfig, TcpConfig, TransportConfig,
};
