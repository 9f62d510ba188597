use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use crate::config::{Config, Role};
use crate::error::{Result, TunnelError};

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(p)
        .map_err(|e| TunnelError::Config(format!("failed to read config file: {e}")))?;
    let cfg: Config = toml::from_str(&txt)
        .map_err(|e| TunnelError::Config(format!("failed to parse config: {e}")))?;

    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.network.tcp.lf.is_empty() {
        return Err(TunnelError::Config(
            "network.tcp.lf must contain at least one flag record".into(),
        ));
    }

    if cfg.network.ipv4.is_none() && cfg.network.ipv6.is_none() {
        return Err(TunnelError::Config(
            "at least one of network.ipv4 and network.ipv6 is required".into(),
        ));
    }

    match cfg.role {
        Role::Client => {
            let server = cfg
                .server
                .as_ref()
                .ok_or_else(|| TunnelError::Config("client role requires server.addr".into()))?;
            check_family(cfg, &server.addr, "server.addr")?;
            if cfg.transport.conn == 0 {
                return Err(TunnelError::Config("transport.conn must be at least 1".into()));
            }
        }
        Role::Server => {
            if cfg.listen.is_none() {
                return Err(TunnelError::Config("server role requires listen.addr".into()));
            }
            if !cfg.forward.is_empty() {
                return Err(TunnelError::Config(
                    "forward entries are only valid for the client role".into(),
                ));
            }
        }
    }

    let kcp = &cfg.transport.kcp;
    if !(50..=1400).contains(&kcp.mtu) {
        return Err(TunnelError::Config(format!(
            "transport.kcp.mtu {} outside supported range [50, 1400]",
            kcp.mtu
        )));
    }

    Ok(())
}

/// A destination is only reachable when a source address of the same family
/// is configured.
fn check_family(cfg: &Config, addr: &SocketAddr, key: &str) -> Result<()> {
    let ok = match addr {
        SocketAddr::V4(_) => cfg.network.ipv4.is_some(),
        SocketAddr::V6(_) => cfg.network.ipv6.is_some(),
    };
    if ok {
        Ok(())
    } else {
        Err(TunnelError::Config(format!(
            "{key} is {addr} but no source address of that family is configured"
        )))
    }
}
