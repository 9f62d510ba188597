use std::io::Write;

use grima_tunnel_lib::config::{load_from_path, ForwardProto, Role};
use grima_tunnel_lib::TunnelError;
use tempfile::NamedTempFile;

type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const CLIENT_CONFIG: &str = r#"
role = "client"

[network]
port = 46321

[network.interface]
name = "eth0"
mac = "0e:5f:12:aa:bc:01"

[network.ipv4]
addr = "203.0.113.10"
router_mac = "3c:61:04:00:11:22"

[network.pcap]
sockbuf = 8388608

[[network.tcp.lf]]
syn = true

[[network.tcp.lf]]
ack = true
psh = true

[[network.tcp.rf]]
ack = true

[server]
addr = "198.51.100.7:443"

[[forward]]
proto = "tcp"
listen = "127.0.0.1:5000"
target = "127.0.0.1:6000"

[[forward]]
proto = "udp"
listen = "127.0.0.1:5300"
target = "10.0.0.1:53"

[transport]
conn = 2

[transport.kcp]
block = "aes"
key = "it's a secret"
dshard = 10
pshard = 3
"#;

const SERVER_CONFIG: &str = r#"
role = "server"

[network]
port = 443

[network.interface]
name = "eth0"
mac = "0e:5f:12:aa:bc:02"

[network.ipv4]
addr = "198.51.100.7"
router_mac = "3c:61:04:00:33:44"

[[network.tcp.lf]]
ack = true

[listen]
addr = "0.0.0.0:443"

[transport.kcp]
block = "aes"
key = "it's a secret"
dshard = 10
pshard = 3
"#;

fn write_config(body: &str) -> TestResult<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(body.as_bytes())?;
    Ok(file)
}

#[test]
fn client_config_loads() -> TestResult<()> {
    let file = write_config(CLIENT_CONFIG)?;
    let cfg = load_from_path(file.path())?;

    assert_eq!(cfg.role, Role::Client);
    assert_eq!(cfg.network.port, 46321);
    assert_eq!(cfg.network.interface.name, "eth0");
    assert_eq!(cfg.network.pcap.sockbuf, 8 * 1024 * 1024);
    assert_eq!(cfg.network.tcp.lf.len(), 2);
    assert!(cfg.network.tcp.lf[0].syn);
    assert!(cfg.network.tcp.lf[1].ack && cfg.network.tcp.lf[1].psh);
    assert_eq!(cfg.network.tcp.rf.len(), 1);
    assert_eq!(cfg.server.as_ref().map(|s| s.addr), Some("198.51.100.7:443".parse()?));
    assert_eq!(cfg.forward.len(), 2);
    assert_eq!(cfg.forward[0].proto, ForwardProto::Tcp);
    assert_eq!(cfg.forward[1].proto, ForwardProto::Udp);
    assert_eq!(cfg.transport.conn, 2);
    assert_eq!(cfg.transport.kcp.block, "aes");
    assert!(cfg.transport.kcp.fec_enabled());
    // Defaults fill the unspecified knobs.
    assert_eq!(cfg.transport.kcp.mtu, 1350);
    assert_eq!(cfg.transport.kcp.sndwnd, 1024);
    assert_eq!(cfg.transport.kcp.mux_keepalive, 10);
    Ok(())
}

#[test]
fn server_config_loads() -> TestResult<()> {
    let file = write_config(SERVER_CONFIG)?;
    let cfg = load_from_path(file.path())?;
    assert_eq!(cfg.role, Role::Server);
    assert!(cfg.listen.is_some());
    assert!(cfg.forward.is_empty());
    // conn defaults to 1 and is only meaningful for clients.
    assert_eq!(cfg.transport.conn, 1);
    Ok(())
}

#[test]
fn port_zero_resolves_to_high_port() -> TestResult<()> {
    let file = write_config(&CLIENT_CONFIG.replace("port = 46321", "port = 0"))?;
    let cfg = load_from_path(file.path())?;
    assert_eq!(cfg.network.port, 0);
    let resolved = cfg.network.with_resolved_port();
    assert!(resolved.port >= 32768);
    Ok(())
}

#[test]
fn client_without_server_addr_is_rejected() -> TestResult<()> {
    let body = CLIENT_CONFIG.replace("[server]\naddr = \"198.51.100.7:443\"", "");
    let file = write_config(&body)?;
    let err = load_from_path(file.path()).unwrap_err();
    assert!(matches!(err, TunnelError::Config(_)));
    Ok(())
}

#[test]
fn empty_flag_list_is_rejected() -> TestResult<()> {
    let body = SERVER_CONFIG.replace("[[network.tcp.lf]]\nack = true", "[network.tcp]\nlf = []");
    let file = write_config(&body)?;
    let err = load_from_path(file.path()).unwrap_err();
    assert!(matches!(err, TunnelError::Config(_)));
    Ok(())
}

#[test]
fn v6_server_addr_without_v6_source_is_rejected() -> TestResult<()> {
    let body = CLIENT_CONFIG.replace("addr = \"198.51.100.7:443\"", "addr = \"[2001:db8::7]:443\"");
    let file = write_config(&body)?;
    let err = load_from_path(file.path()).unwrap_err();
    assert!(matches!(err, TunnelError::Config(_)));
    Ok(())
}

#[test]
fn bad_mac_address_is_a_parse_error() -> TestResult<()> {
    let body = SERVER_CONFIG.replace("0e:5f:12:aa:bc:02", "not-a-mac");
    let file = write_config(&body)?;
    assert!(load_from_path(file.path()).is_err());
    Ok(())
}

#[test]
fn forward_entries_on_server_are_rejected() -> TestResult<()> {
    let body = format!(
        "{SERVER_CONFIG}\n[[forward]]\nproto = \"tcp\"\nlisten = \"127.0.0.1:1\"\ntarget = \"127.0.0.1:2\"\n"
    );
    let file = write_config(&body)?;
    let err = load_from_path(file.path()).unwrap_err();
    assert!(matches!(err, TunnelError::Config(_)));
    Ok(())
}
