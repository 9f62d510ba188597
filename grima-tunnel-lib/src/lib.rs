#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod error;
pub mod forge;
pub mod forward;
pub mod hash;
pub mod protocol;
pub mod server;
mod splice;
pub mod transport;

pub use client::Client;
pub use config::{load_from_path, Config, Role};
pub use error::{Result, TunnelError};
pub use forge::{Forge, TcpFlags};
pub use server::Server;
