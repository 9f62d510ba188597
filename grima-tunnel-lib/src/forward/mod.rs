//! Application-facing listeners on the client, bridged into substreams.

mod tcp;
mod udp;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::error;

use crate::client::Client;
use crate::config::{Config, ForwardProto};
use crate::error::Result;

/// Start every configured forwarder, then block until cancellation and drain.
pub async fn run_all(cfg: Arc<Config>, client: Arc<Client>, cancel: CancellationToken) -> Result<()> {
    let tracker = TaskTracker::new();
    for fwd in &cfg.forward {
        let client = client.clone();
        let cancel = cancel.clone();
        let fwd = fwd.clone();
        tracker.spawn(async move {
            let result = match fwd.proto {
                ForwardProto::Tcp => tcp::listen(client, fwd.listen, fwd.target, cancel).await,
                ForwardProto::Udp => udp::listen(client, fwd.listen, fwd.target, cancel).await,
            };
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!(listen = %fwd.listen, target = %fwd.target, error = %e, "forwarder exited");
                }
            }
        });
    }
    tracker.close();

    cancel.cancelled().await;
    tracker.wait().await;
    client.close();
    Ok(())
}
