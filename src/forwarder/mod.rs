//! Per-entry loopback forwarders
//!
//! Each pool entry can get its own loopback HTTP/CONNECT proxy on
//! `127.0.0.1:(20000 + id)` that routes static assets around the upstream.
//! Instances start and stop in lock-step with pool configuration, and pick
//! up credential rotations live through a watch channel.

mod assets;
mod server;
mod upstream;

pub use assets::is_static_asset;
pub use server::Forwarder;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, SwivelError};

/// Loopback port for entry id N is `BASE_PORT + N`
pub const BASE_PORT: u16 = 20_000;

const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(5);

/// Loopback address for an entry's forwarder
pub fn forwarder_addr(entry_id: i64) -> String {
    format!("127.0.0.1:{}", BASE_PORT as i64 + entry_id)
}

struct ForwarderInstance {
    credential_tx: watch::Sender<String>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ForwarderInstance {
    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let abort = self.task.abort_handle();
        if tokio::time::timeout(GRACEFUL_SHUTDOWN, self.task)
            .await
            .is_err()
        {
            warn!("Forwarder did not drain in time, aborting");
            abort.abort();
        }
    }
}

/// Owns the running forwarder instances, keyed by entry id
pub struct ForwarderManager {
    instances: Mutex<HashMap<i64, ForwarderInstance>>,
}

impl ForwarderManager {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or restart) the forwarder for an entry
    ///
    /// Returns the loopback address callers should connect to.
    pub async fn start(&self, entry_id: i64, credential: &str) -> Result<String> {
        self.stop(entry_id).await;

        let port = BASE_PORT as i64 + entry_id;
        if !(1..=u16::MAX as i64).contains(&port) {
            return Err(SwivelError::Forwarder(format!(
                "entry id {} maps outside the loopback port range",
                entry_id
            )));
        }

        let addr = forwarder_addr(entry_id);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            SwivelError::Forwarder(format!("failed to listen on {}: {}", addr, e))
        })?;

        let (credential_tx, credential_rx) = watch::channel(credential.to_string());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let forwarder = Arc::new(Forwarder::new(entry_id, credential_rx));

        let task = tokio::spawn(server::serve(listener, forwarder, shutdown_rx));

        self.instances.lock().insert(
            entry_id,
            ForwarderInstance {
                credential_tx,
                shutdown_tx,
                task,
            },
        );

        info!(entry_id = entry_id, addr = %addr, "Forwarder started");
        Ok(addr)
    }

    /// Stop the forwarder for an entry, if running
    pub async fn stop(&self, entry_id: i64) {
        let instance = self.instances.lock().remove(&entry_id);
        if let Some(instance) = instance {
            instance.stop().await;
            debug!(entry_id = entry_id, "Forwarder stopped");
        }
    }

    /// Stop every running forwarder
    pub async fn stop_all(&self) {
        let drained: Vec<_> = self.instances.lock().drain().collect();
        for (entry_id, instance) in drained {
            instance.stop().await;
            debug!(entry_id = entry_id, "Forwarder stopped");
        }
    }

    /// Push a rotated credential into a running instance
    pub fn update_credential(&self, entry_id: i64, credential: &str) {
        if let Some(instance) = self.instances.lock().get(&entry_id) {
            let _ = instance.credential_tx.send(credential.to_string());
        }
    }

    /// Number of running instances
    pub fn instance_count(&self) -> usize {
        self.instances.lock().len()
    }
}

impl Default for ForwarderManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarder_addr_scheme() {
        assert_eq!(forwarder_addr(1), "127.0.0.1:20001");
        assert_eq!(forwarder_addr(42), "127.0.0.1:20042");
    }

    #[tokio::test]
    async fn test_out_of_range_entry_id_is_rejected() {
        let manager = ForwarderManager::new();
        let err = manager.start(50_000, "1.2.3.4:8080").await.unwrap_err();
        assert!(matches!(err, SwivelError::Forwarder(_)));
        assert_eq!(manager.instance_count(), 0);
    }
}
