use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::app::FunctionCode;
use crate::association::Association;
use crate::error::Error;
use crate::manager::FragmentListeners;

/// One local DNP3 device: a name, a 16-bit address, and the server tasks for
/// every peer association that addresses it.
pub struct LogicalDevice {
    name: String,
    address: u16,
    servers: Mutex<HashMap<(String, u16), JoinHandle<()>>>,
}

impl LogicalDevice {
    pub fn new(name: impl Into<String>, address: u16) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            address,
            servers: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn server_count(&self) -> usize {
        self.servers.lock().len()
    }

    /// Spawn the receive task for one association, keyed by the peer proxy
    /// and remote address. Idempotent per key.
    pub(crate) fn spawn_server(
        &self,
        proxy: &str,
        association: Arc<Association>,
        listeners: FragmentListeners,
    ) {
        let key = (proxy.to_string(), association.remote_address());
        let mut servers = self.servers.lock();
        if let Some(existing) = servers.get(&key) {
            if !existing.is_finished() {
                return;
            }
        }
        debug!(
            device = self.name.as_str(),
            proxy = key.0.as_str(),
            remote = key.1,
            "starting association server"
        );
        let handle = tokio::spawn(serve(association, listeners));
        servers.insert(key, handle);
    }

    /// Interrupt and join every server task.
    pub async fn stop(&self) {
        let handles: Vec<_> = {
            let mut servers = self.servers.lock();
            servers.drain().collect()
        };
        for ((proxy, remote), handle) in handles {
            handle.abort();
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(proxy = proxy.as_str(), remote, "server task panicked: {err}");
                }
            }
        }
    }

    pub(crate) async fn stop_peer(&self, proxy: &str) {
        let handles: Vec<_> = {
            let mut servers = self.servers.lock();
            let keys: Vec<_> = servers
                .keys()
                .filter(|(p, _)| p == proxy)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| servers.remove(&key))
                .collect()
        };
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
    }
}

/// Receive loop for one association: pull application messages, keep the
/// association bookkeeping current, and run the fragment listener chain.
async fn serve(association: Arc<Association>, listeners: FragmentListeners) {
    loop {
        match association.application_layer().receive().await {
            Ok(fragment) => {
                match fragment.function {
                    FunctionCode::Response => {
                        if !association.deliver_solicited(fragment.clone()) {
                            debug!(
                                seq = fragment.control.seq,
                                "solicited response without a matching waiter"
                            );
                        }
                    }
                    FunctionCode::UnsolicitedResponse => {
                        association.deliver_unsolicited(fragment.clone());
                    }
                    _ => {
                        // Outstation side: drop an immediate repeat of the
                        // latest accepted request sequence.
                        if !association.accept_request(fragment.control.seq) {
                            debug!(
                                seq = fragment.control.seq,
                                "duplicate request sequence ignored"
                            );
                            continue;
                        }
                    }
                }
                let chain: Vec<_> = listeners.read().clone();
                for listener in chain {
                    if listener.on_received_fragment(&association, &fragment).await {
                        break;
                    }
                }
            }
            Err(Error::ClosedChannel) => break,
            Err(Error::Protocol(protocol)) => {
                warn!(
                    remote = association.remote_address(),
                    "fragment error: {protocol}"
                );
                association.fail_response_waiter(protocol);
            }
            Err(err) => {
                warn!(
                    remote = association.remote_address(),
                    "association receive failed: {err}"
                );
                break;
            }
        }
    }
    debug!(
        remote = association.remote_address(),
        "association server stopped"
    );
}
