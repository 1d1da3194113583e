use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::association::Association;
use crate::config::{EndpointConfig, StackConfig};
use crate::connection::Connection;
use crate::link::Outbound;
use crate::manager::ControlEvent;

/// One remote peer: its addresses, timeouts, and the associations keyed by
/// `(local address, remote address)`. Created on first connect or first
/// inbound contact; destroyed on explicit disconnect.
pub struct RemoteEndpoint {
    proxy: String,
    config: EndpointConfig,
    connect_timeout: Duration,
    reply_timeout: Duration,
    confirm_timeout: Duration,
    max_fragment_size: usize,
    on_master: bool,
    default_local_address: u16,
    outbound: Arc<Outbound>,
    associations: RwLock<HashMap<(u16, u16), Arc<Association>>>,
    control: mpsc::UnboundedSender<ControlEvent>,
    closed: AtomicBool,
}

impl RemoteEndpoint {
    pub(crate) fn new(
        config: EndpointConfig,
        stack: &StackConfig,
        control: mpsc::UnboundedSender<ControlEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            proxy: config.proxy.clone(),
            connect_timeout: config.connect_timeout.unwrap_or(stack.connect_timeout),
            reply_timeout: config.reply_timeout.unwrap_or(stack.reply_timeout),
            confirm_timeout: config.confirm_timeout.unwrap_or(stack.confirm_timeout),
            max_fragment_size: config
                .max_fragment_size
                .unwrap_or(stack.max_fragment_size)
                .min(crate::config::MAX_FRAGMENT_SIZE),
            on_master: stack.role.is_master(),
            default_local_address: config.local_address.unwrap_or(stack.local_address),
            config,
            outbound: Outbound::new(),
            associations: RwLock::new(HashMap::new()),
            control,
            closed: AtomicBool::new(false),
        })
    }

    pub fn proxy(&self) -> &str {
        &self.proxy
    }

    pub fn remote_address(&self) -> u16 {
        self.config.remote_address
    }

    pub fn default_local_address(&self) -> u16 {
        self.default_local_address
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    pub fn confirm_timeout(&self) -> Duration {
        self.confirm_timeout
    }

    pub fn max_fragment_size(&self) -> usize {
        self.max_fragment_size
    }

    pub fn tcp_socket_addresses(&self) -> &[SocketAddr] {
        &self.config.tcp
    }

    pub fn udp_socket_addresses(&self) -> &[SocketAddr] {
        &self.config.udp
    }

    pub fn serial_port(&self) -> Option<(&str, u32)> {
        self.config
            .serial_port_name
            .as_deref()
            .map(|name| (name, self.config.serial_port_speed.unwrap_or(9600)))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn bind_connection(&self, connection: Arc<Connection>) {
        self.outbound.bind(connection);
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.outbound.connection()
    }

    /// Create or return the association for the address pair.
    pub fn get_association(
        self: &Arc<Self>,
        local_address: u16,
        remote_address: u16,
    ) -> (Arc<Association>, bool) {
        if let Some(existing) = self.associations.read().get(&(local_address, remote_address)) {
            return (existing.clone(), false);
        }
        let mut table = self.associations.write();
        // Double-checked: another task may have raced the upgrade.
        if let Some(existing) = table.get(&(local_address, remote_address)) {
            return (existing.clone(), false);
        }
        debug!(
            proxy = self.proxy.as_str(),
            local = local_address,
            remote = remote_address,
            "creating association"
        );
        let association = Association::new(
            local_address,
            remote_address,
            self.on_master,
            Arc::downgrade(self),
            self.outbound.clone(),
            self.reply_timeout,
            self.confirm_timeout,
            self.max_fragment_size,
        );
        table.insert((local_address, remote_address), association.clone());
        (association, true)
    }

    pub fn association(&self, local_address: u16, remote_address: u16) -> Option<Arc<Association>> {
        self.associations
            .read()
            .get(&(local_address, remote_address))
            .cloned()
    }

    pub fn associations(&self) -> Vec<Arc<Association>> {
        self.associations.read().values().cloned().collect()
    }

    /// Ask the connection manager to drop this endpoint's connection. Used by
    /// the transaction layer when a commit hits a connection error.
    pub fn request_disconnect(&self, cause: Option<String>) {
        let _ = self.control.send(ControlEvent::Disconnect {
            proxy: self.proxy.clone(),
            cause,
        });
    }

    /// Tear down all associations and close any active connection.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(connection) = self.outbound.unbind() {
            connection.close().await;
        }
        let associations: Vec<_> = {
            let mut table = self.associations.write();
            table.drain().map(|(_, assoc)| assoc).collect()
        };
        for association in associations {
            association.on_connection_lost();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Arc<RemoteEndpoint> {
        let (control, _rx) = mpsc::unbounded_channel();
        let stack = StackConfig {
            role: crate::config::StationRole::Master,
            local_address: 2,
            ..StackConfig::default()
        };
        RemoteEndpoint::new(EndpointConfig::new("out-1", 10), &stack, control)
    }

    #[test]
    fn association_created_once_per_pair() {
        let endpoint = endpoint();
        let (first, created_first) = endpoint.get_association(2, 10);
        let (second, created_second) = endpoint.get_association(2, 10);
        assert!(created_first);
        assert!(!created_second);
        assert!(Arc::ptr_eq(&first, &second));
        let (_, created_other) = endpoint.get_association(2, 11);
        assert!(created_other);
        assert_eq!(endpoint.associations().len(), 2);
    }

    #[test]
    fn association_backref_is_non_owning() {
        let endpoint = endpoint();
        let (association, _) = endpoint.get_association(2, 10);
        assert!(association.remote_endpoint().is_some());
        assert_eq!(
            association.remote_endpoint().unwrap().proxy(),
            endpoint.proxy()
        );
    }

    #[tokio::test]
    async fn close_tears_down_associations() {
        let endpoint = endpoint();
        let (association, _) = endpoint.get_association(2, 10);
        let waiter = association.register_response_waiter();
        endpoint.close().await;
        assert!(endpoint.is_closed());
        assert!(endpoint.associations().is_empty());
        assert!(waiter.await.is_err());
        // Idempotent.
        endpoint.close().await;
    }

    #[test]
    fn per_endpoint_overrides_apply() {
        let (control, _rx) = mpsc::unbounded_channel();
        let stack = StackConfig::default();
        let mut config = EndpointConfig::new("out-2", 20);
        config.reply_timeout = Some(Duration::from_millis(250));
        config.max_fragment_size = Some(4096);
        let endpoint = RemoteEndpoint::new(config, &stack, control);
        assert_eq!(endpoint.reply_timeout(), Duration::from_millis(250));
        // Clamped to the protocol cap.
        assert_eq!(endpoint.max_fragment_size(), 2048);
    }
}
