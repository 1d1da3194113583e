use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::app::Fragment;
use crate::association::Association;
use crate::config::{EndpointConfig, StackConfig, BROADCAST_MIN, SELF_ADDRESS};
use crate::connection::Connection;
use crate::device::LogicalDevice;
use crate::endpoint::RemoteEndpoint;
use crate::error::{Error, Result};
use crate::link::{Frame, FrameCodec};

/// Host-facing events.
#[async_trait]
pub trait ConnectionListener: Send + Sync {
    async fn on_new_connection(&self, proxy: &str);
    async fn on_lost_connection(&self, proxy: &str, cause: Option<&str>);
}

#[async_trait]
pub trait AssociationListener: Send + Sync {
    async fn on_new_association(&self, association: &Arc<Association>);
}

#[async_trait]
pub trait FragmentListener: Send + Sync {
    /// Return true when the fragment is handled; the chain stops there.
    async fn on_received_fragment(
        &self,
        association: &Arc<Association>,
        fragment: &Fragment,
    ) -> bool;
}

pub(crate) type FragmentListeners = Arc<RwLock<Vec<Arc<dyn FragmentListener>>>>;

/// Internal control events, e.g. a transaction asking for a disconnect after
/// a connection error.
#[derive(Debug)]
pub(crate) enum ControlEvent {
    Disconnect {
        proxy: String,
        cause: Option<String>,
    },
}

struct ActiveConnection {
    connection: Arc<Connection>,
    pump: JoinHandle<()>,
    keep_alive: Option<JoinHandle<()>>,
    /// Feed for datagrams routed by the UDP demux loop.
    udp_tx: Option<mpsc::Sender<Bytes>>,
}

/// Central registry and dispatcher: owns the endpoints, logical devices,
/// listeners and the map from remote peers to active connections.
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    config: StackConfig,
    /// Configured peers, by proxy name. Live endpoints are created from these
    /// on first connect or first inbound contact.
    endpoint_configs: RwLock<HashMap<String, EndpointConfig>>,
    endpoints: RwLock<HashMap<String, Arc<RemoteEndpoint>>>,
    by_socket_addr: RwLock<HashMap<SocketAddr, String>>,
    by_ip: RwLock<HashMap<IpAddr, String>>,
    devices_by_address: RwLock<HashMap<u16, Arc<LogicalDevice>>>,
    devices_by_name: RwLock<HashMap<String, Arc<LogicalDevice>>>,
    connections: RwLock<HashMap<String, ActiveConnection>>,
    connection_listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    association_listeners: RwLock<Vec<Arc<dyn AssociationListener>>>,
    fragment_listeners: FragmentListeners,
    udp_socket: RwLock<Option<Arc<UdpSocket>>>,
    tcp_local_addr: RwLock<Option<SocketAddr>>,
    udp_local_addr: RwLock<Option<SocketAddr>>,
    tcp_listener_task: Mutex<Option<JoinHandle<()>>>,
    udp_listener_task: Mutex<Option<JoinHandle<()>>>,
    control_task: Mutex<Option<JoinHandle<()>>>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    unknown_counter: AtomicU32,
    torn_down: AtomicBool,
}

impl ConnectionManager {
    pub fn new(config: StackConfig) -> Result<Self> {
        config.validate()?;
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            config,
            endpoint_configs: RwLock::new(HashMap::new()),
            endpoints: RwLock::new(HashMap::new()),
            by_socket_addr: RwLock::new(HashMap::new()),
            by_ip: RwLock::new(HashMap::new()),
            devices_by_address: RwLock::new(HashMap::new()),
            devices_by_name: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            connection_listeners: RwLock::new(Vec::new()),
            association_listeners: RwLock::new(Vec::new()),
            fragment_listeners: Arc::new(RwLock::new(Vec::new())),
            udp_socket: RwLock::new(None),
            tcp_local_addr: RwLock::new(None),
            udp_local_addr: RwLock::new(None),
            tcp_listener_task: Mutex::new(None),
            udp_listener_task: Mutex::new(None),
            control_task: Mutex::new(None),
            control_tx,
            unknown_counter: AtomicU32::new(0),
            torn_down: AtomicBool::new(false),
        });

        let control_inner = Arc::downgrade(&inner);
        let control_task = tokio::spawn(async move {
            while let Some(event) = control_rx.recv().await {
                let Some(inner) = control_inner.upgrade() else {
                    break;
                };
                match event {
                    ControlEvent::Disconnect { proxy, cause } => {
                        inner.disconnect(&proxy, cause).await;
                    }
                }
            }
        });
        *inner.control_task.lock() = Some(control_task);

        // The local device configured for this station.
        let device = LogicalDevice::new(
            inner.config.local_device_name.clone(),
            inner.config.local_address,
        );
        inner.register_device(device);

        Ok(Self { inner })
    }

    pub fn config(&self) -> &StackConfig {
        &self.inner.config
    }

    pub fn is_on_master(&self) -> bool {
        self.inner.config.role.is_master()
    }

    pub fn is_on_outstation(&self) -> bool {
        !self.is_on_master()
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.inner.connection_listeners.write().push(listener);
    }

    pub fn add_association_listener(&self, listener: Arc<dyn AssociationListener>) {
        self.inner.association_listeners.write().push(listener);
    }

    pub fn add_fragment_listener(&self, listener: Arc<dyn FragmentListener>) {
        self.inner.fragment_listeners.write().push(listener);
    }

    /// Register a peer. Its socket addresses become demux keys for inbound
    /// traffic.
    pub fn add_remote_endpoint(&self, config: EndpointConfig) {
        let proxy = config.proxy.clone();
        for addr in config.tcp.iter().chain(config.udp.iter()) {
            self.inner
                .by_socket_addr
                .write()
                .insert(*addr, proxy.clone());
            self.inner.by_ip.write().insert(addr.ip(), proxy.clone());
        }
        self.inner.endpoint_configs.write().insert(proxy, config);
    }

    pub fn remote_endpoint(&self, proxy: &str) -> Option<Arc<RemoteEndpoint>> {
        self.inner.endpoints.read().get(proxy).cloned()
    }

    pub fn add_logical_device(&self, name: &str, address: u16) -> Arc<LogicalDevice> {
        if let Some(existing) = self.inner.devices_by_address.read().get(&address) {
            return existing.clone();
        }
        let device = LogicalDevice::new(name, address);
        self.inner.register_device(device.clone());
        device
    }

    pub fn logical_device_by_address(&self, address: u16) -> Option<Arc<LogicalDevice>> {
        self.inner.devices_by_address.read().get(&address).cloned()
    }

    pub fn logical_device_by_name(&self, name: &str) -> Option<Arc<LogicalDevice>> {
        self.inner.devices_by_name.read().get(name).cloned()
    }

    /// Start the TCP accept loop and/or the UDP demux loop per configuration.
    pub async fn start_listening(&self) -> Result<()> {
        if self.inner.config.tcp_listen_enabled() {
            let socket = self.inner.config.tcp_listen_socket();
            let listener = TcpListener::bind(&socket).await?;
            *self.inner.tcp_local_addr.write() = listener.local_addr().ok();
            info!(socket = socket.as_str(), "TCP accept loop started");
            let inner = self.inner.clone();
            let task = tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => inner.accept_tcp(stream, peer).await,
                        Err(err) => {
                            warn!("TCP accept failed: {err}");
                            break;
                        }
                    }
                }
            });
            *self.inner.tcp_listener_task.lock() = Some(task);
        }
        if self.inner.config.udp_listen_enabled() {
            let socket = self.inner.config.udp_listen_socket();
            let udp = Arc::new(UdpSocket::bind(&socket).await?);
            *self.inner.udp_local_addr.write() = udp.local_addr().ok();
            info!(socket = socket.as_str(), "UDP demux loop started");
            *self.inner.udp_socket.write() = Some(udp.clone());
            let inner = self.inner.clone();
            let task = tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match udp.recv_from(&mut buf).await {
                        Ok((len, from)) => {
                            let datagram = Bytes::copy_from_slice(&buf[..len]);
                            inner.route_datagram(from, datagram).await;
                        }
                        Err(err) => {
                            warn!("UDP receive failed: {err}");
                            break;
                        }
                    }
                }
            });
            *self.inner.udp_listener_task.lock() = Some(task);
        }
        Ok(())
    }

    pub async fn stop_listening(&self) {
        self.inner.stop_listening().await;
    }

    /// Actual bound TCP listener address, once listening.
    pub fn tcp_listen_local_addr(&self) -> Option<SocketAddr> {
        *self.inner.tcp_local_addr.read()
    }

    /// Actual bound UDP socket address, once listening.
    pub fn udp_listen_local_addr(&self) -> Option<SocketAddr> {
        *self.inner.udp_local_addr.read()
    }

    /// Establish (or reuse) a connection to the peer, create the association
    /// for the address pair, and probe the link. Returns the association when
    /// the link answered within the reply timeout.
    pub async fn connect(
        &self,
        proxy: &str,
        local_address: u16,
        remote_address: u16,
    ) -> Result<Option<Arc<Association>>> {
        let endpoint = self.inner.live_endpoint(proxy)?;
        let device = self.inner.device_for(local_address);
        self.inner.ensure_connection(&endpoint).await?;
        let (association, created) = endpoint.get_association(local_address, remote_address);
        if created {
            self.inner
                .on_association_created(proxy, &device, &association)
                .await;
        }
        let active = association
            .data_link_layer()
            .is_link_active(endpoint.reply_timeout())
            .await;
        if active {
            Ok(Some(association))
        } else {
            self.inner
                .disconnect(proxy, Some("link status probe timed out".to_string()))
                .await;
            Ok(None)
        }
    }

    /// Drop the peer's connection and destroy its endpoint.
    pub async fn disconnect(&self, proxy: &str) {
        self.inner.disconnect(proxy, None).await;
    }

    /// Idempotent full cleanup: listeners, connections, devices.
    pub async fn tear_down(&self) {
        if self.inner.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.stop_listening().await;
        let proxies: Vec<String> = self.inner.connections.read().keys().cloned().collect();
        for proxy in proxies {
            self.inner.disconnect_quiet(&proxy).await;
        }
        let endpoints: Vec<_> = {
            let mut map = self.inner.endpoints.write();
            map.drain().map(|(_, e)| e).collect()
        };
        for endpoint in endpoints {
            endpoint.close().await;
        }
        let devices: Vec<_> = self
            .inner
            .devices_by_address
            .read()
            .values()
            .cloned()
            .collect();
        for device in devices {
            device.stop().await;
        }
        if let Some(task) = self.inner.control_task.lock().take() {
            task.abort();
        }
        info!("connection manager torn down");
    }
}

impl ManagerInner {
    fn register_device(&self, device: Arc<LogicalDevice>) {
        self.devices_by_name
            .write()
            .insert(device.name().to_string(), device.clone());
        self.devices_by_address
            .write()
            .insert(device.address(), device);
    }

    fn device_for(&self, address: u16) -> Arc<LogicalDevice> {
        if let Some(device) = self.devices_by_address.read().get(&address).cloned() {
            return device;
        }
        let device = LogicalDevice::new(format!("device-{address}"), address);
        self.register_device(device.clone());
        device
    }

    /// Live endpoint for a configured proxy, created on demand.
    fn live_endpoint(self: &Arc<Self>, proxy: &str) -> Result<Arc<RemoteEndpoint>> {
        if let Some(endpoint) = self.endpoints.read().get(proxy) {
            return Ok(endpoint.clone());
        }
        let config = self
            .endpoint_configs
            .read()
            .get(proxy)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown remote endpoint {proxy}")))?;
        let endpoint = RemoteEndpoint::new(config, &self.config, self.control_tx.clone());
        self.endpoints
            .write()
            .insert(proxy.to_string(), endpoint.clone());
        Ok(endpoint)
    }

    /// Outbound connect policy: TCP addresses, then UDP, then serial; the
    /// first success wins.
    async fn ensure_connection(
        self: &Arc<Self>,
        endpoint: &Arc<RemoteEndpoint>,
    ) -> Result<Arc<Connection>> {
        let proxy = endpoint.proxy().to_string();
        if let Some(active) = self.connections.read().get(&proxy) {
            if !active.connection.is_closed() {
                return Ok(active.connection.clone());
            }
        }

        for addr in endpoint.tcp_socket_addresses() {
            match timeout(endpoint.connect_timeout(), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    info!(proxy = proxy.as_str(), %addr, "TCP connection established");
                    let connection = Connection::tcp(
                        format!("TCP-{proxy}"),
                        stream,
                        self.config.role.is_master(),
                        self.config.trace_capacity,
                    );
                    return self.install_connection(endpoint, connection, None).await;
                }
                Ok(Err(err)) => {
                    warn!(proxy = proxy.as_str(), %addr, "TCP connect failed: {err}");
                }
                Err(_) => {
                    warn!(
                        proxy = proxy.as_str(),
                        %addr,
                        "TCP connect timed out after {:?}",
                        endpoint.connect_timeout()
                    );
                }
            }
        }

        for addr in endpoint.udp_socket_addresses() {
            // Reuse the listener's datagram channel when present.
            let shared = self.udp_socket.read().clone();
            let (socket, dedicated) = match shared {
                Some(socket) => (socket, false),
                None => match UdpSocket::bind(("0.0.0.0", 0)).await {
                    Ok(socket) => (Arc::new(socket), true),
                    Err(err) => {
                        warn!("UDP bind failed: {err}");
                        continue;
                    }
                },
            };
            let (tx, rx) = mpsc::channel(32);
            if dedicated {
                // No demux loop owns this socket; pump datagrams ourselves.
                let socket_clone = socket.clone();
                let tx_clone = tx.clone();
                let target = *addr;
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match socket_clone.recv_from(&mut buf).await {
                            Ok((len, from)) if from == target => {
                                if tx_clone
                                    .send(Bytes::copy_from_slice(&buf[..len]))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Ok(_) => {}
                            Err(_) => break,
                        }
                    }
                });
            }
            info!(proxy = proxy.as_str(), %addr, "UDP channel ready");
            let connection = Connection::udp(
                format!("UDP-{proxy}"),
                socket,
                *addr,
                rx,
                self.config.role.is_master(),
                self.config.trace_capacity,
            );
            return self.install_connection(endpoint, connection, Some(tx)).await;
        }

        if let Some((port, speed)) = endpoint.serial_port() {
            match open_serial(port, speed) {
                Ok(stream) => {
                    info!(proxy = proxy.as_str(), port, speed, "serial port open");
                    let connection = Connection::serial(
                        format!("Serial-{proxy}"),
                        stream,
                        self.config.role.is_master(),
                        self.config.trace_capacity,
                    );
                    return self.install_connection(endpoint, connection, None).await;
                }
                Err(err) => {
                    warn!(port, "serial open failed: {err}");
                }
            }
        }

        Err(Error::ServiceNotAvailable(format!(
            "no reachable transport for {proxy}"
        )))
    }

    async fn install_connection(
        self: &Arc<Self>,
        endpoint: &Arc<RemoteEndpoint>,
        connection: Arc<Connection>,
        udp_tx: Option<mpsc::Sender<Bytes>>,
    ) -> Result<Arc<Connection>> {
        let proxy = endpoint.proxy().to_string();
        endpoint.bind_connection(connection.clone());

        let pump = {
            let inner = self.clone();
            let proxy = proxy.clone();
            let connection = connection.clone();
            tokio::spawn(async move { inner.pump(proxy, connection).await })
        };

        let keep_alive = self.config.keep_alive_interval.map(|interval| {
            let endpoint = endpoint.clone();
            let control = self.control_tx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    for association in endpoint.associations() {
                        if !association
                            .data_link_layer()
                            .probe_link(endpoint.reply_timeout())
                            .await
                        {
                            let _ = control.send(ControlEvent::Disconnect {
                                proxy: endpoint.proxy().to_string(),
                                cause: Some("keep-alive probe timed out".to_string()),
                            });
                            return;
                        }
                    }
                }
            })
        });

        let previous = self.connections.write().insert(
            proxy.clone(),
            ActiveConnection {
                connection: connection.clone(),
                pump,
                keep_alive,
                udp_tx,
            },
        );
        if let Some(previous) = previous {
            previous.pump.abort();
            if let Some(task) = previous.keep_alive {
                task.abort();
            }
            previous.connection.close().await;
        }

        let listeners: Vec<_> = self.connection_listeners.read().clone();
        for listener in listeners {
            listener.on_new_connection(&proxy).await;
        }
        Ok(connection)
    }

    /// Per-connection read loop: decode frames and hand them to dispatch.
    async fn pump(self: Arc<Self>, proxy: String, connection: Arc<Connection>) {
        let mut codec = FrameCodec::new(self.config.role.is_master());
        let mut buf = BytesMut::with_capacity(4096);
        let cause = loop {
            loop {
                match tokio_util::codec::Decoder::decode(&mut codec, &mut buf) {
                    Ok(Some(frame)) => self.dispatch_frame(&proxy, frame).await,
                    Ok(None) => break,
                    Err(Error::Protocol(err)) => {
                        // Drop the frame, keep the connection.
                        warn!(proxy = proxy.as_str(), "frame decode error: {err}");
                    }
                    Err(_) => break,
                }
            }
            match connection.receive(&mut buf).await {
                Ok(_) => {}
                Err(Error::ClosedChannel) => break None,
                Err(err) => break Some(err.to_string()),
            }
        };
        self.handle_connection_lost(&proxy, &connection, cause).await;
    }

    async fn handle_connection_lost(
        self: &Arc<Self>,
        proxy: &str,
        connection: &Arc<Connection>,
        cause: Option<String>,
    ) {
        if self.torn_down.load(Ordering::Relaxed) {
            return;
        }
        // Only the pump that still owns the registry entry reports the loss;
        // an explicit disconnect already removed it.
        let owned = {
            let mut connections = self.connections.write();
            let same = connections
                .get(proxy)
                .map(|active| Arc::ptr_eq(&active.connection, connection))
                .unwrap_or(false);
            same && connections.remove(proxy).is_some()
        };
        if owned {
            self.finish_disconnect(proxy, cause).await;
        }
    }

    async fn disconnect(self: &Arc<Self>, proxy: &str, cause: Option<String>) {
        let removed = self.connections.write().remove(proxy);
        if let Some(active) = removed {
            active.pump.abort();
            if let Some(task) = active.keep_alive {
                task.abort();
            }
            active.connection.close().await;
        }
        self.finish_disconnect(proxy, cause).await;
    }

    async fn disconnect_quiet(self: &Arc<Self>, proxy: &str) {
        let removed = self.connections.write().remove(proxy);
        if let Some(active) = removed {
            active.pump.abort();
            if let Some(task) = active.keep_alive {
                task.abort();
            }
            active.connection.close().await;
        }
        let endpoint = self.endpoints.write().remove(proxy);
        if let Some(endpoint) = endpoint {
            endpoint.close().await;
        }
    }

    async fn finish_disconnect(self: &Arc<Self>, proxy: &str, cause: Option<String>) {
        // The endpoint is destroyed on disconnect; a later connect recreates
        // it from the stored configuration.
        let endpoint = self.endpoints.write().remove(proxy);
        if let Some(endpoint) = endpoint {
            endpoint.close().await;
        }
        let devices: Vec<_> = self.devices_by_address.read().values().cloned().collect();
        for device in devices {
            device.stop_peer(proxy).await;
        }
        let listeners: Vec<_> = self.connection_listeners.read().clone();
        for listener in listeners {
            listener.on_lost_connection(proxy, cause.as_deref()).await;
        }
        info!(proxy, cause = cause.as_deref().unwrap_or("-"), "connection lost");
    }

    fn lookup_peer(&self, peer: SocketAddr) -> Option<String> {
        if let Some(proxy) = self.by_socket_addr.read().get(&peer) {
            return Some(proxy.clone());
        }
        self.by_ip.read().get(&peer.ip()).cloned()
    }

    /// Synthesize an endpoint for an unknown inbound peer (outstation only).
    fn synthesize_endpoint(self: &Arc<Self>, peer: SocketAddr, kind: &str) -> Arc<RemoteEndpoint> {
        let n = self.unknown_counter.fetch_add(1, Ordering::Relaxed);
        let proxy = format!("Unknown-{kind}-{n}");
        info!(proxy = proxy.as_str(), %peer, "synthesizing endpoint for unknown peer");
        let mut config = EndpointConfig::new(proxy.clone(), 0);
        match kind {
            "UDP" => config.udp.push(peer),
            _ => config.tcp.push(peer),
        }
        self.by_socket_addr.write().insert(peer, proxy.clone());
        self.by_ip.write().insert(peer.ip(), proxy.clone());
        self.endpoint_configs
            .write()
            .insert(proxy.clone(), config.clone());
        let endpoint = RemoteEndpoint::new(config, &self.config, self.control_tx.clone());
        self.endpoints.write().insert(proxy, endpoint.clone());
        endpoint
    }

    async fn accept_tcp(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let endpoint = match self.lookup_peer(peer) {
            Some(proxy) => match self.live_endpoint(&proxy) {
                Ok(endpoint) => endpoint,
                Err(_) => return,
            },
            None if !self.config.role.is_master() => self.synthesize_endpoint(peer, "TCP"),
            None => {
                warn!(%peer, "rejecting TCP connection from unknown peer");
                return;
            }
        };
        let connection = Connection::tcp(
            format!("TCP-{}", endpoint.proxy()),
            stream,
            self.config.role.is_master(),
            self.config.trace_capacity,
        );
        let _ = self.install_connection(&endpoint, connection, None).await;
    }

    async fn route_datagram(self: &Arc<Self>, from: SocketAddr, datagram: Bytes) {
        let proxy = match self.lookup_peer(from) {
            Some(proxy) => proxy,
            None if !self.config.role.is_master() => {
                self.synthesize_endpoint(from, "UDP").proxy().to_string()
            }
            None => {
                debug!(%from, "datagram from unknown peer discarded");
                return;
            }
        };

        // Existing connection: hand the datagram to its reader.
        let existing = self
            .connections
            .read()
            .get(&proxy)
            .and_then(|active| active.udp_tx.clone());
        if let Some(tx) = existing {
            if tx.send(datagram.clone()).await.is_ok() {
                return;
            }
        } else if self.config.role.is_master() {
            // Masters only route to connections they opened.
            debug!(proxy = proxy.as_str(), "no UDP connection for datagram");
            return;
        }

        // Outstation side: create the connection on demand.
        let Ok(endpoint) = self.live_endpoint(&proxy) else {
            return;
        };
        let Some(socket) = self.udp_socket.read().clone() else {
            return;
        };
        let (tx, rx) = mpsc::channel(32);
        let connection = Connection::udp(
            format!("UDP-{proxy}"),
            socket,
            from,
            rx,
            self.config.role.is_master(),
            self.config.trace_capacity,
        );
        if self
            .install_connection(&endpoint, connection, Some(tx.clone()))
            .await
            .is_ok()
        {
            let _ = tx.send(datagram).await;
        }
    }

    /// Route one decoded frame to the association its addresses select.
    async fn dispatch_frame(self: &Arc<Self>, proxy: &str, frame: Frame) {
        let Ok(endpoint) = self.live_endpoint(proxy) else {
            return;
        };
        let destination = frame.header.destination;

        if destination >= BROADCAST_MIN {
            if self.config.role.is_master() {
                debug!("broadcast frame ignored on master side");
                return;
            }
            let devices: Vec<_> = self.devices_by_address.read().values().cloned().collect();
            for device in devices {
                let (association, created) =
                    endpoint.get_association(device.address(), frame.header.source);
                if created {
                    self.on_association_created(proxy, &device, &association).await;
                }
                association.note_broadcast();
                if let Err(err) = association.data_link_layer().on_frame(&frame).await {
                    warn!("broadcast frame handling failed: {err}");
                }
            }
            return;
        }

        let local = if self.config.self_address_support && destination == SELF_ADDRESS {
            self.config.local_address
        } else {
            destination
        };

        let device = self.device_for(local);
        let (association, created) = endpoint.get_association(local, frame.header.source);
        if created {
            self.on_association_created(proxy, &device, &association).await;
        }
        if let Err(err) = association.data_link_layer().on_frame(&frame).await {
            warn!(
                proxy,
                local,
                remote = frame.header.source,
                "frame handling failed: {err}"
            );
        }
    }

    /// Fire `on_new_association` and start the device server before any
    /// fragment is delivered.
    async fn on_association_created(
        self: &Arc<Self>,
        proxy: &str,
        device: &Arc<LogicalDevice>,
        association: &Arc<Association>,
    ) {
        let listeners: Vec<_> = self.association_listeners.read().clone();
        for listener in listeners {
            listener.on_new_association(association).await;
        }
        device.spawn_server(proxy, association.clone(), self.fragment_listeners.clone());
    }

    async fn stop_listening(&self) {
        if let Some(task) = self.tcp_listener_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.udp_listener_task.lock().take() {
            task.abort();
        }
        self.udp_socket.write().take();
    }
}

fn open_serial(port: &str, speed: u32) -> Result<tokio_serial::SerialStream> {
    use tokio_serial::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort};
    let stream = tokio_serial::new(port, speed)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .flow_control(FlowControl::Hardware)
        .open_native_async()
        .map_err(|err| Error::Config(format!("serial port {port}: {err}")))?;
    // Purge anything queued before we attached.
    stream
        .clear(ClearBuffer::All)
        .map_err(|err| Error::Config(format!("serial purge {port}: {err}")))?;
    Ok(stream)
}
