use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// IANA-registered DNP3 port.
pub const DEFAULT_PORT: u16 = 20000;
/// Hard cap on the application fragment size.
pub const MAX_FRAGMENT_SIZE: usize = 2048;
/// Self-address reserved destination.
pub const SELF_ADDRESS: u16 = 0xFFFC;
/// Broadcast destinations (0xFFFD..=0xFFFF).
pub const BROADCAST_MIN: u16 = 0xFFFD;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum StationRole {
    Master,
    Outstation,
}

impl StationRole {
    pub fn is_master(self) -> bool {
        matches!(self, StationRole::Master)
    }
}

/// Stack-wide configuration for one DNP3 engine instance.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StackConfig {
    pub role: StationRole,
    /// Default local DNP3 device address (16-bit).
    pub local_address: u16,
    pub local_device_name: String,

    // Listeners. Setting either field of a pair enables the loop.
    pub tcp_listen_address: Option<String>,
    pub tcp_listen_port: Option<u16>,
    pub udp_listen_address: Option<String>,
    pub udp_listen_port: Option<u16>,

    /// Per-TCP-target connect attempt bound.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Link-status probe and solicited-response bound.
    #[serde(with = "humantime_serde")]
    pub reply_timeout: Duration,
    /// Application CON wait bound.
    #[serde(with = "humantime_serde")]
    pub confirm_timeout: Duration,
    /// Optional periodic link probe; disabled when unset.
    #[serde(default, with = "humantime_serde")]
    pub keep_alive_interval: Option<Duration>,

    /// Application-layer fragment cap; at most 2048.
    pub max_fragment_size: usize,
    /// Accept destination 0xFFFC as an alias for the local address.
    pub self_address_support: bool,
    /// Per-connection trace ring capacity (records).
    pub trace_capacity: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            role: StationRole::Master,
            local_address: 1,
            local_device_name: "local".to_string(),
            tcp_listen_address: None,
            tcp_listen_port: None,
            udp_listen_address: None,
            udp_listen_port: None,
            connect_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(2),
            confirm_timeout: Duration::from_secs(5),
            keep_alive_interval: None,
            max_fragment_size: MAX_FRAGMENT_SIZE,
            self_address_support: false,
            trace_capacity: 64,
        }
    }
}

impl StackConfig {
    pub fn tcp_listen_enabled(&self) -> bool {
        self.tcp_listen_address.is_some() || self.tcp_listen_port.is_some()
    }

    pub fn udp_listen_enabled(&self) -> bool {
        self.udp_listen_address.is_some() || self.udp_listen_port.is_some()
    }

    pub fn tcp_listen_socket(&self) -> String {
        format!(
            "{}:{}",
            self.tcp_listen_address.as_deref().unwrap_or("0.0.0.0"),
            self.tcp_listen_port.unwrap_or(DEFAULT_PORT)
        )
    }

    pub fn udp_listen_socket(&self) -> String {
        format!(
            "{}:{}",
            self.udp_listen_address.as_deref().unwrap_or("0.0.0.0"),
            self.udp_listen_port.unwrap_or(DEFAULT_PORT)
        )
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_fragment_size == 0 || self.max_fragment_size > MAX_FRAGMENT_SIZE {
            return Err(Error::Config(format!(
                "max_fragment_size {} outside 1..={MAX_FRAGMENT_SIZE}",
                self.max_fragment_size
            )));
        }
        if self.local_address >= SELF_ADDRESS {
            return Err(Error::Config(format!(
                "local_address 0x{:04X} collides with reserved addresses",
                self.local_address
            )));
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(v) = overrides.local_address {
            self.local_address = v;
        }
        if let Some(v) = overrides.tcp_listen_address {
            self.tcp_listen_address = Some(v);
        }
        if let Some(v) = overrides.tcp_listen_port {
            self.tcp_listen_port = Some(v);
        }
        if let Some(v) = overrides.udp_listen_address {
            self.udp_listen_address = Some(v);
        }
        if let Some(v) = overrides.udp_listen_port {
            self.udp_listen_port = Some(v);
        }
        if let Some(v) = overrides.connect_timeout {
            self.connect_timeout = v;
        }
        if let Some(v) = overrides.reply_timeout {
            self.reply_timeout = v;
        }
        if let Some(v) = overrides.confirm_timeout {
            self.confirm_timeout = v;
        }
        if let Some(v) = overrides.max_fragment_size {
            self.max_fragment_size = v;
        }
        if let Some(v) = overrides.self_address_support {
            self.self_address_support = v;
        }
    }
}

/// CLI-mergeable subset of `StackConfig`.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ConfigOverrides {
    pub local_address: Option<u16>,
    pub tcp_listen_address: Option<String>,
    pub tcp_listen_port: Option<u16>,
    pub udp_listen_address: Option<String>,
    pub udp_listen_port: Option<u16>,
    #[serde(default, with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub reply_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub confirm_timeout: Option<Duration>,
    pub max_fragment_size: Option<usize>,
    pub self_address_support: Option<bool>,
}

/// One configured remote peer.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EndpointConfig {
    /// Stable identifier for the peer ("proxy" name).
    pub proxy: String,
    /// DNP3 address of the remote device.
    pub remote_address: u16,
    /// Local address override for associations with this peer.
    pub local_address: Option<u16>,

    #[serde(default)]
    pub tcp: Vec<SocketAddr>,
    #[serde(default)]
    pub udp: Vec<SocketAddr>,
    pub serial_port_name: Option<String>,
    pub serial_port_speed: Option<u32>,

    // Per-endpoint overrides of the stack defaults.
    #[serde(default, with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub reply_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub confirm_timeout: Option<Duration>,
    pub max_fragment_size: Option<usize>,
}

impl EndpointConfig {
    pub fn new(proxy: impl Into<String>, remote_address: u16) -> Self {
        Self {
            proxy: proxy.into(),
            remote_address,
            local_address: None,
            tcp: Vec::new(),
            udp: Vec::new(),
            serial_port_name: None,
            serial_port_speed: None,
            connect_timeout: None,
            reply_timeout: None,
            confirm_timeout: None,
            max_fragment_size: None,
        }
    }

    pub fn with_tcp(mut self, addr: SocketAddr) -> Self {
        self.tcp.push(addr);
        self
    }

    pub fn with_udp(mut self, addr: SocketAddr) -> Self {
        self.udp.push(addr);
        self
    }

    pub fn with_serial(mut self, port: impl Into<String>, speed: u32) -> Self {
        self.serial_port_name = Some(port.into());
        self.serial_port_speed = Some(speed);
        self
    }
}

/// On-disk configuration: the stack plus its configured peers.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FileConfig {
    #[serde(flatten)]
    pub stack: StackConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            stack: StackConfig::default(),
            endpoints: Vec::new(),
        }
    }
}

/// Defaults, then `DNP3_*` environment, then an optional file.
pub fn load_config(path: Option<PathBuf>) -> Result<FileConfig, config::ConfigError> {
    let builder = config::Config::builder()
        .add_source(config::Config::try_from(&FileConfig::default())?)
        .add_source(config::Environment::with_prefix("DNP3"));

    if let Some(p) = path {
        if p.exists() {
            return builder
                .add_source(config::File::from(p))
                .build()?
                .try_deserialize();
        }
    }

    builder
        .add_source(config::File::with_name("dnp3").required(false))
        .build()?
        .try_deserialize()
}
