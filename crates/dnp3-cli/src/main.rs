use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use dnp3_core::{
    load_config, Association, ConnectionManager, EndpointConfig, Fragment, FragmentListener,
    PointValue, ReadTransaction, StackConfig, StationRole, WriteTransaction,
};

#[derive(Parser, Debug)]
#[command(name = "esnode-dnp3", version, about = "DNP3 master poll tool and outstation listener")]
struct Cli {
    /// Optional path to configuration file. Also read from `DNP3_CONFIG`.
    #[arg(long, env = "DNP3_CONFIG")]
    config: Option<PathBuf>,

    /// Local DNP3 device address.
    #[arg(long, env = "DNP3_LOCAL_ADDRESS")]
    local_address: Option<u16>,

    /// Remote DNP3 device address.
    #[arg(long, env = "DNP3_REMOTE_ADDRESS", default_value_t = 1)]
    remote_address: u16,

    /// Outstation TCP target, e.g. 10.0.0.5:20000
    #[arg(long, env = "DNP3_TCP")]
    tcp: Option<SocketAddr>,

    /// Outstation UDP target.
    #[arg(long, env = "DNP3_UDP")]
    udp: Option<SocketAddr>,

    /// Serial port name (e.g. /dev/ttyUSB0).
    #[arg(long, env = "DNP3_SERIAL_PORT")]
    serial_port: Option<String>,

    /// Serial baud rate.
    #[arg(long, env = "DNP3_SERIAL_SPEED", default_value_t = 9600)]
    serial_speed: u32,

    /// Link-status and response wait (e.g. 500ms, 2s).
    #[arg(long, env = "DNP3_REPLY_TIMEOUT")]
    reply_timeout: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Class poll (0..=3).
    Poll {
        #[arg(default_value_t = 0)]
        class: u8,
    },
    /// Integrity poll: class 1, 2, 3 events plus class 0 static data.
    Integrity,
    /// Read one binary input.
    ReadBinary { index: u16 },
    /// Read one analog input.
    ReadAnalog { index: u16 },
    /// Read one counter.
    ReadCounter { index: u16 },
    /// Latch a binary output on or off via direct operate.
    Operate {
        index: u16,
        #[arg(long)]
        off: bool,
    },
    /// Run as an outstation listener and print received fragments.
    Listen {
        /// TCP listen port.
        #[arg(long, default_value_t = dnp3_core::DEFAULT_PORT)]
        port: u16,
    },
}

struct FragmentPrinter;

#[async_trait]
impl FragmentListener for FragmentPrinter {
    async fn on_received_fragment(
        &self,
        association: &Arc<Association>,
        fragment: &Fragment,
    ) -> bool {
        println!(
            "fragment from {}: {:?} seq={} items={}",
            association.remote_address(),
            fragment.function,
            fragment.control.seq,
            fragment.items.len()
        );
        false
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let file = load_config(cli.config.clone()).context("loading configuration")?;
    let mut stack = file.stack;
    if let Some(address) = cli.local_address {
        stack.local_address = address;
    }
    if let Some(raw) = &cli.reply_timeout {
        stack.reply_timeout = humantime::parse_duration(raw)
            .with_context(|| format!("invalid reply timeout {raw:?}"))?;
    }

    match cli.command {
        Command::Listen { port } => run_outstation(stack, port).await,
        _ => run_master(stack, file.endpoints, cli).await,
    }
}

async fn run_outstation(mut stack: StackConfig, port: u16) -> Result<()> {
    stack.role = StationRole::Outstation;
    if !stack.tcp_listen_enabled() {
        stack.tcp_listen_port = Some(port);
    }
    let manager = ConnectionManager::new(stack)?;
    manager.add_fragment_listener(Arc::new(FragmentPrinter));
    manager.start_listening().await?;
    info!(
        "outstation listening on {:?}",
        manager.tcp_listen_local_addr()
    );
    signal::ctrl_c().await?;
    manager.tear_down().await;
    Ok(())
}

async fn run_master(
    mut stack: StackConfig,
    endpoints: Vec<EndpointConfig>,
    cli: Cli,
) -> Result<()> {
    stack.role = StationRole::Master;
    let manager = ConnectionManager::new(stack)?;

    let proxy = if let Some(endpoint) = endpoints.into_iter().next() {
        let proxy = endpoint.proxy.clone();
        manager.add_remote_endpoint(endpoint);
        proxy
    } else {
        let mut endpoint = EndpointConfig::new("target", cli.remote_address);
        if let Some(addr) = cli.tcp {
            endpoint = endpoint.with_tcp(addr);
        }
        if let Some(addr) = cli.udp {
            endpoint = endpoint.with_udp(addr);
        }
        if let Some(port) = &cli.serial_port {
            endpoint = endpoint.with_serial(port.clone(), cli.serial_speed);
        }
        if endpoint.tcp.is_empty() && endpoint.udp.is_empty() && endpoint.serial_port_name.is_none()
        {
            bail!("no target: pass --tcp, --udp, or --serial-port, or configure an endpoint");
        }
        manager.add_remote_endpoint(endpoint);
        "target".to_string()
    };

    let local = manager.config().local_address;
    let association = manager
        .connect(&proxy, local, cli.remote_address)
        .await?
        .context("link is not active")?;

    match cli.command {
        Command::Poll { class } => {
            let mut transaction = ReadTransaction::new(association);
            let responses = transaction.read_class(class).commit().await?;
            print_read(&responses);
        }
        Command::Integrity => {
            let mut transaction = ReadTransaction::new(association);
            let responses = transaction.read_integrity().commit().await?;
            print_read(&responses);
        }
        Command::ReadBinary { index } => {
            let mut transaction = ReadTransaction::new(association);
            let responses = transaction.read_binary_input(index).commit().await?;
            print_read(&responses);
        }
        Command::ReadAnalog { index } => {
            let mut transaction = ReadTransaction::new(association);
            let responses = transaction.read_analog_input(index).commit().await?;
            print_read(&responses);
        }
        Command::ReadCounter { index } => {
            let mut transaction = ReadTransaction::new(association);
            let responses = transaction.read_counter(index).commit().await?;
            print_read(&responses);
        }
        Command::Operate { index, off } => {
            let mut transaction = WriteTransaction::new(association);
            let responses = transaction.operate_binary(index, !off).commit().await?;
            for response in &responses {
                if response.is_success() {
                    println!("operate {index}: ok");
                } else {
                    println!(
                        "operate {index}: FAILED ({})",
                        response.error.as_deref().unwrap_or("unknown")
                    );
                }
            }
        }
        Command::Listen { .. } => unreachable!("handled above"),
    }

    manager.tear_down().await;
    Ok(())
}

fn print_read(responses: &[dnp3_core::Response<dnp3_core::ReadPoint>]) {
    for response in responses {
        if !response.is_success() {
            println!(
                "{:?}: FAILED ({})",
                response.request,
                response.error.as_deref().unwrap_or("unknown")
            );
            continue;
        }
        if response.values.is_empty() {
            println!("{:?}: ok (no data)", response.request);
        }
        for (index, value) in &response.values {
            let index = index.map(|i| i.to_string()).unwrap_or_else(|| "-".into());
            match value {
                PointValue::Binary(state) => println!("{:?}[{index}] = {state}", response.request),
                PointValue::Analog(v) => println!("{:?}[{index}] = {v}", response.request),
                PointValue::Counter(v) => println!("{:?}[{index}] = {v}", response.request),
                PointValue::Time(ms) => println!("{:?}[{index}] = {ms} ms", response.request),
            }
        }
    }
}
