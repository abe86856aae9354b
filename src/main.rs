use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tinybms_rs::tinybms::client::TinyBmsClient;
use tinybms_rs::tinybms::serial::TinyBmsTransport;
use tinybms_rs::tinybms::registers::lookup;
use tinybms_rs::victron::can::{CanBus, CanFrame};
use tinybms_rs::{init_logger, log_info, Error, Gateway, GatewayConfig, LiveDataStore};

#[derive(Parser)]
#[command(name = "tinybms-gateway")]
#[command(about = "TinyBMS to Victron CAN gateway")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port override.
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate override.
    #[arg(short, long)]
    baudrate: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway until interrupted.
    Run {
        /// Publish simulated pack data instead of polling a TinyBMS.
        #[arg(long)]
        simulate: bool,
    },
    /// Read one register block and print the decoded values.
    ReadBlock { address: u16, count: usize },
    /// Write a register and verify the readback.
    WriteRegister { address: u16, value: f64 },
}

/// Stand-in CAN backend that traces outbound frames. The physical
/// controller is platform-provided and wired in behind the [`CanBus`]
/// trait at integration time.
struct TraceCanBus;

#[async_trait::async_trait]
impl CanBus for TraceCanBus {
    async fn transmit(&self, frame: &CanFrame) -> Result<(), Error> {
        log::debug!(
            "can tx 0x{:03X} [{}] {:02X?}",
            frame.id,
            frame.dlc,
            &frame.data[..frame.dlc as usize]
        );
        Ok(())
    }

    async fn receive(&self, window: std::time::Duration) -> Result<Option<CanFrame>, Error> {
        tokio::time::sleep(window).await;
        Ok(None)
    }

    async fn recover(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    if let Some(port) = &cli.port {
        config.serial.port = port.clone();
    }
    if let Some(baudrate) = cli.baudrate {
        config.serial.baudrate = baudrate;
    }

    match cli.command {
        Commands::Run { simulate } => {
            let gateway = if simulate {
                Gateway::start_simulated(config, Arc::new(TraceCanBus)).await?
            } else {
                let port = open_port(&config)?;
                Gateway::start(config, port, Arc::new(TraceCanBus)).await?
            };
            log_info("gateway running, ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            gateway.deinit().await;
        }
        Commands::ReadBlock { address, count } => {
            let client = one_shot_client(&config)?;
            let values = client.read_block(address, count).await?;
            for (addr, value) in &values {
                let label = lookup(*addr).map(|d| d.label).unwrap_or("?");
                log_info(&format!("0x{addr:04X} {label}: {value:?}"));
            }
        }
        Commands::WriteRegister { address, value } => {
            let client = one_shot_client(&config)?;
            client.write_register(address, value).await?;
            log_info(&format!("0x{address:04X} <- {value} verified"));
        }
    }

    Ok(())
}

fn open_port(config: &GatewayConfig) -> anyhow::Result<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;
    tokio_serial::new(&config.serial.port, config.serial.baudrate)
        .data_bits(tokio_serial::DataBits::Eight)
        .stop_bits(tokio_serial::StopBits::One)
        .parity(tokio_serial::Parity::None)
        .open_native_async()
        .with_context(|| format!("opening {}", config.serial.port))
}

fn one_shot_client(
    config: &GatewayConfig,
) -> anyhow::Result<TinyBmsClient<tokio_serial::SerialStream>> {
    let port = open_port(config)?;
    let transport = Arc::new(TinyBmsTransport::with_port(port, config.serial.clone()));
    let store = LiveDataStore::new(config.poll.failure_threshold);
    Ok(TinyBmsClient::new(transport, store, config.poll.clone()))
}
