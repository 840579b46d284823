use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use cp_harness::dump::render_dump;
use cp_harness::harness::Harness;
use cp_harness::packet::{NUM_PKTS, PKT_SIZE};
use cp_harness::platform::Platform;
use cp_harness::platform::loopback::{LoopbackOptions, LoopbackPlatform};
use cp_harness::platform::pcap_backend::{PcapConfig, PcapPlatform};
use cp_harness::scheduler::TX_PERIOD;

/// Device status port handed to the driver at bring-up
const STATUS_PORT: u16 = 7777;

#[derive(Parser, Debug)]
#[command(name = "cp-harness")]
#[command(about = "Inject a fixed burst of packets into the dataplane and compare what comes back")]
#[command(version = "1.0.0")]
struct Args {
    /// Packet platform to drive
    #[arg(short, long, value_enum, default_value = "pcap")]
    backend: Backend,

    /// Network interface exposing the device CPU port
    #[arg(short, long, default_value = "bf_pci0")]
    interface: String,

    /// Table programming script run through bfshell
    #[arg(short, long, default_value = "commands-newtopo-tofino1.txt")]
    table_script: PathBuf,

    /// SDE install directory
    #[arg(long, env = "SDE_INSTALL")]
    sde_install: Option<PathBuf>,

    /// Seconds to let the ASIC settle before sending
    #[arg(short, long, default_value = "3")]
    warmup_secs: u64,

    /// Verbose logging (default: false)
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// libpcap on the CPU port interface
    Pcap,
    /// In-process dataplane that echoes every packet
    Loopback,
}

fn build_platform(args: &Args) -> Arc<dyn Platform> {
    match args.backend {
        Backend::Pcap => Arc::new(PcapPlatform::new(PcapConfig {
            interface: args.interface.clone(),
            table_script: Some(args.table_script.clone()),
            sde_install: args.sde_install.clone(),
            status_port: STATUS_PORT,
        })),
        Backend::Loopback => Arc::new(LoopbackPlatform::new(LoopbackOptions::default())),
    }
}

/// Forward every Ctrl-C to the main task. The listener stays installed for
/// the life of the process, so a second interrupt cannot cut the dump short.
async fn forward_interrupts(interrupts: mpsc::UnboundedSender<()>) {
    let mut count = 0u64;
    loop {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        count += 1;
        if count > 1 {
            info!("Interrupt received, dump already in progress");
        }
        if interrupts.send(()).is_err() {
            return;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .init();

    let (interrupt_tx, mut interrupts) = mpsc::unbounded_channel();
    tokio::spawn(forward_interrupts(interrupt_tx));

    info!("Starting control plane unit ({:?} backend)", args.backend);
    info!(
        "Sending {} packets every {:?}, recording {} bytes each",
        NUM_PKTS, TX_PERIOD, PKT_SIZE
    );

    let platform = build_platform(&args);
    let mut harness = tokio::task::spawn_blocking(move || Harness::bring_up(platform))
        .await
        .context("Harness bring-up panicked")?;

    let warmup = Duration::from_secs(args.warmup_secs);
    let interrupted_early = tokio::select! {
        _ = tokio::time::sleep(warmup) => false,
        _ = interrupts.recv() => true,
    };

    if interrupted_early {
        info!("Interrupted before sending started");
    } else {
        info!("Waited {:?} for the device to settle, sending", warmup);
        harness
            .start_transmitting()
            .context("Failed to start transmit scheduler")?;
        interrupts.recv().await;
    }

    info!("Caught interrupt, stopping transmit and capture");
    let snapshot = tokio::task::spawn_blocking(move || harness.stop())
        .await
        .context("Harness shutdown panicked")?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if let Err(e) = render_dump(&mut out, &snapshot) {
        warn!("Failed to write dump: {}", e);
    }
    let _ = out.flush();

    std::process::exit(1);
}
