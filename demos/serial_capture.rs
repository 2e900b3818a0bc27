// Capture from a serial streaming device
//
// Connects to an attached device (by product name or explicit port), records
// a bounded capture and optionally writes it to CSV with per-bit columns.

use clap::Parser;
use dslcapture::capture_frame;
use dslcapture::serial_device::{self, SerialDevice};
use dslcapture::{AcquisitionConfig, AcquisitionPipeline, CaptureFeed, ChannelSet, SampleStore};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "serial_capture")]
#[command(about = "Record a capture from a serial streaming logic analyzer")]
struct Args {
    /// Serial port to open instead of searching for a device
    #[arg(short, long)]
    port: Option<String>,

    /// Product name to look for
    #[arg(short, long)]
    name: Option<String>,

    /// List attached devices and exit
    #[arg(long)]
    list: bool,

    /// Sample rate in Hz
    #[arg(short, long, default_value_t = 1_000_000)]
    rate: u64,

    /// Samples to capture
    #[arg(short, long, default_value_t = 100_000)]
    limit: u64,

    /// Write the capture to this CSV file, one column per bit
    #[arg(long)]
    csv: Option<std::path::PathBuf>,

    /// Show debug information and detailed logs
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    if args.list {
        for device in serial_device::available_devices(args.name.as_deref())? {
            println!("Found device: {} at {}", device.name, device.port);
        }
        return Ok(());
    }

    let device = match &args.port {
        Some(port) => SerialDevice::open(port)?,
        None => SerialDevice::connect(args.name.as_deref())?,
    };

    let store = Arc::new(SampleStore::new());
    let mut pipeline = AcquisitionPipeline::new(device, CaptureFeed::new(Arc::clone(&store)));
    let config = AcquisitionConfig::new(args.rate, ChannelSet::new(vec![0], 16))
        .with_limit_samples(args.limit);
    pipeline.start(config)?;
    let state = pipeline.run();

    println!(
        "Acquisition {} with {} samples",
        state.as_str(),
        store.logical_count()
    );
    if let Some(error) = pipeline.sink().error() {
        println!("Error: {error}");
    }

    if let Some(path) = args.csv {
        let mut df = capture_frame::to_frame(&store, args.rate)?;
        let column = capture_frame::channel_column_name(0);
        capture_frame::extract_bits(&mut df, &column, 16)?;
        capture_frame::write_csv(&mut df, &path)?;
        println!("Wrote {} rows to {}", df.height(), path.display());
    }
    Ok(())
}
