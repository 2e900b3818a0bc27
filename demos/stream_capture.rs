// Streaming capture into a shared sample store
//
// Runs the acquisition pipeline against the pattern generator on a worker
// thread while the main thread watches the store fill up and prints the
// coarse envelope of what has been captured so far.

use clap::Parser;
use dslcapture::capture_frame;
use dslcapture::{
    AcquisitionConfig, AcquisitionPipeline, CaptureFeed, ChannelSet, DemoDevice, Pattern,
    SampleStore,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "stream_capture")]
#[command(about = "Capture a generated pattern into a sample store")]
struct Args {
    /// Sample rate in Hz
    #[arg(short, long, default_value_t = 1_000_000)]
    rate: u64,

    /// Number of 16-bit channels
    #[arg(short, long, default_value_t = 2)]
    channels: u16,

    /// Stop after this many samples (0 streams until --seconds elapse)
    #[arg(short, long, default_value_t = 0)]
    limit: u64,

    /// Wall-clock duration of an unbounded capture
    #[arg(short, long, default_value_t = 1.0)]
    seconds: f64,

    /// Store depth in samples for unbounded captures
    #[arg(short, long, default_value_t = 1 << 18)]
    depth: usize,

    /// Pattern: counter, square, random
    #[arg(short, long, default_value = "square", value_parser = ["counter", "square", "random"])]
    pattern: String,

    /// Write the captured samples to this CSV file
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

    let pattern = match args.pattern.as_str() {
        "counter" => Pattern::Counter,
        "random" => Pattern::Random { seed: 0x2A0E },
        _ => Pattern::Square { half_period: 1000 },
    };

    let store = Arc::new(SampleStore::new());
    let feed = CaptureFeed::new(Arc::clone(&store)).with_depth(args.depth);
    let mut pipeline = AcquisitionPipeline::new(DemoDevice::new(pattern), feed);
    let stop = pipeline.stop_handle();

    let config = AcquisitionConfig::new(args.rate, ChannelSet::first(args.channels, 16))
        .with_limit_samples(args.limit);
    pipeline.start(config)?;

    println!("Streaming {} pattern at {} Hz", args.pattern, args.rate);
    let worker = std::thread::spawn(move || {
        let state = pipeline.run();
        (state, pipeline.into_parts().1)
    });

    let started = Instant::now();
    let duration = Duration::from_secs_f64(args.seconds);
    while !store.ended() {
        if args.limit == 0 && started.elapsed() >= duration {
            stop.stop();
        }
        print_progress(&store);
        std::thread::sleep(Duration::from_millis(100));
    }

    let (state, feed) = worker
        .join()
        .map_err(|_| "acquisition thread panicked")?;
    println!(
        "\nAcquisition {} after {} samples ({} written)",
        state.as_str(),
        store.logical_count(),
        store.total_written()
    );
    if let Some(error) = feed.error() {
        println!("Error: {error}");
    }

    if let Some(path) = args.csv {
        let mut df = capture_frame::to_frame(&store, args.rate)?;
        capture_frame::write_csv(&mut df, &path)?;
        println!("Wrote {} rows to {}", df.height(), path.display());
    }
    Ok(())
}

fn print_progress(store: &SampleStore) {
    let count = store.logical_count() as u64;
    let envelope = store
        .channels()
        .and_then(|_| store.envelope(0, count, (count as f64 / 8.0).max(1.0), 0));
    let Some(envelope) = envelope else {
        print!("\r{count} samples");
        return;
    };
    let spans: Vec<String> = envelope
        .samples
        .iter()
        .take(8)
        .map(|entry| entry.map_or_else(|| "-".to_string(), |e| format!("{}..{}", e.min, e.max)))
        .collect();
    print!(
        "\r{count} samples | level {} (x{}) | {}",
        envelope.level,
        envelope.scale,
        spans.join(" ")
    );
    use std::io::Write;
    let _ = std::io::stdout().flush();
}
