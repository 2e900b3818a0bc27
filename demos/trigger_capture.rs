// Triggered capture
//
// Waits for a rising edge on bit 0 of a square wave and prints the events the
// pipeline delivers to a consumer thread over a channel.

use clap::Parser;
use dslcapture::{
    AcquisitionConfig, AcquisitionEvent, AcquisitionPipeline, ChannelSet, DemoDevice, Pattern,
    TriggerConfig, TriggerStage,
};

#[derive(Parser)]
#[command(name = "trigger_capture")]
#[command(about = "Capture around a rising edge of a generated square wave")]
struct Args {
    /// Samples to capture
    #[arg(short, long, default_value_t = 4096)]
    limit: u64,

    /// Percentage of the capture taken from before the trigger
    #[arg(short, long, default_value_t = 25)]
    position: u8,

    /// Samples per half period of the square wave
    #[arg(long, default_value_t = 3000)]
    half_period: u64,

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

    let trigger = TriggerConfig::new(vec![
        TriggerStage::when().low(0).matches_for(16),
        TriggerStage::when().rising(0).matches(),
    ])
    .with_position(args.position);
    let config = AcquisitionConfig::new(10_000_000, ChannelSet::new(vec![0], 8))
        .with_trigger(trigger)
        .with_limit_samples(args.limit);

    let (sender, receiver) = crossbeam_channel::unbounded();
    let device = DemoDevice::new(Pattern::Square {
        half_period: args.half_period,
    });
    let mut pipeline = AcquisitionPipeline::new(device, sender);
    pipeline.start(config)?;
    let worker = std::thread::spawn(move || pipeline.run());

    let mut samples = 0usize;
    for event in receiver {
        match event {
            AcquisitionEvent::Header(header) => println!(
                "Header: {} Hz, {} channels, {} samples, {} pre-trigger",
                header.sample_rate,
                header.channels.len(),
                header.limit_samples,
                header.pretrigger_samples
            ),
            AcquisitionEvent::Trigger { offset } => {
                println!("Trigger: {offset} samples before the trigger point");
            }
            AcquisitionEvent::Data(packet) => {
                let rows = packet.rows(1);
                println!(
                    "Data: {rows} samples, first {:#04x}, last {:#04x}",
                    packet.data.first().copied().unwrap_or_default(),
                    packet.data.last().copied().unwrap_or_default()
                );
                samples += rows;
            }
            AcquisitionEvent::Error(error) => println!("Error: {error}"),
            AcquisitionEvent::End => {
                println!("End after {samples} samples");
                break;
            }
        }
    }

    let state = worker.join().map_err(|_| "acquisition thread panicked")?;
    println!("Pipeline {}", state.as_str());
    Ok(())
}
