// Logic capture example
//
// Captures from a DSLogic, optionally with a simple trigger, prints a
// summary of the polars frame and can store the capture as a session
// archive directory.

use clap::Parser;
use dslogic_rs::session_archive::SessionHeader;
use dslogic_rs::{
    AcquisitionSettings, ConfigKey, DslConnector, LogicFrame, OperationMode, Packet, PacketKind, PacketRecorder,
    SessionArchive,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(about = "Capture logic samples from a DSLogic")]
struct Args {
    /// Sample rate in Hz
    #[arg(long, default_value_t = 1_000_000)]
    samplerate: u64,

    /// Samples per channel
    #[arg(long, default_value_t = 1_048_576)]
    samples: u64,

    /// Number of channels to keep enabled, starting at channel 0
    #[arg(long, default_value_t = 8)]
    channels: u16,

    /// Trigger symbols, highest channel first, e.g. "XXXXXXXXXXXXXXXR"
    #[arg(long)]
    trigger: Option<String>,

    /// Trigger position in percent of the capture
    #[arg(long, default_value_t = 10)]
    position: u8,

    /// Settings file applied before the command-line options
    #[arg(long)]
    config: Option<PathBuf>,

    /// Store the capture as an archive directory
    #[arg(long)]
    save: Option<PathBuf>,

    /// Directory holding firmware and FPGA bitstreams
    #[arg(long, default_value = "res")]
    resources: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut device = DslConnector::connect(None, None, &args.resources)?;
    println!("Connected to {}", device.profile().model);

    if let Some(path) = &args.config {
        device.apply(&AcquisitionSettings::load(path)?)?;
    }
    device.set(ConfigKey::DeviceMode, "logic".into())?;
    device.set(ConfigKey::SampleRate, args.samplerate.into())?;
    device.set(ConfigKey::LimitSamples, args.samples.into())?;
    for channel in 0..device.channels().len() as u16 {
        device.set(ConfigKey::ChannelEnable { channel }, (channel < args.channels).into())?;
    }
    if let Some(symbols) = &args.trigger {
        device.set(ConfigKey::TriggerValue { stage: 0 }, symbols.as_str().into())?;
        device.set(ConfigKey::TriggerPosition, args.position.into())?;
        device.set(ConfigKey::TriggerEnable, true.into())?;
    }

    let mut recorder = PacketRecorder::new();
    let summary = device.acquire(&mut recorder)?;
    println!(
        "Captured {} samples ({} bytes){}",
        summary.samples,
        summary.bytes,
        if summary.overflow { ", overflow" } else { "" }
    );
    if let Some(status) = summary.transfer_error {
        println!("Transfer error: {}", status.as_str());
    }

    let unit_size = recorder
        .packets()
        .iter()
        .find_map(|p| match p {
            Packet::Logic(l) => Some(l.unit_size),
            _ => None,
        })
        .unwrap_or(1);
    let data = recorder.logic_bytes();
    let df = LogicFrame::from_bytes(&data, unit_size, usize::from(args.channels), args.samplerate)?;
    println!("{}", df.head(Some(10)));
    println!("{} trigger packet(s)", recorder.count(PacketKind::Trigger));

    if let Some(dir) = &args.save {
        let header = SessionHeader::new(device.profile().model, OperationMode::Logic, args.samplerate, summary.samples)
            .with_channels(device.channels());
        SessionArchive::from_logic(&header, &data, usize::from(unit_size)).save(dir)?;
        println!("Saved archive to {}", dir.display());
    }

    Ok(())
}
