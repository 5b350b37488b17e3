// Oscilloscope capture example
//
// Grabs one frame from a DSCope and prints it as volts.

use clap::Parser;
use dslogic_rs::{ConfigKey, DslConnector, DsoFrame, Packet, PacketKind, PacketRecorder, PacketSink};
use std::path::PathBuf;

#[derive(Parser)]
#[command(about = "Capture one oscilloscope frame from a DSCope")]
struct Args {
    /// Sample rate in Hz
    #[arg(long, default_value_t = 100_000_000)]
    samplerate: u64,

    /// Samples per channel
    #[arg(long, default_value_t = 1024)]
    samples: u64,

    /// Volts/div of both channels in millivolts
    #[arg(long, default_value_t = 1000)]
    vdiv: u64,

    /// AC or DC coupling
    #[arg(long, default_value = "DC")]
    coupling: String,

    /// Trigger source: auto, ch0, ch1, ch0&ch1, ch0|ch1
    #[arg(long, default_value = "auto")]
    source: String,

    /// Directory holding firmware and FPGA bitstreams
    #[arg(long, default_value = "res")]
    resources: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut device = DslConnector::connect(Some("DSCope"), None, &args.resources)?;
    println!("Connected to {}", device.profile().model);

    device.set(ConfigKey::DeviceMode, "dso".into())?;
    device.set(ConfigKey::SampleRate, args.samplerate.into())?;
    device.set(ConfigKey::LimitSamples, args.samples.into())?;
    device.set(ConfigKey::TriggerSource, args.source.as_str().into())?;
    for channel in 0..device.channels().len() as u16 {
        device.set(ConfigKey::VoltsPerDiv { channel }, args.vdiv.into())?;
        device.set(ConfigKey::Coupling { channel }, args.coupling.as_str().into())?;
    }

    // One frame is enough: stop as soon as it arrives.
    let handle = device.handle();
    let mut recorder = PacketRecorder::new();
    let mut sink = |packet: &Packet<'_>| {
        if packet.kind() == PacketKind::Dso {
            handle.stop();
        }
        recorder.send(packet);
    };
    device.acquire(&mut sink)?;

    let Some(payload) = recorder.packets().iter().find_map(|p| match p {
        Packet::Dso(d) => Some(d),
        _ => None,
    }) else {
        println!("No frame captured");
        return Ok(());
    };

    let mut df = DsoFrame::from_payload(payload)?;
    let enabled = device.channels().iter().filter(|c| c.enabled);
    for (column, ch) in enabled.enumerate() {
        df = DsoFrame::with_voltage(df, column, ch.vdiv, ch.offset, ch.bits)?;
    }
    println!("{}", df.head(Some(16)));
    println!("Trigger on channel {} ({})", payload.trig_ch, payload.trig_flag);

    Ok(())
}
