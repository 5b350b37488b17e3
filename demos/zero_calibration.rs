// Zero calibration example
//
// Runs the DSCope zero calibration with the inputs disconnected and saves
// the result to the device.

use clap::Parser;
use dslogic_rs::{ConfigKey, ConfigOutcome, ConfigValue, DslConnector, Packet, PacketKind};
use std::io::{self, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(about = "Run the DSCope zero calibration")]
struct Args {
    /// Skip the confirmation prompt
    #[arg(long, short)]
    yes: bool,

    /// Give up after this many captures
    #[arg(long, default_value_t = 8)]
    rounds: u32,

    /// Directory holding firmware and FPGA bitstreams
    #[arg(long, default_value = "res")]
    resources: PathBuf,
}

fn calibrating(value: ConfigOutcome<ConfigValue>) -> bool {
    value.done().and_then(|v| v.as_bool()).unwrap_or(false)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut device = DslConnector::connect(Some("DSCope"), None, &args.resources)?;
    println!("Connected to {}", device.profile().model);

    if !args.yes {
        print!("Disconnect both inputs, then press enter to start (or type n to abort): ");
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if input.trim().eq_ignore_ascii_case("n") {
            println!("Aborted.");
            return Ok(());
        }
    }

    device.set(ConfigKey::DeviceMode, "dso".into())?;
    device.set(ConfigKey::Calibrate, true.into())?;

    for round in 1..=args.rounds {
        let mut frames = 0usize;
        let mut sink = |packet: &Packet<'_>| {
            if packet.kind() == PacketKind::Dso {
                frames += 1;
                if frames % 50 == 0 {
                    print!(".");
                    let _ = io::stdout().flush();
                }
            }
        };
        device.acquire(&mut sink)?;
        println!("\nRound {round}: {frames} frames");

        if calibrating(device.get(ConfigKey::ZeroCombFgain)) {
            println!("Switching to single-channel captures");
            device.set(ConfigKey::ChannelEnable { channel: 1 }, false.into())?;
            device.set(ConfigKey::ZeroComb, true.into())?;
            continue;
        }

        if !calibrating(device.get(ConfigKey::Calibrate)) {
            device.set(ConfigKey::ChannelEnable { channel: 1 }, true.into())?;
            device.set(ConfigKey::ZeroComb, false.into())?;
            device.set(ConfigKey::ZeroSet, true.into())?;
            println!("Zero calibration finished and saved.");
            for ch in device.channels() {
                println!(
                    "  channel {}: zero offset {}, comb {}/{}, lane trim {:#06x}",
                    ch.index, ch.zero_offset, ch.comb_diff_top, ch.comb_diff_bom, ch.digi_fgain
                );
            }
            return Ok(());
        }
    }

    println!("Zero calibration did not finish after {} captures.", args.rounds);
    Ok(())
}
