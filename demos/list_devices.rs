// Device discovery example
//
// Lists every attached DSLogic/DSCope device and, with --open, opens each
// one and prints what it reports.

use clap::Parser;
use dslogic_rs::{ConfigKey, ConfigOutcome, DslConnector};
use std::path::PathBuf;

#[derive(Parser)]
#[command(about = "List attached DSLogic and DSCope devices")]
struct Args {
    /// Only list models starting with this name, e.g. "DSLogic"
    #[arg(long)]
    model: Option<String>,

    /// Open each device and print its configuration
    #[arg(long)]
    open: bool,

    /// Directory holding firmware and FPGA bitstreams
    #[arg(long, default_value = "res")]
    resources: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let devices = DslConnector::get_available_devices(args.model.as_deref())?;
    if devices.is_empty() {
        println!("No devices found. Please connect a DSLogic or DSCope and try again.");
        return Ok(());
    }

    println!("Found {} device(s):", devices.len());
    for (i, device) in devices.iter().enumerate() {
        println!("  {}. {} at {} (pid {:#06x})", i + 1, device.model, device.location(), device.pid);
    }

    if !args.open {
        return Ok(());
    }

    for device in &devices {
        println!("\n{} at {}:", device.model, device.location());
        let dev = match DslConnector::connect(Some(device.model), Some(&device.location()), &args.resources) {
            Ok(dev) => dev,
            Err(e) => {
                println!("  open failed: {e}");
                continue;
            }
        };
        for key in [
            ConfigKey::DeviceMode,
            ConfigKey::OperationMode,
            ConfigKey::ChannelMode,
            ConfigKey::SampleRate,
            ConfigKey::LimitSamples,
            ConfigKey::TotalChannels,
        ] {
            if let ConfigOutcome::Done(value) = dev.get(key) {
                println!("  {:<16} {:?}", key.as_str(), value);
            }
        }
        if let ConfigOutcome::Done(rates) = dev.list(ConfigKey::SampleRate) {
            println!("  {} sample rates offered", rates.len());
        }
    }

    Ok(())
}
