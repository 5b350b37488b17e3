//! # DSLogic RS
//!
//! Acquisition engine for DreamSourceLab DSLogic logic analyzers and DSCope
//! oscilloscopes.
//!
//! The crate speaks both generations of the USB command protocol, compiles
//! trigger configurations into the FPGA setting blob, schedules the bulk IN
//! transfers of a capture and publishes the result as session packets.
//! DSCope front ends get their zero calibration run inside a normal capture.
//!
//! ## Features
//!
//! - **Device discovery**: `nusb` enumeration filtered by the built-in profile table
//! - **Command protocol**: legacy opcodes and the structured `{dest, offset, size}` protocol
//! - **Triggers**: simple, advanced and serial hardware triggers, plus a software matcher for streaming captures
//! - **Transfer scheduling**: buffer sizing, header validation and resubmission of bulk transfers
//! - **Zero calibration**: offset and gain calibration driven by status envelopes, persisted to NVM
//! - **DataFrame output**: logic and oscilloscope packets convert to `polars` frames
//! - **Configuration**: typed key/value map and TOML acquisition settings
//! - **Session archives**: version 2 header text and per-channel data chunks
//!
//! ## Examples
//!
//! ### Streaming logic capture
//!
//! ```rust,no_run
//! use dslogic_rs::{ConfigKey, DslConnector, PacketRecorder};
//! use std::path::Path;
//!
//! let mut device = DslConnector::connect(Some("DSLogic Pro"), None, Path::new("res"))?;
//! device.set(ConfigKey::SampleRate, 1_000_000u64.into())?;
//! device.set(ConfigKey::LimitSamples, 1_000_000u64.into())?;
//!
//! let mut recorder = PacketRecorder::new();
//! let summary = device.acquire(&mut recorder)?;
//! println!("Captured {} bytes", summary.bytes);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Trigger
//!
//! ```rust
//! use dslogic_rs::TriggerConfig;
//!
//! let trigger = TriggerConfig::simple()
//!     .rising(0)?
//!     .high(3)?
//!     .at_position(10)?;
//! assert!(trigger.enabled);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Loading settings
//!
//! ```rust
//! use dslogic_rs::AcquisitionSettings;
//!
//! let settings = AcquisitionSettings::from_toml_str("samplerate = 2000000\nlimit_samples = 4096\n")?;
//! assert_eq!(settings.samplerate, Some(2_000_000));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod acquisition;
pub mod adc;
pub mod calibration;
pub mod channel;
pub mod command;
pub mod config;
pub mod connector;
pub mod device;
pub mod dso_command;
pub mod profile;
pub mod session_archive;
pub mod session_bus;
pub mod setting_blob;
pub mod soft_trigger;
pub mod status;
pub mod trigger_config;
pub mod usb_transport;

#[cfg(test)]
pub(crate) mod mock_transport;

// Re-export the main types for convenience
pub use acquisition::{Acquisition, AcquisitionError, AcquisitionHandle, AcquisitionSummary, BufferPlan};

pub use calibration::{CalibrationError, ZeroCalibration};

pub use channel::{Channel, Coupling};

pub use config::{AcquisitionSettings, ConfigError, ConfigKey, ConfigOutcome, ConfigValue};

pub use connector::{ConnectorError, DslConnector, DslDeviceInfo};

pub use device::{DeviceDriver, DeviceError, DeviceStatus, DsCopeDriver, DsLogicDriver, DslDevice};

pub use profile::{find_profile, DeviceFamily, DeviceProfile, OperationMode};

pub use session_archive::{ArchiveError, SessionArchive, SessionHeader};

pub use session_bus::{DsoFrame, LogicFrame, Packet, PacketKind, PacketRecorder, PacketSink, SessionBus};

pub use trigger_config::{TriggerConfig, TriggerError, TriggerMode, TriggerSymbol};

pub use usb_transport::{NusbTransport, TransportError, UsbTransport};
