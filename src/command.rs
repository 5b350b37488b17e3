use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::usb_transport::{TransportError, UsbTransport, BULK_TIMEOUT, CONTROL_TIMEOUT};

/// Which control protocol a board's firmware speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolGeneration {
    /// One vendor request per operation.
    Legacy,
    /// Every request carries a `{dest, offset, size}` header.
    Structured,
}

/// Destination selector of the structured protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CtlDest {
    FwVersion = 0,
    RevidVersion,
    HwStatus,
    ProgB,
    Sys,
    Led,
    Intrdy,
    Wordwide,
    Start,
    Stop,
    BulkWr,
    Reg,
    Nvm,
    I2cDso,
    I2cReg,
    I2cStatus,
    DsoEn0,
    DsoDc0,
    DsoAtt0,
    DsoEn1,
    DsoDc1,
    DsoAtt1,
    AwgWr,
    I2cFrontEnd,
    I2cExt,
}

impl CtlDest {
    pub fn as_str(&self) -> &'static str {
        match self {
            CtlDest::FwVersion => "fw version",
            CtlDest::RevidVersion => "revid",
            CtlDest::HwStatus => "hw status",
            CtlDest::ProgB => "prog_b",
            CtlDest::Sys => "sys",
            CtlDest::Led => "led",
            CtlDest::Intrdy => "intrdy",
            CtlDest::Wordwide => "wordwide",
            CtlDest::Start => "start",
            CtlDest::Stop => "stop",
            CtlDest::BulkWr => "bulk write",
            CtlDest::Reg => "reg",
            CtlDest::Nvm => "nvm",
            CtlDest::I2cDso => "dso",
            CtlDest::I2cReg => "register",
            CtlDest::I2cStatus => "status",
            CtlDest::DsoEn0 => "dso en0",
            CtlDest::DsoDc0 => "dso dc0",
            CtlDest::DsoAtt0 => "dso att0",
            CtlDest::DsoEn1 => "dso en1",
            CtlDest::DsoDc1 => "dso dc1",
            CtlDest::DsoAtt1 => "dso att1",
            CtlDest::AwgWr => "awg",
            CtlDest::I2cFrontEnd => "front end",
            CtlDest::I2cExt => "ext",
        }
    }
}

/// Bits of the `HW_STATUS` byte.
pub mod status_bits {
    pub const GPIF_DONE: u8 = 1 << 7;
    pub const FPGA_DONE: u8 = 1 << 6;
    pub const FPGA_INIT_B: u8 = 1 << 5;
    pub const SYS_OVERFLOW: u8 = 1 << 4;
    pub const SYS_CLR: u8 = 1 << 3;
    pub const SYS_EN: u8 = 1 << 2;
    pub const LED_RED: u8 = 1 << 1;
    pub const LED_GREEN: u8 = 1 << 0;
}

pub const WR_PROG_B: u8 = 1 << 2;
pub const WR_INTRDY: u8 = 1 << 7;
pub const WR_WORDWIDE: u8 = 1 << 0;
pub const CH_CH0: u8 = 1 << 7;
pub const CH_CH1: u8 = 1 << 5;

/// FPGA register map reachable through the register destinations.
pub mod regs {
    pub const VTH: u8 = 0x78;
    pub const SEC_DATA: u8 = 0x75;
    pub const SEC_CTRL: u8 = 0x73;
    pub const CTR1: u8 = 0x71;
    pub const CTR0: u8 = 0x70;
    pub const COMB: u8 = 0x68;
    pub const EI2C: u8 = 0x60;
    pub const ADCC: u8 = 0x48;
    pub const HW_STATUS: u8 = 0x05;
    pub const HDL_VERSION: u8 = 0x04;

    pub const CTR0_EEWP: u8 = 1 << 0;
    pub const CTR0_FORCE_RDY: u8 = 1 << 1;
    pub const CTR0_FORCE_STOP: u8 = 1 << 2;
    pub const CTR0_SCOPE_SET: u8 = 1 << 3;
    pub const CTR0_SCOPE_CLR: u8 = 1 << 4;
    pub const CTR0_BW20M_SET: u8 = 1 << 5;
    pub const CTR0_BW20M_CLR: u8 = 1 << 6;
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("USB transport error during {op}: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("{op}: requested {requested} bytes but {actual} were transferred")]
    LengthMismatch {
        op: &'static str,
        requested: usize,
        actual: usize,
    },

    #[error("{op} is not available on {generation:?} firmware")]
    Unsupported {
        op: &'static str,
        generation: ProtocolGeneration,
    },

    #[error("Timed out waiting for hardware status bits {mask:#04x}")]
    StatusTimeout { mask: u8 },

    #[error("Failed to read FPGA bitstream: {0}")]
    Bitstream(#[from] std::io::Error),
}

/// Vendor command channel to one device.
///
/// Every call is a single attempt with the fixed control/bulk timeouts;
/// failures are logged and returned, never retried here.
pub struct CommandLink<T: UsbTransport> {
    transport: T,
    generation: ProtocolGeneration,
}

impl<T: UsbTransport> CommandLink<T> {
    const CTL_WR: u8 = 0xb0;
    const CTL_RD_PRE: u8 = 0xb1;
    const CTL_RD: u8 = 0xb2;

    const LEGACY_GET_FW_VERSION: u8 = 0xb0;
    const LEGACY_GET_REVID: u8 = 0xb1;
    const LEGACY_START: u8 = 0xb2;
    const LEGACY_CONFIG: u8 = 0xb3;
    const LEGACY_SETTING: u8 = 0xb4;
    const LEGACY_STATUS: u8 = 0xb6;
    const LEGACY_STATUS_INFO: u8 = 0xb7;
    const LEGACY_WR_REG: u8 = 0xb8;
    const LEGACY_WR_NVM: u8 = 0xb9;
    const LEGACY_RD_NVM: u8 = 0xba;
    const LEGACY_RD_NVM_PRE: u8 = 0xbb;
    const LEGACY_FPGA_DONE: u8 = 0xbc;

    const LEGACY_FLAG_WIDE: u8 = 1 << 5;
    const LEGACY_FLAG_STOP: u8 = 1 << 7;

    pub const SETTING_ENDPOINT: u8 = 0x02;
    const FPGA_CHUNK: usize = 4096;
    const MAX_PAYLOAD: usize = 60;
    const LEGACY_NVM_CHUNK: usize = 32;
    const READ_SETTLE: Duration = Duration::from_millis(10);
    const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(1);
    const STATUS_POLL_LIMIT: usize = 1000;

    pub fn new(transport: T, generation: ProtocolGeneration) -> Self {
        Self {
            transport,
            generation,
        }
    }

    pub fn generation(&self) -> ProtocolGeneration {
        self.generation
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn unsupported(&self, op: &'static str) -> CommandError {
        CommandError::Unsupported {
            op,
            generation: self.generation,
        }
    }

    fn vendor_out(&mut self, op: &'static str, request: u8, data: &[u8]) -> Result<(), CommandError> {
        let sent = self
            .transport
            .control_out(request, 0, 0, data, CONTROL_TIMEOUT)
            .map_err(|source| {
                log::error!("Unable to send {op} command ({request:#04x}): {source}");
                CommandError::Transport { op, source }
            })?;
        if sent != data.len() {
            log::error!("{op}: sent {sent} of {} bytes", data.len());
            return Err(CommandError::LengthMismatch {
                op,
                requested: data.len(),
                actual: sent,
            });
        }
        Ok(())
    }

    fn vendor_in(&mut self, op: &'static str, request: u8, len: usize) -> Result<Vec<u8>, CommandError> {
        let mut buf = vec![0u8; len];
        let got = self
            .transport
            .control_in(request, 0, 0, &mut buf, CONTROL_TIMEOUT)
            .map_err(|source| {
                log::error!("Unable to receive {op} ({request:#04x}): {source}");
                CommandError::Transport { op, source }
            })?;
        if got != len {
            log::error!("{op}: received {got} of {len} bytes");
            return Err(CommandError::LengthMismatch {
                op,
                requested: len,
                actual: got,
            });
        }
        Ok(buf)
    }

    fn ctl_header(dest: CtlDest, offset: u16, size: u8) -> [u8; 4] {
        let offset = offset.to_le_bytes();
        [dest as u8, offset[0], offset[1], size]
    }

    /// Structured write: header plus up to 60 payload bytes.
    fn ctl_write(&mut self, dest: CtlDest, offset: u16, data: &[u8]) -> Result<(), CommandError> {
        debug_assert!(data.len() <= Self::MAX_PAYLOAD);
        let mut packet = Vec::with_capacity(4 + data.len());
        packet.extend_from_slice(&Self::ctl_header(dest, offset, data.len() as u8));
        packet.extend_from_slice(data);
        log::trace!("ctl write {} offset {offset:#x} {data:02x?}", dest.as_str());
        self.vendor_out(dest.as_str(), Self::CTL_WR, &packet)
    }

    /// Structured read: header, a settle delay, then the data phase.
    fn ctl_read(&mut self, dest: CtlDest, offset: u16, size: usize) -> Result<Vec<u8>, CommandError> {
        debug_assert!(size <= Self::MAX_PAYLOAD);
        let header = Self::ctl_header(dest, offset, size as u8);
        self.vendor_out(dest.as_str(), Self::CTL_RD_PRE, &header)?;
        thread::sleep(Self::READ_SETTLE);
        self.vendor_in(dest.as_str(), Self::CTL_RD, size)
    }

    fn ctl_write_byte(&mut self, dest: CtlDest, value: u8) -> Result<(), CommandError> {
        self.ctl_write(dest, 0, &[value])
    }

    fn bulk_write(&mut self, op: &'static str, data: &[u8]) -> Result<(), CommandError> {
        let sent = self
            .transport
            .bulk_out(Self::SETTING_ENDPOINT, data, BULK_TIMEOUT)
            .map_err(|source| {
                log::error!("Bulk write for {op} failed: {source}");
                CommandError::Transport { op, source }
            })?;
        if sent != data.len() {
            log::error!("{op}: bulk wrote {sent} of {} bytes", data.len());
            return Err(CommandError::LengthMismatch {
                op,
                requested: data.len(),
                actual: sent,
            });
        }
        Ok(())
    }

    fn len24(len: usize) -> [u8; 3] {
        let bytes = (len as u32).to_le_bytes();
        [bytes[0], bytes[1], bytes[2]]
    }

    pub fn fw_version(&mut self) -> Result<(u8, u8), CommandError> {
        let bytes = match self.generation {
            ProtocolGeneration::Legacy => {
                self.vendor_in("fw version", Self::LEGACY_GET_FW_VERSION, 2)?
            }
            ProtocolGeneration::Structured => self.ctl_read(CtlDest::FwVersion, 0, 2)?,
        };
        Ok((bytes[0], bytes[1]))
    }

    pub fn revid(&mut self) -> Result<u8, CommandError> {
        let bytes = match self.generation {
            ProtocolGeneration::Legacy => self.vendor_in("revid", Self::LEGACY_GET_REVID, 1)?,
            ProtocolGeneration::Structured => self.ctl_read(CtlDest::RevidVersion, 0, 1)?,
        };
        Ok(bytes[0])
    }

    /// Kick off sampling. `wide` selects 16-bit samples on legacy boards.
    pub fn start(&mut self, wide: bool) -> Result<(), CommandError> {
        log::debug!("Starting acquisition (wide: {wide})");
        match self.generation {
            ProtocolGeneration::Legacy => {
                let flags = if wide { Self::LEGACY_FLAG_WIDE } else { 0 };
                self.vendor_out("start", Self::LEGACY_START, &[flags, 0, 0])
            }
            ProtocolGeneration::Structured => self.ctl_write(CtlDest::Start, 0, &[]),
        }
    }

    pub fn stop(&mut self) -> Result<(), CommandError> {
        log::debug!("Stopping acquisition");
        match self.generation {
            ProtocolGeneration::Legacy => {
                self.vendor_out("stop", Self::LEGACY_START, &[Self::LEGACY_FLAG_STOP, 0, 0])
            }
            ProtocolGeneration::Structured => self.ctl_write(CtlDest::Stop, 0, &[]),
        }
    }

    pub fn hw_status(&mut self) -> Result<u8, CommandError> {
        match self.generation {
            ProtocolGeneration::Legacy => Err(self.unsupported("hw status")),
            ProtocolGeneration::Structured => Ok(self.ctl_read(CtlDest::HwStatus, 0, 1)?[0]),
        }
    }

    /// Poll `HW_STATUS` until every bit of `mask` is set.
    pub fn wait_hw_status(&mut self, mask: u8) -> Result<(), CommandError> {
        for _ in 0..Self::STATUS_POLL_LIMIT {
            if self.hw_status()? & mask == mask {
                return Ok(());
            }
            thread::sleep(Self::STATUS_POLL_INTERVAL);
        }
        log::error!("Hardware status never reported {mask:#04x}");
        Err(CommandError::StatusTimeout { mask })
    }

    pub fn fpga_done(&mut self) -> Result<bool, CommandError> {
        match self.generation {
            ProtocolGeneration::Legacy => {
                Ok(self.vendor_in("fpga done", Self::LEGACY_FPGA_DONE, 1)?[0] != 0)
            }
            ProtocolGeneration::Structured => {
                Ok(self.hw_status()? & status_bits::FPGA_DONE != 0)
            }
        }
    }

    /// Upload an FPGA bitstream in fixed-size bulk chunks.
    pub fn configure_fpga(&mut self, bitstream: &[u8]) -> Result<(), CommandError> {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::Client::running()
            .map(|c| c.span(tracy_client::span_location!("configure_fpga"), 0));

        log::info!("Configuring FPGA with {} byte bitstream", bitstream.len());
        let length = Self::len24(bitstream.len());
        match self.generation {
            ProtocolGeneration::Legacy => {
                self.vendor_out("fpga config", Self::LEGACY_CONFIG, &length)?;
            }
            ProtocolGeneration::Structured => {
                self.ctl_write_byte(CtlDest::ProgB, !WR_PROG_B)?;
                self.ctl_write_byte(
                    CtlDest::Led,
                    !(status_bits::LED_GREEN | status_bits::LED_RED),
                )?;
                self.ctl_write_byte(CtlDest::ProgB, WR_PROG_B)?;
                self.wait_hw_status(status_bits::FPGA_INIT_B)?;
                self.ctl_write_byte(CtlDest::Intrdy, !WR_INTRDY)?;
                self.ctl_write(CtlDest::BulkWr, 0, &length)?;
            }
        }

        for (index, chunk) in bitstream.chunks(Self::FPGA_CHUNK).enumerate() {
            log::trace!("FPGA chunk {index}: {} bytes", chunk.len());
            self.bulk_write("fpga upload", chunk)?;
        }

        if self.generation == ProtocolGeneration::Structured {
            self.ctl_write_byte(CtlDest::Intrdy, WR_INTRDY)?;
        }
        log::debug!("FPGA configuration done");
        Ok(())
    }

    pub fn configure_fpga_from_file(&mut self, path: &Path) -> Result<(), CommandError> {
        log::debug!("Loading FPGA bitstream from {}", path.display());
        let bitstream = std::fs::read(path)?;
        self.configure_fpga(&bitstream)
    }

    /// Announce how many 16-bit words the next setting write carries.
    pub fn send_setting_count(&mut self, words: usize) -> Result<(), CommandError> {
        let count = Self::len24(words);
        match self.generation {
            ProtocolGeneration::Legacy => self.vendor_out("setting", Self::LEGACY_SETTING, &count),
            ProtocolGeneration::Structured => self.ctl_write(CtlDest::BulkWr, 0, &count),
        }
    }

    pub fn write_setting(&mut self, blob: &[u8]) -> Result<(), CommandError> {
        self.bulk_write("setting", blob)
    }

    pub fn set_wordwide(&mut self) -> Result<(), CommandError> {
        self.ctl_write_byte(CtlDest::Wordwide, WR_WORDWIDE)
    }

    pub fn set_intrdy(&mut self, ready: bool) -> Result<(), CommandError> {
        self.ctl_write_byte(CtlDest::Intrdy, if ready { WR_INTRDY } else { !WR_INTRDY })
    }

    pub fn write_reg(&mut self, addr: u8, value: u8) -> Result<(), CommandError> {
        log::trace!("wr_reg {addr:#04x} = {value:#04x}");
        match self.generation {
            ProtocolGeneration::Legacy => {
                self.vendor_out("register", Self::LEGACY_WR_REG, &[addr, value])
            }
            ProtocolGeneration::Structured => {
                self.ctl_write(CtlDest::I2cReg, u16::from(addr), &[value])
            }
        }
    }

    pub fn read_reg(&mut self, addr: u8) -> Result<u8, CommandError> {
        match self.generation {
            ProtocolGeneration::Legacy => Err(self.unsupported("register read")),
            ProtocolGeneration::Structured => {
                Ok(self.ctl_read(CtlDest::I2cStatus, u16::from(addr), 1)?[0])
            }
        }
    }

    /// Read `[begin, end)` of the status block.
    pub fn read_status(&mut self, begin: u8, end: u8) -> Result<Vec<u8>, CommandError> {
        let len = usize::from(end.saturating_sub(begin));
        match self.generation {
            ProtocolGeneration::Legacy => {
                self.vendor_out("status info", Self::LEGACY_STATUS_INFO, &[begin, end])?;
                self.vendor_in("status", Self::LEGACY_STATUS, len)
            }
            ProtocolGeneration::Structured => {
                self.ctl_read(CtlDest::I2cStatus, u16::from(begin), len)
            }
        }
    }

    pub fn hdl_version(&mut self) -> Result<u8, CommandError> {
        let status = self.read_status(0, regs::HDL_VERSION + 1)?;
        Ok(status[usize::from(regs::HDL_VERSION)])
    }

    pub fn write_dso(&mut self, cmd: u64) -> Result<(), CommandError> {
        log::trace!("wr_dso {cmd:#018x}");
        match self.generation {
            ProtocolGeneration::Legacy => Err(self.unsupported("dso command")),
            ProtocolGeneration::Structured => self.ctl_write(CtlDest::I2cDso, 0, &cmd.to_le_bytes()),
        }
    }

    /// Gate one analog front-end channel.
    pub fn set_channel_enable(&mut self, index: usize, enable: bool) -> Result<(), CommandError> {
        let (dest, bit) = if index == 0 {
            (CtlDest::DsoEn0, CH_CH0)
        } else {
            (CtlDest::DsoEn1, CH_CH1)
        };
        self.ctl_write_byte(dest, if enable { bit } else { !bit })
    }

    pub fn read_nvm(&mut self, addr: u16, len: usize) -> Result<Vec<u8>, CommandError> {
        let mut out = Vec::with_capacity(len);
        let chunk = match self.generation {
            ProtocolGeneration::Legacy => Self::LEGACY_NVM_CHUNK,
            ProtocolGeneration::Structured => Self::MAX_PAYLOAD,
        };
        let mut addr = addr;
        let mut remaining = len;
        while remaining > 0 {
            let size = remaining.min(chunk);
            let part = match self.generation {
                ProtocolGeneration::Legacy => {
                    let a = addr.to_le_bytes();
                    self.vendor_out("nvm read", Self::LEGACY_RD_NVM_PRE, &[a[0], a[1], size as u8])?;
                    self.vendor_in("nvm read", Self::LEGACY_RD_NVM, size)?
                }
                ProtocolGeneration::Structured => self.ctl_read(CtlDest::Nvm, addr, size)?,
            };
            out.extend_from_slice(&part);
            addr = addr.wrapping_add(size as u16);
            remaining -= size;
        }
        Ok(out)
    }

    pub fn write_nvm(&mut self, addr: u16, data: &[u8]) -> Result<(), CommandError> {
        let chunk = match self.generation {
            ProtocolGeneration::Legacy => Self::LEGACY_NVM_CHUNK,
            ProtocolGeneration::Structured => Self::MAX_PAYLOAD,
        };
        let mut addr = addr;
        for part in data.chunks(chunk) {
            match self.generation {
                ProtocolGeneration::Legacy => {
                    let a = addr.to_le_bytes();
                    let mut packet = vec![a[0], a[1], part.len() as u8];
                    packet.extend_from_slice(part);
                    self.vendor_out("nvm write", Self::LEGACY_WR_NVM, &packet)?;
                }
                ProtocolGeneration::Structured => self.ctl_write(CtlDest::Nvm, addr, part)?,
            }
            addr = addr.wrapping_add(part.len() as u16);
        }
        Ok(())
    }
}
