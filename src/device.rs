//! Device instances and the per-family drivers behind them.
//!
//! A [`DslDevice`] owns the command link, the lifecycle status and every
//! tunable of one instrument. Keys shared by all models are handled here;
//! family specific keys and the hooks around a capture go through the
//! [`DeviceDriver`] picked from the profile at construction time.

use std::path::{Path, PathBuf};

use crate::acquisition::{
    arm, Acquisition, AcquisitionError, AcquisitionHandle, AcquisitionSummary, BufferPlan, CaptureOptions,
    MAX_TRANSFERS,
};
use crate::adc;
use crate::calibration::{
    load_calibration, persist, restore_defaults, CalibrationError, ZeroCalibration, ZeroProgress,
};
use crate::channel::{ChannelKind, Coupling};
use crate::command::{regs, CommandError, CommandLink, ProtocolGeneration};
use crate::config::{check_kind, AcquisitionSettings, ConfigError, ConfigKey, ConfigOutcome, ConfigValue};
use crate::dso_command::{DsoCommand, DsoError, ScopeFrontEnd, TriggerSlope, TriggerSource};
use crate::profile::{caps, ChannelMode, DeviceFamily, DeviceProfile, OperationMode};
use crate::session_bus::PacketSink;
use crate::setting_blob::{ArmParams, TestMode, SAMPLES_ALIGN};
use crate::status::StatusSnapshot;
use crate::trigger_config::{
    parse_symbols, Combinator, StageLogic, TriggerConfig, TriggerError, TriggerMode, TriggerSymbol,
};
use crate::usb_transport::{TransportError, UsbTransport};

pub use crate::channel::Channel;

/// Firmware major version the command set below is written for.
pub const FIRMWARE_MAJOR: u8 = 2;
/// FPGA image revision the setting blob layout belongs to.
pub const HDL_VERSION: u8 = 0x0D;

const DEFAULT_VTH: f64 = 1.0;
const MAX_VTH: f64 = 5.0;
/// Thresholds at or above this select the 5 V bitstream on boards without
/// an adjustable comparator.
const TH_5V0: f64 = 5.0;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Invalid value for {key}: {reason}", key = .key.as_str())]
    InvalidArgument { key: ConfigKey, reason: String },

    #[error("Cannot allocate {0}")]
    Allocation(String),

    #[error("Incompatible {what}: device has {found:#04x}, driver needs {expected:#04x}")]
    Incompatible {
        what: &'static str,
        found: u8,
        expected: u8,
    },

    #[error("Device is not open")]
    NotActive,

    #[error("Transfers of a previous acquisition are still pending")]
    AcquisitionRunning,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Dso(#[from] DsoError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl DeviceError {
    fn invalid(key: ConfigKey, reason: impl Into<String>) -> Self {
        DeviceError::InvalidArgument {
            key,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Initializing,
    Inactive,
    Active,
    Incompatible,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Initializing => "initializing",
            DeviceStatus::Inactive => "inactive",
            DeviceStatus::Active => "active",
            DeviceStatus::Incompatible => "incompatible",
        }
    }
}

/// Capture switches that end up in the setting blob.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureFlags {
    pub rle: bool,
    pub clock_external: bool,
    pub clock_falling: bool,
    pub filter_1t: bool,
    pub instant: bool,
    pub is_loop: bool,
    pub test_mode: TestMode,
    /// Input threshold in volts.
    pub vth: f64,
}

impl Default for CaptureFlags {
    fn default() -> Self {
        Self {
            rle: false,
            clock_external: false,
            clock_falling: false,
            filter_1t: false,
            instant: false,
            is_loop: false,
            test_mode: TestMode::None,
            vth: DEFAULT_VTH,
        }
    }
}

/// Everything about a device except its command link and driver.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub profile: &'static DeviceProfile,
    pub status: DeviceStatus,
    pub mode: OperationMode,
    /// Channels, channel mode, sample rate and sample limit. Used for the
    /// logic models as well; only the oscilloscope fields stay idle there.
    pub scope: ScopeFrontEnd,
    pub trigger: TriggerConfig,
    pub flags: CaptureFlags,
    pub handle: AcquisitionHandle,
}

impl DeviceState {
    fn new(profile: &'static DeviceProfile) -> Self {
        let channel_mode = profile.default_channel_mode.mode();
        let mut state = Self {
            profile,
            status: DeviceStatus::Initializing,
            mode: channel_mode.mode,
            scope: ScopeFrontEnd::new(profile, channel_mode),
            trigger: TriggerConfig::new(),
            flags: CaptureFlags::default(),
            handle: AcquisitionHandle::default(),
        };
        state.adjust_channels();
        state
    }

    pub fn channel_mode(&self) -> &'static ChannelMode {
        self.scope.channel_mode
    }

    pub fn channels(&self) -> &[Channel] {
        &self.scope.channels
    }

    pub fn enabled_channels(&self) -> usize {
        self.scope.enabled_channels()
    }

    /// Bit `n` set when channel `n` is enabled.
    pub fn channel_enable_mask(&self) -> u32 {
        self.scope
            .channels
            .iter()
            .filter(|c| c.enabled)
            .fold(0, |mask, c| mask | (1 << c.index))
    }

    /// Sample rates the current channel mode can run at.
    pub fn samplerates(&self) -> Vec<u64> {
        let cm = self.channel_mode();
        self.profile
            .samplerates
            .iter()
            .copied()
            .filter(|&r| r >= cm.min_samplerate && r <= cm.max_samplerate)
            .collect()
    }

    fn channel(&self, key: ConfigKey, index: u16) -> Result<&Channel, DeviceError> {
        self.scope
            .channels
            .get(usize::from(index))
            .ok_or_else(|| DeviceError::invalid(key, format!("no channel {index}")))
    }

    fn channel_mut(&mut self, key: ConfigKey, index: u16) -> Result<&mut Channel, DeviceError> {
        self.scope
            .channels
            .get_mut(usize::from(index))
            .ok_or_else(|| DeviceError::invalid(key, format!("no channel {index}")))
    }

    /// Grow or shrink the channel list to what the channel mode offers,
    /// keeping the settings of channels that survive.
    fn adjust_channels(&mut self) {
        let cm = self.channel_mode();
        let count = cm.valid;
        let kind = ChannelKind::for_mode(cm.mode);
        self.scope.channels.truncate(usize::from(count));
        for ch in &mut self.scope.channels {
            if ch.kind != kind {
                *ch = Channel::new(ch.index, cm, self.profile);
            }
        }
        for index in self.scope.channels.len() as u16..count {
            self.scope.channels.push(Channel::new(index, cm, self.profile));
        }
    }

    /// Pull the sample rate back into the range of the channel mode.
    fn clamp_samplerate(&mut self) {
        let rates = self.samplerates();
        let (Some(&min), Some(&max)) = (rates.first(), rates.last()) else {
            return;
        };
        let rate = &mut self.scope.settings.samplerate;
        *rate = (*rate).clamp(min, max);
    }

    fn set_channel_mode(&mut self, cm: &'static ChannelMode) {
        log::debug!("Channel mode: {}", cm.description);
        self.scope.channel_mode = cm;
        self.adjust_channels();
        self.clamp_samplerate();
    }

    fn arm_params(&self, software_trigger: bool) -> ArmParams<'_> {
        let cm = self.channel_mode();
        let limit = self.scope.settings.limit_samples;
        let samplerate = self.scope.settings.samplerate;
        let channel_enable = self.channel_enable_mask();
        ArmParams {
            mode: self.mode,
            channel_mode: cm,
            samplerate,
            half_samplerate: self.profile.half_samplerate,
            quarter_samplerate: self.profile.quarter_samplerate,
            limit_samples: limit,
            actual_samples: (limit + SAMPLES_ALIGN) & !SAMPLES_ALIGN,
            hw_depth: self.profile.hw_depth,
            channel_enable,
            fgain: self.scope.channels.first().map_or(0, |ch| ch.digi_fgain),
            stream: cm.stream,
            instant: self.flags.instant,
            clock_external: self.flags.clock_external,
            clock_falling: self.flags.clock_falling,
            rle: self.flags.rle,
            filter_1t: self.flags.filter_1t,
            is_loop: self.flags.is_loop,
            test_mode: self.flags.test_mode,
            bytes_per_ms: BufferPlan::bytes_per_ms(
                self.mode,
                samplerate,
                channel_enable.count_ones(),
                cm.hw_min_samplerate,
            ),
            adf4360: self.profile.has_feature(caps::ADF4360),
            trigger: &self.trigger,
            software_trigger,
        }
    }

    /// Switch between logic, oscilloscope and analog operation.
    fn switch_mode<T: UsbTransport>(
        &mut self,
        link: &mut CommandLink<T>,
        mode: OperationMode,
    ) -> Result<(), DeviceError> {
        let key = ConfigKey::DeviceMode;
        if !self.profile.supports_mode(mode) {
            return Err(DeviceError::invalid(key, format!("{} cannot run in {} mode", self.profile.model, mode.as_str())));
        }
        let stream = self.mode != OperationMode::Logic || self.channel_mode().stream;
        let id = self
            .profile
            .channel_mode_for(mode, stream)
            .or_else(|| self.profile.channel_mode_for(mode, !stream))
            .ok_or_else(|| DeviceError::invalid(key, format!("no {} channel mode", mode.as_str())))?;
        let cm = id.mode();

        log::info!("Switching {} to {} mode", self.profile.model, mode.as_str());
        self.mode = mode;
        match mode {
            OperationMode::Logic => {
                link.write_reg(regs::CTR0, regs::CTR0_SCOPE_CLR)?;
                self.set_channel_mode(cm);
            }
            OperationMode::Oscilloscope => {
                link.write_reg(regs::CTR0, regs::CTR0_SCOPE_SET)?;
                self.flags.test_mode = TestMode::None;
                self.flags.instant = false;
                let num = u64::from(cm.num.max(1));
                self.scope.settings.samplerate = cm.max_samplerate / num;
                self.scope.settings.limit_samples = self.profile.dso_depth / num;
                self.set_channel_mode(cm);
                self.scope.write(link, DsoCommand::Sync)?;
                self.scope.init(link)?;
            }
            OperationMode::Analog => {
                link.write_reg(regs::CTR0, regs::CTR0_SCOPE_SET)?;
                self.flags.test_mode = TestMode::None;
                self.flags.instant = true;
                self.scope.settings.samplerate = cm.max_samplerate;
                self.scope.settings.limit_samples = cm.max_samplerate;
                self.set_channel_mode(cm);
                self.scope.write(link, DsoCommand::Sync)?;
                self.scope.init(link)?;
            }
        }
        Ok(())
    }

    fn get_common(&self, key: ConfigKey) -> ConfigOutcome<ConfigValue> {
        let value = match key {
            ConfigKey::DeviceMode => self.mode.as_str().into(),
            ConfigKey::SampleRate => self.scope.settings.samplerate.into(),
            ConfigKey::LimitSamples => self.scope.settings.limit_samples.into(),
            ConfigKey::ChannelEnable { channel } => match self.scope.channels.get(usize::from(channel)) {
                Some(ch) => ch.enabled.into(),
                None => return ConfigOutcome::NotApplicable,
            },
            ConfigKey::TriggerEnable => self.trigger.enabled.into(),
            ConfigKey::TriggerPosition => self.trigger.position().into(),
            ConfigKey::DataLock => self.handle.is_data_locked().into(),
            ConfigKey::Model => self.profile.model.into(),
            ConfigKey::TotalChannels => (self.scope.channels.len() as u64).into(),
            _ => return ConfigOutcome::NotApplicable,
        };
        ConfigOutcome::Done(value)
    }

    fn set_common<T: UsbTransport>(
        &mut self,
        link: &mut CommandLink<T>,
        key: ConfigKey,
        value: &ConfigValue,
    ) -> Result<ConfigOutcome<()>, DeviceError> {
        match (key, value) {
            (ConfigKey::DeviceMode, ConfigValue::String(name)) => {
                let mode = OperationMode::from_name(name)
                    .ok_or_else(|| DeviceError::invalid(key, format!("unknown mode '{name}'")))?;
                self.switch_mode(link, mode)?;
            }
            (ConfigKey::SampleRate, ConfigValue::Integer(rate)) => {
                if !self.samplerates().contains(rate) {
                    return Err(DeviceError::invalid(key, format!("{rate} Hz is not offered in this channel mode")));
                }
                self.scope.settings.samplerate = *rate;
                if self.mode != OperationMode::Logic {
                    self.scope.write(link, DsoCommand::SampleRate)?;
                }
            }
            (ConfigKey::LimitSamples, ConfigValue::Integer(limit)) => {
                if self.mode == OperationMode::Oscilloscope {
                    let depth = self.profile.dso_depth / self.enabled_channels().max(1) as u64;
                    if *limit > depth {
                        return Err(DeviceError::invalid(key, format!("at most {depth} samples per channel")));
                    }
                }
                self.scope.settings.limit_samples = *limit;
            }
            (ConfigKey::ChannelEnable { channel }, ConfigValue::Boolean(enabled)) => {
                self.channel_mut(key, channel)?.enabled = *enabled;
                if self.mode != OperationMode::Logic {
                    let coupling = DsoCommand::Coupling(usize::from(channel));
                    self.scope.write(link, coupling)?;
                    if self.enabled_channels() != 0 {
                        self.scope.write(link, DsoCommand::SampleRate)?;
                    }
                }
            }
            (ConfigKey::TriggerEnable, ConfigValue::Boolean(enabled)) => self.trigger.enabled = *enabled,
            (ConfigKey::TriggerPosition, ConfigValue::Byte(pos)) => self.trigger.set_position(*pos)?,
            (ConfigKey::DataLock, ConfigValue::Boolean(locked)) => self.handle.set_data_lock(*locked),
            _ => return Ok(ConfigOutcome::NotApplicable),
        }
        log::debug!("{} set to {:?}", key.as_str(), value);
        Ok(ConfigOutcome::Done(()))
    }

    fn list_common(&self, key: ConfigKey) -> ConfigOutcome<Vec<ConfigValue>> {
        match key {
            ConfigKey::DeviceMode => ConfigOutcome::Done(
                [OperationMode::Logic, OperationMode::Oscilloscope, OperationMode::Analog]
                    .into_iter()
                    .filter(|m| self.profile.supports_mode(*m))
                    .map(|m| m.as_str().into())
                    .collect(),
            ),
            ConfigKey::SampleRate => ConfigOutcome::Done(self.samplerates().into_iter().map(Into::into).collect()),
            _ => ConfigOutcome::NotApplicable,
        }
    }
}

/// Family specific half of a device.
///
/// Each call gets the device state and the command link separately so a
/// driver can be invoked from inside a running capture, where the link is
/// borrowed by the pipeline.
pub trait DeviceDriver<T: UsbTransport> {
    fn family(&self) -> DeviceFamily;

    /// Bring the hardware into a known state after the FPGA is loaded.
    fn open(&mut self, state: &mut DeviceState, link: &mut CommandLink<T>, fpga_done: bool) -> Result<(), DeviceError>;

    fn get(&self, state: &DeviceState, key: ConfigKey) -> ConfigOutcome<ConfigValue>;

    fn set(
        &mut self,
        state: &mut DeviceState,
        link: &mut CommandLink<T>,
        key: ConfigKey,
        value: &ConfigValue,
    ) -> Result<ConfigOutcome<()>, DeviceError>;

    fn list(&self, state: &DeviceState, key: ConfigKey) -> ConfigOutcome<Vec<ConfigValue>>;

    /// Last writes before the setting blob goes out.
    fn prepare(&mut self, state: &mut DeviceState, link: &mut CommandLink<T>) -> Result<CaptureOptions, DeviceError>;

    /// Called with every valid status envelope of a running capture.
    fn on_status(
        &mut self,
        _state: &mut DeviceState,
        _link: &mut CommandLink<T>,
        _status: &StatusSnapshot,
    ) -> Result<(), AcquisitionError> {
        Ok(())
    }
}

fn symbols_text(symbols: impl DoubleEndedIterator<Item = TriggerSymbol>) -> String {
    symbols.rev().map(|s| s.as_char()).collect()
}

/// Driver of the DSLogic logic analyzers.
#[derive(Debug, Default)]
pub struct DsLogicDriver {
    resources: PathBuf,
}

impl DsLogicDriver {
    pub fn new(resources: &Path) -> Self {
        Self {
            resources: resources.to_path_buf(),
        }
    }

    fn write_vth<T: UsbTransport>(link: &mut CommandLink<T>, vth: f64) -> Result<(), CommandError> {
        let code = (vth / 3.3 * (1.5 / 2.5) * 255.0) as u8;
        log::debug!("Threshold {vth:.2} V -> VTH code {code}");
        link.write_reg(regs::VTH, code)
    }

    fn set_threshold<T: UsbTransport>(
        &self,
        state: &mut DeviceState,
        link: &mut CommandLink<T>,
        vth: f64,
    ) -> Result<(), DeviceError> {
        if !(0.0..=MAX_VTH).contains(&vth) {
            return Err(DeviceError::invalid(ConfigKey::Threshold, format!("{vth} V outside 0..{MAX_VTH} V")));
        }
        if state.profile.has_feature(caps::VTH) {
            Self::write_vth(link, vth)?;
        } else if (vth >= TH_5V0) != (state.flags.vth >= TH_5V0) {
            // Fixed-threshold boards carry one bitstream per input level.
            let bitstream = if vth >= TH_5V0 { state.profile.fpga_bit50 } else { state.profile.fpga_bit33 };
            link.configure_fpga_from_file(&self.resources.join(bitstream))?;
        }
        state.flags.vth = vth;
        Ok(())
    }

    fn set_operation_mode(state: &mut DeviceState, name: &str) -> Result<(), DeviceError> {
        let key = ConfigKey::OperationMode;
        let stream = match name {
            "stream" => true,
            "buffer" if state.profile.has_feature(caps::BUF) => false,
            "buffer" => return Err(DeviceError::invalid(key, "no sample buffer on this model")),
            _ => return Err(DeviceError::invalid(key, format!("unknown operation mode '{name}'"))),
        };
        let id = state
            .profile
            .channel_mode_for(OperationMode::Logic, stream)
            .ok_or_else(|| DeviceError::invalid(key, format!("no {name} channel mode")))?;
        state.flags.test_mode = TestMode::None;
        state.set_channel_mode(id.mode());
        Ok(())
    }

    fn logic_modes(state: &DeviceState) -> impl Iterator<Item = &'static ChannelMode> + '_ {
        let stream = state.channel_mode().stream;
        state
            .profile
            .channel_modes
            .iter()
            .map(|id| id.mode())
            .filter(move |cm| cm.mode == OperationMode::Logic && cm.stream == stream)
    }

    fn trigger_value(state: &DeviceState, stage: u8) -> Option<String> {
        let channels = state.scope.channels.len();
        match state.trigger.mode {
            TriggerMode::Simple => {
                Some(symbols_text((0..channels).filter_map(|p| state.trigger.channel_symbol(p))))
            }
            TriggerMode::Advanced | TriggerMode::Serial => {
                let entry = state.trigger.stage(usize::from(stage))?;
                let slot0 = symbols_text(entry.slot0[..channels].iter().copied());
                let slot1 = symbols_text(entry.slot1[..channels].iter().copied());
                Some(format!("{slot0}:{slot1}"))
            }
        }
    }

    /// Simple mode takes one symbol per channel; advanced stages take
    /// `slot0[:slot1]`, highest channel first.
    fn set_trigger_value(state: &mut DeviceState, stage: u8, text: &str) -> Result<(), DeviceError> {
        let channels = state.scope.channels.len();
        match state.trigger.mode {
            TriggerMode::Simple => {
                let symbols = parse_symbols(text, channels)?;
                for (j, symbol) in symbols.into_iter().enumerate() {
                    state.trigger.set_channel_symbol(channels - j - 1, symbol, TriggerSymbol::DontCare)?;
                }
            }
            TriggerMode::Advanced | TriggerMode::Serial => {
                let (slot0, slot1) = match text.split_once(':') {
                    Some((a, b)) => (a.to_string(), b.to_string()),
                    None => (text.to_string(), "X".repeat(channels)),
                };
                state.trigger.set_stage_value(usize::from(stage), channels, &slot0, &slot1)?;
            }
        }
        Ok(())
    }

    /// Byte layout: bit 0 AND, bit 1 contiguous, bits 2/3 invert slot 0/1.
    fn set_trigger_logic(state: &mut DeviceState, stage: u8, code: u8) -> Result<(), TriggerError> {
        let stage = usize::from(stage);
        let logic = StageLogic {
            combinator: if code & 0b01 != 0 { Combinator::And } else { Combinator::Or },
            contiguous: code & 0b10 != 0,
        };
        state.trigger.set_stage_logic(stage, logic)?;
        state.trigger.set_stage_inv(stage, code & 0b100 != 0, code & 0b1000 != 0)
    }

    fn trigger_logic(state: &DeviceState, stage: u8) -> Option<u8> {
        let entry = state.trigger.stage(usize::from(stage))?;
        Some(entry.logic.code() as u8 | (u8::from(entry.inv0) << 2) | (u8::from(entry.inv1) << 3))
    }
}

impl<T: UsbTransport> DeviceDriver<T> for DsLogicDriver {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::DsLogic
    }

    fn open(&mut self, state: &mut DeviceState, link: &mut CommandLink<T>, _fpga_done: bool) -> Result<(), DeviceError> {
        if state.profile.has_feature(caps::VTH) {
            Self::write_vth(link, state.flags.vth)?;
        }
        Ok(())
    }

    fn get(&self, state: &DeviceState, key: ConfigKey) -> ConfigOutcome<ConfigValue> {
        let value = match key {
            ConfigKey::OperationMode => ConfigValue::from(if state.channel_mode().stream { "stream" } else { "buffer" }),
            ConfigKey::ChannelMode => state.channel_mode().description.into(),
            ConfigKey::Rle => state.flags.rle.into(),
            ConfigKey::ClockExternal => state.flags.clock_external.into(),
            ConfigKey::ClockFalling => state.flags.clock_falling.into(),
            ConfigKey::Filter => state.flags.filter_1t.into(),
            ConfigKey::Threshold => state.flags.vth.into(),
            ConfigKey::TestMode => state.flags.test_mode.as_str().into(),
            ConfigKey::TriggerMode => state.trigger.mode.as_str().into(),
            ConfigKey::TriggerStages => ((state.trigger.stages() + 1) as u8).into(),
            ConfigKey::TriggerValue { stage } => match Self::trigger_value(state, stage) {
                Some(text) => ConfigValue::String(text),
                None => return ConfigOutcome::NotApplicable,
            },
            ConfigKey::TriggerLogic { stage } => match Self::trigger_logic(state, stage) {
                Some(code) => code.into(),
                None => return ConfigOutcome::NotApplicable,
            },
            ConfigKey::TriggerCount { stage } => match state.trigger.stage(usize::from(stage)) {
                Some(entry) => ((u64::from(entry.count1) << 32) | u64::from(entry.count0)).into(),
                None => return ConfigOutcome::NotApplicable,
            },
            _ => return ConfigOutcome::NotApplicable,
        };
        ConfigOutcome::Done(value)
    }

    fn set(
        &mut self,
        state: &mut DeviceState,
        link: &mut CommandLink<T>,
        key: ConfigKey,
        value: &ConfigValue,
    ) -> Result<ConfigOutcome<()>, DeviceError> {
        if state.mode != OperationMode::Logic {
            return Ok(ConfigOutcome::NotApplicable);
        }
        match (key, value) {
            (ConfigKey::OperationMode, ConfigValue::String(name)) => Self::set_operation_mode(state, name)?,
            (ConfigKey::ChannelMode, ConfigValue::String(name)) => {
                let cm = Self::logic_modes(state)
                    .find(|cm| cm.description == name)
                    .ok_or_else(|| DeviceError::invalid(key, format!("unknown channel mode '{name}'")))?;
                state.set_channel_mode(cm);
            }
            (ConfigKey::Rle, ConfigValue::Boolean(on)) => state.flags.rle = *on,
            (ConfigKey::ClockExternal, ConfigValue::Boolean(on)) => state.flags.clock_external = *on,
            (ConfigKey::ClockFalling, ConfigValue::Boolean(on)) => state.flags.clock_falling = *on,
            (ConfigKey::Filter, ConfigValue::Boolean(on)) => state.flags.filter_1t = *on,
            (ConfigKey::Threshold, ConfigValue::Double(vth)) => self.set_threshold(state, link, *vth)?,
            (ConfigKey::TestMode, ConfigValue::String(name)) => {
                state.flags.test_mode = TestMode::from_name(name)
                    .ok_or_else(|| DeviceError::invalid(key, format!("unknown test mode '{name}'")))?;
            }
            (ConfigKey::TriggerMode, ConfigValue::String(name)) => {
                state.trigger.mode = TriggerMode::from_name(name)
                    .ok_or_else(|| DeviceError::invalid(key, format!("unknown trigger mode '{name}'")))?;
            }
            (ConfigKey::TriggerStages, ConfigValue::Byte(count)) => {
                if *count == 0 {
                    return Err(DeviceError::invalid(key, "at least one stage"));
                }
                state.trigger.set_stages(u16::from(*count - 1))?;
            }
            (ConfigKey::TriggerValue { stage }, ConfigValue::String(text)) => {
                Self::set_trigger_value(state, stage, text)?;
            }
            (ConfigKey::TriggerLogic { stage }, ConfigValue::Byte(code)) => {
                Self::set_trigger_logic(state, stage, *code)?;
            }
            (ConfigKey::TriggerCount { stage }, ConfigValue::Integer(count)) => {
                state
                    .trigger
                    .set_stage_count(usize::from(stage), *count as u32, (*count >> 32) as u32)?;
            }
            _ => return Ok(ConfigOutcome::NotApplicable),
        }
        log::debug!("{} set to {:?}", key.as_str(), value);
        Ok(ConfigOutcome::Done(()))
    }

    fn list(&self, state: &DeviceState, key: ConfigKey) -> ConfigOutcome<Vec<ConfigValue>> {
        match key {
            ConfigKey::OperationMode => {
                let mut modes = vec![ConfigValue::from("stream")];
                if state.profile.has_feature(caps::BUF) {
                    modes.insert(0, "buffer".into());
                }
                ConfigOutcome::Done(modes)
            }
            ConfigKey::ChannelMode => {
                ConfigOutcome::Done(Self::logic_modes(state).map(|cm| cm.description.into()).collect())
            }
            ConfigKey::TestMode => ConfigOutcome::Done(TestMode::ALL.iter().map(|m| m.as_str().into()).collect()),
            ConfigKey::TriggerMode => ConfigOutcome::Done(
                [TriggerMode::Simple, TriggerMode::Advanced, TriggerMode::Serial]
                    .iter()
                    .map(|m| m.as_str().into())
                    .collect(),
            ),
            _ => ConfigOutcome::NotApplicable,
        }
    }

    fn prepare(&mut self, state: &mut DeviceState, _link: &mut CommandLink<T>) -> Result<CaptureOptions, DeviceError> {
        // Streaming captures match the trigger on the host.
        let software_stages = if state.channel_mode().stream {
            state.trigger.software_stages()
        } else {
            Vec::new()
        };
        Ok(CaptureOptions {
            zeroing: false,
            software_stages,
        })
    }
}

/// Driver of the DSCope oscilloscopes.
#[derive(Debug, Default)]
pub struct DsCopeDriver {
    zero: ZeroCalibration,
    zero_requested: bool,
}

impl DsCopeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn zero(&self) -> &ZeroCalibration {
        &self.zero
    }

    fn write<T: UsbTransport>(
        state: &DeviceState,
        link: &mut CommandLink<T>,
        cmd: DsoCommand,
    ) -> Result<(), DsoError> {
        if state.mode == OperationMode::Oscilloscope || matches!(cmd, DsoCommand::VoltsPerDiv(_) | DsoCommand::Coupling(_)) {
            state.scope.write(link, cmd)?;
        }
        Ok(())
    }
}

impl<T: UsbTransport> DeviceDriver<T> for DsCopeDriver {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::DsCope
    }

    fn open(&mut self, state: &mut DeviceState, link: &mut CommandLink<T>, fpga_done: bool) -> Result<(), DeviceError> {
        if !load_calibration(link, &mut state.scope, fpga_done)? {
            log::info!("{} has no stored zero calibration, scheduling one", state.profile.model);
            self.zero_requested = true;
        }
        if !fpga_done {
            state.scope.init(link)?;
        }
        Ok(())
    }

    fn get(&self, state: &DeviceState, key: ConfigKey) -> ConfigOutcome<ConfigValue> {
        let settings = &state.scope.settings;
        let channel = |index: u16| state.scope.channels.get(usize::from(index));
        let value = match key {
            ConfigKey::Coupling { channel: i } => match channel(i) {
                Some(ch) => ch.coupling.as_str().into(),
                None => return ConfigOutcome::NotApplicable,
            },
            ConfigKey::VoltsPerDiv { channel: i } => match channel(i) {
                Some(ch) => ch.vdiv.into(),
                None => return ConfigOutcome::NotApplicable,
            },
            ConfigKey::VerticalPosition { channel: i } => match channel(i) {
                Some(ch) => u64::from(ch.offset).into(),
                None => return ConfigOutcome::NotApplicable,
            },
            ConfigKey::TriggerLevel { channel: i } => match channel(i) {
                Some(ch) => ch.trig_value.into(),
                None => return ConfigOutcome::NotApplicable,
            },
            ConfigKey::TriggerSlope => settings.slope.as_str().into(),
            ConfigKey::TriggerSource => settings.source.as_str().into(),
            ConfigKey::TriggerHoldoff => settings.holdoff.into(),
            ConfigKey::TriggerMargin => settings.margin.into(),
            ConfigKey::HorizontalTriggerPos => settings.horiz_percent.into(),
            ConfigKey::Instant => state.flags.instant.into(),
            ConfigKey::Calibrate => (self.zero_requested || self.zero.is_active()).into(),
            ConfigKey::ZeroCombFgain => self.zero.awaiting_comb().into(),
            ConfigKey::ZeroComb => self.zero.comb_ready().into(),
            _ => return ConfigOutcome::NotApplicable,
        };
        ConfigOutcome::Done(value)
    }

    fn set(
        &mut self,
        state: &mut DeviceState,
        link: &mut CommandLink<T>,
        key: ConfigKey,
        value: &ConfigValue,
    ) -> Result<ConfigOutcome<()>, DeviceError> {
        if state.mode == OperationMode::Logic {
            return Ok(ConfigOutcome::NotApplicable);
        }
        match (key, value) {
            (ConfigKey::Coupling { channel }, ConfigValue::String(name)) => {
                let coupling = match Coupling::from_name(name) {
                    // The front end has no ground switch.
                    Some(Coupling::Ground) => Coupling::Dc,
                    Some(c) => c,
                    None => return Err(DeviceError::invalid(key, format!("unknown coupling '{name}'"))),
                };
                state.channel_mut(key, channel)?.coupling = coupling;
                Self::write(state, link, DsoCommand::Coupling(usize::from(channel)))?;
            }
            (ConfigKey::VoltsPerDiv { channel }, ConfigValue::Integer(vdiv)) => {
                if !state.profile.vdivs.contains(vdiv) {
                    return Err(DeviceError::invalid(key, format!("{vdiv} mV/div is not a supported step")));
                }
                state.channel_mut(key, channel)?.vdiv = *vdiv;
                Self::write(state, link, DsoCommand::VoltsPerDiv(usize::from(channel)))?;
            }
            (ConfigKey::VerticalPosition { channel }, ConfigValue::Integer(offset)) => {
                let ch = state.channel_mut(key, channel)?;
                if *offset > u64::from(ch.offset_max()) {
                    return Err(DeviceError::invalid(key, format!("offset code above {}", ch.offset_max())));
                }
                ch.offset = *offset as u16;
            }
            (ConfigKey::TriggerLevel { channel }, ConfigValue::Byte(level)) => {
                state.channel_mut(key, channel)?.trig_value = *level;
                Self::write(state, link, DsoCommand::TriggerValue)?;
            }
            (ConfigKey::TriggerSlope, ConfigValue::String(name)) => {
                state.scope.settings.slope = TriggerSlope::from_name(name)
                    .ok_or_else(|| DeviceError::invalid(key, format!("unknown slope '{name}'")))?;
                Self::write(state, link, DsoCommand::TriggerSlope)?;
            }
            (ConfigKey::TriggerSource, ConfigValue::String(name)) => {
                state.scope.settings.source = TriggerSource::from_name(name)
                    .ok_or_else(|| DeviceError::invalid(key, format!("unknown source '{name}'")))?;
                Self::write(state, link, DsoCommand::TriggerSource)?;
            }
            (ConfigKey::TriggerHoldoff, ConfigValue::Integer(holdoff)) => {
                state.scope.settings.holdoff = *holdoff;
                Self::write(state, link, DsoCommand::TriggerHoldoff)?;
            }
            (ConfigKey::TriggerMargin, ConfigValue::Byte(margin)) => {
                state.scope.settings.margin = *margin;
                Self::write(state, link, DsoCommand::TriggerMargin)?;
            }
            (ConfigKey::HorizontalTriggerPos, ConfigValue::Byte(percent)) => {
                if *percent > 100 {
                    return Err(DeviceError::invalid(key, format!("{percent}% out of range")));
                }
                state.scope.settings.horiz_percent = *percent;
                Self::write(state, link, DsoCommand::HorizontalPosition)?;
            }
            (ConfigKey::Instant, ConfigValue::Boolean(instant)) => {
                state.flags.instant = *instant;
                let enabled = state.enabled_channels() as u64;
                if state.mode == OperationMode::Oscilloscope && enabled != 0 {
                    let bits = u64::from(state.channel_mode().unit_bits.max(1));
                    state.scope.settings.limit_samples = if *instant {
                        state.profile.hw_depth / bits / enabled
                    } else {
                        state.profile.dso_depth / enabled
                    };
                }
            }
            (ConfigKey::Calibrate, ConfigValue::Boolean(on)) => {
                self.zero_requested = *on;
                log::info!("Zero calibration {}", if *on { "requested" } else { "cancelled" });
            }
            (ConfigKey::ZeroSet, ConfigValue::Boolean(save)) => {
                if *save {
                    persist(link, &state.scope)?;
                    log::info!("Zero calibration of {} saved", state.profile.model);
                }
            }
            (ConfigKey::ZeroLoad, ConfigValue::Boolean(load)) => {
                if *load && !load_calibration(link, &mut state.scope, false)? {
                    log::info!("{} has no stored zero calibration, scheduling one", state.profile.model);
                    self.zero_requested = true;
                }
            }
            (ConfigKey::ZeroDefault, ConfigValue::Boolean(reset)) => {
                if *reset {
                    restore_defaults(&mut state.scope);
                    log::info!("Factory calibration of {} restored", state.profile.model);
                }
            }
            (ConfigKey::ZeroComb, ConfigValue::Boolean(ready)) => self.zero.set_comb_ready(*ready),
            _ => return Ok(ConfigOutcome::NotApplicable),
        }
        log::debug!("{} set to {:?}", key.as_str(), value);
        Ok(ConfigOutcome::Done(()))
    }

    fn list(&self, state: &DeviceState, key: ConfigKey) -> ConfigOutcome<Vec<ConfigValue>> {
        match key {
            ConfigKey::VoltsPerDiv { .. } => {
                ConfigOutcome::Done(state.profile.vdivs.iter().map(|&v| v.into()).collect())
            }
            ConfigKey::Coupling { .. } => {
                ConfigOutcome::Done([Coupling::Dc, Coupling::Ac].iter().map(|c| c.as_str().into()).collect())
            }
            ConfigKey::TriggerSource => {
                ConfigOutcome::Done(TriggerSource::ALL.iter().map(|s| s.as_str().into()).collect())
            }
            ConfigKey::TriggerSlope => ConfigOutcome::Done(
                [TriggerSlope::Rising, TriggerSlope::Falling]
                    .iter()
                    .map(|s| s.as_str().into())
                    .collect(),
            ),
            _ => ConfigOutcome::NotApplicable,
        }
    }

    fn prepare(&mut self, state: &mut DeviceState, link: &mut CommandLink<T>) -> Result<CaptureOptions, DeviceError> {
        if self.zero_requested && !self.zero.is_active() && state.mode == OperationMode::Oscilloscope {
            self.zero.start(&mut state.scope);
            state.scope.init(link)?;
        }
        if state.profile.has_feature(caps::HMCAD1511) && state.mode == OperationMode::Oscilloscope {
            adc::configure(link, &state.scope.channels)?;
        }

        state.scope.write(link, DsoCommand::HorizontalPosition)?;
        for i in 0..state.scope.channels.len() {
            state.scope.write(link, DsoCommand::VoltsPerDiv(i))?;
            state.scope.write(link, DsoCommand::Offset(i))?;
            let ch = &mut state.scope.channels[i];
            ch.hw_offset = ch.offset as u8;
        }
        Ok(CaptureOptions {
            zeroing: self.zero.is_active(),
            software_stages: Vec::new(),
        })
    }

    fn on_status(
        &mut self,
        state: &mut DeviceState,
        link: &mut CommandLink<T>,
        status: &StatusSnapshot,
    ) -> Result<(), AcquisitionError> {
        if !self.zero.is_active() {
            return Ok(());
        }
        if self.zero.advance(link, &mut state.scope, status)? == ZeroProgress::Finished {
            self.zero_requested = false;
            state.handle.stop();
        } else if self.zero.awaiting_comb() {
            // the host restarts the capture on one channel
            state.handle.stop();
        }
        Ok(())
    }
}

/// One opened (or openable) instrument.
pub struct DslDevice<T: UsbTransport> {
    link: CommandLink<T>,
    state: DeviceState,
    driver: Box<dyn DeviceDriver<T>>,
    resources: PathBuf,
}

impl<T: UsbTransport + 'static> DslDevice<T> {
    pub fn new(transport: T, profile: &'static DeviceProfile) -> Self {
        Self::with_resources(transport, profile, Path::new("."))
    }

    /// `resources` is where firmware and bitstream files are looked up.
    pub fn with_resources(transport: T, profile: &'static DeviceProfile, resources: &Path) -> Self {
        let generation = if profile.uses_legacy_protocol() {
            ProtocolGeneration::Legacy
        } else {
            ProtocolGeneration::Structured
        };
        let driver: Box<dyn DeviceDriver<T>> = match profile.family {
            DeviceFamily::DsLogic => Box::new(DsLogicDriver::new(resources)),
            DeviceFamily::DsCope => Box::new(DsCopeDriver::new()),
        };
        Self {
            link: CommandLink::new(transport, generation),
            state: DeviceState::new(profile),
            driver,
            resources: resources.to_path_buf(),
        }
    }

    pub fn profile(&self) -> &'static DeviceProfile {
        self.state.profile
    }

    pub fn status(&self) -> DeviceStatus {
        self.state.status
    }

    pub fn mode(&self) -> OperationMode {
        self.state.mode
    }

    pub fn family(&self) -> DeviceFamily {
        self.driver.family()
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn channels(&self) -> &[Channel] {
        self.state.channels()
    }

    pub fn trigger(&self) -> &TriggerConfig {
        &self.state.trigger
    }

    /// Replace the trigger used by the next acquisition.
    pub fn set_trigger(&mut self, trigger: TriggerConfig) {
        self.state.trigger = trigger;
    }

    /// Handle shared with every acquisition of this device.
    pub fn handle(&self) -> AcquisitionHandle {
        self.state.handle.clone()
    }

    pub fn link(&self) -> &CommandLink<T> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut CommandLink<T> {
        &mut self.link
    }

    /// Check versions, load the FPGA if needed and hand over to the driver.
    pub fn open(&mut self) -> Result<(), DeviceError> {
        let result = self.try_open();
        match &result {
            Ok(()) => {
                self.state.status = DeviceStatus::Active;
                log::info!("Opened {} in {} mode", self.state.profile.model, self.state.mode.as_str());
            }
            Err(DeviceError::Incompatible { .. }) => self.state.status = DeviceStatus::Incompatible,
            Err(err) => {
                log::error!("Opening {} failed: {err}", self.state.profile.model);
                self.state.status = DeviceStatus::Inactive;
            }
        }
        result
    }

    fn try_open(&mut self) -> Result<(), DeviceError> {
        let (major, minor) = self.link.fw_version()?;
        log::debug!("{} firmware {major}.{minor}", self.state.profile.model);
        if major != FIRMWARE_MAJOR {
            log::error!("Firmware {major}.{minor} is not supported");
            return Err(DeviceError::Incompatible {
                what: "firmware",
                found: major,
                expected: FIRMWARE_MAJOR,
            });
        }

        let fpga_done = self.link.fpga_done()?;
        if fpga_done {
            self.link.write_reg(regs::CTR0, 0)?;
            let hdl = self.link.hdl_version()?;
            if hdl != HDL_VERSION {
                log::error!("HDL version {hdl:#04x} is not supported");
                return Err(DeviceError::Incompatible {
                    what: "HDL",
                    found: hdl,
                    expected: HDL_VERSION,
                });
            }
        } else {
            let bitstream = self.resources.join(self.state.profile.fpga_bit33);
            self.link.configure_fpga_from_file(&bitstream)?;
        }

        self.driver.open(&mut self.state, &mut self.link, fpga_done)
    }

    pub fn close(&mut self) {
        self.state.handle.stop();
        self.link.transport_mut().cancel_all();
        self.state.status = DeviceStatus::Inactive;
        log::info!("Closed {}", self.state.profile.model);
    }

    pub fn get(&self, key: ConfigKey) -> ConfigOutcome<ConfigValue> {
        match self.state.get_common(key) {
            ConfigOutcome::NotApplicable => self.driver.get(&self.state, key),
            found => found,
        }
    }

    pub fn set(&mut self, key: ConfigKey, value: ConfigValue) -> Result<ConfigOutcome<()>, DeviceError> {
        check_kind(key, &value)?;
        if self.state.status != DeviceStatus::Active {
            return Err(DeviceError::NotActive);
        }
        match self.state.set_common(&mut self.link, key, &value)? {
            ConfigOutcome::NotApplicable => self.driver.set(&mut self.state, &mut self.link, key, &value),
            done => Ok(done),
        }
    }

    pub fn list(&self, key: ConfigKey) -> ConfigOutcome<Vec<ConfigValue>> {
        match self.state.list_common(key) {
            ConfigOutcome::NotApplicable => self.driver.list(&self.state, key),
            found => found,
        }
    }

    /// Apply loaded settings in order. Keys that do not apply to this model
    /// are skipped.
    pub fn apply(&mut self, settings: &AcquisitionSettings) -> Result<(), DeviceError> {
        for (key, value) in settings.entries() {
            if let ConfigOutcome::NotApplicable = self.set(key, value)? {
                log::warn!("{} does not apply to {}", key.as_str(), self.state.profile.model);
            }
        }
        Ok(())
    }

    /// Arm the hardware and run one capture to completion, publishing
    /// packets on `sink`. Blocks the calling thread; [`Self::handle`] stops
    /// it from elsewhere.
    pub fn acquire(&mut self, sink: &mut dyn PacketSink) -> Result<AcquisitionSummary, DeviceError> {
        if self.state.status != DeviceStatus::Active {
            return Err(DeviceError::NotActive);
        }
        if self.link.transport().pending() != 0 {
            return Err(DeviceError::AcquisitionRunning);
        }
        self.state.handle.rearm();

        let options = self.driver.prepare(&mut self.state, &mut self.link)?;
        let Self { link, state, driver, .. } = self;

        let params = state.arm_params(options.uses_software_trigger());
        let plan = BufferPlan::new(&params, state.profile.dso_depth, link.transport().is_super_speed());
        if plan.transfer_count == 0 || plan.transfer_count > MAX_TRANSFERS {
            return Err(DeviceError::Allocation(format!("{} transfers", plan.transfer_count)));
        }
        arm(link, &params, state.profile)?;

        let mut acquisition = Acquisition::new(link, &params, plan, options).with_handle(state.handle.clone());
        Ok(acquisition.run_with(sink, |link, status| driver.on_status(state, link, status))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::TRIG_CHECK_ID;
    use crate::mock_transport::MockTransport;
    use crate::profile::{find_profile, DSL_VID};
    use crate::session_bus::{Packet, PacketKind, PacketRecorder};
    use crate::setting_blob::HardwareSetting;
    use crate::status::tests::envelope;
    use crate::status::DSO_PACKET_ID;
    use crate::usb_transport::TransferStatus;

    fn device(pid: u16) -> DslDevice<MockTransport> {
        let profile = find_profile(DSL_VID, pid, false).unwrap();
        let mut transport = MockTransport::new(profile.uses_legacy_protocol());
        transport.status_bytes[usize::from(regs::HDL_VERSION)] = HDL_VERSION;
        DslDevice::new(transport, profile)
    }

    fn opened(pid: u16) -> DslDevice<MockTransport> {
        let mut dev = device(pid);
        dev.open().unwrap();
        dev
    }

    fn header() -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        buf[0..4].copy_from_slice(&TRIG_CHECK_ID.to_le_bytes());
        buf[4..8].copy_from_slice(&100u32.to_le_bytes());
        buf
    }

    #[test]
    fn test_open_checks_versions() {
        let mut dev = device(0x0003);
        assert_eq!(dev.status(), DeviceStatus::Initializing);
        dev.open().unwrap();
        assert_eq!(dev.status(), DeviceStatus::Active);
        // VTH register programmed for the default 1.0 V threshold
        assert!(dev.link().transport().registers.contains(&(regs::VTH, 46)));

        let mut dev = device(0x0003);
        dev.link_mut().transport_mut().fw_version = (1, 9);
        let err = dev.open().unwrap_err();
        assert!(matches!(err, DeviceError::Incompatible { what: "firmware", found: 1, .. }));
        assert_eq!(dev.status(), DeviceStatus::Incompatible);

        let mut dev = device(0x0003);
        dev.link_mut().transport_mut().status_bytes[usize::from(regs::HDL_VERSION)] = 0x0C;
        assert!(matches!(dev.open(), Err(DeviceError::Incompatible { what: "HDL", .. })));
    }

    #[test]
    fn test_open_io_failure_leaves_inactive() {
        let mut dev = device(0x0003);
        dev.link_mut().transport_mut().fail_control = true;
        assert!(dev.open().is_err());
        assert_eq!(dev.status(), DeviceStatus::Inactive);
    }

    #[test]
    fn test_set_requires_open_device() {
        let mut dev = device(0x0003);
        let err = dev.set(ConfigKey::SampleRate, 1_000_000u64.into()).unwrap_err();
        assert!(matches!(err, DeviceError::NotActive));
        // type errors are reported before the state check
        let err = dev.set(ConfigKey::SampleRate, true.into()).unwrap_err();
        assert!(matches!(err, DeviceError::Config(ConfigError::TypeMismatch { .. })));
    }

    #[test]
    fn test_logic_config_round_trip() {
        let mut dev = opened(0x0003);
        assert_eq!(dev.get(ConfigKey::DeviceMode).done(), Some("logic".into()));
        assert_eq!(dev.get(ConfigKey::Model).done(), Some("DSLogic Pro".into()));

        dev.set(ConfigKey::SampleRate, 1_000_000u64.into()).unwrap();
        assert_eq!(dev.get(ConfigKey::SampleRate).done(), Some(1_000_000u64.into()));
        let err = dev.set(ConfigKey::SampleRate, 1_234_567u64.into()).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArgument { key: ConfigKey::SampleRate, .. }));

        dev.set(ConfigKey::Rle, true.into()).unwrap();
        assert_eq!(dev.get(ConfigKey::Rle).done(), Some(true.into()));

        dev.set(ConfigKey::OperationMode, "buffer".into()).unwrap();
        assert_eq!(dev.get(ConfigKey::OperationMode).done(), Some("buffer".into()));
        assert!(!dev.state().channel_mode().stream);
    }

    #[test]
    fn test_not_applicable_keys() {
        let mut dev = opened(0x0003);
        let outcome = dev.set(ConfigKey::VoltsPerDiv { channel: 0 }, 100u64.into()).unwrap();
        assert_eq!(outcome, ConfigOutcome::NotApplicable);
        assert_eq!(dev.get(ConfigKey::TriggerSlope), ConfigOutcome::NotApplicable);
        assert_eq!(dev.list(ConfigKey::Coupling { channel: 0 }), ConfigOutcome::NotApplicable);

        let err = dev.set(ConfigKey::DeviceMode, "dso".into()).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArgument { .. }));
    }

    #[test]
    fn test_simple_trigger_from_symbols() {
        let mut dev = opened(0x0003);
        let text = "XXXXXXXXXXXXXXXR";
        dev.set(ConfigKey::TriggerValue { stage: 0 }, text.into()).unwrap();
        dev.set(ConfigKey::TriggerEnable, true.into()).unwrap();
        assert_eq!(dev.trigger().channel_symbol(0), Some(TriggerSymbol::Rising));
        assert_eq!(dev.get(ConfigKey::TriggerValue { stage: 0 }).done(), Some(text.into()));

        let err = dev.set(ConfigKey::TriggerValue { stage: 0 }, "XR".into()).unwrap_err();
        assert!(matches!(err, DeviceError::Trigger(TriggerError::WrongLength { .. })));
    }

    #[test]
    fn test_advanced_trigger_stage() {
        let mut dev = opened(0x0003);
        dev.set(ConfigKey::TriggerMode, "advanced".into()).unwrap();
        dev.set(ConfigKey::TriggerStages, 2u8.into()).unwrap();
        dev.set(ConfigKey::TriggerValue { stage: 1 }, "XXXXXXXXXXXXXXX1:XXXXXXXXXXXXXX0X".into())
            .unwrap();
        dev.set(ConfigKey::TriggerLogic { stage: 1 }, 0b0110u8.into()).unwrap();
        dev.set(ConfigKey::TriggerCount { stage: 1 }, ((3u64 << 32) | 7).into()).unwrap();

        assert_eq!(dev.trigger().stages(), 1);
        let stage = dev.trigger().stage(1).unwrap();
        assert_eq!(stage.slot0[0], TriggerSymbol::High);
        assert_eq!(stage.slot1[1], TriggerSymbol::Low);
        assert_eq!(stage.logic.combinator, Combinator::Or);
        assert!(stage.logic.contiguous && stage.inv0 && !stage.inv1);
        assert_eq!((stage.count0, stage.count1), (7, 3));
        assert_eq!(dev.get(ConfigKey::TriggerLogic { stage: 1 }).done(), Some(0b0110u8.into()));
        assert_eq!(dev.get(ConfigKey::TriggerStages).done(), Some(2u8.into()));
    }

    #[test]
    fn test_channel_mode_list_and_select() {
        let mut dev = opened(0x0003);
        let ConfigOutcome::Done(modes) = dev.list(ConfigKey::ChannelMode) else {
            unreachable!("logic device lists channel modes");
        };
        assert!(modes.len() > 1);
        let last = modes.last().and_then(ConfigValue::as_str).unwrap().to_string();
        dev.set(ConfigKey::ChannelMode, last.as_str().into()).unwrap();
        assert_eq!(dev.state().channel_mode().description, last);
        assert_eq!(dev.channels().len(), usize::from(dev.state().channel_mode().valid));
    }

    #[test]
    fn test_logic_stream_acquire() {
        let mut dev = opened(0x0003);
        dev.set(ConfigKey::SampleRate, 1_000_000u64.into()).unwrap();
        dev.set(ConfigKey::LimitSamples, 20_480u64.into()).unwrap();
        for channel in 8..16 {
            dev.set(ConfigKey::ChannelEnable { channel }, false.into()).unwrap();
        }

        let transport = dev.link_mut().transport_mut();
        transport.push_completion(TransferStatus::Completed, header());
        transport.push_completion(TransferStatus::Completed, vec![0x5A; 20480]);

        let mut recorder = PacketRecorder::new();
        let summary = dev.acquire(&mut recorder).unwrap();
        assert_eq!(summary.bytes, 20480);
        assert_eq!(recorder.logic_bytes().len(), 20480);
        assert_eq!(recorder.count(PacketKind::End), 1);

        assert_eq!(dev.link().transport().bulk_writes.len(), 1);
    }

    #[test]
    fn test_stop_before_acquire_is_cleared() {
        let mut dev = opened(0x0003);
        dev.set(ConfigKey::SampleRate, 1_000_000u64.into()).unwrap();
        dev.set(ConfigKey::LimitSamples, 20_480u64.into()).unwrap();
        for channel in 8..16 {
            dev.set(ConfigKey::ChannelEnable { channel }, false.into()).unwrap();
        }
        dev.handle().stop();

        let transport = dev.link_mut().transport_mut();
        transport.push_completion(TransferStatus::Completed, header());
        transport.push_completion(TransferStatus::Completed, vec![0; 20480]);
        let mut recorder = PacketRecorder::new();
        dev.acquire(&mut recorder).unwrap();
        assert_eq!(recorder.logic_bytes().len(), 20480);
    }

    #[test]
    fn test_scope_open_schedules_zero_without_records() {
        let dev = opened(0x0002);
        assert_eq!(dev.family(), DeviceFamily::DsCope);
        assert_eq!(dev.mode(), OperationMode::Oscilloscope);
        assert_eq!(dev.get(ConfigKey::Calibrate).done(), Some(true.into()));
    }

    #[test]
    fn test_scope_settings_write_commands() {
        let mut dev = opened(0x0002);
        dev.set(ConfigKey::Calibrate, false.into()).unwrap();
        let before = dev.link().transport().dso_words.len();

        dev.set(ConfigKey::VoltsPerDiv { channel: 1 }, 500u64.into()).unwrap();
        dev.set(ConfigKey::Coupling { channel: 0 }, "GND".into()).unwrap();
        dev.set(ConfigKey::TriggerSource, "ch1".into()).unwrap();
        assert_eq!(dev.link().transport().dso_words.len(), before + 3);
        assert_eq!(dev.get(ConfigKey::Coupling { channel: 0 }).done(), Some("DC".into()));
        assert_eq!(dev.get(ConfigKey::TriggerSource).done(), Some("ch1".into()));

        let err = dev.set(ConfigKey::VoltsPerDiv { channel: 1 }, 3u64.into()).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArgument { .. }));
        let err = dev.set(ConfigKey::VoltsPerDiv { channel: 5 }, 500u64.into()).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArgument { .. }));
    }

    #[test]
    fn test_scope_instant_limit() {
        let mut dev = opened(0x0002);
        dev.set(ConfigKey::Instant, true.into()).unwrap();
        let profile = dev.profile();
        assert_eq!(
            dev.get(ConfigKey::LimitSamples).done(),
            Some((profile.hw_depth / 8 / 2).into())
        );
        dev.set(ConfigKey::Instant, false.into()).unwrap();
        assert_eq!(dev.get(ConfigKey::LimitSamples).done(), Some((profile.dso_depth / 2).into()));
    }

    #[test]
    fn test_scope_mode_switch() {
        let mut dev = opened(0x0002);
        dev.set(ConfigKey::DeviceMode, "analog".into()).unwrap();
        assert_eq!(dev.mode(), OperationMode::Analog);
        assert!(dev.state().channel_mode().stream);
        assert_eq!(dev.get(ConfigKey::SampleRate).done(), Some(10_000_000u64.into()));
        let mock = dev.link().transport();
        assert_eq!(mock.registers.last(), Some(&(regs::CTR0, regs::CTR0_SCOPE_SET)));
        assert!(dev.link().transport().dso_words.contains(&crate::dso_command::SYNC_WORD));
    }

    #[test]
    fn test_scope_zero_runs_inside_capture() {
        let mut dev = opened(0x0002);
        dev.set(ConfigKey::LimitSamples, 1024u64.into()).unwrap();

        let mut frame: Vec<u8> = vec![0x80; 2048];
        frame.extend(envelope(DSO_PACKET_ID, 500, 1, [(140, 116, 128 * 1024), (140, 116, 128 * 1024)]));
        frame.resize(frame.len().max(2560), 0);
        let transport = dev.link_mut().transport_mut();
        transport.push_completion(TransferStatus::Completed, header());
        transport.push_completion(TransferStatus::Completed, frame);

        let handle = dev.handle();
        let mut recorder = PacketRecorder::new();
        let mut sink = |packet: &Packet<'_>| {
            if packet.kind() == PacketKind::Dso {
                handle.stop();
            }
            recorder.send(packet);
        };
        dev.acquire(&mut sink).unwrap();

        assert!(dev.state().scope.settings.zero);
        assert_eq!(dev.get(ConfigKey::Calibrate).done(), Some(true.into()));
        assert_eq!(recorder.count(PacketKind::Dso), 1);
        assert_eq!(recorder.count(PacketKind::End), 1);
        assert!(dev.link().transport().nvm.is_empty());
    }

    #[test]
    fn test_zero_keys_save_load_and_reset() {
        let mut dev = opened(0x0002);
        dev.set(ConfigKey::Calibrate, false.into()).unwrap();
        let defaults = dev.state().scope.channels.clone();
        dev.set(ConfigKey::ZeroSet, false.into()).unwrap();
        assert!(dev.link().transport().nvm.is_empty());

        let profile = dev.profile();
        let mut tuned = ScopeFrontEnd::new(profile, profile.default_channel_mode.mode());
        tuned.channels[1].vpos_trans += 12;
        tuned.channels[0].vga[2].preoff += 5;
        persist(dev.link_mut(), &tuned).unwrap();

        dev.set(ConfigKey::ZeroLoad, true.into()).unwrap();
        assert_eq!(dev.get(ConfigKey::Calibrate).done(), Some(false.into()));
        let channels = &dev.state().scope.channels;
        assert_eq!(channels[1].vpos_trans, tuned.channels[1].vpos_trans);
        assert_eq!(channels[0].vga[2].preoff, tuned.channels[0].vga[2].preoff);

        dev.set(ConfigKey::ZeroDefault, true.into()).unwrap();
        assert_eq!(dev.state().scope.channels, defaults);
        // the stored records are untouched until saved
        let stored = dev.link().transport().nvm.clone();
        dev.set(ConfigKey::ZeroLoad, true.into()).unwrap();
        assert_eq!(dev.state().scope.channels[1].vpos_trans, tuned.channels[1].vpos_trans);

        dev.set(ConfigKey::ZeroDefault, true.into()).unwrap();
        dev.set(ConfigKey::ZeroSet, true.into()).unwrap();
        assert_ne!(dev.link().transport().nvm, stored);
        assert!(dev.link().transport().registers.contains(&(regs::CTR0, regs::CTR0_EEWP)));
        dev.set(ConfigKey::ZeroLoad, true.into()).unwrap();
        assert_eq!(dev.state().scope.channels, defaults);
    }

    #[test]
    fn test_zero_load_schedules_run_on_blank_nvm() {
        let mut dev = opened(0x0002);
        dev.set(ConfigKey::Calibrate, false.into()).unwrap();
        dev.set(ConfigKey::ZeroLoad, true.into()).unwrap();
        assert_eq!(dev.get(ConfigKey::Calibrate).done(), Some(true.into()));
        assert!(dev.link().transport().nvm.is_empty());
    }

    #[test]
    fn test_zero_comb_keys() {
        let mut dev = opened(0x0028);
        assert_eq!(dev.get(ConfigKey::ZeroCombFgain).done(), Some(false.into()));
        assert_eq!(dev.get(ConfigKey::ZeroComb).done(), Some(false.into()));
        dev.set(ConfigKey::ZeroComb, true.into()).unwrap();
        assert_eq!(dev.get(ConfigKey::ZeroComb).done(), Some(true.into()));
        assert!(dev.set(ConfigKey::ZeroCombFgain, true.into()).is_err());
    }

    #[test]
    fn test_hmcad_capture_loads_lane_trims() {
        let mut dev = opened(0x0028);
        dev.set(ConfigKey::Calibrate, false.into()).unwrap();
        let profile = dev.profile();
        let mut tuned = ScopeFrontEnd::new(profile, profile.default_channel_mode.mode());
        tuned.channels[0].digi_fgain = 0x0300;
        tuned.channels[0].cali_fgain = [1.0 + 2.0 / 8192.0; 4];
        persist(dev.link_mut(), &tuned).unwrap();
        dev.set(ConfigKey::ZeroLoad, true.into()).unwrap();

        dev.link_mut().transport_mut().push_completion(TransferStatus::Stall, Vec::new());
        let before = dev.link().transport().registers.len();
        let mut recorder = PacketRecorder::new();
        let _ = dev.acquire(&mut recorder);
        assert_eq!(recorder.count(PacketKind::End), 1);

        let mock = dev.link().transport();
        let writes = &mock.registers[before..];
        let adc: Vec<u8> = writes.iter().filter(|(r, _)| *r == regs::ADCC).map(|(_, v)| *v).collect();
        assert!(adc.windows(4).any(|w| w == [0x00, 2, 2, 0x34]));
        assert!(writes.contains(&(regs::ADCC + 3, 0x00)));
        assert!(writes.contains(&(regs::ADCC + 4, 0x03)));
        let blob = HardwareSetting::decode(&mock.bulk_writes[0].1).unwrap();
        assert_eq!(blob.fgain, 0x0300);
    }

    #[test]
    fn test_acquire_requires_active() {
        let mut dev = device(0x0003);
        let mut recorder = PacketRecorder::new();
        assert!(matches!(dev.acquire(&mut recorder), Err(DeviceError::NotActive)));
    }

    #[test]
    fn test_apply_settings() {
        let mut dev = opened(0x0003);
        let settings = AcquisitionSettings::from_toml_str(
            r#"
            samplerate = 2000000
            limit_samples = 4096
            instant = true

            [trigger]
            enabled = true
            position = 20
            simple = "XXXXXXXXXXXXXX1X"
            "#,
        )
        .unwrap();
        dev.apply(&settings).unwrap();
        assert_eq!(dev.get(ConfigKey::SampleRate).done(), Some(2_000_000u64.into()));
        assert_eq!(dev.trigger().position(), 20);
        assert!(dev.trigger().enabled);
        assert_eq!(dev.trigger().channel_symbol(1), Some(TriggerSymbol::High));
    }
}
