//! 64-bit front-end command words for the oscilloscope models, sent with
//! [`CommandLink::write_dso`].

use crate::channel::{Channel, Coupling};
use crate::command::{CommandError, CommandLink};
use crate::profile::{caps, ChannelMode, DeviceProfile, OperationMode};
use crate::usb_transport::UsbTransport;

/// Constant bias added to the coarse offset code on PREOFF devices.
const PREOFF_COARSE_BIAS: i64 = 160;
const TRANS_COARSE_MULTI: i64 = 10;
const TRANS_FINE_MULTI: f64 = 100.0;
/// Vertical divisions on screen.
const VERTICAL_DIVS: f64 = 10.0;
const CHANNEL_SHIFT: u32 = 7;
pub const SYNC_WORD: u64 = 0xa5a5_a500;

#[derive(Debug, thiserror::Error)]
pub enum DsoError {
    #[error("No oscilloscope channel {0}")]
    UnknownChannel(usize),

    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerSlope {
    #[default]
    Rising,
    Falling,
}

impl TriggerSlope {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSlope::Rising => "rising",
            TriggerSlope::Falling => "falling",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "rising" => Some(TriggerSlope::Rising),
            "falling" => Some(TriggerSlope::Falling),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerSource {
    #[default]
    Auto,
    Ch0,
    Ch1,
    Ch0And1,
    Ch0Or1,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Auto => "auto",
            TriggerSource::Ch0 => "ch0",
            TriggerSource::Ch1 => "ch1",
            TriggerSource::Ch0And1 => "ch0&ch1",
            TriggerSource::Ch0Or1 => "ch0|ch1",
        }
    }

    pub const ALL: [TriggerSource; 5] = [
        TriggerSource::Auto,
        TriggerSource::Ch0,
        TriggerSource::Ch1,
        TriggerSource::Ch0And1,
        TriggerSource::Ch0Or1,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TriggerSource::Auto),
            1 => Some(TriggerSource::Ch0),
            2 => Some(TriggerSource::Ch1),
            3 => Some(TriggerSource::Ch0And1),
            4 => Some(TriggerSource::Ch0Or1),
            _ => None,
        }
    }
}

/// Oscilloscope trigger and timebase state.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeSettings {
    pub samplerate: u64,
    pub limit_samples: u64,
    pub slope: TriggerSlope,
    pub source: TriggerSource,
    /// Channel the source nibble refers to when triggering on a single input.
    pub trigger_channel: u8,
    /// Horizontal trigger position, percent of the frame.
    pub horiz_percent: u8,
    pub holdoff: u64,
    pub margin: u8,
    /// Set while the zero procedure drives the front end.
    pub zero: bool,
}

impl Default for ScopeSettings {
    fn default() -> Self {
        Self {
            samplerate: 100_000_000,
            limit_samples: 1_000_000,
            slope: TriggerSlope::Rising,
            source: TriggerSource::Auto,
            trigger_channel: 0,
            horiz_percent: 0,
            holdoff: 0,
            margin: 8,
            zero: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsoCommand {
    Coupling(usize),
    VoltsPerDiv(usize),
    Offset(usize),
    SampleRate,
    HorizontalPosition,
    TriggerSlope,
    TriggerSource,
    TriggerValue,
    TriggerMargin,
    TriggerHoldoff,
    Sync,
}

impl DsoCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            DsoCommand::Coupling(_) => "coupling",
            DsoCommand::VoltsPerDiv(_) => "vdiv",
            DsoCommand::Offset(_) => "offset",
            DsoCommand::SampleRate => "samplerate",
            DsoCommand::HorizontalPosition => "horiz position",
            DsoCommand::TriggerSlope => "trigger slope",
            DsoCommand::TriggerSource => "trigger source",
            DsoCommand::TriggerValue => "trigger value",
            DsoCommand::TriggerMargin => "trigger margin",
            DsoCommand::TriggerHoldoff => "trigger holdoff",
            DsoCommand::Sync => "sync",
        }
    }
}

/// Commands that bring the front end into the configured state: per
/// channel coupling, vdiv and offset, then the timebase and trigger.
pub fn init_sequence(channels: usize) -> Vec<DsoCommand> {
    let mut seq = Vec::with_capacity(channels * 3 + 7);
    for i in 0..channels {
        seq.push(DsoCommand::Coupling(i));
        seq.push(DsoCommand::VoltsPerDiv(i));
        seq.push(DsoCommand::Offset(i));
    }
    seq.extend([
        DsoCommand::SampleRate,
        DsoCommand::HorizontalPosition,
        DsoCommand::TriggerHoldoff,
        DsoCommand::TriggerSlope,
        DsoCommand::TriggerSource,
        DsoCommand::TriggerValue,
        DsoCommand::TriggerMargin,
    ]);
    seq
}

/// Sample divider the hardware runs at, and echoes back in every status
/// envelope.
pub fn sample_divider(channel_mode: &ChannelMode, settings: &ScopeSettings, enabled: usize) -> u32 {
    if settings.zero {
        return 1;
    }
    let rate = settings.samplerate.max(1) as f64;
    let enabled = enabled.max(1) as f64;
    (channel_mode.max_samplerate as f64 / rate / enabled).ceil() as u32
}

pub struct DsoEncoder<'a> {
    profile: &'a DeviceProfile,
    channel_mode: &'a ChannelMode,
    channels: &'a [Channel],
    settings: &'a ScopeSettings,
}

impl<'a> DsoEncoder<'a> {
    pub fn new(
        profile: &'a DeviceProfile,
        channel_mode: &'a ChannelMode,
        channels: &'a [Channel],
        settings: &'a ScopeSettings,
    ) -> Self {
        Self {
            profile,
            channel_mode,
            channels,
            settings,
        }
    }

    pub fn enabled_channels(&self) -> usize {
        self.channels.iter().filter(|c| c.enabled).count()
    }

    fn channel(&self, index: usize) -> Result<&'a Channel, DsoError> {
        self.channels.get(index).ok_or(DsoError::UnknownChannel(index))
    }

    pub fn encode(&self, cmd: DsoCommand) -> Result<u64, DsoError> {
        let word = match cmd {
            DsoCommand::Coupling(i) => self.coupling(self.channel(i)?),
            DsoCommand::VoltsPerDiv(i) => self.vdiv(self.channel(i)?),
            DsoCommand::Offset(i) => {
                let ch = self.channel(i)?;
                0x10 + (u64::from(ch.index) << CHANNEL_SHIFT) + (self.offset(ch) << 8)
            }
            DsoCommand::SampleRate => {
                0x18 + (u64::from(sample_divider(self.channel_mode, self.settings, self.enabled_channels())) << 8)
            }
            DsoCommand::HorizontalPosition => 0x20 + (self.horiz_position() << 8),
            DsoCommand::TriggerSlope => {
                let slope = match self.settings.slope {
                    TriggerSlope::Rising => 0,
                    TriggerSlope::Falling => 1,
                };
                0x28 + (slope << 8)
            }
            DsoCommand::TriggerSource => {
                if self.settings.zero {
                    0x30
                } else {
                    0x30 + (u64::from(self.source_code()) << 8)
                }
            }
            DsoCommand::TriggerValue => {
                self.channels.iter().fold(0x38, |cmd, ch| {
                    cmd + (u64::from(ch.trig_value) << (8 * (u32::from(ch.index) + 1)))
                })
            }
            DsoCommand::TriggerMargin => 0x40 + (u64::from(self.settings.margin) << 8),
            DsoCommand::TriggerHoldoff => 0x58 + (self.settings.holdoff << 8),
            DsoCommand::Sync => SYNC_WORD,
        };
        Ok(word)
    }

    fn source_code(&self) -> u8 {
        let source = match self.settings.source {
            TriggerSource::Auto => 0,
            TriggerSource::Ch0 => 1,
            TriggerSource::Ch1 => 2,
            TriggerSource::Ch0And1 => 3,
            TriggerSource::Ch0Or1 => 4,
        };
        (self.settings.trigger_channel << 4) + (source & 0x0f)
    }

    /// Trigger position in samples across all enabled channels.
    pub fn horiz_position(&self) -> u64 {
        let pos = f64::from(self.settings.horiz_percent)
            * self.enabled_channels() as f64
            * self.settings.limit_samples as f64
            / 200.0;
        pos as u64
    }

    fn coupling(&self, ch: &Channel) -> u64 {
        let enabled = self.enabled_channels();
        let mut cmd: u64 = if self.channel_mode.mode == OperationMode::Analog || enabled == 2 {
            0x0E00
        } else if enabled == 1 {
            if (ch.index == 0) == ch.enabled {
                0x1600
            } else {
                0x1A00
            }
        } else {
            return 0;
        };

        cmd += u64::from(ch.index) << CHANNEL_SHIFT;
        if self.settings.zero || ch.coupling == Coupling::Dc {
            cmd += 0x100;
        } else if ch.coupling == Coupling::Ground {
            cmd &= !0x200;
        }
        cmd
    }

    fn vdiv(&self, ch: &Channel) -> u64 {
        let mut vgain = ch.vgain();
        if ch.comb_comp != 0 && self.enabled_channels() == 1 {
            vgain += u64::from(ch.comb_comp) << 8;
        }
        0x8 + (u64::from(ch.index) << CHANNEL_SHIFT) + vgain
    }

    /// Offset field: the raw offset code in the upper half, the analog
    /// front-end encoding of it in the lower half.
    pub fn offset(&self, ch: &Channel) -> u64 {
        let offset = if self.settings.zero { ch.zero_offset } else { ch.offset };
        let offset_mid = f64::from(ch.offset_mid());
        let offset_max = f64::from(ch.offset_max());
        let preoff = u64::from(ch.preoff());
        let raw = u64::from(offset) << 32;

        if self.profile.has_feature(caps::PREOFF) {
            let trans_coarse = i64::from(ch.vpos_trans >> 8);
            let trans_fine = f64::from(ch.vpos_trans & 0xff);
            let voltage = (offset_mid - f64::from(offset)) / offset_max * ch.vdiv as f64 * VERTICAL_DIVS;
            let (coarse, fine) = if trans_coarse == 0 || trans_fine == 0.0 {
                (0, 0)
            } else if ch.vdiv < 500 {
                let coarse = (-voltage * TRANS_COARSE_MULTI as f64 / trans_coarse as f64 + 0.5).floor() as i64;
                let fine = ((voltage + (coarse * trans_coarse / TRANS_COARSE_MULTI) as f64) * 1000.0 / trans_fine
                    + 0.5)
                    .floor() as i64;
                (coarse, fine)
            } else {
                let coarse = (-voltage / trans_coarse as f64 + 0.5).floor() as i64;
                let fine = ((voltage + (coarse * trans_coarse) as f64) * TRANS_FINE_MULTI / trans_fine + 0.5)
                    .floor() as i64;
                (coarse, fine)
            };
            let coarse_field = (coarse + PREOFF_COARSE_BIAS + (preoff >> 10) as i64) << 16;
            raw.wrapping_add((coarse_field + fine + (preoff & 0x03ff) as i64) as u64)
        } else {
            let comb_comp = if ch.comb_comp != 0 && self.enabled_channels() == 1 {
                let gain = 10f64.powf(24.0 * f64::from(ch.comb_comp) / 20.0 / 4096.0) - 1.0;
                let comb_off = if self.profile.has_feature(caps::HMCAD1511) { 0.57 } else { 2.0 } / gain;
                (f64::from(offset) - offset_mid) / comb_off
            } else {
                0.0
            };
            let pwm_off = ((f64::from(offset) + comb_comp) / offset_max * f64::from(ch.vpos_trans)).max(0.0) as u64;
            raw + pwm_off + preoff
        }
    }
}

/// Oscilloscope channels plus the timebase and trigger state they are
/// programmed with.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeFrontEnd {
    pub profile: &'static DeviceProfile,
    pub channel_mode: &'static ChannelMode,
    pub channels: Vec<Channel>,
    pub settings: ScopeSettings,
}

impl ScopeFrontEnd {
    pub fn new(profile: &'static DeviceProfile, channel_mode: &'static ChannelMode) -> Self {
        let channels = (0..profile.total_channels)
            .map(|i| Channel::new(i, channel_mode, profile))
            .collect();
        Self {
            profile,
            channel_mode,
            channels,
            settings: ScopeSettings {
                samplerate: profile.default_samplerate,
                limit_samples: profile.default_limit,
                ..ScopeSettings::default()
            },
        }
    }

    pub fn encoder(&self) -> DsoEncoder<'_> {
        DsoEncoder::new(self.profile, self.channel_mode, &self.channels, &self.settings)
    }

    pub fn enabled_channels(&self) -> usize {
        self.channels.iter().filter(|c| c.enabled).count()
    }

    pub fn sample_divider(&self) -> u32 {
        sample_divider(self.channel_mode, &self.settings, self.enabled_channels())
    }

    pub fn write<T: UsbTransport>(&self, link: &mut CommandLink<T>, cmd: DsoCommand) -> Result<(), DsoError> {
        write_commands(link, &self.encoder(), &[cmd])
    }

    pub fn init<T: UsbTransport>(&self, link: &mut CommandLink<T>) -> Result<(), DsoError> {
        write_init(link, &self.encoder())
    }
}

/// Send `cmds` one by one, stopping at the first failure.
pub fn write_commands<T: UsbTransport>(
    link: &mut CommandLink<T>,
    encoder: &DsoEncoder<'_>,
    cmds: &[DsoCommand],
) -> Result<(), DsoError> {
    for cmd in cmds {
        let word = encoder.encode(*cmd)?;
        link.write_dso(word).inspect_err(|e| {
            log::error!("DSO {} command failed: {e}", cmd.as_str());
        })?;
    }
    Ok(())
}

/// Program the full front-end state.
pub fn write_init<T: UsbTransport>(link: &mut CommandLink<T>, encoder: &DsoEncoder<'_>) -> Result<(), DsoError> {
    log::debug!("Initialising oscilloscope front end ({} channels)", encoder.channels.len());
    write_commands(link, encoder, &init_sequence(encoder.channels.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ProtocolGeneration;
    use crate::mock_transport::MockTransport;
    use crate::profile::{find_profile, DSL_VID};

    fn setup(pid: u16) -> (&'static DeviceProfile, &'static ChannelMode, Vec<Channel>) {
        let profile = find_profile(DSL_VID, pid, false).unwrap();
        let mode = profile.default_channel_mode.mode();
        let channels = (0..2).map(|i| Channel::new(i, mode, profile)).collect();
        (profile, mode, channels)
    }

    #[test]
    fn test_coupling_words() {
        let (profile, mode, mut channels) = setup(0x0004);
        let settings = ScopeSettings::default();
        let enc = DsoEncoder::new(profile, mode, &channels, &settings);
        assert_eq!(enc.encode(DsoCommand::Coupling(0)).unwrap(), 0x0E00 + 0x100);
        assert_eq!(enc.encode(DsoCommand::Coupling(1)).unwrap(), 0x0E00 + 0x80 + 0x100);

        channels[1].enabled = false;
        channels[0].coupling = Coupling::Ac;
        let enc = DsoEncoder::new(profile, mode, &channels, &settings);
        assert_eq!(enc.encode(DsoCommand::Coupling(0)).unwrap(), 0x1600);
        assert_eq!(enc.encode(DsoCommand::Coupling(1)).unwrap(), 0x1600 + 0x80 + 0x100);

        channels[0].coupling = Coupling::Ground;
        let enc = DsoEncoder::new(profile, mode, &channels, &settings);
        assert_eq!(enc.encode(DsoCommand::Coupling(0)).unwrap(), 0x1400);

        channels[0].enabled = false;
        let enc = DsoEncoder::new(profile, mode, &channels, &settings);
        assert_eq!(enc.encode(DsoCommand::Coupling(0)).unwrap(), 0);
    }

    #[test]
    fn test_vdiv_and_timebase_words() {
        let (profile, mode, channels) = setup(0x0004);
        let settings = ScopeSettings {
            samplerate: 100_000_000,
            ..ScopeSettings::default()
        };
        let enc = DsoEncoder::new(profile, mode, &channels, &settings);
        let vgain = channels[1].vgain();
        assert_eq!(enc.encode(DsoCommand::VoltsPerDiv(1)).unwrap(), 0x8 + 0x80 + vgain);
        // 200 MHz max over 2 channels at 100 MHz
        assert_eq!(enc.encode(DsoCommand::SampleRate).unwrap(), 0x18 + (1 << 8));
        assert_eq!(enc.encode(DsoCommand::TriggerMargin).unwrap(), 0x40 + (8 << 8));
        assert_eq!(enc.encode(DsoCommand::Sync).unwrap(), SYNC_WORD);
        assert!(matches!(enc.encode(DsoCommand::Offset(2)), Err(DsoError::UnknownChannel(2))));
    }

    #[test]
    fn test_trigger_value_packs_every_channel() {
        let (profile, mode, mut channels) = setup(0x0004);
        channels[0].trig_value = 0x11;
        channels[1].trig_value = 0x22;
        let settings = ScopeSettings::default();
        let enc = DsoEncoder::new(profile, mode, &channels, &settings);
        assert_eq!(enc.encode(DsoCommand::TriggerValue).unwrap(), 0x38 + (0x11 << 8) + (0x22 << 16));
    }

    #[test]
    fn test_source_is_cleared_while_zeroing() {
        let (profile, mode, channels) = setup(0x0004);
        let mut settings = ScopeSettings {
            source: TriggerSource::Ch1,
            trigger_channel: 1,
            ..ScopeSettings::default()
        };
        let enc = DsoEncoder::new(profile, mode, &channels, &settings);
        assert_eq!(enc.encode(DsoCommand::TriggerSource).unwrap(), 0x30 + (0x12 << 8));
        settings.zero = true;
        let enc = DsoEncoder::new(profile, mode, &channels, &settings);
        assert_eq!(enc.encode(DsoCommand::TriggerSource).unwrap(), 0x30);
        assert_eq!(enc.encode(DsoCommand::SampleRate).unwrap(), 0x18 + (1 << 8));
    }

    #[test]
    fn test_pwm_offset_at_mid_scale() {
        let (profile, mode, channels) = setup(0x0004);
        let settings = ScopeSettings::default();
        let enc = DsoEncoder::new(profile, mode, &channels, &settings);
        let ch = &channels[0];
        let expected_pwm = (128.0 / 255.0 * f64::from(ch.vpos_trans)) as u64;
        let word = enc.offset(ch);
        assert_eq!(word >> 32, 128);
        assert_eq!(word & 0xFFFF_FFFF, expected_pwm + u64::from(ch.preoff()));
    }

    #[test]
    fn test_preoff_offset_at_mid_scale() {
        let (profile, mode, channels) = setup(0x0002);
        let settings = ScopeSettings::default();
        let enc = DsoEncoder::new(profile, mode, &channels, &settings);
        let ch = &channels[0];
        let preoff = u64::from(ch.preoff());
        // mid-scale is zero volts: coarse and fine corrections are both 0
        let word = enc.offset(ch);
        assert_eq!(word >> 32, 128);
        assert_eq!(word & 0xFFFF_FFFF, ((160 + (preoff >> 10)) << 16) + (preoff & 0x3ff));
    }

    #[test]
    fn test_init_sequence_order() {
        let seq = init_sequence(2);
        assert_eq!(seq.len(), 13);
        assert_eq!(&seq[..3], &[DsoCommand::Coupling(0), DsoCommand::VoltsPerDiv(0), DsoCommand::Offset(0)]);
        assert_eq!(seq[6], DsoCommand::SampleRate);
        assert_eq!(seq[12], DsoCommand::TriggerMargin);
    }

    #[test]
    fn test_write_init_sends_every_word() {
        let (profile, mode, channels) = setup(0x0004);
        let settings = ScopeSettings::default();
        let enc = DsoEncoder::new(profile, mode, &channels, &settings);
        let mut link = CommandLink::new(MockTransport::new(false), ProtocolGeneration::Structured);
        write_init(&mut link, &enc).unwrap();
        let words = &link.transport().dso_words;
        assert_eq!(words.len(), 13);
        assert_eq!(words[0], enc.encode(DsoCommand::Coupling(0)).unwrap());
        assert_eq!(words[12], 0x40 + (8 << 8));
    }
}
