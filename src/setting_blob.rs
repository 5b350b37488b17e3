//! Binary setting blob written to the FPGA before every capture.
//!
//! Layout (little endian, 372 bytes):
//!
//! | field | header | words |
//! |-------|--------|-------|
//! | sync `0xF5A5F5A5` | | 2 |
//! | mode | `0x0001` | 1 |
//! | divider | `0x0102` | 2 |
//! | capture count | `0x0302` | 2 |
//! | trigger position | `0x0502` | 2 |
//! | trigger globals | `0x0701` | 1 |
//! | DSO count | `0x0802` | 2 |
//! | channel enable | `0x0a02` | 2 |
//! | digital fine gain | `0x0c01` | 1 |
//! | trigger tables | `0x40a0` | 8 × 16 + 16 × 2 |
//! | end `0xFA5AFA5A` | | 2 |
//!
//! Devices with 32 logic channels take a second 204 byte blob carrying the
//! match words of channels 16..32.

use crate::profile::{ChannelMode, OperationMode};
use crate::trigger_config::{
    CompiledTrigger, NarrowPacking, StageWords, TriggerConfig, TriggerMode, TRIGGER_STAGES,
};

pub const SYNC: u32 = 0xF5A5_F5A5;
pub const END_SYNC: u32 = 0xFA5A_FA5A;
pub const SETTING_BYTES: usize = 372;
pub const EXT32_BYTES: usize = 204;

/// Hardware captures in blocks of 64 samples.
pub const ATOMIC_SAMPLES: u64 = 1 << 6;
const ATOMIC_MASK: u32 = 0xFFFF << 6;
pub const SAMPLES_ALIGN: u64 = 1023;
const MAX_TRIG_PERCENT: u64 = 90;
const STREAM_TRIG_PERCENT: u64 = 10;

pub mod mode_bits {
    pub const TRIG_EN: u16 = 1 << 0;
    pub const CLK_TYPE: u16 = 1 << 1;
    pub const CLK_EDGE: u16 = 1 << 2;
    pub const RLE: u16 = 1 << 3;
    pub const DSO: u16 = 1 << 4;
    pub const HALF: u16 = 1 << 5;
    pub const QUAR: u16 = 1 << 6;
    pub const ANALOG: u16 = 1 << 7;
    pub const FILTER: u16 = 1 << 8;
    pub const INSTANT: u16 = 1 << 9;
    pub const SLOW_ACQ: u16 = 1 << 10;
    pub const STRIG: u16 = 1 << 11;
    pub const STREAM: u16 = 1 << 12;
    pub const LPB_TEST: u16 = 1 << 13;
    pub const EXT_TEST: u16 = 1 << 14;
    pub const INT_TEST: u16 = 1 << 15;
}

mod headers {
    pub const MODE: u16 = 0x0001;
    pub const DIVIDER: u16 = 0x0102;
    pub const COUNT: u16 = 0x0302;
    pub const TRIG_POS: u16 = 0x0502;
    pub const TRIG_GLB: u16 = 0x0701;
    pub const DSO_COUNT: u16 = 0x0802;
    pub const CH_EN: u16 = 0x0a02;
    pub const FGAIN: u16 = 0x0c01;
    pub const TRIG: u16 = 0x40a0;
    pub const EXT_TRIG: u16 = 0x6060;
    pub const EXT_ALIGN: u16 = 0xffff;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SettingError {
    #[error("Setting blob has {actual} bytes, expected {expected}")]
    Length { expected: usize, actual: usize },

    #[error("Bad {field} marker {found:#x}")]
    Marker { field: &'static str, found: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestMode {
    #[default]
    None,
    Internal,
    External,
    Loopback,
}

impl TestMode {
    pub const ALL: [TestMode; 4] = [TestMode::None, TestMode::Internal, TestMode::External, TestMode::Loopback];

    pub fn as_str(&self) -> &'static str {
        match self {
            TestMode::None => "none",
            TestMode::Internal => "internal",
            TestMode::External => "external",
            TestMode::Loopback => "loopback",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == name)
    }
}

/// Everything the blob is derived from, captured at arm time.
#[derive(Debug, Clone)]
pub struct ArmParams<'a> {
    pub mode: OperationMode,
    pub channel_mode: &'a ChannelMode,
    pub samplerate: u64,
    pub half_samplerate: u64,
    pub quarter_samplerate: u64,
    pub limit_samples: u64,
    pub actual_samples: u64,
    pub hw_depth: u64,
    /// Bit `n` set when channel `n` is enabled.
    pub channel_enable: u32,
    pub fgain: u16,
    pub stream: bool,
    pub instant: bool,
    pub clock_external: bool,
    pub clock_falling: bool,
    pub rle: bool,
    pub filter_1t: bool,
    pub is_loop: bool,
    pub test_mode: TestMode,
    pub bytes_per_ms: u64,
    pub adf4360: bool,
    pub trigger: &'a TriggerConfig,
    /// The trigger is matched on the host: the FPGA runs untriggered.
    pub software_trigger: bool,
}

impl ArmParams<'_> {
    pub fn enabled_channels(&self) -> u32 {
        self.channel_enable.count_ones()
    }

    /// Sample memory available to each enabled channel.
    pub fn channel_depth(&self) -> u64 {
        let ch = u64::from(self.enabled_channels().max(1));
        (self.hw_depth / ch) & !SAMPLES_ALIGN
    }

    pub fn mode_word(&self) -> u16 {
        use mode_bits::*;
        let flag = |on: bool, bit: u16| if on { bit } else { 0 };
        let hardware = !self.software_trigger;
        flag(self.trigger.enabled && hardware, TRIG_EN)
            | flag(self.clock_external, CLK_TYPE)
            | flag(self.clock_falling, CLK_EDGE)
            | flag(self.rle, RLE)
            | flag(self.mode == OperationMode::Oscilloscope, DSO)
            | flag(self.samplerate == self.half_samplerate, HALF)
            | flag(self.samplerate == self.quarter_samplerate, QUAR)
            | flag(self.mode == OperationMode::Analog || self.is_loop, ANALOG)
            | flag(self.filter_1t, FILTER)
            | flag(self.instant, INSTANT)
            | flag(self.bytes_per_ms < 1024, SLOW_ACQ)
            | flag(self.trigger.mode == TriggerMode::Serial && hardware, STRIG)
            | flag(self.stream, STREAM)
            | flag(self.test_mode == TestMode::Loopback, LPB_TEST)
            | flag(self.test_mode == TestMode::External, EXT_TEST)
            | flag(self.test_mode == TestMode::Internal, INT_TEST)
    }

    /// Sample clock divider before the pre-divider split.
    pub fn divider(&self) -> u32 {
        let cm = self.channel_mode;
        let rate = self.samplerate.max(1) as f64;
        let div = match self.mode {
            OperationMode::Oscilloscope => {
                cm.max_samplerate as f64 / rate / f64::from(self.enabled_channels().max(1))
            }
            OperationMode::Analog => {
                cm.hw_max_samplerate as f64 / self.samplerate.max(cm.hw_min_samplerate).max(1) as f64
            }
            OperationMode::Logic => cm.hw_max_samplerate as f64 / rate,
        };
        div.ceil() as u32
    }

    /// Samples between two analog readings at the configured rate.
    pub fn unit_pitch(&self) -> u16 {
        (self.channel_mode.hw_min_samplerate as f64 / self.samplerate.max(1) as f64).ceil() as u16
    }

    fn packing(&self, mode: u16) -> NarrowPacking {
        let quarter_mode = mode & mode_bits::QUAR != 0;
        let half_mode = mode & mode_bits::HALF != 0;
        NarrowPacking {
            quarter: !self.adf4360 && quarter_mode,
            half: (!self.adf4360 && half_mode) || (self.adf4360 && quarter_mode),
        }
    }

    fn samples_per_channel_group(&self, samples: u64) -> u64 {
        let per = u64::from(self.channel_mode.num) / u64::from(self.enabled_channels().max(1));
        samples / per.max(1)
    }

    fn trigger_position(&self) -> u32 {
        let requested = (f64::from(self.trigger.position()) / 100.0 * self.limit_samples as f64) as u64;
        let percent = if self.stream { STREAM_TRIG_PERCENT } else { MAX_TRIG_PERCENT };
        requested
            .max(ATOMIC_SAMPLES)
            .min(self.channel_depth() * percent / 100) as u32
    }
}

/// The main setting blob.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HardwareSetting {
    pub mode: u16,
    pub div_l: u16,
    pub div_h: u16,
    pub cnt_l: u16,
    pub cnt_h: u16,
    pub tpos_l: u16,
    pub tpos_h: u16,
    pub trig_glb: u16,
    pub dso_cnt_l: u16,
    pub dso_cnt_h: u16,
    pub ch_en_l: u16,
    pub ch_en_h: u16,
    pub fgain: u16,
    pub trigger: CompiledTrigger,
}

/// Match words for channels 16..32.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ext32Setting {
    pub words: StageWords,
}

struct Writer(Vec<u8>);

impl Writer {
    fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn words(&mut self, words: &StageWords) {
        for table in [
            &words.mask0,
            &words.mask1,
            &words.value0,
            &words.value1,
            &words.edge0,
            &words.edge1,
        ] {
            table.iter().for_each(|w| self.u16(*w));
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn u16(&mut self) -> u16 {
        let v = u16::from_le_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        v
    }

    fn u32(&mut self) -> u32 {
        let lo = u32::from(self.u16());
        let hi = u32::from(self.u16());
        lo | (hi << 16)
    }

    fn expect16(&mut self, field: &'static str, marker: u16) -> Result<(), SettingError> {
        let found = self.u16();
        if found != marker {
            return Err(SettingError::Marker {
                field,
                found: u32::from(found),
            });
        }
        Ok(())
    }

    fn expect32(&mut self, field: &'static str, marker: u32) -> Result<(), SettingError> {
        let found = self.u32();
        if found != marker {
            return Err(SettingError::Marker { field, found });
        }
        Ok(())
    }

    fn table(&mut self) -> [u16; TRIGGER_STAGES] {
        let mut out = [0u16; TRIGGER_STAGES];
        out.iter_mut().for_each(|w| *w = self.u16());
        out
    }

    fn words(&mut self) -> StageWords {
        StageWords {
            mask0: self.table(),
            mask1: self.table(),
            value0: self.table(),
            value1: self.table(),
            edge0: self.table(),
            edge1: self.table(),
        }
    }
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), SettingError> {
    if buf.len() != expected {
        return Err(SettingError::Length {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

impl HardwareSetting {
    /// Derive both blobs from the arm-time parameters.
    pub fn derive(params: &ArmParams<'_>) -> (HardwareSetting, Ext32Setting) {
        let cm = params.channel_mode;
        let mode = params.mode_word();

        let div = params.divider();
        let pre_div = u32::from(cm.pre_div.max(1));
        let mut div_h = (if div >= pre_div { pre_div - 1 } else { div.saturating_sub(1) }) << 8;
        let div = (f64::from(div) / f64::from(pre_div)).ceil() as u32;
        let div_l = div & 0xFFFF;
        div_h += div >> 16;

        let dso = params.mode == OperationMode::Oscilloscope;
        let count = if dso {
            params.samples_per_channel_group(params.actual_samples)
        } else {
            params.actual_samples
        } >> 4;
        let dso_count = if dso {
            params.samples_per_channel_group(params.limit_samples)
        } else {
            params.actual_samples
        };

        let tpos = params.trigger_position();
        let ch_num = params.enabled_channels() as u16;
        let untriggered = TriggerConfig::new();
        let trigger = if params.software_trigger {
            &untriggered
        } else {
            params.trigger
        };
        let compiled = trigger.compile(params.packing(mode));

        let setting = HardwareSetting {
            mode,
            div_l: div_l as u16,
            div_h: div_h as u16,
            cnt_l: (count & 0xFFFF) as u16,
            cnt_h: (count >> 16) as u16,
            tpos_l: (tpos & ATOMIC_MASK) as u16,
            tpos_h: (tpos >> 16) as u16,
            trig_glb: ((ch_num & 0x1F) << 8) + (trigger.stages() & 0x00FF),
            dso_cnt_l: (dso_count & 0xFFFF) as u16,
            dso_cnt_h: (dso_count >> 16) as u16,
            ch_en_l: (params.channel_enable & 0xFFFF) as u16,
            ch_en_h: (params.channel_enable >> 16) as u16,
            fgain: params.fgain,
            trigger: compiled.clone(),
        };
        let ext = Ext32Setting {
            words: compiled.ext_words,
        };
        log::debug!(
            "Setting blob: mode {:#06x}, divider {:#06x}/{:#06x}, count {}, trigger position {}",
            setting.mode,
            setting.div_h,
            setting.div_l,
            count,
            tpos
        );
        (setting, ext)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer(Vec::with_capacity(SETTING_BYTES));
        w.u32(SYNC);
        w.u16(headers::MODE);
        w.u16(self.mode);
        w.u16(headers::DIVIDER);
        w.u16(self.div_l);
        w.u16(self.div_h);
        w.u16(headers::COUNT);
        w.u16(self.cnt_l);
        w.u16(self.cnt_h);
        w.u16(headers::TRIG_POS);
        w.u16(self.tpos_l);
        w.u16(self.tpos_h);
        w.u16(headers::TRIG_GLB);
        w.u16(self.trig_glb);
        w.u16(headers::DSO_COUNT);
        w.u16(self.dso_cnt_l);
        w.u16(self.dso_cnt_h);
        w.u16(headers::CH_EN);
        w.u16(self.ch_en_l);
        w.u16(self.ch_en_h);
        w.u16(headers::FGAIN);
        w.u16(self.fgain);
        w.u16(headers::TRIG);
        w.words(&self.trigger.words);
        self.trigger.logic0.iter().for_each(|v| w.u16(*v));
        self.trigger.logic1.iter().for_each(|v| w.u16(*v));
        self.trigger.count.iter().for_each(|v| w.u32(*v));
        w.u32(END_SYNC);
        w.0
    }

    pub fn decode(buf: &[u8]) -> Result<Self, SettingError> {
        check_len(buf, SETTING_BYTES)?;
        let mut r = Reader { buf, pos: 0 };
        r.expect32("sync", SYNC)?;
        r.expect16("mode", headers::MODE)?;
        let mode = r.u16();
        r.expect16("divider", headers::DIVIDER)?;
        let (div_l, div_h) = (r.u16(), r.u16());
        r.expect16("count", headers::COUNT)?;
        let (cnt_l, cnt_h) = (r.u16(), r.u16());
        r.expect16("trigger position", headers::TRIG_POS)?;
        let (tpos_l, tpos_h) = (r.u16(), r.u16());
        r.expect16("trigger globals", headers::TRIG_GLB)?;
        let trig_glb = r.u16();
        r.expect16("dso count", headers::DSO_COUNT)?;
        let (dso_cnt_l, dso_cnt_h) = (r.u16(), r.u16());
        r.expect16("channel enable", headers::CH_EN)?;
        let (ch_en_l, ch_en_h) = (r.u16(), r.u16());
        r.expect16("fine gain", headers::FGAIN)?;
        let fgain = r.u16();
        r.expect16("trigger", headers::TRIG)?;
        let words = r.words();
        let logic0 = r.table();
        let logic1 = r.table();
        let mut count = [0u32; TRIGGER_STAGES];
        count.iter_mut().for_each(|c| *c = r.u32());
        r.expect32("end", END_SYNC)?;

        Ok(Self {
            mode,
            div_l,
            div_h,
            cnt_l,
            cnt_h,
            tpos_l,
            tpos_h,
            trig_glb,
            dso_cnt_l,
            dso_cnt_h,
            ch_en_l,
            ch_en_h,
            fgain,
            trigger: CompiledTrigger {
                words,
                ext_words: StageWords::default(),
                logic0,
                logic1,
                count,
            },
        })
    }

    /// Length of the blob in 16-bit words, as announced before the bulk write.
    pub fn word_count() -> usize {
        SETTING_BYTES / 2
    }
}

impl Ext32Setting {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer(Vec::with_capacity(EXT32_BYTES));
        w.u32(SYNC);
        w.u16(headers::EXT_TRIG);
        w.words(&self.words);
        w.u16(headers::EXT_ALIGN);
        w.u32(END_SYNC);
        w.0
    }

    pub fn decode(buf: &[u8]) -> Result<Self, SettingError> {
        check_len(buf, EXT32_BYTES)?;
        let mut r = Reader { buf, pos: 0 };
        r.expect32("sync", SYNC)?;
        r.expect16("extended trigger", headers::EXT_TRIG)?;
        let words = r.words();
        r.expect16("align", headers::EXT_ALIGN)?;
        r.expect32("end", END_SYNC)?;
        Ok(Self { words })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ChannelModeId;

    fn params<'a>(trigger: &'a TriggerConfig, cm: ChannelModeId) -> ArmParams<'a> {
        ArmParams {
            mode: OperationMode::Logic,
            channel_mode: cm.mode(),
            samplerate: 1_000_000,
            half_samplerate: 800_000_000,
            quarter_samplerate: 1_600_000_000,
            limit_samples: 1_048_576,
            actual_samples: 1_048_576,
            hw_depth: 256 * 1024 * 1024,
            channel_enable: 0x00FF,
            fgain: 0,
            stream: false,
            instant: false,
            clock_external: false,
            clock_falling: false,
            rle: false,
            filter_1t: false,
            is_loop: false,
            test_mode: TestMode::None,
            bytes_per_ms: 1000,
            adf4360: false,
            trigger,
            software_trigger: false,
        }
    }

    #[test]
    fn test_blob_sizes_and_markers() {
        let trigger = TriggerConfig::new();
        let (setting, ext) = HardwareSetting::derive(&params(&trigger, ChannelModeId::Buffer100x16));
        let blob = setting.encode();
        assert_eq!(blob.len(), SETTING_BYTES);
        assert_eq!(HardwareSetting::word_count(), 186);
        assert_eq!(&blob[0..4], &SYNC.to_le_bytes());
        assert_eq!(&blob[4..6], &0x0001u16.to_le_bytes());
        assert_eq!(&blob[368..372], &END_SYNC.to_le_bytes());

        let ext_blob = ext.encode();
        assert_eq!(ext_blob.len(), EXT32_BYTES);
        assert_eq!(&ext_blob[4..6], &0x6060u16.to_le_bytes());
        assert_eq!(&ext_blob[198..200], &0xFFFFu16.to_le_bytes());
    }

    #[test]
    fn test_decode_reads_back_fields() {
        let trigger = TriggerConfig::simple().rising(3).unwrap().build();
        let (setting, ext) = HardwareSetting::derive(&params(&trigger, ChannelModeId::Buffer100x16));
        let decoded = HardwareSetting::decode(&setting.encode()).unwrap();
        assert_eq!(decoded.mode, setting.mode);
        assert_eq!(decoded.trigger.words, setting.trigger.words);
        assert_eq!(decoded.trigger.logic0, setting.trigger.logic0);
        assert_eq!(Ext32Setting::decode(&ext.encode()).unwrap(), ext);
    }

    #[test]
    fn test_decode_rejects_bad_marker() {
        let trigger = TriggerConfig::new();
        let (setting, _) = HardwareSetting::derive(&params(&trigger, ChannelModeId::Buffer100x16));
        let mut blob = setting.encode();
        blob[4] = 0x99;
        assert!(matches!(
            HardwareSetting::decode(&blob),
            Err(SettingError::Marker { field: "mode", .. })
        ));
        assert_eq!(
            HardwareSetting::decode(&blob[..10]),
            Err(SettingError::Length { expected: SETTING_BYTES, actual: 10 })
        );
    }

    #[test]
    fn test_mode_word() {
        let mut trigger = TriggerConfig::new();
        trigger.enabled = true;
        let mut p = params(&trigger, ChannelModeId::Stream20x16);
        p.stream = true;
        p.bytes_per_ms = 500;
        let mode = p.mode_word();
        assert_eq!(mode, mode_bits::TRIG_EN | mode_bits::SLOW_ACQ | mode_bits::STREAM);

        p.mode = OperationMode::Oscilloscope;
        p.test_mode = TestMode::Internal;
        p.bytes_per_ms = 4096;
        p.stream = false;
        assert_eq!(p.mode_word(), mode_bits::TRIG_EN | mode_bits::DSO | mode_bits::INT_TEST);
    }

    #[test]
    fn test_divider_split() {
        let trigger = TriggerConfig::new();
        let p = params(&trigger, ChannelModeId::Buffer100x16);
        let cm = p.channel_mode;
        let div = p.divider();
        assert_eq!(div as u64, cm.hw_max_samplerate.div_ceil(1_000_000));

        let (setting, _) = HardwareSetting::derive(&p);
        let pre_div = u32::from(cm.pre_div.max(1));
        let expected_hi = if div >= pre_div { pre_div - 1 } else { div - 1 };
        assert_eq!(u32::from(setting.div_h >> 8), expected_hi);
        assert_eq!(u32::from(setting.div_l), div.div_ceil(pre_div) & 0xFFFF);
    }

    #[test]
    fn test_counts_and_trigger_position() {
        let mut trigger = TriggerConfig::new();
        trigger.set_position(50).unwrap();
        let p = params(&trigger, ChannelModeId::Buffer100x16);
        let (setting, _) = HardwareSetting::derive(&p);
        let count = (1_048_576u32 >> 4) as u16;
        assert_eq!((setting.cnt_l, setting.cnt_h), (count, 0));
        assert_eq!(setting.dso_cnt_l as u64 | (setting.dso_cnt_h as u64) << 16, 1_048_576);
        let tpos = 524_288u32;
        assert_eq!(setting.tpos_l, (tpos & 0xFFC0) as u16);
        assert_eq!(setting.tpos_h, (tpos >> 16) as u16);
        assert_eq!(setting.trig_glb, 8 << 8);
        assert_eq!((setting.ch_en_l, setting.ch_en_h), (0x00FF, 0));
    }

    #[test]
    fn test_trigger_position_floor_and_cap() {
        let trigger = TriggerConfig::new();
        let p = params(&trigger, ChannelModeId::Buffer100x16);
        assert_eq!(p.trigger_position(), 64);

        let mut trigger = TriggerConfig::new();
        trigger.set_position(100).unwrap();
        let mut p = params(&trigger, ChannelModeId::Stream20x16);
        p.stream = true;
        p.limit_samples = u64::MAX / 2;
        assert_eq!(u64::from(p.trigger_position()), p.channel_depth() / 10);
    }

    #[test]
    fn test_oscilloscope_counts_scale_by_channel_group() {
        let trigger = TriggerConfig::new();
        let mut p = params(&trigger, ChannelModeId::Dso200x2);
        p.mode = OperationMode::Oscilloscope;
        p.channel_enable = 0b01;
        p.limit_samples = 10_000;
        p.actual_samples = 10_240;
        p.samplerate = 100_000_000;
        let (setting, _) = HardwareSetting::derive(&p);
        // one of two channels enabled: the enabled channel gets both lanes
        assert_eq!(setting.cnt_l, ((10_240 / 2) >> 4) as u16);
        assert_eq!(setting.dso_cnt_l, 5_000);
        assert_eq!(p.divider(), p.channel_mode.max_samplerate.div_ceil(100_000_000) as u32);
    }

    #[test]
    fn test_software_trigger_leaves_fpga_untriggered() {
        let mut trigger = TriggerConfig::new();
        trigger.enabled = true;
        trigger.mode = TriggerMode::Advanced;
        trigger.set_stage_value(0, 16, "XXXXXXXXXXXXXXX1", "XXXXXXXXXXXXXXXX").unwrap();
        trigger.set_stages(2).unwrap();
        let mut p = params(&trigger, ChannelModeId::Stream20x16);
        p.stream = true;

        let (hw, _) = HardwareSetting::derive(&p);
        assert_ne!(hw.mode & mode_bits::TRIG_EN, 0);
        assert_eq!(hw.trig_glb & 0xFF, 2);
        assert_eq!(hw.trigger.words.mask0[0], 0xFFFE);

        p.software_trigger = true;
        let (sw, _) = HardwareSetting::derive(&p);
        let untriggered = TriggerConfig::new().compile(NarrowPacking::default());
        assert_eq!(sw.mode & mode_bits::TRIG_EN, 0);
        assert_eq!(sw.trig_glb, 8 << 8);
        assert_eq!(sw.trigger, untriggered);
        assert_eq!(sw.mode & !mode_bits::TRIG_EN, hw.mode & !mode_bits::TRIG_EN);
    }
}
