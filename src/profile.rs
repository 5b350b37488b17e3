//! Static descriptions of supported instruments: USB ids, firmware files,
//! capability bits and the channel modes each model can run in.

pub const DSL_VID: u16 = 0x2A0E;

const fn khz(v: u64) -> u64 {
    v * 1_000
}

const fn mhz(v: u64) -> u64 {
    v * 1_000_000
}

const fn ghz(v: u64) -> u64 {
    v * 1_000_000_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationMode {
    Logic,
    Oscilloscope,
    Analog,
}

impl OperationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationMode::Logic => "logic",
            OperationMode::Oscilloscope => "dso",
            OperationMode::Analog => "analog",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "logic" => Some(OperationMode::Logic),
            "dso" => Some(OperationMode::Oscilloscope),
            "analog" => Some(OperationMode::Analog),
            _ => None,
        }
    }

    fn cap_bit(self) -> u32 {
        match self {
            OperationMode::Logic => 1 << 0,
            OperationMode::Analog => 1 << 1,
            OperationMode::Oscilloscope => 1 << 2,
        }
    }
}

/// Feature capability bits.
pub mod caps {
    pub const VTH: u32 = 1 << 0;
    pub const BUF: u32 = 1 << 1;
    pub const PREOFF: u32 = 1 << 2;
    pub const SEEP: u32 = 1 << 3;
    pub const ZERO: u32 = 1 << 4;
    pub const HMCAD1511: u32 = 1 << 5;
    pub const USB30: u32 = 1 << 6;
    pub const POGOPIN: u32 = 1 << 7;
    pub const ADF4360: u32 = 1 << 8;
    pub const BW_20M: u32 = 1 << 9;
    pub const FLASH: u32 = 1 << 10;
    pub const LA_CH32: u32 = 1 << 11;
    pub const AUTO_VGAIN: u32 = 1 << 12;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelModeId {
    Stream20x16 = 0,
    Stream25x12,
    Stream50x6,
    Stream100x3,
    Stream20x16Dn2,
    Stream25x12Dn2,
    Stream50x6Dn2,
    Stream100x3Dn2,
    Stream10x32Ch32,
    Stream20x16Ch32,
    Stream25x12Ch32,
    Stream50x6Ch32,
    Stream100x3Ch32,
    Stream50x32,
    Stream100x30,
    Stream250x12,
    Stream125x16Ch16,
    Stream250x12Ch16,
    Stream500x6,
    Stream1000x3,
    Buffer100x16,
    Buffer200x8,
    Buffer400x4,
    Buffer250x32,
    Buffer500x16,
    Buffer1000x8,
    Analog10x2,
    Analog10x2Hw500,
    Dso200x2,
    Dso1000x2,
}

/// One way of splitting the sample bandwidth across channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMode {
    pub id: ChannelModeId,
    pub mode: OperationMode,
    pub stream: bool,
    /// Channels carried in the sample word.
    pub num: u16,
    /// Channels usable in this mode.
    pub valid: u16,
    pub unit_bits: u8,
    pub min_samplerate: u64,
    pub max_samplerate: u64,
    pub hw_min_samplerate: u64,
    pub hw_max_samplerate: u64,
    pub pre_div: u16,
    pub description: &'static str,
}

const fn logic_mode(
    id: ChannelModeId,
    stream: bool,
    num: u16,
    valid: u16,
    max: u64,
    hw_max: u64,
    pre_div: u16,
    description: &'static str,
) -> ChannelMode {
    ChannelMode {
        id,
        mode: OperationMode::Logic,
        stream,
        num,
        valid,
        unit_bits: 1,
        min_samplerate: khz(10),
        max_samplerate: max,
        hw_min_samplerate: khz(10),
        hw_max_samplerate: hw_max,
        pre_div,
        description,
    }
}

use ChannelModeId as Cm;

pub static CHANNEL_MODES: [ChannelMode; 30] = [
    logic_mode(Cm::Stream20x16, true, 16, 16, mhz(20), mhz(100), 1, "Use 16 Channels (Max 20MHz)"),
    logic_mode(Cm::Stream25x12, true, 16, 12, mhz(25), mhz(100), 1, "Use 12 Channels (Max 25MHz)"),
    logic_mode(Cm::Stream50x6, true, 16, 6, mhz(50), mhz(100), 1, "Use 6 Channels (Max 50MHz)"),
    logic_mode(Cm::Stream100x3, true, 16, 3, mhz(100), mhz(100), 1, "Use 3 Channels (Max 100MHz)"),
    logic_mode(Cm::Stream20x16Dn2, true, 16, 16, mhz(20), mhz(500), 5, "Use 16 Channels (Max 20MHz)"),
    logic_mode(Cm::Stream25x12Dn2, true, 16, 12, mhz(25), mhz(500), 5, "Use 12 Channels (Max 25MHz)"),
    logic_mode(Cm::Stream50x6Dn2, true, 16, 6, mhz(50), mhz(500), 5, "Use 6 Channels (Max 50MHz)"),
    logic_mode(Cm::Stream100x3Dn2, true, 16, 3, mhz(100), mhz(500), 5, "Use 3 Channels (Max 100MHz)"),
    logic_mode(Cm::Stream10x32Ch32, true, 32, 32, mhz(10), mhz(500), 5, "Use 32 Channels (Max 10MHz)"),
    logic_mode(Cm::Stream20x16Ch32, true, 32, 16, mhz(20), mhz(500), 5, "Use 16 Channels (Max 20MHz)"),
    logic_mode(Cm::Stream25x12Ch32, true, 32, 12, mhz(25), mhz(500), 5, "Use 12 Channels (Max 25MHz)"),
    logic_mode(Cm::Stream50x6Ch32, true, 32, 6, mhz(50), mhz(500), 5, "Use 6 Channels (Max 50MHz)"),
    logic_mode(Cm::Stream100x3Ch32, true, 32, 3, mhz(100), mhz(500), 5, "Use 3 Channels (Max 100MHz)"),
    logic_mode(Cm::Stream50x32, true, 32, 32, mhz(50), mhz(500), 5, "Use 32 Channels (Max 50MHz)"),
    logic_mode(Cm::Stream100x30, true, 32, 30, mhz(100), mhz(500), 5, "Use 30 Channels (Max 100MHz)"),
    logic_mode(Cm::Stream250x12, true, 32, 12, mhz(250), mhz(500), 5, "Use 12 Channels (Max 250MHz)"),
    logic_mode(Cm::Stream125x16Ch16, true, 16, 16, mhz(125), mhz(500), 5, "Use 16 Channels (Max 125MHz)"),
    logic_mode(Cm::Stream250x12Ch16, true, 16, 12, mhz(250), mhz(500), 5, "Use 12 Channels (Max 250MHz)"),
    logic_mode(Cm::Stream500x6, true, 16, 6, mhz(500), mhz(500), 5, "Use 6 Channels (Max 500MHz)"),
    logic_mode(Cm::Stream1000x3, true, 8, 3, ghz(1), mhz(500), 5, "Use 3 Channels (Max 1GHz)"),
    logic_mode(Cm::Buffer100x16, false, 16, 16, mhz(100), mhz(100), 1, "Use Channels 0~15 (Max 100MHz)"),
    logic_mode(Cm::Buffer200x8, false, 8, 8, mhz(200), mhz(100), 1, "Use Channels 0~7 (Max 200MHz)"),
    logic_mode(Cm::Buffer400x4, false, 4, 4, mhz(400), mhz(100), 1, "Use Channels 0~3 (Max 400MHz)"),
    logic_mode(Cm::Buffer250x32, false, 32, 32, mhz(250), mhz(500), 5, "Use Channels 0~31 (Max 250MHz)"),
    logic_mode(Cm::Buffer500x16, false, 16, 16, mhz(500), mhz(500), 5, "Use Channels 0~15 (Max 500MHz)"),
    logic_mode(Cm::Buffer1000x8, false, 8, 8, ghz(1), mhz(500), 5, "Use Channels 0~7 (Max 1GHz)"),
    ChannelMode {
        id: Cm::Analog10x2,
        mode: OperationMode::Analog,
        stream: true,
        num: 2,
        valid: 2,
        unit_bits: 8,
        min_samplerate: 10,
        max_samplerate: mhz(10),
        hw_min_samplerate: khz(10),
        hw_max_samplerate: mhz(100),
        pre_div: 1,
        description: "Use Channels 0~1 (Max 10MHz)",
    },
    ChannelMode {
        id: Cm::Analog10x2Hw500,
        mode: OperationMode::Analog,
        stream: true,
        num: 2,
        valid: 2,
        unit_bits: 8,
        min_samplerate: 10,
        max_samplerate: mhz(10),
        hw_min_samplerate: khz(10),
        hw_max_samplerate: mhz(500),
        pre_div: 1,
        description: "Use Channels 0~1 (Max 10MHz)",
    },
    ChannelMode {
        id: Cm::Dso200x2,
        mode: OperationMode::Oscilloscope,
        stream: false,
        num: 2,
        valid: 2,
        unit_bits: 8,
        min_samplerate: khz(10),
        max_samplerate: mhz(200),
        hw_min_samplerate: khz(10),
        hw_max_samplerate: mhz(100),
        pre_div: 1,
        description: "Use Channels 0~1 (Max 200MHz)",
    },
    ChannelMode {
        id: Cm::Dso1000x2,
        mode: OperationMode::Oscilloscope,
        stream: false,
        num: 2,
        valid: 2,
        unit_bits: 8,
        min_samplerate: khz(10),
        max_samplerate: ghz(1),
        hw_min_samplerate: khz(10),
        hw_max_samplerate: mhz(500),
        pre_div: 1,
        description: "Use Channels 0~1 (Max 1GHz)",
    },
];

impl ChannelModeId {
    pub fn mode(self) -> &'static ChannelMode {
        &CHANNEL_MODES[self as usize]
    }
}

/// Volts/div steps in millivolts.
pub static VDIVS_10_TO_2000: [u64; 8] = [10, 20, 50, 100, 200, 500, 1000, 2000];

pub static SAMPLERATES_100: [u64; 26] = [
    10, 20, 50, 100, 200, 500, khz(1), khz(2), khz(5), khz(10), khz(20), khz(40), khz(50),
    khz(100), khz(200), khz(400), khz(500), mhz(1), mhz(2), mhz(4), mhz(5), mhz(10), mhz(20),
    mhz(25), mhz(50), mhz(100),
];

pub static SAMPLERATES_400: [u64; 28] = [
    10, 20, 50, 100, 200, 500, khz(1), khz(2), khz(5), khz(10), khz(20), khz(40), khz(50),
    khz(100), khz(200), khz(400), khz(500), mhz(1), mhz(2), mhz(4), mhz(5), mhz(10), mhz(20),
    mhz(25), mhz(50), mhz(100), mhz(200), mhz(400),
];

pub static SAMPLERATES_1000: [u64; 30] = [
    10, 20, 50, 100, 200, 500, khz(1), khz(2), khz(5), khz(10), khz(20), khz(40), khz(50),
    khz(100), khz(200), khz(400), khz(500), mhz(1), mhz(2), mhz(4), mhz(5), mhz(10), mhz(20),
    mhz(25), mhz(50), mhz(100), mhz(125), mhz(250), mhz(500), ghz(1),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    DsLogic,
    DsCope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    High,
    Super,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProfile {
    pub vid: u16,
    pub pid: u16,
    pub speed: UsbSpeed,
    pub family: DeviceFamily,
    pub model: &'static str,
    pub firmware: &'static str,
    pub fpga_bit33: &'static str,
    pub fpga_bit50: &'static str,
    pub mode_caps: u32,
    pub feature_caps: u32,
    pub channel_modes: &'static [ChannelModeId],
    pub total_channels: u16,
    pub hw_depth: u64,
    pub dso_depth: u64,
    pub vdivs: &'static [u64],
    pub samplerates: &'static [u64],
    pub vga_id: u8,
    pub default_channel_mode: ChannelModeId,
    pub default_samplerate: u64,
    pub default_limit: u64,
    pub default_pwmtrans: u16,
    pub default_pwmmargin: u16,
    pub ref_min: u32,
    pub ref_max: u32,
    pub default_comb_comp: u16,
    pub half_samplerate: u64,
    pub quarter_samplerate: u64,
}

impl DeviceProfile {
    pub fn has_feature(&self, cap: u32) -> bool {
        self.feature_caps & cap != 0
    }

    pub fn supports_mode(&self, mode: OperationMode) -> bool {
        self.mode_caps & mode.cap_bit() != 0
    }

    /// Legacy DSLogic boards speak the flat opcode protocol.
    pub fn uses_legacy_protocol(&self) -> bool {
        self.family == DeviceFamily::DsLogic && self.pid == 0x0001
    }

    /// First channel mode of this profile that runs in `mode`.
    pub fn channel_mode_for(&self, mode: OperationMode, stream: bool) -> Option<ChannelModeId> {
        self.channel_modes
            .iter()
            .copied()
            .find(|m| m.mode().mode == mode && (mode != OperationMode::Logic || m.mode().stream == stream))
    }

    pub fn vga_defaults(&self) -> impl Iterator<Item = &'static VgaDefault> {
        let id = self.vga_id;
        VGA_DEFAULTS.iter().filter(move |v| v.id == id)
    }
}

const LEGACY_MODES: [ChannelModeId; 9] = [
    Cm::Stream20x16,
    Cm::Stream25x12,
    Cm::Stream50x6,
    Cm::Stream100x3,
    Cm::Buffer100x16,
    Cm::Buffer200x8,
    Cm::Buffer400x4,
    Cm::Analog10x2,
    Cm::Dso200x2,
];

const PRO_MODES: [ChannelModeId; 7] = [
    Cm::Stream20x16,
    Cm::Stream25x12,
    Cm::Stream50x6,
    Cm::Stream100x3,
    Cm::Buffer100x16,
    Cm::Buffer200x8,
    Cm::Buffer400x4,
];

const U2BASIC_MODES: [ChannelModeId; 5] = [
    Cm::Stream20x16,
    Cm::Stream25x12,
    Cm::Stream50x6,
    Cm::Stream100x3,
    Cm::Buffer100x16,
];

const U3PRO16_HS_MODES: [ChannelModeId; 6] = [
    Cm::Stream20x16Dn2,
    Cm::Stream25x12Dn2,
    Cm::Stream50x6Dn2,
    Cm::Stream100x3Dn2,
    Cm::Buffer500x16,
    Cm::Buffer1000x8,
];

const U3PRO16_SS_MODES: [ChannelModeId; 6] = [
    Cm::Stream125x16Ch16,
    Cm::Stream250x12Ch16,
    Cm::Stream500x6,
    Cm::Stream1000x3,
    Cm::Buffer500x16,
    Cm::Buffer1000x8,
];

const U3PRO32_HS_MODES: [ChannelModeId; 7] = [
    Cm::Stream10x32Ch32,
    Cm::Stream20x16Ch32,
    Cm::Stream25x12Ch32,
    Cm::Stream50x6Ch32,
    Cm::Stream100x3Ch32,
    Cm::Buffer500x16,
    Cm::Buffer1000x8,
];

const U3PRO32_SS_MODES: [ChannelModeId; 8] = [
    Cm::Stream50x32,
    Cm::Stream100x30,
    Cm::Stream250x12,
    Cm::Stream500x6,
    Cm::Stream1000x3,
    Cm::Buffer250x32,
    Cm::Buffer500x16,
    Cm::Buffer1000x8,
];

const SCOPE_MODES: [ChannelModeId; 2] = [Cm::Analog10x2, Cm::Dso200x2];
const SCOPE_1G_MODES: [ChannelModeId; 2] = [Cm::Analog10x2Hw500, Cm::Dso1000x2];

const MB: u64 = 1024 * 1024;
const KB: u64 = 1024;
const LOGIC_MODES: u32 = 1 << 0;
const SCOPE_MODE_CAPS: u32 = (1 << 1) | (1 << 2);

const fn logic_profile(
    pid: u16,
    speed: UsbSpeed,
    model: &'static str,
    firmware: &'static str,
    bitstream: &'static str,
    feature_caps: u32,
    channel_modes: &'static [ChannelModeId],
    total_channels: u16,
    hw_depth: u64,
    samplerates: &'static [u64],
    default_channel_mode: ChannelModeId,
    half_samplerate: u64,
    quarter_samplerate: u64,
) -> DeviceProfile {
    DeviceProfile {
        vid: DSL_VID,
        pid,
        speed,
        family: DeviceFamily::DsLogic,
        model,
        firmware,
        fpga_bit33: bitstream,
        fpga_bit50: bitstream,
        mode_caps: LOGIC_MODES,
        feature_caps,
        channel_modes,
        total_channels,
        hw_depth,
        dso_depth: 0,
        vdivs: &[],
        samplerates,
        vga_id: 0,
        default_channel_mode,
        default_samplerate: mhz(1),
        default_limit: 1_000_000,
        default_pwmtrans: 0,
        default_pwmmargin: 0,
        ref_min: 0,
        ref_max: 0,
        default_comb_comp: 0,
        half_samplerate,
        quarter_samplerate,
    }
}

const fn scope_profile(
    pid: u16,
    speed: UsbSpeed,
    model: &'static str,
    firmware: &'static str,
    bitstream: &'static str,
    feature_caps: u32,
    channel_modes: &'static [ChannelModeId],
    hw_depth: u64,
    dso_depth: u64,
    samplerates: &'static [u64],
    vga_id: u8,
    default_limit: u64,
    pwmtrans: u16,
    ref_range: (u32, u32),
    comb_comp: u16,
) -> DeviceProfile {
    let default_channel_mode = channel_modes[1];
    DeviceProfile {
        vid: DSL_VID,
        pid,
        speed,
        family: DeviceFamily::DsCope,
        model,
        firmware,
        fpga_bit33: bitstream,
        fpga_bit50: bitstream,
        mode_caps: SCOPE_MODE_CAPS,
        feature_caps,
        channel_modes,
        total_channels: 2,
        hw_depth,
        dso_depth,
        vdivs: &VDIVS_10_TO_2000,
        samplerates,
        vga_id,
        default_channel_mode,
        default_samplerate: if feature_caps & caps::HMCAD1511 != 0 { mhz(500) } else { mhz(100) },
        default_limit,
        default_pwmtrans: pwmtrans,
        default_pwmmargin: if pwmtrans > 1024 { 1024 - 920 } else { 1024 - pwmtrans },
        ref_min: ref_range.0,
        ref_max: ref_range.1,
        default_comb_comp: comb_comp,
        half_samplerate: 0,
        quarter_samplerate: 0,
    }
}

pub static PROFILES: [DeviceProfile; 20] = [
    DeviceProfile {
        fpga_bit50: "DSLogic50.bin",
        dso_depth: 2 * 1024 * 1024,
        vdivs: &VDIVS_10_TO_2000,
        ..logic_profile(
            0x0001,
            UsbSpeed::High,
            "DSLogic",
            "DSLogic.fw",
            "DSLogic33.bin",
            caps::SEEP | caps::BUF,
            &LEGACY_MODES,
            16,
            256 * MB,
            &SAMPLERATES_400,
            Cm::Stream20x16,
            mhz(200),
            mhz(400),
        )
    },
    logic_profile(
        0x0003,
        UsbSpeed::High,
        "DSLogic Pro",
        "DSLogicPro.fw",
        "DSLogicPro.bin",
        caps::SEEP | caps::VTH | caps::BUF,
        &PRO_MODES,
        16,
        256 * MB,
        &SAMPLERATES_400,
        Cm::Stream20x16,
        mhz(200),
        mhz(400),
    ),
    logic_profile(
        0x0020,
        UsbSpeed::High,
        "DSLogic Plus",
        "DSLogicPlus.fw",
        "DSLogicPlus.bin",
        caps::VTH | caps::BUF,
        &PRO_MODES,
        16,
        256 * MB,
        &SAMPLERATES_400,
        Cm::Stream20x16,
        mhz(200),
        mhz(400),
    ),
    logic_profile(
        0x0021,
        UsbSpeed::High,
        "DSLogic Basic",
        "DSLogicBasic.fw",
        "DSLogicBasic.bin",
        caps::VTH,
        &PRO_MODES,
        16,
        256 * KB,
        &SAMPLERATES_400,
        Cm::Stream20x16,
        mhz(200),
        mhz(400),
    ),
    logic_profile(
        0x0029,
        UsbSpeed::High,
        "DSLogic U2Basic",
        "DSLogicU2Basic.fw",
        "DSLogicU2Basic.bin",
        caps::VTH | caps::BUF,
        &U2BASIC_MODES,
        16,
        64 * MB,
        &SAMPLERATES_100,
        Cm::Stream20x16,
        mhz(200),
        mhz(400),
    ),
    logic_profile(
        0x002A,
        UsbSpeed::High,
        "DSLogic U3Pro16",
        "DSLogicU3Pro16.fw",
        "DSLogicU3Pro16.bin",
        caps::VTH | caps::BUF | caps::USB30 | caps::ADF4360,
        &U3PRO16_HS_MODES,
        16,
        2048 * MB,
        &SAMPLERATES_1000,
        Cm::Stream20x16Dn2,
        mhz(500),
        ghz(1),
    ),
    logic_profile(
        0x002A,
        UsbSpeed::Super,
        "DSLogic U3Pro16",
        "DSLogicU3Pro16.fw",
        "DSLogicU3Pro16.bin",
        caps::VTH | caps::BUF | caps::USB30 | caps::ADF4360,
        &U3PRO16_SS_MODES,
        16,
        2048 * MB,
        &SAMPLERATES_1000,
        Cm::Stream125x16Ch16,
        mhz(500),
        ghz(1),
    ),
    logic_profile(
        0x002C,
        UsbSpeed::High,
        "DSLogic U3Pro32",
        "DSLogicU3Pro32.fw",
        "DSLogicU3Pro32.bin",
        caps::VTH | caps::BUF | caps::USB30 | caps::ADF4360 | caps::LA_CH32,
        &U3PRO32_HS_MODES,
        32,
        2048 * MB,
        &SAMPLERATES_1000,
        Cm::Stream10x32Ch32,
        mhz(500),
        ghz(1),
    ),
    logic_profile(
        0x002C,
        UsbSpeed::Super,
        "DSLogic U3Pro32",
        "DSLogicU3Pro32.fw",
        "DSLogicU3Pro32.bin",
        caps::VTH | caps::BUF | caps::USB30 | caps::ADF4360 | caps::LA_CH32,
        &U3PRO32_SS_MODES,
        32,
        2048 * MB,
        &SAMPLERATES_1000,
        Cm::Stream50x32,
        mhz(500),
        ghz(1),
    ),
    scope_profile(
        0x0002,
        UsbSpeed::High,
        "DSCope",
        "DSCope.fw",
        "DSCope.bin",
        caps::ZERO | caps::PREOFF | caps::SEEP | caps::BUF,
        &SCOPE_MODES,
        256 * MB,
        2 * 1024 * 1024,
        &SAMPLERATES_400,
        1,
        1_000_000,
        (129 << 8) + 167,
        (1, 255),
        0,
    ),
    scope_profile(
        0x0004,
        UsbSpeed::High,
        "DSCope20",
        "DSCope20.fw",
        "DSCope20.bin",
        caps::ZERO | caps::SEEP | caps::BUF,
        &SCOPE_MODES,
        256 * MB,
        2 * 1024 * 1024,
        &SAMPLERATES_400,
        2,
        1_000_000,
        920,
        (1, 255),
        0,
    ),
    scope_profile(
        0x0022,
        UsbSpeed::High,
        "DSCope B20",
        "DSCopeB20.fw",
        "DSCope20.bin",
        caps::ZERO | caps::BUF,
        &SCOPE_MODES,
        256 * MB,
        2 * 1024 * 1024,
        &SAMPLERATES_400,
        2,
        1_000_000,
        920,
        (1, 255),
        0,
    ),
    scope_profile(
        0x0023,
        UsbSpeed::High,
        "DSCope C20",
        "DSCopeC20.fw",
        "DSCopeC20P.bin",
        caps::ZERO | caps::BUF,
        &SCOPE_MODES,
        256 * MB,
        2 * 1024 * 1024,
        &SAMPLERATES_400,
        3,
        1_000_000,
        920,
        (1, 255),
        0,
    ),
    scope_profile(
        0x0024,
        UsbSpeed::High,
        "DSCope C20P",
        "DSCopeC20P.fw",
        "DSCopeC20P.bin",
        caps::ZERO | caps::BUF | caps::POGOPIN,
        &SCOPE_MODES,
        256 * MB,
        2 * 1024 * 1024,
        &SAMPLERATES_400,
        3,
        1_000_000,
        920,
        (1, 255),
        0,
    ),
    scope_profile(
        0x0025,
        UsbSpeed::High,
        "DSCope C20B",
        "DSCopeC20B.fw",
        "DSCopeC20B.bin",
        caps::ZERO,
        &SCOPE_MODES,
        256 * KB,
        20 * 1024,
        &SAMPLERATES_400,
        3,
        10 * 1024,
        920,
        (1, 255),
        0,
    ),
    scope_profile(
        0x0026,
        UsbSpeed::High,
        "DSCope U2B20",
        "DSCopeU2B20.fw",
        "DSCopeU2B20.bin",
        caps::ZERO | caps::AUTO_VGAIN,
        &SCOPE_MODES,
        256 * KB,
        20 * 1024,
        &SAMPLERATES_400,
        4,
        10 * 1024,
        930,
        (10, 245),
        22,
    ),
    scope_profile(
        0x0027,
        UsbSpeed::High,
        "DSCope U2P20",
        "DSCopeU2P20.fw",
        "DSCopeU2P20.bin",
        caps::ZERO | caps::BUF | caps::POGOPIN | caps::AUTO_VGAIN,
        &SCOPE_MODES,
        256 * MB,
        2 * 1024 * 1024,
        &SAMPLERATES_400,
        4,
        1_000_000,
        930,
        (10, 245),
        22,
    ),
    scope_profile(
        0x0028,
        UsbSpeed::High,
        "DSCope U2B100",
        "DSCopeU2B100.fw",
        "DSCopeU2B100.bin",
        caps::ZERO | caps::HMCAD1511 | caps::BW_20M,
        &SCOPE_1G_MODES,
        256 * KB,
        20 * 1024,
        &SAMPLERATES_1000,
        4,
        10 * 1024,
        835,
        (10, 245),
        60,
    ),
    scope_profile(
        0x002B,
        UsbSpeed::High,
        "DSCope U3P100",
        "DSCopeU3P100.fw",
        "DSCopeU3P100.bin",
        caps::ZERO | caps::POGOPIN | caps::FLASH | caps::USB30 | caps::HMCAD1511 | caps::BW_20M,
        &SCOPE_1G_MODES,
        2048 * MB,
        2 * 1024 * 1024,
        &SAMPLERATES_1000,
        5,
        1_000_000,
        780,
        (10, 245),
        60,
    ),
    scope_profile(
        0x002B,
        UsbSpeed::Super,
        "DSCope U3P100",
        "DSCopeU3P100.fw",
        "DSCopeU3P100.bin",
        caps::ZERO | caps::POGOPIN | caps::FLASH | caps::USB30 | caps::HMCAD1511 | caps::BW_20M,
        &SCOPE_1G_MODES,
        2048 * MB,
        2 * 1024 * 1024,
        &SAMPLERATES_1000,
        5,
        1_000_000,
        780,
        (10, 245),
        60,
    ),
];

/// Look up the profile for a USB id pair, preferring the entry that
/// matches the negotiated bus speed.
pub fn find_profile(vid: u16, pid: u16, super_speed: bool) -> Option<&'static DeviceProfile> {
    let wanted = if super_speed { UsbSpeed::Super } else { UsbSpeed::High };
    let mut candidates = PROFILES.iter().filter(|p| p.vid == vid && p.pid == pid);
    let first = candidates.clone().next();
    candidates.find(|p| p.speed == wanted).or(first)
}

/// Factory gain/offset defaults for one volts/div step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VgaDefault {
    pub id: u8,
    /// Volts/div in millivolts.
    pub key: u64,
    pub vgain: u64,
    pub preoff: u16,
    /// Offset used for channel 1.
    pub preoff_comp: u16,
}

const fn vga(id: u8, key: u64, vgain: u64, preoff: u16, preoff_comp: u16) -> VgaDefault {
    VgaDefault {
        id,
        key,
        vgain,
        preoff,
        preoff_comp,
    }
}

const PREOFF_V1: u16 = (32 << 10) + 558;
const PREOFF_COMP_V23: u16 = 1024 - 920 - 45;
const PREOFF_COMP_V45: u16 = 1024 - 900 - 60;

pub static VGA_DEFAULTS: [VgaDefault; 40] = [
    vga(1, 10, 0x16_2400, PREOFF_V1, PREOFF_V1),
    vga(1, 20, 0x14_C000, PREOFF_V1, PREOFF_V1),
    vga(1, 50, 0x12_E800, PREOFF_V1, PREOFF_V1),
    vga(1, 100, 0x11_8000, PREOFF_V1, PREOFF_V1),
    vga(1, 200, 0x10_2400, PREOFF_V1, PREOFF_V1),
    vga(1, 500, 0x2_E800, PREOFF_V1, PREOFF_V1),
    vga(1, 1000, 0x1_8000, PREOFF_V1, PREOFF_V1),
    vga(1, 2000, 0x2400, PREOFF_V1, PREOFF_V1),
    vga(2, 10, 0x1D_A800, 45, PREOFF_COMP_V23),
    vga(2, 20, 0x1A_7200, 45, PREOFF_COMP_V23),
    vga(2, 50, 0x16_4200, 45, PREOFF_COMP_V23),
    vga(2, 100, 0x13_1800, 45, PREOFF_COMP_V23),
    vga(2, 200, 0xB_D000, 45, PREOFF_COMP_V23),
    vga(2, 500, 0x7_AD00, 45, PREOFF_COMP_V23),
    vga(2, 1000, 0x4_8800, 45, PREOFF_COMP_V23),
    vga(2, 2000, 0x1_2000, 45, PREOFF_COMP_V23),
    vga(3, 10, 0x1C_5C00, 45, PREOFF_COMP_V23),
    vga(3, 20, 0x19_EB00, 45, PREOFF_COMP_V23),
    vga(3, 50, 0x16_AE00, 45, PREOFF_COMP_V23),
    vga(3, 100, 0x14_3D00, 45, PREOFF_COMP_V23),
    vga(3, 200, 0xB_1000, 45, PREOFF_COMP_V23),
    vga(3, 500, 0x7_F000, 45, PREOFF_COMP_V23),
    vga(3, 1000, 0x5_7200, 45, PREOFF_COMP_V23),
    vga(3, 2000, 0x2_DD00, 45, PREOFF_COMP_V23),
    vga(4, 10, 0x1C_6C00, 60, PREOFF_COMP_V45),
    vga(4, 20, 0x19_E000, 60, PREOFF_COMP_V45),
    vga(4, 50, 0x16_A800, 60, PREOFF_COMP_V45),
    vga(4, 100, 0x14_2800, 60, PREOFF_COMP_V45),
    vga(4, 200, 0xC_7F00, 60, PREOFF_COMP_V45),
    vga(4, 500, 0x9_4000, 60, PREOFF_COMP_V45),
    vga(4, 1000, 0x6_CF00, 60, PREOFF_COMP_V45),
    vga(4, 2000, 0x4_4F00, 60, PREOFF_COMP_V45),
    vga(5, 10, 0x1C_3400, 60, PREOFF_COMP_V45),
    vga(5, 20, 0x19_BD00, 60, PREOFF_COMP_V45),
    vga(5, 50, 0x16_7400, 60, PREOFF_COMP_V45),
    vga(5, 100, 0x13_F300, 60, PREOFF_COMP_V45),
    vga(5, 200, 0xC_4F00, 60, PREOFF_COMP_V45),
    vga(5, 500, 0x9_1B00, 60, PREOFF_COMP_V45),
    vga(5, 1000, 0x6_9D00, 60, PREOFF_COMP_V45),
    vga(5, 2000, 0x4_1D00, 60, PREOFF_COMP_V45),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_mode_table_is_indexed_by_id() {
        for (i, mode) in CHANNEL_MODES.iter().enumerate() {
            assert_eq!(mode.id as usize, i);
        }
        assert_eq!(ChannelModeId::Dso200x2.mode().mode, OperationMode::Oscilloscope);
        assert_eq!(ChannelModeId::Stream1000x3.mode().num, 8);
    }

    #[test]
    fn test_find_profile_prefers_bus_speed() {
        let hs = find_profile(DSL_VID, 0x002A, false).unwrap();
        assert_eq!(hs.speed, UsbSpeed::High);
        assert_eq!(hs.default_channel_mode, ChannelModeId::Stream20x16Dn2);

        let ss = find_profile(DSL_VID, 0x002A, true).unwrap();
        assert_eq!(ss.speed, UsbSpeed::Super);
        assert_eq!(ss.default_channel_mode, ChannelModeId::Stream125x16Ch16);

        // High-speed-only model still resolves on a SuperSpeed port.
        let dscope = find_profile(DSL_VID, 0x0002, true).unwrap();
        assert_eq!(dscope.model, "DSCope");
        assert!(find_profile(0x1234, 0x0001, false).is_none());
    }

    #[test]
    fn test_profile_capabilities() {
        let legacy = find_profile(DSL_VID, 0x0001, false).unwrap();
        assert!(legacy.uses_legacy_protocol());
        assert!(legacy.supports_mode(OperationMode::Logic));
        assert!(!legacy.supports_mode(OperationMode::Oscilloscope));
        assert_eq!(legacy.fpga_bit50, "DSLogic50.bin");

        let scope = find_profile(DSL_VID, 0x0002, false).unwrap();
        assert!(!scope.uses_legacy_protocol());
        assert!(scope.has_feature(caps::PREOFF));
        assert_eq!(scope.default_channel_mode, ChannelModeId::Dso200x2);
        assert_eq!(scope.default_pwmmargin, 104);
        assert_eq!(
            scope.channel_mode_for(OperationMode::Analog, true),
            Some(ChannelModeId::Analog10x2)
        );
    }

    #[test]
    fn test_vga_defaults_cover_every_vdiv() {
        let scope = find_profile(DSL_VID, 0x0028, false).unwrap();
        let keys: Vec<u64> = scope.vga_defaults().map(|v| v.key).collect();
        assert_eq!(keys, VDIVS_10_TO_2000.to_vec());
        assert_eq!(scope.vga_defaults().next().unwrap().vgain, 0x1C_6C00);
    }
}
