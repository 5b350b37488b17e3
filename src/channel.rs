use crate::profile::{ChannelMode, DeviceProfile, OperationMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Logic,
    Oscilloscope,
    Analog,
}

impl ChannelKind {
    pub fn for_mode(mode: OperationMode) -> Self {
        match mode {
            OperationMode::Logic => ChannelKind::Logic,
            OperationMode::Oscilloscope => ChannelKind::Oscilloscope,
            OperationMode::Analog => ChannelKind::Analog,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Coupling {
    #[default]
    Dc,
    Ac,
    Ground,
}

impl Coupling {
    pub fn as_str(&self) -> &'static str {
        match self {
            Coupling::Dc => "DC",
            Coupling::Ac => "AC",
            Coupling::Ground => "GND",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "DC" => Some(Coupling::Dc),
            "AC" => Some(Coupling::Ac),
            "GND" => Some(Coupling::Ground),
            _ => None,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Coupling::Dc),
            1 => Some(Coupling::Ac),
            2 => Some(Coupling::Ground),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Coupling::Dc => 0,
            Coupling::Ac => 1,
            Coupling::Ground => 2,
        }
    }
}

/// Gain and offset calibration of one volts/div step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VgaEntry {
    /// Volts/div in millivolts.
    pub key: u64,
    pub vgain: u64,
    pub preoff: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub index: u16,
    pub kind: ChannelKind,
    pub enabled: bool,
    pub name: String,
    /// ADC resolution.
    pub bits: u8,
    pub vdiv: u64,
    pub vfactor: u64,
    /// Vertical position code, mid-scale by default.
    pub offset: u16,
    /// Offset code driven while calibrating.
    pub zero_offset: u16,
    pub hw_offset: u8,
    pub coupling: Coupling,
    pub trig_value: u8,
    pub vpos_trans: u16,
    pub comb_diff_top: i8,
    pub comb_diff_bom: i8,
    pub comb_comp: u8,
    /// FPGA lane gain trim: low byte boosts, high byte cuts one lane each.
    pub digi_fgain: u16,
    /// ADC fine gain of the four lanes in dual-channel operation.
    pub cali_fgain: [f64; 4],
    /// ADC fine gain of the four lanes when one channel uses all of them.
    pub cali_comb_fgain: [f64; 4],
    pub vga: Vec<VgaEntry>,
}

impl Channel {
    pub fn new(index: u16, mode: &ChannelMode, profile: &DeviceProfile) -> Self {
        let bits = mode.unit_bits;
        let mid = Self::mid_code(bits);
        let vga = profile
            .vdivs
            .iter()
            .map(|&key| {
                let default = profile.vga_defaults().find(|v| v.key == key);
                VgaEntry {
                    key,
                    vgain: default.map_or(0, |v| v.vgain),
                    preoff: default.map_or(0, |v| v.preoff),
                }
            })
            .collect();

        Self {
            index,
            kind: ChannelKind::for_mode(mode.mode),
            enabled: true,
            name: index.to_string(),
            bits,
            vdiv: 1000,
            vfactor: 1,
            offset: mid,
            zero_offset: mid,
            hw_offset: 0,
            coupling: Coupling::Dc,
            trig_value: mid as u8,
            vpos_trans: profile.default_pwmtrans,
            comb_diff_top: 0,
            comb_diff_bom: 0,
            comb_comp: profile.default_comb_comp as u8,
            digi_fgain: 0,
            cali_fgain: [1.0; 4],
            cali_comb_fgain: [1.0; 4],
            vga,
        }
    }

    fn mid_code(bits: u8) -> u16 {
        if bits == 0 { 0 } else { 1 << (bits.min(16) - 1) }
    }

    /// Mid-scale ADC code.
    pub fn offset_mid(&self) -> u16 {
        Self::mid_code(self.bits)
    }

    /// Largest ADC code.
    pub fn offset_max(&self) -> u16 {
        ((1u32 << self.bits.min(16)) - 1) as u16
    }

    pub fn vga_entry(&self, vdiv: u64) -> Option<&VgaEntry> {
        self.vga.iter().find(|v| v.key == vdiv)
    }

    pub fn vga_entry_mut(&mut self, vdiv: u64) -> Option<&mut VgaEntry> {
        self.vga.iter_mut().find(|v| v.key == vdiv)
    }

    /// Gain of the current volts/div step, 0 when the step is unknown.
    pub fn vgain(&self) -> u64 {
        self.vga_entry(self.vdiv).map_or(0, |v| v.vgain)
    }

    pub fn preoff(&self) -> u16 {
        self.vga_entry(self.vdiv).map_or(0, |v| v.preoff)
    }

    /// Factory pre-offset of the current volts/div step. The second channel
    /// has its own compensation value.
    pub fn default_preoff(&self, profile: &DeviceProfile) -> u16 {
        profile
            .vga_defaults()
            .find(|v| v.key == self.vdiv)
            .map_or(0, |v| if self.index == 1 { v.preoff_comp } else { v.preoff })
    }

    /// Full-scale range of the current setting, in volts.
    pub fn map_range(&self) -> (f64, f64) {
        let half = (self.vdiv * self.vfactor) as f64 * 10.0 / 2000.0;
        (-half, half)
    }
}
