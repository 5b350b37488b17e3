//! Trigger stage tables and their compilation into hardware match words.
//!
//! A stage holds two comparison slots. Each slot is a string of per-channel
//! symbols, written most-significant channel first:
//!
//! | symbol | meaning      | mask | value | edge |
//! |--------|--------------|------|-------|------|
//! | `X`    | don't care   | 1    | 0     | 0    |
//! | `0`    | low level    | 0    | 0     | 0    |
//! | `1`    | high level   | 0    | 1     | 0    |
//! | `R`    | rising edge  | 0    | 1     | 1    |
//! | `F`    | falling edge | 0    | 0     | 1    |
//! | `C`    | any edge     | 1    | 0     | 1    |

pub const TRIGGER_STAGES: usize = 16;
/// Channels covered by one set of match words.
pub const TRIGGER_CHANNELS: usize = 16;
pub const MAX_TRIGGER_CHANNELS: usize = 32;
/// Stage carrying the data value of a serial trigger.
pub const SERIAL_DATA_STAGE: usize = 3;
const SIMPLE_STAGE: usize = TRIGGER_STAGES;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("Invalid trigger symbol '{0}'")]
    InvalidSymbol(char),

    #[error("Expected {expected} trigger symbols, got {actual}")]
    WrongLength { expected: usize, actual: usize },

    #[error("Trigger stage {0} out of range")]
    StageOutOfRange(usize),

    #[error("Trigger channel {0} out of range")]
    ChannelOutOfRange(usize),

    #[error("Trigger position {0}% out of range")]
    PositionOutOfRange(u8),

    #[error("Serial data width {0} out of range (1..=16)")]
    SerialWidth(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerSymbol {
    #[default]
    DontCare,
    Low,
    High,
    Rising,
    Falling,
    AnyEdge,
}

impl TriggerSymbol {
    pub fn from_char(c: char) -> Result<Self, TriggerError> {
        match c.to_ascii_uppercase() {
            'X' => Ok(TriggerSymbol::DontCare),
            '0' => Ok(TriggerSymbol::Low),
            '1' => Ok(TriggerSymbol::High),
            'R' => Ok(TriggerSymbol::Rising),
            'F' => Ok(TriggerSymbol::Falling),
            'C' => Ok(TriggerSymbol::AnyEdge),
            other => Err(TriggerError::InvalidSymbol(other)),
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            TriggerSymbol::DontCare => 'X',
            TriggerSymbol::Low => '0',
            TriggerSymbol::High => '1',
            TriggerSymbol::Rising => 'R',
            TriggerSymbol::Falling => 'F',
            TriggerSymbol::AnyEdge => 'C',
        }
    }

    pub fn mask_bit(&self) -> bool {
        matches!(self, TriggerSymbol::DontCare | TriggerSymbol::AnyEdge)
    }

    pub fn value_bit(&self) -> bool {
        matches!(self, TriggerSymbol::High | TriggerSymbol::Rising)
    }

    pub fn edge_bit(&self) -> bool {
        matches!(
            self,
            TriggerSymbol::Rising | TriggerSymbol::Falling | TriggerSymbol::AnyEdge
        )
    }
}

/// Parse a symbol string, ignoring whitespace. The first symbol maps to
/// the highest channel.
pub fn parse_symbols(text: &str, channels: usize) -> Result<Vec<TriggerSymbol>, TriggerError> {
    let symbols = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(TriggerSymbol::from_char)
        .collect::<Result<Vec<_>, _>>()?;
    if symbols.len() != channels {
        return Err(TriggerError::WrongLength {
            expected: channels,
            actual: symbols.len(),
        });
    }
    Ok(symbols)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    #[default]
    Simple,
    Advanced,
    Serial,
}

impl TriggerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::Simple => "simple",
            TriggerMode::Advanced => "advanced",
            TriggerMode::Serial => "serial",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "simple" => Some(TriggerMode::Simple),
            "advanced" => Some(TriggerMode::Advanced),
            "serial" => Some(TriggerMode::Serial),
            _ => None,
        }
    }
}

/// Effective state of the trigger engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Disabled,
    SimpleTrigger,
    AdvancedTrigger,
    SerialTrigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Combinator {
    Or,
    #[default]
    And,
}

/// How a stage's two slots combine, and whether the match must hold over
/// contiguous samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageLogic {
    pub combinator: Combinator,
    pub contiguous: bool,
}

impl StageLogic {
    pub fn code(&self) -> u16 {
        (u16::from(self.contiguous) << 1) + u16::from(self.combinator == Combinator::And)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerStage {
    /// Indexed by channel number.
    pub slot0: [TriggerSymbol; MAX_TRIGGER_CHANNELS],
    pub slot1: [TriggerSymbol; MAX_TRIGGER_CHANNELS],
    pub logic: StageLogic,
    pub inv0: bool,
    pub inv1: bool,
    pub count0: u32,
    pub count1: u32,
}

impl Default for TriggerStage {
    fn default() -> Self {
        Self {
            slot0: [TriggerSymbol::DontCare; MAX_TRIGGER_CHANNELS],
            slot1: [TriggerSymbol::DontCare; MAX_TRIGGER_CHANNELS],
            logic: StageLogic::default(),
            inv0: false,
            inv1: false,
            count0: 0,
            count1: 0,
        }
    }
}

/// Replication applied to match words when the hardware packs several
/// narrow samples into one 16-bit word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NarrowPacking {
    pub quarter: bool,
    pub half: bool,
}

impl NarrowPacking {
    fn apply(self, word: u16) -> u16 {
        let word = u32::from(word);
        let packed = if self.quarter {
            let nibble = word & 0x000F;
            (nibble << 12) | (nibble << 8) | (nibble << 4) | nibble
        } else if self.half {
            let byte = word & 0x00FF;
            (byte << 8) | byte
        } else {
            word
        };
        packed as u16
    }
}

/// Match words for one group of 16 channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageWords {
    pub mask0: [u16; TRIGGER_STAGES],
    pub mask1: [u16; TRIGGER_STAGES],
    pub value0: [u16; TRIGGER_STAGES],
    pub value1: [u16; TRIGGER_STAGES],
    pub edge0: [u16; TRIGGER_STAGES],
    pub edge1: [u16; TRIGGER_STAGES],
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompiledTrigger {
    /// Channels 0..16.
    pub words: StageWords,
    /// Channels 16..32.
    pub ext_words: StageWords,
    pub logic0: [u16; TRIGGER_STAGES],
    pub logic1: [u16; TRIGGER_STAGES],
    pub count: [u32; TRIGGER_STAGES],
}

/// Serial (clocked shift-register) trigger description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialTrigger {
    pub start: String,
    pub stop: String,
    pub clock: String,
    pub data_channel: usize,
    /// Data pattern, 16 symbols, most significant bit first.
    pub value: String,
    pub bits: u8,
}

/// Owned trigger configuration, snapshotted into the setting blob when an
/// acquisition is armed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerConfig {
    pub enabled: bool,
    pub mode: TriggerMode,
    position: u8,
    /// Number of configured stages minus one.
    stages: u16,
    table: Vec<TriggerStage>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerConfig {
    pub fn new() -> Self {
        Self {
            enabled: false,
            mode: TriggerMode::Simple,
            position: 0,
            stages: 0,
            table: vec![TriggerStage::default(); TRIGGER_STAGES + 1],
        }
    }

    /// Start a single-stage trigger on per-channel conditions.
    pub fn simple() -> SimpleTriggerBuilder {
        SimpleTriggerBuilder::new()
    }

    pub fn state(&self) -> TriggerState {
        if !self.enabled {
            return TriggerState::Disabled;
        }
        match self.mode {
            TriggerMode::Simple => TriggerState::SimpleTrigger,
            TriggerMode::Advanced => TriggerState::AdvancedTrigger,
            TriggerMode::Serial => TriggerState::SerialTrigger,
        }
    }

    pub fn position(&self) -> u8 {
        self.position
    }

    pub fn set_position(&mut self, percent: u8) -> Result<(), TriggerError> {
        if percent > 100 {
            return Err(TriggerError::PositionOutOfRange(percent));
        }
        self.position = percent;
        Ok(())
    }

    pub fn stages(&self) -> u16 {
        self.stages
    }

    /// Set the hardware stage field (configured stage count minus one).
    pub fn set_stages(&mut self, stages: u16) -> Result<(), TriggerError> {
        if usize::from(stages) >= TRIGGER_STAGES {
            return Err(TriggerError::StageOutOfRange(usize::from(stages)));
        }
        self.stages = stages;
        Ok(())
    }

    pub fn stage(&self, stage: usize) -> Option<&TriggerStage> {
        self.table.get(stage)
    }

    fn stage_mut(&mut self, stage: usize) -> Result<&mut TriggerStage, TriggerError> {
        if stage >= TRIGGER_STAGES {
            return Err(TriggerError::StageOutOfRange(stage));
        }
        Ok(&mut self.table[stage])
    }

    /// Set both slots of an advanced stage from symbol strings with one
    /// symbol per channel.
    pub fn set_stage_value(
        &mut self,
        stage: usize,
        channels: usize,
        value0: &str,
        value1: &str,
    ) -> Result<(), TriggerError> {
        if channels > MAX_TRIGGER_CHANNELS {
            return Err(TriggerError::ChannelOutOfRange(channels));
        }
        let slot0 = parse_symbols(value0, channels)?;
        let slot1 = parse_symbols(value1, channels)?;
        let entry = self.stage_mut(stage)?;
        for (j, (s0, s1)) in slot0.into_iter().zip(slot1).enumerate() {
            entry.slot0[channels - j - 1] = s0;
            entry.slot1[channels - j - 1] = s1;
        }
        Ok(())
    }

    pub fn set_stage_logic(&mut self, stage: usize, logic: StageLogic) -> Result<(), TriggerError> {
        self.stage_mut(stage)?.logic = logic;
        Ok(())
    }

    pub fn set_stage_inv(&mut self, stage: usize, inv0: bool, inv1: bool) -> Result<(), TriggerError> {
        let entry = self.stage_mut(stage)?;
        entry.inv0 = inv0;
        entry.inv1 = inv1;
        Ok(())
    }

    pub fn set_stage_count(&mut self, stage: usize, count0: u32, count1: u32) -> Result<(), TriggerError> {
        let entry = self.stage_mut(stage)?;
        entry.count0 = count0;
        entry.count1 = count1;
        Ok(())
    }

    /// Set the simple-mode condition of one channel.
    pub fn set_channel_symbol(
        &mut self,
        channel: usize,
        slot0: TriggerSymbol,
        slot1: TriggerSymbol,
    ) -> Result<(), TriggerError> {
        if channel >= MAX_TRIGGER_CHANNELS {
            return Err(TriggerError::ChannelOutOfRange(channel));
        }
        let entry = &mut self.table[SIMPLE_STAGE];
        entry.slot0[channel] = slot0;
        entry.slot1[channel] = slot1;
        Ok(())
    }

    pub fn channel_symbol(&self, channel: usize) -> Option<TriggerSymbol> {
        self.table[SIMPLE_STAGE].slot0.get(channel).copied()
    }

    /// Lay out a serial trigger over stages 0..=3.
    pub fn set_serial(&mut self, channels: usize, serial: &SerialTrigger) -> Result<(), TriggerError> {
        if serial.bits == 0 || usize::from(serial.bits) > TRIGGER_CHANNELS {
            return Err(TriggerError::SerialWidth(serial.bits));
        }
        if serial.data_channel >= channels {
            return Err(TriggerError::ChannelOutOfRange(serial.data_channel));
        }
        self.mode = TriggerMode::Serial;
        self.enabled = true;
        self.set_stage_value(0, channels, &serial.start, &serial.stop)?;
        let dont_care = "X".repeat(channels);
        self.set_stage_value(1, channels, &serial.clock, &dont_care)?;
        self.set_stage_count(1, 1, 0)?;

        let entry = self.stage_mut(2)?;
        entry.slot0 = [TriggerSymbol::DontCare; MAX_TRIGGER_CHANNELS];
        entry.slot1 = [TriggerSymbol::DontCare; MAX_TRIGGER_CHANNELS];
        entry.slot0[serial.data_channel] = TriggerSymbol::Low;

        let dont_care = "X".repeat(TRIGGER_CHANNELS);
        self.set_stage_value(SERIAL_DATA_STAGE, TRIGGER_CHANNELS, &serial.value, &dont_care)?;
        self.set_stage_count(SERIAL_DATA_STAGE, u32::from(serial.bits) - 1, 0)?;
        self.stages = SERIAL_DATA_STAGE as u16;
        Ok(())
    }

    /// Fold channels `lsc..=msc` of one slot into a word, highest channel
    /// ending up in the top bit.
    fn fold(
        slot: &[TriggerSymbol; MAX_TRIGGER_CHANNELS],
        msc: usize,
        lsc: usize,
        bit: fn(&TriggerSymbol) -> bool,
    ) -> u16 {
        (lsc..=msc)
            .rev()
            .fold(0u16, |acc, i| (acc << 1) | u16::from(bit(&slot[i])))
    }

    fn stage_words(&self, stage: usize, words: &mut StageWords, slot: usize, packing: NarrowPacking, lsc: usize) {
        let entry = &self.table[stage];
        let msc = lsc + TRIGGER_CHANNELS - 1;
        words.mask0[slot] = packing.apply(Self::fold(&entry.slot0, msc, lsc, TriggerSymbol::mask_bit));
        words.mask1[slot] = packing.apply(Self::fold(&entry.slot1, msc, lsc, TriggerSymbol::mask_bit));
        words.value0[slot] = packing.apply(Self::fold(&entry.slot0, msc, lsc, TriggerSymbol::value_bit));
        words.value1[slot] = packing.apply(Self::fold(&entry.slot1, msc, lsc, TriggerSymbol::value_bit));
        words.edge0[slot] = packing.apply(Self::fold(&entry.slot0, msc, lsc, TriggerSymbol::edge_bit));
        words.edge1[slot] = packing.apply(Self::fold(&entry.slot1, msc, lsc, TriggerSymbol::edge_bit));
    }

    fn logic_word(entry: &TriggerStage, inv: bool) -> u16 {
        (entry.logic.code() << 1) + u16::from(inv)
    }

    /// Compile the stage table into hardware match words.
    pub fn compile(&self, packing: NarrowPacking) -> CompiledTrigger {
        let mut out = CompiledTrigger::default();

        if self.mode == TriggerMode::Simple {
            self.stage_words(SIMPLE_STAGE, &mut out.words, 0, packing, 0);
            self.stage_words(SIMPLE_STAGE, &mut out.ext_words, 0, packing, TRIGGER_CHANNELS);
            let entry = &self.table[SIMPLE_STAGE];
            out.logic0[0] = Self::logic_word(entry, entry.inv0);
            out.logic1[0] = Self::logic_word(entry, entry.inv1);
            out.count[0] = entry.count0;

            for words in [&mut out.words, &mut out.ext_words] {
                for i in 1..TRIGGER_STAGES {
                    words.mask0[i] = 0xFFFF;
                    words.mask1[i] = 0xFFFF;
                }
            }
            for i in 1..TRIGGER_STAGES {
                out.logic0[i] = 2;
                out.logic1[i] = 2;
            }
            return out;
        }

        for i in 0..TRIGGER_STAGES {
            let packing = if self.mode == TriggerMode::Serial && i == SERIAL_DATA_STAGE {
                NarrowPacking::default()
            } else {
                packing
            };
            self.stage_words(i, &mut out.words, i, packing, 0);
            self.stage_words(i, &mut out.ext_words, i, packing, TRIGGER_CHANNELS);
            let entry = &self.table[i];
            out.logic0[i] = Self::logic_word(entry, entry.inv0);
            out.logic1[i] = Self::logic_word(entry, entry.inv1);
            out.count[i] = entry.count0;
        }
        out
    }

    /// Per-stage `(mask, value)` pairs for the software matcher, where a set
    /// mask bit means the channel must match. Only level symbols take part.
    pub fn software_stages(&self) -> Vec<(u16, u16)> {
        if !self.enabled {
            return Vec::new();
        }
        let (first, count) = match self.mode {
            TriggerMode::Simple => (SIMPLE_STAGE, 1),
            TriggerMode::Advanced | TriggerMode::Serial => (0, usize::from(self.stages) + 1),
        };
        self.table[first..first + count]
            .iter()
            .map(|stage| {
                let mut mask = 0u16;
                let mut value = 0u16;
                for (ch, symbol) in stage.slot0.iter().take(TRIGGER_CHANNELS).enumerate() {
                    match symbol {
                        TriggerSymbol::Low => mask |= 1 << ch,
                        TriggerSymbol::High => {
                            mask |= 1 << ch;
                            value |= 1 << ch;
                        }
                        _ => {}
                    }
                }
                (mask, value)
            })
            // the sequence ends at the first empty stage
            .take_while(|(mask, _)| *mask != 0)
            .collect()
    }
}

/// Builder for a single-stage trigger on per-channel conditions.
#[derive(Debug)]
pub struct SimpleTriggerBuilder {
    config: TriggerConfig,
}

impl SimpleTriggerBuilder {
    pub fn new() -> Self {
        let mut config = TriggerConfig::new();
        config.enabled = true;
        Self { config }
    }

    pub fn channel(mut self, channel: usize, symbol: TriggerSymbol) -> Result<Self, TriggerError> {
        self.config.set_channel_symbol(channel, symbol, TriggerSymbol::DontCare)?;
        Ok(self)
    }

    pub fn rising(self, channel: usize) -> Result<Self, TriggerError> {
        self.channel(channel, TriggerSymbol::Rising)
    }

    pub fn falling(self, channel: usize) -> Result<Self, TriggerError> {
        self.channel(channel, TriggerSymbol::Falling)
    }

    pub fn high(self, channel: usize) -> Result<Self, TriggerError> {
        self.channel(channel, TriggerSymbol::High)
    }

    pub fn low(self, channel: usize) -> Result<Self, TriggerError> {
        self.channel(channel, TriggerSymbol::Low)
    }

    pub fn at_position(mut self, percent: u8) -> Result<TriggerConfig, TriggerError> {
        self.config.set_position(percent)?;
        Ok(self.config)
    }

    pub fn build(self) -> TriggerConfig {
        self.config
    }
}

impl Default for SimpleTriggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
