//! Capture archives: a `version` entry, an INI style `header` entry and
//! per-channel data chunks.
//!
//! Logic captures are stored bit-packed per channel in blocks of
//! [`LOGIC_BLOCK_SAMPLES`] samples under `L-<channel>/<block>`; oscilloscope
//! captures hold one 8-bit chunk per channel under `O-<channel>/0`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::channel::{Channel, Coupling};
use crate::profile::OperationMode;

pub const ARCHIVE_VERSION: u32 = 2;
pub const VERSION_ENTRY: &str = "version";
pub const HEADER_ENTRY: &str = "header";
pub const CAPTURE_FILE: &str = "data";
/// Samples per logic chunk.
pub const LOGIC_BLOCK_SAMPLES: u64 = 1 << 21;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive has no '{0}' entry")]
    MissingEntry(String),

    #[error("Header is missing '{0}'")]
    MissingKey(&'static str),

    #[error("Bad value for '{key}': {value}")]
    BadValue { key: String, value: String },

    #[error("Unsupported archive version {0}")]
    UnsupportedVersion(u32),
}

impl ArchiveError {
    fn bad(key: &str, value: &str) -> Self {
        ArchiveError::BadValue {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// Numeric device mode as stored in headers.
fn mode_code(mode: OperationMode) -> u8 {
    match mode {
        OperationMode::Logic => 0,
        OperationMode::Oscilloscope => 1,
        OperationMode::Analog => 2,
    }
}

fn mode_from_code(code: u8) -> Option<OperationMode> {
    match code {
        0 => Some(OperationMode::Logic),
        1 => Some(OperationMode::Oscilloscope),
        2 => Some(OperationMode::Analog),
        _ => None,
    }
}

/// `1 MHz`, `2.5 kHz`, `10 Hz`.
pub fn format_samplerate(rate: u64) -> String {
    const UNITS: [(u64, &str); 3] = [(1_000_000_000, "G"), (1_000_000, "M"), (1_000, "k")];
    for (scale, prefix) in UNITS {
        if rate >= scale {
            let whole = rate / scale;
            let frac = rate % scale;
            if frac == 0 {
                return format!("{whole} {prefix}Hz");
            }
            let digits = scale.ilog10() as usize;
            let frac = format!("{frac:0digits$}");
            return format!("{whole}.{} {prefix}Hz", frac.trim_end_matches('0'));
        }
    }
    format!("{rate} Hz")
}

/// Inverse of [`format_samplerate`]; the unit and the space are optional.
pub fn parse_samplerate(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, suffix) = text.split_at(split);
    let suffix = suffix.trim();
    let suffix = suffix
        .strip_suffix("Hz")
        .or_else(|| suffix.strip_suffix("hz"))
        .unwrap_or(suffix)
        .trim();
    let scale: u64 = match suffix {
        "" => 1,
        "k" | "K" => 1_000,
        "m" | "M" => 1_000_000,
        "g" | "G" => 1_000_000_000,
        _ => return None,
    };
    let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
    let mut value = whole.parse::<u64>().ok()?.checked_mul(scale)?;
    if !frac.is_empty() {
        let digits = scale.ilog10() as usize;
        if frac.len() > digits || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let padded = format!("{frac:0<digits$}");
        value += padded.parse::<u64>().ok()?;
    }
    Some(value)
}

pub fn logic_chunk_name(channel: u16, block: u64) -> String {
    format!("L-{channel}/{block}")
}

pub fn scope_chunk_name(channel: u16) -> String {
    format!("O-{channel}/0")
}

/// Front-end state of an oscilloscope channel at capture time.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeEntry {
    pub enabled: bool,
    pub coupling: Coupling,
    pub vdiv: u64,
    pub vfactor: u64,
    pub offset: u16,
    pub trig_value: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEntry {
    pub index: u16,
    pub name: String,
    pub trigger: Option<String>,
    pub scope: Option<ScopeEntry>,
}

impl ChannelEntry {
    pub fn from_channel(ch: &Channel, mode: OperationMode) -> Self {
        let scope = (mode != OperationMode::Logic).then(|| ScopeEntry {
            enabled: ch.enabled,
            coupling: ch.coupling,
            vdiv: ch.vdiv,
            vfactor: ch.vfactor,
            offset: ch.offset,
            trig_value: ch.trig_value,
        });
        Self {
            index: ch.index,
            name: ch.name.clone(),
            trigger: None,
            scope,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionHeader {
    pub version: u32,
    pub driver: String,
    pub mode: OperationMode,
    pub capturefile: String,
    pub total_samples: u64,
    pub total_channels: u16,
    pub total_blocks: u64,
    pub samplerate: u64,
    /// Seconds since the Unix epoch.
    pub trigger_time: i64,
    pub trigger_pos: u64,
    pub unit_bits: u8,
    pub entries: Vec<ChannelEntry>,
}

impl SessionHeader {
    pub fn new(driver: &str, mode: OperationMode, samplerate: u64, total_samples: u64) -> Self {
        Self {
            version: ARCHIVE_VERSION,
            driver: driver.to_string(),
            mode,
            capturefile: CAPTURE_FILE.to_string(),
            total_samples,
            total_channels: 0,
            total_blocks: 1,
            samplerate,
            trigger_time: 0,
            trigger_pos: 0,
            unit_bits: if mode == OperationMode::Logic { 1 } else { 8 },
            entries: Vec::new(),
        }
    }

    /// Record `channels`; only enabled channels get an entry in logic
    /// mode.
    pub fn with_channels(mut self, channels: &[Channel]) -> Self {
        self.total_channels = channels.len() as u16;
        self.entries = channels
            .iter()
            .filter(|c| c.enabled || self.mode != OperationMode::Logic)
            .map(|c| ChannelEntry::from_channel(c, self.mode))
            .collect();
        self
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[version]");
        let _ = writeln!(out, "version = {}", self.version);
        let _ = writeln!(out, "[header]");
        let _ = writeln!(out, "driver = {}", self.driver);
        let _ = writeln!(out, "device mode = {}", mode_code(self.mode));
        let _ = writeln!(out, "capturefile = {}", self.capturefile);
        let _ = writeln!(out, "total samples = {}", self.total_samples);
        let _ = writeln!(out, "total probes = {}", self.total_channels);
        let _ = writeln!(out, "total blocks = {}", self.total_blocks);
        let _ = writeln!(out, "samplerate = {}", format_samplerate(self.samplerate));
        let _ = writeln!(out, "bits = {}", self.unit_bits);
        let _ = writeln!(out, "trigger time = {}", self.trigger_time);
        let _ = writeln!(out, "trigger pos = {}", self.trigger_pos);
        for entry in &self.entries {
            let i = entry.index;
            let _ = writeln!(out, "probe{i} = {}", entry.name);
            if let Some(trigger) = &entry.trigger {
                let _ = writeln!(out, "trigger{i} = {trigger}");
            }
            if let Some(s) = &entry.scope {
                let _ = writeln!(out, "enable{i} = {}", u8::from(s.enabled));
                let _ = writeln!(out, "coupling{i} = {}", s.coupling.code());
                let _ = writeln!(out, "vDiv{i} = {}", s.vdiv);
                let _ = writeln!(out, "vFactor{i} = {}", s.vfactor);
                let _ = writeln!(out, "vOffset{i} = {}", s.offset);
                let _ = writeln!(out, "vTrig{i} = {}", s.trig_value);
            }
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self, ArchiveError> {
        let mut section = "";
        let mut version = None;
        let mut fields: BTreeMap<&str, &str> = BTreeMap::new();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = name;
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ArchiveError::bad(section, line));
            };
            let (key, value) = (key.trim(), value.trim());
            match section {
                "version" if key == "version" => {
                    version = Some(value.parse::<u32>().map_err(|_| ArchiveError::bad(key, value))?);
                }
                s if s.starts_with("header") => {
                    fields.insert(key, value);
                }
                _ => {}
            }
        }

        let version = version.ok_or(ArchiveError::MissingKey("version"))?;
        if version != ARCHIVE_VERSION {
            return Err(ArchiveError::UnsupportedVersion(version));
        }

        let code: u8 = number(&fields, "device mode")?;
        let mode = mode_from_code(code).ok_or_else(|| ArchiveError::bad("device mode", &code.to_string()))?;
        let rate_text = fields.get("samplerate").ok_or(ArchiveError::MissingKey("samplerate"))?;
        let samplerate = parse_samplerate(rate_text).ok_or_else(|| ArchiveError::bad("samplerate", rate_text))?;

        let mut entries: BTreeMap<u16, ChannelEntry> = BTreeMap::new();
        for (key, value) in &fields {
            let Some((field, index)) = split_indexed(key) else {
                continue;
            };
            let bad = || ArchiveError::bad(key, value);
            let entry = entries.entry(index).or_insert_with(|| ChannelEntry {
                index,
                name: index.to_string(),
                trigger: None,
                scope: None,
            });
            let scope_field = matches!(field, "enable" | "coupling" | "vDiv" | "vFactor" | "vOffset" | "vTrig");
            if scope_field && entry.scope.is_none() {
                entry.scope = Some(ScopeEntry {
                    enabled: true,
                    coupling: Coupling::Dc,
                    vdiv: 1000,
                    vfactor: 1,
                    offset: 0,
                    trig_value: 0,
                });
            }
            match (field, entry.scope.as_mut()) {
                ("probe", _) => entry.name = (*value).to_string(),
                ("trigger", _) => entry.trigger = Some((*value).to_string()),
                ("enable", Some(s)) => s.enabled = value.parse::<u8>().map_err(|_| bad())? != 0,
                ("coupling", Some(s)) => {
                    s.coupling = value.parse().ok().and_then(Coupling::from_code).ok_or_else(bad)?;
                }
                ("vDiv", Some(s)) => s.vdiv = value.parse().map_err(|_| bad())?,
                ("vFactor", Some(s)) => s.vfactor = value.parse().map_err(|_| bad())?,
                ("vOffset", Some(s)) => s.offset = value.parse().map_err(|_| bad())?,
                ("vTrig", Some(s)) => s.trig_value = value.parse().map_err(|_| bad())?,
                _ => {}
            }
        }
        Ok(Self {
            version,
            driver: fields.get("driver").map(|d| (*d).to_string()).unwrap_or_default(),
            mode,
            capturefile: fields.get("capturefile").map_or_else(|| CAPTURE_FILE.to_string(), |c| (*c).to_string()),
            total_samples: number(&fields, "total samples")?,
            total_channels: number(&fields, "total probes")?,
            total_blocks: optional(&fields, "total blocks", 1)?,
            samplerate,
            trigger_time: optional(&fields, "trigger time", 0)?,
            trigger_pos: optional(&fields, "trigger pos", 0)?,
            unit_bits: optional(&fields, "bits", 1)?,
            entries: entries.into_values().collect(),
        })
    }
}

fn number<T: std::str::FromStr>(fields: &BTreeMap<&str, &str>, key: &'static str) -> Result<T, ArchiveError> {
    let value = fields.get(key).ok_or(ArchiveError::MissingKey(key))?;
    value.parse().map_err(|_| ArchiveError::bad(key, value))
}

fn optional<T: std::str::FromStr>(fields: &BTreeMap<&str, &str>, key: &'static str, default: T) -> Result<T, ArchiveError> {
    match fields.get(key) {
        Some(value) => value.parse().map_err(|_| ArchiveError::bad(key, value)),
        None => Ok(default),
    }
}

/// `vDiv12` -> `("vDiv", 12)`.
fn split_indexed(key: &str) -> Option<(&str, u16)> {
    let split = key.find(|c: char| c.is_ascii_digit())?;
    let (field, index) = key.split_at(split);
    Some((field, index.parse().ok()?))
}

/// Named entries of one capture.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionArchive {
    entries: BTreeMap<String, Vec<u8>>,
}

impl SessionArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, data: Vec<u8>) {
        self.entries.insert(name.into(), data);
    }

    /// Archive of a logic capture. `data` holds interleaved samples,
    /// `unit_size` bytes each, as delivered in logic packets.
    pub fn from_logic(header: &SessionHeader, data: &[u8], unit_size: usize) -> Self {
        let mut header = header.clone();
        let unit_size = unit_size.max(1);
        let samples = (data.len() / unit_size) as u64;
        header.total_samples = samples;
        header.total_blocks = samples.div_ceil(LOGIC_BLOCK_SAMPLES).max(1);

        let mut archive = Self::with_header(&header);
        for entry in &header.entries {
            let bit = usize::from(entry.index);
            for block in 0..header.total_blocks {
                let start = block * LOGIC_BLOCK_SAMPLES;
                let end = (start + LOGIC_BLOCK_SAMPLES).min(samples);
                let mut chunk = vec![0u8; ((end - start) as usize).div_ceil(8)];
                for (i, s) in (start..end).enumerate() {
                    let byte = data.get(s as usize * unit_size + bit / 8).copied().unwrap_or(0);
                    if (byte >> (bit % 8)) & 1 != 0 {
                        chunk[i / 8] |= 1 << (i % 8);
                    }
                }
                archive.insert(logic_chunk_name(entry.index, block), chunk);
            }
        }
        log::debug!("Archived {samples} logic samples in {} blocks", header.total_blocks);
        archive
    }

    /// Archive of an oscilloscope frame with `channels` interleaved 8-bit
    /// samples.
    pub fn from_scope(header: &SessionHeader, data: &[u8], channels: usize) -> Self {
        let mut header = header.clone();
        let channels = channels.max(1);
        header.total_samples = (data.len() / channels) as u64;
        header.total_blocks = 1;

        let mut archive = Self::with_header(&header);
        for entry in &header.entries {
            let column = usize::from(entry.index);
            let samples = data.iter().skip(column).step_by(channels).copied().collect();
            archive.insert(scope_chunk_name(entry.index), samples);
        }
        archive
    }

    fn with_header(header: &SessionHeader) -> Self {
        let mut archive = Self::new();
        archive.insert(VERSION_ENTRY, ARCHIVE_VERSION.to_string().into_bytes());
        archive.insert(HEADER_ENTRY, header.to_text().into_bytes());
        archive
    }

    pub fn header(&self) -> Result<SessionHeader, ArchiveError> {
        let text = self
            .entry(HEADER_ENTRY)
            .ok_or_else(|| ArchiveError::MissingEntry(HEADER_ENTRY.to_string()))?;
        SessionHeader::parse(&String::from_utf8_lossy(text))
    }

    /// Bit-packed samples of one logic channel, all blocks concatenated.
    pub fn logic_channel(&self, channel: u16) -> Result<Vec<u8>, ArchiveError> {
        let header = self.header()?;
        let mut out = Vec::new();
        for block in 0..header.total_blocks {
            let name = logic_chunk_name(channel, block);
            let chunk = self.entry(&name).ok_or(ArchiveError::MissingEntry(name))?;
            out.extend_from_slice(chunk);
        }
        Ok(out)
    }

    pub fn scope_channel(&self, channel: u16) -> Result<&[u8], ArchiveError> {
        let name = scope_chunk_name(channel);
        self.entry(&name).ok_or(ArchiveError::MissingEntry(name))
    }

    /// Write every entry below `dir`; chunk names become subdirectories.
    pub fn save(&self, dir: &Path) -> Result<(), ArchiveError> {
        for (name, data) in &self.entries {
            let path = dir.join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, data)?;
        }
        log::info!("Saved {} archive entries to {}", self.entries.len(), dir.display());
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self, ArchiveError> {
        let mut archive = Self::new();
        Self::load_into(dir, dir, &mut archive)?;
        if archive.entry(VERSION_ENTRY).is_none() {
            return Err(ArchiveError::MissingEntry(VERSION_ENTRY.to_string()));
        }
        Ok(archive)
    }

    fn load_into(root: &Path, dir: &Path, archive: &mut Self) -> Result<(), ArchiveError> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                Self::load_into(root, &path, archive)?;
            } else if let Ok(rel) = path.strip_prefix(root) {
                let name = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                archive.insert(name, fs::read(&path)?);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{find_profile, DSL_VID};

    fn channels(pid: u16) -> Vec<Channel> {
        let profile = find_profile(DSL_VID, pid, false).unwrap();
        let mode = profile.default_channel_mode.mode();
        (0..mode.valid).map(|i| Channel::new(i, mode, profile)).collect()
    }

    #[test]
    fn test_samplerate_strings() {
        assert_eq!(format_samplerate(1_000_000), "1 MHz");
        assert_eq!(format_samplerate(2_500), "2.5 kHz");
        assert_eq!(format_samplerate(10), "10 Hz");
        assert_eq!(format_samplerate(1_000_000_000), "1 GHz");
        assert_eq!(parse_samplerate("1 MHz"), Some(1_000_000));
        assert_eq!(parse_samplerate("2.5kHz"), Some(2_500));
        assert_eq!(parse_samplerate("400"), Some(400));
        assert_eq!(parse_samplerate("12 furlongs"), None);
    }

    #[test]
    fn test_chunk_names() {
        assert_eq!(logic_chunk_name(3, 0), "L-3/0");
        assert_eq!(logic_chunk_name(15, 2), "L-15/2");
        assert_eq!(scope_chunk_name(1), "O-1/0");
    }

    #[test]
    fn test_header_text() {
        let mut chs = channels(0x0003);
        chs[1].enabled = false;
        let mut header = SessionHeader::new("DSLogic", OperationMode::Logic, 1_000_000, 4096).with_channels(&chs);
        header.trigger_pos = 100;
        header.entries[0].trigger = Some("R".to_string());

        let text = header.to_text();
        assert!(text.starts_with("[version]\nversion = 2\n[header]\n"));
        assert!(text.contains("device mode = 0\n"));
        assert!(text.contains("samplerate = 1 MHz\n"));
        assert!(text.contains("total probes = 16\n"));
        assert!(text.contains("probe0 = 0\ntrigger0 = R\n"));
        assert!(!text.contains("probe1 ="));

        let parsed = SessionHeader::parse(&text).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_scope_header_fields() {
        let mut chs = channels(0x0002);
        chs[1].vdiv = 500;
        chs[1].coupling = Coupling::Ac;
        let header = SessionHeader::new("DSCope", OperationMode::Oscilloscope, 100_000_000, 1024).with_channels(&chs);
        let text = header.to_text();
        assert!(text.contains("vDiv1 = 500\n"));
        assert!(text.contains("coupling1 = 1\n"));

        let parsed = SessionHeader::parse(&text).unwrap();
        assert_eq!(parsed.mode, OperationMode::Oscilloscope);
        assert_eq!(parsed.entries[1].scope.as_ref().map(|s| s.coupling), Some(Coupling::Ac));
        assert_eq!(parsed.unit_bits, 8);
    }

    #[test]
    fn test_parse_rejects_bad_headers() {
        let err = SessionHeader::parse("[version]\nversion = 1\n[header]\n").unwrap_err();
        assert!(matches!(err, ArchiveError::UnsupportedVersion(1)));

        let err = SessionHeader::parse("[version]\nversion = 2\n[header]\ndevice mode = 0\n").unwrap_err();
        assert!(matches!(err, ArchiveError::MissingKey("samplerate")));

        let text = "[version]\nversion = 2\n[header]\ndevice mode = 7\nsamplerate = 1 MHz\n";
        assert!(matches!(SessionHeader::parse(text), Err(ArchiveError::BadValue { .. })));
    }

    #[test]
    fn test_logic_archive_splits_channels() {
        let chs = channels(0x0003);
        let header = SessionHeader::new("DSLogic", OperationMode::Logic, 1_000_000, 0).with_channels(&chs[..2]);
        // channel 0 toggles, channel 1 stays high; 16 samples, 1 byte each
        let data: Vec<u8> = (0..16u8).map(|i| (i & 1) | 0b10).collect();
        let archive = SessionArchive::from_logic(&header, &data, 1);

        assert_eq!(archive.entry(VERSION_ENTRY), Some(&b"2"[..]));
        assert_eq!(archive.header().unwrap().total_samples, 16);
        assert_eq!(archive.logic_channel(0).unwrap(), vec![0b1010_1010, 0b1010_1010]);
        assert_eq!(archive.logic_channel(1).unwrap(), vec![0xFF, 0xFF]);
        assert!(matches!(archive.logic_channel(5), Err(ArchiveError::MissingEntry(_))));
    }

    #[test]
    fn test_scope_archive_deinterleaves() {
        let chs = channels(0x0002);
        let header = SessionHeader::new("DSCope", OperationMode::Oscilloscope, 100_000_000, 0).with_channels(&chs);
        let data = [10u8, 200, 11, 201, 12, 202];
        let archive = SessionArchive::from_scope(&header, &data, 2);
        assert_eq!(archive.scope_channel(0).unwrap(), &[10, 11, 12]);
        assert_eq!(archive.scope_channel(1).unwrap(), &[200, 201, 202]);
        assert_eq!(archive.header().unwrap().total_samples, 3);
    }

    #[test]
    fn test_save_and_load_directory() {
        let dir = std::env::temp_dir().join(format!("dslogic-archive-{}", std::process::id()));
        let chs = channels(0x0003);
        let header = SessionHeader::new("DSLogic", OperationMode::Logic, 1_000_000, 0).with_channels(&chs[..1]);
        let archive = SessionArchive::from_logic(&header, &[1, 0, 1, 0], 1);
        archive.save(&dir).unwrap();

        let loaded = SessionArchive::load(&dir).unwrap();
        assert_eq!(loaded, archive);
        let _ = fs::remove_dir_all(&dir);
    }
}
