//! Typed configuration surface of a device.
//!
//! Every tunable is addressed by a [`ConfigKey`] and carries a
//! [`ConfigValue`] of a fixed kind. A key that does not apply to the current
//! device or mode answers [`ConfigOutcome::NotApplicable`] rather than an
//! error. [`AcquisitionSettings`] loads a set of defaults from TOML and turns
//! them into key/value pairs.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Integer,
    Boolean,
    Byte,
    String,
    Double,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Integer => "integer",
            ValueKind::Boolean => "boolean",
            ValueKind::Byte => "byte",
            ValueKind::String => "string",
            ValueKind::Double => "double",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Integer(u64),
    Boolean(bool),
    Byte(u8),
    String(String),
    Double(f64),
}

impl ConfigValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            ConfigValue::Integer(_) => ValueKind::Integer,
            ConfigValue::Boolean(_) => ValueKind::Boolean,
            ConfigValue::Byte(_) => ValueKind::Byte,
            ConfigValue::String(_) => ValueKind::String,
            ConfigValue::Double(_) => ValueKind::Double,
        }
    }

    pub fn as_integer(&self) -> Option<u64> {
        match self {
            ConfigValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_byte(&self) -> Option<u8> {
        match self {
            ConfigValue::Byte(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            ConfigValue::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<u64> for ConfigValue {
    fn from(v: u64) -> Self {
        ConfigValue::Integer(v)
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Boolean(v)
    }
}

impl From<u8> for ConfigValue {
    fn from(v: u8) -> Self {
        ConfigValue::Byte(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::String(v.to_string())
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Double(v)
    }
}

/// Configuration keys. Channel keys carry the channel index, advanced
/// trigger keys the stage index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    /// Logic, oscilloscope or analog ("logic" / "dso" / "analog").
    DeviceMode,
    /// Buffered or streaming capture ("buffer" / "stream").
    OperationMode,
    ChannelMode,
    SampleRate,
    LimitSamples,
    Rle,
    ClockExternal,
    ClockFalling,
    Filter,
    Threshold,
    TestMode,
    Instant,
    TriggerEnable,
    TriggerMode,
    TriggerPosition,
    TriggerStages,
    TriggerValue { stage: u8 },
    TriggerLogic { stage: u8 },
    TriggerCount { stage: u8 },
    TriggerSlope,
    TriggerSource,
    TriggerLevel { channel: u16 },
    TriggerHoldoff,
    TriggerMargin,
    HorizontalTriggerPos,
    ChannelEnable { channel: u16 },
    Coupling { channel: u16 },
    VoltsPerDiv { channel: u16 },
    VerticalPosition { channel: u16 },
    Calibrate,
    /// Save the zero calibration to the device NVM.
    ZeroSet,
    /// Reload the zero calibration from NVM, scheduling a run when none is stored.
    ZeroLoad,
    /// Restore factory calibration values.
    ZeroDefault,
    /// The single-channel fine-gain step waits for the host.
    ZeroCombFgain,
    /// Host reply: captures now run on one channel.
    ZeroComb,
    DataLock,
    Model,
    TotalChannels,
}

impl ConfigKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::DeviceMode => "device mode",
            ConfigKey::OperationMode => "operation mode",
            ConfigKey::ChannelMode => "channel mode",
            ConfigKey::SampleRate => "samplerate",
            ConfigKey::LimitSamples => "limit samples",
            ConfigKey::Rle => "rle",
            ConfigKey::ClockExternal => "external clock",
            ConfigKey::ClockFalling => "clock edge",
            ConfigKey::Filter => "filter",
            ConfigKey::Threshold => "threshold",
            ConfigKey::TestMode => "test mode",
            ConfigKey::Instant => "instant",
            ConfigKey::TriggerEnable => "trigger enable",
            ConfigKey::TriggerMode => "trigger mode",
            ConfigKey::TriggerPosition => "trigger position",
            ConfigKey::TriggerStages => "trigger stages",
            ConfigKey::TriggerValue { .. } => "trigger value",
            ConfigKey::TriggerLogic { .. } => "trigger logic",
            ConfigKey::TriggerCount { .. } => "trigger count",
            ConfigKey::TriggerSlope => "trigger slope",
            ConfigKey::TriggerSource => "trigger source",
            ConfigKey::TriggerLevel { .. } => "trigger level",
            ConfigKey::TriggerHoldoff => "trigger holdoff",
            ConfigKey::TriggerMargin => "trigger margin",
            ConfigKey::HorizontalTriggerPos => "horizontal trigger position",
            ConfigKey::ChannelEnable { .. } => "channel enable",
            ConfigKey::Coupling { .. } => "coupling",
            ConfigKey::VoltsPerDiv { .. } => "volts/div",
            ConfigKey::VerticalPosition { .. } => "vertical position",
            ConfigKey::Calibrate => "calibrate",
            ConfigKey::ZeroSet => "zero set",
            ConfigKey::ZeroLoad => "zero load",
            ConfigKey::ZeroDefault => "zero default",
            ConfigKey::ZeroCombFgain => "zero comb fgain",
            ConfigKey::ZeroComb => "zero comb",
            ConfigKey::DataLock => "data lock",
            ConfigKey::Model => "model",
            ConfigKey::TotalChannels => "total channels",
        }
    }

    /// The value kind `set` accepts and `get` returns for this key.
    pub fn kind(&self) -> ValueKind {
        match self {
            ConfigKey::DeviceMode
            | ConfigKey::OperationMode
            | ConfigKey::ChannelMode
            | ConfigKey::TestMode
            | ConfigKey::TriggerMode
            | ConfigKey::TriggerValue { .. }
            | ConfigKey::TriggerSlope
            | ConfigKey::TriggerSource
            | ConfigKey::Coupling { .. }
            | ConfigKey::Model => ValueKind::String,
            ConfigKey::SampleRate
            | ConfigKey::LimitSamples
            | ConfigKey::TriggerCount { .. }
            | ConfigKey::TriggerHoldoff
            | ConfigKey::VoltsPerDiv { .. }
            | ConfigKey::VerticalPosition { .. }
            | ConfigKey::TotalChannels => ValueKind::Integer,
            ConfigKey::Rle
            | ConfigKey::ClockExternal
            | ConfigKey::ClockFalling
            | ConfigKey::Filter
            | ConfigKey::Instant
            | ConfigKey::TriggerEnable
            | ConfigKey::ChannelEnable { .. }
            | ConfigKey::Calibrate
            | ConfigKey::ZeroSet
            | ConfigKey::ZeroLoad
            | ConfigKey::ZeroDefault
            | ConfigKey::ZeroCombFgain
            | ConfigKey::ZeroComb
            | ConfigKey::DataLock => ValueKind::Boolean,
            ConfigKey::TriggerPosition
            | ConfigKey::TriggerStages
            | ConfigKey::TriggerLogic { .. }
            | ConfigKey::TriggerLevel { .. }
            | ConfigKey::TriggerMargin
            | ConfigKey::HorizontalTriggerPos => ValueKind::Byte,
            ConfigKey::Threshold => ValueKind::Double,
        }
    }

    /// Keys that can only be read.
    pub fn is_read_only(&self) -> bool {
        matches!(self, ConfigKey::Model | ConfigKey::TotalChannels | ConfigKey::ZeroCombFgain)
    }
}

/// Result of a config call that succeeded at the protocol level.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigOutcome<T> {
    Done(T),
    /// The key is meaningless for this device or mode.
    NotApplicable,
}

impl<T> ConfigOutcome<T> {
    pub fn is_applicable(&self) -> bool {
        matches!(self, ConfigOutcome::Done(_))
    }

    pub fn done(self) -> Option<T> {
        match self {
            ConfigOutcome::Done(v) => Some(v),
            ConfigOutcome::NotApplicable => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} expects a {expected} value, got {found}", key = .key.as_str(), expected = .expected.as_str(), found = .found.as_str())]
    TypeMismatch {
        key: ConfigKey,
        expected: ValueKind,
        found: ValueKind,
    },

    #[error("{key} is read-only", key = .0.as_str())]
    ReadOnly(ConfigKey),

    #[error("Invalid value for {key}: {reason}", key = .key.as_str())]
    InvalidValue { key: ConfigKey, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl ConfigError {
    pub fn invalid(key: ConfigKey, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key,
            reason: reason.into(),
        }
    }
}

/// Check that `value` has the kind `key` expects.
pub fn check_kind(key: ConfigKey, value: &ConfigValue) -> Result<(), ConfigError> {
    if key.is_read_only() {
        return Err(ConfigError::ReadOnly(key));
    }
    let expected = key.kind();
    if value.kind() != expected {
        return Err(ConfigError::TypeMismatch {
            key,
            expected,
            found: value.kind(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSettings {
    pub enabled: bool,
    /// Trigger position in percent of the capture.
    pub position: u8,
    /// One symbol per channel, highest channel first (`X`, `0`, `1`, `R`,
    /// `F`, `C`).
    pub simple: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub index: u16,
    pub enabled: Option<bool>,
    pub coupling: Option<String>,
    /// Volts/div in millivolts.
    pub vdiv: Option<u64>,
    pub offset: Option<u64>,
}

/// Capture defaults as stored in a TOML file.
///
/// ```toml
/// device_mode = "logic"
/// operation_mode = "stream"
/// samplerate = 1000000
/// limit_samples = 1048576
///
/// [trigger]
/// enabled = true
/// position = 10
/// simple = "XXXXXXXXXXXXXXXR"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    pub device_mode: Option<String>,
    pub operation_mode: Option<String>,
    pub channel_mode: Option<String>,
    pub samplerate: Option<u64>,
    pub limit_samples: Option<u64>,
    pub rle: Option<bool>,
    pub clock_external: Option<bool>,
    pub clock_falling: Option<bool>,
    pub filter: Option<bool>,
    pub threshold: Option<f64>,
    pub instant: Option<bool>,
    pub trigger: Option<TriggerSettings>,
    pub channels: Vec<ChannelSettings>,
}

impl AcquisitionSettings {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        log::debug!("Loading acquisition settings from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    /// Flatten into the key/value pairs a device applies, device mode
    /// first since it decides which other keys apply.
    pub fn entries(&self) -> Vec<(ConfigKey, ConfigValue)> {
        let mut out = Vec::new();
        let mut push = |key, value: Option<ConfigValue>| {
            if let Some(value) = value {
                out.push((key, value));
            }
        };
        push(ConfigKey::DeviceMode, self.device_mode.as_deref().map(ConfigValue::from));
        push(ConfigKey::OperationMode, self.operation_mode.as_deref().map(ConfigValue::from));
        push(ConfigKey::ChannelMode, self.channel_mode.as_deref().map(ConfigValue::from));
        push(ConfigKey::SampleRate, self.samplerate.map(ConfigValue::from));
        push(ConfigKey::LimitSamples, self.limit_samples.map(ConfigValue::from));
        push(ConfigKey::Rle, self.rle.map(ConfigValue::from));
        push(ConfigKey::ClockExternal, self.clock_external.map(ConfigValue::from));
        push(ConfigKey::ClockFalling, self.clock_falling.map(ConfigValue::from));
        push(ConfigKey::Filter, self.filter.map(ConfigValue::from));
        push(ConfigKey::Threshold, self.threshold.map(ConfigValue::from));
        push(ConfigKey::Instant, self.instant.map(ConfigValue::from));

        for ch in &self.channels {
            let channel = ch.index;
            push(ConfigKey::ChannelEnable { channel }, ch.enabled.map(ConfigValue::from));
            push(ConfigKey::Coupling { channel }, ch.coupling.as_deref().map(ConfigValue::from));
            push(ConfigKey::VoltsPerDiv { channel }, ch.vdiv.map(ConfigValue::from));
            push(ConfigKey::VerticalPosition { channel }, ch.offset.map(ConfigValue::from));
        }

        if let Some(trigger) = &self.trigger {
            push(ConfigKey::TriggerMode, Some("simple".into()));
            push(ConfigKey::TriggerPosition, Some(trigger.position.into()));
            push(
                ConfigKey::TriggerValue { stage: 0 },
                trigger.simple.as_deref().map(ConfigValue::from),
            );
            push(ConfigKey::TriggerEnable, Some(trigger.enabled.into()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_kinds() {
        assert_eq!(ConfigValue::from(5u64).kind(), ValueKind::Integer);
        assert_eq!(ConfigValue::from(true).as_bool(), Some(true));
        assert_eq!(ConfigValue::from(7u8).as_integer(), None);
        assert_eq!(ConfigValue::from("dso").as_str(), Some("dso"));
        assert_eq!(ConfigValue::from(1.5).as_double(), Some(1.5));
    }

    #[test]
    fn test_check_kind() {
        assert!(check_kind(ConfigKey::SampleRate, &ConfigValue::Integer(1)).is_ok());
        let err = check_kind(ConfigKey::SampleRate, &ConfigValue::Boolean(true)).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::TypeMismatch {
                expected: ValueKind::Integer,
                found: ValueKind::Boolean,
                ..
            }
        ));
        assert!(matches!(
            check_kind(ConfigKey::Model, &ConfigValue::from("x")),
            Err(ConfigError::ReadOnly(ConfigKey::Model))
        ));
        assert_eq!(
            err.to_string(),
            "samplerate expects a integer value, got boolean"
        );
    }

    #[test]
    fn test_outcome() {
        let found: ConfigOutcome<u64> = ConfigOutcome::Done(3);
        assert!(found.is_applicable());
        assert_eq!(found.done(), Some(3));
        assert_eq!(ConfigOutcome::<u64>::NotApplicable.done(), None);
    }

    #[test]
    fn test_settings_from_toml() {
        let text = r#"
            device_mode = "logic"
            operation_mode = "stream"
            samplerate = 1000000
            limit_samples = 1048576

            [trigger]
            enabled = true
            position = 10
            simple = "XXXXXXXXXXXXXXXR"

            [[channels]]
            index = 3
            enabled = false
        "#;
        let settings = AcquisitionSettings::from_toml_str(text).unwrap();
        assert_eq!(settings.samplerate, Some(1_000_000));
        assert_eq!(settings.channels[0].enabled, Some(false));

        let entries = settings.entries();
        assert_eq!(entries[0], (ConfigKey::DeviceMode, ConfigValue::from("logic")));
        assert!(entries.contains(&(ConfigKey::ChannelEnable { channel: 3 }, ConfigValue::Boolean(false))));
        assert_eq!(entries.last(), Some(&(ConfigKey::TriggerEnable, ConfigValue::Boolean(true))));
        for (key, value) in &entries {
            assert!(check_kind(*key, value).is_ok(), "{}", key.as_str());
        }
    }

    #[test]
    fn test_settings_reject_bad_toml() {
        let err = AcquisitionSettings::from_toml_str("samplerate = \"fast\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_settings_toml_round_trip() {
        let settings = AcquisitionSettings {
            samplerate: Some(2_000_000),
            instant: Some(true),
            ..AcquisitionSettings::default()
        };
        let text = settings.to_toml_string().unwrap();
        assert_eq!(AcquisitionSettings::from_toml_str(&text).unwrap(), settings);
    }
}
