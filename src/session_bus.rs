//! Typed packets published by a running acquisition.
//!
//! Sample payloads borrow the transfer buffer they were decoded from and are
//! only valid for the duration of [`PacketSink::send`]. A sink that keeps
//! data must take an owned copy, e.g. with [`Packet::into_owned`].

use std::borrow::Cow;
use std::time::SystemTime;

use polars::prelude::*;

use crate::config::{ConfigKey, ConfigValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Header,
    Trigger,
    Logic,
    Dso,
    Analog,
    End,
    Overflow,
    Abandon,
    Meta,
    FrameBegin,
    FrameEnd,
}

impl PacketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketKind::Header => "header",
            PacketKind::Trigger => "trigger",
            PacketKind::Logic => "logic",
            PacketKind::Dso => "dso",
            PacketKind::Analog => "analog",
            PacketKind::End => "end",
            PacketKind::Overflow => "overflow",
            PacketKind::Abandon => "abandon",
            PacketKind::Meta => "meta",
            PacketKind::FrameBegin => "frame begin",
            PacketKind::FrameEnd => "frame end",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub feed_version: u32,
    pub start_time: SystemTime,
}

/// Trigger position reported by the hardware, or a default record when the
/// trigger was found in software.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerPosition {
    pub real_pos: u32,
    pub ram_saddr: u32,
    pub remain_cnt: u64,
    pub status: u32,
    pub data_error: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogicPayload<'a> {
    pub unit_size: u16,
    pub data_error: bool,
    pub data: Cow<'a, [u8]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DsoPayload<'a> {
    /// Samples per enabled channel.
    pub num_samples: usize,
    pub channels: usize,
    pub samplerate_toggle: bool,
    pub trig_flag: bool,
    pub trig_ch: u8,
    /// Interleaved 8-bit samples.
    pub data: Cow<'a, [u8]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalogPayload<'a> {
    pub num_samples: usize,
    pub channels: usize,
    pub unit_bits: u8,
    pub unit_pitch: u16,
    pub data: Cow<'a, [u8]>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet<'a> {
    Header(Header),
    Trigger(TriggerPosition),
    Logic(LogicPayload<'a>),
    Dso(DsoPayload<'a>),
    Analog(AnalogPayload<'a>),
    End,
    Overflow,
    Abandon,
    Meta(Vec<(ConfigKey, ConfigValue)>),
    FrameBegin,
    FrameEnd,
}

impl<'a> Packet<'a> {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Header(_) => PacketKind::Header,
            Packet::Trigger(_) => PacketKind::Trigger,
            Packet::Logic(_) => PacketKind::Logic,
            Packet::Dso(_) => PacketKind::Dso,
            Packet::Analog(_) => PacketKind::Analog,
            Packet::End => PacketKind::End,
            Packet::Overflow => PacketKind::Overflow,
            Packet::Abandon => PacketKind::Abandon,
            Packet::Meta(_) => PacketKind::Meta,
            Packet::FrameBegin => PacketKind::FrameBegin,
            Packet::FrameEnd => PacketKind::FrameEnd,
        }
    }

    pub fn logic(data: &'a [u8], unit_size: u16) -> Self {
        Packet::Logic(LogicPayload {
            unit_size,
            data_error: false,
            data: Cow::Borrowed(data),
        })
    }

    /// Detach the packet from the transfer buffer it borrows.
    pub fn into_owned(self) -> Packet<'static> {
        fn own(data: Cow<'_, [u8]>) -> Cow<'static, [u8]> {
            Cow::Owned(data.into_owned())
        }
        match self {
            Packet::Header(h) => Packet::Header(h),
            Packet::Trigger(t) => Packet::Trigger(t),
            Packet::Logic(p) => Packet::Logic(LogicPayload {
                unit_size: p.unit_size,
                data_error: p.data_error,
                data: own(p.data),
            }),
            Packet::Dso(p) => Packet::Dso(DsoPayload {
                num_samples: p.num_samples,
                channels: p.channels,
                samplerate_toggle: p.samplerate_toggle,
                trig_flag: p.trig_flag,
                trig_ch: p.trig_ch,
                data: own(p.data),
            }),
            Packet::Analog(p) => Packet::Analog(AnalogPayload {
                num_samples: p.num_samples,
                channels: p.channels,
                unit_bits: p.unit_bits,
                unit_pitch: p.unit_pitch,
                data: own(p.data),
            }),
            Packet::End => Packet::End,
            Packet::Overflow => Packet::Overflow,
            Packet::Abandon => Packet::Abandon,
            Packet::Meta(items) => Packet::Meta(items),
            Packet::FrameBegin => Packet::FrameBegin,
            Packet::FrameEnd => Packet::FrameEnd,
        }
    }
}

/// Consumer of acquisition packets.
pub trait PacketSink {
    fn send(&mut self, packet: &Packet<'_>);
}

impl<F> PacketSink for F
where
    F: FnMut(&Packet<'_>),
{
    fn send(&mut self, packet: &Packet<'_>) {
        self(packet)
    }
}

/// Fans every packet out to all attached sinks, in attachment order.
#[derive(Default)]
pub struct SessionBus {
    sinks: Vec<Box<dyn PacketSink + Send>>,
}

impl SessionBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, sink: Box<dyn PacketSink + Send>) {
        self.sinks.push(sink);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

impl PacketSink for SessionBus {
    fn send(&mut self, packet: &Packet<'_>) {
        for sink in &mut self.sinks {
            sink.send(packet);
        }
    }
}

/// Sink that keeps an owned copy of every packet.
#[derive(Debug, Default)]
pub struct PacketRecorder {
    packets: Vec<Packet<'static>>,
}

impl PacketRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packets(&self) -> &[Packet<'static>] {
        &self.packets
    }

    pub fn kinds(&self) -> Vec<PacketKind> {
        self.packets.iter().map(Packet::kind).collect()
    }

    pub fn count(&self, kind: PacketKind) -> usize {
        self.packets.iter().filter(|p| p.kind() == kind).count()
    }

    /// Concatenated logic sample bytes, in arrival order.
    pub fn logic_bytes(&self) -> Vec<u8> {
        self.packets
            .iter()
            .filter_map(|p| match p {
                Packet::Logic(l) => Some(l.data.as_ref()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }
}

impl PacketSink for PacketRecorder {
    fn send(&mut self, packet: &Packet<'_>) {
        self.packets.push(packet.clone().into_owned());
    }
}

pub const TIME_COLUMN_NAME: &str = "time";

/// Logic samples as a frame with one boolean `bit_N` column per channel.
pub struct LogicFrame;

impl LogicFrame {
    pub fn from_bytes(
        data: &[u8],
        unit_size: u16,
        channels: usize,
        samplerate: u64,
    ) -> Result<DataFrame, PolarsError> {
        let unit = usize::from(unit_size.max(1));
        let channels = channels.min(unit * 8);
        let samples = data.len() / unit;

        let mut bit_columns: Vec<Vec<bool>> = vec![Vec::with_capacity(samples); channels];
        for sample in data.chunks_exact(unit) {
            let word = sample
                .iter()
                .rev()
                .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
            for (bit, column) in bit_columns.iter_mut().enumerate() {
                column.push((word >> bit) & 1 == 1);
            }
        }

        let period = 1.0 / samplerate.max(1) as f64;
        let time: Vec<f64> = (0..samples).map(|i| i as f64 * period).collect();
        let mut columns: Vec<Column> = vec![Series::new(TIME_COLUMN_NAME.into(), time).into()];
        for (bit, values) in bit_columns.into_iter().enumerate() {
            columns.push(Series::new(format!("bit_{}", bit).into(), values).into());
        }
        DataFrame::new(columns)
    }
}

/// Oscilloscope samples as a frame with one raw `chN_raw` column per
/// enabled channel.
pub struct DsoFrame;

impl DsoFrame {
    pub fn from_payload(payload: &DsoPayload<'_>) -> Result<DataFrame, PolarsError> {
        let channels = payload.channels.max(1);
        let samples = payload.num_samples.min(payload.data.len() / channels);
        let mut columns: Vec<Column> = Vec::with_capacity(channels);
        for ch in 0..channels {
            let values: Vec<i32> = payload
                .data
                .iter()
                .skip(ch)
                .step_by(channels)
                .take(samples)
                .map(|b| i32::from(*b))
                .collect();
            columns.push(Series::new(format!("ch{}_raw", ch).into(), values).into());
        }
        DataFrame::new(columns)
    }

    /// Convert the raw column of one channel into volts, given the
    /// channel's volts/div, its offset code and the ADC resolution.
    pub fn with_voltage(
        df: DataFrame,
        channel: usize,
        vdiv_mv: u64,
        offset: u16,
        bits: u8,
    ) -> Result<DataFrame, PolarsError> {
        let full_scale = f64::from((1u32 << bits) - 1);
        let volts_per_code = vdiv_mv as f64 * 10.0 / 1000.0 / full_scale;
        let raw = format!("ch{}_raw", channel);
        df.lazy()
            .with_column(
                ((lit(f64::from(offset)) - col(raw.as_str()).cast(DataType::Float64))
                    * lit(volts_per_code))
                .alias(format!("ch{}_volts", channel)),
            )
            .collect()
    }
}
