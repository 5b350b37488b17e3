//! Oscilloscope zero calibration.
//!
//! The procedure runs while the device streams in zero mode and advances
//! once per valid status envelope. It first sets every channel to its
//! widest range, trims the PWM offset span (`vpos_trans`) on devices
//! without a pre-offset stage, then walks the volts/div table nulling each
//! step's `preoff`, measures the interleaved ADC mismatch ("comb") and
//! finally reprograms the front end with the new values. HMCAD1511 front
//! ends replace the comb measurement with lane fine-gain trimming, first
//! with two lanes per channel and then with all four lanes on one channel.

use crate::adc::{self, fgain_code, fgain_from_code};
use crate::channel::Channel;
use crate::command::{regs, CommandError, CommandLink};
use crate::dso_command::{DsoCommand, DsoError, ScopeFrontEnd};
use crate::profile::{caps, DeviceProfile, UsbSpeed};
use crate::status::StatusSnapshot;
use crate::usb_transport::UsbTransport;

/// Snapshots between a setting change and its measurement.
pub const ZERO_INTERVAL: u32 = 50;
/// Residual error, in ADC codes, accepted as calibrated.
pub const MARGIN_PASS: f64 = 0.3;
/// Measurement rounds allowed per phase before giving up.
pub const MAX_PHASE_RETRIES: u32 = 32;
const MAX_TRANS: f64 = 1023.0;

/// Relative lane spread accepted as matched.
pub const MAX_ACC_VARIANCE: f64 = 0.0005;
const FGAIN_MAX: f64 = 1.0077;
const FGAIN_MIN: f64 = 0.9923;

const ZERO_BASE_ADDR: u16 = 0x40;
const ZERO_BIG_ADDR: u16 = 0x20;
const FLASH_PAGE: u16 = 8;
pub const ZERO_RECORD_BYTES: usize = 30;
pub const VGA_RECORD_BYTES: usize = 17;
const VGA_STEPS: usize = 8;

const COMB_CTRL: u8 = regs::COMB + 6;
const COMB_MEASURE_CH0: u8 = 0b1101;
const COMB_MEASURE_CH1: u8 = 0b1110;
const COMB_NORMAL: u8 = 0b0011;

#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("{phase} did not converge after {retries} rounds")]
    NotConverged { phase: &'static str, retries: u32 },

    #[error("Calibration record at {addr:#06x} is invalid (address byte {found:#04x})")]
    BadRecord { addr: u16, found: u8 },

    #[error(transparent)]
    Dso(#[from] DsoError),

    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroPhase {
    Idle,
    WarmUp,
    TransFix,
    MidZero,
    Comb,
    FineGain,
    CombFineGain,
    Done,
}

impl ZeroPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZeroPhase::Idle => "idle",
            ZeroPhase::WarmUp => "warm-up",
            ZeroPhase::TransFix => "offset span trim",
            ZeroPhase::MidZero => "mid-scale zero",
            ZeroPhase::Comb => "comb measurement",
            ZeroPhase::FineGain => "lane fine gain",
            ZeroPhase::CombFineGain => "single-channel lane fine gain",
            ZeroPhase::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroProgress {
    Running,
    Finished,
}

#[derive(Debug, Clone)]
pub struct ZeroCalibration {
    phase: ZeroPhase,
    pcnt: u32,
    stage: usize,
    retries: u32,
    margin: [f64; 2],
    vdiv_backup: Vec<u64>,
    comb_ready: bool,
}

impl Default for ZeroCalibration {
    fn default() -> Self {
        Self::new()
    }
}

fn round_away(v: f64) -> f64 {
    if v > 0.0 { v.ceil() } else { v.floor() }
}

fn mean_level(status: &StatusSnapshot, index: usize, limit: f64) -> f64 {
    status.channels[index].acc_mean as f64 / limit
}

impl ZeroCalibration {
    pub fn new() -> Self {
        Self {
            phase: ZeroPhase::Idle,
            pcnt: 0,
            stage: 0,
            retries: 0,
            margin: [0.0; 2],
            vdiv_backup: Vec::new(),
            comb_ready: false,
        }
    }

    pub fn phase(&self) -> ZeroPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.phase, ZeroPhase::Idle | ZeroPhase::Done)
    }

    /// Volts/div table index being nulled, while in the mid-zero phase.
    pub fn vdiv_step(&self) -> Option<usize> {
        (self.phase == ZeroPhase::MidZero).then_some(self.stage)
    }

    /// The single-channel fine-gain step is holding for the host to run
    /// the capture on one channel.
    pub fn awaiting_comb(&self) -> bool {
        self.phase == ZeroPhase::CombFineGain && !self.comb_ready
    }

    /// Report whether captures now run on a single channel.
    pub fn set_comb_ready(&mut self, ready: bool) {
        self.comb_ready = ready;
    }

    pub fn comb_ready(&self) -> bool {
        self.comb_ready
    }

    /// Put the front end in zero mode and reset the procedure. Offset spans
    /// and pre-offsets restart from the factory values.
    pub fn start(&mut self, scope: &mut ScopeFrontEnd) {
        log::info!("Starting zero calibration of {}", scope.profile.model);
        *self = Self::new();
        self.phase = ZeroPhase::WarmUp;
        self.vdiv_backup = scope.channels.iter().map(|c| c.vdiv).collect();
        let profile = scope.profile;
        for ch in &mut scope.channels {
            ch.vpos_trans = profile.default_pwmtrans;
            for entry in &mut ch.vga {
                if let Some(default) = profile.vga_defaults().find(|v| v.key == entry.key) {
                    entry.preoff = default.preoff;
                }
            }
        }
        scope.settings.zero = true;
    }

    fn enter(&mut self, phase: ZeroPhase) {
        log::debug!("Zero calibration: {} -> {}", self.phase.as_str(), phase.as_str());
        self.phase = phase;
        self.pcnt = 0;
        self.retries = 0;
    }

    fn retry(&mut self) -> Result<(), CalibrationError> {
        self.retries += 1;
        if self.retries > MAX_PHASE_RETRIES {
            log::error!("Zero calibration {} gave up after {} rounds", self.phase.as_str(), MAX_PHASE_RETRIES);
            return Err(CalibrationError::NotConverged {
                phase: self.phase.as_str(),
                retries: MAX_PHASE_RETRIES,
            });
        }
        Ok(())
    }

    fn write_offsets<T: UsbTransport>(
        link: &mut CommandLink<T>,
        scope: &mut ScopeFrontEnd,
        code: u16,
    ) -> Result<(), CalibrationError> {
        for i in 0..scope.channels.len() {
            scope.channels[i].zero_offset = code;
            scope.write(link, DsoCommand::Offset(i))?;
        }
        Ok(())
    }

    /// Feed one status envelope. Invalid envelopes are ignored.
    pub fn advance<T: UsbTransport>(
        &mut self,
        link: &mut CommandLink<T>,
        scope: &mut ScopeFrontEnd,
        status: &StatusSnapshot,
    ) -> Result<ZeroProgress, CalibrationError> {
        match self.phase {
            ZeroPhase::Done => return Ok(ZeroProgress::Finished),
            ZeroPhase::Idle => return Ok(ZeroProgress::Running),
            _ => {}
        }
        if !status.valid {
            log::debug!("Zero calibration skipping invalid status envelope");
            return Ok(ZeroProgress::Running);
        }

        let hmcad = scope.profile.has_feature(caps::HMCAD1511);
        let bits = scope.channel_mode.unit_bits;
        let top: u16 = if hmcad { 15 } else { 30 };
        let bom = ((1u32 << bits) - 1) as u16 - top;
        let mid = 1u16 << (bits - 1);
        let limit = scope.settings.limit_samples.max(1) as f64;

        match self.phase {
            ZeroPhase::WarmUp => self.warm_up(link, scope, mid, hmcad)?,
            ZeroPhase::TransFix => self.trans_fix(link, scope, status, top, bom, limit)?,
            ZeroPhase::MidZero => self.mid_zero(link, scope, status, mid)?,
            ZeroPhase::Comb => {
                if self.comb(link, scope, status, top, bom, limit)? {
                    self.finish(link, scope)?;
                    return Ok(ZeroProgress::Finished);
                }
            }
            ZeroPhase::FineGain => {
                if self.fine_gain(link, scope, status, bom, false)? {
                    self.enter(ZeroPhase::CombFineGain);
                    self.comb_ready = false;
                }
            }
            ZeroPhase::CombFineGain => {
                if self.fine_gain(link, scope, status, bom, true)? {
                    self.finish(link, scope)?;
                    return Ok(ZeroProgress::Finished);
                }
            }
            ZeroPhase::Idle | ZeroPhase::Done => {}
        }
        Ok(ZeroProgress::Running)
    }

    fn warm_up<T: UsbTransport>(
        &mut self,
        link: &mut CommandLink<T>,
        scope: &mut ScopeFrontEnd,
        mid: u16,
        hmcad: bool,
    ) -> Result<(), CalibrationError> {
        if self.pcnt == 0 {
            for i in 0..scope.channels.len() {
                let ch = &mut scope.channels[i];
                if let Some(widest) = ch.vga.last() {
                    ch.vdiv = widest.key;
                }
                scope.write(link, DsoCommand::VoltsPerDiv(i))?;
                scope.channels[i].zero_offset = mid;
                scope.write(link, DsoCommand::Offset(i))?;
            }
        }
        // The HMCAD1511 front end needs a full interval to settle.
        if !hmcad || self.pcnt == ZERO_INTERVAL {
            if scope.profile.has_feature(caps::PREOFF) {
                self.enter(ZeroPhase::MidZero);
            } else {
                self.enter(ZeroPhase::TransFix);
            }
        } else {
            self.pcnt += 1;
        }
        Ok(())
    }

    fn trans_fix<T: UsbTransport>(
        &mut self,
        link: &mut CommandLink<T>,
        scope: &mut ScopeFrontEnd,
        status: &StatusSnapshot,
        top: u16,
        bom: u16,
        limit: f64,
    ) -> Result<(), CalibrationError> {
        let n = scope.channels.len().min(2);
        if self.pcnt == 0 {
            Self::write_offsets(link, scope, bom)?;
        } else if self.pcnt == ZERO_INTERVAL {
            for i in 0..n {
                self.margin[i] = mean_level(status, i, limit);
            }
        } else if self.pcnt == ZERO_INTERVAL + 1 {
            Self::write_offsets(link, scope, top)?;
        } else if self.pcnt == 2 * ZERO_INTERVAL {
            for i in 0..n {
                self.margin[i] -= mean_level(status, i, limit);
                self.margin[i] -= f64::from(bom - top);
                if self.margin[i].abs() > MARGIN_PASS {
                    self.margin[i] = round_away(self.margin[i]);
                    let ch = &mut scope.channels[i];
                    let trans = (f64::from(ch.vpos_trans) - self.margin[i]).clamp(0.0, MAX_TRANS);
                    log::debug!("Channel {} offset span {} -> {}", i, ch.vpos_trans, trans);
                    ch.vpos_trans = trans as u16;
                    scope.write(link, DsoCommand::Offset(i))?;
                } else {
                    self.margin[i] = 0.0;
                }
            }
            if self.margin[..n].iter().all(|m| *m == 0.0) {
                self.enter(ZeroPhase::MidZero);
            } else {
                self.retry()?;
                self.pcnt = 0;
            }
            return Ok(());
        }
        self.pcnt += 1;
        Ok(())
    }

    fn mid_zero<T: UsbTransport>(
        &mut self,
        link: &mut CommandLink<T>,
        scope: &mut ScopeFrontEnd,
        status: &StatusSnapshot,
        mid: u16,
    ) -> Result<(), CalibrationError> {
        if self.pcnt == 0 {
            if scope.channels.iter().any(|c| self.stage >= c.vga.len()) {
                if scope.profile.has_feature(caps::HMCAD1511) {
                    self.enter(ZeroPhase::FineGain);
                } else {
                    self.enter(ZeroPhase::Comb);
                }
                return Ok(());
            }
            for i in 0..scope.channels.len() {
                let ch = &mut scope.channels[i];
                ch.vdiv = ch.vga[self.stage].key;
                scope.write(link, DsoCommand::VoltsPerDiv(i))?;
                scope.channels[i].zero_offset = mid;
                scope.write(link, DsoCommand::Offset(i))?;
                scope.channels[i].vdiv = self.vdiv_backup[i];
            }
        }

        if self.pcnt != ZERO_INTERVAL {
            self.pcnt += 1;
            return Ok(());
        }

        let n = scope.channels.len().min(2);
        for i in 0..n {
            self.margin[i] = f64::from(mid) - status.channels[i].center();
        }
        if self.margin[..n].iter().all(|m| m.abs() < MARGIN_PASS) {
            log::debug!("Volts/div step {} zeroed", scope.channels[0].vga[self.stage].key);
            self.stage += 1;
            self.retries = 0;
        } else {
            self.retry()?;
            let preoff = scope.profile.has_feature(caps::PREOFF);
            for i in 0..n {
                let ch = &mut scope.channels[i];
                let adjusted = if preoff {
                    Self::split_preoff(ch, self.stage, self.margin[i])
                } else {
                    let current = f64::from(ch.vga[self.stage].preoff);
                    (current + round_away(self.margin[i])).clamp(0.0, f64::from(u16::MAX)) as u16
                };
                log::trace!("Channel {} step {} preoff -> {:#06x}", i, self.stage, adjusted);
                ch.vga[self.stage].preoff = adjusted;
            }
        }
        self.pcnt = 0;
        Ok(())
    }

    /// Distribute a residual onto the coarse (upper six bits) and fine
    /// (lower ten bits) halves of a pre-offset.
    fn split_preoff(ch: &Channel, stage: usize, margin: f64) -> u16 {
        let entry = ch.vga[stage];
        let (coarse_step, fine_step) = if entry.key < 500 {
            (f64::from((ch.vpos_trans >> 8) / 10), f64::from(ch.vpos_trans & 0xff) / 1000.0)
        } else {
            (f64::from(ch.vpos_trans >> 8), f64::from(ch.vpos_trans & 0xff) / 100.0)
        };
        if coarse_step == 0.0 || fine_step == 0.0 {
            return entry.preoff;
        }
        let voltage = margin * entry.key as f64 * 10.0 / 255.0;
        let coarse = (voltage / coarse_step + 0.5).floor() as i32;
        let fine = (-(voltage - f64::from(coarse) * coarse_step) / fine_step + 0.5).floor() as i32;
        let coarse = i32::from(entry.preoff >> 10) + coarse;
        let fine = i32::from(entry.preoff & 0x03ff) + fine;
        ((coarse << 10) + fine) as u16
    }

    /// Returns true once the last comb step has been taken.
    fn comb<T: UsbTransport>(
        &mut self,
        link: &mut CommandLink<T>,
        scope: &mut ScopeFrontEnd,
        status: &StatusSnapshot,
        top: u16,
        bom: u16,
        limit: f64,
    ) -> Result<bool, CalibrationError> {
        let end = if scope.channels.len() < 2 {
            1
        } else {
            let m0 = status.channels[0].acc_mean as f64;
            let m1 = status.channels[1].acc_mean as f64;
            let p = self.pcnt;
            if p == 1 {
                link.write_reg(COMB_CTRL, COMB_MEASURE_CH0)?;
                link.set_channel_enable(1, false)?;
                scope.channels[0].zero_offset = top;
                scope.write(link, DsoCommand::Offset(0))?;
            } else if p == ZERO_INTERVAL {
                scope.channels[0].comb_diff_top = ((m0 * 2.0 - m1 * 2.0) / limit) as i8;
                scope.channels[0].zero_offset = bom;
                scope.write(link, DsoCommand::Offset(0))?;
            } else if p == 2 * ZERO_INTERVAL {
                scope.channels[0].comb_diff_bom = ((m0 * 2.0 - m1 * 2.0) / limit) as i8;
            } else if p == 2 * ZERO_INTERVAL + 1 {
                link.write_reg(COMB_CTRL, COMB_MEASURE_CH1)?;
                link.set_channel_enable(1, true)?;
                link.set_channel_enable(0, false)?;
                scope.channels[1].zero_offset = top;
                scope.write(link, DsoCommand::Offset(1))?;
            } else if p == 3 * ZERO_INTERVAL {
                scope.channels[1].comb_diff_top = ((m1 * 2.0 - m0 * 2.0) / limit) as i8;
                scope.channels[1].zero_offset = bom;
                scope.write(link, DsoCommand::Offset(1))?;
            } else if p == 4 * ZERO_INTERVAL {
                scope.channels[1].comb_diff_bom = ((m1 * 2.0 - m0 * 2.0) / limit) as i8;
            }
            4 * ZERO_INTERVAL + 1
        };
        self.pcnt += 1;
        Ok(self.pcnt == end)
    }

    /// Trim the ADC lane gains until every lane reads within
    /// `MAX_ACC_VARIANCE` of the mean. `comb` selects the single-channel
    /// gain set. Returns true once the lanes match.
    fn fine_gain<T: UsbTransport>(
        &mut self,
        link: &mut CommandLink<T>,
        scope: &mut ScopeFrontEnd,
        status: &StatusSnapshot,
        bom: u16,
        comb: bool,
    ) -> Result<bool, CalibrationError> {
        if scope.channels.len() < 2 {
            return Ok(true);
        }
        let settle = (if scope.profile.speed == UsbSpeed::Super { 10 } else { 2 }) * ZERO_INTERVAL;

        if self.pcnt == 0 {
            Self::write_offsets(link, scope, bom)?;
            for ch in &mut scope.channels[..2] {
                *lane_gains_mut(ch, comb) = [1.0; 4];
                adc::write_channel_fgain(link, ch, lane_gains(ch, comb))?;
            }
        } else if comb && self.pcnt == ZERO_INTERVAL && !self.comb_ready {
            self.pcnt = 1;
            return Ok(false);
        } else if self.pcnt == settle {
            let skew = lane_skew(status, comb);
            let worst = skew.iter().fold(0.0f64, |m, s| m.max(s.abs()));
            if worst <= MAX_ACC_VARIANCE {
                log::debug!("{} matched, worst lane skew {:.6}", self.phase.as_str(), worst);
                return Ok(true);
            }
            self.retry()?;
            if scope.channels[..2].iter().any(|ch| gains_adjustable(ch, comb, &skew)) {
                for ch in &mut scope.channels[..2] {
                    trim_lane_gains(ch, comb, &skew);
                    adc::write_channel_fgain(link, ch, lane_gains(ch, comb))?;
                }
                self.pcnt = 1;
            } else {
                // ADC trims are exhausted, move the lanes in the FPGA and start over
                skew_fpga_gain(link, scope, comb, &skew)?;
                self.pcnt = 0;
                return Ok(false);
            }
        }
        self.pcnt += 1;
        Ok(false)
    }

    fn finish<T: UsbTransport>(
        &mut self,
        link: &mut CommandLink<T>,
        scope: &mut ScopeFrontEnd,
    ) -> Result<(), CalibrationError> {
        for i in 0..scope.channels.len() {
            scope.channels[i].vdiv = self.vdiv_backup[i];
            scope.write(link, DsoCommand::VoltsPerDiv(i))?;
            if scope.profile.has_feature(caps::AUTO_VGAIN) {
                retune_vgain(scope.profile, &mut scope.channels[i]);
            }
        }
        link.write_reg(COMB_CTRL, COMB_NORMAL)?;
        link.set_channel_enable(0, true)?;
        link.set_channel_enable(1, true)?;

        scope.settings.zero = false;
        self.enter(ZeroPhase::Done);
        scope.init(link)?;
        log::info!("Zero calibration finished");
        Ok(())
    }
}

fn lane_gains(ch: &Channel, comb: bool) -> [f64; 4] {
    if comb { ch.cali_comb_fgain } else { ch.cali_fgain }
}

fn lane_gains_mut(ch: &mut Channel, comb: bool) -> &mut [f64; 4] {
    if comb { &mut ch.cali_comb_fgain } else { &mut ch.cali_fgain }
}

/// Envelope lane (channel 0 main, p1, p2, p3, then channel 1) behind each
/// of a channel's four fine-gain slots.
fn gain_lanes(index: u16, comb: bool) -> [usize; 4] {
    match (index, comb) {
        (0, false) => [0, 2, 1, 3],
        (_, false) => [4, 6, 5, 7],
        (0, true) => [0, 1, 6, 7],
        (_, true) => [5, 4, 3, 2],
    }
}

/// Relative deviation of every lane accumulator from its reference mean:
/// the channel's own four lanes, or all eight when one channel owns them.
fn lane_skew(status: &StatusSnapshot, comb: bool) -> [f64; 8] {
    let mut lanes = [0.0; 8];
    for (i, ch) in status.channels.iter().take(2).enumerate() {
        lanes[4 * i] = ch.acc_mean as f64;
        lanes[4 * i + 1] = f64::from(ch.acc_mean_p1);
        lanes[4 * i + 2] = f64::from(ch.acc_mean_p2);
        lanes[4 * i + 3] = f64::from(ch.acc_mean_p3);
    }
    let mean = |group: &[f64]| group.iter().sum::<f64>() / group.len() as f64;
    let all = mean(&lanes);
    let per_channel = [mean(&lanes[..4]), mean(&lanes[4..])];
    let mut skew = [0.0; 8];
    for (i, s) in skew.iter_mut().enumerate() {
        let reference = if comb { all } else { per_channel[i / 4] };
        *s = if reference == 0.0 { 0.0 } else { lanes[i] / reference - 1.0 };
    }
    skew
}

/// Some off lane still has trim range left.
fn gains_adjustable(ch: &Channel, comb: bool, skew: &[f64; 8]) -> bool {
    lane_gains(ch, comb)
        .iter()
        .zip(gain_lanes(ch.index, comb))
        .any(|(gain, lane)| skew[lane].abs() > MAX_ACC_VARIANCE && *gain > FGAIN_MIN && *gain < FGAIN_MAX)
}

/// Move each lane gain half way against its skew.
fn trim_lane_gains(ch: &mut Channel, comb: bool, skew: &[f64; 8]) {
    let lanes = gain_lanes(ch.index, comb);
    for (gain, lane) in lane_gains_mut(ch, comb).iter_mut().zip(lanes) {
        let drift = skew[lane] / 2.0;
        if drift.abs() > MAX_ACC_VARIANCE / 2.0 {
            *gain /= 1.0 + drift;
        }
        *gain = gain.clamp(FGAIN_MIN, FGAIN_MAX);
    }
}

/// Flag lanes the ADC trim cannot reach: lanes reading low are boosted
/// through channel 0's trim word, lanes reading high cut through channel 1's.
fn skew_fpga_gain<T: UsbTransport>(
    link: &mut CommandLink<T>,
    scope: &mut ScopeFrontEnd,
    comb: bool,
    skew: &[f64; 8],
) -> Result<(), CommandError> {
    let threshold = 1.6 * MAX_ACC_VARIANCE;
    let mask = |hit: &dyn Fn(f64) -> bool| {
        skew.iter()
            .enumerate()
            .fold(0u16, |bits, (i, s)| bits | (u16::from(hit(*s)) << i))
    };
    let up = mask(&|s| -s > threshold);
    let down = mask(&|s| s > threshold);
    let shift = if comb { 0 } else { 8 };
    for (ch, bits) in scope.channels.iter_mut().take(2).zip([up, down]) {
        ch.digi_fgain |= bits << shift;
        log::debug!("Channel {} FPGA lane trim {:#06x}", ch.index, ch.digi_fgain);
        link.write_reg(adc::fpga_fgain_reg(ch.index, !comb), (ch.digi_fgain >> shift) as u8)?;
    }
    Ok(())
}

/// Shift every step's gain by how far the offset span moved from its
/// factory value.
fn retune_vgain(profile: &DeviceProfile, ch: &mut Channel) {
    let cur = i64::from(ch.vpos_trans);
    let def = i64::from(profile.default_pwmtrans);
    let delta = if cur > def {
        (cur - def) << 8
    } else {
        ((cur - def) << 7) & !0xFF
    };
    for entry in &mut ch.vga {
        if let Some(default) = profile.vga_defaults().find(|v| v.key == entry.key) {
            entry.vgain = (default.vgain as i64 + delta) as u64;
        }
    }
}

/// NVM location of one channel's records: (zero record, VGA record) and
/// the address byte each record echoes back.
fn record_addresses(profile: &DeviceProfile, index: u16) -> [(u16, u8); 2] {
    let zero_addr = ZERO_BASE_ADDR + index * (ZERO_RECORD_BYTES + VGA_RECORD_BYTES) as u16;
    let vga_addr = zero_addr + ZERO_RECORD_BYTES as u16;
    let physical = |addr: u16, page_slot: u16| {
        if profile.has_feature(caps::SEEP) {
            addr
        } else if profile.has_feature(caps::FLASH) {
            index * FLASH_PAGE + page_slot
        } else {
            (ZERO_BIG_ADDR << 8) + addr
        }
    };
    [
        (physical(zero_addr, 0), zero_addr as u8),
        (physical(vga_addr, 1), vga_addr as u8),
    ]
}

/// Zero record: address byte, one LE pre-offset per volts/div step, comb
/// differences, offset span, comb compensation, the FPGA lane trim, the four
/// dual-channel fine-gain codes and the first two single-channel codes. The
/// last two single-channel codes do not fit the record and stay in memory.
pub fn encode_zero_record(ch: &Channel, addr: u8) -> [u8; ZERO_RECORD_BYTES] {
    let mut rec = [0u8; ZERO_RECORD_BYTES];
    rec[0] = addr;
    for (i, entry) in ch.vga.iter().take(VGA_STEPS).enumerate() {
        rec[1 + 2 * i..3 + 2 * i].copy_from_slice(&entry.preoff.to_le_bytes());
    }
    let tail = 1 + 2 * VGA_STEPS;
    rec[tail] = ch.comb_diff_top as u8;
    rec[tail + 1] = ch.comb_diff_bom as u8;
    rec[tail + 2..tail + 4].copy_from_slice(&ch.vpos_trans.to_le_bytes());
    rec[tail + 4] = ch.comb_comp;
    rec[tail + 5..tail + 7].copy_from_slice(&ch.digi_fgain.to_le_bytes());
    for (i, gain) in ch.cali_fgain.iter().enumerate() {
        rec[tail + 7 + i] = fgain_code(*gain);
    }
    for (i, gain) in ch.cali_comb_fgain.iter().take(2).enumerate() {
        rec[tail + 11 + i] = fgain_code(*gain);
    }
    rec
}

pub fn decode_zero_record(rec: &[u8], ch: &mut Channel) {
    for (i, entry) in ch.vga.iter_mut().take(VGA_STEPS).enumerate() {
        entry.preoff = u16::from_le_bytes([rec[1 + 2 * i], rec[2 + 2 * i]]);
    }
    let tail = 1 + 2 * VGA_STEPS;
    ch.comb_diff_top = rec[tail] as i8;
    ch.comb_diff_bom = rec[tail + 1] as i8;
    ch.vpos_trans = u16::from_le_bytes([rec[tail + 2], rec[tail + 3]]);
    ch.comb_comp = rec[tail + 4];
    ch.digi_fgain = u16::from_le_bytes([rec[tail + 5], rec[tail + 6]]);
    for (i, gain) in ch.cali_fgain.iter_mut().enumerate() {
        *gain = fgain_from_code(rec[tail + 7 + i]);
    }
    for (i, gain) in ch.cali_comb_fgain.iter_mut().take(2).enumerate() {
        *gain = fgain_from_code(rec[tail + 11 + i]);
    }
}

/// VGA record: address byte and each step's gain without its low byte.
pub fn encode_vga_record(ch: &Channel, addr: u8) -> [u8; VGA_RECORD_BYTES] {
    let mut rec = [0u8; VGA_RECORD_BYTES];
    rec[0] = addr;
    for (i, entry) in ch.vga.iter().take(VGA_STEPS).enumerate() {
        rec[1 + 2 * i..3 + 2 * i].copy_from_slice(&((entry.vgain >> 8) as u16).to_le_bytes());
    }
    rec
}

pub fn decode_vga_record(rec: &[u8], ch: &mut Channel) {
    for (i, entry) in ch.vga.iter_mut().take(VGA_STEPS).enumerate() {
        entry.vgain = u64::from(u16::from_le_bytes([rec[1 + 2 * i], rec[2 + 2 * i]])) << 8;
    }
}

/// Load the 256-entry linearisation table that aligns the two interleaved
/// ADC cores of one channel.
pub fn program_comb_table<T: UsbTransport>(link: &mut CommandLink<T>, ch: &Channel) -> Result<(), CommandError> {
    let top = f64::from(ch.comb_diff_top);
    let slope = (f64::from(ch.comb_diff_bom) - top) / (2.0 * 255.0);
    let base = regs::COMB + (ch.index as u8) * 2;
    for i in 0..=255u8 {
        let x = f64::from(i);
        let value = (x + x * slope + top * 0.5 + 0.5) as i32;
        link.write_reg(base, i)?;
        link.write_reg(base + 1, value.clamp(0, 255) as u8)?;
    }
    Ok(())
}

/// Drop every trim back to the factory values of the profile.
pub fn restore_defaults(scope: &mut ScopeFrontEnd) {
    let profile = scope.profile;
    for ch in &mut scope.channels {
        ch.vpos_trans = profile.default_pwmtrans;
        ch.comb_comp = profile.default_comb_comp as u8;
        ch.digi_fgain = 0;
        ch.cali_fgain = [1.0; 4];
        ch.cali_comb_fgain = [1.0; 4];
        for entry in &mut ch.vga {
            if let Some(default) = profile.vga_defaults().find(|v| v.key == entry.key) {
                entry.vgain = default.vgain;
                entry.preoff = default.preoff;
            }
        }
    }
}

/// Write every channel's calibration to NVM, then load the comb tables.
pub fn persist<T: UsbTransport>(link: &mut CommandLink<T>, scope: &ScopeFrontEnd) -> Result<(), CalibrationError> {
    for ch in &scope.channels {
        let [(zero_phys, zero_addr), (vga_phys, vga_addr)] = record_addresses(scope.profile, ch.index);
        log::debug!("Saving calibration of channel {} at {:#06x}/{:#06x}", ch.index, zero_phys, vga_phys);

        link.write_reg(regs::CTR0, regs::CTR0_EEWP)?;
        let written = link
            .write_nvm(zero_phys, &encode_zero_record(ch, zero_addr))
            .and_then(|_| link.write_nvm(vga_phys, &encode_vga_record(ch, vga_addr)));
        link.write_reg(regs::CTR0, 0)?;
        written?;

        if !scope.profile.has_feature(caps::HMCAD1511) {
            program_comb_table(link, ch)?;
        }
    }
    Ok(())
}

/// Read one channel's stored calibration. When the FPGA was just loaded
/// its comb table is programmed from the record as well.
pub fn load_channel<T: UsbTransport>(
    link: &mut CommandLink<T>,
    profile: &DeviceProfile,
    ch: &mut Channel,
    fpga_done: bool,
) -> Result<(), CalibrationError> {
    let [(zero_phys, zero_addr), (vga_phys, vga_addr)] = record_addresses(profile, ch.index);

    let rec = link.read_nvm(zero_phys, ZERO_RECORD_BYTES)?;
    if rec[0] != zero_addr {
        return Err(CalibrationError::BadRecord {
            addr: zero_phys,
            found: rec[0],
        });
    }
    let mut loaded = ch.clone();
    decode_zero_record(&rec, &mut loaded);

    let rec = link.read_nvm(vga_phys, VGA_RECORD_BYTES)?;
    if rec[0] != vga_addr {
        return Err(CalibrationError::BadRecord {
            addr: vga_phys,
            found: rec[0],
        });
    }
    decode_vga_record(&rec, &mut loaded);

    if !fpga_done {
        program_comb_table(link, &loaded)?;
    }
    *ch = loaded;
    Ok(())
}

/// Load every channel. Returns false when any record is missing, in which
/// case that channel keeps its defaults and a new zero run is due.
pub fn load_calibration<T: UsbTransport>(
    link: &mut CommandLink<T>,
    scope: &mut ScopeFrontEnd,
    fpga_done: bool,
) -> Result<bool, CommandError> {
    let mut all = true;
    for ch in &mut scope.channels {
        match load_channel(link, scope.profile, ch, fpga_done) {
            Ok(()) => {}
            Err(CalibrationError::BadRecord { addr, found }) => {
                log::warn!("No calibration for channel {} at {:#06x} (found {:#04x})", ch.index, addr, found);
                all = false;
            }
            Err(CalibrationError::Command(e)) => return Err(e),
            Err(e) => {
                log::warn!("Calibration of channel {} not loaded: {e}", ch.index);
                all = false;
            }
        }
    }
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CtlDest, ProtocolGeneration, CH_CH0, CH_CH1};
    use crate::mock_transport::MockTransport;
    use crate::profile::{find_profile, DSL_VID};
    use crate::status::tests::envelope;
    use crate::status::DSO_PACKET_ID;

    const LIMIT: u64 = 1000;

    fn front_end(pid: u16) -> ScopeFrontEnd {
        let profile = find_profile(DSL_VID, pid, false).unwrap();
        let mut scope = ScopeFrontEnd::new(profile, profile.default_channel_mode.mode());
        scope.settings.limit_samples = LIMIT;
        scope
    }

    fn link() -> CommandLink<MockTransport> {
        CommandLink::new(MockTransport::new(false), ProtocolGeneration::Structured)
    }

    /// Envelope as a front end would report it: the accumulated mean
    /// follows the driven offset code, the mid-scale center is off by the
    /// step's pre-offset error.
    fn simulate(scope: &ScopeFrontEnd, cal: &ZeroCalibration, ideal: &[u16; 2]) -> StatusSnapshot {
        let mid = i32::from(scope.channels[0].offset_mid());
        let ch = |i: usize| {
            let c = &scope.channels[i];
            let center = match cal.vdiv_step() {
                Some(step) if step < c.vga.len() => mid - (i32::from(ideal[i]) - i32::from(c.vga[step].preoff)),
                _ => mid,
            };
            let center = center.clamp(0, 255) as u8;
            (center, center, u32::from(c.zero_offset) * LIMIT as u32)
        };
        let buf = envelope(DSO_PACKET_ID, 1, 1, [ch(0), ch(1)]);
        let mut status = StatusSnapshot::decode(&buf, 0).unwrap();
        status.validate(1, false);
        status
    }

    #[test]
    fn test_zero_converges_and_reinitialises() {
        let mut scope = front_end(0x0004);
        let ideal = [scope.channels[0].vga[0].preoff + 3, scope.channels[1].vga[0].preoff - 2];
        let mut link = link();
        let mut cal = ZeroCalibration::new();
        cal.start(&mut scope);
        assert!(scope.settings.zero);

        let mut finished = false;
        for _ in 0..5000 {
            let status = simulate(&scope, &cal, &ideal);
            if cal.advance(&mut link, &mut scope, &status).unwrap() == ZeroProgress::Finished {
                finished = true;
                break;
            }
        }
        assert!(finished);
        assert_eq!(cal.phase(), ZeroPhase::Done);
        assert!(!scope.settings.zero);
        for (i, ch) in scope.channels.iter().enumerate() {
            assert!(ch.vga.iter().all(|v| v.preoff == ideal[i]));
            assert_eq!(ch.vdiv, 1000);
        }
        let mock = link.transport();
        assert_eq!(mock.registers.last(), Some(&(COMB_CTRL, COMB_NORMAL)));
        // the front end is reprogrammed with the margin command last
        assert_eq!(mock.dso_words.last(), Some(&(0x40 + (8 << 8))));
        let enables: Vec<&[u8]> = mock
            .control_writes
            .iter()
            .filter(|w| w.data[0] == CtlDest::DsoEn0 as u8 || w.data[0] == CtlDest::DsoEn1 as u8)
            .map(|w| &w.data[..])
            .collect();
        assert_eq!(enables.len(), 5);
        assert_eq!(enables[3][4], CH_CH0);
        assert_eq!(enables[4][4], CH_CH1);
    }

    #[test]
    fn test_zero_gives_up_after_retry_limit() {
        let mut scope = front_end(0x0004);
        let mut link = link();
        let mut cal = ZeroCalibration::new();
        cal.start(&mut scope);
        let mut result = Ok(ZeroProgress::Running);
        // readings that never follow the driven offset
        for _ in 0..((MAX_PHASE_RETRIES + 2) * (2 * ZERO_INTERVAL + 1) + 10) {
            let buf = envelope(DSO_PACKET_ID, 1, 1, [(200, 200, 0), (200, 200, 0)]);
            let mut status = StatusSnapshot::decode(&buf, 0).unwrap();
            status.validate(1, false);
            result = cal.advance(&mut link, &mut scope, &status);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(CalibrationError::NotConverged { .. })));
    }

    #[test]
    fn test_invalid_snapshot_does_not_advance() {
        let mut scope = front_end(0x0004);
        let mut link = link();
        let mut cal = ZeroCalibration::new();
        cal.start(&mut scope);
        let buf = envelope(0x1234, 1, 1, [(0, 0, 0); 2]);
        let status = StatusSnapshot::decode(&buf, 0).unwrap();
        cal.advance(&mut link, &mut scope, &status).unwrap();
        assert_eq!(cal.phase(), ZeroPhase::WarmUp);
        assert!(link.transport().dso_words.is_empty());
    }

    #[test]
    fn test_preoff_devices_skip_span_trim() {
        let mut scope = front_end(0x0002);
        let mut link = link();
        let mut cal = ZeroCalibration::new();
        cal.start(&mut scope);
        let status = simulate(&scope, &cal, &[0, 0]);
        cal.advance(&mut link, &mut scope, &status).unwrap();
        assert_eq!(cal.phase(), ZeroPhase::MidZero);
        // widest range was applied to both channels
        let vdivs = link.transport().dso_words.iter().filter(|w| *w & 0x7f == 0x8).count();
        assert_eq!(vdivs, 2);
    }

    #[test]
    fn test_split_preoff_keeps_value_on_zero_margin() {
        let scope = front_end(0x0002);
        let ch = &scope.channels[0];
        assert_eq!(ZeroCalibration::split_preoff(ch, 7, 0.0), ch.vga[7].preoff);
    }

    #[test]
    fn test_auto_vgain_retune() {
        let profile = find_profile(DSL_VID, 0x0026, false).unwrap();
        let mut ch = Channel::new(0, profile.default_channel_mode.mode(), profile);
        ch.vpos_trans = profile.default_pwmtrans + 2;
        retune_vgain(profile, &mut ch);
        let default = profile.vga_defaults().next().unwrap();
        assert_eq!(ch.vga[0].vgain, default.vgain + (2 << 8));

        ch.vpos_trans = profile.default_pwmtrans - 1;
        retune_vgain(profile, &mut ch);
        assert_eq!(ch.vga[0].vgain, (default.vgain as i64 - 256) as u64);
    }

    #[test]
    fn test_record_addresses() {
        let seep = find_profile(DSL_VID, 0x0002, false).unwrap();
        assert_eq!(record_addresses(seep, 1), [(0x40 + 47, 0x6f), (0x40 + 47 + 30, 0x8d)]);
        let flash = find_profile(DSL_VID, 0x002B, false).unwrap();
        assert_eq!(record_addresses(flash, 1), [(8, 0x6f), (9, 0x8d)]);
        let plain = find_profile(DSL_VID, 0x0022, false).unwrap();
        assert_eq!(record_addresses(plain, 0)[0], (0x2040, 0x40));
    }

    #[test]
    fn test_persist_then_load() {
        let mut scope = front_end(0x0004);
        scope.channels[0].vga[2].preoff = 77;
        scope.channels[1].vpos_trans = 901;
        scope.channels[1].comb_diff_top = -4;
        scope.channels[1].vga[5].vgain = 0x1234_00;
        let mut link = link();
        persist(&mut link, &scope).unwrap();

        let mock = link.transport();
        assert_eq!(mock.registers[0], (regs::CTR0, regs::CTR0_EEWP));
        assert_eq!(mock.registers[1], (regs::CTR0, 0));
        // two writes per table entry, per channel
        assert_eq!(mock.registers.len(), 2 * (2 + 512));

        let mut fresh = front_end(0x0004);
        assert!(load_calibration(&mut link, &mut fresh, true).unwrap());
        assert_eq!(fresh.channels, scope.channels);
    }

    #[test]
    fn test_load_rejects_blank_nvm() {
        let mut scope = front_end(0x0004);
        let defaults = scope.channels.clone();
        let mut link = link();
        assert!(!load_calibration(&mut link, &mut scope, true).unwrap());
        assert_eq!(scope.channels, defaults);
    }

    #[test]
    fn test_comb_table_is_identity_without_skew() {
        let scope = front_end(0x0004);
        let mut link = link();
        program_comb_table(&mut link, &scope.channels[1]).unwrap();
        let regs_written = &link.transport().registers;
        assert_eq!(regs_written[0], (regs::COMB + 2, 0));
        assert_eq!(regs_written[1], (regs::COMB + 3, 0));
        assert_eq!(regs_written[511], (regs::COMB + 3, 255));
    }

    /// Envelope of an HMCAD1511 front end whose eight lanes carry fixed gain
    /// errors on top of the fine gains currently loaded.
    fn lane_status(scope: &ScopeFrontEnd, comb: bool, errors: &[f64; 8]) -> StatusSnapshot {
        let base = f64::from(scope.channels[0].zero_offset) * LIMIT as f64;
        let mut lanes = [0.0; 8];
        for ch in &scope.channels[..2] {
            for (gain, lane) in lane_gains(ch, comb).iter().zip(gain_lanes(ch.index, comb)) {
                lanes[lane] = base * (1.0 + errors[lane]) * gain;
            }
        }
        let buf = envelope(DSO_PACKET_ID, 1, 1, [(0, 0, 0); 2]);
        let mut status = StatusSnapshot::decode(&buf, 0).unwrap();
        status.validate(1, false);
        for (i, ch) in status.channels.iter_mut().enumerate() {
            ch.acc_mean = lanes[4 * i].round() as u64;
            ch.acc_mean_p1 = lanes[4 * i + 1].round() as u32;
            ch.acc_mean_p2 = lanes[4 * i + 2].round() as u32;
            ch.acc_mean_p3 = lanes[4 * i + 3].round() as u32;
        }
        status
    }

    #[test]
    fn test_hmcad_zero_trims_lane_gains() {
        let errors = [0.002, -0.001, 0.0015, -0.002, 0.001, 0.0, -0.0015, 0.0025];
        let mut scope = front_end(0x0028);
        let mut link = link();
        let mut cal = ZeroCalibration::new();
        cal.start(&mut scope);
        let ideal = [scope.channels[0].vga[0].preoff, scope.channels[1].vga[0].preoff];

        let mut phases = Vec::new();
        let mut held = 0;
        let mut finished = false;
        for _ in 0..20_000 {
            if phases.last() != Some(&cal.phase()) {
                phases.push(cal.phase());
            }
            if cal.awaiting_comb() {
                held += 1;
                if held == 3 * ZERO_INTERVAL {
                    cal.set_comb_ready(true);
                }
            }
            let status = match cal.phase() {
                ZeroPhase::FineGain => lane_status(&scope, false, &errors),
                ZeroPhase::CombFineGain => lane_status(&scope, true, &errors),
                _ => simulate(&scope, &cal, &ideal),
            };
            if cal.advance(&mut link, &mut scope, &status).unwrap() == ZeroProgress::Finished {
                finished = true;
                break;
            }
        }
        assert!(finished);
        assert_eq!(
            phases,
            [
                ZeroPhase::WarmUp,
                ZeroPhase::TransFix,
                ZeroPhase::MidZero,
                ZeroPhase::FineGain,
                ZeroPhase::CombFineGain
            ]
        );
        assert_eq!(held, 3 * ZERO_INTERVAL);

        for comb in [false, true] {
            let skew = lane_skew(&lane_status(&scope, comb, &errors), comb);
            assert!(skew.iter().all(|s| s.abs() <= MAX_ACC_VARIANCE), "{skew:?}");
        }
        for ch in &scope.channels {
            for gain in ch.cali_fgain.iter().chain(&ch.cali_comb_fgain) {
                assert!((FGAIN_MIN..=FGAIN_MAX).contains(gain));
            }
            assert_eq!(ch.digi_fgain, 0);
        }
        // lane 0 reads high against channel 0, so its gain comes down
        assert!(scope.channels[0].cali_fgain[0] < 1.0);
        assert!(scope.channels[0].cali_fgain[3] > 1.0);

        let branches: Vec<u8> = link
            .transport()
            .registers
            .iter()
            .filter(|(r, v)| *r == regs::ADCC && (0x34..=0x37).contains(v))
            .map(|(_, v)| *v)
            .collect();
        // initial load plus at least one trim in each of the two steps
        assert!(branches.len() >= 16);
        assert_eq!(branches[..4], [0x34, 0x35, 0x36, 0x37]);
    }

    #[test]
    fn test_comb_fine_gain_holds_until_ready() {
        let mut scope = front_end(0x0028);
        let mut link = link();
        let mut cal = ZeroCalibration::new();
        cal.start(&mut scope);
        cal.enter(ZeroPhase::CombFineGain);
        let status = lane_status(&scope, true, &[0.0; 8]);
        for _ in 0..10 * ZERO_INTERVAL {
            cal.advance(&mut link, &mut scope, &status).unwrap();
        }
        assert!(cal.awaiting_comb());
        assert_eq!(cal.phase(), ZeroPhase::CombFineGain);

        cal.set_comb_ready(true);
        let mut finished = false;
        for _ in 0..3 * ZERO_INTERVAL {
            let status = lane_status(&scope, true, &[0.0; 8]);
            if cal.advance(&mut link, &mut scope, &status).unwrap() == ZeroProgress::Finished {
                finished = true;
                break;
            }
        }
        assert!(finished);
    }

    #[test]
    fn test_unreachable_skew_moves_fpga_trim() {
        let mut skew = [0.0; 8];
        skew[1] = -0.001;
        skew[6] = 0.001;
        // within the dead band
        skew[2] = 0.0007;

        let mut scope = front_end(0x0028);
        let mut dual = link();
        skew_fpga_gain(&mut dual, &mut scope, false, &skew).unwrap();
        assert_eq!(scope.channels[0].digi_fgain, 0x0200);
        assert_eq!(scope.channels[1].digi_fgain, 0x4000);
        assert_eq!(dual.transport().registers, [(regs::ADCC + 4, 0x02), (regs::ADCC + 6, 0x40)]);

        let mut scope = front_end(0x0028);
        let mut single = link();
        skew_fpga_gain(&mut single, &mut scope, true, &skew).unwrap();
        assert_eq!(scope.channels[0].digi_fgain, 0x0002);
        assert_eq!(single.transport().registers, [(regs::ADCC + 3, 0x02), (regs::ADCC + 5, 0x40)]);
    }

    #[test]
    fn test_zero_record_keeps_lane_trims() {
        let scope = front_end(0x0028);
        let mut ch = scope.channels[1].clone();
        ch.digi_fgain = 0x1234;
        ch.cali_fgain = [1.0 + 3.0 / 8192.0, 1.0 - 4.0 / 8192.0, 1.0, 1.0 + 63.0 / 8192.0];
        ch.cali_comb_fgain = [1.0 - 2.0 / 8192.0, 1.0 + 1.0 / 8192.0, 1.005, 0.995];
        let rec = encode_zero_record(&ch, 0x6f);
        assert_eq!(rec[22..24], [0x34, 0x12]);

        let mut fresh = scope.channels[1].clone();
        decode_zero_record(&rec, &mut fresh);
        assert_eq!(fresh.digi_fgain, 0x1234);
        assert_eq!(fresh.cali_fgain, ch.cali_fgain);
        // only the first two single-channel gains are stored
        assert_eq!(fresh.cali_comb_fgain, [ch.cali_comb_fgain[0], ch.cali_comb_fgain[1], 1.0, 1.0]);
    }

    #[test]
    fn test_restore_defaults_clears_every_trim() {
        let mut scope = front_end(0x0028);
        let defaults = scope.channels.clone();
        for ch in &mut scope.channels {
            ch.vpos_trans += 7;
            ch.comb_comp ^= 0x0F;
            ch.digi_fgain = 0x0102;
            ch.cali_fgain[2] = 1.003;
            ch.cali_comb_fgain[0] = 0.997;
            ch.vga[1].vgain += 0x200;
            ch.vga[1].preoff += 9;
        }
        restore_defaults(&mut scope);
        assert_eq!(scope.channels, defaults);
    }

    #[test]
    fn test_start_restores_factory_span_and_preoff() {
        let mut scope = front_end(0x0004);
        let defaults = scope.channels.clone();
        let profile = scope.profile;
        scope.channels[0].vpos_trans = profile.default_pwmtrans + 40;
        scope.channels[1].vga[3].preoff ^= 0x55;
        scope.channels[1].vga[3].vgain += 0x100;

        let mut cal = ZeroCalibration::new();
        cal.start(&mut scope);
        assert_eq!(scope.channels[0].vpos_trans, profile.default_pwmtrans);
        assert_eq!(scope.channels[1].vga[3].preoff, defaults[1].vga[3].preoff);
        // step gains are left alone
        assert_eq!(scope.channels[1].vga[3].vgain, defaults[1].vga[3].vgain + 0x100);
    }
}
