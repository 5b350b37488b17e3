//! Bulk transfer scheduler for a running capture.
//!
//! The hardware answers an armed capture with one small trigger-position
//! header followed by sample data. [`Acquisition`] submits the header, waits
//! for it, then keeps a bounded set of data transfers in flight and turns
//! each completion into session bus packets until the capture stops. Exactly
//! one [`Packet::End`] is published per capture, whatever the outcome.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::calibration::CalibrationError;
use crate::command::{regs, status_bits, CommandError, CommandLink, ProtocolGeneration};
use crate::profile::{caps, DeviceProfile, OperationMode, UsbSpeed};
use crate::session_bus::{AnalogPayload, DsoPayload, Header, Packet, PacketSink, TriggerPosition};
use crate::setting_blob::{ArmParams, HardwareSetting, ATOMIC_SAMPLES};
use crate::soft_trigger::SoftwareTrigger;
use crate::status::StatusSnapshot;
use crate::usb_transport::{Completion, TransferStatus, TransportError, UsbTransport};

/// Bulk IN endpoint carrying the header and sample data.
pub const DATA_ENDPOINT: u8 = 0x86;
/// First word of a well formed trigger-position header.
pub const TRIG_CHECK_ID: u32 = 0x5555_5555;
/// Upper bound on concurrently submitted data transfers.
pub const MAX_TRANSFERS: usize = 64;

const HEADER_ID: usize = 0;
const HEADER_RETRIES: u8 = 3;
const EMPTY_LIMIT: u32 = 16;
const BUFFERED_TRANSFER_BYTES: u64 = 1024 * 1024;
const BUFFERED_TIMEOUT: Duration = Duration::from_millis(20);
const STREAM_RATE_CAP: u64 = 100_000_000;
const FEED_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Failed to submit transfer: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error("FPGA did not report GPIF done after arming (status {status:#04x})")]
    ArmFailed { status: u8 },

    #[error("Trigger header rejected {attempts} times")]
    HeaderRejected { attempts: u8 },

    #[error("{count} consecutive transfers returned no data")]
    Stalled { count: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Init,
    StartPending,
    Data,
    Stop,
    Finish,
    Error,
}

impl AcquisitionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquisitionState::Init => "init",
            AcquisitionState::StartPending => "start pending",
            AcquisitionState::Data => "data",
            AcquisitionState::Stop => "stop",
            AcquisitionState::Finish => "finish",
            AcquisitionState::Error => "error",
        }
    }
}

/// Transfer sizing derived from the sample rate and channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPlan {
    pub bytes_per_ms: u64,
    pub header_size: usize,
    pub transfer_size: usize,
    pub transfer_count: usize,
    /// Wait per completion poll.
    pub timeout: Duration,
}

impl BufferPlan {
    /// Data rate of the capture in bytes per millisecond.
    pub fn bytes_per_ms(mode: OperationMode, samplerate: u64, enabled: u32, hw_min_samplerate: u64) -> u64 {
        let channels = f64::from(enabled);
        match mode {
            OperationMode::Logic => (samplerate as f64 / 1000.0 * channels / 8.0).ceil() as u64,
            _ if samplerate > STREAM_RATE_CAP => STREAM_RATE_CAP / 1000 * u64::from(enabled),
            _ => (samplerate.max(hw_min_samplerate) as f64 / 1000.0 * channels).ceil() as u64,
        }
    }

    pub fn new(params: &ArmParams<'_>, dso_depth: u64, super_speed: bool) -> Self {
        let (single_ms, total_ms, align) = if super_speed { (10, 40, 1024) } else { (20, 100, 512) };
        let header_size = align as usize;
        let enabled = params.enabled_channels();
        let bytes_per_ms = Self::bytes_per_ms(
            params.mode,
            params.samplerate,
            enabled,
            params.channel_mode.hw_min_samplerate,
        )
        .max(1);

        let raw = match params.mode {
            OperationMode::Oscilloscope if params.instant => dso_depth,
            OperationMode::Oscilloscope => params.actual_samples * u64::from(enabled) + header_size as u64,
            _ if params.stream => single_ms * bytes_per_ms,
            _ => BUFFERED_TRANSFER_BYTES,
        };
        let transfer_size = raw.div_ceil(align) * align;

        let transfer_count = if params.stream {
            ((total_ms * bytes_per_ms) as f64 / transfer_size as f64).ceil() as usize
        } else {
            1
        }
        .clamp(1, MAX_TRANSFERS);

        let timeout = if params.stream {
            let ms = transfer_size * transfer_count as u64 / bytes_per_ms;
            Duration::from_millis(ms + ms / 4)
        } else {
            BUFFERED_TIMEOUT
        };

        log::debug!(
            "Buffer plan: {bytes_per_ms} B/ms, {transfer_count} x {transfer_size} bytes, timeout {timeout:?}"
        );
        Self {
            bytes_per_ms,
            header_size,
            transfer_size: transfer_size as usize,
            transfer_count,
            timeout,
        }
    }
}

/// Send the setting blob and leave the FPGA waiting for the start command.
pub fn arm<T: UsbTransport>(
    link: &mut CommandLink<T>,
    params: &ArmParams<'_>,
    profile: &DeviceProfile,
) -> Result<(), AcquisitionError> {
    let (setting, ext) = HardwareSetting::derive(params);
    let structured = link.generation() == ProtocolGeneration::Structured;

    link.stop()?;
    if structured && profile.speed != UsbSpeed::Super {
        link.set_wordwide()?;
    }
    link.send_setting_count(HardwareSetting::word_count())?;
    if structured {
        link.wait_hw_status(status_bits::SYS_CLR)?;
    }
    link.write_setting(&setting.encode())?;
    if profile.has_feature(caps::LA_CH32) {
        link.write_setting(&ext.encode())?;
    }

    if structured {
        link.set_intrdy(true)?;
        let status = link.hw_status()?;
        if status & status_bits::GPIF_DONE == 0 {
            log::error!("Arming failed, hardware status {status:#04x}");
            return Err(AcquisitionError::ArmFailed { status });
        }
    }
    log::info!("FPGA armed for {} capture", params.mode.as_str());
    Ok(())
}

/// Cross-thread control of a running [`Acquisition`].
#[derive(Debug, Clone, Default)]
pub struct AcquisitionHandle {
    abort: Arc<AtomicBool>,
    data_lock: Arc<AtomicBool>,
}

impl AcquisitionHandle {
    /// Ask the pipeline to stop. Transfers already in flight still retire.
    pub fn stop(&self) {
        if !self.abort.swap(true, Ordering::SeqCst) {
            log::info!("Acquisition stop requested");
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Clear a stop request left over from the previous capture.
    pub fn rearm(&self) {
        self.abort.store(false, Ordering::SeqCst);
    }

    /// While locked, completions are consumed and resubmitted but nothing
    /// is published.
    pub fn set_data_lock(&self, locked: bool) {
        self.data_lock.store(locked, Ordering::SeqCst);
    }

    pub fn is_data_locked(&self) -> bool {
        self.data_lock.load(Ordering::SeqCst)
    }
}

/// Per-capture switches that are not part of the setting blob.
#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
    /// Zero calibration is running: the echoed divider is 1 and samples
    /// start at the buffer head.
    pub zeroing: bool,
    /// Stages for the software matcher, empty when the hardware triggers.
    pub software_stages: Vec<(u16, u16)>,
}

impl CaptureOptions {
    /// The FPGA runs untriggered and the host finds the trigger.
    pub fn uses_software_trigger(&self) -> bool {
        !self.software_stages.is_empty()
    }
}

/// Totals reported once the capture finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcquisitionSummary {
    pub samples: u64,
    pub bytes: u64,
    pub overflow: bool,
    /// Last failed transfer status seen while streaming, if any.
    pub transfer_error: Option<TransferStatus>,
}

/// An in-flight bulk request. The buffer belongs to the transport until the
/// completion comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSlot {
    pub id: usize,
    pub len: usize,
    pub in_flight: bool,
}

#[derive(Debug, Clone)]
struct CaptureContext {
    mode: OperationMode,
    stream: bool,
    instant: bool,
    is_loop: bool,
    zeroing: bool,
    limit_samples: u64,
    actual_samples: u64,
    actual_bytes: u64,
    enabled: u32,
    mode_channels: u16,
    unit_bits: u8,
    unit_pitch: u16,
    divider: u32,
}

impl CaptureContext {
    fn new(params: &ArmParams<'_>, zeroing: bool) -> Self {
        let enabled = params.enabled_channels().max(1);
        Self {
            mode: params.mode,
            stream: params.stream,
            instant: params.instant,
            is_loop: params.is_loop,
            zeroing,
            limit_samples: params.limit_samples,
            actual_samples: params.actual_samples,
            actual_bytes: params.actual_samples / ATOMIC_SAMPLES * u64::from(enabled) * 8,
            enabled,
            mode_channels: params.channel_mode.num,
            unit_bits: params.channel_mode.unit_bits,
            unit_pitch: params.unit_pitch(),
            divider: if zeroing { 1 } else { params.divider() },
        }
    }

    fn wide(&self) -> bool {
        self.enabled > 8
    }

    fn limited(&self) -> bool {
        self.limit_samples != 0 && !self.is_loop
    }

    fn logic_unit_size(&self) -> u16 {
        if self.wide() { 2 } else { 1 }
    }

    /// u16 word offset of the status envelope behind the samples.
    fn envelope_offset(&self) -> usize {
        let group = (u64::from(self.mode_channels) / u64::from(self.enabled)).max(1);
        (self.actual_samples / group) as usize
    }

    /// Buffered logic captures stop early; keep only what was sampled.
    fn apply_remaining(&mut self, remain: u64) {
        let captured = self.limit_samples.saturating_sub(remain) & !(ATOMIC_SAMPLES - 1);
        self.actual_bytes = captured / ATOMIC_SAMPLES * u64::from(self.enabled) * 8;
        self.actual_samples = self.actual_bytes / u64::from(self.enabled) * 8;
        log::debug!("Hardware captured {} samples ({} bytes)", self.actual_samples, self.actual_bytes);
    }
}

/// Completion-driven capture pipeline for one device.
pub struct Acquisition<'a, T: UsbTransport> {
    link: &'a mut CommandLink<T>,
    handle: AcquisitionHandle,
    plan: BufferPlan,
    ctx: CaptureContext,
    state: AcquisitionState,
    slots: Vec<TransferSlot>,
    header_retries: u8,
    failures: u32,
    empty_polls: u32,
    force_stop_sent: bool,
    end_sent: bool,
    num_bytes: u64,
    num_samples: u64,
    summary: AcquisitionSummary,
    soft_trigger: Option<SoftwareTrigger>,
    snapshot: Option<StatusSnapshot>,
    fault: Option<AcquisitionError>,
}

impl<'a, T: UsbTransport> Acquisition<'a, T> {
    pub fn new(
        link: &'a mut CommandLink<T>,
        params: &ArmParams<'_>,
        plan: BufferPlan,
        options: CaptureOptions,
    ) -> Self {
        let ctx = CaptureContext::new(params, options.zeroing);
        let soft_trigger = (options.uses_software_trigger() && ctx.mode == OperationMode::Logic)
            .then(|| SoftwareTrigger::new(&options.software_stages, ctx.wide()));
        Self {
            link,
            handle: AcquisitionHandle::default(),
            plan,
            ctx,
            state: AcquisitionState::Init,
            slots: Vec::with_capacity(plan.transfer_count + 1),
            header_retries: 0,
            failures: 0,
            empty_polls: 0,
            force_stop_sent: false,
            end_sent: false,
            num_bytes: 0,
            num_samples: 0,
            summary: AcquisitionSummary::default(),
            soft_trigger,
            snapshot: None,
            fault: None,
        }
    }

    /// Share an existing handle, so a stop requested before the capture was
    /// built still reaches it.
    pub fn with_handle(mut self, handle: AcquisitionHandle) -> Self {
        self.handle = handle;
        self
    }

    pub fn handle(&self) -> AcquisitionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn plan(&self) -> &BufferPlan {
        &self.plan
    }

    /// Most recent status envelope, valid or not.
    pub fn snapshot(&self) -> Option<&StatusSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn slots(&self) -> &[TransferSlot] {
        &self.slots
    }

    fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.in_flight).count()
    }

    fn enter(&mut self, state: AcquisitionState) {
        if self.state == state {
            return;
        }
        log::debug!("Acquisition {} -> {}", self.state.as_str(), state.as_str());
        let leaving_data = matches!(self.state, AcquisitionState::Data | AcquisitionState::StartPending);
        self.state = state;
        if leaving_data && matches!(state, AcquisitionState::Stop | AcquisitionState::Error) {
            self.link.transport_mut().cancel_all();
        }
    }

    fn fail(&mut self, err: AcquisitionError) {
        log::error!("Acquisition failed: {err}");
        if self.fault.is_none() {
            self.fault = Some(err);
        }
        self.enter(AcquisitionState::Error);
    }

    /// Queue a bulk IN without a deadline. The trigger may take arbitrarily
    /// long; `plan.timeout` only paces the completion polls.
    fn submit(&mut self, id: usize, len: usize) -> Result<(), TransportError> {
        self.link.transport_mut().submit_bulk_in(DATA_ENDPOINT, id, len, None)?;
        match self.slots.iter_mut().find(|s| s.id == id) {
            Some(slot) => slot.in_flight = true,
            None => self.slots.push(TransferSlot { id, len, in_flight: true }),
        }
        Ok(())
    }

    fn release(&mut self, id: usize) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.id == id) {
            slot.in_flight = false;
        }
    }

    /// Stop the capture from the thread that runs it.
    pub fn stop(&mut self) {
        self.handle.stop();
        self.force_stop();
    }

    fn force_stop(&mut self) {
        if self.force_stop_sent {
            return;
        }
        self.force_stop_sent = true;
        if let Err(err) = self.link.write_reg(regs::CTR0, regs::CTR0_FORCE_RDY) {
            log::warn!("Force-ready write failed: {err}");
        }
    }

    /// Submit the header transfer, issue the start command and publish the
    /// session header.
    pub fn start(&mut self, sink: &mut dyn PacketSink) -> Result<(), AcquisitionError> {
        let header_size = self.plan.header_size;
        self.submit(HEADER_ID, header_size)?;
        self.enter(AcquisitionState::StartPending);
        if let Err(err) = self.link.start(self.ctx.wide()) {
            self.link.transport_mut().cancel_all();
            self.release(HEADER_ID);
            self.state = AcquisitionState::Error;
            return Err(err.into());
        }
        sink.send(&Packet::Header(Header {
            feed_version: FEED_VERSION,
            start_time: SystemTime::now(),
        }));
        log::info!(
            "Acquisition started: {} x {} byte transfers",
            self.plan.transfer_count,
            self.plan.transfer_size
        );
        Ok(())
    }

    pub fn run(&mut self, sink: &mut dyn PacketSink) -> Result<AcquisitionSummary, AcquisitionError> {
        self.run_with(sink, |_, _| Ok(()))
    }

    /// Drive the capture to completion. `on_status` sees every valid status
    /// envelope together with the command link, which is how zero
    /// calibration steps the front end between frames.
    pub fn run_with<F>(
        &mut self,
        sink: &mut dyn PacketSink,
        mut on_status: F,
    ) -> Result<AcquisitionSummary, AcquisitionError>
    where
        F: FnMut(&mut CommandLink<T>, &StatusSnapshot) -> Result<(), AcquisitionError>,
    {
        let span = tracing::info_span!("acquisition", mode = self.ctx.mode.as_str());
        let _enter = span.enter();

        if self.state == AcquisitionState::Init {
            self.start(sink)?;
        }

        while self.state != AcquisitionState::Finish {
            if self.handle.is_aborted() {
                self.force_stop();
            }
            let timeout = self.plan.timeout;
            match self.link.transport_mut().wait_completion(timeout) {
                Some(completion) => {
                    self.empty_polls = 0;
                    self.on_completion(completion, sink, &mut on_status);
                }
                None => self.on_idle(sink),
            }
        }

        if let Err(err) = self.link.stop() {
            log::warn!("Stop command failed: {err}");
        }
        if self.link.generation() == ProtocolGeneration::Structured {
            match self.link.hw_status() {
                Ok(status) => log::debug!("Hardware status after capture: {status:#04x}"),
                Err(err) => log::warn!("Reading hardware status failed: {err}"),
            }
        }

        self.summary.samples = self.num_samples;
        self.summary.bytes = self.num_bytes;
        match self.fault.take() {
            Some(err) => Err(err),
            None => Ok(self.summary),
        }
    }

    fn on_idle(&mut self, sink: &mut dyn PacketSink) {
        self.empty_polls += 1;
        if self.in_flight() == 0 || self.link.transport().pending() == 0 {
            self.slots.iter_mut().for_each(|s| s.in_flight = false);
            self.finish(sink);
            return;
        }
        if self.handle.is_aborted() {
            self.link.transport_mut().cancel_all();
            return;
        }
        if self.empty_polls % EMPTY_LIMIT == 0
            && self.ctx.stream
            && self.state == AcquisitionState::Data
            && self.link.generation() == ProtocolGeneration::Structured
        {
            match self.link.hw_status() {
                Ok(status) if status & status_bits::SYS_OVERFLOW != 0 => {
                    log::warn!("Hardware buffer overflow, stopping capture");
                    self.summary.overflow = true;
                    sink.send(&Packet::Overflow);
                    self.handle.stop();
                }
                Ok(_) => {}
                Err(err) => log::warn!("Overflow poll failed: {err}"),
            }
        }
    }

    fn on_completion<F>(&mut self, completion: Completion, sink: &mut dyn PacketSink, on_status: &mut F)
    where
        F: FnMut(&mut CommandLink<T>, &StatusSnapshot) -> Result<(), AcquisitionError>,
    {
        #[cfg(feature = "cpu-profiling")]
        if let Some(client) = tracy_client::Client::running() {
            client.frame_mark();
        }

        log::trace!(
            "Transfer {} {}: {} bytes",
            completion.id,
            completion.status.as_str(),
            completion.data.len()
        );
        if !self.slots.iter().any(|s| s.id == completion.id && s.in_flight) {
            log::warn!("Completion for unknown transfer {}", completion.id);
            return;
        }
        if completion.id == HEADER_ID {
            self.on_header(&completion, sink);
        } else {
            self.on_data(completion, sink, on_status);
        }
        self.finish(sink);
    }

    fn parse_header(&mut self, completion: &Completion) -> Option<TriggerPosition> {
        let buf = &completion.data;
        if completion.status != TransferStatus::Completed || buf.len() != self.plan.header_size {
            return None;
        }
        let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        if word(0) != TRIG_CHECK_ID {
            return None;
        }
        let remain = u64::from(word(12)) | (u64::from(word(16)) << 32);
        let buffered_logic = self.ctx.mode == OperationMode::Logic && !self.ctx.stream;
        if buffered_logic {
            if remain >= self.ctx.limit_samples {
                return None;
            }
            self.ctx.apply_remaining(remain);
        }
        Some(TriggerPosition {
            real_pos: word(4),
            ram_saddr: word(8),
            remain_cnt: remain,
            status: word(20),
            data_error: false,
        })
    }

    fn on_header(&mut self, completion: &Completion, sink: &mut dyn PacketSink) {
        self.release(HEADER_ID);
        if self.handle.is_aborted() {
            self.enter(AcquisitionState::Stop);
            return;
        }

        if let Some(position) = self.parse_header(completion) {
            // An untriggered FPGA reports no trigger; the matcher publishes it.
            if self.soft_trigger.is_none() {
                log::debug!("Trigger at {} (remaining {})", position.real_pos, position.remain_cnt);
                sink.send(&Packet::Trigger(position));
            }
            self.enter(AcquisitionState::Data);
            for id in 1..=self.plan.transfer_count {
                let len = self.plan.transfer_size;
                if let Err(err) = self.submit(id, len) {
                    self.fail(err.into());
                    return;
                }
            }
            return;
        }

        log::error!(
            "Trigger header rejected ({}, {} bytes)",
            completion.status.as_str(),
            completion.data.len()
        );
        sink.send(&Packet::Trigger(TriggerPosition {
            data_error: true,
            ..TriggerPosition::default()
        }));
        if self.header_retries < HEADER_RETRIES {
            self.header_retries += 1;
            let header_size = self.plan.header_size;
            if let Err(err) = self.submit(HEADER_ID, header_size) {
                self.fail(err.into());
            }
        } else {
            self.fail(AcquisitionError::HeaderRejected {
                attempts: self.header_retries + 1,
            });
        }
    }

    fn on_data<F>(&mut self, completion: Completion, sink: &mut dyn PacketSink, on_status: &mut F)
    where
        F: FnMut(&mut CommandLink<T>, &StatusSnapshot) -> Result<(), AcquisitionError>,
    {
        if self.handle.is_aborted() && self.state == AcquisitionState::Data {
            self.enter(AcquisitionState::Stop);
        }

        if !completion.status.is_ok() {
            self.failures += 1;
            if self.state == AcquisitionState::Data {
                log::error!("Transfer {} failed: {}", completion.id, completion.status.as_str());
                self.summary.transfer_error = Some(completion.status);
                self.enter(AcquisitionState::Stop);
            }
        } else if completion.data.is_empty() {
            self.failures += 1;
        } else {
            self.failures = 0;
        }
        if self.failures > EMPTY_LIMIT && self.state == AcquisitionState::Data {
            self.fail(AcquisitionError::Stalled { count: self.failures });
        }

        if self.state == AcquisitionState::Data && !completion.data.is_empty() {
            self.dispatch(&completion.data, sink, on_status);
        }

        if self.state == AcquisitionState::Data && !self.handle.is_aborted() {
            let len = self.plan.transfer_size;
            if let Err(err) = self.submit(completion.id, len) {
                self.release(completion.id);
                self.fail(err.into());
            }
        } else {
            self.release(completion.id);
        }
    }

    fn dispatch<F>(&mut self, data: &[u8], sink: &mut dyn PacketSink, on_status: &mut F)
    where
        F: FnMut(&mut CommandLink<T>, &StatusSnapshot) -> Result<(), AcquisitionError>,
    {
        let publish = !self.handle.is_data_locked();
        match self.ctx.mode {
            OperationMode::Logic => self.dispatch_logic(data, sink, publish),
            OperationMode::Oscilloscope => self.dispatch_dso(data, sink, publish, on_status),
            OperationMode::Analog => {
                let unit_bytes = usize::from(self.ctx.unit_bits).div_ceil(8).max(1);
                let channels = self.ctx.enabled as usize;
                let num_samples = data.len() / (unit_bytes * channels);
                if publish {
                    sink.send(&Packet::Analog(AnalogPayload {
                        num_samples,
                        channels,
                        unit_bits: self.ctx.unit_bits,
                        unit_pitch: self.ctx.unit_pitch,
                        data: Cow::Borrowed(data),
                    }));
                }
                self.num_samples += num_samples as u64;
                self.num_bytes += data.len() as u64;
            }
        }
    }

    fn dispatch_logic(&mut self, data: &[u8], sink: &mut dyn PacketSink, publish: bool) {
        let limited = self.ctx.limited();
        let len = if limited {
            let remaining = self.ctx.actual_bytes.saturating_sub(self.num_bytes);
            data.len().min(remaining as usize)
        } else {
            data.len()
        };
        let chunk = &data[..len];

        if publish && !chunk.is_empty() {
            match self.soft_trigger.as_mut() {
                Some(matcher) => matcher.feed(chunk, sink),
                None => sink.send(&Packet::logic(chunk, self.ctx.logic_unit_size())),
            }
        }
        self.num_bytes += len as u64;
        self.num_samples += len as u64 * 8 / u64::from(self.ctx.enabled);

        if limited && self.num_bytes >= self.ctx.actual_bytes {
            log::debug!("Capture complete after {} bytes", self.num_bytes);
            self.enter(AcquisitionState::Stop);
        }
    }

    fn dispatch_dso<F>(&mut self, data: &[u8], sink: &mut dyn PacketSink, publish: bool, on_status: &mut F)
    where
        F: FnMut(&mut CommandLink<T>, &StatusSnapshot) -> Result<(), AcquisitionError>,
    {
        let snapshot = if self.ctx.instant {
            StatusSnapshot {
                vlen: (self.plan.transfer_size / usize::from(self.ctx.mode_channels.max(1))) as u32,
                valid: true,
                ..StatusSnapshot::default()
            }
        } else {
            match StatusSnapshot::decode(data, self.ctx.envelope_offset()) {
                Ok(mut snapshot) => {
                    if !self.ctx.zeroing {
                        snapshot.merge_partial_means(self.ctx.enabled == 1);
                    }
                    snapshot.validate(self.ctx.divider, false);
                    snapshot
                }
                Err(err) => {
                    log::warn!("{err}");
                    StatusSnapshot::default()
                }
            }
        };
        self.snapshot = Some(snapshot);

        if !snapshot.valid {
            log::debug!(
                "Status envelope rejected (id {:#06x}, divider {}, vlen {})",
                snapshot.pkt_id,
                snapshot.sample_divider,
                snapshot.vlen
            );
            if publish {
                sink.send(&Packet::Abandon);
            }
            return;
        }

        let channels = self.ctx.enabled as usize;
        let num_samples = (u64::from(self.ctx.mode_channels) * u64::from(snapshot.vlen) / u64::from(self.ctx.enabled))
            .min(self.ctx.limit_samples) as usize;
        let start = if self.ctx.zeroing {
            0
        } else {
            2 * usize::from(snapshot.trig_offset)
        };
        let start = start.min(data.len());
        let end = (start + num_samples * channels).min(data.len());
        if publish {
            sink.send(&Packet::Dso(DsoPayload {
                num_samples,
                channels,
                samplerate_toggle: snapshot.sample_divider_toggle,
                trig_flag: snapshot.trig_flag,
                trig_ch: snapshot.trig_ch,
                data: Cow::Borrowed(&data[start..end]),
            }));
        }
        self.num_samples += num_samples as u64;
        self.num_bytes += (end - start) as u64;

        if let Err(err) = on_status(&mut *self.link, &snapshot) {
            self.fail(err);
            return;
        }

        if self.ctx.instant && self.ctx.limited() && self.num_samples >= self.ctx.actual_samples {
            self.enter(AcquisitionState::Stop);
        }
    }

    /// Publish End once the last transfer has retired.
    fn finish(&mut self, sink: &mut dyn PacketSink) {
        if self.in_flight() != 0 || self.state == AcquisitionState::Finish {
            return;
        }
        if !self.end_sent {
            self.end_sent = true;
            sink.send(&Packet::End);
            log::info!(
                "Acquisition finished ({}): {} samples, {} bytes",
                self.state.as_str(),
                self.num_samples,
                self.num_bytes
            );
        }
        self.state = AcquisitionState::Finish;
    }
}
