use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use nusb::transfer::{Control, ControlType, Queue, Recipient, RequestBuffer, TransferError};
use nusb::{DeviceInfo, Interface, Speed};

pub const CONTROL_TIMEOUT: Duration = Duration::from_millis(3000);
pub const BULK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Outcome of a single bulk IN transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    /// Deadline passed; the buffer may still carry partial data.
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Error,
}

impl TransferStatus {
    /// Completed and timed-out transfers both carry usable data.
    pub fn is_ok(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::TimedOut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Completed => "completed",
            TransferStatus::TimedOut => "timed out",
            TransferStatus::Cancelled => "cancelled",
            TransferStatus::Stall => "stall",
            TransferStatus::NoDevice => "no device",
            TransferStatus::Error => "error",
        }
    }
}

impl From<TransferError> for TransferStatus {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Cancelled => TransferStatus::Cancelled,
            TransferError::Stall => TransferStatus::Stall,
            TransferError::Disconnected => TransferStatus::NoDevice,
            TransferError::Fault | TransferError::Unknown => TransferStatus::Error,
        }
    }
}

/// A finished bulk IN transfer, identified by the id given at submission.
#[derive(Debug, Clone)]
pub struct Completion {
    pub id: usize,
    pub status: TransferStatus,
    pub data: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("Transfer timed out after {0:?}")]
    Timeout(Duration),
}

/// The USB operations the acquisition engine needs from a host controller.
///
/// Control transfers are vendor requests addressed to the device. Bulk IN
/// transfers are asynchronous: they are submitted with an id and retired
/// through [`UsbTransport::wait_completion`] in submission order. A bulk IN
/// submitted without a deadline stays queued until the device answers or
/// the queue is cancelled.
pub trait UsbTransport {
    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn bulk_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn submit_bulk_in(
        &mut self,
        endpoint: u8,
        id: usize,
        len: usize,
        deadline: Option<Duration>,
    ) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next finished transfer. Returning
    /// `None` only means nothing finished in time.
    fn wait_completion(&mut self, timeout: Duration) -> Option<Completion>;

    fn pending(&self) -> usize;

    fn cancel_all(&mut self);

    fn is_super_speed(&self) -> bool;
}

struct InFlight {
    id: usize,
    deadline: Option<Instant>,
}

struct EndpointQueue {
    queue: Queue<RequestBuffer>,
    in_flight: VecDeque<InFlight>,
}

/// [`UsbTransport`] backed by `nusb`, driving bulk futures on a
/// current-thread tokio runtime.
pub struct NusbTransport {
    interface: Interface,
    runtime: tokio::runtime::Runtime,
    super_speed: bool,
    queues: HashMap<u8, EndpointQueue>,
    ready: VecDeque<Completion>,
}

impl NusbTransport {
    pub fn open(info: &DeviceInfo) -> Result<Self, TransportError> {
        let super_speed = matches!(info.speed(), Some(Speed::Super | Speed::SuperPlus));
        log::debug!(
            "Opening USB device {:03}:{:03} ({:04x}:{:04x}), super speed: {}",
            info.bus_number(),
            info.device_address(),
            info.vendor_id(),
            info.product_id(),
            super_speed
        );
        let device = info.open()?;
        let interface = device.claim_interface(0)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;

        Ok(Self {
            interface,
            runtime,
            super_speed,
            queues: HashMap::new(),
            ready: VecDeque::new(),
        })
    }

    fn vendor_control(request: u8, value: u16, index: u16) -> Control {
        Control {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request,
            value,
            index,
        }
    }

    /// Cancel every queue whose head transfer is past its deadline and
    /// retire the drained transfers as timed out.
    fn expire(&mut self, now: Instant) {
        for (endpoint, ep) in &mut self.queues {
            let expired = ep
                .in_flight
                .front()
                .and_then(|t| t.deadline)
                .is_some_and(|deadline| deadline <= now);
            if !expired {
                continue;
            }
            log::debug!("Bulk IN on endpoint {endpoint:#04x} timed out, cancelling queue");
            ep.queue.cancel_all();
            while let Some(transfer) = ep.in_flight.pop_front() {
                let completion = self.runtime.block_on(ep.queue.next_complete());
                let status = match completion.status {
                    Ok(()) => TransferStatus::Completed,
                    Err(TransferError::Cancelled) => TransferStatus::TimedOut,
                    Err(e) => e.into(),
                };
                self.ready.push_back(Completion {
                    id: transfer.id,
                    status,
                    data: completion.data,
                });
            }
        }
    }
}

impl UsbTransport for NusbTransport {
    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let control = Self::vendor_control(request, value, index);
        Ok(self.interface.control_out_blocking(control, data, timeout)?)
    }

    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let control = Self::vendor_control(request, value, index);
        Ok(self.interface.control_in_blocking(control, buf, timeout)?)
    }

    fn bulk_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let transfer = self.interface.bulk_out(endpoint, data.to_vec());
        let completion = self
            .runtime
            .block_on(async { tokio::time::timeout(timeout, transfer).await })
            .map_err(|_| TransportError::Timeout(timeout))?;
        completion.status?;
        Ok(completion.data.actual_length())
    }

    fn submit_bulk_in(
        &mut self,
        endpoint: u8,
        id: usize,
        len: usize,
        deadline: Option<Duration>,
    ) -> Result<(), TransportError> {
        let interface = &self.interface;
        let ep = self.queues.entry(endpoint).or_insert_with(|| EndpointQueue {
            queue: interface.bulk_in_queue(endpoint),
            in_flight: VecDeque::new(),
        });
        ep.queue.submit(RequestBuffer::new(len));
        ep.in_flight.push_back(InFlight {
            id,
            deadline: deadline.map(|d| Instant::now() + d),
        });
        Ok(())
    }

    fn wait_completion(&mut self, timeout: Duration) -> Option<Completion> {
        if let Some(done) = self.ready.pop_front() {
            return Some(done);
        }

        let now = Instant::now();
        let poll_end = now + timeout;
        let endpoint = self
            .queues
            .iter()
            .filter_map(|(ep, q)| q.in_flight.front().map(|t| (*ep, t.deadline.unwrap_or(poll_end))))
            .min_by_key(|(_, deadline)| *deadline);
        let (endpoint, deadline) = endpoint?;
        let wait = timeout.min(deadline.saturating_duration_since(now));

        let ep = self.queues.get_mut(&endpoint)?;
        let finished = self
            .runtime
            .block_on(async { tokio::time::timeout(wait, ep.queue.next_complete()).await });

        match finished {
            Ok(completion) => {
                let transfer = ep.in_flight.pop_front()?;
                let status = match completion.status {
                    Ok(()) => TransferStatus::Completed,
                    Err(e) => e.into(),
                };
                Some(Completion {
                    id: transfer.id,
                    status,
                    data: completion.data,
                })
            }
            Err(_) => {
                self.expire(Instant::now());
                self.ready.pop_front()
            }
        }
    }

    fn pending(&self) -> usize {
        self.ready.len() + self.queues.values().map(|q| q.in_flight.len()).sum::<usize>()
    }

    fn cancel_all(&mut self) {
        for ep in self.queues.values_mut() {
            ep.queue.cancel_all();
        }
    }

    fn is_super_speed(&self) -> bool {
        self.super_speed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_status_is_ok() {
        assert!(TransferStatus::Completed.is_ok());
        assert!(TransferStatus::TimedOut.is_ok());
        assert!(!TransferStatus::Cancelled.is_ok());
        assert!(!TransferStatus::Stall.is_ok());
        assert!(!TransferStatus::NoDevice.is_ok());
    }

    #[test]
    fn test_transfer_error_mapping() {
        assert_eq!(
            TransferStatus::from(TransferError::Disconnected),
            TransferStatus::NoDevice
        );
        assert_eq!(TransferStatus::from(TransferError::Stall), TransferStatus::Stall);
        assert_eq!(TransferStatus::from(TransferError::Fault), TransferStatus::Error);
    }
}
