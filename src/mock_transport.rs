//! In-memory device used by unit tests: answers vendor requests from a
//! small register/NVM model and replays scripted bulk IN completions.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::command::{status_bits, CtlDest};
use crate::usb_transport::{Completion, TransferStatus, TransportError, UsbTransport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlWrite {
    pub request: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub endpoint: u8,
    pub id: usize,
    pub len: usize,
    /// Expiry on the mock clock, when submitted with a deadline.
    pub expires: Option<Duration>,
}

/// Scripted result for the next bulk IN completion. `None` models a poll
/// that returns without any finished transfer.
pub type ScriptedTransfer = Option<(TransferStatus, Vec<u8>)>;

pub struct MockTransport {
    legacy: bool,
    pub super_speed: bool,
    pub fw_version: (u8, u8),
    pub revid: u8,
    pub hw_status: u8,
    pub status_bytes: Vec<u8>,
    pub nvm: HashMap<u16, u8>,
    pub registers: Vec<(u8, u8)>,
    pub dso_words: Vec<u64>,
    pub control_writes: Vec<ControlWrite>,
    pub bulk_writes: Vec<(u8, Vec<u8>)>,
    pub submissions: Vec<Submission>,
    pub script: VecDeque<ScriptedTransfer>,
    pub short_bulk: bool,
    pub fail_control: bool,
    /// Expire in-flight transfers past their deadline the way a host
    /// controller does, reporting them as empty timed-out completions.
    pub honour_deadlines: bool,
    /// Mock time, advanced by every poll that finds nothing.
    pub clock: Duration,
    in_flight: VecDeque<Submission>,
    cancelled: VecDeque<Submission>,
    pending_read: Option<(u8, u16, usize)>,
}

impl MockTransport {
    pub fn new(legacy: bool) -> Self {
        Self {
            legacy,
            super_speed: false,
            fw_version: (2, 0),
            revid: 1,
            hw_status: status_bits::GPIF_DONE
                | status_bits::FPGA_DONE
                | status_bits::FPGA_INIT_B
                | status_bits::SYS_CLR,
            status_bytes: vec![0; 256],
            nvm: HashMap::new(),
            registers: Vec::new(),
            dso_words: Vec::new(),
            control_writes: Vec::new(),
            bulk_writes: Vec::new(),
            submissions: Vec::new(),
            script: VecDeque::new(),
            short_bulk: false,
            fail_control: false,
            honour_deadlines: false,
            clock: Duration::ZERO,
            in_flight: VecDeque::new(),
            cancelled: VecDeque::new(),
            pending_read: None,
        }
    }

    pub fn push_completion(&mut self, status: TransferStatus, data: Vec<u8>) {
        self.script.push_back(Some((status, data)));
    }

    pub fn push_empty_poll(&mut self) {
        self.script.push_back(None);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn nvm_bytes(&self, addr: u16, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| {
                let a = addr.wrapping_add(i as u16);
                self.nvm.get(&a).copied().unwrap_or(0xFF)
            })
            .collect()
    }

    fn store_nvm(&mut self, addr: u16, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.nvm.insert(addr.wrapping_add(i as u16), *b);
        }
    }

    fn structured_write(&mut self, packet: &[u8]) {
        let dest = packet[0];
        let offset = u16::from_le_bytes([packet[1], packet[2]]);
        let payload = &packet[4..];
        if dest == CtlDest::Nvm as u8 {
            self.store_nvm(offset, payload);
        } else if dest == CtlDest::I2cReg as u8 {
            self.registers.push((offset as u8, payload[0]));
        } else if dest == CtlDest::I2cDso as u8 {
            let mut word = [0u8; 8];
            word.copy_from_slice(&payload[..8]);
            self.dso_words.push(u64::from_le_bytes(word));
        }
    }

    fn structured_read(&self, dest: u8, offset: u16, size: usize) -> Vec<u8> {
        let mut out = if dest == CtlDest::FwVersion as u8 {
            vec![self.fw_version.0, self.fw_version.1]
        } else if dest == CtlDest::RevidVersion as u8 {
            vec![self.revid]
        } else if dest == CtlDest::HwStatus as u8 {
            vec![self.hw_status]
        } else if dest == CtlDest::I2cStatus as u8 {
            let start = usize::from(offset);
            self.status_bytes[start..start + size].to_vec()
        } else if dest == CtlDest::Nvm as u8 {
            self.nvm_bytes(offset, size)
        } else {
            Vec::new()
        };
        out.resize(size, 0);
        out
    }
}

impl UsbTransport for MockTransport {
    fn control_out(
        &mut self,
        request: u8,
        _value: u16,
        _index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        if self.fail_control {
            return Err(TransportError::Timeout(Duration::from_millis(3000)));
        }
        self.control_writes.push(ControlWrite {
            request,
            data: data.to_vec(),
        });
        match (self.legacy, request) {
            (false, 0xb0) => self.structured_write(data),
            (false, 0xb1) => {
                let offset = u16::from_le_bytes([data[1], data[2]]);
                self.pending_read = Some((data[0], offset, usize::from(data[3])));
            }
            (true, 0xb7) => {
                self.pending_read = Some((0, u16::from(data[0]), usize::from(data[1] - data[0])));
            }
            (true, 0xb8) => self.registers.push((data[0], data[1])),
            (true, 0xb9) => {
                let addr = u16::from_le_bytes([data[0], data[1]]);
                let len = usize::from(data[2]);
                let payload = data[3..3 + len].to_vec();
                self.store_nvm(addr, &payload);
            }
            (true, 0xbb) => {
                let addr = u16::from_le_bytes([data[0], data[1]]);
                self.pending_read = Some((0, addr, usize::from(data[2])));
            }
            _ => {}
        }
        Ok(data.len())
    }

    fn control_in(
        &mut self,
        request: u8,
        _value: u16,
        _index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        if self.fail_control {
            return Err(TransportError::Timeout(Duration::from_millis(3000)));
        }
        let reply = match (self.legacy, request) {
            (false, 0xb2) => {
                let (dest, offset, size) = self.pending_read.take().unwrap_or((0xFF, 0, 0));
                self.structured_read(dest, offset, size)
            }
            (true, 0xb0) => vec![self.fw_version.0, self.fw_version.1],
            (true, 0xb1) => vec![self.revid],
            (true, 0xb6) => {
                let (_, begin, len) = self.pending_read.take().unwrap_or((0, 0, 0));
                let start = usize::from(begin);
                self.status_bytes[start..start + len].to_vec()
            }
            (true, 0xba) => {
                let (_, addr, len) = self.pending_read.take().unwrap_or((0, 0, 0));
                self.nvm_bytes(addr, len)
            }
            (true, 0xbc) => vec![u8::from(self.hw_status & status_bits::FPGA_DONE != 0)],
            _ => Vec::new(),
        };
        let n = reply.len().min(buf.len());
        buf[..n].copy_from_slice(&reply[..n]);
        Ok(n)
    }

    fn bulk_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.bulk_writes.push((endpoint, data.to_vec()));
        if self.short_bulk {
            Ok(data.len().saturating_sub(1))
        } else {
            Ok(data.len())
        }
    }

    fn submit_bulk_in(
        &mut self,
        endpoint: u8,
        id: usize,
        len: usize,
        deadline: Option<Duration>,
    ) -> Result<(), TransportError> {
        let submission = Submission {
            endpoint,
            id,
            len,
            expires: deadline.map(|d| self.clock + d),
        };
        self.submissions.push(submission.clone());
        self.in_flight.push_back(submission);
        Ok(())
    }

    fn wait_completion(&mut self, timeout: Duration) -> Option<Completion> {
        if let Some(cancelled) = self.cancelled.pop_front() {
            return Some(Completion {
                id: cancelled.id,
                status: TransferStatus::Cancelled,
                data: Vec::new(),
            });
        }
        if self.in_flight.is_empty() {
            return None;
        }
        let expired = self
            .in_flight
            .front()
            .and_then(|t| t.expires)
            .is_some_and(|expires| expires <= self.clock);
        if self.honour_deadlines && expired {
            let transfer = self.in_flight.pop_front()?;
            return Some(Completion {
                id: transfer.id,
                status: TransferStatus::TimedOut,
                data: Vec::new(),
            });
        }
        let Some((status, data)) = self.script.pop_front()? else {
            self.clock += timeout;
            return None;
        };
        let transfer = self.in_flight.pop_front()?;
        Some(Completion {
            id: transfer.id,
            status,
            data,
        })
    }

    fn pending(&self) -> usize {
        self.in_flight.len() + self.cancelled.len()
    }

    fn cancel_all(&mut self) {
        self.cancelled.extend(self.in_flight.drain(..));
    }

    fn is_super_speed(&self) -> bool {
        self.super_speed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_expires_in_flight_transfer() {
        let mut mock = MockTransport::new(false);
        mock.honour_deadlines = true;
        mock.push_empty_poll();
        mock.submit_bulk_in(0x86, 3, 512, Some(Duration::from_millis(20))).unwrap();

        assert!(mock.wait_completion(Duration::from_millis(25)).is_none());
        let completion = mock.wait_completion(Duration::from_millis(25)).unwrap();
        assert_eq!(completion.id, 3);
        assert_eq!(completion.status, TransferStatus::TimedOut);
        assert!(completion.data.is_empty());
        assert_eq!(mock.in_flight(), 0);
    }

    #[test]
    fn test_no_deadline_outlives_empty_polls() {
        let mut mock = MockTransport::new(false);
        mock.honour_deadlines = true;
        mock.submit_bulk_in(0x86, 0, 512, None).unwrap();
        for _ in 0..10 {
            mock.push_empty_poll();
        }
        mock.push_completion(TransferStatus::Completed, vec![7; 512]);

        for _ in 0..10 {
            assert!(mock.wait_completion(Duration::from_millis(50)).is_none());
        }
        assert_eq!(mock.clock, Duration::from_millis(500));
        let completion = mock.wait_completion(Duration::from_millis(50)).unwrap();
        assert_eq!(completion.status, TransferStatus::Completed);
        assert_eq!(completion.data.len(), 512);
    }
}
