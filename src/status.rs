//! Oscilloscope status envelope appended by the hardware after each block of
//! samples: packet id, echoed sample divider and per-channel measurements.

/// Packet id of a well formed envelope.
pub const DSO_PACKET_ID: u16 = 0xa500;
/// Envelope length in bytes, both channels included.
pub const STATUS_BYTES: usize = 2 * 96;

const CHANNEL_STRIDE_WORDS: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("Status envelope at word {offset} needs {needed} bytes, buffer has {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStatus {
    pub max: u8,
    pub min: u8,
    pub cyc_cnt: u32,
    pub cyc_tlen: u32,
    pub cyc_plen: u32,
    pub cyc_llen: u32,
    pub level_valid: bool,
    pub plevel: bool,
    pub high_level: u8,
    pub low_level: u8,
    pub cyc_rlen: u32,
    pub cyc_flen: u32,
    pub acc_square: u64,
    pub acc_mean: u64,
    pub acc_mean_p1: u32,
    pub acc_mean_p2: u32,
    pub acc_mean_p3: u32,
    /// Offset code the hardware applied while capturing.
    pub hw_offset: u8,
}

impl ChannelStatus {
    pub fn center(&self) -> f64 {
        (f64::from(self.max) + f64::from(self.min)) / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusSnapshot {
    pub pkt_id: u16,
    pub vlen: u32,
    pub stream_mode: bool,
    pub measure_valid: bool,
    pub sample_divider: u32,
    pub sample_divider_toggle: bool,
    pub trig_flag: bool,
    pub trig_ch: u8,
    pub trig_offset: u8,
    pub channels: [ChannelStatus; 2],
    /// Set once the envelope passed [`StatusSnapshot::validate`].
    pub valid: bool,
}

struct Reader<'a> {
    buf: &'a [u8],
    base: usize,
}

impl Reader<'_> {
    fn u8_at(&self, word: usize, high: bool) -> u8 {
        self.buf[self.base + word * 2 + usize::from(high)]
    }

    fn u16_at(&self, word: usize) -> u16 {
        let i = self.base + word * 2;
        u16::from_le_bytes([self.buf[i], self.buf[i + 1]])
    }

    fn u32_at(&self, word: usize) -> u32 {
        let i = self.base + word * 2;
        u32::from_le_bytes([self.buf[i], self.buf[i + 1], self.buf[i + 2], self.buf[i + 3]])
    }

    fn u64_at(&self, word: usize) -> u64 {
        let i = self.base + word * 2;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.buf[i..i + 8]);
        u64::from_le_bytes(bytes)
    }
}

impl StatusSnapshot {
    /// Decode the envelope starting at u16 word `word_offset` of `buf`.
    pub fn decode(buf: &[u8], word_offset: usize) -> Result<Self, StatusError> {
        let base = word_offset * 2;
        if buf.len() < base + STATUS_BYTES {
            return Err(StatusError::Truncated {
                offset: word_offset,
                needed: base + STATUS_BYTES,
                available: buf.len(),
            });
        }
        let r = Reader { buf, base };

        let vlen = r.u32_at(2);
        let divider = r.u32_at(4);
        let trig = r.u8_at(5, true);

        let mut channels = [ChannelStatus::default(); 2];
        for (index, ch) in channels.iter_mut().enumerate() {
            let w = index * CHANNEL_STRIDE_WORDS;
            let levels = r.u32_at(w + 42);
            *ch = ChannelStatus {
                max: r.u8_at(w + 33, false),
                min: r.u8_at(w + 33, true),
                cyc_cnt: r.u32_at(w + 34),
                cyc_tlen: r.u32_at(w + 36),
                cyc_plen: r.u32_at(w + 38),
                cyc_llen: r.u32_at(w + 40),
                level_valid: levels & 0x0000_8000 != 0,
                plevel: levels & 0x0000_4000 != 0,
                high_level: r.u8_at(w + 43, false),
                low_level: r.u8_at(w + 43, true),
                cyc_rlen: r.u32_at(w + 44),
                cyc_flen: r.u32_at(w + 46),
                acc_square: r.u64_at(w + 48) & 0x0000_FFFF_FFFF_FFFF,
                acc_mean: u64::from(r.u32_at(w + 52)),
                acc_mean_p1: r.u32_at(w + 54),
                acc_mean_p2: r.u32_at(w + 56),
                acc_mean_p3: r.u32_at(w + 58),
                hw_offset: r.u8_at(51 + CHANNEL_STRIDE_WORDS * index, false),
            };
        }

        Ok(Self {
            pkt_id: r.u16_at(0),
            vlen: vlen & 0x0FFF_FFFF,
            stream_mode: vlen & 0x8000_0000 != 0,
            measure_valid: vlen & 0x4000_0000 != 0,
            sample_divider: divider & 0x00FF_FFFF,
            sample_divider_toggle: divider & 0x8000_0000 != 0,
            trig_flag: divider & 0x4000_0000 != 0,
            trig_ch: (trig & 0x38) >> 3,
            trig_offset: trig & 0x07,
            channels,
            valid: false,
        })
    }

    /// Check the envelope against the configured divider. Instant captures
    /// only carry a packet id.
    pub fn validate(&mut self, expected_divider: u32, instant: bool) -> bool {
        self.valid = if instant {
            self.pkt_id == DSO_PACKET_ID
        } else {
            self.pkt_id == DSO_PACKET_ID && self.sample_divider == expected_divider && self.vlen != 0
        };
        self.valid
    }

    /// Fold the partial accumulators into `acc_mean`. With a single enabled
    /// channel both ADC lanes sample the same input and are merged.
    pub fn merge_partial_means(&mut self, single_channel: bool) {
        for ch in &mut self.channels {
            ch.acc_mean += u64::from(ch.acc_mean_p1) + u64::from(ch.acc_mean_p2) + u64::from(ch.acc_mean_p3);
        }
        if single_channel {
            let square = self.channels[0].acc_square + self.channels[1].acc_square;
            let mean = self.channels[0].acc_mean + self.channels[1].acc_mean;
            for ch in &mut self.channels {
                ch.acc_square = square;
                ch.acc_mean = mean;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build an envelope with the given id, vlen, divider and per-channel
    /// (max, min, acc_mean) values.
    pub(crate) fn envelope(pkt_id: u16, vlen: u32, divider: u32, ch: [(u8, u8, u32); 2]) -> Vec<u8> {
        let mut buf = vec![0u8; STATUS_BYTES];
        buf[0..2].copy_from_slice(&pkt_id.to_le_bytes());
        buf[4..8].copy_from_slice(&vlen.to_le_bytes());
        buf[8..12].copy_from_slice(&divider.to_le_bytes());
        for (i, (max, min, mean)) in ch.into_iter().enumerate() {
            let w = i * 32;
            buf[(w + 33) * 2] = max;
            buf[(w + 33) * 2 + 1] = min;
            buf[(w + 52) * 2..(w + 52) * 2 + 4].copy_from_slice(&mean.to_le_bytes());
        }
        buf
    }

    #[test]
    fn test_decode_header_fields() {
        let mut buf = envelope(DSO_PACKET_ID, 0x8000_0400, 0x4000_0005, [(200, 50, 0), (0, 0, 0)]);
        // top divider byte also carries the trigger channel and offset
        buf[11] = 0x40 | (3 << 3) | 5;
        let snapshot = StatusSnapshot::decode(&buf, 0).unwrap();
        assert_eq!(snapshot.pkt_id, DSO_PACKET_ID);
        assert_eq!(snapshot.vlen, 0x400);
        assert!(snapshot.stream_mode);
        assert_eq!(snapshot.sample_divider, 5);
        assert!(snapshot.trig_flag);
        assert_eq!((snapshot.trig_ch, snapshot.trig_offset), (3, 5));
        assert_eq!(snapshot.channels[0].center(), 125.0);
    }

    #[test]
    fn test_decode_at_offset() {
        let mut buf = vec![0xEE; 100];
        buf.extend(envelope(DSO_PACKET_ID, 1, 1, [(1, 2, 3), (4, 5, 6)]));
        let snapshot = StatusSnapshot::decode(&buf, 50).unwrap();
        assert_eq!(snapshot.channels[1].max, 4);
        assert_eq!(snapshot.channels[1].acc_mean, 6);
        assert!(StatusSnapshot::decode(&buf, 51).is_err());
    }

    #[test]
    fn test_validation() {
        let buf = envelope(DSO_PACKET_ID, 10, 4, [(0, 0, 0); 2]);
        let mut snapshot = StatusSnapshot::decode(&buf, 0).unwrap();
        assert!(snapshot.validate(4, false));
        assert!(!snapshot.validate(5, false));
        assert!(snapshot.validate(5, true));

        let buf = envelope(0x1234, 10, 4, [(0, 0, 0); 2]);
        let mut snapshot = StatusSnapshot::decode(&buf, 0).unwrap();
        assert!(!snapshot.validate(4, false));
        assert!(!snapshot.valid);

        let buf = envelope(DSO_PACKET_ID, 0, 4, [(0, 0, 0); 2]);
        let mut snapshot = StatusSnapshot::decode(&buf, 0).unwrap();
        assert!(!snapshot.validate(4, false));
    }

    #[test]
    fn test_merge_single_channel() {
        let buf = envelope(DSO_PACKET_ID, 1, 1, [(0, 0, 10), (0, 0, 20)]);
        let mut snapshot = StatusSnapshot::decode(&buf, 0).unwrap();
        snapshot.merge_partial_means(true);
        assert_eq!(snapshot.channels[0].acc_mean, 30);
        assert_eq!(snapshot.channels[1].acc_mean, 30);
    }
}
