//! Sample-by-sample trigger matcher for captures where hardware stage
//! matching is bypassed.

use crate::session_bus::{Packet, PacketSink, TriggerPosition};
use crate::trigger_config::TRIGGER_STAGES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchState {
    Stage(usize),
    Fired,
}

/// Where a trigger fired inside a scanned buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerHit {
    /// Byte offset of the first sample after the match.
    pub offset: usize,
    /// The matched samples, one per stage, in the capture's sample width.
    pub prefix: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SoftwareTrigger {
    masks: [u16; TRIGGER_STAGES],
    values: [u16; TRIGGER_STAGES],
    matched: [u16; TRIGGER_STAGES],
    wide: bool,
    state: MatchState,
}

impl SoftwareTrigger {
    /// Build a matcher from `(mask, value)` stage pairs. With no stages the
    /// matcher starts fired and forwards everything.
    pub fn new(stages: &[(u16, u16)], wide: bool) -> Self {
        let mut masks = [0u16; TRIGGER_STAGES];
        let mut values = [0u16; TRIGGER_STAGES];
        for (i, (mask, value)) in stages.iter().take(TRIGGER_STAGES).enumerate() {
            masks[i] = *mask;
            values[i] = *value & *mask;
        }
        let state = if stages.is_empty() {
            MatchState::Fired
        } else {
            MatchState::Stage(0)
        };
        Self {
            masks,
            values,
            matched: [0; TRIGGER_STAGES],
            wide,
            state,
        }
    }

    pub fn is_fired(&self) -> bool {
        self.state == MatchState::Fired
    }

    pub fn sample_width(&self) -> usize {
        if self.wide { 2 } else { 1 }
    }

    fn sample_at(&self, data: &[u8], i: usize) -> u16 {
        if self.wide {
            u16::from_le_bytes([data[2 * i], data[2 * i + 1]])
        } else {
            u16::from(data[i])
        }
    }

    /// Scan a buffer. Returns the hit when the last stage matches inside it.
    /// A matcher that has already fired returns `None`.
    pub fn scan(&mut self, data: &[u8]) -> Option<TriggerHit> {
        let MatchState::Stage(mut stage) = self.state else {
            return None;
        };
        let width = self.sample_width();
        let count = data.len() / width;

        let mut i: isize = 0;
        while (i as usize) < count {
            let sample = self.sample_at(data, i as usize);
            if sample & self.masks[stage] == self.values[stage] {
                self.matched[stage] = sample;
                stage += 1;
                if stage == TRIGGER_STAGES || self.masks[stage] == 0 {
                    self.state = MatchState::Fired;
                    let prefix = self.matched[..stage]
                        .iter()
                        .flat_map(|s| s.to_le_bytes().into_iter().take(width))
                        .collect();
                    log::debug!("Software trigger fired at sample {} after {} stages", i, stage);
                    return Some(TriggerHit {
                        offset: (i as usize + 1) * width,
                        prefix,
                    });
                }
            } else if stage > 0 {
                // Matches that started in an earlier buffer cannot be revisited.
                i = (i - stage as isize).max(-1);
                stage = 0;
            }
            i += 1;
        }
        self.state = MatchState::Stage(stage);
        None
    }

    /// Scan a logic buffer and publish what should be forwarded: nothing
    /// before the trigger, then the matched prefix, a Trigger event and the
    /// remainder of the buffer.
    pub fn feed(&mut self, data: &[u8], sink: &mut dyn PacketSink) {
        let unit_size = self.sample_width() as u16;
        if self.is_fired() {
            if !data.is_empty() {
                sink.send(&Packet::logic(data, unit_size));
            }
            return;
        }
        if let Some(hit) = self.scan(data) {
            sink.send(&Packet::logic(&hit.prefix, unit_size));
            sink.send(&Packet::Trigger(TriggerPosition::default()));
            let rest = &data[hit.offset.min(data.len())..];
            if !rest.is_empty() {
                sink.send(&Packet::logic(rest, unit_size));
            }
        }
    }
}
