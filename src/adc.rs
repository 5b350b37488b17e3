//! HMCAD1511 ADC set-up: lane routing for one or two channels and the fine
//! gain trims that align its four interleaved lanes.
//!
//! The ADC is reached through the `ADCC` register pair. Each configuration
//! word is shifted in as a burst of byte writes to the same register.

use crate::channel::Channel;
use crate::command::{regs, CommandError, CommandLink};
use crate::usb_transport::UsbTransport;

/// Fine-gain step of one register code.
const FGAIN_STEP: f64 = 1.0 / 8192.0;
const FGAIN_BRANCH_BASE: u8 = 0x34;

struct AdcWrite {
    reg: u8,
    bytes: &'static [u8],
}

const fn adcc(bytes: &'static [u8]) -> AdcWrite {
    AdcWrite { reg: regs::ADCC, bytes }
}

const fn ctrl(bytes: &'static [u8]) -> AdcWrite {
    AdcWrite { reg: regs::ADCC + 1, bytes }
}

/// Routing of the four ADC lanes onto the input channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneLayout {
    /// Two lanes per channel.
    Dual,
    /// All four lanes on channel 0.
    SingleCh0,
    /// All four lanes on channel 1.
    SingleCh1,
}

impl LaneLayout {
    /// Layout for the set of enabled channels, `None` with nothing enabled.
    pub fn for_channels(channels: &[Channel]) -> Option<Self> {
        let mut enabled = channels.iter().filter(|c| c.enabled);
        match (enabled.next(), enabled.next()) {
            (Some(_), Some(_)) => Some(LaneLayout::Dual),
            (Some(ch), None) if ch.index == 0 => Some(LaneLayout::SingleCh0),
            (Some(_), None) => Some(LaneLayout::SingleCh1),
            (None, _) => None,
        }
    }

    fn sequence(self) -> [AdcWrite; 12] {
        let (clock, route_a, route_b, invert, coarse): (&[u8], &[u8], &[u8], &[u8], &[u8]) = match self {
            LaneLayout::Dual => (
                &[0x00, 0x02, 0x01, 0x31],
                &[0x00, 0x02, 0x02, 0x3A],
                &[0x00, 0x10, 0x10, 0x3B],
                &[0x00, 0x11, 0x00, 0x24],
                &[0x00, 0x33, 0x00, 0x2B],
            ),
            LaneLayout::SingleCh0 => (
                &[0x00, 0x01, 0x00, 0x31],
                &[0x00, 0x02, 0x02, 0x3A],
                &[0x00, 0x02, 0x02, 0x3B],
                &[0x00, 0x7F, 0x00, 0x24],
                &[0x00, 0x00, 0x03, 0x2B],
            ),
            LaneLayout::SingleCh1 => (
                &[0x00, 0x01, 0x00, 0x31],
                &[0x00, 0x10, 0x10, 0x3A],
                &[0x00, 0x10, 0x10, 0x3B],
                &[0x00, 0x00, 0x00, 0x24],
                &[0x00, 0x00, 0x03, 0x2B],
            ),
        };
        [
            // reset and power down
            ctrl(&[0x03, 0x01, 0x00]),
            adcc(clock),
            ctrl(&[0x01]),
            adcc(route_a),
            adcc(route_b),
            // DDR phase 270 degrees
            adcc(&[0x00, 0x00, 0x00, 0x42]),
            adcc(&[0x00, 0x34, 0x00, 0x50]),
            // LVDS drive 1.5 mA
            adcc(&[0x00, 0x22, 0x02, 0x11]),
            adcc(invert),
            // full-scale range -10%
            adcc(&[0x00, 0x00, 0x00, 0x55]),
            // fine gain on, x-gain off
            adcc(&[0x00, 0x02, 0x00, 0x33]),
            adcc(coarse),
        ]
    }

    /// Fine gains of a channel for this layout.
    pub fn gains(self, ch: &Channel) -> [f64; 4] {
        match self {
            LaneLayout::Dual => ch.cali_fgain,
            LaneLayout::SingleCh0 | LaneLayout::SingleCh1 => ch.cali_comb_fgain,
        }
    }
}

/// Register code of a fine gain: sign and magnitude in steps of 1/8192,
/// saturating at 63 steps either way.
pub fn fgain_code(gain: f64) -> u8 {
    let steps = ((gain - 1.0) / FGAIN_STEP) as i32;
    if steps > 63 {
        63
    } else if steps > 0 {
        steps as u8
    } else if steps < -63 {
        0x40
    } else {
        !((-steps) as u8) & 0x7F
    }
}

pub fn fgain_from_code(code: u8) -> f64 {
    let steps = if code & 0x40 != 0 {
        -f64::from(!code & 0x3F)
    } else {
        f64::from(code & 0x3F)
    };
    1.0 + steps * FGAIN_STEP
}

/// Load the fine gains of one lane pair. Branches 0 and 1 belong to channel
/// 0, branches 2 and 3 to channel 1.
pub fn write_fgain<T: UsbTransport>(link: &mut CommandLink<T>, branch: u8, gains: [f64; 2]) -> Result<(), CommandError> {
    log::trace!("ADC branch {branch} fine gain {:.5}/{:.5}", gains[0], gains[1]);
    link.write_reg(regs::ADCC, 0x00)?;
    link.write_reg(regs::ADCC, fgain_code(gains[0]))?;
    link.write_reg(regs::ADCC, fgain_code(gains[1]))?;
    link.write_reg(regs::ADCC, FGAIN_BRANCH_BASE + branch)
}

/// Load all four lane gains of a channel.
pub fn write_channel_fgain<T: UsbTransport>(
    link: &mut CommandLink<T>,
    ch: &Channel,
    gains: [f64; 4],
) -> Result<(), CommandError> {
    let branch = (ch.index as u8) * 2;
    write_fgain(link, branch, [gains[0], gains[1]])?;
    write_fgain(link, branch + 1, [gains[2], gains[3]])
}

/// FPGA register holding one byte of a channel's lane trim. `high` selects
/// the cut byte.
pub fn fpga_fgain_reg(index: u16, high: bool) -> u8 {
    regs::ADCC + 3 + 2 * (index as u8) + u8::from(high)
}

/// Write both bytes of every channel's FPGA lane trim.
pub fn write_fpga_fgain<T: UsbTransport>(link: &mut CommandLink<T>, channels: &[Channel]) -> Result<(), CommandError> {
    for ch in channels.iter().take(2) {
        let [low, high] = ch.digi_fgain.to_le_bytes();
        link.write_reg(fpga_fgain_reg(ch.index, false), low)?;
        link.write_reg(fpga_fgain_reg(ch.index, true), high)?;
    }
    Ok(())
}

/// Route the lanes for the enabled channels and load the matching gains.
pub fn configure<T: UsbTransport>(link: &mut CommandLink<T>, channels: &[Channel]) -> Result<(), CommandError> {
    let Some(layout) = LaneLayout::for_channels(channels) else {
        return Ok(());
    };
    log::debug!("ADC lane layout {layout:?}");
    for write in layout.sequence() {
        for &byte in write.bytes {
            link.write_reg(write.reg, byte)?;
        }
    }
    for ch in channels.iter().take(2) {
        write_channel_fgain(link, ch, layout.gains(ch))?;
    }
    write_fpga_fgain(link, channels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ProtocolGeneration;
    use crate::mock_transport::MockTransport;
    use crate::profile::{find_profile, DSL_VID};

    fn channels() -> Vec<Channel> {
        let profile = find_profile(DSL_VID, 0x0028, false).unwrap();
        (0..2).map(|i| Channel::new(i, profile.default_channel_mode.mode(), profile)).collect()
    }

    #[test]
    fn test_fgain_codes() {
        assert_eq!(fgain_code(1.0), 0x7F);
        assert_eq!(fgain_from_code(0x7F), 1.0);
        assert_eq!(fgain_code(1.0 + 5.0 / 8192.0), 5);
        assert_eq!(fgain_code(1.0 - 5.5 / 8192.0), !5u8 & 0x7F);
        assert_eq!(fgain_from_code(!5u8 & 0x7F), 1.0 - 5.0 / 8192.0);
        // saturation at both ends of the trim range
        assert_eq!(fgain_code(1.02), 63);
        assert_eq!(fgain_code(0.98), 0x40);
        assert_eq!(fgain_from_code(0x40), 1.0 - 63.0 / 8192.0);
    }

    #[test]
    fn test_layout_follows_enabled_channels() {
        let mut chs = channels();
        assert_eq!(LaneLayout::for_channels(&chs), Some(LaneLayout::Dual));
        chs[0].enabled = false;
        assert_eq!(LaneLayout::for_channels(&chs), Some(LaneLayout::SingleCh1));
        chs[1].enabled = false;
        assert_eq!(LaneLayout::for_channels(&chs), None);
        chs[0].enabled = true;
        assert_eq!(LaneLayout::for_channels(&chs), Some(LaneLayout::SingleCh0));
    }

    #[test]
    fn test_configure_loads_gains_for_layout() {
        let mut chs = channels();
        chs[0].cali_fgain = [1.0 + 3.0 / 8192.0; 4];
        chs[0].cali_comb_fgain = [1.0 + 9.0 / 8192.0; 4];
        chs[1].digi_fgain = 0x0201;
        let mut link = CommandLink::new(MockTransport::new(false), ProtocolGeneration::Structured);
        configure(&mut link, &chs).unwrap();

        let writes = &link.transport().registers;
        assert_eq!(writes[0], (regs::ADCC + 1, 0x03));
        let gains: Vec<u8> = writes.iter().filter(|(r, _)| *r == regs::ADCC).map(|(_, v)| *v).collect();
        // branch 0 of channel 0 after the twelve-step layout sequence
        let tail = &gains[gains.len() - 16..];
        assert_eq!(tail[..4], [0x00, 3, 3, FGAIN_BRANCH_BASE]);
        assert_eq!(tail[12..], [0x00, 0x7F, 0x7F, FGAIN_BRANCH_BASE + 3]);
        assert_eq!(writes[writes.len() - 2..], [(regs::ADCC + 5, 0x01), (regs::ADCC + 6, 0x02)]);

        chs[1].enabled = false;
        let mut link = CommandLink::new(MockTransport::new(false), ProtocolGeneration::Structured);
        configure(&mut link, &chs).unwrap();
        let gains: Vec<u8> = link
            .transport()
            .registers
            .iter()
            .filter(|(r, _)| *r == regs::ADCC)
            .map(|(_, v)| *v)
            .collect();
        assert_eq!(gains[gains.len() - 16..][..4], [0x00, 9, 9, FGAIN_BRANCH_BASE]);
    }
}
