//! `Z`: clear a range of the staging buffer.

use super::{Context, Outcome};
use crate::protocol::{Completion, ErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Offset0,
    Offset1,
    Length0,
    Length1,
}

#[derive(Debug)]
pub struct Zero {
    state: State,
    offset: u16,
    length: u16,
}

impl Zero {
    pub fn begin() -> Self {
        Zero {
            state: State::Offset0,
            offset: 0,
            length: 0,
        }
    }

    pub fn handle<L, T>(mut self, byte: u8, cx: &mut Context<'_, L, T>) -> Outcome<Self> {
        self.state = match self.state {
            State::Offset0 => {
                self.offset = byte as u16;
                State::Offset1
            }
            State::Offset1 => {
                self.offset |= (byte as u16) << 8;
                State::Length0
            }
            State::Length0 => {
                self.length = byte as u16;
                State::Length1
            }
            State::Length1 => {
                self.length |= (byte as u16) << 8;
                if self.length == 0 {
                    return Outcome::Complete(Completion::nak(ErrorCode::InvalidLength));
                }
                if !cx.staging.fits(self.offset as u32, self.length as u32) {
                    return Outcome::Complete(Completion::nak(ErrorCode::OutOfRange));
                }
                let start = self.offset as usize;
                cx.staging.as_mut_slice()[start..start + self.length as usize].fill(0);
                return Outcome::Complete(Completion::Ack);
            }
        };
        Outcome::Continue(self)
    }
}

#[cfg(test)]
mod tests {
    use crate::bootloader::tests::{bootloader, exchange, small_table};
    use crate::constants::{ACK, NAK};

    #[test]
    fn clears_only_the_range() {
        let mut bl = bootloader(small_table());
        let mut load = vec![b'L', 0, 0, 8, 0];
        load.extend([0xff; 8]);
        load.extend((0xffu16 * 8).to_le_bytes());
        assert_eq!(exchange(&mut bl, &load), [ACK]);

        assert_eq!(exchange(&mut bl, &[b'Z', 2, 0, 4, 0]), [ACK]);
        assert_eq!(
            &bl.staging().as_slice()[..8],
            [0xff, 0xff, 0, 0, 0, 0, 0xff, 0xff]
        );
    }

    #[test]
    fn rejects_bad_ranges() {
        let mut bl = bootloader(small_table());
        assert_eq!(exchange(&mut bl, &[b'Z', 0, 0, 0, 0]), [NAK, 0x01]);
        assert_eq!(exchange(&mut bl, &[b'Z', 0, 0x80, 1, 0]), [NAK, 0x03]);
        assert_eq!(exchange(&mut bl, &[b'Z', 0, 0, 0, 0x80]), [ACK]);
    }
}
