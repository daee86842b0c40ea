//! `L`: copy a checksummed payload into the staging buffer.

use super::{Context, Outcome};
use crate::protocol::{Completion, ErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Offset0,
    Offset1,
    Length0,
    Length1,
    Data,
    Checksum0,
    Checksum1,
}

#[derive(Debug)]
pub struct Load {
    state: State,
    offset: u16,
    length: u16,
    received: u16,
    local_checksum: u16,
    remote_checksum: u16,
}

impl Load {
    pub fn begin() -> Self {
        Load {
            state: State::Offset0,
            offset: 0,
            length: 0,
            received: 0,
            local_checksum: 0,
            remote_checksum: 0,
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
                State::Data
            }
            State::Data => {
                let at = self.offset as usize + self.received as usize;
                cx.staging.as_mut_slice()[at] = byte;
                self.local_checksum = self.local_checksum.wrapping_add(byte as u16);
                self.received += 1;
                if self.received == self.length {
                    State::Checksum0
                } else {
                    State::Data
                }
            }
            State::Checksum0 => {
                self.remote_checksum = byte as u16;
                State::Checksum1
            }
            State::Checksum1 => {
                self.remote_checksum |= (byte as u16) << 8;
                if self.remote_checksum != self.local_checksum {
                    log::debug!(
                        "load checksum mismatch: local {:#06x}, remote {:#06x}",
                        self.local_checksum,
                        self.remote_checksum
                    );
                    return Outcome::Complete(Completion::nak(ErrorCode::InvalidChecksum));
                }
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
    fn load_then_readback() {
        let mut bl = bootloader(small_table());
        assert_eq!(exchange(&mut bl, &[b'L', 0, 0, 4, 0, 1, 2, 3, 4, 10, 0]), [ACK]);
        assert_eq!(&bl.staging().as_slice()[..4], [1, 2, 3, 4]);

        let reply = exchange(&mut bl, &[b'R', 0, 0, 0, 0, 4, 0, 0, 0]);
        assert_eq!(reply, [ACK, 1, 2, 3, 4, 10, 0]);
    }

    #[test]
    fn wrong_checksum() {
        let mut bl = bootloader(small_table());
        assert_eq!(
            exchange(&mut bl, &[b'L', 0, 0, 4, 0, 1, 2, 3, 4, 11, 0]),
            [NAK, 0x02]
        );
    }

    #[test]
    fn zero_length() {
        let mut bl = bootloader(small_table());
        assert_eq!(exchange(&mut bl, &[b'L', 0, 0, 0, 0]), [NAK, 0x01]);
        assert!(!bl.is_busy());
    }

    #[test]
    fn out_of_range_before_any_write() {
        let mut bl = bootloader(small_table());
        // offset 0x7fff + 2 bytes is one past the 32 KiB window
        assert_eq!(exchange(&mut bl, &[b'L', 0xff, 0x7f, 2, 0]), [NAK, 0x03]);
        assert!(bl.staging().as_slice().iter().all(|&b| b == 0));
        // the would-be data bytes are read as a fresh command
        assert_eq!(exchange(&mut bl, b"F"), [ACK]);
    }

    #[test]
    fn last_byte_of_window() {
        let mut bl = bootloader(small_table());
        assert_eq!(
            exchange(&mut bl, &[b'L', 0xff, 0x7f, 1, 0, 0xaa, 0xaa, 0]),
            [ACK]
        );
        assert_eq!(bl.staging().as_slice()[0x7fff], 0xaa);
    }
}
