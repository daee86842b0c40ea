//! `R`: stream any memory range back to the host.
//!
//! This is the only command whose ACK precedes its payload: the ACK is sent
//! once the parameters are validated, then the data, then the checksum.

use super::{Context, MemoryBus, Outcome, SerialLink};
use crate::constants::ACK;
use crate::protocol::{Completion, ErrorCode};

const TX_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Offset0,
    Offset1,
    Offset2,
    Offset3,
    Length0,
    Length1,
    Length2,
    Length3,
}

#[derive(Debug)]
pub struct Readback {
    state: State,
    offset: u32,
    length: u32,
}

impl Readback {
    pub fn begin() -> Self {
        Readback {
            state: State::Offset0,
            offset: 0,
            length: 0,
        }
    }

    pub fn handle<L, T>(mut self, byte: u8, cx: &mut Context<'_, L, T>) -> Outcome<Self>
    where
        L: SerialLink,
        T: MemoryBus,
    {
        let byte = byte as u32;
        self.state = match self.state {
            State::Offset0 => {
                self.offset = byte;
                State::Offset1
            }
            State::Offset1 => {
                self.offset |= byte << 8;
                State::Offset2
            }
            State::Offset2 => {
                self.offset |= byte << 16;
                State::Offset3
            }
            State::Offset3 => {
                self.offset |= byte << 24;
                State::Length0
            }
            State::Length0 => {
                self.length = byte;
                State::Length1
            }
            State::Length1 => {
                self.length |= byte << 8;
                State::Length2
            }
            State::Length2 => {
                self.length |= byte << 16;
                State::Length3
            }
            State::Length3 => {
                self.length |= byte << 24;
                return Outcome::Complete(self.stream(cx));
            }
        };
        Outcome::Continue(self)
    }

    fn stream<L, T>(&self, cx: &mut Context<'_, L, T>) -> Completion
    where
        L: SerialLink,
        T: MemoryBus,
    {
        if self.length == 0 {
            return Completion::nak(ErrorCode::InvalidLength);
        }
        if self.offset.checked_add(self.length).is_none() {
            return Completion::nak(ErrorCode::OutOfRange);
        }
        log::debug!("readback {:#010x} +{:#x}", self.offset, self.length);

        cx.link.tx(&[ACK]);

        let mut checksum = 0u16;
        let mut buf = Vec::with_capacity(TX_CHUNK);
        for address in self.offset..self.offset + self.length {
            let b = cx.read_memory(address);
            checksum = checksum.wrapping_add(b as u16);
            buf.push(b);
            if buf.len() == TX_CHUNK {
                cx.link.tx(&buf);
                buf.clear();
            }
        }
        cx.link.tx(&buf);
        cx.link.tx(&checksum.to_le_bytes());
        Completion::Streamed
    }
}

#[cfg(test)]
mod tests {
    use crate::bootloader::tests::{bootloader, exchange, small_table};
    use crate::constants::{ACK, NAK};
    use crate::protocol::checksum16;

    #[test]
    fn zero_length() {
        let mut bl = bootloader(small_table());
        assert_eq!(exchange(&mut bl, &[b'R', 0, 0, 0, 0, 0, 0, 0, 0]), [NAK, 0x01]);
    }

    #[test]
    fn address_overflow() {
        let mut bl = bootloader(small_table());
        let reply = exchange(&mut bl, &[b'R', 0, 0xff, 0xff, 0xff, 0, 1, 0, 0]);
        assert_eq!(reply, [NAK, 0x03]);
    }

    #[test]
    fn reads_flash_beyond_the_staging_window() {
        let mut bl = bootloader(small_table());
        bl.target_mut().poke(0x0001_0000, &[0xde, 0xad, 0xbe, 0xef]);
        let reply = exchange(&mut bl, &[b'R', 0, 0, 1, 0, 4, 0, 0, 0]);
        let mut expected = vec![ACK, 0xde, 0xad, 0xbe, 0xef];
        expected.extend(checksum16(&[0xde, 0xad, 0xbe, 0xef]).to_le_bytes());
        assert_eq!(reply, expected);
    }

    #[test]
    fn long_readback_is_complete() {
        let mut bl = bootloader(small_table());
        let reply = exchange(&mut bl, &[b'R', 0, 0, 1, 0, 0x01, 0x02, 0, 0]);
        // erased flash reads as 0xff
        assert_eq!(reply.len(), 1 + 0x201 + 2);
        assert_eq!(&reply[reply.len() - 2..], ((0x201u32 * 0xff) as u16).to_le_bytes());
    }
}
