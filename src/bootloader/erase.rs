//! `E`: erase a list of sectors.
//!
//! The ids are collected first, then sorted and erased one contiguous run at
//! a time so each prepare/erase pair covers as many sectors as possible.

use super::{Context, FlashPrimitives, Outcome};
use crate::constants::{MAX_SECTORS, detail};
use crate::protocol::{Completion, ErrorCode};
use crate::sector::coalesce_runs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Count,
    List,
}

#[derive(Debug)]
pub struct Erase {
    state: State,
    count: u8,
    sectors: Vec<u8>,
    unknown_sector: bool,
}

impl Erase {
    pub fn begin() -> Self {
        Erase {
            state: State::Count,
            count: 0,
            sectors: Vec::with_capacity(MAX_SECTORS),
            unknown_sector: false,
        }
    }

    pub fn handle<L, T>(mut self, byte: u8, cx: &mut Context<'_, L, T>) -> Outcome<Self>
    where
        T: FlashPrimitives,
    {
        match self.state {
            State::Count => {
                if byte == 0 {
                    return Outcome::Complete(Completion::nak(ErrorCode::InvalidLength));
                }
                if byte as usize > MAX_SECTORS {
                    return Outcome::Complete(Completion::nak_with(
                        ErrorCode::OutOfRange,
                        detail::TOO_MANY_SECTORS,
                    ));
                }
                self.count = byte;
                self.state = State::List;
            }
            State::List => {
                // an unknown id is only reported once the whole list is in
                self.unknown_sector |= byte as usize >= cx.config.sectors.len();
                self.sectors.push(byte);
                if self.sectors.len() == self.count as usize {
                    return Outcome::Complete(self.erase(cx));
                }
            }
        }
        Outcome::Continue(self)
    }

    fn erase<L, T: FlashPrimitives>(mut self, cx: &mut Context<'_, L, T>) -> Completion {
        if self.unknown_sector {
            log::warn!("erase list {:?} names an unknown sector", self.sectors);
            return Completion::nak_with(ErrorCode::OutOfRange, detail::UNKNOWN_SECTOR);
        }
        let runs = coalesce_runs(&mut self.sectors);
        cx.erase_runs(&runs)
    }
}
