//! `W`: erase the sectors under a flash range and program it from the
//! staging buffer.
//!
//! The checks run in a fixed order and each one has its own sub-code, so an
//! input breaking several rules always reports the first of them.

use std::ops::RangeInclusive;

use super::{Context, FlashPrimitives, Outcome};
use crate::constants::{FLASH_PAGE_SIZE, MAX_PROGRAM_CHUNK, WORK_ALIGNMENT, detail};
use crate::protocol::{Completion, ErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    FlashOffset0,
    FlashOffset1,
    FlashOffset2,
    FlashOffset3,
    WorkOffset0,
    WorkOffset1,
    Length0,
    Length1,
}

#[derive(Debug)]
pub struct Program {
    state: State,
    flash_offset: u32,
    work_offset: u16,
    length: u16,
}

/// Size of the next chunk to program, given what is left.
///
/// Copies are limited to 256, 512, 1024 or 4096 bytes, so anything else is
/// rounded down to the largest of those not above `remaining`.
pub fn chunk_len(remaining: u32) -> u32 {
    match remaining.min(MAX_PROGRAM_CHUNK) {
        len if len < 512 => 256,
        len if len < 1024 => 512,
        len if len < 4096 => 1024,
        len => len,
    }
}

impl Program {
    pub fn begin() -> Self {
        Program {
            state: State::FlashOffset0,
            flash_offset: 0,
            work_offset: 0,
            length: 0,
        }
    }

    pub fn handle<L, T>(mut self, byte: u8, cx: &mut Context<'_, L, T>) -> Outcome<Self>
    where
        T: FlashPrimitives,
    {
        self.state = match self.state {
            State::FlashOffset0 => {
                self.flash_offset = byte as u32;
                State::FlashOffset1
            }
            State::FlashOffset1 => {
                self.flash_offset |= (byte as u32) << 8;
                State::FlashOffset2
            }
            State::FlashOffset2 => {
                self.flash_offset |= (byte as u32) << 16;
                State::FlashOffset3
            }
            State::FlashOffset3 => {
                self.flash_offset |= (byte as u32) << 24;
                State::WorkOffset0
            }
            State::WorkOffset0 => {
                self.work_offset = byte as u16;
                State::WorkOffset1
            }
            State::WorkOffset1 => {
                self.work_offset |= (byte as u16) << 8;
                State::Length0
            }
            State::Length0 => {
                self.length = byte as u16;
                State::Length1
            }
            State::Length1 => {
                self.length |= (byte as u16) << 8;
                let completion = match self.validate(cx) {
                    Ok(span) => self.erase_and_program(span, cx),
                    Err(nak) => nak,
                };
                return Outcome::Complete(completion);
            }
        };
        Outcome::Continue(self)
    }

    /// Checks the request without touching flash. Returns the sector span
    /// to erase.
    fn validate<L, T>(&self, cx: &Context<'_, L, T>) -> Result<RangeInclusive<u8>, Completion> {
        let length = self.length as u32;
        if length == 0 {
            return Err(Completion::nak(ErrorCode::InvalidLength));
        }
        if !cx.staging.fits(self.work_offset as u32, length) {
            return Err(Completion::nak_with(ErrorCode::OutOfRange, detail::WORK_RANGE));
        }
        let Some(end) = self.flash_offset.checked_add(length) else {
            return Err(Completion::nak_with(ErrorCode::OutOfRange, detail::FLASH_OVERFLOW));
        };
        if self.flash_offset % FLASH_PAGE_SIZE != 0 {
            return Err(Completion::nak_with(ErrorCode::NotAligned, detail::FLASH_OFFSET_ALIGN));
        }
        if self.work_offset % WORK_ALIGNMENT != 0 {
            return Err(Completion::nak_with(ErrorCode::NotAligned, detail::WORK_OFFSET_ALIGN));
        }
        if length % FLASH_PAGE_SIZE != 0 {
            return Err(Completion::nak_with(ErrorCode::NotAligned, detail::LENGTH_ALIGN));
        }

        let end_address = end.checked_next_multiple_of(FLASH_PAGE_SIZE);
        let span = end_address.and_then(|end| cx.config.sectors.span(self.flash_offset, end));
        span.ok_or(Completion::nak_with(ErrorCode::OutOfRange, detail::FLASH_UNMAPPED))
    }

    fn erase_and_program<L, T>(&self, span: RangeInclusive<u8>, cx: &mut Context<'_, L, T>) -> Completion
    where
        T: FlashPrimitives,
    {
        let timeout = cx.config.program_timeout;
        log::debug!(
            "program {:#010x} +{:#x} from work {:#06x}, sectors {:?}",
            self.flash_offset,
            self.length,
            self.work_offset,
            span
        );

        if let Err(status) = cx.target.prepare(span.clone()) {
            log::warn!("prepare {:?} failed: {}", span, status);
            return Completion::nak_with(ErrorCode::FlashOperationFailure, detail::PREPARE);
        }
        if let Err(status) = cx.target.erase(span.clone(), timeout) {
            log::warn!("erase {:?} failed: {}", span, status);
            return Completion::nak_with(ErrorCode::FlashOperationFailure, detail::ERASE);
        }

        let length = self.length as u32;
        let mut offset = 0;
        while offset < length {
            let len = chunk_len(length - offset);
            let dst = self.flash_offset + offset;

            let Some(chunk_span) = cx.config.sectors.span(dst, dst + len - 1) else {
                return Completion::nak_with(ErrorCode::OutOfRange, detail::CHUNK_UNMAPPED);
            };
            if let Err(status) = cx.target.prepare(chunk_span.clone()) {
                log::warn!("prepare {:?} failed: {}", chunk_span, status);
                return Completion::nak_with(ErrorCode::FlashOperationFailure, detail::CHUNK_PREPARE);
            }

            let src = self.work_offset as usize + offset as usize;
            let data = &cx.staging.as_slice()[src..src + len as usize];
            if let Err(status) = cx.target.copy_ram_to_flash(dst, data, timeout) {
                log::warn!("copy to {:#010x} failed: {}", dst, status);
                return Completion::nak_with(ErrorCode::FlashOperationFailure, detail::CHUNK_COPY);
            }

            offset += len;
        }
        Completion::Ack
    }
}

#[cfg(test)]
mod tests {
    use super::chunk_len;
    use crate::bootloader::tests::{bootloader, exchange, small_table};
    use crate::bootloader::{FlashCall, FlashOp};
    use crate::constants::{ACK, NAK, detail};
    use crate::protocol::{Request, checksum16};
    use crate::sector::SectorTable;

    fn program(flash_offset: u32, work_offset: u16, length: u16) -> Vec<u8> {
        Request::EraseAndProgram {
            flash_offset,
            work_offset,
            length,
        }
        .into_raw()
        .unwrap()
    }

    #[test]
    fn chunk_tiers() {
        assert_eq!(chunk_len(256), 256);
        assert_eq!(chunk_len(768), 512);
        assert_eq!(chunk_len(3840), 1024);
        assert_eq!(chunk_len(4096), 4096);
        assert_eq!(chunk_len(0x7000), 4096);
    }

    #[test]
    fn alignment_checks_have_distinct_codes() {
        let mut bl = bootloader(small_table());
        assert_eq!(
            exchange(&mut bl, &program(0x1080, 0, 0x100)),
            [NAK, 0x04, detail::FLASH_OFFSET_ALIGN]
        );
        assert_eq!(
            exchange(&mut bl, &program(0x1000, 2, 0x100)),
            [NAK, 0x04, detail::WORK_OFFSET_ALIGN]
        );
        assert_eq!(
            exchange(&mut bl, &program(0x1000, 0, 0x180)),
            [NAK, 0x04, detail::LENGTH_ALIGN]
        );
        assert!(bl.target().calls().is_empty());
    }

    #[test]
    fn first_failing_check_wins() {
        let mut bl = bootloader(small_table());
        // misaligned everywhere, but the work range is checked first
        assert_eq!(
            exchange(&mut bl, &program(0xffff_ff01, 0x7f01, 0x1ff)),
            [NAK, 0x03, detail::WORK_RANGE]
        );
        // fits the work buffer, overflows the address space
        assert_eq!(
            exchange(&mut bl, &program(0xffff_ff01, 1, 0x1ff)),
            [NAK, 0x03, detail::FLASH_OVERFLOW]
        );
        assert_eq!(exchange(&mut bl, &program(0, 0, 0)), [NAK, 0x01]);
    }

    #[test]
    fn end_address_must_be_mapped() {
        let table = SectorTable::from_groups(0, &[(1, 0x200)]).unwrap();
        let mut bl = bootloader(table);
        assert_eq!(
            exchange(&mut bl, &program(0x100, 0, 0x100)),
            [NAK, 0x03, detail::FLASH_UNMAPPED]
        );
        assert!(bl.target().calls().is_empty());
    }

    #[test]
    fn programs_in_tiered_chunks() {
        let mut bl = bootloader(small_table());
        let payload: Vec<u8> = (0..0x1300u32).map(|i| (i * 7) as u8).collect();
        for (i, block) in payload.chunks(0x800).enumerate() {
            let mut load = vec![b'L'];
            load.extend(((i * 0x800) as u16).to_le_bytes());
            load.extend((block.len() as u16).to_le_bytes());
            load.extend(block);
            load.extend(checksum16(block).to_le_bytes());
            assert_eq!(exchange(&mut bl, &load), [ACK]);
        }

        assert_eq!(exchange(&mut bl, &program(0x2000, 0, 0x1300)), [ACK]);
        assert_eq!(
            bl.target().calls(),
            [
                FlashCall::Prepare(2..=3),
                FlashCall::Erase(2..=3),
                FlashCall::Prepare(2..=2),
                FlashCall::Copy { dst: 0x2000, len: 4096 },
                FlashCall::Prepare(3..=3),
                FlashCall::Copy { dst: 0x3000, len: 512 },
                FlashCall::Prepare(3..=3),
                FlashCall::Copy { dst: 0x3200, len: 256 },
            ]
        );
        assert_eq!(bl.target().flash(0x2000, 0x1300), &payload[..]);
    }

    #[test]
    fn failing_stage_is_reported() {
        for (op, skip, code) in [
            (FlashOp::Prepare, 0, detail::PREPARE),
            (FlashOp::Erase, 0, detail::ERASE),
            (FlashOp::Prepare, 1, detail::CHUNK_PREPARE),
            (FlashOp::Copy, 0, detail::CHUNK_COPY),
        ] {
            let mut bl = bootloader(small_table());
            bl.target_mut().fail_after(op, skip);
            assert_eq!(exchange(&mut bl, &program(0, 0, 0x100)), [NAK, 0x05, code]);
        }
    }
}
