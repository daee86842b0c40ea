//! The binary wire protocol spoken by the resident bootloader.

use std::fmt;

use anyhow::Result;
use scroll::Pwrite;

use crate::constants::{ACK, NAK, opcodes};

/// Command byte selecting a bootloader operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Load = opcodes::LOAD,
    Zero = opcodes::ZERO,
    Readback = opcodes::READBACK,
    EraseSectors = opcodes::ERASE_SECTORS,
    EraseFull = opcodes::ERASE_FULL,
    EraseAndProgram = opcodes::ERASE_AND_PROGRAM,
    /// Resets the device, no reply.
    Reset = opcodes::RESET,
    /// Re-enters the vendor ISP, no reply.
    ExitToLoader = opcodes::EXIT_TO_LOADER,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            opcodes::LOAD => Ok(Opcode::Load),
            opcodes::ZERO => Ok(Opcode::Zero),
            opcodes::READBACK => Ok(Opcode::Readback),
            opcodes::ERASE_SECTORS => Ok(Opcode::EraseSectors),
            opcodes::ERASE_FULL => Ok(Opcode::EraseFull),
            opcodes::ERASE_AND_PROGRAM => Ok(Opcode::EraseAndProgram),
            opcodes::RESET => Ok(Opcode::Reset),
            opcodes::EXIT_TO_LOADER => Ok(Opcode::ExitToLoader),
            other => Err(other),
        }
    }
}

/// Failure reported after a NAK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    UnknownState = 0x00,
    InvalidLength = 0x01,
    InvalidChecksum = 0x02,
    OutOfRange = 0x03,
    NotAligned = 0x04,
    FlashOperationFailure = 0x05,
    UnknownCommand = 0x06,
}

impl TryFrom<u8> for ErrorCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        Ok(match value {
            0x00 => ErrorCode::UnknownState,
            0x01 => ErrorCode::InvalidLength,
            0x02 => ErrorCode::InvalidChecksum,
            0x03 => ErrorCode::OutOfRange,
            0x04 => ErrorCode::NotAligned,
            0x05 => ErrorCode::FlashOperationFailure,
            0x06 => ErrorCode::UnknownCommand,
            other => return Err(other),
        })
    }
}

impl ErrorCode {
    /// Whether a NAK with this code carries a trailing sub-code byte.
    ///
    /// `opcode` is `None` when the command byte itself was not recognized.
    pub fn carries_detail(self, opcode: Option<Opcode>) -> bool {
        match self {
            ErrorCode::UnknownCommand => true,
            ErrorCode::OutOfRange | ErrorCode::NotAligned | ErrorCode::FlashOperationFailure => {
                matches!(
                    opcode,
                    Some(Opcode::EraseSectors | Opcode::EraseFull | Opcode::EraseAndProgram)
                )
            }
            _ => false,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::UnknownState => "unknown state",
            ErrorCode::InvalidLength => "invalid length",
            ErrorCode::InvalidChecksum => "invalid checksum",
            ErrorCode::OutOfRange => "out of range",
            ErrorCode::NotAligned => "not aligned",
            ErrorCode::FlashOperationFailure => "flash operation failure",
            ErrorCode::UnknownCommand => "unknown command",
        };
        f.write_str(s)
    }
}

/// How a command finished on the device side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Ack,
    /// The ACK was already sent ahead of the payload.
    Streamed,
    Nak { code: ErrorCode, detail: Option<u8> },
}

impl Completion {
    pub fn nak(code: ErrorCode) -> Self {
        Completion::Nak { code, detail: None }
    }

    pub fn nak_with(code: ErrorCode, detail: u8) -> Self {
        Completion::Nak {
            code,
            detail: Some(detail),
        }
    }

    /// Bytes still to be transmitted for this completion.
    pub fn to_raw(self) -> Vec<u8> {
        match self {
            Completion::Ack => vec![ACK],
            Completion::Streamed => vec![],
            Completion::Nak { code, detail } => {
                let mut buf = vec![NAK, code as u8];
                buf.extend(detail);
                buf
            }
        }
    }
}

/// A NAK as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceError {
    pub opcode: Option<Opcode>,
    pub code: ErrorCode,
    pub detail: Option<u8>,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode {
            Some(op) => write!(f, "{:?} failed: {}", op, self.code)?,
            None => write!(f, "command failed: {}", self.code)?,
        }
        if let Some(detail) = self.detail {
            write!(f, " (sub-code {})", detail)?;
        }
        Ok(())
    }
}

impl std::error::Error for DeviceError {}

/// 16-bit wrapping sum used by every checksummed transfer.
pub fn checksum16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
}

/// A request to the bootloader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Copy `data` into the staging buffer at `offset`.
    Load { offset: u16, data: Vec<u8> },
    Zero { offset: u16, length: u16 },
    /// Read `length` bytes from any absolute address.
    Readback { offset: u32, length: u32 },
    EraseSectors { sectors: Vec<u8> },
    EraseFull,
    /// Erase the covering sectors and program them from the staging buffer.
    EraseAndProgram {
        flash_offset: u32,
        work_offset: u16,
        length: u16,
    },
    Reset,
    ExitToLoader,
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Load { .. } => Opcode::Load,
            Request::Zero { .. } => Opcode::Zero,
            Request::Readback { .. } => Opcode::Readback,
            Request::EraseSectors { .. } => Opcode::EraseSectors,
            Request::EraseFull => Opcode::EraseFull,
            Request::EraseAndProgram { .. } => Opcode::EraseAndProgram,
            Request::Reset => Opcode::Reset,
            Request::ExitToLoader => Opcode::ExitToLoader,
        }
    }

    /// Whether the device answers this request at all.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Request::Reset | Request::ExitToLoader)
    }

    pub fn into_raw(self) -> Result<Vec<u8>> {
        let op = self.opcode() as u8;
        match self {
            Request::Load { offset, data } => {
                anyhow::ensure!(
                    !data.is_empty() && data.len() <= u16::MAX as usize,
                    "load payload must be 1..=65535 bytes, got {}",
                    data.len()
                );
                // CMD, OFFSET, LENGTH, DATA, CHECKSUM
                let mut buf = vec![0u8; 1 + 2 + 2 + data.len() + 2];
                buf[0] = op;
                buf.pwrite_with(offset, 1, scroll::LE)?;
                buf.pwrite_with(data.len() as u16, 3, scroll::LE)?;
                buf[5..5 + data.len()].copy_from_slice(&data);
                buf.pwrite_with(checksum16(&data), 5 + data.len(), scroll::LE)?;
                Ok(buf)
            }
            Request::Zero { offset, length } => {
                let mut buf = [op, 0, 0, 0, 0];
                buf.pwrite_with(offset, 1, scroll::LE)?;
                buf.pwrite_with(length, 3, scroll::LE)?;
                Ok(buf.to_vec())
            }
            Request::Readback { offset, length } => {
                let mut buf = [0u8; 9];
                buf[0] = op;
                buf.pwrite_with(offset, 1, scroll::LE)?;
                buf.pwrite_with(length, 5, scroll::LE)?;
                Ok(buf.to_vec())
            }
            Request::EraseSectors { sectors } => {
                anyhow::ensure!(
                    sectors.len() <= u8::MAX as usize,
                    "too many sectors in one erase request"
                );
                let mut buf = Vec::with_capacity(2 + sectors.len());
                buf.push(op);
                buf.push(sectors.len() as u8);
                buf.extend(sectors);
                Ok(buf)
            }
            Request::EraseAndProgram {
                flash_offset,
                work_offset,
                length,
            } => {
                let mut buf = [0u8; 9];
                buf[0] = op;
                buf.pwrite_with(flash_offset, 1, scroll::LE)?;
                buf.pwrite_with(work_offset, 5, scroll::LE)?;
                buf.pwrite_with(length, 7, scroll::LE)?;
                Ok(buf.to_vec())
            }
            Request::EraseFull | Request::Reset | Request::ExitToLoader => Ok(vec![op]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_frame_layout() {
        let raw = Request::Load {
            offset: 0x0102,
            data: vec![1, 2, 3, 4],
        }
        .into_raw()
        .unwrap();
        assert_eq!(raw, [b'L', 0x02, 0x01, 4, 0, 1, 2, 3, 4, 10, 0]);
    }

    #[test]
    fn erase_and_program_frame_layout() {
        let raw = Request::EraseAndProgram {
            flash_offset: 0x0001_0000,
            work_offset: 0x0004,
            length: 0x0200,
        }
        .into_raw()
        .unwrap();
        assert_eq!(raw, [b'W', 0, 0, 1, 0, 4, 0, 0, 2]);
    }

    #[test]
    fn empty_load_is_refused() {
        let req = Request::Load {
            offset: 0,
            data: vec![],
        };
        assert!(req.into_raw().is_err());
    }

    #[test]
    fn checksum_wraps_and_detects_single_byte_change() {
        let data = vec![0xffu8; 300];
        assert_eq!(checksum16(&data), (300u32 * 0xff % 65536) as u16);

        let mut altered = data.clone();
        altered[17] = 0xfe;
        assert_ne!(checksum16(&data), checksum16(&altered));
    }

    #[test]
    fn nak_framing() {
        assert_eq!(Completion::Ack.to_raw(), [ACK]);
        assert_eq!(Completion::Streamed.to_raw(), Vec::<u8>::new());
        assert_eq!(
            Completion::nak_with(ErrorCode::NotAligned, 2).to_raw(),
            [NAK, 0x04, 2]
        );
        assert!(ErrorCode::NotAligned.carries_detail(Some(Opcode::EraseAndProgram)));
        assert!(!ErrorCode::OutOfRange.carries_detail(Some(Opcode::Load)));
        assert!(ErrorCode::UnknownCommand.carries_detail(None));
    }

    #[test]
    fn opcode_round_trips_through_byte() {
        for op in [b'L', b'Z', b'R', b'E', b'F', b'W', b'K', b'X'] {
            assert_eq!(Opcode::try_from(op).map(|o| o as u8), Ok(op));
        }
        assert_eq!(Opcode::try_from(b'?'), Err(b'?'));
    }
}
