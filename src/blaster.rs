//! Host side of the bootloader's binary protocol: decoding the replies.

use anyhow::Result;

use crate::constants::{ACK, NAK};
use crate::protocol::{DeviceError, ErrorCode, Opcode, Request, checksum16};

/// A complete reply from the bootloader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Nak(DeviceError),
    Readback { offset: u32, data: Vec<u8> },
}

impl Reply {
    /// Turns a NAK into an error.
    pub fn into_result(self) -> Result<Reply> {
        match self {
            Reply::Nak(err) => Err(err.into()),
            other => Ok(other),
        }
    }
}

/// An in-flight `R` transfer.
#[derive(Debug)]
pub struct ReadbackSession {
    offset: u32,
    expected: usize,
    data: Vec<u8>,
}

impl ReadbackSession {
    pub fn new(offset: u32, length: u32) -> Self {
        ReadbackSession {
            offset,
            expected: length as usize,
            data: Vec::with_capacity(length as usize),
        }
    }

    /// `(received, expected)` byte counts.
    pub fn progress(&self) -> (usize, usize) {
        (self.data.len(), self.expected)
    }

    fn is_complete(&self) -> bool {
        self.data.len() == self.expected
    }

    fn push(&mut self, byte: u8) {
        self.data.push(byte);
    }

    /// Checks the trailing checksum and hands the data out.
    fn finish(self, checksum: u16) -> Result<Reply> {
        let actual = checksum16(&self.data);
        anyhow::ensure!(
            actual == checksum,
            "readback checksum mismatch: device {:#06x}, computed {:#06x}",
            checksum,
            actual
        );
        Ok(Reply::Readback {
            offset: self.offset,
            data: self.data,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Status,
    ErrorCode,
    Detail(ErrorCode),
    Data,
    Checksum0,
    Checksum1(u8),
}

/// Frames the reply to one request, a byte at a time.
#[derive(Debug)]
pub struct ReplyDecoder {
    opcode: Opcode,
    state: State,
    readback: Option<ReadbackSession>,
}

impl ReplyDecoder {
    /// Returns `None` for requests that are never answered.
    pub fn for_request(request: &Request) -> Option<Self> {
        if !request.expects_reply() {
            return None;
        }
        let readback = match *request {
            Request::Readback { offset, length } => Some(ReadbackSession::new(offset, length)),
            _ => None,
        };
        Some(ReplyDecoder {
            opcode: request.opcode(),
            state: State::Status,
            readback,
        })
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn readback(&self) -> Option<&ReadbackSession> {
        self.readback.as_ref()
    }

    /// Feeds one byte. Returns the reply once it is complete; errors mean the
    /// link is out of step with the device.
    pub fn push(&mut self, byte: u8) -> Result<Option<Reply>> {
        match self.state {
            State::Status => match byte {
                ACK => match &self.readback {
                    Some(session) if !session.is_complete() => self.state = State::Data,
                    Some(_) => self.state = State::Checksum0,
                    None => return Ok(Some(Reply::Ack)),
                },
                NAK => self.state = State::ErrorCode,
                other => anyhow::bail!(
                    "expected ACK or NAK for {:?}, got 0x{:02x}",
                    self.opcode,
                    other
                ),
            },
            State::ErrorCode => {
                let code = ErrorCode::try_from(byte)
                    .map_err(|b| anyhow::format_err!("unknown error code 0x{:02x}", b))?;
                if code.carries_detail(Some(self.opcode)) {
                    self.state = State::Detail(code);
                } else {
                    return Ok(Some(self.nak(code, None)));
                }
            }
            State::Detail(code) => return Ok(Some(self.nak(code, Some(byte)))),
            State::Data => {
                if let Some(session) = self.readback.as_mut() {
                    session.push(byte);
                    if session.is_complete() {
                        self.state = State::Checksum0;
                    }
                }
            }
            State::Checksum0 => self.state = State::Checksum1(byte),
            State::Checksum1(lo) => {
                let checksum = u16::from_le_bytes([lo, byte]);
                let session = self
                    .readback
                    .take()
                    .ok_or_else(|| anyhow::format_err!("checksum without a readback"))?;
                return session.finish(checksum).map(Some);
            }
        }
        Ok(None)
    }

    fn nak(&self, code: ErrorCode, detail: Option<u8>) -> Reply {
        Reply::Nak(DeviceError {
            opcode: Some(self.opcode),
            code,
            detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(request: Request, bytes: &[u8]) -> Result<Vec<Reply>> {
        let mut decoder = ReplyDecoder::for_request(&request).unwrap();
        let mut replies = vec![];
        for &b in bytes {
            if let Some(reply) = decoder.push(b)? {
                replies.push(reply);
            }
        }
        Ok(replies)
    }

    #[test]
    fn readback_reply() {
        let req = Request::Readback {
            offset: 0,
            length: 4,
        };
        let replies = decode(req, &[ACK, 1, 2, 3, 4, 10, 0]).unwrap();
        assert_eq!(
            replies,
            [Reply::Readback {
                offset: 0,
                data: vec![1, 2, 3, 4]
            }]
        );
    }

    #[test]
    fn readback_checksum_mismatch() {
        let req = Request::Readback {
            offset: 0,
            length: 2,
        };
        assert!(decode(req, &[ACK, 1, 2, 4, 0]).is_err());
    }

    #[test]
    fn nak_framing_follows_the_opcode() {
        let load = Request::Load {
            offset: 0,
            data: vec![1],
        };
        assert_eq!(
            decode(load, &[NAK, 0x03]).unwrap(),
            [Reply::Nak(DeviceError {
                opcode: Some(Opcode::Load),
                code: ErrorCode::OutOfRange,
                detail: None,
            })]
        );

        let program = Request::EraseAndProgram {
            flash_offset: 0x100,
            work_offset: 0,
            length: 0x100,
        };
        // the decoder waits for the sub-code
        let replies = decode(program.clone(), &[NAK, 0x03]).unwrap();
        assert!(replies.is_empty());
        assert_eq!(
            decode(program, &[NAK, 0x03, 3]).unwrap(),
            [Reply::Nak(DeviceError {
                opcode: Some(Opcode::EraseAndProgram),
                code: ErrorCode::OutOfRange,
                detail: Some(3),
            })]
        );
    }

    #[test]
    fn unknown_command_carries_the_byte() {
        let replies = decode(Request::EraseFull, &[NAK, 0x06, b'F']).unwrap();
        match &replies[..] {
            [Reply::Nak(err)] => assert_eq!(err.detail, Some(b'F')),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(decode(Request::EraseFull, b"L").is_err());
        assert!(decode(Request::EraseFull, &[NAK, 0x42]).is_err());
        assert!(ReplyDecoder::for_request(&Request::Reset).is_none());
    }

    #[test]
    fn nak_converts_to_error() {
        let err = Reply::Nak(DeviceError {
            opcode: Some(Opcode::Zero),
            code: ErrorCode::InvalidLength,
            detail: None,
        })
        .into_result()
        .unwrap_err();
        assert_eq!(
            err.downcast_ref::<DeviceError>().map(|e| e.code),
            Some(ErrorCode::InvalidLength)
        );
    }
}
