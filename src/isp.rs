//! NXP ISP handshake: autobaud, clock setup and echo off.
//!
//! The ROM answers every step with one line. Lines that do not match the
//! expected answer are logged and dropped without re-sending anything, so a
//! garbled answer leaves the handshake waiting.

use anyhow::Result;

use crate::constants::isp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    PortOpen,
    WaitForInitialSynchronized,
    WaitForInitialOk,
    WaitForFrequencyOk,
    WaitForEchoAck,
    ConnectionEstablished,
}

#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    frequency_khz: u32,
}

impl Handshake {
    pub fn new(frequency_khz: u32) -> Self {
        Handshake {
            state: HandshakeState::PortOpen,
            frequency_khz,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::ConnectionEstablished
    }

    /// Starts over from autobaud. Returns the bytes to send.
    pub fn start(&mut self) -> Vec<u8> {
        self.state = HandshakeState::WaitForInitialSynchronized;
        isp::AUTOBAUD.to_vec()
    }

    /// Feeds one complete line, terminator included. Returns the bytes to send.
    pub fn on_line(&mut self, line: &[u8]) -> Vec<u8> {
        use HandshakeState::*;

        let (expected, next, reply) = match self.state {
            WaitForInitialSynchronized => (
                isp::SYNCHRONIZED.to_vec(),
                WaitForInitialOk,
                isp::SYNCHRONIZED.to_vec(),
            ),
            WaitForInitialOk => (
                isp::SYNCHRONIZED_OK.to_vec(),
                WaitForFrequencyOk,
                format!("{}\r\n", self.frequency_khz).into_bytes(),
            ),
            WaitForFrequencyOk => (
                format!("{}\rOK\r\n", self.frequency_khz).into_bytes(),
                WaitForEchoAck,
                isp::ECHO_OFF.to_vec(),
            ),
            WaitForEchoAck => (isp::ECHO_OFF_OK.to_vec(), ConnectionEstablished, vec![]),
            PortOpen | ConnectionEstablished => {
                log::debug!("isp: ignoring {:?}", String::from_utf8_lossy(line));
                return vec![];
            }
        };

        if line != expected {
            log::warn!(
                "isp: unexpected line in {:?}: {:?}",
                self.state,
                String::from_utf8_lossy(line)
            );
            return vec![];
        }
        log::debug!("isp: {:?} -> {:?}", self.state, next);
        self.state = next;
        if next == ConnectionEstablished {
            log::info!("ISP connection established, echo off");
        }
        reply
    }
}

/// Parses a decimal ISP status line such as `0\r\n`.
pub fn parse_status(line: &[u8]) -> Result<u32> {
    let text = std::str::from_utf8(line)?.trim();
    text.parse()
        .map_err(|_| anyhow::format_err!("expected a status line, got {:?}", text))
}

/// ISP return codes the tool reports by name.
pub fn status_name(code: u32) -> &'static str {
    match code {
        0 => "CMD_SUCCESS",
        1 => "INVALID_COMMAND",
        2 => "SRC_ADDR_ERROR",
        3 => "DST_ADDR_ERROR",
        4 => "SRC_ADDR_NOT_MAPPED",
        5 => "DST_ADDR_NOT_MAPPED",
        6 => "COUNT_ERROR",
        7 => "INVALID_SECTOR",
        8 => "SECTOR_NOT_BLANK",
        9 => "SECTOR_NOT_PREPARED_FOR_WRITE_OPERATION",
        10 => "COMPARE_ERROR",
        11 => "BUSY",
        12 => "PARAM_ERROR",
        13 => "ADDR_ERROR",
        14 => "ADDR_NOT_MAPPED",
        15 => "CMD_LOCKED",
        16 => "INVALID_CODE",
        17 => "INVALID_BAUD_RATE",
        18 => "INVALID_STOP_BIT",
        19 => "CODE_READ_PROTECTION_ENABLED",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_handshake() {
        let mut hs = Handshake::new(12000);
        assert_eq!(hs.start(), b"?");
        assert_eq!(hs.on_line(b"Synchronized\r\n"), b"Synchronized\r\n");
        assert_eq!(hs.on_line(b"Synchronized\rOK\r\n"), b"12000\r\n");
        assert_eq!(hs.on_line(b"12000\rOK\r\n"), b"A 0\r\n");
        assert!(!hs.is_established());
        assert!(hs.on_line(b"A 0\r0\r\n").is_empty());
        assert!(hs.is_established());
    }

    #[test]
    fn unexpected_line_does_not_advance() {
        let mut hs = Handshake::new(12000);
        hs.start();
        assert!(hs.on_line(b"garbage\r\n").is_empty());
        assert_eq!(hs.state(), HandshakeState::WaitForInitialSynchronized);
        // the terminator is part of the match
        assert!(hs.on_line(b"Synchronized\n").is_empty());
        assert_eq!(hs.state(), HandshakeState::WaitForInitialSynchronized);
    }

    #[test]
    fn frequency_is_configurable() {
        let mut hs = Handshake::new(4000);
        hs.start();
        hs.on_line(b"Synchronized\r\n");
        assert_eq!(hs.on_line(b"Synchronized\rOK\r\n"), b"4000\r\n");
        assert!(hs.on_line(b"12000\rOK\r\n").is_empty());
        assert_eq!(hs.state(), HandshakeState::WaitForFrequencyOk);
    }

    #[test]
    fn status_lines() {
        assert_eq!(parse_status(b"0\r\n").unwrap(), 0);
        assert_eq!(parse_status(b"19\r\n").unwrap(), 19);
        assert!(parse_status(b"OK\r\n").is_err());
        assert_eq!(status_name(19), "CODE_READ_PROTECTION_ENABLED");
    }
}
