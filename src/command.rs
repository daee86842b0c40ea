//! Host-side ISP commands.
//!
//! A command writes its request when started, then consumes the ROM's answer
//! one line at a time until it is done. Commands never start each other: the
//! session keeps the chain and starts the next one once the current one is
//! finished.

use std::fmt;

use anyhow::Result;

use crate::codec;
use crate::constants::READY_BANNER;
use crate::constants::isp::{BLOCK_OK, BLOCK_RESEND, LINE_BYTES, LINES_PER_BATCH, UNLOCK_CODE};
use crate::isp::{parse_status, status_name};

/// What a command produced once it is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    None,
    Data { offset: u32, bytes: Vec<u8> },
    /// The resident bootloader announced itself, the link now speaks its
    /// binary protocol.
    BlasterReady,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Pending,
    Done(Output),
}

/// A non-zero ISP return code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IspError {
    pub command: String,
    pub status: u32,
}

impl fmt::Display for IspError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed with status {} ({})",
            self.command,
            self.status,
            status_name(self.status)
        )
    }
}

impl std::error::Error for IspError {}

pub trait HostCommand: fmt::Debug {
    fn describe(&self) -> String;

    /// Writes the request into `out`.
    fn start(&mut self, out: &mut Vec<u8>);

    /// Consumes one line of the answer, terminator included.
    fn on_line(&mut self, line: &[u8], out: &mut Vec<u8>) -> Result<Progress>;
}

/// Parses a status line, turning a non-zero code into an [`IspError`].
fn expect_success(command: String, line: &[u8]) -> Result<()> {
    let status = parse_status(line)?;
    if status != 0 {
        return Err(IspError {
            command,
            status,
        }
        .into());
    }
    Ok(())
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(|b| b.is_ascii_whitespace())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    ReadStatus,
    ReadChecksumOk,
}

/// `W <offset> <length>`: writes RAM through the block protocol.
#[derive(Debug)]
pub struct WriteCommand {
    offset: u32,
    data: Vec<u8>,
    transferred: usize,
    batch_start: usize,
    state: WriteState,
}

impl WriteCommand {
    pub fn new(offset: u32, data: Vec<u8>) -> Result<Self> {
        anyhow::ensure!(offset % 4 == 0, "write offset {:#x} is not word aligned", offset);
        anyhow::ensure!(
            !data.is_empty() && data.len() % 4 == 0,
            "write length {} is not a non-zero multiple of 4",
            data.len()
        );
        Ok(WriteCommand {
            offset,
            data,
            transferred: 0,
            batch_start: 0,
            state: WriteState::ReadStatus,
        })
    }

    pub fn transferred(&self) -> usize {
        self.transferred
    }

    /// Sends up to 20 lines starting at `transferred`, then their checksum.
    fn write_batch(&mut self, out: &mut Vec<u8>) -> Result<()> {
        self.batch_start = self.transferred;
        let mut checksum = 0u32;
        for _ in 0..LINES_PER_BATCH {
            let remaining = self.data.len() - self.transferred;
            if remaining == 0 {
                break;
            }
            let chunk = &self.data[self.transferred..self.transferred + remaining.min(LINE_BYTES)];
            checksum += chunk.iter().map(|&b| b as u32).sum::<u32>();
            out.extend(codec::encode_line(chunk)?);
            out.extend_from_slice(b"\r\n");
            self.transferred += chunk.len();
        }
        out.extend(format!("{}\r\n", checksum).into_bytes());
        log::debug!(
            "write batch {:#x}..{:#x}, checksum {}",
            self.batch_start,
            self.transferred,
            checksum
        );
        self.state = WriteState::ReadChecksumOk;
        Ok(())
    }
}

impl HostCommand for WriteCommand {
    fn describe(&self) -> String {
        format!("W {} {}", self.offset, self.data.len())
    }

    fn start(&mut self, out: &mut Vec<u8>) {
        self.transferred = 0;
        self.state = WriteState::ReadStatus;
        out.extend(format!("{}\r\n", self.describe()).into_bytes());
    }

    fn on_line(&mut self, line: &[u8], out: &mut Vec<u8>) -> Result<Progress> {
        if is_blank(line) {
            return Ok(Progress::Pending);
        }
        match self.state {
            WriteState::ReadStatus => {
                expect_success(self.describe(), line)?;
                self.write_batch(out)?;
            }
            WriteState::ReadChecksumOk => {
                if line == BLOCK_OK {
                    if self.transferred == self.data.len() {
                        return Ok(Progress::Done(Output::None));
                    }
                    self.write_batch(out)?;
                } else if line == BLOCK_RESEND {
                    log::warn!("checksum rejected, resending from {:#x}", self.batch_start);
                    self.transferred = self.batch_start;
                    self.write_batch(out)?;
                } else {
                    log::warn!("write: unknown line {:?}", String::from_utf8_lossy(line));
                }
            }
        }
        Ok(Progress::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    ReadStatus,
    ReadData,
    ReadChecksum,
}

/// `R <offset> <length>`: reads memory through the block protocol.
#[derive(Debug)]
pub struct ReadCommand {
    offset: u32,
    length: u32,
    remaining: u32,
    buffer: Vec<u8>,
    /// End of the data already confirmed by a checksum.
    checkpoint: usize,
    lines: usize,
    state: ReadState,
}

impl ReadCommand {
    pub fn new(offset: u32, length: u32) -> Result<Self> {
        anyhow::ensure!(offset % 4 == 0, "read offset {:#x} is not word aligned", offset);
        anyhow::ensure!(
            length != 0 && length % 4 == 0,
            "read length {} is not a non-zero multiple of 4",
            length
        );
        Ok(ReadCommand {
            offset,
            length,
            remaining: length,
            buffer: Vec::with_capacity(length as usize),
            checkpoint: 0,
            lines: 0,
            state: ReadState::ReadStatus,
        })
    }

    pub fn received(&self) -> &[u8] {
        &self.buffer
    }
}

impl HostCommand for ReadCommand {
    fn describe(&self) -> String {
        format!("R {} {}", self.offset, self.length)
    }

    fn start(&mut self, out: &mut Vec<u8>) {
        self.remaining = self.length;
        self.buffer.clear();
        self.checkpoint = 0;
        self.lines = 0;
        self.state = ReadState::ReadStatus;
        out.extend(format!("{}\r\n", self.describe()).into_bytes());
    }

    fn on_line(&mut self, line: &[u8], out: &mut Vec<u8>) -> Result<Progress> {
        if is_blank(line) {
            return Ok(Progress::Pending);
        }
        match self.state {
            ReadState::ReadStatus => {
                expect_success(self.describe(), line)?;
                self.state = ReadState::ReadData;
            }
            ReadState::ReadData => {
                let len = codec::decode_into(&mut self.buffer, line)? as u32;
                anyhow::ensure!(
                    len <= self.remaining,
                    "device sent {} bytes, only {} outstanding",
                    len,
                    self.remaining
                );
                self.remaining -= len;
                self.lines += 1;
                if self.lines >= LINES_PER_BATCH || self.remaining == 0 {
                    self.state = ReadState::ReadChecksum;
                }
            }
            ReadState::ReadChecksum => {
                let expected = parse_status(line)?;
                let actual: u32 = self.buffer[self.checkpoint..]
                    .iter()
                    .map(|&b| b as u32)
                    .sum();
                self.lines = 0;
                if expected != actual {
                    log::warn!(
                        "read checksum mismatch at {:#x}: device {} local {}",
                        self.checkpoint,
                        expected,
                        actual
                    );
                    self.remaining += (self.buffer.len() - self.checkpoint) as u32;
                    self.buffer.truncate(self.checkpoint);
                    self.state = ReadState::ReadData;
                    out.extend_from_slice(BLOCK_RESEND);
                    return Ok(Progress::Pending);
                }

                out.extend_from_slice(BLOCK_OK);
                self.checkpoint = self.buffer.len();
                if self.remaining == 0 {
                    return Ok(Progress::Done(Output::Data {
                        offset: self.offset,
                        bytes: std::mem::take(&mut self.buffer),
                    }));
                }
                self.state = ReadState::ReadData;
            }
        }
        Ok(Progress::Pending)
    }
}

/// Any ISP command answered by a single status line.
#[derive(Debug)]
pub struct SimpleCommand {
    request: String,
}

impl SimpleCommand {
    pub fn new(request: impl Into<String>) -> Self {
        SimpleCommand {
            request: request.into(),
        }
    }
}

impl HostCommand for SimpleCommand {
    fn describe(&self) -> String {
        self.request.clone()
    }

    fn start(&mut self, out: &mut Vec<u8>) {
        out.extend(format!("{}\r\n", self.request).into_bytes());
    }

    fn on_line(&mut self, line: &[u8], _out: &mut Vec<u8>) -> Result<Progress> {
        if is_blank(line) {
            return Ok(Progress::Pending);
        }
        expect_success(self.describe(), line)?;
        Ok(Progress::Done(Output::None))
    }
}

/// `U 23130`: unlocks the flash and go commands.
#[derive(Debug)]
pub struct UnlockCommand(SimpleCommand);

impl UnlockCommand {
    pub fn new() -> Self {
        UnlockCommand(SimpleCommand::new(format!("U {}", UNLOCK_CODE)))
    }
}

impl Default for UnlockCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl HostCommand for UnlockCommand {
    fn describe(&self) -> String {
        self.0.describe()
    }

    fn start(&mut self, out: &mut Vec<u8>) {
        self.0.start(out)
    }

    fn on_line(&mut self, line: &[u8], out: &mut Vec<u8>) -> Result<Progress> {
        self.0.on_line(line, out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    WaitForOk,
    WaitForBanner,
}

/// `G <address> T`: jumps to Thumb code and waits for the bootloader banner.
#[derive(Debug)]
pub struct RunCommand {
    address: u32,
    state: RunState,
}

impl RunCommand {
    pub fn new(address: u32) -> Result<Self> {
        anyhow::ensure!(address % 4 == 0, "entry {:#x} is not word aligned", address);
        Ok(RunCommand {
            address,
            state: RunState::WaitForOk,
        })
    }
}

impl HostCommand for RunCommand {
    fn describe(&self) -> String {
        format!("G {} T", self.address)
    }

    fn start(&mut self, out: &mut Vec<u8>) {
        self.state = RunState::WaitForOk;
        out.extend(format!("{}\r\n", self.describe()).into_bytes());
    }

    fn on_line(&mut self, line: &[u8], _out: &mut Vec<u8>) -> Result<Progress> {
        match self.state {
            RunState::WaitForOk => {
                if is_blank(line) {
                    return Ok(Progress::Pending);
                }
                expect_success(self.describe(), line)?;
                log::info!("jumped to {:#010x}, waiting for the bootloader", self.address);
                self.state = RunState::WaitForBanner;
            }
            RunState::WaitForBanner => {
                if line == READY_BANNER.as_bytes() {
                    return Ok(Progress::Done(Output::BlasterReady));
                }
                log::debug!("run: {:?}", String::from_utf8_lossy(line));
            }
        }
        Ok(Progress::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(out: &[u8]) -> Vec<&[u8]> {
        out.split_inclusive(|&b| b == b'\n').collect()
    }

    #[test]
    fn write_batches_and_resends() {
        let data: Vec<u8> = (0..900u32).map(|i| i as u8).collect();
        let mut cmd = WriteCommand::new(0x1000_1000, data.clone()).unwrap();

        let mut out = vec![];
        cmd.start(&mut out);
        assert_eq!(out, b"W 268439552 900\r\n");

        out.clear();
        assert_eq!(cmd.on_line(b"0\r\n", &mut out).unwrap(), Progress::Pending);
        let batch = out.clone();
        let sent = lines(&batch);
        // 20 lines of 45 bytes, then the checksum
        assert_eq!(sent.len(), 21);
        let sum: u32 = data.iter().map(|&b| b as u32).sum();
        assert_eq!(sent[20], format!("{}\r\n", sum).as_bytes());
        assert_eq!(codec::decode(&sent[..20]).unwrap(), data);

        out.clear();
        cmd.on_line(b"RESEND\r\n", &mut out).unwrap();
        assert_eq!(out, batch);
        assert_eq!(cmd.transferred(), 900);

        out.clear();
        assert_eq!(
            cmd.on_line(b"OK\r\n", &mut out).unwrap(),
            Progress::Done(Output::None)
        );
        assert!(out.is_empty());
    }

    #[test]
    fn write_second_batch_continues() {
        let data = vec![0x55u8; 1000];
        let mut cmd = WriteCommand::new(0, data).unwrap();
        let mut out = vec![];
        cmd.start(&mut out);
        out.clear();
        cmd.on_line(b"0\r\n", &mut out).unwrap();
        out.clear();
        cmd.on_line(b"OK\r\n", &mut out).unwrap();
        let sent = lines(&out);
        // 100 bytes left: three lines, then the checksum
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[3], b"8500\r\n");
    }

    #[test]
    fn write_resend_rewinds_to_the_failed_batch() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let mut cmd = WriteCommand::new(0, data.clone()).unwrap();
        let mut out = vec![];
        cmd.start(&mut out);
        cmd.on_line(b"0\r\n", &mut out).unwrap();
        out.clear();
        cmd.on_line(b"OK\r\n", &mut out).unwrap();
        let tail = out.clone();
        assert_eq!(cmd.transferred(), 1000);

        out.clear();
        cmd.on_line(b"RESEND\r\n", &mut out).unwrap();
        assert_eq!(out, tail);
        let sent = lines(&out);
        assert_eq!(codec::decode(&sent[..3]).unwrap(), &data[900..]);
        assert_eq!(cmd.transferred(), 1000);

        out.clear();
        assert_eq!(
            cmd.on_line(b"OK\r\n", &mut out).unwrap(),
            Progress::Done(Output::None)
        );
    }

    #[test]
    fn write_refuses_nonzero_status() {
        let mut cmd = WriteCommand::new(0, vec![0; 4]).unwrap();
        let mut out = vec![];
        cmd.start(&mut out);
        let err = cmd.on_line(b"14\r\n", &mut out).unwrap_err();
        let isp = err.downcast_ref::<IspError>().unwrap();
        assert_eq!(isp.status, 14);
    }

    #[test]
    fn write_rejects_unaligned_input() {
        assert!(WriteCommand::new(2, vec![0; 4]).is_err());
        assert!(WriteCommand::new(0, vec![0; 6]).is_err());
        assert!(ReadCommand::new(0, 0).is_err());
        assert!(RunCommand::new(0x1000_1001).is_err());
    }

    #[test]
    fn read_truncates_to_checkpoint_on_mismatch() {
        let data: Vec<u8> = (0..48u32).map(|i| i as u8 * 3).collect();
        let encoded = codec::encode(&data).unwrap();
        let sum: u32 = data.iter().map(|&b| b as u32).sum();

        let mut cmd = ReadCommand::new(0x1000_0000, 48).unwrap();
        let mut out = vec![];
        cmd.start(&mut out);
        assert_eq!(out, b"R 268435456 48\r\n");

        out.clear();
        cmd.on_line(b"0\r\n", &mut out).unwrap();
        for line in &encoded[..2] {
            let mut line = line.clone();
            line.extend_from_slice(b"\r\n");
            assert_eq!(cmd.on_line(&line, &mut out).unwrap(), Progress::Pending);
        }
        assert_eq!(cmd.received(), &data[..]);

        cmd.on_line(format!("{}\r\n", sum + 1).as_bytes(), &mut out)
            .unwrap();
        assert_eq!(out, BLOCK_RESEND);
        assert!(cmd.received().is_empty());

        // the same range comes again
        out.clear();
        for line in &encoded[..2] {
            let mut line = line.clone();
            line.extend_from_slice(b"\r\n");
            cmd.on_line(&line, &mut out).unwrap();
        }
        let done = cmd
            .on_line(format!("{}\r\n", sum).as_bytes(), &mut out)
            .unwrap();
        assert_eq!(out, BLOCK_OK);
        assert_eq!(
            done,
            Progress::Done(Output::Data {
                offset: 0x1000_0000,
                bytes: data
            })
        );
    }

    #[test]
    fn read_mismatch_keeps_earlier_batches() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();
        let encoded = codec::encode(&data).unwrap();
        let head: u32 = data[..900].iter().map(|&b| b as u32).sum();
        let tail: u32 = data[900..].iter().map(|&b| b as u32).sum();

        let mut cmd = ReadCommand::new(0, 1000).unwrap();
        let mut out = vec![];
        cmd.start(&mut out);
        cmd.on_line(b"0\r\n", &mut out).unwrap();

        let feed = |cmd: &mut ReadCommand, range: std::ops::Range<usize>, out: &mut Vec<u8>| {
            for line in &encoded[range] {
                let mut line = line.clone();
                line.extend_from_slice(b"\r\n");
                assert_eq!(cmd.on_line(&line, out).unwrap(), Progress::Pending);
            }
        };

        feed(&mut cmd, 0..20, &mut out);
        out.clear();
        cmd.on_line(format!("{}\r\n", head).as_bytes(), &mut out)
            .unwrap();
        assert_eq!(out, BLOCK_OK);

        feed(&mut cmd, 20..23, &mut out);
        out.clear();
        cmd.on_line(format!("{}\r\n", tail + 1).as_bytes(), &mut out)
            .unwrap();
        assert_eq!(out, BLOCK_RESEND);
        assert_eq!(cmd.received(), &data[..900]);

        feed(&mut cmd, 20..23, &mut out);
        out.clear();
        let done = cmd
            .on_line(format!("{}\r\n", tail).as_bytes(), &mut out)
            .unwrap();
        assert_eq!(out, BLOCK_OK);
        assert_eq!(
            done,
            Progress::Done(Output::Data {
                offset: 0,
                bytes: data
            })
        );
    }

    #[test]
    fn read_rejects_excess_data() {
        let mut cmd = ReadCommand::new(0, 4).unwrap();
        let mut out = vec![];
        cmd.start(&mut out);
        cmd.on_line(b"0\r\n", &mut out).unwrap();
        let mut line = codec::encode_line(&[0; 8]).unwrap();
        line.extend_from_slice(b"\r\n");
        assert!(cmd.on_line(&line, &mut out).is_err());
    }

    #[test]
    fn run_waits_for_banner() {
        let mut cmd = RunCommand::new(0x1000_1000).unwrap();
        let mut out = vec![];
        cmd.start(&mut out);
        assert_eq!(out, b"G 268439552 T\r\n");
        assert_eq!(cmd.on_line(b"0\r\n", &mut out).unwrap(), Progress::Pending);
        assert_eq!(cmd.on_line(b"noise\r\n", &mut out).unwrap(), Progress::Pending);
        assert_eq!(
            cmd.on_line(READY_BANNER.as_bytes(), &mut out).unwrap(),
            Progress::Done(Output::BlasterReady)
        );
    }

    #[test]
    fn unlock_sends_code() {
        let mut cmd = UnlockCommand::new();
        let mut out = vec![];
        cmd.start(&mut out);
        assert_eq!(out, b"U 23130\r\n");
        assert_eq!(
            cmd.on_line(b"0\r\n", &mut out).unwrap(),
            Progress::Done(Output::None)
        );
    }
}
