//! The resident bootloader: a command dispatcher feeding one byte at a time
//! into the sub-protocol that is currently active.
//!
//! Every command is a small state machine. `handle` consumes the machine
//! together with one received byte and returns either the next state or a
//! [`Completion`], at which point control goes back to the dispatcher.
//!
//! Bytes come either from [`Bootloader::run`], which blocks on the serial
//! link, or from [`Bootloader::step`] for a push-style source such as a
//! receive interrupt. The two must not be mixed on one instance.

use std::fmt;
use std::ops::RangeInclusive;

use crate::chip::Chip;
use crate::constants::{READY_BANNER, SECTOR_ERASE_TIMEOUT, STAGING_CAPACITY, detail};
use crate::protocol::{Completion, ErrorCode, Opcode};
use crate::sector::SectorTable;

pub use self::erase::Erase;
pub use self::load::Load;
pub use self::program::Program;
pub use self::readback::Readback;
pub use self::sim::{FlashCall, FlashOp, SimulatedTarget};
pub use self::zero::Zero;

mod erase;
mod load;
mod program;
mod readback;
mod sim;
mod zero;

/// Byte transport to the host.
pub trait SerialLink {
    /// Blocks until a byte arrives, `None` once the link is gone.
    fn rx(&mut self) -> Option<u8>;
    fn tx(&mut self, data: &[u8]);
}

/// Return code of a failed IAP call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IapStatus(pub u32);

impl IapStatus {
    pub const INVALID_COMMAND: IapStatus = IapStatus(1);
    pub const SRC_ADDR_ERROR: IapStatus = IapStatus(2);
    pub const DST_ADDR_ERROR: IapStatus = IapStatus(3);
    pub const COUNT_ERROR: IapStatus = IapStatus(6);
    pub const INVALID_SECTOR: IapStatus = IapStatus(7);
    pub const SECTOR_NOT_PREPARED: IapStatus = IapStatus(9);
    pub const BUSY: IapStatus = IapStatus(11);
}

impl fmt::Display for IapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IAP status {}", self.0)
    }
}

/// The three in-application-programming calls the bootloader relies on.
pub trait FlashPrimitives {
    fn prepare(&mut self, sectors: RangeInclusive<u8>) -> Result<(), IapStatus>;
    fn erase(&mut self, sectors: RangeInclusive<u8>, timeout: u32) -> Result<(), IapStatus>;
    fn copy_ram_to_flash(&mut self, dst: u32, src: &[u8], timeout: u32) -> Result<(), IapStatus>;
}

/// Plain memory reads at absolute addresses.
pub trait MemoryBus {
    fn read(&self, address: u32) -> u8;
}

/// Board-level parameters of the bootloader.
#[derive(Debug, Clone)]
pub struct BootloaderConfig {
    /// Absolute address the staging buffer is visible at for readback.
    pub staging_address: u32,
    pub staging_size: usize,
    pub erase_timeout: u32,
    /// Timeout for the erase and copy calls of erase-and-program.
    pub program_timeout: u32,
    pub sectors: SectorTable,
}

impl BootloaderConfig {
    pub fn new(sectors: SectorTable) -> Self {
        BootloaderConfig {
            staging_address: 0,
            staging_size: STAGING_CAPACITY,
            erase_timeout: SECTOR_ERASE_TIMEOUT,
            program_timeout: 12000,
            sectors,
        }
    }
}

impl From<&Chip> for BootloaderConfig {
    fn from(chip: &Chip) -> Self {
        BootloaderConfig {
            staging_address: chip.staging_address,
            staging_size: chip.staging_size as usize,
            erase_timeout: SECTOR_ERASE_TIMEOUT,
            program_timeout: chip.iap_timeout(),
            sectors: chip.sectors.clone(),
        }
    }
}

/// The RAM window commands load into and program from.
pub struct StagingBuffer {
    address: u32,
    data: Vec<u8>,
}

impl StagingBuffer {
    pub fn new(address: u32, size: usize) -> Self {
        StagingBuffer {
            address,
            data: vec![0; size],
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Whether `[offset, offset + length)` lies inside the buffer.
    pub fn fits(&self, offset: u32, length: u32) -> bool {
        offset as u64 + length as u64 <= self.data.len() as u64
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Byte at absolute `address`, if the buffer is mapped there.
    pub fn at_address(&self, address: u32) -> Option<u8> {
        let offset = address.checked_sub(self.address)?;
        self.data.get(offset as usize).copied()
    }
}

/// Where the bootloader handed control when it stopped serving commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    Reset,
    ExitToLoader,
    LinkClosed,
}

/// Result of feeding one byte to a sub-protocol.
#[derive(Debug)]
pub enum Outcome<S> {
    Continue(S),
    Complete(Completion),
}

impl<S> Outcome<S> {
    fn map<T>(self, f: impl FnOnce(S) -> T) -> Outcome<T> {
        match self {
            Outcome::Continue(s) => Outcome::Continue(f(s)),
            Outcome::Complete(c) => Outcome::Complete(c),
        }
    }
}

/// Everything a sub-protocol may touch while it is active.
pub struct Context<'a, L, T> {
    pub link: &'a mut L,
    pub target: &'a mut T,
    pub staging: &'a mut StagingBuffer,
    pub config: &'a BootloaderConfig,
}

impl<L, T: MemoryBus> Context<'_, L, T> {
    /// Reads an absolute address, the staging window shadowing the target.
    pub fn read_memory(&self, address: u32) -> u8 {
        self.staging
            .at_address(address)
            .unwrap_or_else(|| self.target.read(address))
    }
}

impl<L, T: FlashPrimitives> Context<'_, L, T> {
    /// Prepares and erases each run in order, stopping at the first failure.
    pub fn erase_runs(&mut self, runs: &[RangeInclusive<u8>]) -> Completion {
        for run in runs {
            log::debug!("erase sectors {}..={}", run.start(), run.end());
            if let Err(status) = self.target.prepare(run.clone()) {
                log::warn!("prepare {:?} failed: {}", run, status);
                return Completion::nak_with(ErrorCode::FlashOperationFailure, detail::PREPARE);
            }
            if let Err(status) = self.target.erase(run.clone(), self.config.erase_timeout) {
                log::warn!("erase {:?} failed: {}", run, status);
                return Completion::nak_with(ErrorCode::FlashOperationFailure, detail::ERASE);
            }
        }
        Completion::Ack
    }
}

enum Active {
    Idle,
    Load(Load),
    Zero(Zero),
    Readback(Readback),
    Erase(Erase),
    Program(Program),
}

pub struct Bootloader<L, T> {
    link: L,
    target: T,
    staging: StagingBuffer,
    config: BootloaderConfig,
    active: Active,
}

impl<L, T> Bootloader<L, T>
where
    L: SerialLink,
    T: FlashPrimitives + MemoryBus,
{
    pub fn new(link: L, target: T, config: BootloaderConfig) -> Self {
        Bootloader {
            link,
            target,
            staging: StagingBuffer::new(config.staging_address, config.staging_size),
            config,
            active: Active::Idle,
        }
    }

    /// Serves commands until the link closes or a command leaves the bootloader.
    pub fn run(&mut self) -> Halt {
        self.announce();
        loop {
            let Some(byte) = self.link.rx() else {
                log::info!("link closed");
                return Halt::LinkClosed;
            };
            if let Some(halt) = self.step(byte) {
                return halt;
            }
        }
    }

    pub fn announce(&mut self) {
        self.link.tx(READY_BANNER.as_bytes());
    }

    /// Feeds one received byte.
    pub fn step(&mut self, byte: u8) -> Option<Halt> {
        let active = std::mem::replace(&mut self.active, Active::Idle);
        let mut cx = Context {
            link: &mut self.link,
            target: &mut self.target,
            staging: &mut self.staging,
            config: &self.config,
        };
        let outcome = match active {
            Active::Idle => return self.dispatch(byte),
            Active::Load(s) => s.handle(byte, &mut cx).map(Active::Load),
            Active::Zero(s) => s.handle(byte, &mut cx).map(Active::Zero),
            Active::Readback(s) => s.handle(byte, &mut cx).map(Active::Readback),
            Active::Erase(s) => s.handle(byte, &mut cx).map(Active::Erase),
            Active::Program(s) => s.handle(byte, &mut cx).map(Active::Program),
        };
        match outcome {
            Outcome::Continue(next) => self.active = next,
            Outcome::Complete(completion) => self.complete(completion),
        }
        None
    }

    fn dispatch(&mut self, byte: u8) -> Option<Halt> {
        let opcode = match Opcode::try_from(byte) {
            Ok(opcode) => opcode,
            Err(unknown) => {
                log::warn!("unknown command byte 0x{:02x}", unknown);
                self.complete(Completion::nak_with(ErrorCode::UnknownCommand, unknown));
                return None;
            }
        };
        log::debug!("command {:?}", opcode);
        match opcode {
            Opcode::Load => self.active = Active::Load(Load::begin()),
            Opcode::Zero => self.active = Active::Zero(Zero::begin()),
            Opcode::Readback => self.active = Active::Readback(Readback::begin()),
            Opcode::EraseSectors => self.active = Active::Erase(Erase::begin()),
            Opcode::EraseAndProgram => self.active = Active::Program(Program::begin()),
            Opcode::EraseFull => {
                let mut cx = Context {
                    link: &mut self.link,
                    target: &mut self.target,
                    staging: &mut self.staging,
                    config: &self.config,
                };
                let completion = cx.erase_runs(&[self.config.sectors.full_span()]);
                self.complete(completion);
            }
            Opcode::Reset => return Some(Halt::Reset),
            Opcode::ExitToLoader => return Some(Halt::ExitToLoader),
        }
        None
    }

    fn complete(&mut self, completion: Completion) {
        if let Completion::Nak { code, detail } = completion {
            log::debug!("nak: {} {:?}", code, detail);
        }
        self.link.tx(&completion.to_raw());
    }

    /// Whether a command is in the middle of receiving its parameters.
    pub fn is_busy(&self) -> bool {
        !matches!(self.active, Active::Idle)
    }

    pub fn staging(&self) -> &StagingBuffer {
        &self.staging
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::constants::{ACK, NAK};

    /// In-memory link: queued input, captured output.
    #[derive(Default)]
    pub struct BufferLink {
        pub input: VecDeque<u8>,
        pub output: Vec<u8>,
    }

    impl SerialLink for BufferLink {
        fn rx(&mut self) -> Option<u8> {
            self.input.pop_front()
        }

        fn tx(&mut self, data: &[u8]) {
            self.output.extend_from_slice(data);
        }
    }

    pub fn small_table() -> SectorTable {
        SectorTable::from_groups(0, &[(16, 0x1000), (14, 0x8000)]).unwrap()
    }

    pub fn bootloader(table: SectorTable) -> Bootloader<BufferLink, SimulatedTarget> {
        let target = SimulatedTarget::new(table.clone());
        Bootloader::new(BufferLink::default(), target, BootloaderConfig::new(table))
    }

    /// Feeds `bytes` and returns what the bootloader sent back.
    pub fn exchange(
        bl: &mut Bootloader<BufferLink, SimulatedTarget>,
        bytes: &[u8],
    ) -> Vec<u8> {
        for &b in bytes {
            assert_eq!(bl.step(b), None);
        }
        std::mem::take(&mut bl.link_mut().output)
    }

    #[test]
    fn unknown_command_is_reported_with_the_byte() {
        let mut bl = bootloader(small_table());
        assert_eq!(exchange(&mut bl, b"?"), [NAK, 0x06, b'?']);
        assert!(!bl.is_busy());
    }

    #[test]
    fn run_announces_and_stops_on_reset() {
        let mut bl = bootloader(small_table());
        bl.link_mut().input.extend([b'Z', 0, 0, 4, 0, b'K', b'Z']);
        assert_eq!(bl.run(), Halt::Reset);
        let mut expected = READY_BANNER.as_bytes().to_vec();
        expected.push(ACK);
        assert_eq!(bl.link_mut().output, expected);
        // the byte after the reset is never consumed
        assert_eq!(bl.link_mut().input, [b'Z']);
    }

    #[test]
    fn run_returns_when_link_closes() {
        let mut bl = bootloader(small_table());
        bl.link_mut().input.extend([b'X']);
        assert_eq!(bl.run(), Halt::ExitToLoader);
        assert_eq!(bl.run(), Halt::LinkClosed);
    }

    #[test]
    fn full_erase_is_one_run() {
        let mut bl = bootloader(small_table());
        assert_eq!(exchange(&mut bl, b"F"), [ACK]);
        assert_eq!(
            bl.target().calls(),
            [FlashCall::Prepare(0..=29), FlashCall::Erase(0..=29)]
        );
    }

    #[test]
    fn full_erase_reports_failing_call() {
        let mut bl = bootloader(small_table());
        bl.target_mut().fail_next(FlashOp::Erase);
        assert_eq!(exchange(&mut bl, b"F"), [NAK, 0x05, detail::ERASE]);
        // still serviceable
        assert_eq!(exchange(&mut bl, b"F"), [ACK]);
    }

    #[test]
    fn staging_window_shadows_target_memory() {
        let staging = StagingBuffer::new(0x2007_c000, 16);
        assert_eq!(staging.at_address(0x2007_c000), Some(0));
        assert_eq!(staging.at_address(0x2007_c010), None);
        assert_eq!(staging.at_address(0x1000_0000), None);
        assert!(staging.fits(8, 8));
        assert!(!staging.fits(8, 9));
    }
}
