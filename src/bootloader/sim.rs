//! A target backed by host memory, standing in for the IAP ROM.
//!
//! Flash starts erased, erasing sets whole sectors to 0xff and programming
//! can only clear bits. Like the real IAP, every erase or copy needs a
//! matching prepare right before it.

use std::ops::RangeInclusive;

use super::{FlashPrimitives, IapStatus, MemoryBus};
use crate::sector::SectorTable;

/// A recorded IAP call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashCall {
    Prepare(RangeInclusive<u8>),
    Erase(RangeInclusive<u8>),
    Copy { dst: u32, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOp {
    Prepare,
    Erase,
    Copy,
}

pub struct SimulatedTarget {
    sectors: SectorTable,
    flash: Vec<u8>,
    prepared: Option<RangeInclusive<u8>>,
    calls: Vec<FlashCall>,
    /// Fail the call of this kind once the counter reaches zero.
    failure: Option<(FlashOp, usize)>,
}

impl SimulatedTarget {
    pub fn new(sectors: SectorTable) -> Self {
        let size = sectors.flash_size() as usize;
        SimulatedTarget {
            sectors,
            flash: vec![0xff; size],
            prepared: None,
            calls: vec![],
            failure: None,
        }
    }

    pub fn calls(&self) -> &[FlashCall] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// Contents of flash at `[address, address + len)`.
    pub fn flash(&self, address: u32, len: usize) -> &[u8] {
        let start = address as usize;
        &self.flash[start..start + len]
    }

    /// Writes flash directly, bypassing the IAP rules.
    pub fn poke(&mut self, address: u32, data: &[u8]) {
        let start = address as usize;
        self.flash[start..start + data.len()].copy_from_slice(data);
    }

    pub fn fail_next(&mut self, op: FlashOp) {
        self.fail_after(op, 0);
    }

    /// Lets `skip` calls of `op` succeed, then fails the next one.
    pub fn fail_after(&mut self, op: FlashOp, skip: usize) {
        self.failure = Some((op, skip));
    }

    fn injected_failure(&mut self, op: FlashOp) -> Result<(), IapStatus> {
        match &mut self.failure {
            Some((kind, 0)) if *kind == op => {
                self.failure = None;
                Err(IapStatus::BUSY)
            }
            Some((kind, skip)) if *kind == op => {
                *skip -= 1;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn take_prepared(&mut self, sectors: &RangeInclusive<u8>) -> Result<(), IapStatus> {
        match self.prepared.take() {
            Some(p) if p.start() <= sectors.start() && sectors.end() <= p.end() => Ok(()),
            _ => Err(IapStatus::SECTOR_NOT_PREPARED),
        }
    }

    fn check_sectors(&self, sectors: &RangeInclusive<u8>) -> Result<(), IapStatus> {
        if sectors.start() > sectors.end() || *sectors.end() as usize >= self.sectors.len() {
            return Err(IapStatus::INVALID_SECTOR);
        }
        Ok(())
    }
}

impl FlashPrimitives for SimulatedTarget {
    fn prepare(&mut self, sectors: RangeInclusive<u8>) -> Result<(), IapStatus> {
        self.calls.push(FlashCall::Prepare(sectors.clone()));
        self.injected_failure(FlashOp::Prepare)?;
        self.check_sectors(&sectors)?;
        self.prepared = Some(sectors);
        Ok(())
    }

    fn erase(&mut self, sectors: RangeInclusive<u8>, _timeout: u32) -> Result<(), IapStatus> {
        self.calls.push(FlashCall::Erase(sectors.clone()));
        self.injected_failure(FlashOp::Erase)?;
        self.check_sectors(&sectors)?;
        self.take_prepared(&sectors)?;

        let first = self.sectors.sectors()[*sectors.start() as usize];
        let last = self.sectors.sectors()[*sectors.end() as usize];
        let range = first.start_address as usize..last.end_address() as usize;
        self.flash[range].fill(0xff);
        Ok(())
    }

    fn copy_ram_to_flash(&mut self, dst: u32, src: &[u8], _timeout: u32) -> Result<(), IapStatus> {
        self.calls.push(FlashCall::Copy {
            dst,
            len: src.len(),
        });
        self.injected_failure(FlashOp::Copy)?;
        if dst % 256 != 0 {
            return Err(IapStatus::DST_ADDR_ERROR);
        }
        if ![256, 512, 1024, 4096].contains(&src.len()) {
            return Err(IapStatus::COUNT_ERROR);
        }
        let span = self
            .sectors
            .span(dst, dst + src.len() as u32 - 1)
            .ok_or(IapStatus::DST_ADDR_ERROR)?;
        self.take_prepared(&span)?;

        let start = dst as usize;
        for (cell, &b) in self.flash[start..start + src.len()].iter_mut().zip(src) {
            *cell &= b;
        }
        Ok(())
    }
}

impl MemoryBus for SimulatedTarget {
    fn read(&self, address: u32) -> u8 {
        // unmapped memory reads as zero
        self.flash.get(address as usize).copied().unwrap_or(0)
    }
}
