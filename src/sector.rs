//! Flash geometry: the ordered sector table and lookups over it.

use std::ops::RangeInclusive;

use anyhow::Result;

use crate::constants::MAX_SECTORS;

/// One erasable flash sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector {
    pub start_address: u32,
    pub length: u32,
}

impl Sector {
    pub fn contains(&self, address: u32) -> bool {
        address >= self.start_address && (address - self.start_address) < self.length
    }

    pub fn end_address(&self) -> u64 {
        self.start_address as u64 + self.length as u64
    }
}

/// Contiguous, ordered, non-overlapping sectors. The index of a sector is
/// its position in the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorTable {
    sectors: Vec<Sector>,
}

impl SectorTable {
    pub fn new(sectors: Vec<Sector>) -> Result<Self> {
        anyhow::ensure!(!sectors.is_empty(), "sector table is empty");
        anyhow::ensure!(
            sectors.len() <= MAX_SECTORS,
            "sector table has {} entries, at most {} are addressable",
            sectors.len(),
            MAX_SECTORS
        );
        for (i, pair) in sectors.windows(2).enumerate() {
            anyhow::ensure!(
                pair[0].end_address() == pair[1].start_address as u64,
                "sector {} does not start where sector {} ends",
                i + 1,
                i
            );
        }
        anyhow::ensure!(
            sectors.iter().all(|s| s.length > 0),
            "zero-length sector"
        );
        Ok(SectorTable { sectors })
    }

    /// Builds a table from `(count, size)` groups laid out from `base`.
    pub fn from_groups(base: u32, groups: &[(usize, u32)]) -> Result<Self> {
        let mut sectors = vec![];
        let mut address = base as u64;
        for &(count, size) in groups {
            for _ in 0..count {
                anyhow::ensure!(
                    address + size as u64 <= u32::MAX as u64 + 1,
                    "sector layout exceeds the 32-bit address space"
                );
                sectors.push(Sector {
                    start_address: address as u32,
                    length: size,
                });
                address += size as u64;
            }
        }
        Self::new(sectors)
    }

    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }

    pub fn sectors(&self) -> &[Sector] {
        &self.sectors
    }

    pub fn get(&self, index: usize) -> Option<&Sector> {
        self.sectors.get(index)
    }

    pub fn flash_size(&self) -> u64 {
        self.sectors.iter().map(|s| s.length as u64).sum()
    }

    /// Index of the sector containing `address`.
    pub fn find_sector_for_address(&self, address: u32) -> Option<u8> {
        self.sectors
            .iter()
            .position(|s| s.contains(address))
            .map(|i| i as u8)
    }

    /// Index range of the sectors covering `[first, last]`.
    pub fn span(&self, first: u32, last: u32) -> Option<RangeInclusive<u8>> {
        let a = self.find_sector_for_address(first)?;
        let b = self.find_sector_for_address(last)?;
        Some(a..=b)
    }

    /// The whole table as a single run.
    pub fn full_span(&self) -> RangeInclusive<u8> {
        0..=(self.sectors.len() - 1) as u8
    }
}

/// Sorts `ids` and groups them into maximal runs of consecutive ids.
pub fn coalesce_runs(ids: &mut [u8]) -> Vec<RangeInclusive<u8>> {
    ids.sort_unstable();

    let mut runs: Vec<RangeInclusive<u8>> = vec![];
    for &id in ids.iter() {
        match runs.last_mut() {
            Some(run) if *run.end() == id => {}
            Some(run) if (*run.end() as u16) + 1 == id as u16 => {
                *run = *run.start()..=id;
            }
            _ => runs.push(id..=id),
        }
    }
    runs
}
