//! MCU chip definitions: flash geometry and the RAM windows the loader uses.
use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::sector::SectorTable;

/// MCU family, as described by one `devices/*.yaml` file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Family {
    pub name: String,
    pub description: String,
    pub isp_frequency_khz: u32,
    pub cpu_frequency_khz: u32,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub load_address: u32,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub staging_address: u32,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub staging_size: u32,
    pub variants: Vec<Variant>,
    sectors: Vec<SectorGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub flash_size: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct SectorGroup {
    count: usize,
    #[serde(deserialize_with = "parse_address_and_offset")]
    size: u32,
}

/// Represents an MCU chip
#[derive(Debug, Clone)]
pub struct Chip {
    pub name: String,
    pub family: String,
    /// Crystal frequency reported to the ISP, in kHz
    pub isp_frequency_khz: u32,
    /// Core clock while the bootloader runs, IAP timeouts are derived from it
    pub cpu_frequency_khz: u32,
    /// Where the bootloader image is written through the ISP
    pub load_address: u32,
    pub staging_address: u32,
    pub staging_size: u32,
    pub flash_size: u32,
    pub sectors: SectorTable,
}

impl ::std::fmt::Display for Chip {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(
            f,
            "{}({}, {}KiB flash, {} sectors)",
            self.name,
            self.family,
            self.flash_size / 1024,
            self.sectors.len()
        )
    }
}

pub struct ChipDB {
    families: Vec<Family>,
}

impl ChipDB {
    pub fn load() -> Result<Self> {
        Ok(ChipDB {
            families: vec![
                serde_yaml::from_str(include_str!("../devices/lpc176x.yaml"))?,
                serde_yaml::from_str(include_str!("../devices/lpc175x.yaml"))?,
            ],
        })
    }

    pub fn chip_names(&self) -> impl Iterator<Item = &str> {
        self.families
            .iter()
            .flat_map(|f| f.variants.iter().map(|v| v.name.as_str()))
    }

    pub fn find_chip(name: &str) -> Result<Chip> {
        let db = ChipDB::load()?;

        let (family, variant) = db
            .families
            .iter()
            .flat_map(|f| f.variants.iter().map(move |v| (f, v)))
            .find(|(_, v)| v.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                anyhow::format_err!(
                    "Cannot find chip {:?}, known chips: {}",
                    name,
                    db.chip_names().collect::<Vec<_>>().join(", ")
                )
            })?;
        log::debug!("Find chip family: {}", family.name);

        // Only the sectors backed by this variant's flash
        let mut groups = vec![];
        let mut remaining = variant.flash_size;
        for group in &family.sectors {
            if remaining == 0 {
                break;
            }
            let count = group.count.min((remaining / group.size) as usize);
            groups.push((count, group.size));
            remaining -= count as u32 * group.size;
        }
        anyhow::ensure!(
            remaining == 0,
            "{}: flash size {:#x} is not a whole number of sectors",
            variant.name,
            variant.flash_size
        );

        Ok(Chip {
            name: variant.name.clone(),
            family: family.name.clone(),
            isp_frequency_khz: family.isp_frequency_khz,
            cpu_frequency_khz: family.cpu_frequency_khz,
            load_address: family.load_address,
            staging_address: family.staging_address,
            staging_size: family.staging_size,
            flash_size: variant.flash_size,
            sectors: SectorTable::from_groups(0, &groups)?,
        })
    }
}

impl Chip {
    /// IAP erase/copy timeout, one millisecond worth of core cycles
    pub const fn iap_timeout(&self) -> u32 {
        self.cpu_frequency_khz
    }
}

fn parse_address_and_offset<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let s: String = serde::Deserialize::deserialize(deserializer)?;
    let parsed = if s.starts_with("0x") || s.starts_with("0X") {
        u32::from_str_radix(&s[2..], 16).ok()
    } else if let Some(kib) = s.strip_suffix("KiB") {
        kib.parse::<u32>().ok().map(|n| n * 1024)
    } else if let Some(kib) = s.strip_suffix("KB") {
        kib.parse::<u32>().ok().map(|n| n * 1024)
    } else if let Some(kib) = s.strip_suffix('K') {
        kib.parse::<u32>().ok().map(|n| n * 1024)
    } else {
        // parse pure digits here
        s.parse().ok()
    };
    parsed.ok_or_else(|| D::Error::custom(format!("error while parsing {:?}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lpc1768_geometry() {
        let chip = ChipDB::find_chip("lpc1768").unwrap();
        assert_eq!(chip.name, "LPC1768");
        assert_eq!(chip.sectors.len(), 30);
        assert_eq!(chip.sectors.flash_size(), 512 * 1024);
        assert_eq!(chip.load_address, 0x1000_1000);
        assert_eq!(chip.staging_address, 0x2007_c000);
        assert_eq!(chip.staging_size, 32 * 1024);
        assert_eq!(chip.isp_frequency_khz, 12000);
    }

    #[test]
    fn smaller_variants_truncate_the_table() {
        let chip = ChipDB::find_chip("LPC1764").unwrap();
        // 16 x 4K + 2 x 32K
        assert_eq!(chip.sectors.len(), 18);
        assert_eq!(chip.sectors.flash_size(), 128 * 1024);
    }

    #[test]
    fn unknown_chip() {
        assert!(ChipDB::find_chip("LPC2148").is_err());
    }
}
