//! Firmware file formats
use std::str;
use std::{borrow::Cow, path::Path};

use anyhow::Result;
use object::{
    Endianness,
    elf::{FileHeader32, PT_LOAD},
    read::elf::{FileHeader, ProgramHeader},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    PlainHex,
    IntelHex,
    ELF,
    Binary,
}

/// A flat memory image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    /// Address of `data[0]`
    pub base: u32,
    pub data: Vec<u8>,
    pub entry: u32,
}

impl FirmwareImage {
    pub fn end(&self) -> u64 {
        self.base as u64 + self.data.len() as u64
    }

    /// Pads the image with `fill` up to a multiple of `align` bytes.
    pub fn pad_to(&mut self, align: usize, fill: u8) {
        let len = self.data.len().next_multiple_of(align);
        self.data.resize(len, fill);
    }
}

/// Reads an image. `base` places raw and plain hex files, which carry no
/// address, and doubles as their entry point.
pub fn read_firmware_from_file<P: AsRef<Path>>(path: P, base: u32) -> Result<FirmwareImage> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;
    anyhow::ensure!(!raw.is_empty(), "{} is empty", p.display());

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    let image = match format {
        FirmwareFormat::PlainHex => FirmwareImage {
            base,
            data: read_hex(str::from_utf8(&raw)?)?,
            entry: base,
        },
        FirmwareFormat::IntelHex => read_ihex(str::from_utf8(&raw)?, base)?,
        FirmwareFormat::ELF => read_elf(&raw)?,
        FirmwareFormat::Binary => FirmwareImage {
            base,
            data: raw,
            entry: base,
        },
    };
    log::info!(
        "Image {:#010x}..{:#010x}, entry {:#010x}",
        image.base,
        image.end(),
        image.entry
    );
    Ok(image)
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "h86", "hex", "a43", "a90"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }

    if raw.starts_with(&[0x7f, b'E', b'L', b'F']) {
        FirmwareFormat::ELF
    } else if raw.first() == Some(&b':')
        && raw
            .iter()
            .all(|&c| (c as char).is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::IntelHex
    } else if raw
        .iter()
        .all(|&c| (c as char).is_ascii_hexdigit() || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::PlainHex
    } else {
        FirmwareFormat::Binary
    }
}

pub fn read_hex(data: &str) -> Result<Vec<u8>> {
    let digits: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(hex::decode(digits)?)
}

/// Reads Intel HEX. The start linear address, when present, is the entry
/// point, otherwise `default_entry`.
pub fn read_ihex(data: &str, default_entry: u32) -> Result<FirmwareImage> {
    use ihex::Record;

    let mut base_address = 0;
    let mut entry = None;

    let mut records = vec![];
    for record in ihex::Reader::new(data) {
        let record = record?;
        use Record::*;
        match record {
            Data { offset, value } => {
                let offset = base_address + offset as u32;

                records.push((offset, value.into()));
            }
            EndOfFile => (),
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            StartSegmentAddress { cs, ip } => {
                entry = Some((cs as u32) * 16 + ip as u32);
            }
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            StartLinearAddress(address) => entry = Some(address),
        };
    }
    let (base, data) = merge_sections(records)?;
    Ok(FirmwareImage {
        base,
        data,
        entry: entry.unwrap_or(default_entry),
    })
}

/// Simulates `objcopy -O binary`, keeping the load address and entry point.
pub fn read_elf(elf_data: &[u8]) -> Result<FirmwareImage> {
    let file_kind = object::FileKind::parse(elf_data)?;

    match file_kind {
        object::FileKind::Elf32 => (),
        _ => anyhow::bail!("cannot read file as ELF32 format"),
    }
    let elf_header = FileHeader32::<Endianness>::parse(elf_data)?;
    let endian = elf_header.endian()?;

    let mut sections = vec![];

    for segment in elf_header.program_headers(endian, elf_data)? {
        // The data is programmed at the physical address
        let p_paddr: u64 = segment.p_paddr(endian).into();
        let p_vaddr: u64 = segment.p_vaddr(endian).into();

        let segment_data = segment
            .data(endian, elf_data)
            .map_err(|_| anyhow::format_err!("Failed to access data for an ELF segment."))?;
        if !segment_data.is_empty() && segment.p_type(endian) == PT_LOAD {
            log::info!(
                "Found loadable segment, physical address: {:#010x}, virtual address: {:#010x}, size: {:#x}",
                p_paddr,
                p_vaddr,
                segment_data.len()
            );
            sections.push((p_paddr as u32, Cow::Borrowed(segment_data)));
        }
    }

    if sections.is_empty() {
        anyhow::bail!("empty ELF file");
    }
    log::debug!("found {} segments", sections.len());
    let (base, data) = merge_sections(sections)?;
    Ok(FirmwareImage {
        base,
        data,
        entry: elf_header.e_entry(endian),
    })
}

/// Lays the sections out in one buffer, gaps filled with 0xff.
fn merge_sections(mut sections: Vec<(u32, Cow<[u8]>)>) -> Result<(u32, Vec<u8>)> {
    sections.sort(); // order by start address

    let (Some(first), Some(last)) = (sections.first(), sections.last()) else {
        anyhow::bail!("no data in image");
    };
    let start_address = first.0;
    let end_address = sections
        .iter()
        .map(|(addr, data)| *addr as u64 + data.len() as u64)
        .max()
        .unwrap_or(last.0 as u64);

    let total_size = end_address - start_address as u64;

    let mut binary = vec![0xffu8; total_size as usize];
    let mut cursor = start_address as u64;
    for (addr, sect) in sections {
        anyhow::ensure!(
            addr as u64 >= cursor,
            "overlapping sections at {:#010x}",
            addr
        );
        let sect_start = (addr - start_address) as usize;
        let sect_end = sect_start + sect.len();
        binary[sect_start..sect_end].copy_from_slice(&sect);
        cursor = addr as u64 + sect.len() as u64;
    }
    Ok((start_address, binary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ihex_with_gap_and_entry() {
        let src = ":020000041000EA\n\
                   :0410000001020304E2\n\
                   :02100800AABB81\n\
                   :0400000510001001D6\n\
                   :00000001FF\n";
        let image = read_ihex(src, 0).unwrap();
        assert_eq!(image.base, 0x1000_1000);
        assert_eq!(
            image.data,
            [1, 2, 3, 4, 0xff, 0xff, 0xff, 0xff, 0xaa, 0xbb]
        );
        assert_eq!(image.entry, 0x1000_1001);
    }

    #[test]
    fn guesses_formats() {
        let p = Path::new("fw.bin");
        assert_eq!(guess_format(p, b"\x7fELF...."), FirmwareFormat::ELF);
        assert_eq!(guess_format(p, b":00000001FF\n"), FirmwareFormat::IntelHex);
        assert_eq!(guess_format(p, b"0011aabb\n"), FirmwareFormat::PlainHex);
        assert_eq!(guess_format(p, &[0x00, 0x20, 0x00, 0x10]), FirmwareFormat::Binary);
        assert_eq!(guess_format(Path::new("fw.hex"), b""), FirmwareFormat::IntelHex);
    }

    #[test]
    fn plain_hex_ignores_line_breaks() {
        assert_eq!(read_hex("0011\r\naabb\n").unwrap(), [0x00, 0x11, 0xaa, 0xbb]);
    }

    #[test]
    fn padding() {
        let mut image = FirmwareImage {
            base: 0,
            data: vec![0; 300],
            entry: 0,
        };
        image.pad_to(256, 0xff);
        assert_eq!(image.data.len(), 512);
        assert_eq!(image.data[300], 0xff);
    }

    #[test]
    fn overlapping_sections_are_rejected() {
        let a = vec![(0u32, Cow::Owned(vec![0u8; 8])), (4, Cow::Owned(vec![1u8; 8]))];
        assert!(merge_sections(a).is_err());
    }
}
