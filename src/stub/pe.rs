//! Minimal PE/COFF section table editing.
//!
//! Only what the stub builder needs: locate the section table of a PE32 or
//! PE32+ image, read section contents by name, and append initialized-data
//! sections. Appended sections go after the last byte of the file and after
//! the highest mapped virtual address, so existing code and data never move.

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};

use crate::error::InstallError;

const DOS_MAGIC: &[u8; 2] = b"MZ";
const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";
const E_LFANEW_OFFSET: usize = 0x3c;
const COFF_HEADER_SIZE: usize = 20;
const SECTION_HEADER_SIZE: usize = 40;
const SECTION_NAME_LEN: usize = 8;

const PE32_MAGIC: u16 = 0x10b;
const PE32_PLUS_MAGIC: u16 = 0x20b;

const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;

/// Index of the certificate table in the data directory array.
const SECURITY_DIRECTORY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader {
    pub name: String,
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub raw_size: u32,
    pub raw_offset: u32,
}

#[derive(Debug, Clone)]
struct Layout {
    coff: usize,
    optional: usize,
    section_table: usize,
    magic: u16,
}

#[derive(Debug, Clone)]
pub struct PeImage {
    bytes: Vec<u8>,
    layout: Layout,
}

impl PeImage {
    pub fn parse(bytes: Vec<u8>) -> Result<Self> {
        if bytes.get(..2) != Some(DOS_MAGIC.as_slice()) {
            bail!(malformed("missing MZ header"));
        }
        let pe = read_u32(&bytes, E_LFANEW_OFFSET)? as usize;
        if bytes.get(pe..pe + 4) != Some(PE_SIGNATURE.as_slice()) {
            bail!(malformed("missing PE signature"));
        }
        let coff = pe + 4;
        let optional = coff + COFF_HEADER_SIZE;
        let size_of_optional = read_u16(&bytes, coff + 16)? as usize;
        let magic = read_u16(&bytes, optional)?;
        if magic != PE32_MAGIC && magic != PE32_PLUS_MAGIC {
            bail!(malformed(&format!("unknown optional header magic {magic:#x}")));
        }

        let image = Self {
            layout: Layout {
                coff,
                optional,
                section_table: optional + size_of_optional,
                magic,
            },
            bytes,
        };
        // Validate that the whole section table is readable.
        image.sections()?;
        Ok(image)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    fn number_of_sections(&self) -> Result<usize> {
        Ok(read_u16(&self.bytes, self.layout.coff + 2)? as usize)
    }

    fn section_alignment(&self) -> Result<u32> {
        read_u32(&self.bytes, self.layout.optional + 32)
    }

    fn file_alignment(&self) -> Result<u32> {
        read_u32(&self.bytes, self.layout.optional + 36)
    }

    fn size_of_headers(&self) -> Result<u32> {
        read_u32(&self.bytes, self.layout.optional + 60)
    }

    fn data_directory_offset(&self, index: usize) -> Result<Option<usize>> {
        let (count_offset, dirs_offset) = match self.layout.magic {
            PE32_PLUS_MAGIC => (108, 112),
            _ => (92, 96),
        };
        let count = read_u32(&self.bytes, self.layout.optional + count_offset)? as usize;
        if index >= count {
            return Ok(None);
        }
        Ok(Some(self.layout.optional + dirs_offset + index * 8))
    }

    /// Whether the image already carries an Authenticode certificate table.
    pub fn is_signed(&self) -> Result<bool> {
        let Some(offset) = self.data_directory_offset(SECURITY_DIRECTORY)? else {
            return Ok(false);
        };
        Ok(read_u32(&self.bytes, offset + 4)? != 0)
    }

    /// SHA-256 of the image with everything signing touches left out.
    ///
    /// Covers the headers and section data only: the checksum field, the
    /// certificate table directory entry, and anything after the last
    /// section (alignment padding and the certificate table) are skipped. An
    /// image and any signed copy of it share this digest.
    pub fn unsigned_digest(&self) -> Result<[u8; 32]> {
        let mut end = self.size_of_headers()? as usize;
        for section in self.sections()? {
            if section.raw_size > 0 {
                end = end.max(section.raw_offset as usize + section.raw_size as usize);
            }
        }
        let checksum = self.layout.optional + 64;
        let mut skipped = vec![(checksum, checksum + 4)];
        if let Some(security) = self.data_directory_offset(SECURITY_DIRECTORY)? {
            skipped.push((security, security + 8));
        }

        let mut hasher = Sha256::new();
        let mut at = 0;
        for (start, stop) in skipped {
            hasher.update(self.range(at, start)?);
            at = stop;
        }
        hasher.update(self.range(at, end)?);
        Ok(hasher.finalize().into())
    }

    fn range(&self, start: usize, end: usize) -> Result<&[u8]> {
        self.bytes
            .get(start..end)
            .ok_or_else(|| malformed("headers or sections point past end of file").into())
    }

    pub fn sections(&self) -> Result<Vec<SectionHeader>> {
        let count = self.number_of_sections()?;
        let mut out = Vec::with_capacity(count);
        for index in 0..count {
            let base = self.layout.section_table + index * SECTION_HEADER_SIZE;
            let raw_name = self
                .bytes
                .get(base..base + SECTION_NAME_LEN)
                .ok_or_else(|| malformed("section table truncated"))?;
            let name_len = raw_name.iter().position(|b| *b == 0).unwrap_or(SECTION_NAME_LEN);
            out.push(SectionHeader {
                name: String::from_utf8_lossy(&raw_name[..name_len]).into_owned(),
                virtual_size: read_u32(&self.bytes, base + 8)?,
                virtual_address: read_u32(&self.bytes, base + 12)?,
                raw_size: read_u32(&self.bytes, base + 16)?,
                raw_offset: read_u32(&self.bytes, base + 20)?,
            });
        }
        Ok(out)
    }

    /// Contents of the first section called `name`, without file alignment padding.
    pub fn section_data(&self, name: &str) -> Result<Option<&[u8]>> {
        let Some(header) = self.sections()?.into_iter().find(|s| s.name == name) else {
            return Ok(None);
        };
        let len = (match header.virtual_size {
            0 => header.raw_size,
            virtual_size => virtual_size.min(header.raw_size),
        }) as usize;
        let start = header.raw_offset as usize;
        let data = self
            .bytes
            .get(start..start + len)
            .ok_or_else(|| malformed(&format!("section {name} points past end of file")))?;
        Ok(Some(data))
    }

    /// Append a read-only initialized-data section.
    pub fn add_section(&mut self, name: &str, data: &[u8]) -> Result<()> {
        if name.is_empty() || name.len() > SECTION_NAME_LEN || !name.is_ascii() {
            bail!(InstallError::Build(format!("invalid PE section name '{name}'")));
        }
        let existing = self.sections()?;
        if existing.iter().any(|s| s.name == name) {
            bail!(InstallError::Build(format!(
                "base stub already contains a {name} section"
            )));
        }

        let file_alignment = self.file_alignment()?.max(1);
        let section_alignment = self.section_alignment()?.max(1);

        // The new header must fit between the table and the first section's data.
        let header_offset = self.layout.section_table + existing.len() * SECTION_HEADER_SIZE;
        let header_end = header_offset + SECTION_HEADER_SIZE;
        let first_data = existing
            .iter()
            .filter(|s| s.raw_size > 0)
            .map(|s| s.raw_offset as usize)
            .min()
            .unwrap_or(usize::MAX)
            .min(self.size_of_headers()? as usize);
        if header_end > first_data
            || header_end > self.bytes.len()
            || self.bytes[header_offset..header_end].iter().any(|b| *b != 0)
        {
            bail!(InstallError::Build(format!(
                "no room in the base stub's section table for {name}"
            )));
        }

        let raw_offset = align_up(self.bytes.len(), file_alignment as usize);
        let raw_size = align_up(data.len(), file_alignment as usize);
        let image_end = existing
            .iter()
            .map(|s| s.virtual_address as usize + s.virtual_size.max(s.raw_size) as usize)
            .max()
            .unwrap_or(0);
        let virtual_address = align_up(image_end, section_alignment as usize);

        self.bytes.resize(raw_offset, 0);
        self.bytes.extend_from_slice(data);
        self.bytes.resize(raw_offset + raw_size, 0);

        let mut header = [0u8; SECTION_HEADER_SIZE];
        header[..name.len()].copy_from_slice(name.as_bytes());
        header[8..12].copy_from_slice(&to_u32(data.len())?.to_le_bytes());
        header[12..16].copy_from_slice(&to_u32(virtual_address)?.to_le_bytes());
        header[16..20].copy_from_slice(&to_u32(raw_size)?.to_le_bytes());
        header[20..24].copy_from_slice(&to_u32(raw_offset)?.to_le_bytes());
        header[36..40].copy_from_slice(
            &(IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ).to_le_bytes(),
        );
        self.bytes[header_offset..header_end].copy_from_slice(&header);

        let count = existing.len() as u16 + 1;
        write_bytes(&mut self.bytes, self.layout.coff + 2, &count.to_le_bytes());

        let size_of_image = align_up(virtual_address + data.len(), section_alignment as usize);
        write_bytes(
            &mut self.bytes,
            self.layout.optional + 56,
            &to_u32(size_of_image)?.to_le_bytes(),
        );
        // The checksum is not verified for EFI applications; zero means "not set".
        write_bytes(&mut self.bytes, self.layout.optional + 64, &0u32.to_le_bytes());
        Ok(())
    }
}

fn malformed(reason: &str) -> InstallError {
    InstallError::Build(format!("base stub is not a valid PE image: {reason}"))
}

fn read_u16(bytes: &[u8], offset: usize) -> Result<u16> {
    let raw = bytes
        .get(offset..offset + 2)
        .ok_or_else(|| malformed("header truncated"))?;
    Ok(u16::from_le_bytes([raw[0], raw[1]]))
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    let raw = bytes
        .get(offset..offset + 4)
        .ok_or_else(|| malformed("header truncated"))?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn write_bytes(bytes: &mut [u8], offset: usize, value: &[u8]) {
    bytes[offset..offset + value.len()].copy_from_slice(value);
}

fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| InstallError::Build(format!("value {value} does not fit a PE field")).into())
}

fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}
