//! Fixed 20-byte archive header at file offset 0.
//!
//! Every offset stored in the archive (directory and entry payloads) is
//! relative to the first byte after this header.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use thiserror::Error;

pub const VERSION: u32 = 0x0010;
pub const HEADER_SIZE: u64 = 20;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Unsupported version: {0:#06x}")]
    UnsupportedVersion(u32),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub version: u32,
    /// Directory slots, tombstones included.
    pub entry_count: u32,
    pub directory_block_count: u32,
    pub directory_compressed_size: u32,
    /// Block-aligned.
    pub directory_offset: u32,
}

impl Default for ArchiveHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveHeader {
    /// Header of an archive that holds nothing yet.
    pub fn new() -> Self {
        Self {
            version: VERSION,
            entry_count: 0,
            directory_block_count: 0,
            directory_compressed_size: 0,
            directory_offset: 0,
        }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_u32::<LittleEndian>(self.entry_count)?;
        writer.write_u32::<LittleEndian>(self.directory_block_count)?;
        writer.write_u32::<LittleEndian>(self.directory_compressed_size)?;
        writer.write_u32::<LittleEndian>(self.directory_offset)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self, HeaderError> {
        let version = reader.read_u32::<LittleEndian>()?;
        if version != VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }
        Ok(Self {
            version,
            entry_count: reader.read_u32::<LittleEndian>()?,
            directory_block_count: reader.read_u32::<LittleEndian>()?,
            directory_compressed_size: reader.read_u32::<LittleEndian>()?,
            directory_offset: reader.read_u32::<LittleEndian>()?,
        })
    }
}
