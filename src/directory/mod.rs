//! Entry directory: a slot vector of fixed 76-byte records.
//!
//! A slot whose `size_original` is zero is a tombstone. Tombstones are
//! reused before the directory grows, and growth always happens in whole
//! chunks of [`DIRECTORY_CHUNK`] slots.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::ops::Range;
use thiserror::Error;

use crate::block::{blocks, BLOCK_SIZE};

/// On-disk width of an entry name, terminator included.
pub const NAME_LEN: usize = 64;
/// Longest name that still leaves room for the terminating NUL.
pub const MAX_NAME_BYTES: usize = NAME_LEN - 1;
pub const ENTRY_SIZE: usize = NAME_LEN + 3 * 4;
pub const DIRECTORY_CHUNK: usize = 64;

/// Index of a directory slot.
pub type EntryId = u32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NameError {
    #[error("entry name is empty")]
    Empty,
    #[error("entry name '{name}' exceeds {max} bytes")]
    TooLong { name: String, max: usize },
    #[error("entry name '{0}' contains a NUL byte")]
    InteriorNul(String),
}

/// Converts backslash separators to forward slashes.
pub fn normalize_name(name: &str) -> String {
    name.replace('\\', "/")
}

// ── EntryName ────────────────────────────────────────────────────────────────

/// Bounded name buffer stored inline in a directory record.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EntryName {
    bytes: [u8; NAME_LEN],
    len:   u8,
}

impl Default for EntryName {
    fn default() -> Self {
        Self { bytes: [0u8; NAME_LEN], len: 0 }
    }
}

impl EntryName {
    /// Normalizes `name` and checks it fits the on-disk field.
    pub fn new(name: &str) -> Result<Self, NameError> {
        let normalized = normalize_name(name);
        let raw = normalized.as_bytes();
        if raw.is_empty() {
            return Err(NameError::Empty);
        }
        if raw.len() > MAX_NAME_BYTES {
            return Err(NameError::TooLong { name: normalized, max: MAX_NAME_BYTES });
        }
        if raw.contains(&0) {
            return Err(NameError::InteriorNul(normalized));
        }
        let mut bytes = [0u8; NAME_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(Self { bytes, len: raw.len() as u8 })
    }

    /// Takes the bytes up to the first NUL. Archives written by other tools
    /// may fill all 64 bytes, so no terminator is required here.
    pub fn from_raw(raw: [u8; NAME_LEN]) -> Self {
        let len = raw.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        let mut bytes = [0u8; NAME_LEN];
        bytes[..len].copy_from_slice(&raw[..len]);
        Self { bytes, len: len as u8 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// ASCII case-insensitive comparison against an already normalized name.
    pub fn matches(&self, normalized: &str) -> bool {
        self.as_bytes().eq_ignore_ascii_case(normalized.as_bytes())
    }
}

impl fmt::Debug for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.as_str())
    }
}

// ── DirectoryEntry ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name:            EntryName,
    /// Zero marks a tombstone.
    pub size_original:   u32,
    pub size_compressed: u32,
    /// Block-aligned, relative to the end of the header.
    pub offset:          u32,
}

impl DirectoryEntry {
    pub fn is_tombstone(&self) -> bool {
        self.size_original == 0
    }

    /// Blocks reserved for the compressed payload.
    pub fn block_count(&self) -> u64 {
        blocks(u64::from(self.size_compressed))
    }

    pub fn first_block(&self) -> u64 {
        u64::from(self.offset) / BLOCK_SIZE
    }

    /// Byte span of the stored payload.
    pub fn span(&self) -> Range<u64> {
        let start = u64::from(self.offset);
        start..start + u64::from(self.size_compressed)
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.name.bytes)?;
        writer.write_u32::<LittleEndian>(self.size_original)?;
        writer.write_u32::<LittleEndian>(self.size_compressed)?;
        writer.write_u32::<LittleEndian>(self.offset)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut raw = [0u8; NAME_LEN];
        reader.read_exact(&mut raw)?;
        Ok(Self {
            name:            EntryName::from_raw(raw),
            size_original:   reader.read_u32::<LittleEndian>()?,
            size_compressed: reader.read_u32::<LittleEndian>()?,
            offset:          reader.read_u32::<LittleEndian>()?,
        })
    }
}

// ── Directory ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    entries: Vec<DirectoryEntry>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A directory of `slots` tombstones.
    pub fn with_slots(slots: usize) -> Self {
        Self { entries: vec![DirectoryEntry::default(); slots] }
    }

    /// Parses exactly `slots` records from an uncompressed directory image.
    pub fn from_bytes(bytes: &[u8], slots: usize) -> io::Result<Self> {
        if bytes.len() != slots * ENTRY_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, format!(
                "directory image is {} bytes, expected {} for {slots} slots",
                bytes.len(),
                slots * ENTRY_SIZE,
            )));
        }
        let mut cursor = Cursor::new(bytes);
        let entries = (0..slots)
            .map(|_| DirectoryEntry::read(&mut cursor))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        for entry in &self.entries {
            // Writing into a Vec cannot fail.
            let _ = entry.write(&mut out);
        }
        out
    }

    /// Slot count, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.entries.len() * ENTRY_SIZE
    }

    /// Blocks reserved for the directory region. Never less than one.
    pub fn block_count(&self) -> u64 {
        blocks(self.byte_len() as u64).max(1)
    }

    pub fn get(&self, id: EntryId) -> Option<&DirectoryEntry> {
        self.entries.get(id as usize)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut DirectoryEntry> {
        self.entries.get_mut(id as usize)
    }

    /// Live entries with their slot ids.
    pub fn live(&self) -> impl Iterator<Item = (EntryId, &DirectoryEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_tombstone())
            .map(|(i, e)| (i as EntryId, e))
    }

    pub fn live_count(&self) -> usize {
        self.live().count()
    }

    /// First live entry whose name matches, ignoring ASCII case.
    pub fn find(&self, name: &str) -> Option<EntryId> {
        let needle = normalize_name(name);
        if needle.is_empty() {
            return None;
        }
        self.live().find(|(_, e)| e.name.matches(&needle)).map(|(id, _)| id)
    }

    /// Returns a free slot, reusing the lowest tombstone or growing the
    /// directory by one chunk. The flag reports whether growth happened.
    pub fn claim_slot(&mut self) -> (EntryId, bool) {
        if let Some(id) = self.entries.iter().position(DirectoryEntry::is_tombstone) {
            return (id as EntryId, false);
        }
        let first_new = self.entries.len();
        self.entries.resize(first_new + DIRECTORY_CHUNK, DirectoryEntry::default());
        (first_new as EntryId, true)
    }

    /// Turns a slot into a tombstone. Returns the record it held.
    pub fn remove(&mut self, id: EntryId) -> Option<DirectoryEntry> {
        let slot = self.entries.get_mut(id as usize)?;
        Some(std::mem::take(slot))
    }
}
