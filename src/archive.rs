//! [`ArchiveStore`], the primary embedding surface.
//!
//! ```no_run
//! use datpak::archive::ArchiveStore;
//!
//! let mut store = ArchiveStore::open("shared.dat")?;
//! store.insert("tex/hull.png", b"...png bytes...")?;
//! let bytes = store.extract("TEX\\HULL.PNG")?;
//! assert_eq!(bytes, b"...png bytes...");
//! for entry in store.list().entries {
//!     println!("{} {} => {}", entry.name, entry.size_original, entry.size_compressed);
//! }
//! # Ok::<(), datpak::archive::ArchiveError>(())
//! ```
//!
//! # Write ordering
//! Every mutation rewrites the header, then the compressed directory, then
//! (for inserts) the entry payload. The steps are not transactional: an I/O
//! failure after the directory write leaves the directory pointing at a
//! payload region that may not hold the new bytes yet.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::block::{blocks, BlockMap, BlockState, BLOCK_SIZE};
use crate::codec::{get_codec, Codec, CodecError, CodecId, DEFAULT_LEVEL};
use crate::directory::{
    normalize_name, Directory, DirectoryEntry, EntryId, EntryName, NameError, ENTRY_SIZE,
};
use crate::header::{ArchiveHeader, HeaderError, HEADER_SIZE, VERSION};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Unsupported archive version {found:#06x} (expected {expected:#06x})")]
    BadVersion { found: u32, expected: u32 },
    #[error("Entry not found: {0}")]
    NotFound(String),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Entry name '{name}' is longer than {max} bytes")]
    NameTooLong { name: String, max: usize },
    #[error("Invalid entry name: {0}")]
    InvalidName(String),
    #[error("Refusing to store empty entry '{0}'")]
    EmptyEntry(String),
    #[error("Compressed directory is {compressed} bytes but only {reserved} are reserved")]
    DirectoryOverflow { compressed: u64, reserved: u64 },
    #[error("Archive cannot address {required} bytes")]
    ArchiveFull { required: u64 },
    #[error("Corrupt archive: {0}")]
    Corrupt(String),
}

impl From<HeaderError> for ArchiveError {
    fn from(e: HeaderError) -> Self {
        match e {
            HeaderError::UnsupportedVersion(found) => ArchiveError::BadVersion { found, expected: VERSION },
            HeaderError::Io(e) => ArchiveError::Io(e),
        }
    }
}

impl From<NameError> for ArchiveError {
    fn from(e: NameError) -> Self {
        match e {
            NameError::TooLong { name, max } => ArchiveError::NameTooLong { name, max },
            other => ArchiveError::InvalidName(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

// ── ArchiveOptions ───────────────────────────────────────────────────────────

/// Configuration for [`ArchiveStore::open_with`].
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub codec: CodecId,
    pub level: i32,
    /// `sync_data` the backing file after every mutation.
    pub sync:  bool,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            codec: CodecId::Zlib,
            level: DEFAULT_LEVEL,
            sync:  false,
        }
    }
}

// ── Listing types ────────────────────────────────────────────────────────────

/// Descriptor of one live entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub id:              EntryId,
    pub name:            String,
    pub size_original:   u32,
    pub size_compressed: u32,
    pub offset:          u32,
    /// Compressed size as a truncated percentage of the original.
    pub ratio:           u32,
}

impl EntryInfo {
    fn new(id: EntryId, e: &DirectoryEntry) -> Self {
        Self {
            id,
            name:            e.name.to_string(),
            size_original:   e.size_original,
            size_compressed: e.size_compressed,
            offset:          e.offset,
            ratio:           ratio(u64::from(e.size_compressed), u64::from(e.size_original)),
        }
    }
}

/// Result of [`ArchiveStore::list`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct Summary {
    pub slots:            u32,
    pub entries:          Vec<EntryInfo>,
    pub total_original:   u64,
    pub total_compressed: u64,
    pub ratio:            u32,
}

impl Summary {
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn ratio(compressed: u64, original: u64) -> u32 {
    if original == 0 {
        return 0;
    }
    (compressed * 100 / original) as u32
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyFailure {
    pub id:     EntryId,
    pub name:   String,
    pub reason: String,
}

/// Result of [`ArchiveStore::verify`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub checked:  usize,
    pub failures: Vec<VerifyFailure>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

// ── ArchiveStore ─────────────────────────────────────────────────────────────

pub struct ArchiveStore {
    path:      PathBuf,
    header:    ArchiveHeader,
    directory: Directory,
    block_map: BlockMap,
    codec:     Box<dyn Codec>,
    options:   ArchiveOptions,
}

impl ArchiveStore {
    // ── Constructors ─────────────────────────────────────────────────────────

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, ArchiveOptions::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, options: ArchiveOptions) -> Result<Self> {
        let codec = get_codec(options.codec);
        Self::open_with_codec(path, codec, options)
    }

    /// Opens with an arbitrary codec; `options.codec` is ignored.
    ///
    /// A missing (or zero-length) file is an empty archive. The file is not
    /// created until the first mutation.
    pub fn open_with_codec<P: AsRef<Path>>(
        path:    P,
        codec:   Box<dyn Codec>,
        options: ArchiveOptions,
    ) -> Result<Self> {
        let path = path.as_ref().to_owned();

        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Archive {} does not exist; starting empty", path.display());
                return Ok(Self::empty(path, codec, options));
            }
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len();
        if file_len == 0 {
            return Ok(Self::empty(path, codec, options));
        }

        let header = ArchiveHeader::read(&mut file)?;
        let directory = load_directory(&mut file, file_len, &header, codec.as_ref())?;
        let block_map = BlockMap::rebuild(&header, &directory);
        debug!(
            "Opened {}: {} slots, {} live, {} blocks",
            path.display(),
            header.entry_count,
            directory.live_count(),
            block_map.block_count(),
        );

        Ok(Self { path, header, directory, block_map, codec, options })
    }

    fn empty(path: PathBuf, codec: Box<dyn Codec>, options: ArchiveOptions) -> Self {
        let header = ArchiveHeader::new();
        let directory = Directory::new();
        let block_map = BlockMap::rebuild(&header, &directory);
        Self { path, header, directory, block_map, codec, options }
    }

    // ── Lookup ───────────────────────────────────────────────────────────────

    pub fn find_entry(&self, name: &str) -> Option<EntryId> {
        self.directory.find(name)
    }

    /// The slot record, tombstones included.
    pub fn entry(&self, id: EntryId) -> Option<&DirectoryEntry> {
        self.directory.get(id)
    }

    pub fn stat(&self, name: &str) -> Option<EntryInfo> {
        let id = self.find_entry(name)?;
        self.directory.get(id).map(|e| EntryInfo::new(id, e))
    }

    pub fn list(&self) -> Summary {
        let entries: Vec<EntryInfo> = self
            .directory
            .live()
            .map(|(id, e)| EntryInfo::new(id, e))
            .collect();
        let total_original = entries.iter().map(|e| u64::from(e.size_original)).sum();
        let total_compressed = entries.iter().map(|e| u64::from(e.size_compressed)).sum();
        Summary {
            slots: self.header.entry_count,
            entries,
            total_original,
            total_compressed,
            ratio: ratio(total_compressed, total_original),
        }
    }

    // ── Insert ───────────────────────────────────────────────────────────────

    /// Adds `data` under `name`, or replaces the entry already stored there.
    ///
    /// The payload is compressed before anything changes, so a codec failure
    /// leaves the archive untouched. An update keeps its offset when the new
    /// payload fits the blocks it already owns.
    pub fn insert(&mut self, name: &str, data: &[u8]) -> Result<EntryId> {
        let entry_name = EntryName::new(name)?;
        if data.is_empty() {
            return Err(ArchiveError::EmptyEntry(entry_name.to_string()));
        }
        let size_original = to_u32(data.len() as u64)?;
        let payload = self.codec.compress(data, self.options.level)?;
        let size_compressed = to_u32(payload.len() as u64)?;

        let id = self.transact(|store| {
            let (id, previous) = match store.directory.find(&entry_name.as_str()) {
                Some(id) => (id, store.directory.get(id).copied()),
                None => (store.claim_slot()?, None),
            };

            let needed = blocks(payload.len() as u64);
            let offset = match previous {
                Some(prev) if needed <= prev.block_count() => prev.offset,
                _ => {
                    let offset = store.allocate(needed)?;
                    debug!("Placing {} at offset {} ({} blocks)", entry_name, offset, needed);
                    offset
                }
            };

            // An update keeps the spelling the entry was first stored under.
            let name = previous.map_or(entry_name, |prev| prev.name);
            if let Some(slot) = store.directory.get_mut(id) {
                *slot = DirectoryEntry { name, size_original, size_compressed, offset };
            }
            store.rebuild_block_map();
            store.flush(Some((offset, payload.as_slice())))?;
            Ok(id)
        })?;

        info!(
            "Inserted {} {:>9} => {:>9} ({}%)",
            entry_name,
            size_original,
            size_compressed,
            ratio(u64::from(size_compressed), u64::from(size_original)),
        );
        Ok(id)
    }

    /// Inserts the contents of a file on disk, named by the path as given.
    pub fn insert_file<P: AsRef<Path>>(&mut self, path: P) -> Result<EntryId> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        self.insert(&path.to_string_lossy(), &data)
    }

    /// Reuses a tombstone or grows the directory, relocating the directory
    /// region when it no longer fits its blocks.
    fn claim_slot(&mut self) -> Result<EntryId> {
        let old_blocks = self.directory.block_count();
        let (id, grew) = self.directory.claim_slot();
        if !grew {
            return Ok(id);
        }

        self.header.entry_count = to_u32(self.directory.len() as u64)?;
        let new_blocks = self.directory.block_count();
        if new_blocks > old_blocks {
            let offset = self.allocate(new_blocks)?;
            debug!(
                "Directory grew to {} slots; moving from offset {} to {} ({} blocks)",
                self.directory.len(),
                self.header.directory_offset,
                offset,
                new_blocks,
            );
            self.header.directory_offset = offset;
            self.header.directory_block_count = to_u32(new_blocks)?;
            self.rebuild_block_map();
        }
        Ok(id)
    }

    fn allocate(&self, needed: u64) -> Result<u32> {
        let offset = self.block_map.find_run(needed);
        let end = offset + needed * BLOCK_SIZE;
        if end > u64::from(u32::MAX) {
            return Err(ArchiveError::ArchiveFull { required: end });
        }
        Ok(offset as u32)
    }

    // ── Remove ───────────────────────────────────────────────────────────────

    /// Tombstones the entry and rewrites the directory. Payload bytes stay
    /// on disk until an allocation lands on them. Returns `None` when no
    /// entry has that name.
    pub fn remove(&mut self, name: &str) -> Result<Option<EntryId>> {
        let Some(id) = self.find_entry(name) else {
            warn!("Could not remove '{}', not found", name);
            return Ok(None);
        };

        self.transact(|store| {
            store.directory.remove(id);
            store.rebuild_block_map();
            store.flush(None)
        })?;
        info!("Removed {}", normalize_name(name));
        Ok(Some(id))
    }

    // ── Extract ──────────────────────────────────────────────────────────────

    pub fn extract(&self, name: &str) -> Result<Vec<u8>> {
        let id = self
            .find_entry(name)
            .ok_or_else(|| ArchiveError::NotFound(normalize_name(name)))?;
        self.extract_by_id(id)
    }

    pub fn extract_by_id(&self, id: EntryId) -> Result<Vec<u8>> {
        let entry = self
            .directory
            .get(id)
            .filter(|e| !e.is_tombstone())
            .ok_or_else(|| ArchiveError::NotFound(format!("slot {id}")))?;
        let mut file = File::open(&self.path)?;
        self.read_entry(&mut file, entry)
    }

    /// Writes the entry to `dest` joined with its stored name, creating
    /// parent directories. Returns the path written.
    pub fn extract_to<P: AsRef<Path>>(&self, name: &str, dest: P) -> Result<PathBuf> {
        let id = self
            .find_entry(name)
            .ok_or_else(|| ArchiveError::NotFound(normalize_name(name)))?;
        self.extract_id_to(id, dest.as_ref())
    }

    /// Extracts every live entry under `dest`. Returns the number written.
    pub fn extract_all<P: AsRef<Path>>(&self, dest: P) -> Result<usize> {
        let ids: Vec<EntryId> = self.directory.live().map(|(id, _)| id).collect();
        for &id in &ids {
            self.extract_id_to(id, dest.as_ref())?;
        }
        Ok(ids.len())
    }

    fn extract_id_to(&self, id: EntryId, dest: &Path) -> Result<PathBuf> {
        let stored = self
            .directory
            .get(id)
            .map(|e| e.name.to_string())
            .unwrap_or_default();
        let target = dest.join(safe_relative_path(&stored)?);
        let data = self.extract_by_id(id)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, &data)?;
        info!("Extracted {} -> {}", stored, target.display());
        Ok(target)
    }

    fn read_entry(&self, file: &mut File, entry: &DirectoryEntry) -> Result<Vec<u8>> {
        let start = HEADER_SIZE + u64::from(entry.offset);
        let end = start + u64::from(entry.size_compressed);
        let file_len = file.metadata()?.len();
        if end > file_len {
            return Err(ArchiveError::Corrupt(format!(
                "entry '{}' ends at byte {end} but the file is {file_len} bytes",
                entry.name,
            )));
        }
        file.seek(SeekFrom::Start(start))?;
        let mut payload = vec![0u8; entry.size_compressed as usize];
        file.read_exact(&mut payload)?;
        Ok(self.codec.decompress(&payload, entry.size_original as usize)?)
    }

    // ── Verify ───────────────────────────────────────────────────────────────

    /// Decodes every live entry and checks that its blocks belong to it.
    /// Per-entry problems are collected rather than returned as errors.
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        if self.directory.live_count() == 0 {
            return Ok(report);
        }
        let mut file = File::open(&self.path)?;

        for (id, entry) in self.directory.live() {
            report.checked += 1;
            let fail = |reason: String| VerifyFailure { id, name: entry.name.to_string(), reason };

            if u64::from(entry.offset) % BLOCK_SIZE != 0 {
                report.failures.push(fail(format!("offset {} is not block-aligned", entry.offset)));
                continue;
            }
            if !self.block_map.is_run_owned(entry.first_block(), entry.block_count(), BlockState::Entry(id)) {
                report.failures.push(fail("blocks overlap another entry or the directory".into()));
                continue;
            }
            if let Err(e) = self.read_entry(&mut file, entry) {
                report.failures.push(fail(e.to_string()));
            }
        }
        Ok(report)
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    /// Runs a mutation; on error the in-memory header and directory are
    /// restored so the store matches what it last flushed.
    fn transact<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let header = self.header;
        let directory = self.directory.clone();
        let result = f(self);
        if result.is_err() {
            self.header = header;
            self.directory = directory;
            self.rebuild_block_map();
        }
        result
    }

    fn rebuild_block_map(&mut self) {
        self.block_map = BlockMap::rebuild(&self.header, &self.directory);
    }

    /// Writes header, directory, then the optional `(offset, payload)`.
    fn flush(&mut self, payload: Option<(u32, &[u8])>) -> Result<()> {
        let reserved_blocks = self.directory.block_count();
        let reserved = reserved_blocks * BLOCK_SIZE;
        let image = self.codec.compress(&self.directory.to_bytes(), self.options.level)?;
        if image.len() as u64 > reserved {
            return Err(ArchiveError::DirectoryOverflow { compressed: image.len() as u64, reserved });
        }

        self.header.entry_count = to_u32(self.directory.len() as u64)?;
        self.header.directory_block_count = to_u32(reserved_blocks)?;
        self.header.directory_compressed_size = image.len() as u32;

        let mut header_bytes = Vec::with_capacity(HEADER_SIZE as usize);
        self.header.write(&mut header_bytes)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header_bytes)?;

        // Pad the directory to its full reservation so the file always
        // covers the blocks the map says it owns.
        let mut region = image;
        region.resize(reserved as usize, 0);
        file.seek(SeekFrom::Start(HEADER_SIZE + u64::from(self.header.directory_offset)))?;
        file.write_all(&region)?;

        if let Some((offset, bytes)) = payload {
            file.seek(SeekFrom::Start(HEADER_SIZE + u64::from(offset)))?;
            file.write_all(bytes)?;
        }

        file.flush()?;
        if self.options.sync {
            file.sync_data()?;
        }
        Ok(())
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    pub fn path(&self) -> &Path { &self.path }
    pub fn header(&self) -> &ArchiveHeader { &self.header }
    pub fn directory(&self) -> &Directory { &self.directory }
    pub fn block_map(&self) -> &BlockMap { &self.block_map }
    pub fn options(&self) -> &ArchiveOptions { &self.options }
    pub fn codec_name(&self) -> &'static str { self.codec.name() }
}

// ── helpers ──────────────────────────────────────────────────────────────────

/// Reads and decodes the directory. A blob that runs past the end of the
/// file or fails to decode yields a directory of tombstones instead of an
/// error, so a damaged archive can still be opened, inspected and rewritten.
///
/// A slot count whose directory could not fit in the 32-bit data region is
/// rejected outright as `Corrupt`; nothing is allocated for it.
fn load_directory(
    file:     &mut File,
    file_len: u64,
    header:   &ArchiveHeader,
    codec:    &dyn Codec,
) -> Result<Directory> {
    let slots = header.entry_count as usize;
    if slots == 0 {
        return Ok(Directory::new());
    }

    let image_len = u64::from(header.entry_count) * ENTRY_SIZE as u64;
    let directory_end = u64::from(header.directory_offset) + blocks(image_len) * BLOCK_SIZE;
    if directory_end > u64::from(u32::MAX) {
        return Err(ArchiveError::Corrupt(format!(
            "header claims {} directory slots, more than the archive can address",
            header.entry_count,
        )));
    }

    let blob_start = HEADER_SIZE + u64::from(header.directory_offset);
    let blob_end = blob_start + u64::from(header.directory_compressed_size);
    let decoded = if blob_end > file_len {
        Err(CodecError::Decompression(format!(
            "directory blob ends at byte {blob_end} but the file is {file_len} bytes"
        )))
    } else {
        let mut blob = vec![0u8; header.directory_compressed_size as usize];
        file.seek(SeekFrom::Start(blob_start))?;
        file.read_exact(&mut blob)?;
        codec.decompress(&blob, image_len as usize)
    };

    let parsed = decoded.and_then(|raw| {
        Directory::from_bytes(&raw, slots).map_err(|e| CodecError::Decompression(e.to_string()))
    });
    match parsed {
        Ok(directory) => Ok(directory),
        Err(e) => {
            warn!("Directory of {} slots could not be decoded ({}); treating every slot as free", slots, e);
            Ok(Directory::with_slots(slots))
        }
    }
}

/// Maps a stored name onto a relative path, refusing anything that would
/// escape the extraction root.
fn safe_relative_path(name: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(ArchiveError::InvalidName(format!("'{name}' is not a relative path"))),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(ArchiveError::InvalidName(format!("'{name}' has no file component")));
    }
    Ok(out)
}

fn to_u32(value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| ArchiveError::ArchiveFull { required: value })
}
