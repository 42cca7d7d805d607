use datpak::archive::{ArchiveError, ArchiveOptions, ArchiveStore};
use datpak::block::{BlockState, BLOCK_SIZE};
use datpak::codec::CodecId;
use datpak::directory::{DirectoryEntry, DIRECTORY_CHUNK, ENTRY_SIZE};
use datpak::header::{HEADER_SIZE, VERSION};
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use tempfile::TempDir;

fn archive_in(dir: &TempDir) -> PathBuf {
    dir.path().join("shared.dat")
}

/// Highly compressible bytes.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| b"ENGINE_MESH_"[i % 12]).collect()
}

/// Bytes that zlib cannot shrink.
fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut x = seed.wrapping_mul(2_654_435_761).max(1);
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            (x >> 24) as u8
        })
        .collect()
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

#[test]
fn test_insert_then_list() {
    let dir = TempDir::new().unwrap();
    let mut store = ArchiveStore::open(archive_in(&dir)).unwrap();
    store.insert("tex/a.png", &pattern(1000)).unwrap();

    let summary = store.list();
    assert_eq!(summary.count(), 1);
    let entry = &summary.entries[0];
    assert_eq!(entry.name, "tex/a.png");
    assert_eq!(entry.size_original, 1000);
    assert!(entry.size_compressed <= 1000);
    assert_eq!(entry.ratio, entry.size_compressed * 100 / 1000);
    assert_eq!(summary.total_original, 1000);
}

#[test]
fn test_roundtrip_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = archive_in(&dir);
    let files = vec![
        ("ships/viper.mag", pattern(7000)),
        ("sounds/laser.wav", noise(3000, 1)),
        ("text/intro.txt", b"The Marakan Hegemony...".to_vec()),
    ];

    {
        let mut store = ArchiveStore::open(&path).unwrap();
        for (name, data) in &files {
            store.insert(name, data).unwrap();
        }
    }

    let store = ArchiveStore::open(&path).unwrap();
    assert_eq!(store.list().count(), files.len());
    for (name, data) in &files {
        assert_eq!(&store.extract(name).unwrap(), data, "{name}");
    }
}

#[test]
fn test_lookup_normalizes_separators_and_case() {
    let dir = TempDir::new().unwrap();
    let mut store = ArchiveStore::open(archive_in(&dir)).unwrap();
    let id = store.insert(r"Tex\Nebula.PNG", &pattern(200)).unwrap();

    assert_eq!(store.find_entry("tex/nebula.png"), Some(id));
    assert_eq!(store.find_entry(r"TEX\NEBULA.png"), Some(id));
    assert_eq!(store.entry(id).unwrap().name.to_string(), "Tex/Nebula.PNG");
    assert_eq!(store.extract("tex/nebula.png").unwrap(), pattern(200));
}

#[test]
fn test_identical_update_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let path = archive_in(&dir);
    let mut store = ArchiveStore::open(&path).unwrap();
    let data = pattern(5000);

    let id = store.insert("mesh/hull.mag", &data).unwrap();
    store.insert("mesh/other.mag", &noise(1500, 9)).unwrap();
    let header = *store.header();
    let entry = *store.entry(id).unwrap();
    let bytes = fs::read(&path).unwrap();

    assert_eq!(store.insert("MESH/HULL.MAG", &data).unwrap(), id);
    assert_eq!(*store.header(), header);
    assert_eq!(*store.entry(id).unwrap(), entry);
    assert_eq!(fs::read(&path).unwrap(), bytes);
}

#[test]
fn test_update_that_outgrows_its_blocks_moves() {
    let dir = TempDir::new().unwrap();
    let mut store = ArchiveStore::open(archive_in(&dir)).unwrap();

    let a = store.insert("a.bin", &noise(500, 2)).unwrap();
    let b = store.insert("b.bin", &noise(500, 3)).unwrap();
    let old_offset = store.entry(a).unwrap().offset;

    let bigger = noise(4000, 4);
    assert_eq!(store.insert("a.bin", &bigger).unwrap(), a);
    let moved = *store.entry(a).unwrap();
    assert_ne!(moved.offset, old_offset);
    assert_eq!(store.block_map().state(u64::from(old_offset) / BLOCK_SIZE), Some(BlockState::Free));

    assert_eq!(store.extract("a.bin").unwrap(), bigger);
    assert_eq!(store.extract("b.bin").unwrap(), noise(500, 3));
    assert!(store.block_map().is_run_owned(moved.first_block(), moved.block_count(), BlockState::Entry(a)));
    assert_ne!(a, b);
}

#[test]
fn test_update_that_shrinks_stays_put() {
    let dir = TempDir::new().unwrap();
    let mut store = ArchiveStore::open(archive_in(&dir)).unwrap();

    let id = store.insert("music/theme.ogg", &noise(5000, 5)).unwrap();
    let before = *store.entry(id).unwrap();
    store.insert("music/theme.ogg", &noise(1200, 6)).unwrap();
    let after = *store.entry(id).unwrap();

    assert_eq!(after.offset, before.offset);
    assert!(after.block_count() < before.block_count());
    assert_eq!(store.extract("music/theme.ogg").unwrap(), noise(1200, 6));
}

#[test]
fn test_remove_then_insert_reuses_tombstone() {
    let dir = TempDir::new().unwrap();
    let path = archive_in(&dir);
    let mut store = ArchiveStore::open(&path).unwrap();
    for name in ["a", "b", "c"] {
        store.insert(name, &pattern(300)).unwrap();
    }
    let slots = store.header().entry_count;
    let b = store.find_entry("b").unwrap();

    assert_eq!(store.remove("B").unwrap(), Some(b));
    assert_eq!(store.find_entry("b"), None);
    assert!(matches!(store.extract("b"), Err(ArchiveError::NotFound(_))));

    let d = store.insert("d", &pattern(300)).unwrap();
    assert_eq!(d, b);
    assert_eq!(store.header().entry_count, slots);

    let reopened = ArchiveStore::open(&path).unwrap();
    let names: Vec<String> = reopened.list().entries.into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["a", "d", "c"]);
}

#[test]
fn test_remove_missing_is_not_an_error() {
    let dir = TempDir::new().unwrap();
    let path = archive_in(&dir);
    let mut store = ArchiveStore::open(&path).unwrap();
    assert_eq!(store.remove("ghost").unwrap(), None);
    assert!(!path.exists());
}

#[test]
fn test_removed_payload_stays_on_disk() {
    let dir = TempDir::new().unwrap();
    let path = archive_in(&dir);
    let mut store = ArchiveStore::open(&path).unwrap();
    let id = store.insert("secret.txt", &noise(800, 7)).unwrap();
    let entry = *store.entry(id).unwrap();
    let payload_at = (HEADER_SIZE + u64::from(entry.offset)) as usize;
    let payload = fs::read(&path).unwrap()[payload_at..payload_at + entry.size_compressed as usize].to_vec();

    store.remove("secret.txt").unwrap();
    let bytes = fs::read(&path).unwrap();
    assert_eq!(&bytes[payload_at..payload_at + payload.len()], payload.as_slice());
    assert_eq!(store.block_map().state(entry.first_block()), Some(BlockState::Free));
}

#[test]
fn test_directory_grows_in_chunks_and_relocates() {
    let dir = TempDir::new().unwrap();
    let path = archive_in(&dir);
    let mut store = ArchiveStore::open(&path).unwrap();

    let mut last_blocks = store.header().directory_block_count;
    for i in 0..=DIRECTORY_CHUNK {
        store.insert(&format!("data/file_{i:03}.def"), &pattern(100 + i)).unwrap();
        let blocks = store.header().directory_block_count;
        assert!(blocks >= last_blocks);
        last_blocks = blocks;
    }

    let header = *store.header();
    assert_eq!(header.entry_count as usize, 2 * DIRECTORY_CHUNK);
    // 128 * 76 = 9728 bytes -> 10 blocks.
    assert_eq!(header.directory_block_count, 10);
    assert_eq!(u64::from(header.directory_offset) % BLOCK_SIZE, 0);
    let dir_first = u64::from(header.directory_offset) / BLOCK_SIZE;
    assert!(store.block_map().is_run_owned(dir_first, 10, BlockState::Directory));

    let reopened = ArchiveStore::open(&path).unwrap();
    assert_eq!(reopened.list().count(), DIRECTORY_CHUNK + 1);
    for i in 0..=DIRECTORY_CHUNK {
        assert_eq!(reopened.extract(&format!("data/file_{i:03}.def")).unwrap(), pattern(100 + i));
    }
    assert!(reopened.verify().unwrap().is_ok());
}

#[test]
fn test_on_disk_layout_is_legacy_compatible() {
    let dir = TempDir::new().unwrap();
    let path = archive_in(&dir);
    let mut store = ArchiveStore::open(&path).unwrap();
    store.insert("tex/a.png", &pattern(1000)).unwrap();

    let bytes = fs::read(&path).unwrap();
    assert_eq!(read_u32(&bytes, 0), VERSION);
    assert_eq!(read_u32(&bytes, 4), DIRECTORY_CHUNK as u32);
    assert_eq!(read_u32(&bytes, 8), 5);
    let dir_size = read_u32(&bytes, 12) as usize;
    let dir_offset = read_u32(&bytes, 16) as usize;

    // The directory is a plain zlib stream of 76-byte records.
    let start = HEADER_SIZE as usize + dir_offset;
    let mut raw = Vec::new();
    flate2::read::ZlibDecoder::new(&bytes[start..start + dir_size])
        .read_to_end(&mut raw)
        .unwrap();
    assert_eq!(raw.len(), DIRECTORY_CHUNK * ENTRY_SIZE);
    let first = DirectoryEntry::read(&raw[..ENTRY_SIZE]).unwrap();
    assert_eq!(first.name.to_string(), "tex/a.png");
    assert_eq!(first.size_original, 1000);

    let payload_at = HEADER_SIZE as usize + first.offset as usize;
    let mut data = Vec::new();
    flate2::read::ZlibDecoder::new(&bytes[payload_at..payload_at + first.size_compressed as usize])
        .read_to_end(&mut data)
        .unwrap();
    assert_eq!(data, pattern(1000));
}

#[test]
fn test_corrupted_directory_opens_empty() {
    let dir = TempDir::new().unwrap();
    let path = archive_in(&dir);
    {
        let mut store = ArchiveStore::open(&path).unwrap();
        store.insert("a", &pattern(1000)).unwrap();
        store.insert("b", &pattern(2000)).unwrap();
    }

    let mut bytes = fs::read(&path).unwrap();
    let dir_size = read_u32(&bytes, 12) as usize;
    let start = HEADER_SIZE as usize + read_u32(&bytes, 16) as usize;
    bytes[start..start + dir_size].fill(0xAB);
    fs::write(&path, &bytes).unwrap();

    let mut store = ArchiveStore::open(&path).unwrap();
    assert_eq!(store.header().entry_count as usize, DIRECTORY_CHUNK);
    assert_eq!(store.list().count(), 0);
    assert_eq!(store.find_entry("a"), None);

    // The damaged archive is still writable.
    store.insert("c", &pattern(500)).unwrap();
    let reopened = ArchiveStore::open(&path).unwrap();
    assert_eq!(reopened.extract("c").unwrap(), pattern(500));
}

#[test]
fn test_truncated_directory_opens_empty() {
    let dir = TempDir::new().unwrap();
    let path = archive_in(&dir);
    {
        let mut store = ArchiveStore::open(&path).unwrap();
        store.insert("a", &pattern(1000)).unwrap();
    }
    let bytes = fs::read(&path).unwrap();
    let start = HEADER_SIZE as usize + read_u32(&bytes, 16) as usize;
    fs::write(&path, &bytes[..start + 2]).unwrap();

    let store = ArchiveStore::open(&path).unwrap();
    assert!(store.list().is_empty());
}

#[test]
fn test_absurd_slot_count_is_rejected_not_allocated() {
    let dir = TempDir::new().unwrap();
    let path = archive_in(&dir);
    {
        let mut store = ArchiveStore::open(&path).unwrap();
        store.insert("a", &pattern(1000)).unwrap();
    }
    let mut bytes = fs::read(&path).unwrap();
    bytes[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
    fs::write(&path, &bytes).unwrap();

    match ArchiveStore::open(&path) {
        Err(ArchiveError::Corrupt(_)) => {}
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("archive with {} slots opened", u32::MAX),
    }
}

#[test]
fn test_directory_size_past_end_of_file_opens_empty() {
    let dir = TempDir::new().unwrap();
    let path = archive_in(&dir);
    {
        let mut store = ArchiveStore::open(&path).unwrap();
        store.insert("a", &pattern(1000)).unwrap();
    }
    let mut bytes = fs::read(&path).unwrap();
    bytes[12..16].copy_from_slice(&u32::MAX.to_le_bytes());
    fs::write(&path, &bytes).unwrap();

    let store = ArchiveStore::open(&path).unwrap();
    assert_eq!(store.header().entry_count as usize, DIRECTORY_CHUNK);
    assert!(store.list().is_empty());
}

#[test]
fn test_bad_version_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = archive_in(&dir);
    let mut bytes = 0x0011u32.to_le_bytes().to_vec();
    bytes.extend_from_slice(&[0u8; 16]);
    fs::write(&path, &bytes).unwrap();

    match ArchiveStore::open(&path) {
        Err(ArchiveError::BadVersion { found, expected }) => {
            assert_eq!(found, 0x0011);
            assert_eq!(expected, VERSION);
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("archive with foreign version opened"),
    }
}

#[test]
fn test_extract_missing_is_not_found() {
    let dir = TempDir::new().unwrap();
    let store = ArchiveStore::open(archive_in(&dir)).unwrap();
    assert!(matches!(store.extract("nope"), Err(ArchiveError::NotFound(name)) if name == "nope"));
}

#[test]
fn test_extract_to_recreates_stored_path() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let mut store = ArchiveStore::open(archive_in(&dir)).unwrap();
    store.insert(r"tex\ships\viper.pcx", &pattern(900)).unwrap();
    store.insert("readme.txt", b"fly safe").unwrap();

    let target = store.extract_to("TEX/SHIPS/VIPER.PCX", &out).unwrap();
    assert_eq!(target, out.join("tex").join("ships").join("viper.pcx"));
    assert_eq!(fs::read(&target).unwrap(), pattern(900));

    assert_eq!(store.extract_all(&out).unwrap(), 2);
    assert_eq!(fs::read(out.join("readme.txt")).unwrap(), b"fly safe");
}

#[test]
fn test_insert_file_reads_from_disk() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("hud.cfg");
    fs::write(&source, b"hud_color = 0x00ff00\n").unwrap();

    let mut store = ArchiveStore::open(archive_in(&dir)).unwrap();
    let id = store.insert_file(&source).unwrap();
    let name = store.entry(id).unwrap().name.to_string();
    assert_eq!(name, source.to_string_lossy().replace('\\', "/"));
    assert_eq!(store.extract(&name).unwrap(), b"hud_color = 0x00ff00\n");
}

#[test]
fn test_alternate_codecs_roundtrip() {
    for codec in [CodecId::Zstd, CodecId::Lz4, CodecId::None] {
        let dir = TempDir::new().unwrap();
        let path = archive_in(&dir);
        let options = ArchiveOptions { codec, sync: true, ..ArchiveOptions::default() };
        {
            let mut store = ArchiveStore::open_with(&path, options.clone()).unwrap();
            store.insert("a", &pattern(3000)).unwrap();
            store.insert("b", &noise(3000, 8)).unwrap();
        }
        let store = ArchiveStore::open_with(&path, options).unwrap();
        assert_eq!(store.extract("a").unwrap(), pattern(3000), "{codec}");
        assert_eq!(store.extract("b").unwrap(), noise(3000, 8), "{codec}");
    }
}

#[test]
fn test_opening_with_wrong_codec_degrades_to_empty() {
    let dir = TempDir::new().unwrap();
    let path = archive_in(&dir);
    {
        let options = ArchiveOptions { codec: CodecId::Zstd, ..ArchiveOptions::default() };
        let mut store = ArchiveStore::open_with(&path, options).unwrap();
        store.insert("a", &pattern(3000)).unwrap();
    }
    let store = ArchiveStore::open(&path).unwrap();
    assert!(store.list().is_empty());
}

#[test]
fn test_zero_length_file_is_an_empty_archive() {
    let dir = TempDir::new().unwrap();
    let path = archive_in(&dir);
    fs::write(&path, b"").unwrap();

    let mut store = ArchiveStore::open(&path).unwrap();
    assert!(store.list().is_empty());
    store.insert("a", b"alpha").unwrap();
    assert_eq!(ArchiveStore::open(&path).unwrap().extract("a").unwrap(), b"alpha");
}
