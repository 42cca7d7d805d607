//! Block map: per-session occupancy of the data region.
//!
//! The map is derived from the header and directory every time either
//! changes and is never written to disk. Space is handed out first-fit;
//! nothing is ever compacted, so holes left by removed or relocated
//! entries are only reclaimed when a later allocation happens to fit them.

use tracing::warn;

use crate::directory::{Directory, EntryId};
use crate::header::ArchiveHeader;

pub const BLOCK_SIZE: u64 = 1024;

/// Number of blocks needed to hold `byte_size` bytes.
pub fn blocks(byte_size: u64) -> u64 {
    byte_size.div_ceil(BLOCK_SIZE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Directory,
    Entry(EntryId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMap {
    blocks: Vec<BlockState>,
}

impl BlockMap {
    /// Marks the directory run and every live entry's run. The map extends
    /// to the highest block any of them touches.
    pub fn rebuild(header: &ArchiveHeader, directory: &Directory) -> Self {
        let dir_first = u64::from(header.directory_offset) / BLOCK_SIZE;
        let dir_end = dir_first + directory.block_count();

        let high_water = directory
            .live()
            .map(|(_, e)| e.first_block() + e.block_count())
            .fold(dir_end, u64::max);

        let mut blocks = vec![BlockState::Free; high_water as usize];
        blocks[dir_first as usize..dir_end as usize].fill(BlockState::Directory);
        for (id, entry) in directory.live() {
            let first = entry.first_block() as usize;
            let end = first + entry.block_count() as usize;
            if blocks[first..end].iter().any(|b| *b != BlockState::Free) {
                warn!("Entry {} ({}) overlaps occupied blocks {}..{}", id, entry.name, first, end);
            }
            blocks[first..end].fill(BlockState::Entry(id));
        }

        Self { blocks }
    }

    /// Byte offset of the first run of `needed` free blocks. When no run
    /// exists inside the map, returns the offset just past its end, which
    /// means the backing file grows.
    pub fn find_run(&self, needed: u64) -> u64 {
        let needed = needed as usize;
        let mut run_start = 0usize;
        let mut run_len = 0usize;

        if needed == 0 {
            return 0;
        }
        for (i, state) in self.blocks.iter().enumerate() {
            if *state != BlockState::Free {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = i;
            }
            run_len += 1;
            if run_len == needed {
                return run_start as u64 * BLOCK_SIZE;
            }
        }
        self.byte_len()
    }

    pub fn block_count(&self) -> u64 {
        self.blocks.len() as u64
    }

    /// Bytes covered by the map, i.e. the data region's high-water mark.
    pub fn byte_len(&self) -> u64 {
        self.block_count() * BLOCK_SIZE
    }

    pub fn state(&self, block: u64) -> Option<BlockState> {
        self.blocks.get(block as usize).copied()
    }

    pub fn free_blocks(&self) -> u64 {
        self.blocks.iter().filter(|b| **b == BlockState::Free).count() as u64
    }

    pub fn occupied_blocks(&self) -> u64 {
        self.block_count() - self.free_blocks()
    }

    /// True when every block in `first..first + count` is marked `owner`.
    pub fn is_run_owned(&self, first: u64, count: u64, owner: BlockState) -> bool {
        (first..first + count).all(|b| self.state(b) == Some(owner))
    }
}
