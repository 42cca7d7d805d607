pub mod header;
pub mod directory;
pub mod block;
pub mod codec;
pub mod archive;

pub use archive::{ArchiveError, ArchiveOptions, ArchiveStore, EntryInfo, Summary, VerifyReport};
pub use block::{BlockMap, BlockState, BLOCK_SIZE};
pub use codec::{Codec, CodecId, get_codec};
pub use directory::{Directory, DirectoryEntry, EntryId, EntryName};
pub use header::{ArchiveHeader, VERSION};
