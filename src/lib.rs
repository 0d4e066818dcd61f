//! # Cellar - Paged Container Store
//!
//! Cellar reads and writes a paged, random-access container format: each
//! container file stores up to 1,024 opaque cells (a 32x32 grid) behind a
//! fixed 8 KiB index prefix, packing compressed payloads into 4 KiB
//! sections. A directory-level store groups many containers, routes global
//! grid coordinates to the right file, and shares open handles through a
//! reference-counted LRU cache.
//!
//! ## Quick Start
//!
//! ```ignore
//! use cellar::{Cellar, Settings};
//!
//! let store = Cellar::open("./world", Settings::default())?;
//!
//! store.write(65, -3, &payload)?;
//! let data = store.read(65, -3)?;
//!
//! store.close()?;
//! ```
//!
//! ## File Layout
//!
//! ```text
//! store_dir/
//! ├── r.0.0.mca        # container for cells (0..32, 0..32)
//! ├── r.-1.0.mca       # container for cells (-32..0, 0..32)
//! └── c.3.7.mcc        # sibling file: spilled payload of cell (3, 7)
//! ```
//!
//! Inside a container:
//!
//! ```text
//! Offset  Size   Description
//! 0x0000  4096   1024 x BE u32: (offset_sections << 8) | size_sections
//! 0x1000  4096   1024 x BE u32: modification time, seconds since epoch
//! 0x2000  ...    entry frames, 4096-byte aligned:
//!                BE u32 length, 1 method byte, compressed payload
//! ```
//!
//! The file size is always a multiple of 4,096 bytes: zero for a container
//! that was never written, at least 8,192 once anything has been stored or
//! removed. Payloads compressing past 255 sections move to a sibling file
//! named by the cell's global coordinates; the container keeps a
//! one-section marker whose method byte has the top bit set.
//!
//! ## Concurrency
//!
//! Every container owns one reader-writer lock: reads stream under shared
//! access, while writes, removes and close take exclusive access. The store
//! shares open containers by use count and parks idle ones in an LRU, so
//! concurrent callers hit one open file per container.
//!
//! ## Module Overview
//!
//! - [`Cellar`]: settings, open/close lifecycle, per-cell operations
//! - [`CachedContainer`]: shared handles, idle LRU, close-once gates
//! - [`Container`]: one file - header, allocator, read/write path
//! - [`Entry`]: index records from the prefix
//! - buffer / codec: pooled section buffers and flate2-backed methods
//! - [`Vfs`]: the filesystem capability everything runs on

mod buffer;
mod cache;
mod codec;
mod container;
mod error;
mod fs;
mod header;
mod pos;
mod store;

pub use cache::CachedContainer;
pub use codec::{Compression, EXTERNAL_BIT};
pub use container::Container;
pub use error::{Error, Result};
pub use fs::{DiskFs, Vfs, VfsFile};
pub use header::Entry;
pub use pos::{ContainerPos, GlobalPos};
pub use store::{Cellar, Settings, DEFAULT_CACHE_SIZE};

/// Allocation unit: all offsets and file sizes are multiples of this.
pub const SECTION_SIZE: usize = 4096;

/// The index prefix: one section of packed entries, one of timestamps.
pub const HEADER_SIZE: usize = 2 * SECTION_SIZE;

/// Cells per container (a 32x32 grid).
pub const CELL_COUNT: usize = 1024;

/// Largest payload, in sections, stored inline; anything bigger spills to
/// a sibling file.
pub const MAX_ENTRY_SECTIONS: u32 = 255;

/// Hard ceiling on sections addressable by an entry record.
pub(crate) const MAX_FILE_SECTIONS: u32 = 255 * 1024;

/// Entry frame header: big-endian u32 length plus one method byte.
pub(crate) const ENTRY_HEADER_SIZE: usize = 5;

/// Minimum number of sections needed to store `bytes`.
pub(crate) fn sections(bytes: u64) -> u32 {
    bytes.div_ceil(SECTION_SIZE as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_rounds_up_to_whole_sections() {
        assert_eq!(sections(0), 0);
        assert_eq!(sections(1), 1);
        assert_eq!(sections(4096), 1);
        assert_eq!(sections(4097), 2);
        assert_eq!(sections(255 * 4096), 255);
    }
}
