//! Store façade over a directory of containers.
//!
//! A [`Cellar`] resolves global cell coordinates to container files inside
//! one directory, keeps open containers shared and cached, and exposes the
//! per-cell operations. Containers are named `r.<x>.<z>.mca` and sibling
//! files for spilled cells `c.<X>.<Z>.mcc` by default; both patterns are
//! configurable through [`Settings`].

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use crate::cache::{CachedContainer, HandleCache};
use crate::error::IoContext;
use crate::fs::{DiskFs, FileNames, Vfs, Volume};
use crate::header::Entry;
use crate::pos::{ContainerPos, GlobalPos};
use crate::Result;

/// Idle-handle capacity used when [`Settings::cache_size`] is zero.
pub const DEFAULT_CACHE_SIZE: usize = 20;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Open containers read-only; writes fail with [`crate::Error::ReadOnly`].
    pub read_only: bool,
    /// Open files with OS-level synchronous I/O in addition to the
    /// per-operation syncs.
    pub sync: bool,
    /// Idle-handle capacity: positive sets it, zero uses
    /// [`DEFAULT_CACHE_SIZE`], negative disables caching so containers
    /// open and close around every operation.
    pub cache_size: i32,
    /// Container file name pattern with two `%d` placeholders.
    pub container_fmt: String,
    /// Sibling file name pattern with two `%d` placeholders.
    pub external_fmt: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            read_only: false,
            sync: false,
            cache_size: 0,
            container_fmt: "r.%d.%d.mca".to_string(),
            external_fmt: "c.%d.%d.mcc".to_string(),
        }
    }
}

/// A directory of container files addressed by global cell coordinates.
pub struct Cellar {
    cache: Arc<HandleCache>,
}

impl Cellar {
    /// Opens the store rooted at an existing directory.
    pub fn open<P: AsRef<Path>>(path: P, settings: Settings) -> Result<Self> {
        let path = std::path::absolute(path.as_ref()).context("resolve store path")?;
        let meta = std::fs::metadata(&path).context("open store directory")?;
        if !meta.is_dir() {
            return Err(crate::Error::io(
                "open store directory",
                io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }

        let sync = settings.sync;
        Ok(Self::open_with(Box::new(DiskFs::new(path, sync)), settings))
    }

    /// Opens the store over a caller-supplied filesystem.
    pub fn open_with(vfs: Box<dyn Vfs>, settings: Settings) -> Self {
        let capacity = match settings.cache_size {
            0 => DEFAULT_CACHE_SIZE,
            n if n < 0 => 0,
            n => n as usize,
        };
        let volume = Arc::new(Volume::new(
            vfs,
            FileNames {
                container: settings.container_fmt,
                external: settings.external_fmt,
            },
            settings.read_only,
        ));
        Self {
            cache: Arc::new(HandleCache::new(volume, capacity)),
        }
    }

    /// Reads the cell at global `(x, z)` into a fresh vector.
    pub fn read(&self, x: i32, z: i32) -> Result<Vec<u8>> {
        self.cache.read(GlobalPos::new(x, z))
    }

    /// Streams the cell at global `(x, z)` into `sink`, returning the
    /// number of decompressed bytes written.
    pub fn read_to(&self, x: i32, z: i32, sink: &mut dyn Write) -> Result<u64> {
        self.cache.read_to(GlobalPos::new(x, z), sink)
    }

    /// Writes the cell at global `(x, z)`. Empty `data` removes the cell.
    pub fn write(&self, x: i32, z: i32, data: &[u8]) -> Result<()> {
        self.cache.write(GlobalPos::new(x, z), data)
    }

    /// Removes the cell at global `(x, z)`.
    pub fn remove(&self, x: i32, z: i32) -> Result<()> {
        self.cache.remove(GlobalPos::new(x, z))
    }

    /// The index record for the cell at global `(x, z)`, without reading
    /// its payload. `None` if the cell is absent.
    pub fn info(&self, x: i32, z: i32) -> Result<Option<Entry>> {
        let entry = self.cache.entry(GlobalPos::new(x, z))?;
        Ok(entry.exists().then_some(entry))
    }

    /// Borrows the container at container coordinates `(x, z)` for a batch
    /// of direct calls. The handle returns to the cache on
    /// [`CachedContainer::close`] (or drop).
    pub fn file(&self, x: i32, z: i32) -> Result<CachedContainer> {
        let shared = self.cache.acquire(ContainerPos::new(x, z))?;
        Ok(CachedContainer::new(Arc::clone(&self.cache), shared))
    }

    /// Closes every cached container. The store must not be used after.
    pub fn close(&self) -> Result<()> {
        self.cache.close()
    }
}
