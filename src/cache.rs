//! Reference-counted cache of open containers.
//!
//! Containers are shared: every borrower of a position bumps a use count on
//! the same open handle. When the count drops to zero the container moves
//! into an idle LRU instead of closing, so the next borrower skips the open
//! and header parse. The LRU closes the oldest idle container when it
//! overflows, and a close error surfaces from the release that forced the
//! eviction.
//!
//! A handle is always in exactly one of the two tables: the in-use map
//! (use count > 0, transiently 0 under the lock) or the idle LRU (use
//! count 0). Both tables sit behind one reader-writer lock; when a
//! container lock is also needed, the cache lock is taken first.

use std::io::Write;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use hashlink::LruCache;
use log::{debug, warn};
use parking_lot::RwLock;

use crate::codec::Compression;
use crate::container::Container;
use crate::fs::Volume;
use crate::header::Entry;
use crate::pos::{ContainerPos, GlobalPos};
use crate::{Error, Result};

/// An open container plus the number of current borrowers.
pub(crate) struct Shared {
    container: Arc<Container>,
    /// Modified only while holding the cache lock (read side suffices).
    users: AtomicI32,
}

struct Tables {
    in_use: HashMap<ContainerPos, Arc<Shared>>,
    idle: LruCache<ContainerPos, Arc<Container>>,
}

/// Routes global cell positions to shared container handles.
pub(crate) struct HandleCache {
    volume: Arc<Volume>,
    /// Idle-LRU capacity; zero disables idling entirely, so containers
    /// open and close around every borrow.
    capacity: usize,
    tables: RwLock<Tables>,
}

impl HandleCache {
    pub fn new(volume: Arc<Volume>, capacity: usize) -> Self {
        Self {
            volume,
            capacity,
            tables: RwLock::new(Tables {
                in_use: HashMap::new(),
                idle: LruCache::new(capacity.max(1)),
            }),
        }
    }

    /// Borrows the container at `pos`, opening it if neither table has it.
    pub fn acquire(&self, pos: ContainerPos) -> Result<Arc<Shared>> {
        {
            let tables = self.tables.read();
            if let Some(shared) = tables.in_use.get(&pos) {
                shared.users.fetch_add(1, Ordering::AcqRel);
                return Ok(Arc::clone(shared));
            }
        }

        let mut tables = self.tables.write();
        // Re-check: the container may have been opened while we waited.
        if let Some(shared) = tables.in_use.get(&pos) {
            shared.users.fetch_add(1, Ordering::AcqRel);
            return Ok(Arc::clone(shared));
        }

        let container = match tables.idle.remove(&pos) {
            Some(container) => container,
            None => {
                let (file, size) = self.volume.open_container(pos)?;
                let writable = !self.volume.read_only() && file.writable();
                Arc::new(Container::open(
                    pos,
                    file,
                    writable,
                    size,
                    Some(Arc::clone(&self.volume)),
                )?)
            }
        };

        let shared = Arc::new(Shared {
            container,
            users: AtomicI32::new(1),
        });
        tables.in_use.insert(pos, Arc::clone(&shared));
        Ok(shared)
    }

    /// Returns a borrow. The last borrower parks the container in the idle
    /// LRU (possibly closing the oldest idle container to make room), or
    /// closes it outright when idling is disabled.
    pub fn release(&self, shared: &Arc<Shared>) -> Result<()> {
        {
            let _tables = self.tables.read();
            if shared.users.fetch_sub(1, Ordering::AcqRel) - 1 != 0 {
                return Ok(());
            }
        }

        let mut tables = self.tables.write();
        // A re-borrow may have raced the lock upgrade.
        if shared.users.load(Ordering::Acquire) != 0 {
            return Ok(());
        }

        let pos = shared.container.pos();
        if self.capacity == 0 {
            tables.in_use.remove(&pos);
            return shared.container.close();
        }

        let mut evicted = Ok(());
        if tables.idle.len() >= self.capacity {
            if let Some((old_pos, old)) = tables.idle.remove_lru() {
                debug!("evicting idle container ({}, {})", old_pos.x, old_pos.z);
                evicted = old.close();
            }
        }
        tables.idle.insert(pos, Arc::clone(&shared.container));
        tables.in_use.remove(&pos);
        evicted
    }

    pub fn read_to(&self, pos: GlobalPos, sink: &mut dyn Write) -> Result<u64> {
        let (x, z) = pos.cell();
        self.with_container(pos.container(), |container| container.read_to(x, z, sink))
    }

    pub fn read(&self, pos: GlobalPos) -> Result<Vec<u8>> {
        let (x, z) = pos.cell();
        self.with_container(pos.container(), |container| container.read(x, z))
    }

    pub fn write(&self, pos: GlobalPos, data: &[u8]) -> Result<()> {
        let (x, z) = pos.cell();
        self.with_container(pos.container(), |container| container.write(x, z, data))
    }

    pub fn remove(&self, pos: GlobalPos) -> Result<()> {
        let (x, z) = pos.cell();
        self.with_container(pos.container(), |container| container.remove(x, z))
    }

    pub fn entry(&self, pos: GlobalPos) -> Result<Entry> {
        let (x, z) = pos.cell();
        self.with_container(pos.container(), |container| container.entry(x, z))
    }

    /// Borrows a handle for the closure, reporting the operation's error
    /// ahead of any eviction error from the release.
    fn with_container<T>(
        &self,
        pos: ContainerPos,
        op: impl FnOnce(&Container) -> Result<T>,
    ) -> Result<T> {
        let shared = self.acquire(pos)?;
        let result = op(&shared.container);
        let released = self.release(&shared);
        let value = result?;
        released?;
        Ok(value)
    }

    /// Closes every container in both tables exactly once. Outstanding
    /// borrowers are logged; their containers are closed out from under
    /// them and further calls fail with [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        let mut tables = self.tables.write();
        let mut result = Ok(());

        while let Some((_, container)) = tables.idle.remove_lru() {
            if let Err(e) = container.close() {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        for (pos, shared) in tables.in_use.drain() {
            let users = shared.users.load(Ordering::Acquire);
            if users > 0 {
                warn!("closing container ({}, {}) with {users} outstanding borrowers", pos.x, pos.z);
            }
            if let Err(e) = shared.container.close() {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

/// A borrowed container handle with a close-once gate.
///
/// Every call briefly takes the gate's read side to check for close and
/// then proxies to the shared container. [`CachedContainer::close`] takes
/// the write side, so it waits for calls in flight, returns the borrow to
/// the cache exactly once, and is idempotent. Dropping an open handle
/// releases the borrow as well.
pub struct CachedContainer {
    cache: Arc<HandleCache>,
    shared: Arc<Shared>,
    closed: RwLock<bool>,
}

impl CachedContainer {
    pub(crate) fn new(cache: Arc<HandleCache>, shared: Arc<Shared>) -> Self {
        Self {
            cache,
            shared,
            closed: RwLock::new(false),
        }
    }

    pub fn read_to(&self, x: u8, z: u8, sink: &mut dyn Write) -> Result<u64> {
        self.with_open(|container| container.read_to(x, z, sink))
    }

    pub fn read(&self, x: u8, z: u8) -> Result<Vec<u8>> {
        self.with_open(|container| container.read(x, z))
    }

    pub fn write(&self, x: u8, z: u8, data: &[u8]) -> Result<()> {
        self.with_open(|container| container.write(x, z, data))
    }

    pub fn remove(&self, x: u8, z: u8) -> Result<()> {
        self.with_open(|container| container.remove(x, z))
    }

    pub fn set_compression_method(&self, method: Compression) -> Result<()> {
        self.with_open(|container| container.set_compression_method(method))
    }

    pub fn entry(&self, x: u8, z: u8) -> Result<Entry> {
        self.with_open(|container| container.entry(x, z))
    }

    /// Returns the handle to the cache. Idempotent; later calls on this
    /// handle fail with [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        let mut closed = self.closed.write();
        if *closed {
            return Ok(());
        }
        *closed = true;
        self.cache.release(&self.shared)
    }

    fn with_open<T>(&self, op: impl FnOnce(&Container) -> Result<T>) -> Result<T> {
        let closed = self.closed.read();
        if *closed {
            return Err(Error::Closed);
        }
        op(&self.shared.container)
    }
}

impl Drop for CachedContainer {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
