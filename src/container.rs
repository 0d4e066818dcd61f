//! A single container file.
//!
//! A container stores up to 1,024 cells behind an 8 KiB index prefix.
//! Payloads are compressed, framed (big-endian length plus method byte) and
//! packed into 4 KiB sections allocated first-fit; payloads larger than 255
//! sections spill to a sibling file and leave a one-section marker behind.
//!
//! Each container owns one reader-writer lock. Reads hold shared access for
//! the whole decompress-and-copy, so any number of reads may interleave
//! while writes, removes and close wait for exclusive access.
//!
//! Durability order for a write: payload bytes are synced before the index
//! word is patched, and the size word is synced before the timestamp word.
//! A crash between the payload sync and the index patch leaves an
//! unreferenced region, which the allocator reclaims naturally; a crash
//! between the two index words leaves a stale timestamp with a valid entry.

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, trace, warn};
use parking_lot::RwLock;
use zerocopy::big_endian::U32;
use zerocopy::FromBytes;

use crate::buffer::SectionBuffer;
use crate::codec::{Compression, EXTERNAL_BIT};
use crate::error::IoContext;
use crate::fs::{open_container_file, StreamReader, VfsFile, Volume};
use crate::header::{Entry, HeaderIndex};
use crate::pos::{ContainerPos, GlobalPos};
use crate::{
    sections, Error, Result, CELL_COUNT, ENTRY_HEADER_SIZE, HEADER_SIZE, MAX_ENTRY_SECTIONS,
    SECTION_SIZE,
};

/// One container file holding a 32x32 grid of cells.
///
/// All methods may be called concurrently.
pub struct Container {
    pos: ContainerPos,
    /// Directory backend for sibling-file I/O. Absent for containers opened
    /// as standalone files; spilled cells then report [`Error::External`].
    volume: Option<Arc<Volume>>,
    state: RwLock<State>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container").field("pos", &self.pos).finish()
    }
}

struct State {
    header: HeaderIndex,
    /// `None` once the container has been closed.
    file: Option<Box<dyn VfsFile>>,
    writable: bool,
    size: u64,
    method: Compression,
}

impl Container {
    /// Validates the file size, reads the index prefix and builds the
    /// occupancy bitmap. A zero-size file is a fresh, empty container.
    pub(crate) fn open(
        pos: ContainerPos,
        file: Box<dyn VfsFile>,
        writable: bool,
        size: u64,
        volume: Option<Arc<Volume>>,
    ) -> Result<Self> {
        if size % SECTION_SIZE as u64 != 0 || (size > 0 && size < HEADER_SIZE as u64) {
            return Err(Error::InvalidSize(size));
        }
        if writable && !file.writable() {
            return Err(Error::ReadOnly);
        }

        let header = if size == 0 {
            HeaderIndex::new()
        } else {
            let sizes = read_word_section(&*file, 0)?;
            let timestamps = read_word_section(&*file, SECTION_SIZE as u64)?;
            HeaderIndex::load(&sizes, &timestamps, (size / SECTION_SIZE as u64) as u32)?
        };

        debug!(
            "opened container ({}, {}): {size} bytes, writable={writable}",
            pos.x, pos.z
        );

        Ok(Self {
            pos,
            volume,
            state: RwLock::new(State {
                header,
                file: Some(file),
                writable,
                size,
                method: Compression::default(),
            }),
        })
    }

    /// Opens a single container file by path, without a directory backend.
    ///
    /// Cells that spilled to sibling files read as [`Error::External`], and
    /// writes too large to store inline are rejected the same way. Opening
    /// a missing path read-only yields an empty container.
    pub fn open_path<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let (file, size) =
            open_container_file(path.as_ref(), read_only, false).context("open container file")?;
        Self::open(ContainerPos::new(0, 0), file, !read_only, size, None)
    }

    /// Grid position this container was opened at.
    pub fn pos(&self) -> ContainerPos {
        self.pos
    }

    /// Streams the decompressed payload of cell `(x, z)` into `sink`,
    /// returning the number of bytes written.
    ///
    /// The container's shared lock is held for the duration, so the copy
    /// never observes a concurrent write.
    pub fn read_to(&self, x: u8, z: u8, sink: &mut dyn Write) -> Result<u64> {
        check_cell(x, z)?;

        let state = self.state.read();
        let file = state.file.as_deref().ok_or(Error::Closed)?;

        let entry = state.header.get(x, z);
        if !entry.exists() {
            return Err(Error::NotExist);
        }

        let offset = entry.offset_sections() as u64 * SECTION_SIZE as u64;
        let (frame_len, method_byte) = read_frame(file, offset)?;
        let payload_len = (frame_len as u64).saturating_sub(1);
        if payload_len / SECTION_SIZE as u64 > entry.size_sections() as u64 {
            return Err(Error::Corrupted("entry size mismatch"));
        }

        let method = Compression::from_tag(method_byte & !EXTERNAL_BIT)?;
        trace!(
            "reading cell ({x}, {z}) of container ({}, {}): {payload_len} bytes, method {method}",
            self.pos.x,
            self.pos.z
        );

        if method_byte & EXTERNAL_BIT != 0 {
            let volume = self.volume.as_ref().ok_or(Error::External)?;
            let sibling = volume.open_sibling(self.pos.global(x, z))?;
            let (sibling_len, _) = read_frame(&*sibling, 0)?;
            let payload = (sibling_len as u64).saturating_sub(1);
            let src = StreamReader::new(&*sibling, ENTRY_HEADER_SIZE as u64).take(payload);
            copy_decompressed(method, src, sink)
        } else {
            let src = StreamReader::new(file, offset + ENTRY_HEADER_SIZE as u64).take(payload_len);
            copy_decompressed(method, src, sink)
        }
    }

    /// Reads the decompressed payload of cell `(x, z)` into a fresh vector.
    pub fn read(&self, x: u8, z: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to(x, z, &mut out)?;
        Ok(out)
    }

    /// Compresses `data` with the current method and stores it as cell
    /// `(x, z)`. An empty `data` is equivalent to [`Container::remove`].
    pub fn write(&self, x: u8, z: u8, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return self.remove(x, z);
        }
        check_cell(x, z)?;

        let mut guard = self.state.write();
        let state = &mut *guard;
        if state.file.is_none() {
            return Err(Error::Closed);
        }
        if !state.writable {
            return Err(Error::ReadOnly);
        }

        // If the previous payload spilled, the sibling file becomes an
        // orphan once the index points elsewhere.
        let mut stale_sibling = self.spilled_sibling(state, x, z);

        let mut buf = SectionBuffer::new();
        buf.set_method(state.method);
        state
            .method
            .compress_into(data, &mut buf)
            .context("compress entry data")?;

        let mut size = sections(buf.len() as u64);
        if size > MAX_ENTRY_SECTIONS {
            let Some(volume) = self.volume.as_ref() else {
                return Err(Error::External);
            };
            let global = self.pos.global(x, z);
            volume.write_sibling(global, &mut buf)?;
            debug!(
                "spilled cell ({x}, {z}) of container ({}, {}): {size} sections",
                self.pos.x, self.pos.z
            );

            // The sibling file was just rewritten in place; keep it.
            stale_sibling = None;

            let method = buf.method();
            buf.reset();
            buf.set_method(method);
            buf.set_external(true);
            buf.append(&[0]);
            size = 1;
        }

        let offset = match state.header.find_free(size) {
            Some(offset) => offset,
            None => Self::grow_file(state, size)?,
        };

        {
            let file = state.file.as_deref().ok_or(Error::Closed)?;
            buf.write_at(file, offset as u64 * SECTION_SIZE as u64)
                .context("write entry data")?;
            file.sync().context("sync entry data")?;
        }

        Self::update_header(state, x, z, offset, size as u8)?;

        if let Some(global) = stale_sibling {
            self.remove_stale_sibling(global);
        }
        trace!(
            "wrote cell ({x}, {z}) of container ({}, {}): {size} sections at {offset}",
            self.pos.x,
            self.pos.z
        );
        Ok(())
    }

    /// Removes cell `(x, z)`, releasing its sections to the allocator. The
    /// file keeps (at least) its index prefix.
    pub fn remove(&self, x: u8, z: u8) -> Result<()> {
        check_cell(x, z)?;

        let mut guard = self.state.write();
        let state = &mut *guard;
        if state.file.is_none() {
            return Err(Error::Closed);
        }
        if !state.writable {
            return Err(Error::ReadOnly);
        }

        let stale_sibling = self.spilled_sibling(state, x, z);

        Self::grow_file(state, 0)?;
        Self::update_header(state, x, z, 0, 0)?;

        if let Some(global) = stale_sibling {
            self.remove_stale_sibling(global);
        }
        Ok(())
    }

    /// Sets the compression method used by subsequent writes.
    pub fn set_compression_method(&self, method: Compression) -> Result<()> {
        let mut state = self.state.write();
        if state.file.is_none() {
            return Err(Error::Closed);
        }
        state.method = method;
        Ok(())
    }

    /// Index record for cell `(x, z)`, without touching the payload.
    pub fn entry(&self, x: u8, z: u8) -> Result<Entry> {
        check_cell(x, z)?;
        let state = self.state.read();
        if state.file.is_none() {
            return Err(Error::Closed);
        }
        Ok(state.header.get(x, z))
    }

    /// Flushes and releases the underlying file. Waits for in-flight reads
    /// and writes; closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        let Some(file) = state.file.take() else {
            return Ok(());
        };
        let result = if state.writable {
            file.sync().context("sync container")
        } else {
            Ok(())
        };
        drop(file);
        debug!("closed container ({}, {})", self.pos.x, self.pos.z);
        result
    }

    /// Extends the file by `add` sections past its current end, returning
    /// the section offset of the appended region. Growing by zero sections
    /// persists the index prefix of a previously empty file and is
    /// otherwise an identity.
    fn grow_file(state: &mut State, add: u32) -> Result<u32> {
        let file = state.file.as_deref().ok_or(Error::Closed)?;
        let current = state.size.max(HEADER_SIZE as u64);
        let offset = sections(current);
        let new_size = (offset as u64 + add as u64) * SECTION_SIZE as u64;
        debug_assert_eq!(new_size % SECTION_SIZE as u64, 0);
        debug_assert!(add != 0 || new_size == current);

        file.truncate(new_size).context("grow file")?;
        if new_size != state.size {
            trace!("grew container file from {} to {new_size} bytes", state.size);
        }
        state.size = new_size;
        Ok(offset)
    }

    /// Patches the packed size word and the timestamp word for `(x, z)`,
    /// syncing between the two, and applies the change to the in-memory
    /// index. An all-zero entry removes the cell.
    fn update_header(state: &mut State, x: u8, z: u8, offset: u32, size: u8) -> Result<()> {
        let word_offset = (x as u64 + 32 * z as u64) * 4;
        let timestamp = if offset == 0 && size == 0 {
            0
        } else {
            unix_seconds()
        };

        {
            let file = state.file.as_deref().ok_or(Error::Closed)?;
            write_u32_at(file, offset << 8 | size as u32, word_offset).context("update header")?;
        }

        state
            .header
            .set(x, z, Entry::new(offset, size, timestamp))?;

        let file = state.file.as_deref().ok_or(Error::Closed)?;
        write_u32_at(file, timestamp as u32, word_offset + SECTION_SIZE as u64)
            .context("update timestamp")?;
        Ok(())
    }

    /// Whether the current payload of `(x, z)` is a spill marker; returns
    /// the sibling position to clean up. Best-effort: read failures here
    /// surface later through the regular read path.
    fn spilled_sibling(&self, state: &State, x: u8, z: u8) -> Option<GlobalPos> {
        self.volume.as_ref()?;
        let entry = state.header.get(x, z);
        if !entry.exists() {
            return None;
        }
        let file = state.file.as_deref()?;
        let mut head = [0u8; ENTRY_HEADER_SIZE];
        file.read_exact_at(&mut head, entry.offset_sections() as u64 * SECTION_SIZE as u64)
            .ok()?;
        (head[4] & EXTERNAL_BIT != 0).then(|| self.pos.global(x, z))
    }

    fn remove_stale_sibling(&self, global: GlobalPos) {
        let Some(volume) = self.volume.as_ref() else {
            return;
        };
        if let Err(e) = volume.remove_sibling(global) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(
                    "failed to remove stale sibling file for ({}, {}): {e}",
                    global.x, global.z
                );
            }
        }
    }
}

fn check_cell(x: u8, z: u8) -> Result<()> {
    if x > 31 || z > 31 {
        return Err(Error::InvalidPosition(x, z));
    }
    Ok(())
}

fn unix_seconds() -> i32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i32)
        .unwrap_or(0)
}

fn write_u32_at(file: &dyn VfsFile, value: u32, offset: u64) -> io::Result<()> {
    file.write_all_at(&value.to_be_bytes(), offset)?;
    file.sync()
}

/// Reads a 5-byte entry frame header: payload length (including the method
/// byte) and the method byte itself.
fn read_frame(file: &dyn VfsFile, offset: u64) -> Result<(u32, u8)> {
    let mut head = [0u8; ENTRY_HEADER_SIZE];
    file.read_exact_at(&mut head, offset)
        .context("read entry header")?;
    let len = u32::from_be_bytes(head[..4].try_into().unwrap());
    Ok((len, head[4]))
}

fn read_word_section(file: &dyn VfsFile, offset: u64) -> Result<[U32; CELL_COUNT]> {
    let mut buf = [0u8; SECTION_SIZE];
    file.read_exact_at(&mut buf, offset)
        .context("read file header")?;
    <[U32; CELL_COUNT]>::read_from_bytes(&buf)
        .map_err(|_| Error::Corrupted("short header section"))
}

fn copy_decompressed(
    method: Compression,
    src: impl Read,
    sink: &mut dyn Write,
) -> Result<u64> {
    let mut decoder = method.decoder(src);
    io::copy(&mut decoder, sink).context("decompress entry data")
}
