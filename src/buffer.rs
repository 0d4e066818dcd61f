//! Reusable buffer backed by pooled 4 KiB sections.
//!
//! Compressed payloads are streamed into a [`SectionBuffer`] before being
//! written out. Backing the buffer with fixed 4 KiB sections avoids
//! reallocation during compression, and the first five bytes of the first
//! section are reserved so the entry frame header (big-endian length plus
//! method byte) can be patched in place at emit time.
//!
//! Sections come from a process-wide pool shared by all buffers and return
//! to it on [`SectionBuffer::reset`] or drop.

use std::io::{self, Write};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::codec::{Compression, EXTERNAL_BIT};
use crate::fs::VfsFile;
use crate::{ENTRY_HEADER_SIZE, HEADER_SIZE, SECTION_SIZE};

type Section = Box<[u8; SECTION_SIZE]>;

/// Upper bound on pooled sections (1 MiB retained); anything beyond is
/// simply dropped.
const POOL_LIMIT: usize = 256;

static SECTION_POOL: Mutex<Vec<Section>> = Mutex::new(Vec::new());

fn take_section() -> Section {
    SECTION_POOL
        .lock()
        .pop()
        .unwrap_or_else(|| Box::new([0u8; SECTION_SIZE]))
}

fn put_section(section: Section) {
    let mut pool = SECTION_POOL.lock();
    if pool.len() < POOL_LIMIT {
        pool.push(section);
    }
}

/// Append-only byte sequence built from pooled 4 KiB sections.
#[derive(Default)]
pub(crate) struct SectionBuffer {
    sections: SmallVec<[Section; 4]>,
    /// Total bytes appended, including the reserved frame header.
    len: usize,
    method: Compression,
    external: bool,
}

impl SectionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes`, lazily reserving the frame header on first use.
    /// Never fails.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        if self.sections.is_empty() {
            self.sections.push(take_section());
            self.len = ENTRY_HEADER_SIZE;
        }

        let mut n = 0;
        while n < bytes.len() {
            let idx = self.len / SECTION_SIZE;
            let off = self.len % SECTION_SIZE;
            if idx == self.sections.len() {
                self.sections.push(take_section());
            }
            let amount = (SECTION_SIZE - off).min(bytes.len() - n);
            self.sections[idx][off..off + amount].copy_from_slice(&bytes[n..n + amount]);
            n += amount;
            self.len += amount;
        }
        n
    }

    /// Length in bytes, counting the reserved frame header. Reports 0 when
    /// nothing has been appended past the reservation.
    pub fn len(&self) -> usize {
        if self.len == ENTRY_HEADER_SIZE {
            return 0;
        }
        self.len
    }

    /// Sets the method recorded in the frame header at emit time. Data must
    /// already be compressed with this method before being appended.
    pub fn set_method(&mut self, method: Compression) {
        self.method = method;
    }

    pub fn method(&self) -> Compression {
        self.method
    }

    /// Tags the frame as a spill marker pointing at a sibling file.
    pub fn set_external(&mut self, external: bool) {
        self.external = external;
    }

    /// Writes the buffer (with its frame header) at a section-aligned
    /// position of a container file. Offsets inside the index prefix are
    /// rejected.
    pub fn write_at(&mut self, file: &dyn VfsFile, offset: u64) -> io::Result<()> {
        if offset < HEADER_SIZE as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("entry write at {offset} overlaps the index prefix"),
            ));
        }
        if self.sections.is_empty() {
            return Ok(());
        }

        self.patch_header();
        let mut pos = offset;
        for chunk in self.chunks(true) {
            file.write_all_at(chunk, pos)?;
            pos += chunk.len() as u64;
        }
        Ok(())
    }

    /// Writes the buffer sequentially, optionally with the frame header.
    /// Used for sibling files, which carry the same framing at offset 0.
    pub fn write_to(&mut self, sink: &mut dyn Write, with_header: bool) -> io::Result<()> {
        if self.sections.is_empty() {
            return Ok(());
        }

        if with_header {
            self.patch_header();
        }
        for chunk in self.chunks(with_header) {
            sink.write_all(chunk)?;
        }
        Ok(())
    }

    /// Returns all sections to the pool and clears state for reuse.
    pub fn reset(&mut self) {
        for section in self.sections.drain(..) {
            put_section(section);
        }
        self.len = 0;
        self.method = Compression::default();
        self.external = false;
    }

    /// The frame length word: payload bytes plus one for the method byte.
    fn frame_len(&self) -> u32 {
        (self.len - ENTRY_HEADER_SIZE + 1) as u32
    }

    fn patch_header(&mut self) {
        let frame_len = self.frame_len();
        let head = &mut self.sections[0];
        head[..4].copy_from_slice(&frame_len.to_be_bytes());
        head[4] = self.method.tag() | if self.external { EXTERNAL_BIT } else { 0 };
    }

    fn chunks(&self, with_header: bool) -> impl Iterator<Item = &[u8]> {
        let last = self.sections.len() - 1;
        let len = self.len;
        self.sections.iter().enumerate().map(move |(i, section)| {
            let start = if i == 0 && !with_header {
                ENTRY_HEADER_SIZE
            } else {
                0
            };
            let end = if i == last {
                len - i * SECTION_SIZE
            } else {
                SECTION_SIZE
            };
            &section[start..end]
        })
    }
}

impl Write for SectionBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.append(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SectionBuffer {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitted(buf: &mut SectionBuffer, with_header: bool) -> Vec<u8> {
        let mut out = Vec::new();
        buf.write_to(&mut out, with_header).unwrap();
        out
    }

    #[test]
    fn empty_buffer_reports_zero_length() {
        let mut buf = SectionBuffer::new();

        assert_eq!(buf.len(), 0);
        assert_eq!(buf.append(&[]), 0);
        // Only the reservation is present, so the length still reads 0.
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.append(&[1]), 1);
        assert_eq!(buf.len(), ENTRY_HEADER_SIZE + 1);
    }

    #[test]
    fn append_preserves_payload_order() {
        let mut buf = SectionBuffer::new();
        buf.append(&[1, 2, 3, 4]);
        buf.append(&[5, 6]);

        assert_eq!(emitted(&mut buf, false), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn append_crosses_section_boundaries() {
        let mut buf = SectionBuffer::new();
        let big: Vec<u8> = (0..3 * SECTION_SIZE).map(|i| (i % 256) as u8).collect();
        buf.append(&big);

        assert_eq!(buf.len(), ENTRY_HEADER_SIZE + big.len());
        assert_eq!(emitted(&mut buf, false), big);
    }

    #[test]
    fn frame_header_carries_length_and_method() {
        let mut buf = SectionBuffer::new();
        buf.append(&[0xAA, 0xBB]);
        buf.set_method(Compression::Gzip);

        let out = emitted(&mut buf, true);
        assert_eq!(u32::from_be_bytes(out[..4].try_into().unwrap()), 3);
        assert_eq!(out[4], Compression::Gzip.tag());
        assert_eq!(&out[5..], &[0xAA, 0xBB]);
    }

    #[test]
    fn external_bit_is_set_in_frame_header() {
        let mut buf = SectionBuffer::new();
        buf.append(&[0x00]);
        buf.set_method(Compression::Zlib);
        buf.set_external(true);

        let out = emitted(&mut buf, true);
        assert_eq!(u32::from_be_bytes(out[..4].try_into().unwrap()), 2);
        assert_eq!(out[4], Compression::Zlib.tag() | EXTERNAL_BIT);
        assert_eq!(&out[5..], &[0x00]);
    }

    #[test]
    fn reset_clears_state_for_reuse() {
        let mut buf = SectionBuffer::new();
        buf.append(&[1, 2, 3]);
        buf.set_method(Compression::Gzip);
        buf.set_external(true);
        buf.reset();

        assert_eq!(buf.len(), 0);
        assert_eq!(buf.method(), Compression::default());
        buf.append(&[9]);
        let out = emitted(&mut buf, true);
        assert_eq!(out[4], Compression::default().tag());
    }

    #[test]
    fn default_method_is_zlib() {
        let mut buf = SectionBuffer::new();
        buf.append(&[0]);

        let out = emitted(&mut buf, true);
        assert_eq!(out[4], Compression::Zlib.tag());
    }
}
