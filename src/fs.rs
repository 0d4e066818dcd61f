//! Filesystem capability.
//!
//! The store never touches the OS directly; it goes through [`Vfs`], which
//! resolves names to positional file handles. [`DiskFs`] is the on-disk
//! implementation rooted at a directory. Tests substitute their own.
//!
//! File names are built from format strings with two `%d` placeholders:
//! `r.%d.%d.mca` for containers (container coordinates) and `c.%d.%d.mcc`
//! for sibling files holding spilled payloads (global cell coordinates).

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::buffer::SectionBuffer;
use crate::error::IoContext;
use crate::pos::{ContainerPos, GlobalPos};
use crate::Result;

/// Positional file handle returned by a [`Vfs`].
pub trait VfsFile: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;
    fn sync(&self) -> io::Result<()>;
    fn truncate(&self, size: u64) -> io::Result<()>;
    /// Whether the handle supports `write_at`, `sync` and `truncate`.
    fn writable(&self) -> bool;

    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "file ended mid-read",
                    ))
                }
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write_at(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "file refused further bytes",
                    ))
                }
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Virtual filesystem the store operates through.
pub trait Vfs: Send + Sync {
    /// Size of the named file, or `None` if it does not exist.
    fn stat(&self, name: &str) -> io::Result<Option<u64>>;
    /// Opens an existing file read-only.
    fn open(&self, name: &str) -> io::Result<Box<dyn VfsFile>>;
    /// Creates (or truncates) a file for writing.
    fn create(&self, name: &str) -> io::Result<Box<dyn VfsFile>>;
    /// Opens read-write, creating the file if missing.
    fn open_rw_create(&self, name: &str) -> io::Result<Box<dyn VfsFile>>;
    fn remove(&self, name: &str) -> io::Result<()>;
}

/// [`Vfs`] over a directory on the local filesystem.
pub struct DiskFs {
    root: PathBuf,
    sync: bool,
}

impl DiskFs {
    /// `sync` opens files with OS-level synchronous I/O in addition to the
    /// per-operation syncs the store issues.
    pub fn new(root: impl Into<PathBuf>, sync: bool) -> Self {
        Self {
            root: root.into(),
            sync,
        }
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Vfs for DiskFs {
    fn stat(&self, name: &str) -> io::Result<Option<u64>> {
        match fs::metadata(self.resolve(name)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn open(&self, name: &str) -> io::Result<Box<dyn VfsFile>> {
        let file = OpenOptions::new().read(true).open(self.resolve(name))?;
        Ok(Box::new(DiskFile {
            file,
            writable: false,
        }))
    }

    fn create(&self, name: &str) -> io::Result<Box<dyn VfsFile>> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(true);
        apply_sync(&mut options, self.sync);
        let file = options.open(self.resolve(name))?;
        Ok(Box::new(DiskFile {
            file,
            writable: true,
        }))
    }

    fn open_rw_create(&self, name: &str) -> io::Result<Box<dyn VfsFile>> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        apply_sync(&mut options, self.sync);
        let file = options.open(self.resolve(name))?;
        Ok(Box::new(DiskFile {
            file,
            writable: true,
        }))
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(name))
    }
}

#[cfg(unix)]
fn apply_sync(options: &mut OpenOptions, sync: bool) {
    use std::os::unix::fs::OpenOptionsExt;
    if sync {
        options.custom_flags(libc::O_SYNC);
    }
}

#[cfg(not(unix))]
fn apply_sync(_options: &mut OpenOptions, _sync: bool) {}

struct DiskFile {
    file: fs::File,
    writable: bool,
}

impl VfsFile for DiskFile {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(&self.file, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(&self.file, buf, offset)
    }

    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(&self.file, buf, offset)
    }

    #[cfg(windows)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_write(&self.file, buf, offset)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn truncate(&self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }

    fn writable(&self) -> bool {
        self.writable
    }
}

/// Stand-in handle for a container opened read-only before its file exists.
/// Every cell reads as absent, so the handle itself is never read.
struct AbsentFile;

impl VfsFile for AbsentFile {
    fn read_at(&self, _buf: &mut [u8], _offset: u64) -> io::Result<usize> {
        Ok(0)
    }

    fn write_at(&self, _buf: &[u8], _offset: u64) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "file does not exist",
        ))
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn truncate(&self, _size: u64) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "file does not exist",
        ))
    }

    fn writable(&self) -> bool {
        false
    }
}

/// Opens a container file directly by path, outside any [`Vfs`].
pub(crate) fn open_container_file(
    path: &Path,
    read_only: bool,
    sync: bool,
) -> io::Result<(Box<dyn VfsFile>, u64)> {
    let size = match fs::metadata(path) {
        Ok(meta) => Some(meta.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };

    if read_only {
        return match size {
            None => Ok((Box::new(AbsentFile), 0)),
            Some(size) => {
                let file = OpenOptions::new().read(true).open(path)?;
                Ok((
                    Box::new(DiskFile {
                        file,
                        writable: false,
                    }),
                    size,
                ))
            }
        };
    }

    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    apply_sync(&mut options, sync);
    let file = options.open(path)?;
    Ok((
        Box::new(DiskFile {
            file,
            writable: true,
        }),
        size.unwrap_or(0),
    ))
}

/// Replaces the first two `%d` placeholders in `pattern`.
fn format_pair(pattern: &str, a: i64, b: i64) -> String {
    let mut out = String::with_capacity(pattern.len() + 16);
    let mut args = [a, b].into_iter();
    let mut rest = pattern;
    while let Some(i) = rest.find("%d") {
        out.push_str(&rest[..i]);
        match args.next() {
            Some(value) => out.push_str(&value.to_string()),
            None => out.push_str("%d"),
        }
        rest = &rest[i + 2..];
    }
    out.push_str(rest);
    out
}

/// Container and sibling file naming patterns.
pub(crate) struct FileNames {
    pub container: String,
    pub external: String,
}

impl FileNames {
    pub fn container(&self, pos: ContainerPos) -> String {
        format_pair(&self.container, pos.x as i64, pos.z as i64)
    }

    pub fn external(&self, pos: GlobalPos) -> String {
        format_pair(&self.external, pos.x as i64, pos.z as i64)
    }
}

/// A directory of containers: the filesystem capability bundled with its
/// naming patterns and access mode. Shared by the handle cache and by every
/// container it opens (for sibling-file I/O).
pub(crate) struct Volume {
    vfs: Box<dyn Vfs>,
    names: FileNames,
    read_only: bool,
}

impl Volume {
    pub fn new(vfs: Box<dyn Vfs>, names: FileNames, read_only: bool) -> Self {
        Self {
            vfs,
            names,
            read_only,
        }
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Opens the container file at `pos` with flags matching the access
    /// mode. A missing container opened read-only reads as empty.
    pub fn open_container(&self, pos: ContainerPos) -> Result<(Box<dyn VfsFile>, u64)> {
        let name = self.names.container(pos);
        let size = self.vfs.stat(&name).context("stat container file")?;

        if self.read_only {
            return match size {
                None => Ok((Box::new(AbsentFile), 0)),
                Some(size) => {
                    let file = self.vfs.open(&name).context("open container file")?;
                    Ok((file, size))
                }
            };
        }

        let file = self
            .vfs
            .open_rw_create(&name)
            .context("open container file")?;
        Ok((file, size.unwrap_or(0)))
    }

    pub fn open_sibling(&self, pos: GlobalPos) -> Result<Box<dyn VfsFile>> {
        self.vfs
            .open(&self.names.external(pos))
            .context("open external file")
    }

    /// Writes a framed payload to the sibling file for `pos`, replacing any
    /// previous contents.
    pub fn write_sibling(&self, pos: GlobalPos, buf: &mut SectionBuffer) -> Result<()> {
        let file = self
            .vfs
            .create(&self.names.external(pos))
            .context("create external file")?;
        let mut writer = StreamWriter::new(&*file);
        buf.write_to(&mut writer, true)
            .context("write external file")?;
        file.sync().context("sync external file")
    }

    pub fn remove_sibling(&self, pos: GlobalPos) -> io::Result<()> {
        self.vfs.remove(&self.names.external(pos))
    }
}

/// Sequential [`Read`] over a positional handle.
pub(crate) struct StreamReader<'a> {
    file: &'a dyn VfsFile,
    pos: u64,
}

impl<'a> StreamReader<'a> {
    pub fn new(file: &'a dyn VfsFile, pos: u64) -> Self {
        Self { file, pos }
    }
}

impl Read for StreamReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.read_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

/// Sequential [`Write`] over a positional handle.
pub(crate) struct StreamWriter<'a> {
    file: &'a dyn VfsFile,
    pos: u64,
}

impl<'a> StreamWriter<'a> {
    pub fn new(file: &'a dyn VfsFile) -> Self {
        Self { file, pos: 0 }
    }
}

impl Write for StreamWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn format_pair_replaces_two_placeholders() {
        assert_eq!(format_pair("r.%d.%d.mca", 1, -2), "r.1.-2.mca");
        assert_eq!(format_pair("c.%d.%d.mcc", -40, 7), "c.-40.7.mcc");
        assert_eq!(format_pair("flat", 1, 2), "flat");
        assert_eq!(format_pair("%d.%d.%d", 1, 2), "1.2.%d");
    }

    #[test]
    fn disk_fs_stat_open_create_remove() {
        let dir = tempdir().unwrap();
        let fs = DiskFs::new(dir.path(), false);

        assert_eq!(fs.stat("a.bin").unwrap(), None);

        let file = fs.create("a.bin").unwrap();
        file.write_all_at(b"hello", 0).unwrap();
        file.sync().unwrap();
        drop(file);

        assert_eq!(fs.stat("a.bin").unwrap(), Some(5));

        let file = fs.open("a.bin").unwrap();
        assert!(!file.writable());
        let mut buf = [0u8; 5];
        file.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello");
        drop(file);

        fs.remove("a.bin").unwrap();
        assert_eq!(fs.stat("a.bin").unwrap(), None);
    }

    #[test]
    fn disk_file_truncate_changes_size() {
        let dir = tempdir().unwrap();
        let fs = DiskFs::new(dir.path(), false);

        let file = fs.create("b.bin").unwrap();
        file.truncate(8192).unwrap();
        drop(file);

        assert_eq!(fs.stat("b.bin").unwrap(), Some(8192));
    }

    #[test]
    fn stream_adapters_advance_through_the_file() {
        let dir = tempdir().unwrap();
        let fs = DiskFs::new(dir.path(), false);
        let file = fs.create("c.bin").unwrap();

        let mut writer = StreamWriter::new(&*file);
        writer.write_all(b"one").unwrap();
        writer.write_all(b"two").unwrap();

        let mut reader = StreamReader::new(&*file, 0);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "onetwo");
    }

    #[test]
    fn absent_file_reads_empty_and_rejects_writes() {
        let file = AbsentFile;
        let mut buf = [0u8; 4];

        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 0);
        assert!(!file.writable());
        assert!(file.write_at(b"x", 0).is_err());
        assert!(file.truncate(4096).is_err());
    }

    #[test]
    fn missing_container_opened_read_only_reads_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.0.0.mca");

        let (file, size) = open_container_file(&path, true, false).unwrap();
        assert_eq!(size, 0);
        assert!(!file.writable());
        // The read-only open must not create the file.
        assert!(!path.exists());
    }
}
