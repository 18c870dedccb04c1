//! Inode-keyed cache of open read-only file descriptors.
//!
//! Many concurrent downloads of the same file share one descriptor: the
//! first GET opens the file and inserts an entry keyed by inode, later GETs
//! bump its reference count, and the descriptor closes when the last
//! reference is released. The cache lives on the event-loop thread and is
//! never shared, so it needs no locking. PUT uploads bypass the cache
//! entirely and get an exclusive descriptor.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Weak handle to a cache entry, held by one GET connection.
///
/// Valid only while the owning connection has not been released; the cache
/// keeps the descriptor open for at least that long.
#[derive(Debug, Clone, Copy)]
pub struct ReadHandle {
    pub fd: RawFd,
    pub ino: u64,
    pub size: u64,
}

struct CacheEntry {
    file: File,
    refs: usize,
}

/// Refcounted table of open read-only descriptors, keyed by inode.
pub struct FileCache {
    root: PathBuf,
    entries: HashMap<u64, CacheEntry>,
}

impl FileCache {
    pub fn new(root: PathBuf) -> FileCache {
        FileCache {
            root,
            entries: HashMap::new(),
        }
    }

    /// Swap the serving root. Existing entries keep their descriptors; only
    /// future lookups resolve against the new root.
    pub fn set_root(&mut self, root: PathBuf) {
        self.root = root;
    }

    /// Map a request target onto the filesystem. Targets that try to climb
    /// out of the root are refused.
    fn resolve(&self, target: &str) -> io::Result<PathBuf> {
        if target.split('/').any(|component| component == "..") {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "target escapes the serving root",
            ));
        }
        Ok(self.root.join(target.trim_start_matches('/')))
    }

    /// Resolve `target`, stat it, and hand out a shared read descriptor:
    /// either a new refcount on an existing entry for that inode, or a
    /// freshly opened one.
    pub fn acquire_for_read(&mut self, target: &str) -> io::Result<ReadHandle> {
        let path = self.resolve(target)?;
        let meta = std::fs::metadata(&path)?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "not a regular file",
            ));
        }
        let ino = meta.ino();
        let size = meta.len();

        if let Some(entry) = self.entries.get_mut(&ino) {
            entry.refs += 1;
            debug!(ino, refs = entry.refs, "Shared cached descriptor");
            return Ok(ReadHandle {
                fd: entry.file.as_raw_fd(),
                ino,
                size,
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)?;
        let fd = file.as_raw_fd();
        self.entries.insert(ino, CacheEntry { file, refs: 1 });
        debug!(ino, path = %path.display(), "Opened and cached descriptor");

        Ok(ReadHandle { fd, ino, size })
    }

    /// Drop one reference on the entry for `ino`, closing the descriptor
    /// when the count reaches zero.
    pub fn release(&mut self, ino: u64) {
        match self.entries.get_mut(&ino) {
            Some(entry) if entry.refs > 1 => {
                entry.refs -= 1;
                debug!(ino, refs = entry.refs, "Released cached descriptor");
            }
            Some(_) => {
                self.entries.remove(&ino);
                debug!(ino, "Closed cached descriptor");
            }
            None => warn!(ino, "Release for unknown inode"),
        }
    }

    /// Open the PUT target for writing: created if missing, truncated if
    /// present. Never enters the cache.
    pub fn open_for_write(&self, target: &str) -> io::Result<File> {
        let path = self.resolve(target)?;
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn refcount(&self, ino: u64) -> Option<usize> {
        self.entries.get(&ino).map(|entry| entry.refs)
    }
}
