// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::db::OpenOptions;
use std::path::Path;

/// Block-device capability backing a [`crate::file::TreeFile`].
///
/// Open and close map onto the implementor's constructor and `Drop`. All
/// methods may fail; the engine retries only on transient-interrupt
/// semantics (`ErrorKind::Interrupted`) and short transfers.
pub trait FileOps {
    /// Reads up to `buf.len()` bytes at the given absolute offset.
    fn pread(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize>;

    /// Writes a buffer at the given absolute offset.
    ///
    /// The engine only ever writes past the end of file known at open time;
    /// existing bytes are never rewritten.
    fn pwrite(&mut self, buf: &[u8], offset: u64) -> std::io::Result<usize>;

    /// Flushes written data to stable storage.
    fn sync(&mut self) -> std::io::Result<()>;

    /// Returns the offset of the end of the file.
    fn goto_eof(&mut self) -> std::io::Result<u64>;
}

/// [`FileOps`] over a real file, using positional reads and writes.
pub struct StdFileOps {
    file: std::fs::File,
}

impl StdFileOps {
    /// Opens (or creates) the file at `path`.
    pub fn open(path: &Path, options: &OpenOptions) -> crate::Result<Self> {
        let mut open_options = std::fs::OpenOptions::new();
        open_options.read(true);

        if !options.read_only {
            open_options.write(true);
        }
        if options.create && !options.read_only {
            open_options.create(true);
        }

        match open_options.open(path) {
            Ok(file) => Ok(Self { file }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(crate::Error::NoSuchFile),
            Err(e) => Err(crate::Error::OpenFile(e)),
        }
    }

    /// Wraps an already-open file.
    #[must_use]
    pub fn from_file(file: std::fs::File) -> Self {
        Self { file }
    }
}

impl FileOps for StdFileOps {
    #[cfg(unix)]
    fn pread(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read_at(buf, offset)
    }

    #[cfg(windows)]
    fn pread(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.seek_read(buf, offset)
    }

    #[cfg(unix)]
    fn pwrite(&mut self, buf: &[u8], offset: u64) -> std::io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.write_at(buf, offset)
    }

    #[cfg(windows)]
    fn pwrite(&mut self, buf: &[u8], offset: u64) -> std::io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.seek_write(buf, offset)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_all()
    }

    fn goto_eof(&mut self) -> std::io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// In-memory [`FileOps`] used by tests.
#[derive(Default)]
pub struct MemoryFileOps {
    data: Vec<u8>,
}

impl MemoryFileOps {
    /// Creates an empty in-memory file.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an in-memory file with the given contents.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Returns the raw file contents.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl FileOps for MemoryFileOps {
    fn pread(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        #[allow(clippy::cast_possible_truncation)]
        let offset = offset as usize;

        if offset >= self.data.len() {
            return Ok(0);
        }

        let available = self.data.len() - offset;
        let n = buf.len().min(available);

        #[allow(clippy::indexing_slicing)]
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);

        Ok(n)
    }

    fn pwrite(&mut self, buf: &[u8], offset: u64) -> std::io::Result<usize> {
        #[allow(clippy::cast_possible_truncation)]
        let offset = offset as usize;

        if self.data.len() < offset + buf.len() {
            self.data.resize(offset + buf.len(), 0);
        }

        #[allow(clippy::indexing_slicing)]
        self.data[offset..offset + buf.len()].copy_from_slice(buf);

        Ok(buf.len())
    }

    fn sync(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn goto_eof(&mut self) -> std::io::Result<u64> {
        Ok(self.data.len() as u64)
    }
}
