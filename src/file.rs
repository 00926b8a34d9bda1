// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::file_ops::FileOps;

/// An open tree file: a block device capability plus the append position.
///
/// Bytes before the append position are immutable; all writes go to the
/// end of the file.
pub struct TreeFile {
    ops: Box<dyn FileOps>,
    pos: u64,
}

impl TreeFile {
    /// Wraps a block device, positioning the append cursor at end-of-file.
    pub fn new(mut ops: Box<dyn FileOps>) -> crate::Result<Self> {
        let pos = ops.goto_eof()?;
        Ok(Self { ops, pos })
    }

    /// Current end-of-file (the next append offset).
    #[must_use]
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Reads exactly `buf.len()` bytes at `offset`, retrying transient
    /// interrupts.
    pub(crate) fn pread_exact(&self, buf: &mut [u8], offset: u64) -> crate::Result<()> {
        let mut filled = 0;

        while filled < buf.len() {
            #[allow(clippy::indexing_slicing)]
            match self.ops.pread(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => {
                    return Err(crate::Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!(
                            "short read at {offset}: wanted {}, got {filled}",
                            buf.len()
                        ),
                    )));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// Appends a buffer at the current end-of-file, retrying transient
    /// interrupts, and returns the offset it was written at.
    pub(crate) fn append(&mut self, buf: &[u8]) -> crate::Result<u64> {
        let start = self.pos;
        let mut written = 0;

        while written < buf.len() {
            #[allow(clippy::indexing_slicing)]
            match self.ops.pwrite(&buf[written..], start + written as u64) {
                Ok(0) => {
                    return Err(crate::Error::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "device refused to accept more bytes",
                    )));
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.pos += buf.len() as u64;
        Ok(start)
    }

    /// Flushes written data to stable storage.
    pub(crate) fn sync(&mut self) -> crate::Result<()> {
        self.ops.sync().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::TreeFile;
    use crate::file_ops::MemoryFileOps;
    use test_log::test;

    #[test]
    fn append_advances_position() -> crate::Result<()> {
        let mut file = TreeFile::new(Box::new(MemoryFileOps::new()))?;
        assert_eq!(0, file.pos());

        assert_eq!(0, file.append(b"abc")?);
        assert_eq!(3, file.append(b"defg")?);
        assert_eq!(7, file.pos());

        let mut buf = [0u8; 7];
        file.pread_exact(&mut buf, 0)?;
        assert_eq!(b"abcdefg", &buf);
        Ok(())
    }

    #[test]
    fn read_past_eof_is_an_error() -> crate::Result<()> {
        let file = TreeFile::new(Box::new(MemoryFileOps::new()))?;
        let mut buf = [0u8; 4];
        assert!(matches!(
            file.pread_exact(&mut buf, 100),
            Err(crate::Error::Io(_))
        ));
        Ok(())
    }
}
