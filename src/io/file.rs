//! Source and destination files.
//!
//! The drain loop writes completed blocks through [`BlockSink`], a
//! synchronous positional write. [`open_source`] and
//! [`create_destination`] open the two ends of a copy.

use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::fs::{FileExt, OpenOptionsExt},
    path::Path,
};

use crate::error::{CopyError, Result};

/// Destination permissions: owner read-write, group and other read.
pub const DESTINATION_MODE: u32 = 0o644;

/// Synchronous positional writer used for write-back.
pub trait BlockSink {
    /// Write `buf` at `offset` and return the number of bytes written,
    /// which may be fewer than `buf.len()`.
    fn write_block_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize>;
}

impl BlockSink for File {
    fn write_block_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.write_at(buf, offset)
    }
}

/// In-memory destination; grows (zero-filled) to cover every write.
impl BlockSink for Vec<u8> {
    fn write_block_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset out of range"))?;
        let end = start + buf.len();
        if self.len() < end {
            self.resize(end, 0);
        }
        self[start..end].copy_from_slice(buf);
        Ok(buf.len())
    }
}

impl<S: BlockSink + ?Sized> BlockSink for &mut S {
    fn write_block_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        (**self).write_block_at(buf, offset)
    }
}

/// Open the copy source read-only.
pub fn open_source(path: &Path) -> Result<File> {
    File::open(path).map_err(|source| CopyError::Open {
        path: path.to_path_buf(),
        source,
    })
}

/// Create or truncate the copy destination with [`DESTINATION_MODE`].
pub fn create_destination(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(DESTINATION_MODE)
        .open(path)
        .map_err(|source| CopyError::Open {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn memory_sink_grows_for_out_of_order_writes() {
        let mut sink: Vec<u8> = Vec::new();
        assert_eq!(sink.write_block_at(b"cd", 2).unwrap(), 2);
        assert_eq!(sink.write_block_at(b"ab", 0).unwrap(), 2);
        assert_eq!(sink, b"abcd");
    }

    #[test]
    fn destination_is_created_truncated_with_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        std::fs::write(&path, b"previous contents").unwrap();

        let file = create_destination(&path).unwrap();
        let meta = file.metadata().unwrap();
        assert_eq!(meta.len(), 0);
        // The umask may only clear bits.
        assert_eq!(meta.permissions().mode() & 0o777 & !DESTINATION_MODE, 0);
    }

    #[test]
    fn missing_source_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        match open_source(&path) {
            Err(CopyError::Open { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
