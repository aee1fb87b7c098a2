//! Raw storage regions
//!
//! A region is a fixed-capacity byte range addressed by offset, like a flash
//! partition. Erased bytes read as `0xFF`.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Value of an erased byte
pub const ERASED: u8 = 0xFF;

const ERASE_BLOCK: usize = 64 * 1024;

/// Fixed-capacity, offset-addressed storage
pub trait StorageRegion: Send {
    /// Size of the region in bytes
    fn capacity(&self) -> u64;

    /// Reset every byte to [`ERASED`]
    fn erase(&mut self) -> io::Result<()>;

    /// Write `data` at `offset`; fails if it would cross the capacity
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Read into `buf` from `offset`, returning the bytes read
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Make all writes durable
    fn sync(&mut self) -> io::Result<()>;
}

pub(crate) fn check_bounds(capacity: u64, offset: u64, len: usize) -> io::Result<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "write of {} bytes at offset {} exceeds region capacity {}",
                len, offset, capacity
            ),
        )),
    }
}

/// Region backed by a regular file or block device
#[derive(Debug)]
pub struct FileRegion {
    path: PathBuf,
    file: File,
    capacity: u64,
}

impl FileRegion {
    /// Open (creating if needed) a region of `capacity` bytes at `path`
    ///
    /// Existing content is left as is.
    pub fn open(path: &Path, capacity: u64) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            capacity,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop everything past `length`
    ///
    /// Device nodes have a fixed size and are left untouched.
    pub fn truncate(&mut self, length: u64) -> io::Result<()> {
        if self.is_regular_file()? {
            self.file.set_len(length)?;
        }
        Ok(())
    }

    fn is_regular_file(&self) -> io::Result<bool> {
        Ok(self.file.metadata()?.file_type().is_file())
    }
}

impl StorageRegion for FileRegion {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn erase(&mut self) -> io::Result<()> {
        let block = vec![ERASED; ERASE_BLOCK];
        let mut offset = 0u64;
        while offset < self.capacity {
            let len = (self.capacity - offset).min(ERASE_BLOCK as u64) as usize;
            self.file.write_all_at(&block[..len], offset)?;
            offset += len as u64;
        }
        // Stale bytes past the region would otherwise survive in a longer file
        if self.is_regular_file()? && self.file.metadata()?.len() > self.capacity {
            self.file.set_len(self.capacity)?;
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        check_bounds(self.capacity, offset, data.len())?;
        self.file.write_all_at(data, offset)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64)? {
                0 => break,
                n => filled += n,
            }
        }
        Ok(filled)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

/// Read the first `length` bytes of a region
pub fn read_prefix(region: &dyn StorageRegion, length: u64) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; length as usize];
    let n = region.read_at(0, &mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

/// CRC32 of the first `length` bytes of a region
pub fn crc32_prefix(region: &dyn StorageRegion, length: u64) -> io::Result<(u32, u64)> {
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; ERASE_BLOCK];
    let mut offset = 0u64;
    while offset < length {
        let want = (length - offset).min(buf.len() as u64) as usize;
        let n = region.read_at(offset, &mut buf[..want])?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        offset += n as u64;
    }
    Ok((hasher.finalize(), offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_region_erase_and_write() {
        let dir = tempdir().unwrap();
        let mut region = FileRegion::open(&dir.path().join("r.img"), 100_000).unwrap();

        region.erase().unwrap();
        assert_eq!(std::fs::metadata(region.path()).unwrap().len(), 100_000);
        assert!(read_prefix(&region, 100_000).unwrap().iter().all(|b| *b == ERASED));

        region.write_at(10, b"hello").unwrap();
        let mut buf = [0u8; 7];
        region.read_at(9, &mut buf).unwrap();
        assert_eq!(&buf, &[ERASED, b'h', b'e', b'l', b'l', b'o', ERASED]);
    }

    #[test]
    fn test_erase_overwrites_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.img");
        std::fs::write(&path, vec![0xA5u8; 150_000]).unwrap();

        let mut region = FileRegion::open(&path, 100_000).unwrap();
        region.erase().unwrap();
        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), 100_000);
        assert!(content.iter().all(|b| *b == ERASED));
    }

    #[test]
    fn test_device_node_erase_and_truncate() {
        // Character device: set_len is rejected by the kernel
        let mut region = FileRegion::open(Path::new("/dev/null"), 4096).unwrap();
        region.erase().unwrap();
        region.write_at(0, b"data").unwrap();
        region.truncate(4).unwrap();
    }

    #[test]
    fn test_truncate_regular_file() {
        let dir = tempdir().unwrap();
        let mut region = FileRegion::open(&dir.path().join("r.img"), 64).unwrap();
        region.erase().unwrap();
        region.truncate(10).unwrap();
        assert_eq!(std::fs::metadata(region.path()).unwrap().len(), 10);
    }

    #[test]
    fn test_file_region_rejects_overflow() {
        let dir = tempdir().unwrap();
        let mut region = FileRegion::open(&dir.path().join("r.img"), 8).unwrap();
        assert!(region.write_at(4, b"1234").is_ok());
        let err = region.write_at(5, b"1234").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_open_keeps_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.img");
        std::fs::write(&path, b"existing").unwrap();
        let region = FileRegion::open(&path, 64).unwrap();
        assert_eq!(read_prefix(&region, 8).unwrap(), b"existing");
    }

    #[test]
    fn test_crc32_prefix() {
        let dir = tempdir().unwrap();
        let mut region = FileRegion::open(&dir.path().join("r.img"), 64).unwrap();
        region.write_at(0, b"123456789").unwrap();
        let (crc, len) = crc32_prefix(&region, 9).unwrap();
        assert_eq!(len, 9);
        assert_eq!(crc, 0xCBF4_3926);
    }
}
