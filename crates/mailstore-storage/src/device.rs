//! Byte-addressed devices backing a mailstore file.

use mailstore_common::{MailstoreError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> Result<u64>;

    /// Reads exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes all bytes in `buf` at `offset`, extending the device if needed.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Truncates or zero-extends the device.
    fn set_len(&self, len: u64) -> Result<()>;

    /// Flushes pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn out_of_bounds(offset: u64, len: usize, device_len: u64) -> MailstoreError {
    MailstoreError::corrupted(format!(
        "read out of bounds: offset={offset:#x} len={len} device_len={device_len:#x}"
    ))
}

/// File-backed device.
pub struct FileDevice {
    file: Mutex<File>,
    path: PathBuf,
}

impl FileDevice {
    /// Creates a new, empty file, truncating any existing one.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    /// Opens an existing file for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteDevice for FileDevice {
    fn len_bytes(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        if offset.saturating_add(buf.len() as u64) > len {
            return Err(out_of_bounds(offset, buf.len(), len));
        }
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.file.lock().set_len(len)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

/// In-memory device.
///
/// Clones share the same image, so a test can keep a handle, drop the
/// session, and reopen or tamper with the bytes the session wrote.
#[derive(Clone, Default)]
pub struct MemoryDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copies the current image.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Flips bits of the byte at `offset`.
    pub fn corrupt_byte(&self, offset: u64, mask: u8) {
        if let Some(b) = self.bytes.lock().get_mut(offset as usize) {
            *b ^= mask;
        }
    }
}

impl ByteDevice for MemoryDevice {
    fn len_bytes(&self) -> Result<u64> {
        Ok(self.bytes.lock().len() as u64)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let start = offset as usize;
        let end = start.saturating_add(buf.len());
        if end > bytes.len() {
            return Err(out_of_bounds(offset, buf.len(), bytes.len() as u64));
        }
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.bytes.lock().resize(len as usize, 0);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
