//! Byte channels backing the map's data and FSM files.

use std::fs::File;
use std::io;
use std::path::Path;

use sync_file::{RandomAccessFile, ReadAt, WriteAt};

/// A seekable, byte-granular random-access store.
///
/// The map opens two channels, one for data and one for the free-space map,
/// and owns both until it is dropped. Writing past the current end extends
/// the channel; bytes between the old end and the start of the write read
/// back as zero. Short reads surface as errors, not truncated results.
pub trait Channel {
    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Writes all of `buf` starting at `offset`, extending the channel if
    /// the write reaches past the current end.
    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Current logical length in bytes.
    fn len(&self) -> io::Result<u64>;

    /// Truncates or zero-extends the channel to exactly `len` bytes.
    fn set_len(&self, len: u64) -> io::Result<()>;
}

/// A [`Channel`] over a file on disk.
///
/// Positioned reads and writes go through [`sync_file::RandomAccessFile`],
/// which never touches the process-wide seek cursor; a second handle to the
/// same file serves length queries and truncation.
pub struct FileChannel {
    random: RandomAccessFile,
    handle: File,
}

impl FileChannel {
    /// Creates the file, truncating one that already exists, and opens it
    /// for read/write access.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::from_file(file)
    }

    /// Opens an existing file for read/write access.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        Self::from_file(file)
    }

    fn from_file(file: File) -> io::Result<Self> {
        let handle = file.try_clone()?;
        Ok(Self {
            random: RandomAccessFile::from(file),
            handle,
        })
    }
}

impl Channel for FileChannel {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        ReadAt::read_exact_at(&self.random, buf, offset)
    }

    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        WriteAt::write_all_at(&self.random, buf, offset)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.handle.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.handle.set_len(len)
    }
}

/// An in-memory [`Channel`] used by the test suite.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemChannel {
    data: std::sync::Mutex<Vec<u8>>,
}

#[cfg(test)]
impl MemChannel {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl Channel for MemChannel {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let data = self.data.lock().unwrap();
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > data.len() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut data = self.data.lock().unwrap();
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.data.lock().unwrap().len() as u64)
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.data.lock().unwrap().resize(len as usize, 0);
        Ok(())
    }
}
