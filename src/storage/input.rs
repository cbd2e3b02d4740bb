//! Byte sources the player reads recordings from

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use memmap2::Mmap;

use crate::{OniError, Result};

/// Seekable byte source decoupling the player from file I/O
///
/// `seek`/`tell` are the 32-bit forms used by files with 32-bit offsets;
/// they fail instead of truncating a position that does not fit.
pub trait InputStream: Send {
    /// Acquire the underlying resource
    ///
    /// # Errors
    ///
    /// Returns error if the source cannot be opened
    fn open(&mut self) -> Result<()>;

    /// Read up to `buf.len()` bytes, returning 0 at end of stream
    ///
    /// # Errors
    ///
    /// Returns error if the stream is closed or the read fails
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Move to a 64-bit position, returning the new absolute position
    ///
    /// # Errors
    ///
    /// Returns error if the stream is closed or the target is before the start
    fn seek64(&mut self, pos: SeekFrom) -> Result<u64>;

    /// Current 64-bit position
    ///
    /// # Errors
    ///
    /// Returns error if the stream is closed
    fn tell64(&mut self) -> Result<u64>;

    /// Release the underlying resource
    ///
    /// # Errors
    ///
    /// Returns error if releasing fails
    fn close(&mut self) -> Result<()>;

    /// Move to a position, returning it as a 32-bit offset
    ///
    /// # Errors
    ///
    /// Returns error if the seek fails or the position exceeds 32 bits
    fn seek(&mut self, pos: SeekFrom) -> Result<u32> {
        narrow(self.seek64(pos)?)
    }

    /// Current position as a 32-bit offset
    ///
    /// # Errors
    ///
    /// Returns error if the stream is closed or the position exceeds 32 bits
    fn tell(&mut self) -> Result<u32> {
        narrow(self.tell64()?)
    }

    /// Read until `buf` is full or the stream ends, returning the count read
    ///
    /// # Errors
    ///
    /// Returns error if a read fails
    fn read_fully(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

fn narrow(pos: u64) -> Result<u32> {
    u32::try_from(pos)
        .map_err(|_| OniError::BadParameter(format!("position {pos} does not fit 32 bits")))
}

fn not_open() -> OniError {
    OniError::BadParameter("input stream is not open".to_string())
}

fn resolve(pos: SeekFrom, current: u64, len: u64) -> Result<u64> {
    let target = match pos {
        SeekFrom::Start(p) => Some(p),
        SeekFrom::Current(delta) => current.checked_add_signed(delta),
        SeekFrom::End(delta) => len.checked_add_signed(delta),
    };
    target.ok_or_else(|| OniError::BadParameter(format!("invalid seek {pos:?}")))
}

/// Buffered file reader
pub struct FileInputStream {
    path: PathBuf,
    reader: Option<BufReader<File>>,
}

impl FileInputStream {
    /// Create a stream over `path`; nothing is opened until [`InputStream::open`]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            reader: None,
        }
    }

    fn reader(&mut self) -> Result<&mut BufReader<File>> {
        self.reader.as_mut().ok_or_else(not_open)
    }
}

impl InputStream for FileInputStream {
    fn open(&mut self) -> Result<()> {
        self.reader = Some(BufReader::new(File::open(&self.path)?));
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.reader()?.read(buf)?)
    }

    fn seek64(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.reader()?.seek(pos)?)
    }

    fn tell64(&mut self) -> Result<u64> {
        Ok(self.reader()?.stream_position()?)
    }

    fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}

/// Memory-mapped file reader
pub struct MmapInputStream {
    path: PathBuf,
    mmap: Option<Mmap>,
    pos: u64,
}

impl MmapInputStream {
    /// Create a stream over `path`; the file is mapped by [`InputStream::open`]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            mmap: None,
            pos: 0,
        }
    }
}

impl InputStream for MmapInputStream {
    fn open(&mut self) -> Result<()> {
        let file = File::open(&self.path)?;
        // The recording is not modified while it is played back.
        let mmap = unsafe { Mmap::map(&file)? };
        self.mmap = Some(mmap);
        self.pos = 0;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mmap = self.mmap.as_ref().ok_or_else(not_open)?;
        let start = usize::try_from(self.pos).unwrap_or(usize::MAX).min(mmap.len());
        let n = buf.len().min(mmap.len() - start);
        buf[..n].copy_from_slice(&mmap[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn seek64(&mut self, pos: SeekFrom) -> Result<u64> {
        let len = self.mmap.as_ref().ok_or_else(not_open)?.len() as u64;
        self.pos = resolve(pos, self.pos, len)?;
        Ok(self.pos)
    }

    fn tell64(&mut self) -> Result<u64> {
        self.mmap.as_ref().ok_or_else(not_open)?;
        Ok(self.pos)
    }

    fn close(&mut self) -> Result<()> {
        self.mmap = None;
        Ok(())
    }
}

/// Reader over a recording held in memory
#[derive(Debug, Clone)]
pub struct MemoryInputStream {
    data: Bytes,
    pos: u64,
    open: bool,
}

impl MemoryInputStream {
    /// Create a stream over `data`
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
            open: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(not_open())
        }
    }
}

impl InputStream for MemoryInputStream {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        self.pos = 0;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let start = usize::try_from(self.pos)
            .unwrap_or(usize::MAX)
            .min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn seek64(&mut self, pos: SeekFrom) -> Result<u64> {
        self.ensure_open()?;
        self.pos = resolve(pos, self.pos, self.data.len() as u64)?;
        Ok(self.pos)
    }

    fn tell64(&mut self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.pos)
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}
