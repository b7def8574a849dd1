//! Growable, randomly addressable byte stores backing serialization.
//!
//! The write engine is the only writer of a sink within a session and writes
//! strictly sequentially, with a handful of back-patches (header checksum,
//! map offset) through [`DataSink::write_at`].

use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Minimum growth step for the in-memory backing buffer (256 KiB).
const MIN_GROWTH_STEP: usize = 256 * 1024;

/// Randomly addressable byte store that serialization writes through.
///
/// Writing past the current logical size transparently grows the store.
/// The backing store grows monotonically within a session and never shrinks.
pub trait DataSink {
    /// Write `bytes` starting at `offset`, growing the store if needed.
    fn write_at(&mut self, offset: usize, bytes: &[u8]) -> io::Result<()>;

    /// Read up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes read; a return of `0` for a non-empty
    /// `buf` means `offset` is at or past the end of the data.
    fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> io::Result<usize>;

    /// Current logical size in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequential reader positioned at `offset`, with mark/reset support.
    fn reader_at(&mut self, offset: usize) -> SinkReader<'_, Self>
    where
        Self: Sized,
    {
        SinkReader {
            sink: self,
            position: offset,
            mark: offset,
        }
    }
}

/// Sequential reading cursor over a [`DataSink`].
///
/// `reset` always returns to the last `mark`, which defaults to the offset
/// the reader was created at. Marks never expire.
pub struct SinkReader<'a, S: DataSink> {
    sink: &'a mut S,
    position: usize,
    mark: usize,
}

impl<S: DataSink> SinkReader<'_, S> {
    /// Remember the current position for a later [`reset`](Self::reset).
    pub fn mark(&mut self) {
        self.mark = self.position;
    }

    /// Return to the last marked position.
    pub fn reset(&mut self) {
        self.position = self.mark;
    }

    /// Advance past up to `n` bytes, returning how many were skipped.
    pub fn skip(&mut self, n: usize) -> usize {
        let skipped = n.min(self.available());
        self.position += skipped;
        skipped
    }

    /// Bytes remaining between the cursor and the end of the data.
    pub fn available(&self) -> usize {
        self.sink.len().saturating_sub(self.position)
    }

    pub fn position(&self) -> usize {
        self.position
    }
}

impl<S: DataSink> Read for SinkReader<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.sink.read_at(self.position, buf)?;
        self.position += n;
        Ok(n)
    }
}

/// In-memory sink backed by a growable buffer.
pub struct MemorySink {
    buf: Vec<u8>,
    size: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(initial_capacity: usize) -> Self {
        MemorySink {
            buf: vec![0; initial_capacity],
            size: 0,
        }
    }

    /// Exact-length copy of the written data, independent of the live
    /// backing buffer.
    pub fn data(&self) -> Vec<u8> {
        self.buf[..self.size].to_vec()
    }

    /// Current backing capacity (≥ logical size).
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn grow_if_needed(&mut self, min_size: usize) {
        if min_size > self.size {
            if min_size > self.buf.len() {
                let new_capacity = new_buffer_size(self.buf.len(), min_size);
                self.buf.resize(new_capacity, 0);
            }
            self.size = min_size;
        }
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

/// Growth policy: a quarter over the requested size, or one growth step over
/// the current capacity, whichever is larger.
fn new_buffer_size(current_capacity: usize, min_size: usize) -> usize {
    (min_size + min_size / 4).max(current_capacity + MIN_GROWTH_STEP)
}

impl DataSink for MemorySink {
    fn write_at(&mut self, offset: usize, bytes: &[u8]) -> io::Result<()> {
        self.grow_if_needed(offset + bytes.len());
        self.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.size.saturating_sub(offset);
        let n = buf.len().min(available);
        buf[..n].copy_from_slice(&self.buf[offset..offset + n]);
        Ok(n)
    }

    fn len(&self) -> usize {
        self.size
    }
}

/// File-backed sink using seek-based positioned I/O.
pub struct FileSink {
    file: std::fs::File,
    path: PathBuf,
    size: usize,
}

impl FileSink {
    /// Create (or truncate) the file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        Ok(FileSink {
            file,
            path: path.as_ref().to_path_buf(),
            size: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush buffered writes to the operating system.
    pub fn sync(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }
}

impl DataSink for FileSink {
    fn write_at(&mut self, offset: usize, bytes: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(bytes)?;
        self.size = self.size.max(offset + bytes.len());
        Ok(())
    }

    fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        self.file.seek(SeekFrom::Start(offset as u64))?;
        let limit = buf.len().min(self.size - offset);
        let mut read = 0;
        while read < limit {
            let n = self.file.read(&mut buf[read..limit])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }

    fn len(&self) -> usize {
        self.size
    }
}
