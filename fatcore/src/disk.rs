use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use crate::error::{FatError, FatResult};
use crate::stream::{SharedStream, Stream, StreamInfo, StreamKind, WeakStream};

/// Trait abstracting raw device read/write operations.
/// On a host this is backed by an image file; tests back it with memory.
pub trait DiskIO {
    /// Returns the number of bytes read; fewer than requested only at the
    /// end of the device.
    fn read(&mut self, buffer: &mut [u8], offset: u64) -> FatResult;

    /// Returns the number of bytes written; fewer than requested only when
    /// the device cannot grow.
    fn write(&mut self, buffer: &[u8], offset: u64) -> FatResult;

    fn flush(&mut self) -> FatResult<()> {
        Ok(())
    }

    fn size(&self) -> Option<u64> {
        None
    }

    /// Whether writes past the end extend the device.
    fn growable(&self) -> bool {
        false
    }

    fn set_size(&mut self, _size: u64) -> FatResult<()> {
        Err(FatError::Unsupported)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IoStats {
    pub reads: usize,
    pub writes: usize,
    pub bytes_read: usize,
    pub bytes_written: usize,
}

struct MemoryImage {
    data: Vec<u8>,
    stats: IoStats,
}

/// Device image held in memory. Clones share the same bytes, so a test
/// can keep one handle to inspect what a mounted volume wrote.
#[derive(Clone)]
pub struct MemoryDisk {
    image: Rc<RefCell<MemoryImage>>,
    growable: bool,
}

impl MemoryDisk {
    pub fn new(size: usize) -> Self {
        Self::from_bytes(alloc::vec![0; size])
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            image: Rc::new(RefCell::new(MemoryImage {
                data,
                stats: IoStats::default(),
            })),
            growable: false,
        }
    }

    /// A disk that extends itself on writes past its end, like a sparse
    /// image file.
    pub fn growable(data: Vec<u8>) -> Self {
        Self {
            growable: true,
            ..Self::from_bytes(data)
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.image.borrow().data.clone()
    }

    pub fn len(&self) -> usize {
        self.image.borrow().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> IoStats {
        self.image.borrow().stats
    }

    pub fn reset_stats(&self) {
        self.image.borrow_mut().stats = IoStats::default();
    }
}

impl DiskIO for MemoryDisk {
    fn read(&mut self, buffer: &mut [u8], offset: u64) -> FatResult {
        let mut image = self.image.borrow_mut();
        image.stats.reads += 1;
        let len = image.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let count = buffer.len().min(image.data.len() - start);
        buffer[..count].copy_from_slice(&image.data[start..start + count]);
        image.stats.bytes_read += count;
        Ok(count)
    }

    fn write(&mut self, buffer: &[u8], offset: u64) -> FatResult {
        let mut image = self.image.borrow_mut();
        image.stats.writes += 1;
        let start = offset as usize;
        let end = start + buffer.len();
        if end > image.data.len() {
            if self.growable {
                image.data.resize(end, 0);
            } else if start >= image.data.len() {
                return Ok(0);
            }
        }
        let count = buffer.len().min(image.data.len() - start);
        image.data[start..start + count].copy_from_slice(&buffer[..count]);
        image.stats.bytes_written += count;
        Ok(count)
    }

    fn size(&self) -> Option<u64> {
        Some(self.len() as u64)
    }

    fn growable(&self) -> bool {
        self.growable
    }

    fn set_size(&mut self, size: u64) -> FatResult<()> {
        if !self.growable {
            return Err(FatError::Unsupported);
        }
        let mut image = self.image.borrow_mut();
        if (size as usize) > image.data.len() {
            image.data.resize(size as usize, 0);
        }
        Ok(())
    }
}

/// Host image file. Reads past the end come back short, writes extend.
#[cfg(any(test, feature = "std"))]
pub struct ImageFile {
    file: std::fs::File,
}

#[cfg(any(test, feature = "std"))]
impl ImageFile {
    pub fn open<P: AsRef<std::path::Path>>(path: P, writable: bool) -> FatResult<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)?;
        Ok(Self { file })
    }
}

#[cfg(any(test, feature = "std"))]
impl DiskIO for ImageFile {
    fn read(&mut self, buffer: &mut [u8], offset: u64) -> FatResult {
        use std::io::{Read, Seek, SeekFrom};

        self.file.seek(SeekFrom::Start(offset))?;
        let mut done = 0;
        while done < buffer.len() {
            match self.file.read(&mut buffer[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(done)
    }

    fn write(&mut self, buffer: &[u8], offset: u64) -> FatResult {
        use std::io::{Seek, SeekFrom, Write};

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buffer)?;
        Ok(buffer.len())
    }

    fn flush(&mut self) -> FatResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn size(&self) -> Option<u64> {
        self.file.metadata().ok().map(|m| m.len())
    }

    fn growable(&self) -> bool {
        true
    }

    fn set_size(&mut self, size: u64) -> FatResult<()> {
        if self.size().map_or(true, |current| size > current) {
            self.file.set_len(size)?;
        }
        Ok(())
    }
}

/// Bottom layer of every stream chain: adapts a `DiskIO` device and keeps
/// the back-link to the buffer cache stacked on it.
pub struct DiskStream<D: DiskIO> {
    disk: D,
    buffer: Option<WeakStream>,
}

impl<D: DiskIO> DiskStream<D> {
    pub fn new(disk: D) -> Self {
        Self { disk, buffer: None }
    }

    pub fn disk(&self) -> &D {
        &self.disk
    }
}

impl<D: DiskIO> Stream for DiskStream<D> {
    fn read(&mut self, buffer: &mut [u8], offset: u64) -> FatResult {
        self.disk.read(buffer, offset)
    }

    fn write(&mut self, buffer: &[u8], offset: u64) -> FatResult {
        self.disk.write(buffer, offset)
    }

    fn flush(&mut self) -> FatResult<()> {
        self.disk.flush()
    }

    fn describe(&self) -> FatResult<StreamInfo> {
        Ok(StreamInfo {
            size: self.disk.size(),
            kind: StreamKind::Device,
            modified: None,
        })
    }

    fn can_preallocate(&self) -> bool {
        self.disk.growable()
    }

    fn preallocate(&mut self, size: u64) -> FatResult<()> {
        self.disk.set_size(size)
    }

    fn attached_buffer(&self) -> Option<SharedStream> {
        self.buffer.as_ref().and_then(|weak| weak.upgrade())
    }

    fn attach_buffer(&mut self, buffer: WeakStream) -> bool {
        self.buffer = Some(buffer);
        true
    }
}
