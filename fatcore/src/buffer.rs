//! Write-back window cache stacked directly on a device.
//!
//! The cache holds one contiguous, sector-aligned window of the device.
//! Accesses that land inside it are served from memory, accesses right
//! after it grow it, and everything else first writes back the dirty
//! range and moves the window. Dirty data is a single contiguous range,
//! so a flush is exactly one device write.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::ops::Range;

use crate::error::{FatError, FatResult};
use crate::stream::{SharedStream, Stream, StreamInfo, StreamKind};

/// Where a request lands relative to the cached window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Position {
    /// Starts inside the resident data
    Inside,
    /// Starts exactly at the end of the resident data, with room to grow
    Append,
    /// Anywhere else; the window has been moved to cover it
    Outside,
}

pub struct BufferCache {
    next: Option<SharedStream>,
    buf: Vec<u8>,
    size: usize,
    sector_size: usize,
    cylinder_size: usize,
    /// Device offset of the window, always sector aligned
    current: Option<u64>,
    /// Bytes of the window holding device data
    cur_size: usize,
    dirty: bool,
    dirty_start: usize,
    dirty_end: usize,
    ever_dirty: bool,
}

fn round_down(value: usize, unit: usize) -> usize {
    value - value % unit
}

fn round_up(value: usize, unit: usize) -> usize {
    round_down(value + unit - 1, unit)
}

impl BufferCache {
    pub fn new(next: SharedStream, size: usize, cylinder_size: usize, sector_size: usize) -> Self {
        assert!(
            sector_size > 0 && cylinder_size % sector_size == 0,
            "cylinder must be a whole number of sectors"
        );
        assert!(
            cylinder_size > 0 && size % cylinder_size == 0,
            "buffer must be a whole number of cylinders"
        );
        Self {
            next: Some(next),
            buf: alloc::vec![0; size],
            size,
            sector_size,
            cylinder_size,
            current: None,
            cur_size: 0,
            dirty: false,
            dirty_start: 0,
            dirty_end: 0,
            ever_dirty: false,
        }
    }

    /// Stack a cache on `next`. A device that already carries a live cache
    /// gets that one back, so two opens never cache the same sectors twice.
    pub fn attach(
        next: SharedStream,
        size: usize,
        cylinder_size: usize,
        sector_size: usize,
    ) -> SharedStream {
        if let Some(existing) = next.borrow().attached_buffer() {
            log::trace!("reusing buffer cache already attached to device");
            return existing;
        }
        let cache: SharedStream = Rc::new(RefCell::new(Self::new(
            next.clone(),
            size,
            cylinder_size,
            sector_size,
        )));
        if !next.borrow_mut().attach_buffer(Rc::downgrade(&cache)) {
            log::debug!("device cannot record its buffer cache");
        }
        cache
    }

    /// Device offset and length of the resident window.
    pub fn window(&self) -> Option<(u64, usize)> {
        self.current.map(|current| (current, self.cur_size))
    }

    pub fn dirty_range(&self) -> Option<Range<usize>> {
        if self.dirty {
            Some(self.dirty_start..self.dirty_end)
        } else {
            None
        }
    }

    fn device(&self) -> FatResult<&SharedStream> {
        self.next.as_ref().ok_or(FatError::Io)
    }

    /// Write the dirty range back and leave the window clean.
    fn write_back(&mut self) -> FatResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let current = match self.current {
            Some(current) => current,
            None => panic!("buffer cache is dirty with no window"),
        };
        assert!(
            self.dirty_start <= self.dirty_end && self.dirty_end <= self.cur_size,
            "dirty range {}..{} exceeds resident data {}",
            self.dirty_start,
            self.dirty_end,
            self.cur_size
        );
        let device = self.device()?.clone();
        let chunk = &self.buf[self.dirty_start..self.dirty_end];
        let offset = current + self.dirty_start as u64;
        let mut done = 0;
        while done < chunk.len() {
            let put = device
                .borrow_mut()
                .write(&chunk[done..], offset + done as u64)?;
            if put == 0 {
                log::error!(
                    "short write flushing buffer at {:#x}: {} of {} bytes",
                    offset,
                    done,
                    chunk.len()
                );
                return Err(FatError::Io);
            }
            done += put;
        }
        self.dirty = false;
        self.dirty_start = 0;
        self.dirty_end = 0;
        Ok(())
    }

    /// Move the window so it starts at the sector containing `start`.
    fn invalidate(&mut self, start: u64) -> FatResult<()> {
        self.write_back()?;
        let sector = self.sector_size as u64;
        self.current = Some(start - start % sector);
        self.cur_size = 0;
        Ok(())
    }

    /// Classify a request and clamp `len` to what can be served in one go.
    fn locate(&mut self, start: u64, len: &mut usize) -> FatResult<Position> {
        if let Some(current) = self.current {
            let end = current + self.cur_size as u64;
            if start >= current && start < end {
                *len = (*len).min(self.cur_size - (start - current) as usize);
                return Ok(Position::Inside);
            }
            if start == end && self.cur_size < self.size && *len >= self.sector_size {
                *len = (*len).min(self.size - self.cur_size);
                *len = round_down(*len, self.sector_size);
                return Ok(Position::Append);
            }
        }

        self.invalidate(start)?;
        let current = self.current.unwrap_or(start);
        let offset = (start - current) as usize;
        let cylinder_left = self.cylinder_size - (current % self.cylinder_size as u64) as usize;
        *len = (*len).min(cylinder_left - offset);
        Ok(Position::Outside)
    }

    /// Bring the bytes after the resident data in, up to the end of the
    /// current cylinder.
    fn fill(&mut self, current: u64) -> FatResult<()> {
        let end = current + self.cur_size as u64;
        let mut want = self.cylinder_size - (end % self.cylinder_size as u64) as usize;
        want = want.min(self.size - self.cur_size);
        let device = self.device()?.clone();
        let got = device
            .borrow_mut()
            .read(&mut self.buf[self.cur_size..self.cur_size + want], end)?;
        self.cur_size += got;
        Ok(())
    }

    /// Extend `cur_size` to a sector boundary with zeroes.
    fn pad_to_sector(&mut self) {
        let padded = round_up(self.cur_size, self.sector_size).min(self.size);
        self.buf[self.cur_size..padded].fill(0);
        self.cur_size = padded;
    }

    /// Claim `len` bytes right after the resident data for a write that
    /// will overwrite all of them.
    fn claim_append(&mut self, len: &mut usize, current: u64) {
        *len = round_down(*len, self.sector_size);
        *len = (*len).min(self.size - self.cur_size);
        if let Some(device) = self.next.as_ref() {
            let mut device = device.borrow_mut();
            let resident_end = current + self.cur_size as u64;
            if device.can_preallocate() {
                let end = resident_end + *len as u64;
                if let Err(e) = device.preallocate(end) {
                    log::trace!("preallocation hint to {:#x} refused: {}", end, e);
                }
            } else if let Ok(StreamInfo { size: Some(size), .. }) = device.describe() {
                let room = size.saturating_sub(resident_end);
                *len = round_down((*len as u64).min(room) as usize, self.sector_size);
            }
        }
        self.cur_size += *len;
    }
}

impl Stream for BufferCache {
    fn next(&self) -> Option<&SharedStream> {
        self.next.as_ref()
    }

    fn take_next(&mut self) -> Option<SharedStream> {
        self.next.take()
    }

    fn read(&mut self, buffer: &mut [u8], offset: u64) -> FatResult {
        let mut len = buffer.len();
        if len == 0 {
            return Ok(0);
        }
        let position = self.locate(offset, &mut len)?;
        let current = self.current.unwrap_or(offset);
        if position != Position::Inside {
            self.fill(current)?;
            if current + self.cur_size as u64 <= offset {
                return Ok(0);
            }
        }
        let start = (offset - current) as usize;
        let len = len.min(self.cur_size - start);
        buffer[..len].copy_from_slice(&self.buf[start..start + len]);
        Ok(len)
    }

    fn write(&mut self, buffer: &[u8], offset: u64) -> FatResult {
        let mut len = buffer.len();
        if len == 0 {
            return Ok(0);
        }
        self.ever_dirty = true;
        let position = self.locate(offset, &mut len)?;
        let current = self.current.unwrap_or(offset);
        let start = (offset - current) as usize;

        match position {
            Position::Inside => {
                len = len.min(self.cur_size - start);
            }
            Position::Append => {
                self.claim_append(&mut len, current);
            }
            Position::Outside => {
                let aligned = offset % self.cylinder_size as u64 == 0;
                if aligned && len >= self.sector_size {
                    self.claim_append(&mut len, current);
                } else {
                    // Partial cylinder write: read the surrounding data first.
                    let want = self.cylinder_size - (current % self.cylinder_size as u64) as usize;
                    let device = self.device()?.clone();
                    let mut got = device.borrow_mut().read(&mut self.buf[..want], current)?;
                    if got % self.sector_size != 0 {
                        log::warn!(
                            "unaligned read of {} bytes at {:#x}, dropping partial sector",
                            got,
                            current
                        );
                        got = round_down(got, self.sector_size);
                    }
                    if got < want && device.borrow().can_preallocate() {
                        // Past the end of a growable device: the missing
                        // sectors read as zeroes.
                        self.buf[got..want].fill(0);
                        got = want;
                    }
                    self.cur_size = got;
                    // A fixed device ends where its data ends.
                    len = len.min(got.saturating_sub(start));
                }
            }
        }
        if len == 0 {
            return Ok(0);
        }

        if start + len > self.cur_size {
            let tail = (start + len) % self.sector_size;
            if tail != 0 && len > tail {
                len -= tail;
            }
            if start + len > self.cur_size {
                self.cur_size = start + len;
            }
        }
        if round_up(start + len, self.sector_size) > self.cur_size {
            self.pad_to_sector();
        }

        self.buf[start..start + len].copy_from_slice(&buffer[..len]);

        let dirty_start = round_down(start, self.sector_size);
        let dirty_end = round_up(start + len, self.sector_size);
        if !self.dirty || dirty_start < self.dirty_start {
            self.dirty_start = dirty_start;
        }
        if !self.dirty || dirty_end > self.dirty_end {
            self.dirty_end = dirty_end;
        }
        self.dirty = true;
        assert!(
            self.dirty_end <= self.cur_size,
            "dirty range end {} past resident data {}",
            self.dirty_end,
            self.cur_size
        );
        Ok(len)
    }

    fn flush(&mut self) -> FatResult<()> {
        if !self.ever_dirty {
            return Ok(());
        }
        self.write_back()?;
        self.ever_dirty = false;
        Ok(())
    }

    fn describe(&self) -> FatResult<StreamInfo> {
        let mut info = self.device()?.borrow().describe()?;
        info.kind = StreamKind::Buffer;
        Ok(info)
    }
}

impl Drop for BufferCache {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.write_back() {
                log::error!("lost dirty buffer data on drop: {}", e);
            }
        }
    }
}
