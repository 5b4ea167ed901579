use alloc::rc::{Rc, Weak};
use core::cell::RefCell;

use crate::error::{FatError, FatResult};

/// A layer of the storage pipeline, shared between every handle that
/// aliases it. Dropping the last reference tears the layer down.
pub type SharedStream = Rc<RefCell<dyn Stream>>;

/// Non-owning link from a device back to the buffer layered on top of it.
pub type WeakStream = Weak<RefCell<dyn Stream>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Device,
    Buffer,
    File,
    Directory,
}

#[derive(Clone, Copy, Debug)]
pub struct StreamInfo {
    pub size: Option<u64>,
    pub kind: StreamKind,
    /// Seconds since 1980-01-01
    pub modified: Option<u32>,
}

/// Byte-addressed I/O over one layer of a stream chain.
///
/// Every operation has a pass-through default that forwards to the next
/// layer down, so a thin layer only overrides what it changes. A short
/// `read` means end of extent; a short `write` means no space. Errors are
/// always reported through `Err`, never through a zero length.
pub trait Stream {
    /// The layer this one forwards to.
    fn next(&self) -> Option<&SharedStream> {
        None
    }

    /// Detach the next layer, used when this layer is released.
    fn take_next(&mut self) -> Option<SharedStream> {
        None
    }

    fn read(&mut self, buffer: &mut [u8], offset: u64) -> FatResult {
        match self.next() {
            Some(next) => next.borrow_mut().read(buffer, offset),
            None => Err(FatError::Unsupported),
        }
    }

    fn write(&mut self, buffer: &[u8], offset: u64) -> FatResult {
        match self.next() {
            Some(next) => next.borrow_mut().write(buffer, offset),
            None => Err(FatError::Unsupported),
        }
    }

    /// Make this layer's own dirty state durable in the layer below. Use
    /// `flush_chain` to push it all the way down.
    fn flush(&mut self) -> FatResult<()> {
        Ok(())
    }

    fn describe(&self) -> FatResult<StreamInfo> {
        match self.next() {
            Some(next) => next.borrow().describe(),
            None => Err(FatError::Unsupported),
        }
    }

    fn can_preallocate(&self) -> bool {
        match self.next() {
            Some(next) => next.borrow().can_preallocate(),
            None => false,
        }
    }

    /// Hint that the stream will grow to `size` bytes.
    fn preallocate(&mut self, size: u64) -> FatResult<()> {
        match self.next() {
            Some(next) => next.borrow_mut().preallocate(size),
            None => Err(FatError::Unsupported),
        }
    }

    /// Tear this layer down: flush it, then release the layer below.
    /// Only called through `release` once no other handle aliases it.
    fn release(&mut self) -> FatResult<()> {
        self.flush()?;
        match self.take_next() {
            Some(next) => release(next),
            None => Ok(()),
        }
    }

    /// The buffer layer already stacked on this one, if it is still alive.
    fn attached_buffer(&self) -> Option<SharedStream> {
        None
    }

    /// Remember the buffer stacked on this layer. Returns false when the
    /// layer cannot carry the link.
    fn attach_buffer(&mut self, _buffer: WeakStream) -> bool {
        false
    }
}

/// Drop one handle on a stream. The last handle tears the layer down and
/// recurses into its successor; otherwise the layer is only flushed so the
/// remaining aliases see a durable state.
pub fn release(stream: SharedStream) -> FatResult<()> {
    if Rc::strong_count(&stream) > 1 {
        return flush_chain(&stream);
    }
    let result = stream.borrow_mut().release();
    result
}

/// Flush a layer and every layer below it.
pub fn flush_chain(stream: &SharedStream) -> FatResult<()> {
    let next = {
        let mut layer = stream.borrow_mut();
        layer.flush()?;
        layer.next().cloned()
    };
    match next {
        Some(next) => flush_chain(&next),
        None => Ok(()),
    }
}

/// Keep reading until `buffer` is full or the stream reports end of extent.
pub fn read_fully(stream: &SharedStream, buffer: &mut [u8], offset: u64) -> FatResult {
    let mut done = 0;
    while done < buffer.len() {
        let got = stream
            .borrow_mut()
            .read(&mut buffer[done..], offset + done as u64)?;
        if got == 0 {
            break;
        }
        done += got;
    }
    Ok(done)
}

/// Keep writing until all of `buffer` is accepted or the stream runs out
/// of room.
pub fn write_fully(stream: &SharedStream, buffer: &[u8], offset: u64) -> FatResult {
    let mut done = 0;
    while done < buffer.len() {
        let put = stream
            .borrow_mut()
            .write(&buffer[done..], offset + done as u64)?;
        if put == 0 {
            break;
        }
        done += put;
    }
    Ok(done)
}
