use alloc::rc::{Rc, Weak};
use core::cell::RefCell;

use crate::dircache::DirectorySlotCache;
use crate::dirent::{DirEntry, DIR_ENTRY_SIZE};
use crate::error::{FatError, FatResult};
use crate::stream::{flush_chain, write_fully, SharedStream, Stream, StreamInfo, StreamKind};
use crate::table::{FatTable, LoopGuard};
use crate::volume::VolumeShared;

/// An open file or directory. Handles on the same chain are shared.
pub type FileHandle = Rc<RefCell<ChainFile>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapMode {
    Read,
    Write,
}

/// A run of the file that is contiguous on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    /// Byte offset on the device
    pub offset: u64,
    pub len: usize,
}

/// The directory slot a file's size and start cluster are written back to.
#[derive(Clone)]
pub struct EntryLocation {
    pub dir: SharedStream,
    pub slot: u32,
}

#[derive(Clone, Copy, Debug)]
enum Layout {
    /// Ordinary cluster chain
    Chain,
    /// FAT12/16 root directory at a fixed device range
    FixedRoot { offset: u64, len: u64 },
}

/// Maps a file's byte offsets onto the device by walking its cluster
/// chain, allocating clusters as writes run past the end.
///
/// The last (relative, absolute) cluster pair the walk landed on is kept,
/// so sequential access resumes where it left off instead of walking the
/// chain from the start each time.
pub struct ChainFile {
    volume: Rc<VolumeShared>,
    this: Weak<RefCell<ChainFile>>,
    layout: Layout,
    /// Below 2 while nothing is allocated
    first_cluster: u32,
    size: u64,
    directory: bool,
    previous: Option<(u32, u32)>,
    guard: LoopGuard,
    /// Clusters promised by `preallocate` and not yet allocated
    reserved: u32,
    location: Option<EntryLocation>,
    entry: DirEntry,
    entry_dirty: bool,
    released: bool,
    /// Shared by every `Directory` opened over this chain
    slots: Option<Rc<RefCell<DirectorySlotCache>>>,
}

fn clusters_for(bytes: u64, cluster_bytes: u64) -> u64 {
    (bytes + cluster_bytes - 1) / cluster_bytes
}

impl ChainFile {
    pub(crate) fn fixed_root(volume: Rc<VolumeShared>, offset: u64, len: u64) -> FileHandle {
        Rc::new_cyclic(|this| {
            RefCell::new(Self {
                volume,
                this: this.clone(),
                layout: Layout::FixedRoot { offset, len },
                first_cluster: 0,
                size: len,
                directory: true,
                previous: None,
                guard: LoopGuard::default(),
                reserved: 0,
                location: None,
                entry: DirEntry::new(),
                entry_dirty: false,
                released: false,
                slots: None,
            })
        })
    }

    pub(crate) fn chain(
        volume: Rc<VolumeShared>,
        first_cluster: u32,
        size: u64,
        directory: bool,
        location: Option<(EntryLocation, DirEntry)>,
    ) -> FileHandle {
        let (location, entry) = match location {
            Some((location, entry)) => (Some(location), entry),
            None => (None, DirEntry::new()),
        };
        Rc::new_cyclic(|this| {
            RefCell::new(Self {
                volume,
                this: this.clone(),
                layout: Layout::Chain,
                first_cluster,
                size,
                directory,
                previous: None,
                guard: LoopGuard::default(),
                reserved: 0,
                location,
                entry,
                entry_dirty: false,
                released: false,
                slots: None,
            })
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn first_cluster(&self) -> Option<u32> {
        if self.first_cluster >= 2 {
            Some(self.first_cluster)
        } else {
            None
        }
    }

    pub fn is_directory(&self) -> bool {
        self.directory
    }

    pub fn is_fixed_root(&self) -> bool {
        matches!(self.layout, Layout::FixedRoot { .. })
    }

    /// Snapshot of the directory entry this file writes back to.
    pub fn entry(&self) -> Option<&DirEntry> {
        self.location.as_ref().map(|_| &self.entry)
    }

    /// The directory slot cache, created on first use and dropped with
    /// the last handle.
    pub(crate) fn slot_cache(&mut self) -> Rc<RefCell<DirectorySlotCache>> {
        self.slots
            .get_or_insert_with(|| Rc::new(RefCell::new(DirectorySlotCache::new())))
            .clone()
    }

    fn consume_reservation(&mut self, fat: &mut FatTable) {
        if self.reserved > 0 {
            self.reserved -= 1;
            fat.unreserve(1);
        }
    }

    fn set_first_cluster(&mut self, cluster: u32) {
        self.first_cluster = cluster;
        self.entry_dirty = true;
        self.volume
            .open_files
            .borrow_mut()
            .insert(cluster, self.this.clone());
    }

    /// Device extent backing `len` bytes at `pos`, clamped to the longest
    /// physically contiguous run. Writing may allocate; reading past the
    /// end of the chain yields `None`.
    pub fn map(&mut self, pos: u64, len: usize, mode: MapMode) -> FatResult<Option<Extent>> {
        if len == 0 {
            return Ok(None);
        }
        match self.layout {
            Layout::FixedRoot { offset, len: root_len } => {
                if pos >= root_len {
                    return match mode {
                        MapMode::Read => Ok(None),
                        MapMode::Write => Err(FatError::DirectoryFull),
                    };
                }
                let len = (len as u64).min(root_len - pos) as usize;
                Ok(Some(Extent {
                    offset: offset + pos,
                    len,
                }))
            }
            Layout::Chain => self.map_chain(pos, len, mode),
        }
    }

    fn map_chain(&mut self, pos: u64, len: usize, mode: MapMode) -> FatResult<Option<Extent>> {
        let volume = self.volume.clone();
        let mut fat = volume.fat.borrow_mut();
        let cluster_bytes = fat.cluster_bytes() as u64;
        let offset = pos % cluster_bytes;
        let rel = (pos / cluster_bytes) as u32;

        if self.first_cluster < 2 {
            if mode == MapMode::Read {
                return Ok(None);
            }
            let hint = fat.allocation_hint();
            let first = fat.next_free_cluster(hint)?;
            fat.allocate(first)?;
            self.consume_reservation(&mut fat);
            self.set_first_cluster(first);
            self.previous = Some((0, first));
        }

        let span = ((offset + len as u64 - 1) / cluster_bytes) as u32;
        let (mut cur, mut abs) = match self.previous {
            Some((prev_rel, prev_abs)) if prev_rel <= rel => (prev_rel, prev_abs),
            _ => {
                self.guard.reset();
                (0, self.first_cluster)
            }
        };

        loop {
            volume.interrupt.check()?;
            if cur == rel {
                self.previous = Some((cur, abs));
            }
            let mut next = fat.decode(abs)?;
            if next < 2 {
                log::error!("cluster {} inside a chain is marked free", abs);
                return Err(FatError::Corrupt("free cluster inside chain"));
            }
            if cur == rel + span {
                break;
            }
            if fat.is_end(next) && mode == MapMode::Write {
                let new = fat.next_free_cluster(abs)?;
                fat.append(abs, new)?;
                self.consume_reservation(&mut fat);
                next = new;
            }
            if fat.is_end(next) {
                if cur < rel {
                    return Ok(None);
                }
                break;
            }
            if !fat.is_valid_cluster(next) {
                log::error!("cluster {} links to out-of-range cluster {:#x}", abs, next);
                return Err(FatError::Corrupt("cluster number out of range"));
            }
            if cur >= rel && next != abs + 1 {
                break;
            }
            cur += 1;
            abs = next;
            self.guard.check(cur, abs)?;
        }

        let start = match self.previous {
            Some((_, start)) => start,
            None => return Ok(None),
        };
        let run = (cur - rel + 1) as u64 * cluster_bytes - offset;
        let mut len = (len as u64).min(run);
        if volume.config.batch && mode == MapMode::Write && pos + len >= self.size {
            let end = pos + len;
            len += clusters_for(end, cluster_bytes) * cluster_bytes - end;
        }
        Ok(Some(Extent {
            offset: fat.cluster_offset(start) + offset,
            len: len as usize,
        }))
    }

    /// Write the start cluster, size and modification time back to the
    /// directory entry, if anything changed.
    fn write_back_entry(&mut self) -> FatResult<()> {
        if !self.entry_dirty {
            return Ok(());
        }
        let location = match &self.location {
            Some(location) => location.clone(),
            None => {
                self.entry_dirty = false;
                return Ok(());
            }
        };
        let first = if self.first_cluster >= 2 { self.first_cluster } else { 0 };
        self.entry.set_first_cluster(first);
        if !self.directory {
            self.entry.set_size(self.size as u32);
        }
        self.entry
            .set_modification_timestamp((self.volume.config.clock)());
        let offset = location.slot as u64 * DIR_ENTRY_SIZE as u64;
        let written = write_fully(&location.dir, self.entry.as_bytes(), offset)?;
        if written != DIR_ENTRY_SIZE {
            return Err(FatError::Io);
        }
        self.entry_dirty = false;
        Ok(())
    }

    fn forget(&self) {
        if let Ok(mut open) = self.volume.open_files.try_borrow_mut() {
            let ours = open
                .get(&self.first_cluster)
                .map_or(false, |weak| Weak::ptr_eq(weak, &self.this));
            if ours {
                open.remove(&self.first_cluster);
            }
        }
    }

    fn teardown(&mut self) -> FatResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let result = self.write_back_entry();
        if self.reserved > 0 {
            if let Ok(mut fat) = self.volume.fat.try_borrow_mut() {
                fat.unreserve(self.reserved);
            }
            self.reserved = 0;
        }
        self.forget();
        result
    }
}

impl Stream for ChainFile {
    fn next(&self) -> Option<&SharedStream> {
        Some(&self.volume.dev)
    }

    fn read(&mut self, buffer: &mut [u8], offset: u64) -> FatResult {
        if offset >= self.size || buffer.is_empty() {
            return Ok(0);
        }
        let len = (buffer.len() as u64).min(self.size - offset) as usize;
        let extent = match self.map(offset, len, MapMode::Read)? {
            Some(extent) => extent,
            None => return Ok(0),
        };
        let len = extent.len.min(len);
        self.volume
            .dev
            .borrow_mut()
            .read(&mut buffer[..len], extent.offset)
    }

    fn write(&mut self, buffer: &[u8], offset: u64) -> FatResult {
        let mut len = buffer.len();
        if !self.directory {
            // Sizes are 32 bits on disk.
            let room = (u32::MAX as u64).saturating_sub(offset);
            if room == 0 && len > 0 {
                return Err(FatError::NoSpace);
            }
            len = (len as u64).min(room) as usize;
        }
        let extent = match self.map(offset, len, MapMode::Write)? {
            Some(extent) => extent,
            None => return Ok(0),
        };
        let written = if extent.len > len {
            // Batch round-up: the tail past end of file goes out as zeroes,
            // so the buffer sees whole sectors and skips reading them.
            let mut padded = alloc::vec![0u8; extent.len];
            padded[..len].copy_from_slice(&buffer[..len]);
            let put = self.volume.dev.borrow_mut().write(&padded, extent.offset)?;
            put.min(len)
        } else {
            self.volume
                .dev
                .borrow_mut()
                .write(&buffer[..extent.len], extent.offset)?
        };
        let end = offset + written as u64;
        if end > self.size {
            self.size = end;
        }
        if !self.directory && written > 0 {
            self.entry_dirty = true;
        }
        Ok(written)
    }

    fn flush(&mut self) -> FatResult<()> {
        self.write_back_entry()
    }

    fn describe(&self) -> FatResult<StreamInfo> {
        Ok(StreamInfo {
            size: Some(self.size),
            kind: if self.directory {
                StreamKind::Directory
            } else {
                StreamKind::File
            },
            modified: self
                .location
                .as_ref()
                .map(|_| self.entry.get_modification_timestamp()),
        })
    }

    fn can_preallocate(&self) -> bool {
        true
    }

    /// Reserve enough free clusters for the file to grow to `size` bytes.
    fn preallocate(&mut self, size: u64) -> FatResult<()> {
        if let Layout::FixedRoot { len, .. } = self.layout {
            return if size <= len {
                Ok(())
            } else {
                Err(FatError::DirectoryFull)
            };
        }
        let mut fat = self.volume.fat.borrow_mut();
        let cluster_bytes = fat.cluster_bytes() as u64;
        let have = clusters_for(self.size, cluster_bytes) as u32 + self.reserved;
        let want = clusters_for(size, cluster_bytes) as u32;
        if want <= have {
            return Ok(());
        }
        let extra = want - have;
        fat.ensure_free_space(extra)?;
        fat.reserve(extra);
        self.reserved += extra;
        Ok(())
    }

    fn release(&mut self) -> FatResult<()> {
        self.teardown()?;
        if !self.volume.config.batch {
            flush_chain(&self.volume.dev)?;
        }
        Ok(())
    }
}

impl Drop for ChainFile {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log::error!("could not update directory entry on close: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::bpb::{BiosParamBlock, BOOT_SIGNATURE};
    use crate::config::VolumeConfig;
    use crate::disk::MemoryDisk;
    use crate::volume::Volume;

    fn floppy(config: VolumeConfig) -> Volume {
        Volume::mount(MemoryDisk::from_bytes(floppy_image()), config).unwrap()
    }

    pub(crate) fn floppy_image() -> Vec<u8> {
        let mut image = alloc::vec![0u8; 2880 * 512];
        let bpb = BiosParamBlock {
            bytes_per_sector: 512,
            sectors_per_cluster: 1,
            reserved_sectors: 1,
            fat_count: 2,
            root_directory_entries: 224,
            total_sectors: 2880,
            media_descriptor: 0xF0,
            sectors_per_fat: 9,
            sectors_per_track: 18,
            heads: 2,
            signature: BOOT_SIGNATURE,
            ..BiosParamBlock::default()
        };
        bpb.write_to(&mut image[..512]);
        image[512..515].copy_from_slice(&[0xF0, 0xFF, 0xFF]);
        image
    }

    const DATA_START: u64 = 33 * 512;

    #[test]
    fn fixed_root_is_a_flat_range() {
        let volume = floppy(VolumeConfig::default());
        let root = volume.open_root().unwrap();
        let mut root = root.borrow_mut();
        assert!(root.is_fixed_root());
        assert_eq!(
            root.map(0, 100, MapMode::Read).unwrap(),
            Some(Extent { offset: 19 * 512, len: 100 })
        );
        let end = 224 * 32;
        assert_eq!(root.map(end - 10, 100, MapMode::Write).unwrap().map(|e| e.len), Some(10));
        assert_eq!(root.map(end, 1, MapMode::Read).unwrap(), None);
        assert_eq!(root.map(end, 1, MapMode::Write).unwrap_err(), FatError::DirectoryFull);
    }

    #[test]
    fn first_write_allocates() {
        let volume = floppy(VolumeConfig::default());
        let handle = volume.open_by_entry(&DirEntry::new(), None).unwrap();
        let mut file = handle.borrow_mut();
        assert_eq!(file.map(0, 10, MapMode::Read).unwrap(), None);
        assert_eq!(
            file.map(0, 10, MapMode::Write).unwrap(),
            Some(Extent { offset: DATA_START, len: 10 })
        );
        assert_eq!(file.first_cluster(), Some(2));
    }

    #[test]
    fn extents_follow_contiguous_runs() {
        let volume = floppy(VolumeConfig::default());
        let handle = volume.open_by_entry(&DirEntry::new(), None).unwrap();
        let mut file = handle.borrow_mut();
        let extent = file.map(0, 3 * 512, MapMode::Write).unwrap().unwrap();
        assert_eq!(extent, Extent { offset: DATA_START, len: 3 * 512 });

        assert_eq!(
            file.map(100, 5000, MapMode::Read).unwrap(),
            Some(Extent { offset: DATA_START + 100, len: 3 * 512 - 100 })
        );
        // Resumes from the cached chain position.
        assert_eq!(
            file.map(2 * 512 + 1, 1, MapMode::Read).unwrap(),
            Some(Extent { offset: DATA_START + 2 * 512 + 1, len: 1 })
        );
        assert_eq!(file.map(3 * 512, 10, MapMode::Read).unwrap(), None);
    }

    #[test]
    fn batch_writes_round_up_to_the_cluster() {
        let volume = floppy(VolumeConfig::batch());
        let handle = volume.open_by_entry(&DirEntry::new(), None).unwrap();
        let mut file = handle.borrow_mut();
        let extent = file.map(0, 100, MapMode::Write).unwrap().unwrap();
        assert_eq!(extent.len, 512);
        let written = file.write(&[7u8; 100], 0).unwrap();
        assert_eq!(written, 100);
        assert_eq!(file.size(), 100);
    }

    #[test]
    fn batch_writes_zero_the_cluster_tail() {
        for (config, tail) in [(VolumeConfig::batch(), 0u8), (VolumeConfig::default(), 0xEE)] {
            let mut image = floppy_image();
            image[DATA_START as usize..].fill(0xEE);
            let disk = MemoryDisk::from_bytes(image);
            let volume = Volume::mount(disk.clone(), config).unwrap();
            let handle = volume.open_by_entry(&DirEntry::new(), None).unwrap();
            assert_eq!(handle.borrow_mut().write(&[7u8; 100], 0).unwrap(), 100);
            assert_eq!(handle.borrow().size(), 100);
            drop(handle);
            volume.close().unwrap();

            let image = disk.snapshot();
            let data = DATA_START as usize;
            assert_eq!(&image[data..data + 100], &[7u8; 100]);
            assert!(image[data + 100..data + 512].iter().all(|&b| b == tail));
        }
    }

    #[test]
    fn preallocation_is_returned_on_release() {
        let volume = floppy(VolumeConfig::default());
        let handle = volume.open_by_entry(&DirEntry::new(), None).unwrap();
        handle.borrow_mut().preallocate(4 * 512).unwrap();
        assert_eq!(volume.free_clusters().unwrap(), 2847 - 4);
        handle.borrow_mut().release().unwrap();
        assert_eq!(volume.free_clusters().unwrap(), 2847);
    }
}
