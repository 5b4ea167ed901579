use alloc::collections::BTreeMap;
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::RefCell;

use crate::bpb::{BiosParamBlock, FatBits, FatGeometry, FsInfo};
use crate::buffer::BufferCache;
use crate::chain::{ChainFile, EntryLocation, FileHandle};
use crate::config::{VolumeConfig, DEFAULT_CYLINDER_SECTORS};
use crate::directory::Directory;
use crate::dirent::DirEntry;
use crate::disk::{DiskIO, DiskStream};
use crate::error::{FatError, FatResult};
use crate::interrupt::Interrupt;
use crate::stream::{flush_chain, read_fully, SharedStream, Stream};
use crate::table::{FatLayout, FatTable};

/// Largest cylinder, in sectors, taken from the boot sector geometry.
/// Hard disk images report heads x sectors in the thousands.
const MAX_CYLINDER_SECTORS: u32 = 256;

/// Key the fixed FAT12/16 root is registered under in the open-file map.
const FIXED_ROOT_KEY: u32 = 0;

/// State every open file on a volume points back to.
pub(crate) struct VolumeShared {
    /// Buffer cache stacked on the device
    pub(crate) dev: SharedStream,
    pub(crate) fat: RefCell<FatTable>,
    pub(crate) geometry: FatGeometry,
    pub(crate) config: VolumeConfig,
    pub(crate) interrupt: Interrupt,
    /// Open files by first cluster, so two opens of one chain share a
    /// handle and its in-memory size
    pub(crate) open_files: RefCell<BTreeMap<u32, Weak<RefCell<ChainFile>>>>,
}

impl VolumeShared {
    fn lookup_open(&self, key: u32) -> Option<FileHandle> {
        self.open_files.borrow().get(&key).and_then(Weak::upgrade)
    }

    fn register(&self, key: u32, handle: &FileHandle) {
        self.open_files
            .borrow_mut()
            .insert(key, Rc::downgrade(handle));
    }

    /// Start cluster recorded in an entry. Only FAT32 uses the high half.
    pub(crate) fn entry_cluster(&self, entry: &DirEntry) -> u32 {
        match self.geometry.bits {
            FatBits::Fat32 => entry.first_cluster(),
            _ => entry.first_cluster() & 0xFFFF,
        }
    }

    pub(crate) fn open_root(self: &Rc<Self>) -> FatResult<FileHandle> {
        let geometry = &self.geometry;
        let key = match geometry.bits {
            FatBits::Fat32 => geometry.root_cluster,
            _ => FIXED_ROOT_KEY,
        };
        if let Some(handle) = self.lookup_open(key) {
            return Ok(handle);
        }
        let handle = match geometry.bits {
            FatBits::Fat32 => {
                let clusters = self.fat.borrow_mut().count_chain(geometry.root_cluster)?;
                let size = clusters as u64 * geometry.cluster_bytes() as u64;
                ChainFile::chain(self.clone(), geometry.root_cluster, size, true, None)
            }
            _ => {
                let sector_size = geometry.sector_size as u64;
                ChainFile::fixed_root(
                    self.clone(),
                    geometry.dir_start as u64 * sector_size,
                    geometry.dir_len as u64 * sector_size,
                )
            }
        };
        self.register(key, &handle);
        Ok(handle)
    }

    /// Open the file or directory an entry describes. Opening a chain that
    /// is already open returns the existing handle.
    pub(crate) fn open_by_entry(
        self: &Rc<Self>,
        entry: &DirEntry,
        location: Option<EntryLocation>,
    ) -> FatResult<FileHandle> {
        let first = self.entry_cluster(entry);
        if first >= 2 {
            if let Some(handle) = self.lookup_open(first) {
                return Ok(handle);
            }
        }
        let mut fat = self.fat.borrow_mut();
        if first != 0 && !fat.is_valid_cluster(first) {
            log::warn!("entry {:?} starts at invalid cluster {}", entry.get_full_name(), first);
            return Err(FatError::Corrupt("start cluster out of range"));
        }
        let directory = entry.is_directory();
        let size = if directory {
            if first >= 2 {
                fat.count_chain(first)? as u64 * fat.cluster_bytes() as u64
            } else {
                0
            }
        } else {
            entry.size() as u64
        };
        drop(fat);

        let handle = ChainFile::chain(
            self.clone(),
            first,
            size,
            directory,
            location.map(|location| (location, *entry)),
        );
        if first >= 2 {
            self.register(first, &handle);
        }
        Ok(handle)
    }

    fn open_handles(&self) -> Vec<FileHandle> {
        self.open_files
            .borrow()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub(crate) fn flush(&self) -> FatResult<()> {
        for handle in self.open_handles() {
            handle.borrow_mut().flush()?;
        }
        self.fat.borrow_mut().flush()?;
        flush_chain(&self.dev)
    }
}

impl Drop for VolumeShared {
    fn drop(&mut self) {
        // Every handle is gone by now, so only the FAT and the buffer remain.
        if let Err(e) = self.flush() {
            log::error!("lost FAT updates on unmount: {}", e);
        }
    }
}

/// A mounted FAT volume.
///
/// Mounting reads the boot sector, stacks a buffer cache on the device and
/// sets up the allocation table. Directory and file handles keep the
/// volume alive; `close` (or `flush`) makes every change durable.
pub struct Volume {
    shared: Rc<VolumeShared>,
}

impl Volume {
    pub fn mount<D: DiskIO + 'static>(disk: D, config: VolumeConfig) -> FatResult<Self> {
        let device: SharedStream = Rc::new(RefCell::new(DiskStream::new(disk)));
        Self::mount_stream(device, config)
    }

    /// Mount a volume on an existing stream chain.
    pub fn mount_stream(device: SharedStream, config: VolumeConfig) -> FatResult<Self> {
        let mut boot = [0u8; 512];
        if read_fully(&device, &mut boot, 0)? < boot.len() {
            log::warn!("device too small for a boot sector");
            return Err(FatError::InvalidBootSector);
        }
        let bpb = BiosParamBlock::parse(&boot)?;
        let geometry = FatGeometry::from_bpb(&bpb)?;
        log::info!(
            "mounting {:?} volume: {} clusters of {} bytes",
            geometry.bits,
            geometry.num_clus,
            geometry.cluster_bytes(),
        );

        let cylinder_sectors = config
            .cylinder_sectors
            .or(geometry
                .cylinder_sectors
                .filter(|&sectors| sectors <= MAX_CYLINDER_SECTORS))
            .filter(|&sectors| sectors > 0)
            .unwrap_or(DEFAULT_CYLINDER_SECTORS);
        let sector_size = geometry.sector_size as usize;
        let cylinder_size = cylinder_sectors as usize * sector_size;
        let buffer = BufferCache::attach(
            device,
            cylinder_size * config.buffer_cylinders.max(1) as usize,
            cylinder_size,
            sector_size,
        );

        let interrupt = Interrupt::new();
        let mut fat = FatTable::new(
            buffer.clone(),
            FatLayout::from(&geometry),
            &config,
            interrupt.clone(),
        );
        if let (FatBits::Fat32, Some(sector)) = (geometry.bits, geometry.info_sector) {
            let mut raw = alloc::vec![0u8; sector_size.max(512)];
            read_fully(&buffer, &mut raw, sector as u64 * sector_size as u64)?;
            match FsInfo::parse(&raw) {
                Some(info) => fat.apply_info(info),
                None => log::debug!("info sector {} carries no valid signature", sector),
            }
        }

        Ok(Self {
            shared: Rc::new(VolumeShared {
                dev: buffer,
                fat: RefCell::new(fat),
                geometry,
                config,
                interrupt,
                open_files: RefCell::new(BTreeMap::new()),
            }),
        })
    }

    pub fn geometry(&self) -> &FatGeometry {
        &self.shared.geometry
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.shared.config
    }

    /// Flag that aborts long operations on this volume when raised.
    pub fn interrupt(&self) -> Interrupt {
        self.shared.interrupt.clone()
    }

    /// The buffered device stream.
    pub fn device(&self) -> SharedStream {
        self.shared.dev.clone()
    }

    pub fn open_root(&self) -> FatResult<FileHandle> {
        self.shared.open_root()
    }

    pub fn root_directory(&self) -> FatResult<Directory> {
        let handle = self.open_root()?;
        Ok(Directory::new(self.shared.clone(), handle))
    }

    /// Open a file from a directory entry. With a location, size and start
    /// cluster changes are written back to that slot.
    pub fn open_by_entry(
        &self,
        entry: &DirEntry,
        location: Option<EntryLocation>,
    ) -> FatResult<FileHandle> {
        self.shared.open_by_entry(entry, location)
    }

    /// Free clusters not reserved by open files. Counts the table on first
    /// use unless an info sector supplied the number.
    pub fn free_clusters(&self) -> FatResult<u32> {
        self.shared.fat.borrow_mut().free_clusters()
    }

    pub fn free_bytes(&self) -> FatResult<u64> {
        Ok(self.free_clusters()? as u64 * self.shared.geometry.cluster_bytes() as u64)
    }

    pub fn ensure_free_space(&self, clusters: u32) -> FatResult<()> {
        self.shared.fat.borrow_mut().ensure_free_space(clusters)
    }

    pub fn count_allocated_clusters(&self, start: u32) -> FatResult<u32> {
        self.shared.fat.borrow_mut().count_chain(start)
    }

    /// Write back open files' directory entries, the FAT and every dirty
    /// buffer down to the device.
    pub fn flush(&self) -> FatResult<()> {
        self.shared.flush()
    }

    pub fn close(self) -> FatResult<()> {
        self.flush()?;
        log::debug!(
            "closed volume with {} decode errors",
            self.shared.fat.borrow().decode_errors()
        );
        Ok(())
    }
}
