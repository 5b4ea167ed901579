use alloc::vec::Vec;

use byteorder::{ByteOrder, LittleEndian};

use crate::bpb::{FatBits, FatGeometry, FsInfo};
use crate::config::VolumeConfig;
use crate::error::{FatError, FatResult};
use crate::interrupt::Interrupt;
use crate::stream::{read_fully, write_fully, SharedStream};

/// FAT sectors tracked per cache group, one bit each in the group masks.
const SECTORS_PER_GROUP: u32 = 64;

/// How often long scans poll the interrupt flag.
const POLL_INTERVAL: u32 = 1024;

/// The part of the volume layout the allocation table needs.
#[derive(Clone, Copy, Debug)]
pub struct FatLayout {
    pub bits: FatBits,
    pub sector_size: u32,
    pub fat_start: u32,
    pub fat_len: u32,
    pub num_fats: u32,
    pub num_clus: u32,
    pub cluster_sectors: u32,
    pub clus_start: u32,
    pub active_fat: u32,
    pub mirrored: bool,
    pub info_sector: Option<u32>,
}

impl From<&FatGeometry> for FatLayout {
    fn from(geometry: &FatGeometry) -> Self {
        Self {
            bits: geometry.bits,
            sector_size: geometry.sector_size,
            fat_start: geometry.fat_start,
            fat_len: geometry.fat_len,
            num_fats: geometry.num_fats,
            num_clus: geometry.num_clus,
            cluster_sectors: geometry.cluster_sectors,
            clus_start: geometry.clus_start,
            active_fat: geometry.active_fat,
            mirrored: geometry.mirrored,
            info_sector: geometry.info_sector,
        }
    }
}

struct SectorGroup {
    data: Vec<u8>,
    valid: u64,
    dirty: u64,
}

/// Chain-walk loop detector. Every time the walk doubles its distance from
/// the last checkpoint, the checkpoint moves forward; meeting the
/// checkpoint cluster again at a different chain index means a cycle.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoopGuard {
    rel: u32,
    abs: u32,
}

impl LoopGuard {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn check(&mut self, rel: u32, abs: u32) -> FatResult<()> {
        if abs == self.abs && rel != self.rel {
            log::error!("loop in cluster chain at cluster {}", abs);
            return Err(FatError::LoopDetected);
        }
        if rel >= 2 * self.rel {
            self.rel = rel;
            self.abs = abs;
        }
        Ok(())
    }
}

/// In-memory view of the file allocation table.
///
/// FAT sectors are loaded lazily from whichever on-disk copy reads
/// cleanly, mutated in memory, and written back to every copy (or just the
/// active one) on `flush`. All link changes go through `set`, which keeps
/// the free-cluster counter in step with the table.
pub struct FatTable {
    dev: SharedStream,
    layout: FatLayout,
    /// Lowest value of the bad/end-of-chain family
    last_fat: u32,
    /// Value written to terminate a chain
    end_fat: u32,
    groups: Vec<Option<SectorGroup>>,
    free_count: Option<u32>,
    reserved: u32,
    last_allocated: u32,
    /// Copy that had to stand in for an unreadable active copy
    fallback_copy: Option<u32>,
    /// Sectors no copy could supply
    load_errors: u32,
    /// Out-of-range values seen while decoding
    decode_errors: u32,
    readahead: u32,
    interrupt: Interrupt,
}

impl FatTable {
    pub fn new(
        dev: SharedStream,
        layout: FatLayout,
        config: &VolumeConfig,
        interrupt: Interrupt,
    ) -> Self {
        let mut layout = layout;
        layout.mirrored &= config.mirror_fat;
        let (last_fat, end_fat) = match layout.bits {
            FatBits::Fat12 => (0xFF7, 0xFFF),
            FatBits::Fat16 => (0xFFF7, 0xFFFF),
            FatBits::Fat32 => (0x0FFF_FFF7, 0x0FFF_FFFF),
        };
        let group_count = (layout.fat_len + SECTORS_PER_GROUP - 1) / SECTORS_PER_GROUP;
        let mut groups = Vec::with_capacity(group_count as usize);
        groups.resize_with(group_count as usize, || None);
        Self {
            dev,
            layout,
            last_fat,
            end_fat,
            groups,
            free_count: None,
            reserved: 0,
            last_allocated: 1,
            fallback_copy: None,
            load_errors: 0,
            decode_errors: 0,
            readahead: config.fat_readahead(),
            interrupt,
        }
    }

    pub fn layout(&self) -> &FatLayout {
        &self.layout
    }

    pub fn num_clusters(&self) -> u32 {
        self.layout.num_clus
    }

    pub fn end_marker(&self) -> u32 {
        self.end_fat
    }

    /// True for the bad-cluster marker and every end-of-chain value.
    pub fn is_end(&self, value: u32) -> bool {
        value >= self.last_fat
    }

    pub fn cluster_bytes(&self) -> u32 {
        self.layout.cluster_sectors * self.layout.sector_size
    }

    /// Byte offset of a data cluster on the device.
    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        let sector = self.layout.clus_start as u64
            + (cluster as u64 - 2) * self.layout.cluster_sectors as u64;
        sector * self.layout.sector_size as u64
    }

    pub fn is_valid_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster <= self.layout.num_clus + 1
    }

    pub fn decode_errors(&self) -> u32 {
        self.decode_errors
    }

    /// Seed the counters from a FAT32 info sector.
    pub fn apply_info(&mut self, info: FsInfo) {
        if let Some(free) = info.free_clusters {
            if free <= self.layout.num_clus {
                self.free_count = Some(free);
            } else {
                log::debug!("ignoring info sector free count {}", free);
            }
        }
        if let Some(next) = info.next_free {
            if self.is_valid_cluster(next) {
                self.last_allocated = next;
            }
        }
    }

    fn is_loaded(&self, sector: u32) -> bool {
        let group = (sector / SECTORS_PER_GROUP) as usize;
        let bit = 1u64 << (sector % SECTORS_PER_GROUP);
        match &self.groups[group] {
            Some(group) => group.valid & bit != 0,
            None => false,
        }
    }

    fn group_mut(&mut self, sector: u32) -> &mut SectorGroup {
        let group_bytes = (SECTORS_PER_GROUP * self.layout.sector_size) as usize;
        self.groups[(sector / SECTORS_PER_GROUP) as usize].get_or_insert_with(|| SectorGroup {
            data: alloc::vec![0; group_bytes],
            valid: 0,
            dirty: 0,
        })
    }

    /// Copy order for loads: the active copy first, then the rest.
    fn copy_order(&self) -> impl Iterator<Item = u32> {
        let active = self.layout.active_fat;
        core::iter::once(active).chain((0..self.layout.num_fats).filter(move |&c| c != active))
    }

    fn copy_offset(&self, copy: u32, sector: u32) -> u64 {
        let lba = self.layout.fat_start + copy * self.layout.fat_len + sector;
        lba as u64 * self.layout.sector_size as u64
    }

    /// Read `count` sectors of one copy, returning how many arrived whole.
    fn read_copy(&self, copy: u32, sector: u32, staging: &mut [u8]) -> u32 {
        let size = self.layout.sector_size as usize;
        match read_fully(&self.dev, staging, self.copy_offset(copy, sector)) {
            Ok(got) => (got / size) as u32,
            Err(e) => {
                log::debug!("FAT copy {} sector {} unreadable: {}", copy, sector, e);
                0
            }
        }
    }

    fn load(&mut self, sector: u32) -> FatResult<()> {
        if self.is_loaded(sector) {
            return Ok(());
        }
        // Read ahead, stopping at the first sector already in memory.
        let mut count = 1;
        while count <= self.readahead
            && sector + count < self.layout.fat_len
            && !self.is_loaded(sector + count)
        {
            count += 1;
        }

        let size = self.layout.sector_size as usize;
        let mut staging = alloc::vec![0u8; count as usize * size];
        let copies: Vec<u32> = self.copy_order().collect();
        let mut loaded = 0;
        for copy in copies {
            loaded = self.read_copy(copy, sector, &mut staging);
            if loaded == 0 && count > 1 {
                loaded = self.read_copy(copy, sector, &mut staging[..size]);
            }
            if loaded > 0 {
                if copy != self.layout.active_fat {
                    log::warn!("FAT sector {} loaded from copy {}", sector, copy);
                    self.fallback_copy.get_or_insert(copy);
                }
                break;
            }
        }
        if loaded == 0 {
            self.load_errors += 1;
            log::error!("no FAT copy could supply sector {}", sector);
            return Err(FatError::Io);
        }

        for i in 0..loaded {
            let current = sector + i;
            if self.is_loaded(current) {
                continue;
            }
            let within = (current % SECTORS_PER_GROUP) as usize;
            let group = self.group_mut(current);
            group.data[within * size..(within + 1) * size]
                .copy_from_slice(&staging[i as usize * size..(i as usize + 1) * size]);
            group.valid |= 1 << within;
        }
        Ok(())
    }

    fn byte_location(&self, byte: u32) -> (u32, usize) {
        let size = self.layout.sector_size;
        (byte / size, (byte % size) as usize)
    }

    fn read_byte(&mut self, byte: u32) -> FatResult<u8> {
        let (sector, within) = self.byte_location(byte);
        self.load(sector)?;
        let size = self.layout.sector_size as usize;
        let slot = (sector % SECTORS_PER_GROUP) as usize;
        let group = self.group_mut(sector);
        Ok(group.data[slot * size + within])
    }

    fn write_byte(&mut self, byte: u32, value: u8) -> FatResult<()> {
        let (sector, within) = self.byte_location(byte);
        self.load(sector)?;
        let size = self.layout.sector_size as usize;
        let slot = (sector % SECTORS_PER_GROUP) as usize;
        let group = self.group_mut(sector);
        group.data[slot * size + within] = value;
        group.dirty |= 1 << slot;
        Ok(())
    }

    fn read_bytes<const N: usize>(&mut self, byte: u32) -> FatResult<[u8; N]> {
        let mut out = [0u8; N];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.read_byte(byte + i as u32)?;
        }
        Ok(out)
    }

    fn write_bytes(&mut self, byte: u32, bytes: &[u8]) -> FatResult<()> {
        for (i, b) in bytes.iter().enumerate() {
            self.write_byte(byte + i as u32, *b)?;
        }
        Ok(())
    }

    /// Raw entry value, with no range checking of the result.
    fn raw_get(&mut self, cluster: u32) -> FatResult<u32> {
        match self.layout.bits {
            FatBits::Fat12 => {
                let byte = cluster + cluster / 2;
                let pair = LittleEndian::read_u16(&self.read_bytes::<2>(byte)?);
                Ok(if cluster & 1 == 0 {
                    (pair & 0xFFF) as u32
                } else {
                    (pair >> 4) as u32
                })
            }
            FatBits::Fat16 => Ok(LittleEndian::read_u16(&self.read_bytes::<2>(cluster * 2)?) as u32),
            FatBits::Fat32 => {
                Ok(LittleEndian::read_u32(&self.read_bytes::<4>(cluster * 4)?) & 0x0FFF_FFFF)
            }
        }
    }

    fn raw_put(&mut self, cluster: u32, value: u32) -> FatResult<()> {
        match self.layout.bits {
            FatBits::Fat12 => {
                let byte = cluster + cluster / 2;
                let mut pair = LittleEndian::read_u16(&self.read_bytes::<2>(byte)?);
                let value = (value & 0xFFF) as u16;
                pair = if cluster & 1 == 0 {
                    (pair & 0xF000) | value
                } else {
                    (pair & 0x000F) | (value << 4)
                };
                let mut bytes = [0u8; 2];
                LittleEndian::write_u16(&mut bytes, pair);
                self.write_bytes(byte, &bytes)
            }
            FatBits::Fat16 => {
                let mut bytes = [0u8; 2];
                LittleEndian::write_u16(&mut bytes, value as u16);
                self.write_bytes(cluster * 2, &bytes)
            }
            FatBits::Fat32 => {
                let old = LittleEndian::read_u32(&self.read_bytes::<4>(cluster * 4)?);
                let mut bytes = [0u8; 4];
                LittleEndian::write_u32(&mut bytes, (old & 0xF000_0000) | (value & 0x0FFF_FFFF));
                self.write_bytes(cluster * 4, &bytes)
            }
        }
    }

    /// Value stored for `cluster`. Values that point outside the data area
    /// are returned as-is but counted as corruption.
    pub fn decode(&mut self, cluster: u32) -> FatResult<u32> {
        if cluster > self.layout.num_clus + 1 {
            return Err(FatError::InvalidArgument);
        }
        let value = self.raw_get(cluster)?;
        if value == 1 || (value > self.layout.num_clus + 1 && value < self.last_fat) {
            self.decode_errors += 1;
            log::warn!("bad FAT entry {:#x} at cluster {}", value, cluster);
        }
        Ok(value)
    }

    /// Store `value` for `cluster`, keeping the free counter exact.
    pub fn set(&mut self, cluster: u32, value: u32) -> FatResult<()> {
        if !self.is_valid_cluster(cluster) {
            log::error!("refusing to set FAT entry for cluster {}", cluster);
            return Err(FatError::InvalidArgument);
        }
        let old = self.raw_get(cluster)?;
        self.raw_put(cluster, value)?;
        if let Some(free) = self.free_count.as_mut() {
            if old == 0 && value != 0 {
                *free = free.saturating_sub(1);
            } else if old != 0 && value == 0 {
                *free += 1;
            }
        }
        Ok(())
    }

    /// Mark a free cluster as the end of a new chain.
    pub fn allocate(&mut self, cluster: u32) -> FatResult<()> {
        let end = self.end_fat;
        self.set(cluster, end)?;
        self.last_allocated = cluster;
        Ok(())
    }

    /// Terminate `new` and link `tail` to it.
    pub fn append(&mut self, tail: u32, new: u32) -> FatResult<()> {
        self.allocate(new)?;
        self.set(tail, new)
    }

    pub fn deallocate(&mut self, cluster: u32) -> FatResult<()> {
        self.set(cluster, 0)
    }

    fn poll(&self, step: u32) -> FatResult<()> {
        if step % POLL_INTERVAL == 0 {
            self.interrupt.check()?;
        }
        Ok(())
    }

    /// First free cluster after `hint`, wrapping around once.
    pub fn next_free_cluster(&mut self, hint: u32) -> FatResult<u32> {
        if self.free_count == Some(0) {
            return Err(FatError::NoSpace);
        }
        for (step, cluster) in self.clusters_after(hint).enumerate() {
            self.poll(step as u32)?;
            if self.raw_get(cluster)? == 0 {
                return Ok(cluster);
            }
        }
        // A full scan is as good as a count.
        self.free_count = Some(0);
        Err(FatError::NoSpace)
    }

    /// Cluster the next allocation should start searching from.
    pub fn allocation_hint(&self) -> u32 {
        self.last_allocated
    }

    /// Every cluster once, starting after `hint` and wrapping to 2.
    fn clusters_after(&self, hint: u32) -> impl Iterator<Item = u32> {
        let last = self.layout.num_clus + 1;
        let hint = if hint == 0 || hint > last {
            log::debug!("allocation hint {} out of range, scanning from start", hint);
            1
        } else {
            hint
        };
        (hint + 1..=last).chain(2..=hint.min(last))
    }

    /// Count free clusters, stopping early at `stop_at`. The scan starts at
    /// the allocation hint, where the next allocation will look first.
    fn scan_free(&mut self, stop_at: Option<u32>) -> FatResult<u32> {
        let mut found = 0;
        for (step, cluster) in self.clusters_after(self.last_allocated).enumerate() {
            self.poll(step as u32)?;
            if self.raw_get(cluster)? == 0 {
                found += 1;
                if stop_at == Some(found) {
                    return Ok(found);
                }
            }
        }
        self.free_count = Some(found);
        Ok(found)
    }

    /// Free clusters not promised to an open file.
    pub fn free_clusters(&mut self) -> FatResult<u32> {
        let free = match self.free_count {
            Some(free) => free,
            None => self.scan_free(None)?,
        };
        Ok(free.saturating_sub(self.reserved))
    }

    /// Succeeds once `wanted` unreserved free clusters are known to exist,
    /// without necessarily scanning the whole table.
    pub fn ensure_free_space(&mut self, wanted: u32) -> FatResult<()> {
        let needed = wanted.saturating_add(self.reserved);
        let free = match self.free_count {
            Some(free) => free,
            None => self.scan_free(Some(needed))?,
        };
        if free >= needed {
            Ok(())
        } else {
            Err(FatError::NoSpace)
        }
    }

    /// Set aside clusters for a file that announced its final size.
    pub fn reserve(&mut self, clusters: u32) {
        self.reserved += clusters;
    }

    pub fn unreserve(&mut self, clusters: u32) {
        self.reserved = self.reserved.saturating_sub(clusters);
    }

    pub fn reserved(&self) -> u32 {
        self.reserved
    }

    /// Release every cluster of the chain starting at `start`.
    pub fn free_chain(&mut self, start: u32) -> FatResult<u32> {
        let mut cluster = start;
        let mut freed = 0;
        while self.is_valid_cluster(cluster) {
            self.poll(freed + 1)?;
            let next = self.decode(cluster)?;
            if next == 0 {
                // Already free: either a cycle closing or a damaged chain.
                log::warn!("chain from {} reaches free cluster {}", start, cluster);
                break;
            }
            self.deallocate(cluster)?;
            freed += 1;
            if self.is_end(next) {
                break;
            }
            cluster = next;
        }
        Ok(freed)
    }

    /// Length in clusters of the chain starting at `start`.
    pub fn count_chain(&mut self, start: u32) -> FatResult<u32> {
        let mut guard = LoopGuard::default();
        let mut cluster = start;
        let mut count = 0;
        while self.is_valid_cluster(cluster) {
            self.poll(count + 1)?;
            count += 1;
            let next = self.decode(cluster)?;
            if next < 2 {
                return Err(FatError::Corrupt("free cluster inside chain"));
            }
            if self.is_end(next) {
                break;
            }
            if !self.is_valid_cluster(next) {
                return Err(FatError::Corrupt("cluster number out of range"));
            }
            guard.check(count, next)?;
            cluster = next;
        }
        Ok(count)
    }

    fn write_copies(&self) -> Vec<u32> {
        if let Some(copy) = self.fallback_copy {
            // Only the copy we fell back to is trustworthy.
            alloc::vec![copy]
        } else if !self.layout.mirrored {
            alloc::vec![self.layout.active_fat]
        } else {
            (0..self.layout.num_fats).collect()
        }
    }

    /// Write every dirty FAT sector to each required copy, then refresh the
    /// FAT32 info sector.
    pub fn flush(&mut self) -> FatResult<()> {
        let copies = self.write_copies();
        let size = self.layout.sector_size as usize;
        for index in 0..self.groups.len() {
            loop {
                let (first, run) = match &self.groups[index] {
                    Some(group) if group.dirty != 0 => {
                        let first = group.dirty.trailing_zeros();
                        let run = (group.dirty >> first).trailing_ones();
                        (first, run)
                    }
                    _ => break,
                };
                let sector = index as u32 * SECTORS_PER_GROUP + first;
                let start = first as usize * size;
                let end = start + run as usize * size;
                for &copy in copies.iter() {
                    let data = match &self.groups[index] {
                        Some(group) => &group.data[start..end],
                        None => break,
                    };
                    let written = write_fully(&self.dev, data, self.copy_offset(copy, sector))?;
                    if written != data.len() {
                        log::error!("short write of FAT copy {} at sector {}", copy, sector);
                        return Err(FatError::Io);
                    }
                }
                if let Some(group) = self.groups[index].as_mut() {
                    let mask = if run >= 64 { u64::MAX } else { ((1u64 << run) - 1) << first };
                    group.dirty &= !mask;
                }
            }
        }
        self.write_info_sector()
    }

    fn write_info_sector(&mut self) -> FatResult<()> {
        let sector = match (self.layout.bits, self.layout.info_sector) {
            (FatBits::Fat32, Some(sector)) => sector,
            _ => return Ok(()),
        };
        let size = self.layout.sector_size as usize;
        let offset = sector as u64 * size as u64;
        let mut raw = alloc::vec![0u8; size.max(512)];
        read_fully(&self.dev, &mut raw, offset)?;
        let info = FsInfo {
            free_clusters: self.free_count,
            next_free: Some(self.last_allocated).filter(|&c| self.is_valid_cluster(c)),
        };
        let before = raw.clone();
        info.write_to(&mut raw);
        if raw == before {
            return Ok(());
        }
        let written = write_fully(&self.dev, &raw[..size], offset)?;
        if written != size {
            return Err(FatError::Io);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::rc::Rc;
    use core::cell::RefCell;

    use super::*;
    use crate::disk::{DiskIO, DiskStream, MemoryDisk};

    fn layout(bits: FatBits, num_clus: u32) -> FatLayout {
        let width = bits.width();
        let fat_len = ((num_clus + 2) * width / 8 + 511) / 512 + 1;
        FatLayout {
            bits,
            sector_size: 512,
            fat_start: 1,
            fat_len,
            num_fats: 2,
            num_clus,
            cluster_sectors: 1,
            clus_start: 1 + 2 * fat_len,
            active_fat: 0,
            mirrored: true,
            info_sector: None,
        }
    }

    fn table(bits: FatBits, num_clus: u32) -> (MemoryDisk, FatTable) {
        let layout = layout(bits, num_clus);
        let disk = MemoryDisk::new(((1 + 2 * layout.fat_len) * 512) as usize);
        let dev: SharedStream = Rc::new(RefCell::new(DiskStream::new(disk.clone())));
        let table = FatTable::new(dev, layout, &VolumeConfig::default(), Interrupt::new());
        (disk, table)
    }

    #[test]
    fn fat12_neighbours_survive_packing() {
        let (_, mut fat) = table(FatBits::Fat12, 4084);
        for cluster in 2..40 {
            fat.set(cluster, 0xA00 + cluster).unwrap();
        }
        fat.set(17, 0x123).unwrap();
        fat.set(18, 0xFED).unwrap();
        for cluster in 2..40 {
            let expected = match cluster {
                17 => 0x123,
                18 => 0xFED,
                _ => 0xA00 + cluster,
            };
            assert_eq!(fat.raw_get(cluster).unwrap(), expected);
        }
    }

    #[test]
    fn fat12_allocate_and_release_at_the_boundary() {
        let (_, mut fat) = table(FatBits::Fat12, 4085);
        assert_eq!(fat.free_clusters().unwrap(), 4085);
        assert_eq!(fat.next_free_cluster(1).unwrap(), 2);
        fat.allocate(2).unwrap();
        let link = fat.decode(2).unwrap();
        assert!(fat.is_end(link));
        assert_eq!(fat.free_clusters().unwrap(), 4084);
        fat.deallocate(2).unwrap();
        assert_eq!(fat.decode(2).unwrap(), 0);
        assert_eq!(fat.free_clusters().unwrap(), 4085);
        // The last cluster of the table packs into the final byte pair.
        fat.allocate(4086).unwrap();
        let link = fat.raw_get(4086).unwrap();
        assert!(fat.is_end(link));
    }

    #[test]
    fn fat32_preserves_reserved_bits() {
        let (disk, mut fat) = table(FatBits::Fat32, 1000);
        let offset = 512 + 5 * 4;
        let mut dev = DiskStream::new(disk.clone());
        crate::stream::Stream::write(&mut dev, &[0, 0, 0, 0xF0], offset).unwrap();
        fat.set(5, 0x0FFF_FFFF).unwrap();
        assert_eq!(fat.decode(5).unwrap(), 0x0FFF_FFFF);
        fat.flush().unwrap();
        assert_eq!(&disk.snapshot()[offset as usize..offset as usize + 4], &[0xFF; 4]);
    }

    #[test]
    fn allocation_keeps_free_count_exact() {
        let (_, mut fat) = table(FatBits::Fat16, 5000);
        assert_eq!(fat.free_clusters().unwrap(), 5000);
        let first = fat.next_free_cluster(1).unwrap();
        fat.allocate(first).unwrap();
        let mut tail = first;
        for _ in 0..9 {
            let next = fat.next_free_cluster(tail).unwrap();
            fat.append(tail, next).unwrap();
            tail = next;
        }
        assert_eq!(fat.free_clusters().unwrap(), 4990);
        assert_eq!(fat.count_chain(first).unwrap(), 10);
        assert_eq!(fat.free_chain(first).unwrap(), 10);
        assert_eq!(fat.free_clusters().unwrap(), 5000);
        fat.free_count = None;
        assert_eq!(fat.free_clusters().unwrap(), 5000);
    }

    #[test]
    fn exhaustion_is_reported() {
        let (_, mut fat) = table(FatBits::Fat12, 10);
        for cluster in 2..12 {
            fat.allocate(cluster).unwrap();
        }
        assert_eq!(fat.next_free_cluster(5), Err(FatError::NoSpace));
        assert_eq!(fat.free_clusters().unwrap(), 0);
    }

    #[test]
    fn bad_hint_falls_back_to_start() {
        let (_, mut fat) = table(FatBits::Fat16, 5000);
        assert_eq!(fat.next_free_cluster(999_999).unwrap(), 2);
    }

    #[test]
    fn ensure_free_space_honours_reservations() {
        let (_, mut fat) = table(FatBits::Fat12, 10);
        fat.ensure_free_space(10).unwrap();
        fat.reserve(4);
        assert_eq!(fat.ensure_free_space(7), Err(FatError::NoSpace));
        fat.unreserve(4);
        fat.ensure_free_space(7).unwrap();
    }

    #[test]
    fn bounded_free_scan_starts_at_the_hint() {
        let (_, mut fat) = table(FatBits::Fat16, 5000);
        fat.last_allocated = 4000;
        fat.ensure_free_space(10).unwrap();
        // Cluster 4001 lives in FAT sector 15.
        assert!(fat.is_loaded(15));
        assert!(!fat.is_loaded(0));
        assert_eq!(fat.next_free_cluster(4000), Ok(4001));
    }

    #[test]
    fn flush_writes_both_copies() {
        let (disk, mut fat) = table(FatBits::Fat16, 5000);
        fat.allocate(2).unwrap();
        fat.flush().unwrap();
        let image = disk.snapshot();
        let copy_len = fat.layout.fat_len as usize * 512;
        assert_eq!(&image[512 + 4..512 + 6], &[0xFF, 0xFF]);
        assert_eq!(&image[512 + copy_len + 4..512 + copy_len + 6], &[0xFF, 0xFF]);
    }

    /// Fails every read that touches the byte range it guards.
    struct FlakyDisk {
        inner: MemoryDisk,
        bad: core::ops::Range<u64>,
    }

    impl DiskIO for FlakyDisk {
        fn read(&mut self, buffer: &mut [u8], offset: u64) -> FatResult {
            let end = offset + buffer.len() as u64;
            if offset < self.bad.end && end > self.bad.start {
                return Err(FatError::Io);
            }
            self.inner.read(buffer, offset)
        }

        fn write(&mut self, buffer: &[u8], offset: u64) -> FatResult {
            self.inner.write(buffer, offset)
        }
    }

    #[test]
    fn load_falls_back_to_second_copy() {
        let layout = layout(FatBits::Fat16, 5000);
        let copy_len = (layout.fat_len * 512) as u64;
        let mut image = alloc::vec![0u8; ((1 + 2 * layout.fat_len) * 512) as usize];
        let second = 512 + copy_len as usize;
        image[second + 6] = 0x34;
        image[second + 7] = 0x12;
        let disk = FlakyDisk {
            inner: MemoryDisk::from_bytes(image),
            bad: 512..512 + copy_len,
        };
        let dev: SharedStream = Rc::new(RefCell::new(DiskStream::new(disk)));
        let mut fat = FatTable::new(dev, layout, &VolumeConfig::default(), Interrupt::new());
        assert_eq!(fat.decode(3).unwrap(), 0x1234);
        // Only the copy that loaded is trusted from now on.
        assert_eq!(fat.write_copies(), alloc::vec![1]);
    }

    #[test]
    fn unmirrored_volume_reads_active_copy() {
        let mut layout = layout(FatBits::Fat32, 1000);
        layout.mirrored = false;
        layout.active_fat = 1;
        let copy_len = (layout.fat_len * 512) as usize;
        let mut image = alloc::vec![0u8; 512 + 2 * copy_len];
        image[512 + copy_len + 8] = 0x09;
        let disk = MemoryDisk::from_bytes(image);
        let dev: SharedStream = Rc::new(RefCell::new(DiskStream::new(disk.clone())));
        let mut fat = FatTable::new(dev, layout, &VolumeConfig::default(), Interrupt::new());
        assert_eq!(fat.decode(2).unwrap(), 9);
        fat.set(3, 0x0FFF_FFFF).unwrap();
        fat.flush().unwrap();
        let image = disk.snapshot();
        assert_eq!(image[512 + 12], 0);
        assert_eq!(image[512 + copy_len + 12], 0xFF);
    }

    #[test]
    fn loop_guard_catches_cycles() {
        let (_, mut fat) = table(FatBits::Fat16, 100);
        fat.set(2, 3).unwrap();
        fat.set(3, 4).unwrap();
        fat.set(4, 5).unwrap();
        fat.set(5, 3).unwrap();
        assert_eq!(fat.count_chain(2), Err(FatError::LoopDetected));
    }

    #[test]
    fn interrupt_stops_scans() {
        let (_, mut fat) = table(FatBits::Fat16, 5000);
        fat.interrupt.raise();
        assert_eq!(fat.free_clusters(), Err(FatError::Interrupted));
    }
}
