#![allow(dead_code)]

use fatcore::bpb::{BiosParamBlock, FsInfo, BOOT_SIGNATURE};
use fatcore::clash::{ClashAction, FixedPolicy};
use fatcore::stream::{read_fully, release, write_fully, SharedStream};
use fatcore::{Attributes, DirEntry, Directory, FileHandle, Insertion, MemoryDisk, VolumeConfig};

/// 2024-01-15 12:00:00 as seconds since 1980-01-01
pub const FIXED_TIME: u32 = 1_389_787_200;

pub fn fixed_clock() -> u32 {
    FIXED_TIME
}

pub fn config() -> VolumeConfig {
    VolumeConfig {
        clock: fixed_clock,
        ..VolumeConfig::default()
    }
}

pub struct Format {
    pub total_sectors: u32,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_count: u8,
    pub root_entries: u16,
    pub sectors_per_fat: u32,
    pub fat32: bool,
    pub media: u8,
    pub sectors_per_track: u16,
    pub heads: u16,
}

impl Format {
    pub fn floppy() -> Self {
        Self {
            total_sectors: 2880,
            sectors_per_cluster: 1,
            reserved_sectors: 1,
            fat_count: 2,
            root_entries: 224,
            sectors_per_fat: 9,
            fat32: false,
            media: 0xF0,
            sectors_per_track: 18,
            heads: 2,
        }
    }

    /// 16 MiB, 2 KiB clusters
    pub fn fat16() -> Self {
        Self {
            total_sectors: 32768,
            sectors_per_cluster: 4,
            reserved_sectors: 1,
            fat_count: 2,
            root_entries: 512,
            sectors_per_fat: 32,
            fat32: false,
            media: 0xF8,
            sectors_per_track: 32,
            heads: 2,
        }
    }

    /// 4 MiB with 512-byte clusters; far too small for a real FAT32, but
    /// only the zero 16-bit FAT length decides the type.
    pub fn fat32() -> Self {
        Self {
            total_sectors: 8192,
            sectors_per_cluster: 1,
            reserved_sectors: 32,
            fat_count: 2,
            root_entries: 0,
            sectors_per_fat: 64,
            fat32: true,
            media: 0xF8,
            sectors_per_track: 32,
            heads: 2,
        }
    }

    pub fn fat_offset(&self, copy: u32) -> usize {
        (self.reserved_sectors as usize + copy as usize * self.sectors_per_fat as usize) * 512
    }

    pub fn root_offset(&self) -> usize {
        self.fat_offset(self.fat_count as u32)
    }

    pub fn data_offset(&self) -> usize {
        self.root_offset() + self.root_entries as usize * 32
    }

    pub fn cluster_count(&self) -> u32 {
        (self.total_sectors - self.data_offset() as u32 / 512) / self.sectors_per_cluster as u32
    }

    pub fn build(&self) -> Vec<u8> {
        let mut image = vec![0u8; self.total_sectors as usize * 512];
        image[..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
        image[3..11].copy_from_slice(b"FATCORE ");
        let bpb = BiosParamBlock {
            bytes_per_sector: 512,
            sectors_per_cluster: self.sectors_per_cluster,
            reserved_sectors: self.reserved_sectors,
            fat_count: self.fat_count,
            root_directory_entries: self.root_entries,
            total_sectors: if self.total_sectors < 0x10000 && !self.fat32 {
                self.total_sectors as u16
            } else {
                0
            },
            media_descriptor: self.media,
            sectors_per_fat: if self.fat32 { 0 } else { self.sectors_per_fat as u16 },
            sectors_per_track: self.sectors_per_track,
            heads: self.heads,
            total_sectors_large: if self.total_sectors < 0x10000 && !self.fat32 {
                0
            } else {
                self.total_sectors
            },
            sectors_per_fat_large: if self.fat32 { self.sectors_per_fat } else { 0 },
            root_cluster: if self.fat32 { 2 } else { 0 },
            info_sector: if self.fat32 { 1 } else { 0 },
            backup_boot_sector: if self.fat32 { 6 } else { 0 },
            signature: BOOT_SIGNATURE,
            ..BiosParamBlock::default()
        };
        bpb.write_to(&mut image[..512]);

        let ext = if self.fat32 { 64 } else { 36 };
        image[ext] = 0x80;
        image[ext + 2] = 0x29;
        image[ext + 3..ext + 7].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        image[ext + 7..ext + 18].copy_from_slice(b"NO NAME    ");
        let fs_type: &[u8; 8] = if self.fat32 {
            b"FAT32   "
        } else if self.cluster_count() < 4085 {
            b"FAT12   "
        } else {
            b"FAT16   "
        };
        image[ext + 18..ext + 26].copy_from_slice(fs_type);

        let head: Vec<u8> = if self.fat32 {
            let mut head = Vec::new();
            head.extend_from_slice(&(0x0FFF_FF00 | self.media as u32).to_le_bytes());
            head.extend_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
            // Root directory chain
            head.extend_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
            head
        } else if self.cluster_count() < 4085 {
            vec![self.media, 0xFF, 0xFF]
        } else {
            vec![self.media, 0xFF, 0xFF, 0xFF]
        };
        for copy in 0..self.fat_count as u32 {
            let at = self.fat_offset(copy);
            image[at..at + head.len()].copy_from_slice(&head);
        }

        if self.fat32 {
            let info = FsInfo {
                free_clusters: Some(self.cluster_count() - 1),
                next_free: Some(2),
            };
            info.write_to(&mut image[512..1024]);
        }
        image
    }

    pub fn disk(&self) -> MemoryDisk {
        MemoryDisk::from_bytes(self.build())
    }
}

/// Raw FAT12 link update on an image, for corrupting chains behind the
/// engine's back.
pub fn fat12_set(image: &mut [u8], fat_offset: usize, cluster: u32, value: u32) {
    let at = fat_offset + (cluster as usize * 3) / 2;
    if cluster % 2 == 0 {
        image[at] = value as u8;
        image[at + 1] = (image[at + 1] & 0xF0) | ((value >> 8) as u8 & 0x0F);
    } else {
        image[at] = (image[at] & 0x0F) | ((value as u8 & 0x0F) << 4);
        image[at + 1] = (value >> 4) as u8;
    }
}

pub fn expect_created(insertion: Insertion) -> (u32, DirEntry, String) {
    match insertion {
        Insertion::Created {
            slot, entry, name, ..
        } => (slot, entry, name),
        Insertion::Skipped => panic!("entry was skipped"),
    }
}

/// Create `name` holding `data` and close it again. Returns the short
/// entry's slot.
pub fn create_file(dir: &mut Directory, name: &str, data: &[u8]) -> u32 {
    let insertion = dir
        .insert(name, &mut FixedPolicy(ClashAction::Abort), |_| Ok(()))
        .unwrap();
    let (slot, _, _) = expect_created(insertion);
    let handle = dir.open_entry(slot).unwrap();
    write_all(&handle, data);
    close(handle);
    slot
}

/// Create an empty subdirectory holding only its dot entries.
pub fn create_directory(dir: &mut Directory, name: &str, cluster_bytes: usize) -> u32 {
    let insertion = dir
        .insert(name, &mut FixedPolicy(ClashAction::Abort), |entry| {
            entry.set_attributes(Attributes::DIRECTORY);
            Ok(())
        })
        .unwrap();
    let (slot, _, _) = expect_created(insertion);
    let handle = dir.open_entry(slot).unwrap();
    let mut cluster = vec![0u8; cluster_bytes];
    let mut dot = DirEntry::new();
    dot.set_short_name(b".          ");
    dot.set_attributes(Attributes::DIRECTORY);
    cluster[..32].copy_from_slice(dot.as_bytes());
    dot.set_short_name(b"..         ");
    cluster[32..64].copy_from_slice(dot.as_bytes());
    write_all(&handle, &cluster);
    // The start cluster is only known now that the chain exists.
    let first = handle.borrow().first_cluster().unwrap();
    let stream: SharedStream = handle.clone();
    dot.set_short_name(b".          ");
    dot.set_first_cluster(first);
    write_fully(&stream, dot.as_bytes(), 0).unwrap();
    drop(stream);
    close(handle);
    slot
}

pub fn write_all(handle: &FileHandle, data: &[u8]) {
    let stream: SharedStream = handle.clone();
    assert_eq!(write_fully(&stream, data, 0).unwrap(), data.len());
}

pub fn read_all(handle: &FileHandle) -> Vec<u8> {
    let size = handle.borrow().size() as usize;
    let mut data = vec![0u8; size];
    let stream: SharedStream = handle.clone();
    assert_eq!(read_fully(&stream, &mut data, 0).unwrap(), size);
    data
}

pub fn close(handle: FileHandle) {
    release(handle).unwrap();
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}
