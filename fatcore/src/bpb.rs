use byteorder::{ByteOrder, LittleEndian};

use crate::error::{FatError, FatResult};

pub const BOOT_SIGNATURE: u16 = 0xAA55;

/// Boot sector parameters, decoded field by field from their documented
/// offsets. FAT32-only fields read as zero on FAT12/16 volumes.
#[derive(Clone, Debug, Default)]
pub struct BiosParamBlock {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_count: u8,
    pub root_directory_entries: u16,
    pub total_sectors: u16,
    pub media_descriptor: u8,
    pub sectors_per_fat: u16,
    pub sectors_per_track: u16,
    pub heads: u16,
    pub hidden_sectors: u32,
    pub total_sectors_large: u32,
    pub sectors_per_fat_large: u32,
    pub ext_flags: u16,
    pub root_cluster: u32,
    pub info_sector: u16,
    pub backup_boot_sector: u16,
    pub signature: u16,
}

impl BiosParamBlock {
    /// Decode the first 512 bytes of a volume.
    pub fn parse(raw: &[u8]) -> FatResult<Self> {
        if raw.len() < 512 {
            return Err(FatError::InvalidBootSector);
        }
        let mut bpb = Self {
            bytes_per_sector: LittleEndian::read_u16(&raw[11..]),
            sectors_per_cluster: raw[13],
            reserved_sectors: LittleEndian::read_u16(&raw[14..]),
            fat_count: raw[16],
            root_directory_entries: LittleEndian::read_u16(&raw[17..]),
            total_sectors: LittleEndian::read_u16(&raw[19..]),
            media_descriptor: raw[21],
            sectors_per_fat: LittleEndian::read_u16(&raw[22..]),
            sectors_per_track: LittleEndian::read_u16(&raw[24..]),
            heads: LittleEndian::read_u16(&raw[26..]),
            hidden_sectors: LittleEndian::read_u32(&raw[28..]),
            total_sectors_large: LittleEndian::read_u32(&raw[32..]),
            signature: LittleEndian::read_u16(&raw[510..]),
            ..Self::default()
        };
        if bpb.sectors_per_fat == 0 {
            bpb.sectors_per_fat_large = LittleEndian::read_u32(&raw[36..]);
            bpb.ext_flags = LittleEndian::read_u16(&raw[40..]);
            bpb.root_cluster = LittleEndian::read_u32(&raw[44..]);
            bpb.info_sector = LittleEndian::read_u16(&raw[48..]);
            bpb.backup_boot_sector = LittleEndian::read_u16(&raw[50..]);
        }
        Ok(bpb)
    }

    /// Encode into a boot sector buffer, leaving every other byte alone.
    pub fn write_to(&self, raw: &mut [u8]) {
        LittleEndian::write_u16(&mut raw[11..], self.bytes_per_sector);
        raw[13] = self.sectors_per_cluster;
        LittleEndian::write_u16(&mut raw[14..], self.reserved_sectors);
        raw[16] = self.fat_count;
        LittleEndian::write_u16(&mut raw[17..], self.root_directory_entries);
        LittleEndian::write_u16(&mut raw[19..], self.total_sectors);
        raw[21] = self.media_descriptor;
        LittleEndian::write_u16(&mut raw[22..], self.sectors_per_fat);
        LittleEndian::write_u16(&mut raw[24..], self.sectors_per_track);
        LittleEndian::write_u16(&mut raw[26..], self.heads);
        LittleEndian::write_u32(&mut raw[28..], self.hidden_sectors);
        LittleEndian::write_u32(&mut raw[32..], self.total_sectors_large);
        if self.sectors_per_fat == 0 {
            LittleEndian::write_u32(&mut raw[36..], self.sectors_per_fat_large);
            LittleEndian::write_u16(&mut raw[40..], self.ext_flags);
            LittleEndian::write_u32(&mut raw[44..], self.root_cluster);
            LittleEndian::write_u16(&mut raw[48..], self.info_sector);
            LittleEndian::write_u16(&mut raw[50..], self.backup_boot_sector);
        }
        LittleEndian::write_u16(&mut raw[510..], self.signature);
    }

    pub fn total_sector_count(&self) -> u32 {
        if self.total_sectors != 0 {
            self.total_sectors as u32
        } else {
            self.total_sectors_large
        }
    }

    pub fn fat_length(&self) -> u32 {
        if self.sectors_per_fat != 0 {
            self.sectors_per_fat as u32
        } else {
            self.sectors_per_fat_large
        }
    }

    pub fn first_root_directory_sector(&self) -> u32 {
        let fat_sectors = (self.fat_count as u32) * self.fat_length();

        (self.reserved_sectors as u32) + fat_sectors
    }

    pub fn root_directory_sectors(&self) -> u32 {
        let bytes = self.root_directory_entries as u32 * 32;
        let sector = self.bytes_per_sector.max(1) as u32;
        (bytes + sector - 1) / sector
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatBits {
    Fat12,
    Fat16,
    Fat32,
}

impl FatBits {
    pub fn width(&self) -> u32 {
        match self {
            FatBits::Fat12 => 12,
            FatBits::Fat16 => 16,
            FatBits::Fat32 => 32,
        }
    }
}

/// Largest cluster count a FAT32 entry can express.
const FAT32_MAX_CLUSTERS: u32 = 0x0FFF_FFF5;

/// Volume layout derived from the boot sector. All positions are in
/// sectors from the start of the volume.
#[derive(Clone, Debug)]
pub struct FatGeometry {
    pub bits: FatBits,
    pub sector_size: u32,
    pub cluster_sectors: u32,
    pub fat_start: u32,
    pub fat_len: u32,
    pub num_fats: u32,
    pub dir_start: u32,
    /// Fixed root directory length; zero on FAT32
    pub dir_len: u32,
    pub clus_start: u32,
    pub num_clus: u32,
    /// First cluster of the FAT32 root directory
    pub root_cluster: u32,
    pub info_sector: Option<u32>,
    pub active_fat: u32,
    pub mirrored: bool,
    /// Heads x sectors-per-track, when the boot sector records it
    pub cylinder_sectors: Option<u32>,
}

impl FatGeometry {
    pub fn from_bpb(bpb: &BiosParamBlock) -> FatResult<Self> {
        let sector_size = bpb.bytes_per_sector as u32;
        if !sector_size.is_power_of_two() || !(128..=4096).contains(&sector_size) {
            log::warn!("unusable sector size {}", sector_size);
            return Err(FatError::InvalidBootSector);
        }
        let cluster_sectors = bpb.sectors_per_cluster as u32;
        if !cluster_sectors.is_power_of_two() {
            log::warn!("unusable cluster size {}", cluster_sectors);
            return Err(FatError::InvalidBootSector);
        }
        let num_fats = bpb.fat_count as u32;
        let fat_len = bpb.fat_length();
        if num_fats == 0 || fat_len == 0 || bpb.reserved_sectors == 0 {
            return Err(FatError::InvalidBootSector);
        }

        let fat32 = bpb.sectors_per_fat == 0;
        let fat_start = bpb.reserved_sectors as u32;
        let dir_start = fat_start + num_fats * fat_len;
        let dir_len = if fat32 { 0 } else { bpb.root_directory_sectors() };
        let clus_start = dir_start + dir_len;
        let total = bpb.total_sector_count();
        if total <= clus_start {
            log::warn!("volume of {} sectors has no data area", total);
            return Err(FatError::InvalidBootSector);
        }
        let mut num_clus = (total - clus_start) / cluster_sectors;

        let bits = if fat32 {
            FatBits::Fat32
        } else if num_clus < 4085 {
            FatBits::Fat12
        } else {
            FatBits::Fat16
        };

        // Never address more clusters than the FAT itself can describe.
        let entries = (fat_len as u64 * sector_size as u64 * 8) / bits.width() as u64;
        if entries <= 2 {
            return Err(FatError::InvalidBootSector);
        }
        let addressable = (entries - 2).min(FAT32_MAX_CLUSTERS as u64) as u32;
        if num_clus > addressable {
            log::info!(
                "clamping cluster count from {} to the {} the FAT can address",
                num_clus,
                addressable
            );
            num_clus = addressable;
        }
        if num_clus == 0 {
            return Err(FatError::InvalidBootSector);
        }

        let (root_cluster, info_sector, active_fat, mirrored) = if fat32 {
            if bpb.root_cluster < 2 || bpb.root_cluster > num_clus + 1 {
                log::warn!("FAT32 root cluster {} out of range", bpb.root_cluster);
                return Err(FatError::InvalidBootSector);
            }
            let info = match bpb.info_sector as u32 {
                0 | 0xFFFF => None,
                sector if sector < fat_start => Some(sector),
                _ => None,
            };
            let mirrored = bpb.ext_flags & 0x80 == 0;
            let active = if mirrored {
                0
            } else {
                (bpb.ext_flags & 0x0F) as u32
            };
            if active >= num_fats {
                return Err(FatError::InvalidBootSector);
            }
            (bpb.root_cluster, info, active, mirrored)
        } else {
            (0, None, 0, true)
        };

        let cylinder = bpb.heads as u32 * bpb.sectors_per_track as u32;

        Ok(Self {
            bits,
            sector_size,
            cluster_sectors,
            fat_start,
            fat_len,
            num_fats,
            dir_start,
            dir_len,
            clus_start,
            num_clus,
            root_cluster,
            info_sector,
            active_fat,
            mirrored,
            cylinder_sectors: if cylinder == 0 { None } else { Some(cylinder) },
        })
    }

    pub fn cluster_bytes(&self) -> u32 {
        self.cluster_sectors * self.sector_size
    }
}

const INFO_LEAD_SIGNATURE: u32 = 0x4161_5252;
const INFO_STRUCT_SIGNATURE: u32 = 0x6141_7272;
const INFO_TRAIL_SIGNATURE: u32 = 0xAA55_0000;
const INFO_UNKNOWN: u32 = 0xFFFF_FFFF;

/// FAT32 FS-info sector: advisory free count and next-free hint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FsInfo {
    pub free_clusters: Option<u32>,
    pub next_free: Option<u32>,
}

impl FsInfo {
    /// Returns `None` when the sector does not carry the info signatures.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < 512
            || LittleEndian::read_u32(&raw[0..]) != INFO_LEAD_SIGNATURE
            || LittleEndian::read_u32(&raw[484..]) != INFO_STRUCT_SIGNATURE
            || LittleEndian::read_u32(&raw[508..]) != INFO_TRAIL_SIGNATURE
        {
            return None;
        }
        let known = |value: u32| if value == INFO_UNKNOWN { None } else { Some(value) };
        Some(Self {
            free_clusters: known(LittleEndian::read_u32(&raw[488..])),
            next_free: known(LittleEndian::read_u32(&raw[492..])),
        })
    }

    /// Stamp the signatures and both counters into `raw`.
    pub fn write_to(&self, raw: &mut [u8]) {
        LittleEndian::write_u32(&mut raw[0..], INFO_LEAD_SIGNATURE);
        LittleEndian::write_u32(&mut raw[484..], INFO_STRUCT_SIGNATURE);
        LittleEndian::write_u32(&mut raw[488..], self.free_clusters.unwrap_or(INFO_UNKNOWN));
        LittleEndian::write_u32(&mut raw[492..], self.next_free.unwrap_or(INFO_UNKNOWN));
        LittleEndian::write_u32(&mut raw[508..], INFO_TRAIL_SIGNATURE);
    }
}
