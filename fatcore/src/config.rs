/// Tuning knobs for a mounted volume. Device geometry and volume
/// parameters come from the boot sector; this only carries what the
/// caller decides.
#[derive(Clone, Copy)]
pub struct VolumeConfig {
    /// Relaxed durability: aggressive FAT read-ahead, extending writes
    /// rounded up to whole clusters, and no intermediate flushes down the
    /// stream chain. Release and close still flush.
    pub batch: bool,
    /// Buffer cache granularity in sectors. `None` derives it from the
    /// boot sector's heads x sectors-per-track.
    pub cylinder_sectors: Option<u32>,
    /// Buffer cache window size, in cylinders.
    pub buffer_cylinders: u32,
    /// Extra FAT sectors read on a cold load outside batch mode.
    pub fat_readahead: u32,
    /// Write every FAT copy on flush.
    pub mirror_fat: bool,
    /// Seconds since 1980-01-01, used to stamp new directory entries.
    pub clock: fn() -> u32,
}

/// FAT read-ahead used in batch mode.
pub const BATCH_FAT_READAHEAD: u32 = 1024;

/// Cylinder size used when the boot sector carries no geometry.
pub const DEFAULT_CYLINDER_SECTORS: u32 = 64;

fn epoch() -> u32 {
    0
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            batch: false,
            cylinder_sectors: None,
            buffer_cylinders: 8,
            fat_readahead: 1,
            mirror_fat: true,
            clock: epoch,
        }
    }
}

impl VolumeConfig {
    pub fn batch() -> Self {
        Self {
            batch: true,
            ..Self::default()
        }
    }

    pub fn fat_readahead(&self) -> u32 {
        if self.batch {
            BATCH_FAT_READAHEAD
        } else {
            self.fat_readahead
        }
    }
}
