//! A FAT12/16/32 storage core: layered byte streams over a block device,
//! a sector buffer cache, the allocation table, cluster-chain files and
//! VFAT directories.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[cfg(all(feature = "std", not(test)))]
extern crate std;

pub mod bpb;
pub mod buffer;
pub mod chain;
pub mod clash;
pub mod config;
pub mod dircache;
pub mod dirent;
pub mod directory;
pub mod disk;
pub mod error;
pub mod interrupt;
pub mod stream;
pub mod table;
pub mod vfat;
pub mod volume;

pub use chain::{ChainFile, EntryLocation, Extent, FileHandle, MapMode};
pub use clash::{Clash, ClashAction, ClashHandler, ClashKind, FixedPolicy};
pub use config::VolumeConfig;
pub use dirent::{Attributes, DirEntry};
pub use directory::{Directory, Insertion, SlotSearch};
pub use disk::{DiskIO, DiskStream, MemoryDisk};
pub use error::{FatError, FatResult};
pub use interrupt::Interrupt;
pub use stream::{SharedStream, Stream, StreamInfo, StreamKind};
pub use volume::Volume;
