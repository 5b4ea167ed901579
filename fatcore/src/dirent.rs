use alloc::string::String;

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

pub const DIR_ENTRY_SIZE: usize = 32;

/// First name byte of a deleted slot
pub const DELETED_MARK: u8 = 0xE5;
/// Stand-in for a real leading 0xE5 in a short name
const KANJI_MARK: u8 = 0x05;

/// VSE ordinal flag on the physically first slot of a long name
pub const LAST_LONG_ENTRY: u8 = 0x40;
/// UTF-16 units carried by one VSE slot
pub const LONG_NAME_UNITS: usize = 13;

/// Case flags in the reserved byte: short base / extension are lowercase.
pub const CASE_LOWER_BASE: u8 = 0x08;
pub const CASE_LOWER_EXT: u8 = 0x10;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
        const LONG_NAME = Self::READ_ONLY.bits()
            | Self::HIDDEN.bits()
            | Self::SYSTEM.bits()
            | Self::VOLUME_ID.bits();
    }
}

/// Byte positions of the fields within a 32-byte short entry.
mod offset {
    pub const NAME: usize = 0;
    pub const ATTRIBUTES: usize = 11;
    pub const CASE: usize = 12;
    pub const FINE_CREATE_TIME: usize = 13;
    pub const CREATE_TIME: usize = 14;
    pub const CREATE_DATE: usize = 16;
    pub const ACCESS_DATE: usize = 18;
    pub const START_HIGH: usize = 20;
    pub const MODIFY_TIME: usize = 22;
    pub const MODIFY_DATE: usize = 24;
    pub const START_LOW: usize = 26;
    pub const SIZE: usize = 28;

    pub const LONG_CHECKSUM: usize = 13;
    /// Where each run of name units sits in a VSE, and how many it holds
    pub const LONG_TEXT: [(usize, usize); 3] = [(1, 5), (14, 6), (28, 2)];
}

/// On-disk representation of a file, subdirectory, or long-name fragment
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct DirEntry {
    raw: [u8; DIR_ENTRY_SIZE],
}

impl Default for DirEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for DirEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_long_name() {
            write!(f, "DirEntry(long #{:#x})", self.long_ordinal())
        } else {
            write!(f, "DirEntry({:?})", self.get_full_name())
        }
    }
}

impl DirEntry {
    /// A blank short entry: space-padded name, everything else zero.
    pub fn new() -> Self {
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw[..11].fill(0x20);
        Self { raw }
    }

    /// All zeroes, which also reads as the end-of-directory marker.
    pub fn end_marker() -> Self {
        Self {
            raw: [0u8; DIR_ENTRY_SIZE],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw.copy_from_slice(&bytes[..DIR_ENTRY_SIZE]);
        Self { raw }
    }

    pub fn as_bytes(&self) -> &[u8; DIR_ENTRY_SIZE] {
        &self.raw
    }

    pub fn is_end_marker(&self) -> bool {
        self.raw[0] == 0
    }

    pub fn is_deleted(&self) -> bool {
        self.raw[0] == DELETED_MARK
    }

    /// Deleted slots and the end marker
    pub fn is_empty(&self) -> bool {
        self.is_end_marker() || self.is_deleted()
    }

    pub fn mark_deleted(&mut self) {
        self.raw[0] = DELETED_MARK;
    }

    pub fn attributes(&self) -> Attributes {
        Attributes::from_bits_retain(self.raw[offset::ATTRIBUTES])
    }

    pub fn set_attributes(&mut self, attributes: Attributes) {
        self.raw[offset::ATTRIBUTES] = attributes.bits();
    }

    pub fn is_long_name(&self) -> bool {
        self.raw[offset::ATTRIBUTES] == Attributes::LONG_NAME.bits()
    }

    pub fn is_volume_label(&self) -> bool {
        !self.is_long_name() && self.attributes().contains(Attributes::VOLUME_ID)
    }

    pub fn is_directory(&self) -> bool {
        !self.is_long_name() && self.attributes().contains(Attributes::DIRECTORY)
    }

    /// The 11 raw name bytes, with a 0x05 lead byte translated back to 0xE5.
    pub fn short_name_bytes(&self) -> [u8; 11] {
        let mut name = [0u8; 11];
        name.copy_from_slice(&self.raw[offset::NAME..offset::NAME + 11]);
        if name[0] == KANJI_MARK {
            name[0] = DELETED_MARK;
        }
        name
    }

    pub fn set_short_name(&mut self, name: &[u8; 11]) {
        self.raw[offset::NAME..offset::NAME + 11].copy_from_slice(name);
        if self.raw[0] == DELETED_MARK {
            self.raw[0] = KANJI_MARK;
        }
    }

    pub fn case_flags(&self) -> u8 {
        self.raw[offset::CASE]
    }

    pub fn set_case_flags(&mut self, flags: u8) {
        self.raw[offset::CASE] = flags;
    }

    pub fn get_filename(&self) -> String {
        field_text(&self.short_name_bytes()[..8])
    }

    pub fn get_ext(&self) -> String {
        field_text(&self.short_name_bytes()[8..])
    }

    /// `BASE.EXT` as stored, upper case.
    pub fn get_full_name(&self) -> String {
        let mut name = self.get_filename();
        let ext = self.get_ext();
        if !ext.is_empty() {
            name.push('.');
            name.push_str(&ext);
        }
        name
    }

    /// The short name the way it should be shown when no long name exists,
    /// honouring the lowercase flags.
    pub fn display_name(&self) -> String {
        let mut base = self.get_filename();
        let mut ext = self.get_ext();
        if self.case_flags() & CASE_LOWER_BASE != 0 {
            base = base.to_lowercase();
        }
        if self.case_flags() & CASE_LOWER_EXT != 0 {
            ext = ext.to_lowercase();
        }
        if !ext.is_empty() {
            base.push('.');
            base.push_str(&ext);
        }
        base
    }

    /// Volume labels span all eleven bytes with no separator.
    pub fn label(&self) -> String {
        field_text(&self.short_name_bytes())
    }

    pub fn first_cluster(&self) -> u32 {
        let high = LittleEndian::read_u16(&self.raw[offset::START_HIGH..]) as u32;
        let low = LittleEndian::read_u16(&self.raw[offset::START_LOW..]) as u32;
        (high << 16) | low
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        LittleEndian::write_u16(&mut self.raw[offset::START_HIGH..], (cluster >> 16) as u16);
        LittleEndian::write_u16(&mut self.raw[offset::START_LOW..], cluster as u16);
    }

    pub fn size(&self) -> u32 {
        LittleEndian::read_u32(&self.raw[offset::SIZE..])
    }

    pub fn set_size(&mut self, size: u32) {
        LittleEndian::write_u32(&mut self.raw[offset::SIZE..], size);
    }

    fn time_at(&self, at: usize) -> FileTime {
        FileTime(LittleEndian::read_u16(&self.raw[at..]))
    }

    fn date_at(&self, at: usize) -> FileDate {
        FileDate(LittleEndian::read_u16(&self.raw[at..]))
    }

    pub fn get_modification_timestamp(&self) -> u32 {
        let mod_time = self.time_at(offset::MODIFY_TIME);
        let mod_date = self.date_at(offset::MODIFY_DATE);
        encode_timestamp(
            mod_date.get_year(),
            mod_date.get_month(),
            mod_date.get_day(),
            mod_time.get_hours(),
            mod_time.get_minutes(),
            mod_time.get_seconds(),
        )
    }

    pub fn set_modification_timestamp(&mut self, timestamp: u32) {
        let (date, time) = decode_timestamp(timestamp);
        LittleEndian::write_u16(&mut self.raw[offset::MODIFY_TIME..], time.0);
        LittleEndian::write_u16(&mut self.raw[offset::MODIFY_DATE..], date.0);
        LittleEndian::write_u16(&mut self.raw[offset::ACCESS_DATE..], date.0);
    }

    /// Stamp creation, modification and access with the same instant.
    pub fn set_timestamps(&mut self, timestamp: u32) {
        let (date, time) = decode_timestamp(timestamp);
        self.raw[offset::FINE_CREATE_TIME] = 0;
        LittleEndian::write_u16(&mut self.raw[offset::CREATE_TIME..], time.0);
        LittleEndian::write_u16(&mut self.raw[offset::CREATE_DATE..], date.0);
        self.set_modification_timestamp(timestamp);
    }

    pub fn matches_name(&self, name: &[u8; 11]) -> bool {
        self.short_name_bytes()
            .iter()
            .zip(name.iter())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    /// One VSE slot of a long name. `ordinal` counts from 1 at the slot
    /// nearest the short entry; `units` is the whole name in UTF-16.
    pub fn long_name_part(units: &[u16], ordinal: u8, last: bool, checksum: u8) -> Self {
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw[0] = if last { ordinal | LAST_LONG_ENTRY } else { ordinal };
        raw[offset::ATTRIBUTES] = Attributes::LONG_NAME.bits();
        raw[offset::LONG_CHECKSUM] = checksum;

        let base = (ordinal as usize - 1) * LONG_NAME_UNITS;
        let mut index = 0;
        for &(at, count) in offset::LONG_TEXT.iter() {
            for i in 0..count {
                let position = base + index;
                let unit = match position.cmp(&units.len()) {
                    core::cmp::Ordering::Less => units[position],
                    core::cmp::Ordering::Equal => 0x0000,
                    core::cmp::Ordering::Greater => 0xFFFF,
                };
                LittleEndian::write_u16(&mut raw[at + 2 * i..], unit);
                index += 1;
            }
        }
        Self { raw }
    }

    /// Raw ordinal byte of a VSE, flags included.
    pub fn long_ordinal(&self) -> u8 {
        self.raw[0]
    }

    pub fn long_checksum(&self) -> u8 {
        self.raw[offset::LONG_CHECKSUM]
    }

    pub fn long_units(&self) -> [u16; LONG_NAME_UNITS] {
        let mut units = [0u16; LONG_NAME_UNITS];
        let mut index = 0;
        for &(at, count) in offset::LONG_TEXT.iter() {
            for i in 0..count {
                units[index] = LittleEndian::read_u16(&self.raw[at + 2 * i..]);
                index += 1;
            }
        }
        units
    }
}

fn field_text(bytes: &[u8]) -> String {
    let len = bytes
        .iter()
        .rposition(|&b| b != 0x20)
        .map_or(0, |last| last + 1);
    bytes[..len].iter().map(|&b| b as char).collect()
}

fn is_leap_year(year: u16) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

fn days_in_year(year: u16) -> u32 {
    if is_leap_year(year) {
        366
    } else {
        365
    }
}

const MONTH_START_OFFSET: [u32; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];

/// Encode a date/time into a timestamp (seconds since 1980-01-01).
pub fn encode_timestamp(year: u16, month: u16, day: u16, hours: u16, minutes: u16, seconds: u16) -> u32 {
    if year < 1980 || month == 0 || month > 12 || day == 0 {
        return 0;
    }

    let mut days: u32 = (1980..year).map(days_in_year).sum();
    days += MONTH_START_OFFSET[month as usize - 1];
    if month > 2 && is_leap_year(year) {
        days += 1;
    }
    days += day as u32 - 1;

    days * 86400 + hours as u32 * 3600 + minutes as u32 * 60 + seconds as u32
}

/// Decode a timestamp (seconds since 1980-01-01) into FAT FileDate and FileTime.
pub fn decode_timestamp(ts: u32) -> (FileDate, FileTime) {
    let mut days = ts / 86400;
    let raw_time = ts % 86400;

    let mut year = 1980u16;
    while days >= days_in_year(year) {
        days -= days_in_year(year);
        year += 1;
    }
    let leap = if is_leap_year(year) { 1 } else { 0 };
    let mut month = 12usize;
    while month > 1 {
        let start = MONTH_START_OFFSET[month - 1] + if month > 2 { leap } else { 0 };
        if days >= start {
            break;
        }
        month -= 1;
    }
    let start = MONTH_START_OFFSET[month - 1] + if month > 2 { leap } else { 0 };
    let day = days - start + 1;

    let total_minutes = raw_time / 60;
    let seconds = raw_time % 60;
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;

    let fat_date = FileDate::from_parts(year, month as u8, day as u8);
    let fat_time = FileTime::from_parts(hours as u8, minutes as u8, seconds as u8);
    (fat_date, fat_time)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct FileTime(u16);

impl FileTime {
    pub fn get_hours(&self) -> u16 {
        self.0 >> 11
    }

    pub fn get_minutes(&self) -> u16 {
        (self.0 >> 5) & 0x3f
    }

    pub fn get_seconds(&self) -> u16 {
        (self.0 & 0x1f) << 1
    }

    pub fn from_parts(hours: u8, minutes: u8, seconds: u8) -> Self {
        let val = ((hours as u16) << 11)
            | ((minutes as u16) << 5)
            | ((seconds as u16) >> 1);
        FileTime(val)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct FileDate(u16);

impl FileDate {
    pub fn get_year(&self) -> u16 {
        ((self.0 >> 9) & 0x7f) + 1980
    }

    pub fn get_month(&self) -> u16 {
        (self.0 >> 5) & 0xf
    }

    pub fn get_day(&self) -> u16 {
        self.0 & 0x1f
    }

    pub fn from_parts(year: u16, month: u8, day: u8) -> Self {
        let year_val = if year >= 1980 { year - 1980 } else { 0 };
        let val = ((year_val & 0x7f) << 9)
            | ((month as u16 & 0xf) << 5)
            | (day as u16 & 0x1f);
        FileDate(val)
    }
}
