//! Per-directory cache of slot classifications.
//!
//! Each 32-byte slot of a directory is, once examined, covered by exactly
//! one record: a run of free slots, a used entry (its VSE chain plus the
//! short entry), or the end-of-directory marker. Records are shared by
//! every slot they cover, so looking up any slot of a long name yields the
//! whole entry.
//!
//! Names of used records are also folded into a small bloom index. The
//! index only ever answers "definitely absent" once every slot from 0 up
//! to the end marker has been seen in order; until then callers must scan.

use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;

use crate::dirent::DirEntry;
use crate::error::FatResult;
use crate::vfat::VfatNameChain;

/// Where a directory cache reads raw slots from.
pub trait SlotSource {
    /// The entry stored in `slot`, or `None` past the physical end.
    fn read_slot(&mut self, slot: u32) -> FatResult<Option<DirEntry>>;

    /// Number of slots the directory currently has room for.
    fn capacity(&self) -> u32;
}

/// A used directory entry and the slots it spans.
#[derive(Clone, Debug)]
pub struct UsedSlots {
    pub begin: u32,
    pub end: u32,
    /// `BASE.EXT` as stored on disk
    pub short_name: String,
    pub long_name: Option<String>,
    /// Snapshot of the short entry as it was scanned
    pub entry: DirEntry,
}

impl UsedSlots {
    /// Slot of the short entry, the last one of the run.
    pub fn entry_slot(&self) -> u32 {
        self.end - 1
    }

    /// Name to show for the entry.
    pub fn name(&self) -> String {
        match &self.long_name {
            Some(long) => long.clone(),
            None if self.entry.is_volume_label() => self.short_name.clone(),
            None => self.entry.display_name(),
        }
    }

    pub fn is_label(&self) -> bool {
        self.entry.is_volume_label()
    }

    /// Case-insensitive match against either name.
    pub fn matches(&self, name: &str) -> bool {
        if self.is_label() {
            return false;
        }
        let long = self
            .long_name
            .as_deref()
            .map_or(false, |long| eq_ignore_case(long, name));
        long || eq_ignore_case(&self.short_name, name)
    }

    pub fn matches_short(&self, short: &str) -> bool {
        !self.is_label() && eq_ignore_case(&self.short_name, short)
    }
}

pub fn eq_ignore_case(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_uppercase)
        .eq(b.chars().flat_map(char::to_uppercase))
}

#[derive(Debug)]
pub enum SlotRecord {
    Free { begin: u32, end: u32 },
    Used(UsedSlots),
    /// First slot holding the end marker, or the physical end
    End { slot: u32 },
}

impl SlotRecord {
    pub fn begin(&self) -> u32 {
        match self {
            SlotRecord::Free { begin, .. } => *begin,
            SlotRecord::Used(used) => used.begin,
            SlotRecord::End { slot } => *slot,
        }
    }

    pub fn end(&self) -> u32 {
        match self {
            SlotRecord::Free { end, .. } => *end,
            SlotRecord::Used(used) => used.end,
            SlotRecord::End { slot } => slot + 1,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, SlotRecord::End { .. })
    }
}

const INDEX_BITS: u32 = 4096;
const INDEX_WORDS: usize = (INDEX_BITS / 64) as usize;

/// Three-hash bloom filter over upper-cased names. With 4096 bits per
/// hash the false-positive rate is about 1e-5 at 100 names and a little
/// over 1% at 1000, so large directories mostly fall back to scanning.
#[derive(Clone)]
pub struct NameIndex {
    bits: [[u64; INDEX_WORDS]; 3],
}

impl Default for NameIndex {
    fn default() -> Self {
        Self {
            bits: [[0; INDEX_WORDS]; 3],
        }
    }
}

impl NameIndex {
    fn hash(name: &str) -> u32 {
        // FNV-1a over upper-cased scalar values
        name.chars()
            .flat_map(char::to_uppercase)
            .fold(0x811C_9DC5u32, |hash, c| {
                (hash ^ c as u32).wrapping_mul(0x0100_0193)
            })
    }

    fn bit_positions(name: &str) -> [u32; 3] {
        let hash = Self::hash(name);
        [
            hash % INDEX_BITS,
            hash.rotate_left(11) % INDEX_BITS,
            hash.rotate_left(22) % INDEX_BITS,
        ]
    }

    pub fn insert(&mut self, name: &str) {
        for (map, bit) in self.bits.iter_mut().zip(Self::bit_positions(name)) {
            map[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    pub fn may_contain(&self, name: &str) -> bool {
        self.bits
            .iter()
            .zip(Self::bit_positions(name))
            .all(|(map, bit)| map[(bit / 64) as usize] & (1 << (bit % 64)) != 0)
    }
}

pub struct DirectorySlotCache {
    slots: Vec<Option<Rc<SlotRecord>>>,
    end: Option<u32>,
    index: NameIndex,
    /// Every slot below this has been folded into `index`
    hashed_upto: u32,
}

impl Default for DirectorySlotCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectorySlotCache {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            end: None,
            index: NameIndex::default(),
            hashed_upto: 0,
        }
    }

    /// Cached record for `slot`, if one has been materialized.
    pub fn get(&self, slot: u32) -> Option<Rc<SlotRecord>> {
        if let Some(end) = self.end {
            if slot >= end {
                return self.slots.get(end as usize).cloned().flatten();
            }
        }
        self.slots.get(slot as usize).cloned().flatten()
    }

    pub fn end_slot(&self) -> Option<u32> {
        self.end
    }

    /// True when a negative `may_contain` answer can be trusted.
    pub fn is_index_complete(&self) -> bool {
        self.end.map_or(false, |end| self.hashed_upto >= end)
    }

    /// False only when `name` is certainly not in the directory.
    pub fn may_contain(&self, name: &str) -> bool {
        !self.is_index_complete() || self.index.may_contain(name)
    }

    fn ensure_len(&mut self, upto: u32) {
        let upto = upto as usize;
        if upto <= self.slots.len() {
            return;
        }
        let grown = (self.slots.len() * 2).max(upto).max(16);
        self.slots.resize(grown, None);
    }

    fn fold_names(&mut self, record: &SlotRecord) {
        if let SlotRecord::Used(used) = record {
            if used.is_label() {
                return;
            }
            self.index.insert(&used.short_name);
            if let Some(long) = &used.long_name {
                self.index.insert(long);
            }
        }
    }

    /// Advance the hashed watermark over a record that touches it.
    fn absorb(&mut self, record: &SlotRecord) {
        if record.begin() <= self.hashed_upto && record.end() > self.hashed_upto {
            self.fold_names(record);
            self.hashed_upto = record.end();
        }
    }

    fn fill(&mut self, record: SlotRecord) -> Rc<SlotRecord> {
        let (begin, end) = (record.begin(), record.end());
        self.ensure_len(end);
        let record = Rc::new(record);
        for slot in begin..end {
            self.slots[slot as usize] = Some(record.clone());
        }
        self.absorb(&record);
        record
    }

    /// Forget whatever covers `[begin, end)`. Free records that stick out
    /// keep their outside part; other records lose it.
    pub fn clear_range(&mut self, begin: u32, end: u32) {
        let limit = end.min(self.slots.len() as u32);
        let mut overlapping: Vec<Rc<SlotRecord>> = Vec::new();
        for slot in begin..limit {
            if let Some(record) = &self.slots[slot as usize] {
                if !overlapping.iter().any(|seen| Rc::ptr_eq(seen, record)) {
                    overlapping.push(record.clone());
                }
            }
        }
        for record in overlapping {
            let (rb, re) = (record.begin(), record.end());
            for slot in rb..re.min(self.slots.len() as u32) {
                self.slots[slot as usize] = None;
            }
            match *record {
                SlotRecord::Free { .. } => {
                    if rb < begin {
                        self.fill(SlotRecord::Free { begin: rb, end: begin });
                    }
                    if re > end {
                        self.fill(SlotRecord::Free { begin: end, end: re });
                    }
                }
                SlotRecord::End { .. } => self.end = None,
                SlotRecord::Used(_) => {}
            }
        }
    }

    fn put_free(&mut self, begin: u32, end: u32) -> Rc<SlotRecord> {
        self.clear_range(begin, end);
        let mut begin = begin;
        let mut end = end;
        if begin > 0 {
            if let Some(SlotRecord::Free { begin: left, .. }) = self.slot_record(begin - 1).as_deref() {
                begin = *left;
            }
        }
        if let Some(SlotRecord::Free { end: right, .. }) = self.slot_record(end).as_deref() {
            end = *right;
        }
        self.fill(SlotRecord::Free { begin, end })
    }

    fn slot_record(&self, slot: u32) -> Option<Rc<SlotRecord>> {
        self.slots.get(slot as usize).cloned().flatten()
    }

    /// Record `[begin, end)` as free, merging with free neighbours.
    pub fn add_free(&mut self, begin: u32, end: u32) -> Option<Rc<SlotRecord>> {
        if begin >= end {
            return None;
        }
        Some(self.put_free(begin, end))
    }

    pub fn add_used(&mut self, used: UsedSlots) -> Rc<SlotRecord> {
        self.clear_range(used.begin, used.end);
        self.fill(SlotRecord::Used(used))
    }

    /// Record an entry this session just wrote. Its names always go into
    /// the index, wherever the watermark is.
    pub fn insert_used(&mut self, used: UsedSlots) -> Rc<SlotRecord> {
        let record = SlotRecord::Used(used);
        self.fold_names(&record);
        self.clear_range(record.begin(), record.end());
        self.fill(record)
    }

    pub fn add_end(&mut self, slot: u32) -> Rc<SlotRecord> {
        if let Some(old) = self.end {
            if let Some(record) = self.slot_record(old) {
                if record.is_end() {
                    self.slots[old as usize] = None;
                }
            }
        }
        self.clear_range(slot, slot + 1);
        self.end = Some(slot);
        self.fill(SlotRecord::End { slot })
    }

    /// Materialize records from `start`, which must be a record boundary,
    /// until one covering a non-VSE slot exists. Returns that record.
    fn scan_from<S: SlotSource>(&mut self, start: u32, source: &mut S) -> FatResult<Rc<SlotRecord>> {
        let mut chain = VfatNameChain::new();
        let mut slot = start;
        loop {
            let entry = match source.read_slot(slot)? {
                Some(entry) if !entry.is_end_marker() => entry,
                _ => {
                    self.add_free(start, slot);
                    return Ok(self.add_end(slot));
                }
            };
            if entry.is_deleted() {
                return Ok(self.put_free(start, slot + 1));
            }
            if entry.is_long_name() {
                chain.push(&entry);
                slot += 1;
                continue;
            }

            let (long_name, count) = match chain.resolve(&entry.short_name_bytes()) {
                Some((name, count)) if count <= slot - start => (Some(name), count),
                _ => (None, 0),
            };
            let begin = slot - count;
            // VSEs that did not belong to this entry are orphans.
            self.add_free(start, begin);
            let short_name = if entry.is_volume_label() {
                entry.label()
            } else {
                entry.get_full_name()
            };
            return Ok(self.add_used(UsedSlots {
                begin,
                end: slot + 1,
                short_name,
                long_name,
                entry,
            }));
        }
    }

    /// The record covering `slot`, scanning raw slots from the nearest
    /// known boundary below it when needed. Any slot at or past the end
    /// marker classifies as the end record.
    pub fn classify<S: SlotSource>(&mut self, slot: u32, source: &mut S) -> FatResult<Rc<SlotRecord>> {
        if let Some(record) = self.get(slot) {
            self.absorb(&record);
            return Ok(record);
        }
        let mut start = slot.min(self.slots.len() as u32);
        while start > 0 && self.slots[(start - 1) as usize].is_none() {
            start -= 1;
        }
        loop {
            let record = self.scan_from(start, source)?;
            if record.end() > slot || record.is_end() {
                return Ok(record);
            }
            start = record.end();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfat::{long_name_slots, ShortName};

    struct VecSource {
        slots: Vec<DirEntry>,
        reads: usize,
    }

    impl SlotSource for VecSource {
        fn read_slot(&mut self, slot: u32) -> FatResult<Option<DirEntry>> {
            self.reads += 1;
            Ok(self.slots.get(slot as usize).copied())
        }

        fn capacity(&self) -> u32 {
            self.slots.len() as u32
        }
    }

    fn short(name: &str) -> DirEntry {
        let mut entry = DirEntry::new();
        entry.set_short_name(ShortName::parse(name).unwrap().raw());
        entry
    }

    fn long(name: &str, short_name: &str) -> Vec<DirEntry> {
        let short_name = ShortName::parse(short_name).unwrap();
        let units: Vec<u16> = name.encode_utf16().collect();
        let count = long_name_slots(name) as u8;
        let mut slots: Vec<DirEntry> = (0..count)
            .map(|i| DirEntry::long_name_part(&units, count - i, i == 0, short_name.checksum()))
            .collect();
        let mut entry = DirEntry::new();
        entry.set_short_name(short_name.raw());
        slots.push(entry);
        slots
    }

    fn deleted() -> DirEntry {
        let mut entry = short("GONE.TXT");
        entry.mark_deleted();
        entry
    }

    /// 0-2 long entry, 3 deleted, 4 short, 5 orphan VSE, 6 short, 7 end
    fn sample() -> VecSource {
        let mut slots = long("A very long file name.txt", "AVERYL~1.TXT");
        slots.push(deleted());
        slots.push(short("FOO.TXT"));
        slots.push(long("orphan", "ORPHAN")[0]);
        slots.push(short("BAR"));
        slots.resize(16, DirEntry::end_marker());
        VecSource { slots, reads: 0 }
    }

    #[test]
    fn every_slot_of_a_long_name_shares_one_record() {
        let mut source = sample();
        let mut cache = DirectorySlotCache::new();
        let record = cache.classify(1, &mut source).unwrap();
        match &*record {
            SlotRecord::Used(used) => {
                assert_eq!((used.begin, used.end), (0, 3));
                assert_eq!(used.long_name.as_deref(), Some("A very long file name.txt"));
                assert_eq!(used.short_name, "AVERYL~1.TXT");
            }
            other => panic!("unexpected {:?}", other),
        }
        for slot in 0..3 {
            assert!(Rc::ptr_eq(&cache.get(slot).unwrap(), &record));
        }
    }

    #[test]
    fn classification_walks_from_nearest_boundary() {
        let mut source = sample();
        let mut cache = DirectorySlotCache::new();
        match &*cache.classify(6, &mut source).unwrap() {
            SlotRecord::Used(used) => {
                assert_eq!(used.short_name, "BAR");
                assert_eq!(used.long_name, None);
                assert_eq!(used.begin, 6);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &*cache.classify(5, &mut source).unwrap() {
            SlotRecord::Free { begin, end } => assert_eq!((*begin, *end), (5, 6)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(cache.classify(7, &mut source).unwrap().is_end());
        assert!(cache.classify(12, &mut source).unwrap().is_end());

        let reads = source.reads;
        cache.classify(4, &mut source).unwrap();
        assert_eq!(source.reads, reads);
    }

    #[test]
    fn index_answers_negatively_only_when_complete() {
        let mut source = sample();
        let mut cache = DirectorySlotCache::new();
        cache.classify(0, &mut source).unwrap();
        assert!(cache.may_contain("nothing.here"));

        let mut slot = 0;
        loop {
            let record = cache.classify(slot, &mut source).unwrap();
            if record.is_end() {
                break;
            }
            slot = record.end();
        }
        assert!(cache.is_index_complete());
        assert!(cache.may_contain("foo.txt"));
        assert!(cache.may_contain("A VERY LONG FILE NAME.TXT"));
        assert!(cache.may_contain("averyl~1.txt"));
        assert!(cache.may_contain("bar"));
    }

    #[test]
    fn freeing_merges_with_neighbours() {
        let mut source = sample();
        let mut cache = DirectorySlotCache::new();
        cache.classify(6, &mut source).unwrap();
        cache.add_free(4, 5);
        match &*cache.get(4).unwrap() {
            SlotRecord::Free { begin, end } => assert_eq!((*begin, *end), (3, 6)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(Rc::ptr_eq(&cache.get(3).unwrap(), &cache.get(5).unwrap()));
    }

    #[test]
    fn insertion_keeps_records_consistent_with_disk() {
        let mut source = sample();
        let mut cache = DirectorySlotCache::new();
        cache.classify(7, &mut source).unwrap();

        // Reuse slots 3..6 for a new two-slot long name plus its short
        // entry, the way an insertion would.
        let new_slots = long("Quarterly report.pdf", "QUARTE~1.PDF");
        for (i, entry) in new_slots.iter().enumerate() {
            source.slots[3 + i] = *entry;
        }
        cache.insert_used(UsedSlots {
            begin: 3,
            end: 6,
            short_name: "QUARTE~1.PDF".into(),
            long_name: Some("Quarterly report.pdf".into()),
            entry: new_slots[2],
        });

        let mut fresh = DirectorySlotCache::new();
        for slot in 0..10 {
            let cached = cache.classify(slot, &mut source).unwrap();
            let scanned = fresh.classify(slot, &mut source).unwrap();
            assert_eq!((cached.begin(), cached.end()), (scanned.begin(), scanned.end()));
            match (&*cached, &*scanned) {
                (SlotRecord::Used(a), SlotRecord::Used(b)) => {
                    assert_eq!(a.name(), b.name());
                }
                (SlotRecord::Free { .. }, SlotRecord::Free { .. }) => {}
                (SlotRecord::End { .. }, SlotRecord::End { .. }) => {}
                (a, b) => panic!("cache has {:?}, disk has {:?}", a, b),
            }
        }
    }

    #[test]
    fn name_index_ignores_case() {
        let mut index = NameIndex::default();
        index.insert("Readme.TXT");
        assert!(index.may_contain("README.txt"));
    }
}
