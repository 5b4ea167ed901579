//! Directory handles: slot access, lookup, and the entry insertion
//! algorithm that ties the slot cache, the VFAT name codec and the clash
//! protocol together.

use alloc::rc::Rc;
use core::cell::{Ref, RefCell};
use alloc::string::String;
use alloc::vec::Vec;

use crate::chain::{EntryLocation, FileHandle};
use crate::clash::{Clash, ClashAction, ClashHandler, ClashKind};
use crate::dircache::{DirectorySlotCache, SlotRecord, SlotSource, UsedSlots};
use crate::dirent::{DirEntry, DIR_ENTRY_SIZE};
use crate::error::{FatError, FatResult};
use crate::interrupt::Interrupt;
use crate::stream::{read_fully, write_fully, SharedStream};
use crate::vfat::{
    autorename_long, autorename_short, derive_short_name, long_name_slots, validate_long_name,
    validate_short_name, ShortName,
};
use crate::volume::VolumeShared;

/// Clash rounds after which an insertion gives up.
const MAX_CLASH_ROUNDS: u32 = 1000;

/// Slots between interrupt polls during a directory scan.
const SLOT_POLL_INTERVAL: u32 = 64;

struct StreamSlots<'a> {
    stream: SharedStream,
    interrupt: &'a Interrupt,
    capacity: u32,
}

impl<'a> StreamSlots<'a> {
    fn new(handle: &FileHandle, interrupt: &'a Interrupt) -> Self {
        let capacity = (handle.borrow().size() / DIR_ENTRY_SIZE as u64) as u32;
        let stream: SharedStream = handle.clone();
        Self {
            stream,
            interrupt,
            capacity,
        }
    }
}

impl SlotSource for StreamSlots<'_> {
    fn read_slot(&mut self, slot: u32) -> FatResult<Option<DirEntry>> {
        if slot >= self.capacity {
            return Ok(None);
        }
        if slot % SLOT_POLL_INTERVAL == 0 {
            self.interrupt.check()?;
        }
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        let got = read_fully(&self.stream, &mut raw, slot as u64 * DIR_ENTRY_SIZE as u64)?;
        if got < DIR_ENTRY_SIZE {
            return Ok(None);
        }
        Ok(Some(DirEntry::from_bytes(&raw)))
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// Outcome of looking for room for a new entry.
#[derive(Debug)]
pub enum SlotSearch {
    /// `needed` free slots start here
    Found { begin: u32 },
    /// No clash, but no free run is long enough
    NeedsGrow,
    Clash {
        kind: ClashKind,
        existing: Rc<SlotRecord>,
    },
}

#[derive(Clone, Debug)]
pub enum Insertion {
    Created {
        /// Slot of the short entry
        slot: u32,
        entry: DirEntry,
        /// The name that was finally used, after any renames
        name: String,
        short_name: ShortName,
    },
    Skipped,
}

/// An open directory. The slot cache lives with the shared chain, so every
/// `Directory` over the same directory sees the same records.
pub struct Directory {
    volume: Rc<VolumeShared>,
    stream: FileHandle,
    cache: Rc<RefCell<DirectorySlotCache>>,
}

impl Directory {
    pub(crate) fn new(volume: Rc<VolumeShared>, stream: FileHandle) -> Self {
        let cache = stream.borrow_mut().slot_cache();
        Self {
            volume,
            stream,
            cache,
        }
    }

    pub fn handle(&self) -> &FileHandle {
        &self.stream
    }

    pub fn cache(&self) -> Ref<'_, DirectorySlotCache> {
        self.cache.borrow()
    }

    pub fn is_fixed(&self) -> bool {
        self.stream.borrow().is_fixed_root()
    }

    /// Slots the directory has room for without growing.
    pub fn capacity(&self) -> u32 {
        (self.stream.borrow().size() / DIR_ENTRY_SIZE as u64) as u32
    }

    pub fn classify(&mut self, slot: u32) -> FatResult<Rc<SlotRecord>> {
        let mut source = StreamSlots::new(&self.stream, &self.volume.interrupt);
        self.cache.borrow_mut().classify(slot, &mut source)
    }

    pub fn read_entry(&self, slot: u32) -> FatResult<DirEntry> {
        let mut source = StreamSlots::new(&self.stream, &self.volume.interrupt);
        source.read_slot(slot)?.ok_or(FatError::NotFound)
    }

    pub fn write_entry(&self, slot: u32, entry: &DirEntry) -> FatResult<()> {
        let stream: SharedStream = self.stream.clone();
        let written = write_fully(
            &stream,
            entry.as_bytes(),
            slot as u64 * DIR_ENTRY_SIZE as u64,
        )?;
        if written != DIR_ENTRY_SIZE {
            return Err(if self.is_fixed() {
                FatError::DirectoryFull
            } else {
                FatError::NoSpace
            });
        }
        Ok(())
    }

    /// Every used entry except the volume label, in slot order.
    pub fn entries(&mut self) -> FatResult<Vec<UsedSlots>> {
        let mut entries = Vec::new();
        let mut slot = 0;
        loop {
            let record = self.classify(slot)?;
            match &*record {
                SlotRecord::Used(used) if !used.is_label() => entries.push(used.clone()),
                SlotRecord::End { .. } => break,
                _ => {}
            }
            slot = record.end();
        }
        Ok(entries)
    }

    /// The volume label entry, if the directory holds one.
    pub fn label(&mut self) -> FatResult<Option<String>> {
        let mut slot = 0;
        loop {
            let record = self.classify(slot)?;
            match &*record {
                SlotRecord::Used(used) if used.is_label() => return Ok(Some(used.short_name.clone())),
                SlotRecord::End { .. } => return Ok(None),
                _ => {}
            }
            slot = record.end();
        }
    }

    /// Find an entry by long or short name, ignoring case.
    pub fn lookup(&mut self, name: &str) -> FatResult<Option<UsedSlots>> {
        if !self.cache.borrow().may_contain(name) {
            return Ok(None);
        }
        let mut slot = 0;
        loop {
            let record = self.classify(slot)?;
            match &*record {
                SlotRecord::Used(used) if used.matches(name) => return Ok(Some(used.clone())),
                SlotRecord::End { .. } => return Ok(None),
                _ => {}
            }
            slot = record.end();
        }
    }

    /// Look for `needed` contiguous free slots while checking `name` and
    /// `short` against existing entries. A long-name match takes
    /// precedence over a short-name match found earlier in the scan.
    pub fn find_insertion_slots(
        &mut self,
        name: &str,
        short: &ShortName,
        needed: u32,
    ) -> FatResult<SlotSearch> {
        let short_text = short.display();
        let check_names = {
            let cache = self.cache.borrow();
            cache.may_contain(name) || cache.may_contain(&short_text)
        };
        let mut run: Option<(u32, u32)> = None;
        let mut found = None;
        let mut short_clash = None;
        let mut slot = 0;

        loop {
            let record = self.classify(slot)?;
            match &*record {
                SlotRecord::Free { begin, end } => {
                    let (run_begin, run_end) = match run {
                        Some((run_begin, run_end)) if run_end == *begin => (run_begin, *end),
                        _ => (*begin, *end),
                    };
                    run = Some((run_begin, run_end));
                    if found.is_none() && run_end - run_begin >= needed {
                        found = Some(run_begin);
                    }
                }
                SlotRecord::Used(used) => {
                    run = None;
                    if check_names {
                        if used.matches(name) {
                            return Ok(SlotSearch::Clash {
                                kind: ClashKind::LongName,
                                existing: record.clone(),
                            });
                        }
                        if short_clash.is_none() && used.matches_short(&short_text) {
                            short_clash = Some(record.clone());
                        }
                    }
                }
                SlotRecord::End { slot: end } => {
                    if found.is_none() {
                        // Everything from the end marker to capacity is free.
                        let begin = match run {
                            Some((run_begin, run_end)) if run_end == *end => run_begin,
                            _ => *end,
                        };
                        if begin + needed <= self.capacity() {
                            found = Some(begin);
                        }
                    }
                    break;
                }
            }
            if found.is_some() && !check_names {
                break;
            }
            slot = record.end();
        }

        if let Some(existing) = short_clash {
            return Ok(SlotSearch::Clash {
                kind: ClashKind::ShortName,
                existing,
            });
        }
        Ok(match found {
            Some(begin) => SlotSearch::Found { begin },
            None => SlotSearch::NeedsGrow,
        })
    }

    /// Create an entry called `name`. Clashes and invalid names go to
    /// `handler`; `write_data` fills in attributes, start cluster and size
    /// of the new short entry before it is written.
    pub fn insert<H, F>(&mut self, name: &str, handler: &mut H, mut write_data: F) -> FatResult<Insertion>
    where
        H: ClashHandler + ?Sized,
        F: FnMut(&mut DirEntry) -> FatResult<()>,
    {
        let mut name = String::from(name);
        let mut forced_short: Option<ShortName> = None;

        for _ in 0..MAX_CLASH_ROUNDS {
            self.volume.interrupt.check()?;

            let derived = derive_short_name(&name);
            let short = match forced_short {
                Some(short) => short,
                None if derived.lossy => autorename_short(&derived.short).ok_or(FatError::Aborted)?,
                None => derived.short,
            };
            let problem = validate_long_name(&name)
                .and_then(|_| validate_short_name(&short))
                .err();
            if let Some(problem) = problem {
                let clash = Clash {
                    kind: ClashKind::Invalid(problem),
                    name: &name,
                    short_name: Some(short.display()),
                    existing: None,
                };
                match handler.resolve(&clash) {
                    ClashAction::Autorename => {
                        name = autorename_long(&name).ok_or(FatError::Aborted)?;
                        forced_short = None;
                    }
                    ClashAction::Rename(new) => {
                        name = new;
                        forced_short = None;
                    }
                    ClashAction::Skip => return Ok(Insertion::Skipped),
                    ClashAction::Overwrite | ClashAction::Abort => return Err(FatError::Aborted),
                }
                continue;
            }

            let needs_long = derived.needs_long || short != derived.short;
            let needed = 1 + if needs_long { long_name_slots(&name) } else { 0 };

            let existing = match self.find_insertion_slots(&name, &short, needed)? {
                SlotSearch::Found { begin } => {
                    let case_flags = if needs_long { 0 } else { derived.case_flags };
                    let entry =
                        self.write_new_entry(begin, &name, &short, needs_long, case_flags, &mut write_data)?;
                    log::debug!("created {:?} as {:?} at slot {}", name, short, begin + needed - 1);
                    return Ok(Insertion::Created {
                        slot: begin + needed - 1,
                        entry,
                        name,
                        short_name: short,
                    });
                }
                SlotSearch::NeedsGrow => {
                    self.grow()?;
                    continue;
                }
                SlotSearch::Clash { kind, existing } => (kind, existing),
            };

            let (kind, record) = existing;
            let used = match &*record {
                SlotRecord::Used(used) => used,
                _ => return Err(FatError::Corrupt("clash on a record that is not in use")),
            };
            let clash = Clash {
                kind,
                name: &name,
                short_name: Some(short.display()),
                existing: Some(used),
            };
            let action = handler.resolve(&clash);
            log::debug!("{:?} clash on {:?}: {:?}", kind, name, action);
            match action {
                ClashAction::Autorename => match kind {
                    ClashKind::ShortName => {
                        forced_short = Some(autorename_short(&short).ok_or(FatError::Aborted)?);
                    }
                    _ => {
                        name = autorename_long(&name).ok_or(FatError::Aborted)?;
                        forced_short = None;
                    }
                },
                ClashAction::Rename(new) => {
                    name = new;
                    forced_short = None;
                }
                ClashAction::Overwrite => {
                    if used.entry.is_directory() {
                        log::warn!("refusing to overwrite directory {:?}", used.name());
                        return Err(FatError::InvalidArgument);
                    }
                    let slot = used.entry_slot();
                    self.remove(slot)?;
                }
                ClashAction::Skip => return Ok(Insertion::Skipped),
                ClashAction::Abort => return Err(FatError::Aborted),
            }
        }
        log::warn!("giving up on {:?} after {} clashes", name, MAX_CLASH_ROUNDS);
        Err(FatError::Aborted)
    }

    fn write_new_entry<F>(
        &mut self,
        begin: u32,
        name: &str,
        short: &ShortName,
        needs_long: bool,
        case_flags: u8,
        write_data: &mut F,
    ) -> FatResult<DirEntry>
    where
        F: FnMut(&mut DirEntry) -> FatResult<()>,
    {
        let vse_count = if needs_long { long_name_slots(name) } else { 0 };
        let end = begin + vse_count + 1;
        let capacity = self.capacity();
        let consumed_end = self
            .cache
            .borrow()
            .end_slot()
            .map_or(false, |marker| end > marker);

        let mut entry = DirEntry::new();
        entry.set_short_name(short.raw());
        entry.set_case_flags(case_flags);
        entry.set_timestamps((self.volume.config.clock)());
        write_data(&mut entry)?;

        if vse_count > 0 {
            let units: Vec<u16> = name.encode_utf16().collect();
            let checksum = short.checksum();
            // Highest ordinal first, so the chain reads back in order.
            for (i, slot) in (begin..end - 1).enumerate() {
                let ordinal = (vse_count - i as u32) as u8;
                let part = DirEntry::long_name_part(&units, ordinal, i == 0, checksum);
                self.write_entry(slot, &part)?;
            }
        }
        self.write_entry(end - 1, &entry)?;

        if consumed_end {
            if end < capacity {
                self.write_entry(end, &DirEntry::end_marker())?;
            }
        } else {
            self.clear_orphans_after(end)?;
        }

        let mut cache = self.cache.borrow_mut();
        cache.insert_used(UsedSlots {
            begin,
            end,
            short_name: short.display(),
            long_name: if needs_long { Some(String::from(name)) } else { None },
            entry,
        });
        if consumed_end {
            cache.add_end(end);
        }
        Ok(entry)
    }

    /// Stray VSE slots left in a reused free run would attach themselves
    /// to whatever short entry lands after them later; delete them.
    fn clear_orphans_after(&mut self, slot: u32) -> FatResult<()> {
        let record = self.cache.borrow().get(slot);
        let run_end = match record.as_deref() {
            Some(SlotRecord::Free { end, .. }) => *end,
            _ => return Ok(()),
        };
        for slot in slot..run_end {
            let mut entry = self.read_entry(slot)?;
            if entry.is_long_name() && !entry.is_deleted() {
                entry.mark_deleted();
                self.write_entry(slot, &entry)?;
            }
        }
        Ok(())
    }

    /// Delete the entry covering `slot` and release its clusters.
    pub fn remove(&mut self, slot: u32) -> FatResult<()> {
        let record = self.classify(slot)?;
        let used = match &*record {
            SlotRecord::Used(used) => used.clone(),
            _ => return Err(FatError::NotFound),
        };
        let current = self.read_entry(used.entry_slot())?;
        for slot in used.begin..used.end {
            let mut entry = self.read_entry(slot)?;
            entry.mark_deleted();
            self.write_entry(slot, &entry)?;
        }
        let first = self.volume.entry_cluster(&current);
        if first >= 2 && !current.is_volume_label() {
            let freed = self.volume.fat.borrow_mut().free_chain(first)?;
            log::debug!("removed {:?}, freeing {} clusters", used.name(), freed);
        }
        self.cache.borrow_mut().add_free(used.begin, used.end);
        Ok(())
    }

    /// Extend the directory by one zeroed cluster.
    pub fn grow(&mut self) -> FatResult<()> {
        if self.is_fixed() {
            return Err(FatError::DirectoryFull);
        }
        let cluster_bytes = self.volume.geometry.cluster_bytes() as usize;
        let size = self.stream.borrow().size();
        let zeros = alloc::vec![0u8; cluster_bytes];
        let stream: SharedStream = self.stream.clone();
        let written = write_fully(&stream, &zeros, size)?;
        if written != cluster_bytes {
            return Err(FatError::NoSpace);
        }
        log::debug!("grew directory to {} bytes", size + cluster_bytes as u64);
        Ok(())
    }

    /// Open the file or directory whose entry covers `slot`.
    pub fn open_entry(&mut self, slot: u32) -> FatResult<FileHandle> {
        let record = self.classify(slot)?;
        let entry_slot = match &*record {
            SlotRecord::Used(used) if !used.is_label() => used.entry_slot(),
            _ => return Err(FatError::NotFound),
        };
        let entry = self.read_entry(entry_slot)?;
        let location = EntryLocation {
            dir: self.stream.clone(),
            slot: entry_slot,
        };
        self.volume.open_by_entry(&entry, Some(location))
    }

    pub fn open_subdirectory(&mut self, slot: u32) -> FatResult<Directory> {
        let handle = self.open_entry(slot)?;
        if !handle.borrow().is_directory() {
            return Err(FatError::InvalidArgument);
        }
        Ok(Directory::new(self.volume.clone(), handle))
    }
}
