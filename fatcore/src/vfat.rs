//! VFAT long-name support: the short-name checksum, reassembly of VSE
//! chains read from disk, short-name derivation, name validation, and the
//! two autorename schemes.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::dirent::{DirEntry, CASE_LOWER_BASE, CASE_LOWER_EXT, LAST_LONG_ENTRY, LONG_NAME_UNITS};

/// Longest name, in UTF-16 units, a VSE chain can carry.
pub const MAX_LONG_NAME: usize = 255;
/// Largest VSE ordinal: 20 slots of 13 units cover 255 plus a terminator.
pub const MAX_VSE_SLOTS: u8 = 20;

const ORDINAL_MASK: u8 = 0x1F;

const RESERVED_DEVICE_NAMES: [&str; 12] = [
    "CON", "AUX", "PRN", "NUL", "COM1", "COM2", "COM3", "COM4", "LPT1", "LPT2", "LPT3", "LPT4",
];

/// Characters no name may contain, long or short.
const LONG_ILLEGAL: &[char] = &['"', '*', '/', ':', '<', '>', '?', '\\', '|'];
/// Additional characters a short name may not contain.
const SHORT_ILLEGAL: &[u8] = b"+,;=[] .";

/// Checksum of an 11-byte short name, stored in every VSE of its chain.
pub fn short_name_checksum(name: &[u8; 11]) -> u8 {
    name.iter().fold(0u8, |sum, &c| {
        ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(c)
    })
}

/// A short name in its on-disk space-padded form.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ShortName {
    raw: [u8; 11],
}

impl fmt::Debug for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortName({:?})", self.display())
    }
}

impl ShortName {
    pub fn from_raw(raw: [u8; 11]) -> Self {
        Self { raw }
    }

    /// Parse a `BASE.EXT` string, upper-casing and padding it. Returns
    /// `None` when a part is too long.
    pub fn parse(name: &str) -> Option<Self> {
        let (base, ext) = match name.rfind('.') {
            Some(dot) if dot > 0 => (&name[..dot], &name[dot + 1..]),
            _ => (name, ""),
        };
        if base.is_empty() || base.len() > 8 || ext.len() > 3 || !name.is_ascii() {
            return None;
        }
        let mut raw = [0x20u8; 11];
        for (i, b) in base.bytes().enumerate() {
            raw[i] = b.to_ascii_uppercase();
        }
        for (i, b) in ext.bytes().enumerate() {
            raw[8 + i] = b.to_ascii_uppercase();
        }
        Some(Self { raw })
    }

    pub fn raw(&self) -> &[u8; 11] {
        &self.raw
    }

    pub fn checksum(&self) -> u8 {
        short_name_checksum(&self.raw)
    }

    fn base(&self) -> &[u8] {
        trim_padding(&self.raw[..8])
    }

    fn ext(&self) -> &[u8] {
        trim_padding(&self.raw[8..])
    }

    pub fn display(&self) -> String {
        let mut name: String = self.base().iter().map(|&b| b as char).collect();
        if !self.ext().is_empty() {
            name.push('.');
            name.extend(self.ext().iter().map(|&b| b as char));
        }
        name
    }
}

fn trim_padding(field: &[u8]) -> &[u8] {
    let len = field.iter().rposition(|&b| b != 0x20).map_or(0, |i| i + 1);
    &field[..len]
}

/// Why a name cannot be stored as given.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameProblem {
    Empty,
    TooLong,
    IllegalCharacter(char),
    ReservedDevice,
}

impl fmt::Display for NameProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameProblem::Empty => f.write_str("empty name"),
            NameProblem::TooLong => f.write_str("name too long"),
            NameProblem::IllegalCharacter(c) => write!(f, "illegal character {:?}", c),
            NameProblem::ReservedDevice => f.write_str("reserved device name"),
        }
    }
}

fn is_reserved_device(base: &str) -> bool {
    let base = base.trim_end_matches(' ');
    RESERVED_DEVICE_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(base))
}

/// Check a user-supplied name before it becomes a VSE chain.
pub fn validate_long_name(name: &str) -> Result<(), NameProblem> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(NameProblem::Empty);
    }
    if name.encode_utf16().count() > MAX_LONG_NAME {
        return Err(NameProblem::TooLong);
    }
    if let Some(c) = name
        .chars()
        .find(|&c| (c as u32) < 0x20 || LONG_ILLEGAL.contains(&c))
    {
        return Err(NameProblem::IllegalCharacter(c));
    }
    let base = name.split('.').next().unwrap_or(name);
    if is_reserved_device(base) {
        return Err(NameProblem::ReservedDevice);
    }
    Ok(())
}

/// Check a short name before it is written to disk.
pub fn validate_short_name(name: &ShortName) -> Result<(), NameProblem> {
    let raw = name.raw();
    if raw[0] == 0x20 {
        return Err(NameProblem::Empty);
    }
    for field in [name.base(), name.ext()] {
        for &b in field {
            let c = b as char;
            if b < 0x20
                || b.is_ascii_lowercase()
                || LONG_ILLEGAL.contains(&c)
                || SHORT_ILLEGAL.contains(&b)
            {
                return Err(NameProblem::IllegalCharacter(c));
            }
        }
    }
    let base: String = name.base().iter().map(|&b| b as char).collect();
    if is_reserved_device(&base) {
        return Err(NameProblem::ReservedDevice);
    }
    Ok(())
}

/// Result of squeezing a long name into 8.3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DerivedShortName {
    pub short: ShortName,
    /// Case flags for the short entry when the name fits 8.3 exactly
    pub case_flags: u8,
    /// The short name cannot reproduce the name; a VSE chain is required
    pub needs_long: bool,
    /// Characters were dropped or replaced; the name wants a numeric tail
    pub lossy: bool,
}

#[derive(Default)]
struct CaseSeen {
    upper: bool,
    lower: bool,
}

/// Map one part of a name into short-name bytes.
fn squeeze(part: &str, limit: usize, out: &mut Vec<u8>, case: &mut CaseSeen) -> bool {
    let mut lossy = false;
    for c in part.chars() {
        if out.len() == limit {
            lossy = true;
            break;
        }
        if c == ' ' || c == '.' {
            lossy = true;
            continue;
        }
        if !c.is_ascii() || (c as u32) < 0x20 || LONG_ILLEGAL.contains(&c) || SHORT_ILLEGAL.contains(&(c as u8)) {
            out.push(b'_');
            lossy = true;
            continue;
        }
        if c.is_ascii_lowercase() {
            case.lower = true;
        } else if c.is_ascii_uppercase() {
            case.upper = true;
        }
        out.push(c.to_ascii_uppercase() as u8);
    }
    lossy
}

/// Derive the short name that goes with `name`.
pub fn derive_short_name(name: &str) -> DerivedShortName {
    let trimmed = name.trim_start_matches(|c: char| c == '.' || c == ' ');
    let mut lossy = trimmed.len() != name.len();
    let (base, ext) = match trimmed.rfind('.') {
        Some(dot) => (&trimmed[..dot], &trimmed[dot + 1..]),
        None => (trimmed, ""),
    };

    let mut base_bytes = Vec::with_capacity(8);
    let mut ext_bytes = Vec::with_capacity(3);
    let mut base_case = CaseSeen::default();
    let mut ext_case = CaseSeen::default();
    lossy |= squeeze(base, 8, &mut base_bytes, &mut base_case);
    lossy |= squeeze(ext, 3, &mut ext_bytes, &mut ext_case);
    if base_bytes.is_empty() {
        base_bytes.push(b'_');
        lossy = true;
    }

    let mut raw = [0x20u8; 11];
    raw[..base_bytes.len()].copy_from_slice(&base_bytes);
    raw[8..8 + ext_bytes.len()].copy_from_slice(&ext_bytes);
    let short = ShortName { raw };

    let mixed = (base_case.upper && base_case.lower) || (ext_case.upper && ext_case.lower);
    let mut case_flags = 0;
    if !lossy && !mixed {
        if base_case.lower {
            case_flags |= CASE_LOWER_BASE;
        }
        if ext_case.lower {
            case_flags |= CASE_LOWER_EXT;
        }
    }
    DerivedShortName {
        short,
        case_flags,
        needs_long: lossy || mixed,
        lossy,
    }
}

/// Number of VSE slots needed to hold `name`.
pub fn long_name_slots(name: &str) -> u32 {
    let units = name.encode_utf16().count();
    ((units + LONG_NAME_UNITS - 1) / LONG_NAME_UNITS) as u32
}

/// Next short-name candidate: `BASE~n`, shrinking the base as `n` widens.
/// Returns `None` once no digit budget is left.
pub fn autorename_short(name: &ShortName) -> Option<ShortName> {
    let base = name.base();
    let (prefix, next) = match base.iter().rposition(|&b| b == b'~') {
        Some(tilde)
            if tilde + 1 < base.len() && base[tilde + 1..].iter().all(u8::is_ascii_digit) =>
        {
            let digits = core::str::from_utf8(&base[tilde + 1..]).ok()?;
            (&base[..tilde], digits.parse::<u32>().ok()? + 1)
        }
        _ => (base, 1),
    };
    let tail = format!("~{}", next);
    if tail.len() > 7 {
        return None;
    }
    let keep = prefix.len().min(8 - tail.len());
    let mut raw = [0x20u8; 11];
    for (i, &b) in prefix[..keep].iter().enumerate() {
        raw[i] = if SHORT_ILLEGAL.contains(&b) || LONG_ILLEGAL.contains(&(b as char)) {
            b'_'
        } else {
            b
        };
    }
    raw[keep..keep + tail.len()].copy_from_slice(tail.as_bytes());
    raw[8..].copy_from_slice(&name.raw[8..]);
    Some(ShortName { raw })
}

/// Next long-name candidate: `stem-n.ext`, trimming the stem to stay
/// within the long-name limit. Illegal characters become underscores.
pub fn autorename_long(name: &str) -> Option<String> {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if (c as u32) < 0x20 || LONG_ILLEGAL.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();
    let (stem, ext) = match sanitized.rfind('.') {
        Some(dot) if dot > 0 => (&sanitized[..dot], &sanitized[dot..]),
        _ => (sanitized.as_str(), ""),
    };
    let (prefix, next) = match stem.rfind('-') {
        Some(dash)
            if dash + 1 < stem.len() && stem[dash + 1..].bytes().all(|b| b.is_ascii_digit()) =>
        {
            (&stem[..dash], stem[dash + 1..].parse::<u32>().ok()?.checked_add(1)?)
        }
        _ => (stem, 1),
    };
    let tail = format!("-{}", next);
    let budget = MAX_LONG_NAME.checked_sub(tail.len() + ext.encode_utf16().count())?;
    let mut out = String::new();
    let mut used = 0;
    for c in prefix.chars() {
        if used + c.len_utf16() > budget {
            break;
        }
        used += c.len_utf16();
        out.push(c);
    }
    out.push_str(&tail);
    out.push_str(ext);
    Some(out)
}

/// Reassembles a long name from the VSE slots preceding a short entry.
///
/// Slots are pushed in on-disk order. A change of checksum abandons the
/// fragments gathered so far; the chain only resolves when every ordinal
/// up to the last one was seen and the checksum matches the short entry.
pub struct VfatNameChain {
    units: [u16; MAX_VSE_SLOTS as usize * LONG_NAME_UNITS],
    /// Bit n set once ordinal n+1 arrived
    present: u32,
    subentries: u8,
    checksum: u8,
    last_seen: bool,
    pushed: u32,
}

impl Default for VfatNameChain {
    fn default() -> Self {
        Self::new()
    }
}

impl VfatNameChain {
    pub fn new() -> Self {
        Self {
            units: [0; MAX_VSE_SLOTS as usize * LONG_NAME_UNITS],
            present: 0,
            subentries: 0,
            checksum: 0,
            last_seen: false,
            pushed: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Number of VSE slots pushed since the last reset.
    pub fn pushed(&self) -> u32 {
        self.pushed
    }

    pub fn push(&mut self, entry: &DirEntry) {
        let ordinal = entry.long_ordinal();
        let id = ordinal & ORDINAL_MASK;
        if id == 0 || id > MAX_VSE_SLOTS {
            log::debug!("ignoring VSE with ordinal {:#x}", ordinal);
            return;
        }
        if self.pushed > 0 && entry.long_checksum() != self.checksum {
            self.reset();
        }
        if self.pushed == 0 {
            self.checksum = entry.long_checksum();
        }
        self.pushed += 1;
        self.present |= 1 << (id - 1);
        if ordinal & LAST_LONG_ENTRY != 0 {
            self.last_seen = true;
            self.subentries = id;
        }
        let start = (id as usize - 1) * LONG_NAME_UNITS;
        self.units[start..start + LONG_NAME_UNITS].copy_from_slice(&entry.long_units());
    }

    /// The long name for `short`, with the number of slots it occupied,
    /// or `None` when the chain is incomplete or belongs to another entry.
    pub fn resolve(&self, short: &[u8; 11]) -> Option<(String, u32)> {
        if !self.last_seen || self.subentries == 0 {
            return None;
        }
        let wanted = (1u32 << self.subentries) - 1;
        if self.present & wanted != wanted {
            return None;
        }
        if short_name_checksum(short) != self.checksum {
            log::debug!("VSE checksum mismatch, treating long name as orphaned");
            return None;
        }
        let limit = self.subentries as usize * LONG_NAME_UNITS;
        let len = self.units[..limit]
            .iter()
            .position(|&u| u == 0x0000 || u == 0xFFFF)
            .unwrap_or(limit);
        let name = char::decode_utf16(self.units[..len].iter().copied())
            .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect();
        Some((name, self.subentries as u32))
    }
}
