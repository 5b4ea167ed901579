use alloc::string::String;

use crate::dircache::UsedSlots;
use crate::vfat::NameProblem;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClashKind {
    /// The name matches an existing entry's long or short name
    LongName,
    /// Only the generated short name is taken
    ShortName,
    /// The name cannot be stored as given
    Invalid(NameProblem),
}

/// Everything a handler needs to decide what to do about a name that
/// cannot be inserted as is.
#[derive(Debug)]
pub struct Clash<'a> {
    pub kind: ClashKind,
    pub name: &'a str,
    pub short_name: Option<String>,
    pub existing: Option<&'a UsedSlots>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClashAction {
    /// Generate the next candidate name and retry
    Autorename,
    /// Retry with a name of the caller's choosing
    Rename(String),
    /// Delete the existing entry and take its name
    Overwrite,
    /// Give up on this entry quietly
    Skip,
    /// Give up and report failure
    Abort,
}

pub trait ClashHandler {
    fn resolve(&mut self, clash: &Clash<'_>) -> ClashAction;
}

impl<F> ClashHandler for F
where
    F: FnMut(&Clash<'_>) -> ClashAction,
{
    fn resolve(&mut self, clash: &Clash<'_>) -> ClashAction {
        self(clash)
    }
}

/// Answers every clash with the same action, the way a batch run with a
/// preset policy would.
#[derive(Clone, Debug)]
pub struct FixedPolicy(pub ClashAction);

impl ClashHandler for FixedPolicy {
    fn resolve(&mut self, clash: &Clash<'_>) -> ClashAction {
        log::debug!("{:?} clash on {:?}, applying {:?}", clash.kind, clash.name, self.0);
        self.0.clone()
    }
}
