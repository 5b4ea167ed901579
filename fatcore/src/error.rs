use core::fmt;

/// Errors surfaced by the storage core. Name clashes are not errors: they
/// are routed through a `ClashHandler` and only become `Aborted` when the
/// handler gives up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FatError {
    /// The device failed, or returned a short transfer outside of EOF
    Io,
    /// On-disk metadata is inconsistent
    Corrupt(&'static str),
    /// A cluster chain points back into itself
    LoopDetected,
    /// No free cluster is left on the volume
    NoSpace,
    /// A fixed-size root directory has no room for another entry
    DirectoryFull,
    /// The boot sector does not describe a usable FAT volume
    InvalidBootSector,
    InvalidArgument,
    NotFound,
    /// No layer of a stream chain implements the operation
    Unsupported,
    /// The session's interrupt flag was raised
    Interrupted,
    /// A clash handler chose to abort
    Aborted,
}

impl FatError {
    /// True for the "disk full" family, which callers usually report
    /// differently from a generic failure.
    pub fn is_out_of_space(&self) -> bool {
        matches!(self, FatError::NoSpace | FatError::DirectoryFull)
    }
}

impl fmt::Display for FatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatError::Io => f.write_str("I/O error"),
            FatError::Corrupt(what) => write!(f, "filesystem corrupt: {}", what),
            FatError::LoopDetected => f.write_str("loop detected in cluster chain"),
            FatError::NoSpace => f.write_str("disk full"),
            FatError::DirectoryFull => f.write_str("directory full"),
            FatError::InvalidBootSector => f.write_str("invalid boot sector"),
            FatError::InvalidArgument => f.write_str("invalid argument"),
            FatError::NotFound => f.write_str("not found"),
            FatError::Unsupported => f.write_str("operation not supported"),
            FatError::Interrupted => f.write_str("interrupted"),
            FatError::Aborted => f.write_str("aborted"),
        }
    }
}

#[cfg(any(test, feature = "std"))]
impl From<std::io::Error> for FatError {
    fn from(_: std::io::Error) -> Self {
        FatError::Io
    }
}

pub type FatResult<T = usize> = Result<T, FatError>;
