use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::{FatError, FatResult};

/// Cancellation flag shared by everything opened from one volume. A signal
/// handler (or another thread) raises it; long-running loops poll it and
/// bail out with `FatError::Interrupted`. Device writes already issued are
/// not rolled back.
#[derive(Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Poll point for loops.
    pub fn check(&self) -> FatResult<()> {
        if self.is_raised() {
            Err(FatError::Interrupted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Interrupt;
    use crate::error::FatError;

    #[test]
    fn clones_share_the_flag() {
        let a = Interrupt::new();
        let b = a.clone();
        assert!(a.check().is_ok());
        b.raise();
        assert_eq!(a.check(), Err(FatError::Interrupted));
        a.clear();
        assert!(!b.is_raised());
    }
}
