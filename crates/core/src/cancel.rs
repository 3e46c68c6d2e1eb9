use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::ErrorCategory;

/// Cooperative cancellation flag, observed between steps, before each tool
/// invocation, and when a subprocess times out.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), ErrorCategory> {
        if self.is_cancelled() {
            Err(ErrorCategory::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_starts_clear_and_latches() {
        let flag = CancelFlag::new();
        assert!(flag.check().is_ok());
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
        assert_eq!(flag.check(), Err(ErrorCategory::Cancelled));
    }
}
