//! Cooperative cancellation
//!
//! A token is checked before a transaction body runs and again before its
//! commit; derived views check it between student records.

use crate::error::{JourneyError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the token has fired
    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(JourneyError::Cancelled)
        } else {
            Ok(())
        }
    }
}
