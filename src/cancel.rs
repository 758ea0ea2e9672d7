//! Cooperative cancellation for long-running fingerprint, freeze and export work

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{ReproError, Result};

/// Shared cancellation flag
///
/// Clones observe the same flag, so a caller can hand one clone to the
/// worker and keep another to cancel from elsewhere.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Return `Cancelled` if cancellation was requested
    pub fn check(&self, what: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(ReproError::Cancelled(what.to_string()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let token = CancellationToken::new();
        let worker = token.clone();
        assert!(worker.check("fingerprint").is_ok());

        token.cancel();
        assert!(worker.is_cancelled());
        assert!(matches!(
            worker.check("fingerprint"),
            Err(ReproError::Cancelled(_))
        ));
    }
}
