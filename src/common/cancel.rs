//! Cooperative cancellation.
//!
//! Long-running analyses poll a shared token between units of work and bail
//! out with [Cancelled] when an operator asked them to stop.  Cancellation
//! is not an error condition: the caller drops whatever partial state the
//! cancelled analysis produced and reports a cancelled outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The result of hitting a cancellation point after the token fired.
#[derive(Clone, Copy, PartialEq, Eq, Debug, thiserror::Error)]
#[error("the operation was cancelled")]
pub struct Cancelled;

/// A cheaply cloneable handle to a shared cancellation flag.
///
/// All clones observe the same flag, so the driver can hand one token to
/// every per-function analysis and cancel them all at once.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.  All clones of this token start reporting
    /// cancelled from now on.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// A poll site: returns `Err(Cancelled)` once the token fired.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert_eq!(token.check(), Ok(()));
    }

    #[test]
    fn all_clones_observe_cancellation() {
        let token = CancellationToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
        assert_eq!(clone.check(), Err(Cancelled));
    }
}
