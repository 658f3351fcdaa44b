use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Cancellation handle shared between a provisioning run and the signal
/// handler. Remote commands check it between output lines and stop early
/// once triggered.
#[derive(Clone, Default)]
pub struct Context {
    cancelled: Arc<AtomicBool>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the current run.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_visible_to_clones() {
        let ctx = Context::new();
        let clone = ctx.clone();

        assert!(!clone.is_cancelled());
        ctx.cancel();
        assert!(clone.is_cancelled());
    }
}
