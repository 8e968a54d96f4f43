use std::sync::atomic::{AtomicBool, Ordering};

/// Test hook that pauses a specific code path while enabled.
#[derive(Debug)]
pub struct FailPoint {
    name: &'static str,
    enabled: AtomicBool,
}

impl FailPoint {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            enabled: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// Pauses the batch assembler between assembling and publishing batches.
/// Clean shutdown while this is active is fatal.
pub static BATCHER_PAUSE: FailPoint = FailPoint::new("pause-batcher");

/// Holds the missing-document fetch before contacting the sync source.
pub static MISSING_DOC_FETCH_PAUSE: FailPoint = FailPoint::new("pause-missing-doc-fetch");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggling_is_visible() {
        let fp = FailPoint::new("test-point");
        assert!(!fp.is_active());
        fp.enable();
        assert!(fp.is_active());
        fp.disable();
        assert!(!fp.is_active());
        assert_eq!(fp.name(), "test-point");
    }
}
