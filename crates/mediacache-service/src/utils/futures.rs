/// Execute a callback on dropping of the container type.
///
/// The callback must not panic under any circumstance. Since it is called while dropping an item,
/// this might result in aborting program execution.
pub struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CallOnDrop {
    /// Creates a new `CallOnDrop`.
    pub fn new<F: FnOnce() + Send + 'static>(f: F) -> CallOnDrop {
        CallOnDrop {
            f: Some(Box::new(f)),
        }
    }

    /// Consumes the guard without running the callback.
    pub fn disarm(mut self) {
        self.f.take();
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

impl std::fmt::Debug for CallOnDrop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOnDrop")
            .field("armed", &self.f.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn test_call_on_drop() {
        let called = Arc::new(AtomicBool::new(false));
        let guard = {
            let called = Arc::clone(&called);
            CallOnDrop::new(move || called.store(true, Ordering::SeqCst))
        };
        assert!(!called.load(Ordering::SeqCst));
        drop(guard);
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_disarm() {
        let called = Arc::new(AtomicBool::new(false));
        let guard = {
            let called = Arc::clone(&called);
            CallOnDrop::new(move || called.store(true, Ordering::SeqCst))
        };
        guard.disarm();
        assert!(!called.load(Ordering::SeqCst));
    }
}
