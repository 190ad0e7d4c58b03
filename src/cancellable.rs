//! Cancellation tokens shared between an operation and its caller.

use crate::error::{Error, Result};

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

type CancelHandler = Box<dyn FnOnce() + Send>;

struct Inner {
    cancelled: AtomicBool,
    handlers: Mutex<Vec<(u64, CancelHandler)>>,
    next_id: AtomicU64,
}

/// A cloneable handle; all clones observe the same cancellation.
#[derive(Clone)]
pub struct Cancellable {
    inner: Arc<Inner>,
}

impl Cancellable {
    pub fn new() -> Cancellable {
        Cancellable {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                handlers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Marks the token cancelled and runs every connected handler once.
    /// Later calls do nothing.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let handlers = std::mem::take(&mut *self.inner.handlers.lock());
        for (_, handler) in handlers {
            handler();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn set_error_if_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs `handler` on cancellation. If the token is already cancelled
    /// the handler runs immediately and 0 is returned.
    pub fn connect<F: FnOnce() + Send + 'static>(&self, handler: F) -> u64 {
        {
            let mut handlers = self.inner.handlers.lock();
            if !self.is_cancelled() {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                handlers.push((id, Box::new(handler)));
                return id;
            }
        }
        handler();
        0
    }

    pub fn disconnect(&self, id: u64) {
        if id == 0 {
            return;
        }
        self.inner.handlers.lock().retain(|(hid, _)| *hid != id);
    }

    pub fn ptr_eq(&self, other: &Cancellable) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Cancellable {
    fn default() -> Self {
        Cancellable::new()
    }
}

impl fmt::Debug for Cancellable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellable")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use test_log::test;

    #[test]
    fn handlers_run_once() {
        let c = Cancellable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = c.connect(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_ne!(id, 0);
        let h = hits.clone();
        let removed = c.connect(move || {
            h.fetch_add(10, Ordering::SeqCst);
        });
        c.disconnect(removed);
        assert!(c.set_error_if_cancelled().is_ok());
        c.clone().cancel();
        c.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(matches!(c.set_error_if_cancelled(), Err(Error::Cancelled)));
    }

    #[test]
    fn connect_after_cancel_runs_now() {
        let c = Cancellable::new();
        c.cancel();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        assert_eq!(
            c.connect(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
            0
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
