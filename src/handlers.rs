//! Observer lists behind the `connect_*` methods.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Returned by `connect_*`; pass back to the matching `disconnect_*`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub(crate) u64);

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct HandlerList<F: ?Sized> {
    handlers: Mutex<Vec<(HandlerId, Arc<F>)>>,
}

impl<F: ?Sized> HandlerList<F> {
    pub fn new() -> Self {
        HandlerList {
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn connect(&self, handler: Arc<F>) -> HandlerId {
        let id = HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().push((id, handler));
        id
    }

    pub fn disconnect(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        handlers.len() != before
    }

    /// Handlers are invoked on a copy so that they may connect or
    /// disconnect while being emitted.
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        self.handlers
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect()
    }
}

impl<F: ?Sized> Default for HandlerList<F> {
    fn default() -> Self {
        HandlerList::new()
    }
}
