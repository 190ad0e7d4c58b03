//! Executor binding for callbacks.
//!
//! Every object that surfaces callbacks records the [`MainContext`] that was
//! the thread default when it was created. Work destined for that object is
//! handed to [`MainContext::invoke`]: if the context is the calling thread's
//! default the closure runs immediately, otherwise it is queued until the
//! owning thread calls [`MainContext::iteration`].

use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, OnceLock};

type Task = Box<dyn FnOnce() + Send>;

struct Inner {
    queue: Mutex<VecDeque<Task>>,
    wakeup: Condvar,
}

#[derive(Clone)]
pub struct MainContext {
    inner: Arc<Inner>,
}

thread_local! {
    static THREAD_DEFAULT: RefCell<Vec<MainContext>> = const { RefCell::new(Vec::new()) };
}

static GLOBAL_DEFAULT: OnceLock<MainContext> = OnceLock::new();

impl MainContext {
    pub fn new() -> MainContext {
        MainContext {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                wakeup: Condvar::new(),
            }),
        }
    }

    /// The process-wide context, used by threads that never pushed one.
    pub fn global() -> MainContext {
        GLOBAL_DEFAULT.get_or_init(MainContext::new).clone()
    }

    /// The innermost context pushed on this thread, or the global one.
    pub fn ref_thread_default() -> MainContext {
        THREAD_DEFAULT
            .with(|stack| stack.borrow().last().cloned())
            .unwrap_or_else(MainContext::global)
    }

    pub fn push_thread_default(&self) {
        THREAD_DEFAULT.with(|stack| stack.borrow_mut().push(self.clone()));
    }

    /// Pops `self`, which must be the innermost pushed context.
    pub fn pop_thread_default(&self) {
        THREAD_DEFAULT.with(|stack| {
            let mut stack = stack.borrow_mut();
            match stack.last() {
                Some(top) if top.ptr_eq(self) => {
                    stack.pop();
                }
                _ => log::warn!("pop_thread_default called for a context that is not the innermost"),
            }
        });
    }

    /// Runs `f` with `self` pushed as the thread default.
    pub fn with_thread_default<R>(&self, f: impl FnOnce() -> R) -> R {
        self.push_thread_default();
        let r = f();
        self.pop_thread_default();
        r
    }

    pub fn ptr_eq(&self, other: &MainContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_current(&self) -> bool {
        self.ptr_eq(&MainContext::ref_thread_default())
    }

    pub fn invoke<F: FnOnce() + Send + 'static>(&self, f: F) {
        if self.is_current() {
            f();
        } else {
            self.post(f);
        }
    }

    /// Always queues, even on the owning thread.
    pub fn post<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.inner.queue.lock().push_back(Box::new(f));
        self.inner.wakeup.notify_all();
    }

    pub fn pending(&self) -> bool {
        !self.inner.queue.lock().is_empty()
    }

    /// Runs queued tasks, including any queued while running, and returns
    /// how many ran. With `may_block` an empty queue waits for the first
    /// task.
    pub fn iteration(&self, may_block: bool) -> usize {
        let mut dispatched = 0;
        loop {
            let task = {
                let mut queue = self.inner.queue.lock();
                if queue.is_empty() && may_block && dispatched == 0 {
                    self.inner.wakeup.wait(&mut queue);
                }
                queue.pop_front()
            };
            match task {
                Some(task) => {
                    self.with_thread_default(task);
                    dispatched += 1;
                }
                None => return dispatched,
            }
        }
    }

    /// Drives an operation that reports through a callback to completion
    /// on a private context, so that its callbacks cannot be starved by a
    /// context the caller is blocking.
    pub fn run_sync<T, F>(start: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(Box<dyn FnOnce(T) + Send>),
    {
        let ctx = MainContext::new();
        let slot = Arc::new(Mutex::new(None));
        {
            let slot = slot.clone();
            let waker = ctx.clone();
            ctx.with_thread_default(|| {
                start(Box::new(move |value| {
                    *slot.lock() = Some(value);
                    // wake a blocked iteration
                    waker.post(|| {});
                }))
            });
        }
        loop {
            if let Some(value) = slot.lock().take() {
                return value;
            }
            ctx.iteration(true);
        }
    }
}

impl Default for MainContext {
    fn default() -> Self {
        MainContext::new()
    }
}

impl fmt::Debug for MainContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainContext")
            .field("ptr", &Arc::as_ptr(&self.inner))
            .field("pending", &self.inner.queue.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_log::test;

    #[test]
    fn invoke_inline_when_current() {
        let ctx = MainContext::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        ctx.invoke(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(ctx.pending());
        assert_eq!(ctx.iteration(false), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let h = hits.clone();
        let c2 = ctx.clone();
        ctx.with_thread_default(move || {
            c2.invoke(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(!ctx.pending());
    }

    #[test]
    fn thread_default_stack() {
        let outer = MainContext::new();
        let inner = MainContext::new();
        outer.push_thread_default();
        inner.push_thread_default();
        assert!(inner.is_current());
        inner.pop_thread_default();
        assert!(outer.is_current());
        outer.pop_thread_default();
        assert!(MainContext::global().is_current());
    }

    #[test]
    fn run_sync_from_other_thread() {
        let value: u32 = MainContext::run_sync(|done| {
            let ctx = MainContext::ref_thread_default();
            std::thread::spawn(move || ctx.invoke(move || done(7)));
        });
        assert_eq!(value, 7);
    }
}
