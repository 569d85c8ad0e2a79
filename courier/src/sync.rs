use std::cell::RefCell;
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

/// A fail-fast cell for state that belongs to a single service thread.
///
/// The cell is bound to its thread once, at thread startup. Any access
/// from another thread, and any re-entrant access from the owning thread,
/// panics instead of racing.
pub(crate) struct ReactorCell<T> {
    item: RefCell<T>,
    thread: Mutex<Option<ThreadId>>,
}

// The RefCell is only ever touched by the bound thread; `with` enforces it.
unsafe impl<T: Send> Sync for ReactorCell<T> {}

impl<T> ReactorCell<T> {
    pub fn new(item: T) -> ReactorCell<T> {
        ReactorCell {
            item: RefCell::new(item),
            thread: Mutex::new(None),
        }
    }

    /// Binds the cell to the calling thread. May only happen once.
    pub fn bind(&self) {
        let mut bound = self.thread.lock().unwrap();

        if bound.is_some() {
            panic!("Cell is already bound to a thread");
        }

        *bound = Some(thread::current().id());
    }

    /// Returns true when called on the bound thread.
    #[inline]
    pub fn is_bound_thread(&self) -> bool {
        *self.thread.lock().unwrap() == Some(thread::current().id())
    }

    /// Grants mutable access to the contents on the bound thread.
    #[inline]
    pub fn with<R, F: FnOnce(&mut T) -> R>(&self, f: F) -> R {
        if !self.is_bound_thread() {
            panic!("Attempted to access engine state from outside the engine thread");
        }

        let mut item = self.item.borrow_mut();
        f(&mut item)
    }
}

struct RendezvousState<T> {
    ready: bool,
    value: Option<T>,
}

/// One-shot rendezvous between a waiting thread and a single completion.
///
/// The rendezvous lives on the waiter's stack and owns nothing but an
/// inline mutex/condvar pair; no heap is involved. A `RendezvousHandle`
/// carries a raw pointer back to it, so the waiter must not return (and
/// the rendezvous must not move) until the handle has fired. The send
/// machinery guarantees that by completing every pending reply callback,
/// either with the reply or with a broken-pipe error, before a connection
/// finishes stopping.
pub(crate) struct Rendezvous<T> {
    state: Mutex<RendezvousState<T>>,
    cond: Condvar,
}

impl<T: Send> Rendezvous<T> {
    pub fn new() -> Rendezvous<T> {
        Rendezvous {
            state: Mutex::new(RendezvousState {
                ready: false,
                value: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Creates the completion handle.
    ///
    /// # Safety
    ///
    /// The handle borrows `self` for an unbounded lifetime. The caller
    /// must keep the rendezvous pinned in place and must not let it go
    /// out of scope until `wait` has returned, and the handle must be
    /// completed exactly once.
    pub unsafe fn handle(&self) -> RendezvousHandle<T> {
        RendezvousHandle {
            target: self as *const Rendezvous<T>,
        }
    }

    /// Blocks until the handle fires and yields the delivered value.
    pub fn wait(&self) -> T {
        let mut state = self.state.lock().unwrap();
        while !state.ready {
            state = self.cond.wait(state).unwrap();
        }
        state.value.take().expect("Rendezvous fired without a value")
    }
}

pub(crate) struct RendezvousHandle<T> {
    target: *const Rendezvous<T>,
}

// The pointee is pinned on the waiter's stack until wait() returns.
unsafe impl<T: Send> Send for RendezvousHandle<T> {}

impl<T: Send> RendezvousHandle<T> {
    /// Delivers the value and wakes the waiter.
    pub fn complete(self, value: T) {
        let rendezvous = unsafe { &*self.target };

        let mut state = rendezvous.state.lock().unwrap();
        state.value = Some(value);
        state.ready = true;
        // Wake while still holding the lock: the waiter cannot release the
        // rendezvous storage before this thread is done with the mutex.
        rendezvous.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rendezvous_complete_then_wait() {
        let rendezvous = Rendezvous::new();
        let handle = unsafe { rendezvous.handle() };

        handle.complete(42u32);
        assert_eq!(rendezvous.wait(), 42);
    }

    #[test]
    fn test_rendezvous_cross_thread() {
        let rendezvous = Rendezvous::new();
        let handle = unsafe { rendezvous.handle() };

        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.complete("done");
        });

        assert_eq!(rendezvous.wait(), "done");
        worker.join().unwrap();
    }

    #[test]
    fn test_reactor_cell_on_bound_thread() {
        let cell = ReactorCell::new(5);
        cell.bind();

        assert!(cell.is_bound_thread());
        assert_eq!(cell.with(|item| *item), 5);

        cell.with(|item| *item = 10);
        assert_eq!(cell.with(|item| *item), 10);
    }

    #[test]
    fn test_reactor_cell_rejects_foreign_thread() {
        let cell = std::sync::Arc::new(ReactorCell::new(5));
        cell.bind();

        let cell_remote = cell.clone();
        let result = thread::spawn(move || cell_remote.with(|item| *item)).join();

        assert!(result.is_err());
        // The owning thread is unaffected
        assert_eq!(cell.with(|item| *item), 5);
    }

    #[test]
    fn test_reactor_cell_unbound_rejects_everyone() {
        let cell = ReactorCell::new(5);
        assert!(!cell.is_bound_thread());
    }
}
