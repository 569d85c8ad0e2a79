use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

/// Opaque key grouping queue entries that belong to one logical owner.
///
/// Owners derive their tag from a stable address; the null tag never
/// matches anything, so shared queues cannot be cleaned up by accident.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct OwnerTag(usize);

impl OwnerTag {
    pub const NONE: OwnerTag = OwnerTag(0);

    #[inline]
    pub fn from_addr<T: ?Sized>(addr: *const T) -> OwnerTag {
        OwnerTag(addr as *const () as usize)
    }

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Execution deadline of a queue entry. Immediate entries sort before
/// every timed entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum Due {
    Immediate,
    At(Instant),
}

impl Due {
    #[inline]
    fn is_due(self, now: Instant) -> bool {
        match self {
            Due::Immediate => true,
            Due::At(at) => at <= now,
        }
    }
}

pub(crate) type QueuedCallback = Box<dyn FnOnce(Instant) + Send>;

struct Entry {
    due: Due,
    owner: OwnerTag,
    callback: QueuedCallback,
}

/// Priority queue of scheduled callbacks, ordered by deadline.
///
/// The queue serializes deferred work for execution on a single thread.
/// Entries with equal deadlines keep their registration order, and all
/// immediate entries run before any timed entry. The interface is
/// thread-safe; callbacks always run with the queue lock released, so a
/// callback may re-register work without deadlocking.
pub(crate) struct TimerQueue {
    queue: Mutex<VecDeque<Entry>>,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Inserts an entry to run on the next processing pass, after all
    /// other immediate entries but before any timed entry.
    pub fn register_immediate(&self, callback: QueuedCallback, owner: OwnerTag) {
        self.insert(Due::Immediate, callback, owner);
    }

    /// Inserts an entry to run once `until` has passed. Entries sharing a
    /// deadline go to the end of the equal run.
    pub fn register_timed(&self, until: Instant, callback: QueuedCallback, owner: OwnerTag) {
        self.insert(Due::At(until), callback, owner);
    }

    fn insert(&self, due: Due, callback: QueuedCallback, owner: OwnerTag) {
        let entry = Entry { due, owner, callback };

        let mut queue = self.queue.lock().unwrap();
        let at = queue.iter().position(|queued| due < queued.due).unwrap_or_else(|| queue.len());
        queue.insert(at, entry);
    }

    /// Runs every entry due at `now`, in order. Each entry is unlinked and
    /// its callback moved out before the lock is released for the
    /// invocation, so callbacks can re-register themselves.
    ///
    /// Returns the deadline of the first entry still queued, or None when
    /// the queue has drained.
    pub fn process(&self, now: Instant) -> Option<Instant> {
        let mut queue = self.queue.lock().unwrap();
        loop {
            match queue.front() {
                Some(entry) if entry.due.is_due(now) => (),
                Some(entry) => {
                    return match entry.due {
                        Due::At(at) => Some(at),
                        // Immediate entries are always due
                        Due::Immediate => unreachable!(),
                    };
                }
                None => return None,
            }

            let entry = queue.pop_front().expect("Queue front vanished under lock");
            drop(queue);
            (entry.callback)(now);
            queue = self.queue.lock().unwrap();
        }
    }

    /// Removes every entry registered with `owner`, destroying the
    /// callbacks without running them. The null owner removes nothing.
    pub fn clean_up_owner(&self, owner: OwnerTag) {
        if owner.is_none() {
            return;
        }

        let removed: Vec<Entry> = {
            let mut queue = self.queue.lock().unwrap();
            let mut kept = VecDeque::with_capacity(queue.len());
            let mut removed = Vec::new();
            for entry in queue.drain(..) {
                if entry.owner == owner {
                    removed.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            *queue = kept;
            removed
        };

        // Callback captures are released outside the lock
        drop(removed);
    }
}
