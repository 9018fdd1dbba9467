//! The completion queue: a thread-safe, multi-producer multi-consumer
//! sink for asynchronous completion events.
//!
//! Producers are the batch executor, the server request loop and
//! server shutdown. Consumers are application threads blocking in
//! [`CompletionQueue::next`] or [`CompletionQueue::pluck`]. Every
//! accepted submission produces exactly one event, and each event is
//! delivered to exactly one consumer.

use callmux_core::deadline::Deadline;
use callmux_core::error::{CallError, PluckError};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

/// Upper bound on concurrent [`CompletionQueue::pluck`] callers.
pub const MAX_PLUCKERS: usize = 6;

/// Opaque user token echoed on completion, bit-exact.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(pub u64);

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tag({})", self.0)
    }
}

impl fmt::Display for Tag {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<u64> for Tag {
    #[inline]
    fn from(v: u64) -> Self {
        Tag(v)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventKind {
    /// A submitted batch (or request/shutdown intent) finished.
    OpComplete,
    /// The consumer's deadline elapsed with nothing ready.
    Timeout,
    /// The queue has shut down and drained; no more events will come.
    Shutdown,
}

#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub kind: EventKind,
    pub tag: Tag,
    pub success: bool,
}

impl Event {
    #[inline]
    fn op(tag: Tag, success: bool) -> Self {
        Self { kind: EventKind::OpComplete, tag, success }
    }

    #[inline]
    fn timeout() -> Self {
        Self { kind: EventKind::Timeout, tag: Tag(0), success: false }
    }

    #[inline]
    fn shutdown() -> Self {
        Self { kind: EventKind::Shutdown, tag: Tag(0), success: false }
    }
}

struct CqState {
    ready: VecDeque<Event>,
    /// Accepted submissions that have not yet produced their event.
    outstanding: usize,
    shutdown_requested: bool,
    /// Tags currently claimed by a blocked `pluck`; `next` skips them.
    pluckers: Vec<Tag>,
}

struct CqInner {
    state: Mutex<CqState>,
    cond: Condvar,
}

/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct CompletionQueue {
    inner: Arc<CqInner>,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CqInner {
                state: Mutex::new(CqState {
                    ready: VecDeque::new(),
                    outstanding: 0,
                    shutdown_requested: false,
                    pluckers: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Claims a slot for work that will later post exactly one event.
    /// Fails once shutdown has been requested.
    pub(crate) fn begin_op(&self) -> Result<(), CallError> {
        let mut st = self.inner.state.lock().unwrap();
        if st.shutdown_requested {
            return Err(CallError::QueueShutdown);
        }
        st.outstanding += 1;
        Ok(())
    }

    /// Posts the event for a slot claimed with `begin_op`.
    pub(crate) fn end_op(&self, tag: Tag, success: bool) {
        let mut st = self.inner.state.lock().unwrap();
        debug_assert!(st.outstanding > 0);
        st.outstanding = st.outstanding.saturating_sub(1);
        st.ready.push_back(Event::op(tag, success));
        drop(st);
        self.inner.cond.notify_all();
    }

    /// Blocks up to `deadline` for the next ready event.
    ///
    /// Returns a `Timeout` event when the deadline elapses first, and a
    /// `Shutdown` event (forever) once the queue has shut down and all
    /// accepted work has drained.
    pub fn next(&self, deadline: Deadline) -> Event {
        let mut st = self.inner.state.lock().unwrap();
        loop {
            if let Some(idx) = st.ready.iter().position(|ev| !st.pluckers.contains(&ev.tag)) {
                return st.ready.remove(idx).unwrap();
            }
            if st.shutdown_requested && st.outstanding == 0 && st.ready.is_empty() {
                return Event::shutdown();
            }
            if deadline.expired() {
                return Event::timeout();
            }
            st = wait_until(&self.inner.cond, st, deadline);
        }
    }

    /// As [`next`](Self::next), but only an event whose tag equals
    /// `tag` satisfies the call.
    ///
    /// At most one pluck per distinct tag may be outstanding, and at
    /// most [`MAX_PLUCKERS`] in total; violations are rejected without
    /// touching the queue.
    pub fn pluck(&self, tag: Tag, deadline: Deadline) -> Result<Event, PluckError> {
        let mut st = self.inner.state.lock().unwrap();
        if st.pluckers.contains(&tag) {
            return Err(PluckError::DuplicateTag);
        }
        if st.pluckers.len() >= MAX_PLUCKERS {
            return Err(PluckError::TooManyPluckers);
        }
        st.pluckers.push(tag);
        let out = loop {
            if let Some(idx) = st.ready.iter().position(|ev| ev.tag == tag) {
                break st.ready.remove(idx).unwrap();
            }
            if st.shutdown_requested && st.outstanding == 0 && st.ready.is_empty() {
                break Event::shutdown();
            }
            if deadline.expired() {
                break Event::timeout();
            }
            st = wait_until(&self.inner.cond, st, deadline);
        };
        st.pluckers.retain(|t| *t != tag);
        drop(st);
        // another consumer may have been skipping our tag
        self.inner.cond.notify_all();
        Ok(out)
    }

    /// Marks the queue: no new work may reference it, existing work
    /// drains, and consumers then observe the shutdown event.
    /// Idempotent.
    pub fn shutdown(&self) {
        let mut st = self.inner.state.lock().unwrap();
        st.shutdown_requested = true;
        drop(st);
        self.inner.cond.notify_all();
    }
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let st = self.inner.state.lock().unwrap();
        write!(
            f,
            "cq[ready:{}, outstanding:{}, shutdown:{}]",
            st.ready.len(),
            st.outstanding,
            st.shutdown_requested
        )
    }
}

// Spurious wakeups are fine; callers re-check their predicate and the
// deadline on every iteration.
fn wait_until<'a>(
    cond: &Condvar, guard: std::sync::MutexGuard<'a, CqState>, deadline: Deadline,
) -> std::sync::MutexGuard<'a, CqState> {
    match deadline.instant() {
        None => cond.wait(guard).unwrap(),
        Some(at) => {
            let left = at.saturating_duration_since(Instant::now());
            cond.wait_timeout(guard, left).unwrap().0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_next_timeout() {
        let cq = CompletionQueue::new();
        let ev = cq.next(Deadline::after(Duration::from_millis(20)));
        assert_eq!(ev.kind, EventKind::Timeout);
    }

    #[test]
    fn test_one_event_per_op() {
        let cq = CompletionQueue::new();
        cq.begin_op().unwrap();
        cq.end_op(Tag(7), true);
        let ev = cq.next(Deadline::after(Duration::from_secs(1)));
        assert_eq!(ev.kind, EventKind::OpComplete);
        assert_eq!(ev.tag, Tag(7));
        assert!(ev.success);
        let ev = cq.next(Deadline::after(Duration::from_millis(10)));
        assert_eq!(ev.kind, EventKind::Timeout);
    }

    #[test]
    fn test_pluck_filters_by_tag() {
        let cq = CompletionQueue::new();
        cq.begin_op().unwrap();
        cq.begin_op().unwrap();
        cq.end_op(Tag(1), true);
        cq.end_op(Tag(2), false);
        let ev = cq.pluck(Tag(2), Deadline::after(Duration::from_secs(1))).unwrap();
        assert_eq!(ev.tag, Tag(2));
        assert!(!ev.success);
        let ev = cq.next(Deadline::after(Duration::from_secs(1)));
        assert_eq!(ev.tag, Tag(1));
    }

    #[test]
    fn test_pluck_duplicate_rejected() {
        let cq = CompletionQueue::new();
        let cq2 = cq.clone();
        let h = thread::spawn(move || {
            let _ = cq2.pluck(Tag(9), Deadline::after(Duration::from_millis(300)));
        });
        thread::sleep(Duration::from_millis(50));
        let err = cq.pluck(Tag(9), Deadline::after(Duration::from_millis(50))).unwrap_err();
        assert_eq!(err, PluckError::DuplicateTag);
        h.join().unwrap();
    }

    #[test]
    fn test_shutdown_drains_then_reports() {
        let cq = CompletionQueue::new();
        cq.begin_op().unwrap();
        cq.shutdown();
        assert_eq!(cq.begin_op(), Err(CallError::QueueShutdown));
        // outstanding work still delivers
        cq.end_op(Tag(3), true);
        let ev = cq.next(Deadline::after(Duration::from_secs(1)));
        assert_eq!(ev.tag, Tag(3));
        let ev = cq.next(Deadline::after(Duration::from_secs(1)));
        assert_eq!(ev.kind, EventKind::Shutdown);
        // and keeps reporting shutdown
        let ev = cq.next(Deadline::after(Duration::from_secs(1)));
        assert_eq!(ev.kind, EventKind::Shutdown);
    }

    #[test]
    fn test_next_does_not_steal_plucked_tag() {
        let cq = CompletionQueue::new();
        let plucker = cq.clone();
        let h = thread::spawn(move || {
            plucker.pluck(Tag(5), Deadline::after(Duration::from_secs(2))).unwrap()
        });
        thread::sleep(Duration::from_millis(50));
        cq.begin_op().unwrap();
        cq.end_op(Tag(5), true);
        // next() skips the claimed tag and times out
        let ev = cq.next(Deadline::after(Duration::from_millis(100)));
        assert_eq!(ev.kind, EventKind::Timeout);
        let ev = h.join().unwrap();
        assert_eq!(ev.tag, Tag(5));
    }
}
