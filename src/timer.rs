//! Deadline firing.
//!
//! One process-wide thread sweeps registered call deadlines and cancels
//! expired calls with `deadline_exceeded`. Entries hold weak references
//! only; a call that completed first is skipped when its entry comes
//! due. The thread is created on first use and drained by
//! [`crate::runtime`] teardown.

use crate::call::CallInner;
use log::trace;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Instant;

struct Entry {
    at: Instant,
    seq: u64,
    call: Weak<CallInner>,
}

// BinaryHeap is a max-heap; order entries so the earliest deadline
// surfaces first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.at.cmp(&self.at).then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

struct TimerState {
    heap: BinaryHeap<Entry>,
    seq: u64,
    stop: bool,
}

pub(crate) struct TimerWheel {
    state: Mutex<TimerState>,
    cond: Condvar,
}

impl TimerWheel {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TimerState { heap: BinaryHeap::new(), seq: 0, stop: false }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn register(&self, at: Instant, call: Weak<CallInner>) {
        let mut st = self.state.lock().unwrap();
        if st.stop {
            return;
        }
        st.seq += 1;
        let seq = st.seq;
        st.heap.push(Entry { at, seq, call });
        drop(st);
        self.cond.notify_one();
    }

    pub(crate) fn stop(&self) {
        let mut st = self.state.lock().unwrap();
        st.stop = true;
        st.heap.clear();
        drop(st);
        self.cond.notify_one();
    }

    pub(crate) fn run(&self) {
        let mut st = self.state.lock().unwrap();
        loop {
            if st.stop {
                return;
            }
            let now = Instant::now();
            let mut due: Vec<Weak<CallInner>> = Vec::new();
            while let Some(head) = st.heap.peek() {
                if head.at > now {
                    break;
                }
                due.push(st.heap.pop().unwrap().call);
            }
            if !due.is_empty() {
                // fire outside the wheel lock
                drop(st);
                for weak in due {
                    if let Some(call) = weak.upgrade() {
                        trace!("deadline fired for {:?}", call);
                        call.deadline_fired();
                    }
                }
                st = self.state.lock().unwrap();
                continue;
            }
            st = match st.heap.peek().map(|e| e.at) {
                None => self.cond.wait(st).unwrap(),
                Some(at) => {
                    let left = at.saturating_duration_since(Instant::now());
                    self.cond.wait_timeout(st, left).unwrap().0
                }
            };
        }
    }
}
