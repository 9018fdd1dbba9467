//! Process-wide engine state.
//!
//! The timer thread is shared by every channel and server in the
//! process. It is created lazily on first use and torn down when the
//! last [`RuntimeGuard`] drops, so tests get a clean slate between
//! fixtures. Channels and servers hold a guard for their lifetime;
//! applications normally never touch this module directly.

use crate::timer::TimerWheel;
use log::debug;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

struct Global {
    refs: usize,
    timer: Option<(Arc<TimerWheel>, JoinHandle<()>)>,
}

static GLOBAL: Mutex<Global> = Mutex::new(Global { refs: 0, timer: None });

/// Refcount on the process-wide engine state. Dropping the last guard
/// drains the timer thread.
pub struct RuntimeGuard {
    _priv: (),
}

pub fn enter() -> RuntimeGuard {
    let mut g = GLOBAL.lock().unwrap();
    g.refs += 1;
    RuntimeGuard { _priv: () }
}

impl Drop for RuntimeGuard {
    fn drop(&mut self) {
        let taken = {
            let mut g = GLOBAL.lock().unwrap();
            g.refs -= 1;
            if g.refs == 0 { g.timer.take() } else { None }
        };
        if let Some((wheel, handle)) = taken {
            debug!("draining timer thread");
            wheel.stop();
            let _ = handle.join();
        }
    }
}

pub(crate) fn timer() -> Arc<TimerWheel> {
    let mut g = GLOBAL.lock().unwrap();
    if let Some((wheel, _)) = g.timer.as_ref() {
        return wheel.clone();
    }
    let wheel = Arc::new(TimerWheel::new());
    let runner = wheel.clone();
    let handle = std::thread::Builder::new()
        .name("callmux-timer".to_string())
        .spawn(move || runner.run())
        .expect("spawn timer thread");
    g.timer = Some((wheel.clone(), handle));
    debug!("timer thread started");
    wheel
}
