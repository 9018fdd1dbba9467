//! Client-side facade: a thin call factory over one transport
//! endpoint.
//!
//! A channel owns the endpoint's write half and a demux thread that
//! routes inbound frames to live calls. Calls hold no strong reference
//! back; the channel outlives every call created through it, and
//! shutting the channel down cancels any survivors.

use crate::call::{Call, CallInner};
use crate::runtime::{self, RuntimeGuard};
use crate::transport::mem::Endpoint;
use crate::transport::{Frame, FrameRx, FrameTx, Inbound, StreamWriter};
use callmux_core::deadline::Deadline;
use callmux_core::status::{Status, StatusCode};
use callmux_core::RpcConfig;
use log::{debug, trace};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// A pre-validated method/authority pair for repeated calls to the
/// same endpoint.
#[derive(Clone, Debug)]
pub struct RegisteredMethod {
    method: String,
    authority: String,
}

pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    target: String,
    config: RpcConfig,
    out: FrameTx,
    wake: FrameTx,
    next_stream: AtomicU64,
    calls: Mutex<FxHashMap<u64, Weak<CallInner>>>,
    shutdown: AtomicBool,
    _rt: RuntimeGuard,
}

impl Channel {
    /// Takes ownership of a connected endpoint and starts its demux
    /// thread. `target` names the remote for diagnostics and for
    /// credential minting.
    pub fn connect(endpoint: Endpoint, target: &str, config: RpcConfig) -> Self {
        let Endpoint { out, incoming, wake } = endpoint;
        let inner = Arc::new(ChannelInner {
            target: target.to_string(),
            config,
            out,
            wake,
            next_stream: AtomicU64::new(1),
            calls: Mutex::new(FxHashMap::default()),
            shutdown: AtomicBool::new(false),
            _rt: runtime::enter(),
        });
        let demux = inner.clone();
        std::thread::Builder::new()
            .name(format!("callmux-ch-{}", inner.target))
            .spawn(move || demux.demux_loop(incoming))
            .expect("spawn channel demux thread");
        debug!("channel connected to {}", inner.target);
        Self { inner }
    }

    #[inline]
    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// Creates a call on this channel. The deadline is fixed here for
    /// the lifetime of the call; an already-expired deadline fails the
    /// call before anything reaches the wire.
    pub fn create_call(&self, method: &str, authority: &str, deadline: Deadline) -> Call {
        let id = self.inner.next_stream.fetch_add(2, Ordering::SeqCst);
        let writer = StreamWriter::new(id, self.inner.out.clone());
        let inner = CallInner::new_client(
            method.to_string(),
            authority.to_string(),
            deadline,
            writer,
            self.inner.config.clone(),
            self.inner.target.clone(),
        );
        if self.inner.shutdown.load(Ordering::Acquire) {
            inner.cancel_impl(Status::new(StatusCode::Cancelled, "channel shutdown"), false);
        } else {
            self.inner.calls.lock().unwrap().insert(id, Arc::downgrade(&inner));
        }
        Call { inner }
    }

    /// Caches a method/authority pair; see
    /// [`create_registered_call`](Self::create_registered_call).
    pub fn register_method(&self, method: &str, authority: &str) -> RegisteredMethod {
        RegisteredMethod { method: method.to_string(), authority: authority.to_string() }
    }

    pub fn create_registered_call(&self, reg: &RegisteredMethod, deadline: Deadline) -> Call {
        self.create_call(&reg.method, &reg.authority, deadline)
    }

    /// Cancels every live call and stops the demux thread. Idempotent;
    /// also runs on drop.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("channel to {} shutting down", self.inner.target);
        let live: Vec<Arc<CallInner>> = {
            let mut calls = self.inner.calls.lock().unwrap();
            calls.drain().filter_map(|(_, w)| w.upgrade()).collect()
        };
        for call in live {
            call.cancel_impl(Status::new(StatusCode::Cancelled, "channel shutdown"), true);
        }
        let _ = self.inner.wake.send(Inbound::Closed);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ChannelInner {
    fn demux_loop(&self, rx: FrameRx) {
        loop {
            match rx.recv() {
                Ok(Inbound::Frame(frame)) => self.route(frame),
                Ok(Inbound::Closed) | Err(_) => break,
            }
        }
        // anything still registered loses its transport
        let live: Vec<Arc<CallInner>> = {
            let mut calls = self.calls.lock().unwrap();
            calls.drain().filter_map(|(_, w)| w.upgrade()).collect()
        };
        for call in live {
            call.endpoint_closed();
        }
        debug!("channel demux for {} exits", self.target);
    }

    fn route(&self, frame: Frame) {
        let id = frame.stream();
        let call = {
            let mut calls = self.calls.lock().unwrap();
            match calls.get(&id).map(|w| w.upgrade()) {
                Some(Some(call)) => Some(call),
                Some(None) => {
                    calls.remove(&id);
                    None
                }
                None => None,
            }
        };
        let Some(call) = call else {
            trace!("frame for finished stream {} dropped", id);
            return;
        };
        match frame {
            Frame::Headers { metadata, .. } => call.on_initial_metadata(metadata),
            Frame::Message { payload, .. } => call.on_message(payload),
            Frame::Trailers { status, .. } => call.on_remote_trailers(status),
            Frame::Reset { code, .. } => call.on_reset(code),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "channel[{}]", self.inner.target)
    }
}
