//! Server-side facade: the request loop that pairs incoming streams
//! with `request_call` intents, and two-phase shutdown.

use crate::call::{Call, CallInner, OutputSlot};
use crate::cq::{CompletionQueue, Tag};
use crate::runtime::{self, RuntimeGuard};
use crate::transport::mem::Endpoint;
use crate::transport::{Frame, FrameRx, FrameTx, Inbound, StreamWriter};
use callmux_core::deadline::Deadline;
use callmux_core::error::CallError;
use callmux_core::metadata::Metadata;
use callmux_core::status::{Status, StatusCode};
use callmux_core::RpcConfig;
use log::{debug, trace, warn};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// Everything a matched `request_call` learns about its new call.
pub struct CallDetails {
    pub call: Call,
    pub method: String,
    pub authority: String,
    pub deadline: Deadline,
    /// The client's initial metadata, as received.
    pub metadata: Metadata,
}

/// Filled when an incoming stream is paired with the request; the
/// completion event for the request's tag fires afterwards.
pub type RequestSlot = OutputSlot<CallDetails>;

type Registry = Arc<Mutex<FxHashMap<u64, Weak<CallInner>>>>;

struct PendingRequest {
    tag: Tag,
    cq: CompletionQueue,
    slot: RequestSlot,
}

struct Port {
    name: String,
    wake: FrameTx,
    registry: Registry,
}

struct ServerState {
    ports: Vec<Port>,
    requests: VecDeque<PendingRequest>,
    backlog: VecDeque<CallDetails>,
}

struct ServerInner {
    config: RpcConfig,
    st: Mutex<ServerState>,
    /// strong_count - 1 == live server-side calls
    active: Arc<()>,
    shutdown: AtomicBool,
    _rt: RuntimeGuard,
}

pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(config: RpcConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                st: Mutex::new(ServerState {
                    ports: Vec::new(),
                    requests: VecDeque::new(),
                    backlog: VecDeque::new(),
                }),
                active: Arc::new(()),
                shutdown: AtomicBool::new(false),
                _rt: runtime::enter(),
            }),
        }
    }

    /// Attaches one transport endpoint and starts accepting streams on
    /// it. `name` identifies the port in logs and as the peer string
    /// of calls accepted through it.
    pub fn add_port(&self, endpoint: Endpoint, name: &str) {
        let Endpoint { out, incoming, wake } = endpoint;
        let registry: Registry = Arc::new(Mutex::new(FxHashMap::default()));
        let port = Port { name: name.to_string(), wake, registry: registry.clone() };
        self.inner.st.lock().unwrap().ports.push(port);
        let inner = self.inner.clone();
        let port_name = name.to_string();
        std::thread::Builder::new()
            .name(format!("callmux-srv-{}", name))
            .spawn(move || inner.demux_loop(incoming, out, registry, port_name))
            .expect("spawn server demux thread");
        debug!("server port {} accepting", name);
    }

    /// Registers intent to accept one call. When an incoming stream is
    /// matched (first come, first served), the returned slot is filled
    /// and one event with `tag` fires on `cq`. After shutdown has been
    /// requested the intent completes immediately, unsuccessfully.
    pub fn request_call(&self, cq: &CompletionQueue, tag: Tag) -> Result<RequestSlot, CallError> {
        cq.begin_op()?;
        let slot = RequestSlot::new();
        let mut st = self.inner.st.lock().unwrap();
        if self.inner.shutdown.load(Ordering::Acquire) {
            drop(st);
            cq.end_op(tag, false);
            return Ok(slot);
        }
        if let Some(details) = st.backlog.pop_front() {
            slot.set(details);
            drop(st);
            cq.end_op(tag, true);
        } else {
            st.requests.push_back(PendingRequest { tag, cq: cq.clone(), slot: slot.clone() });
        }
        Ok(slot)
    }

    /// Begins two-phase shutdown: stop accepting, fail unmatched
    /// request intents, give in-flight calls the configured grace
    /// period, cancel the stragglers, then post exactly one completion
    /// with `tag` on `cq`. The server may be dropped once that event
    /// has been observed.
    pub fn shutdown_and_notify(&self, cq: &CompletionQueue, tag: Tag) -> Result<(), CallError> {
        cq.begin_op()?;
        let first = !self.inner.shutdown.swap(true, Ordering::SeqCst);
        if !first {
            warn!("repeated server shutdown request");
        }
        let (requests, backlog) = {
            let mut st = self.inner.st.lock().unwrap();
            (std::mem::take(&mut st.requests), std::mem::take(&mut st.backlog))
        };
        for req in requests {
            req.cq.end_op(req.tag, false);
        }
        for details in backlog {
            details.call.cancel_with_status(StatusCode::Unavailable, "server is shutting down");
        }
        let inner = self.inner.clone();
        let cq = cq.clone();
        std::thread::Builder::new()
            .name("callmux-srv-shutdown".to_string())
            .spawn(move || inner.drain(&cq, tag))
            .expect("spawn server shutdown thread");
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let mut st = self.inner.st.lock().unwrap();
        for req in std::mem::take(&mut st.requests) {
            req.cq.end_op(req.tag, false);
        }
        st.backlog.clear();
        let ports = std::mem::take(&mut st.ports);
        drop(st);
        for port in &ports {
            for call in drain_registry(&port.registry) {
                call.cancel_impl(Status::new(StatusCode::Unavailable, "server destroyed"), true);
            }
            let _ = port.wake.send(Inbound::Closed);
        }
    }
}

fn drain_registry(registry: &Registry) -> Vec<Arc<CallInner>> {
    let mut reg = registry.lock().unwrap();
    reg.drain().filter_map(|(_, w)| w.upgrade()).collect()
}

impl ServerInner {
    #[inline]
    fn active_calls(&self) -> usize {
        Arc::strong_count(&self.active) - 1
    }

    // Grace-period drain, then forced cancellation; runs on its own
    // thread so shutdown_and_notify never blocks the caller.
    fn drain(&self, cq: &CompletionQueue, tag: Tag) {
        let give_up = Instant::now() + self.config.shutdown_grace;
        while self.active_calls() > 0 && Instant::now() < give_up {
            std::thread::sleep(Duration::from_millis(20));
        }
        let left = self.active_calls();
        if left > 0 {
            warn!("shutdown grace elapsed with {} call(s) left, cancelling", left);
            let regs: Vec<Registry> = {
                let st = self.st.lock().unwrap();
                st.ports.iter().map(|p| p.registry.clone()).collect()
            };
            for reg in regs {
                for call in drain_registry(&reg) {
                    call.cancel_impl(Status::new(StatusCode::Cancelled, "server shutdown"), true);
                }
            }
        }
        let ports = std::mem::take(&mut self.st.lock().unwrap().ports);
        for port in &ports {
            let _ = port.wake.send(Inbound::Closed);
        }
        debug!("server shutdown complete");
        cq.end_op(tag, true);
    }

    fn demux_loop(&self, rx: FrameRx, out: FrameTx, registry: Registry, port: String) {
        loop {
            match rx.recv() {
                Ok(Inbound::Frame(Frame::Headers {
                    stream,
                    path,
                    authority,
                    deadline_ms,
                    metadata,
                    ..
                })) => {
                    self.accept(&out, &registry, &port, stream, path, authority, deadline_ms, metadata)
                }
                Ok(Inbound::Frame(frame)) => route(&registry, frame),
                Ok(Inbound::Closed) | Err(_) => break,
            }
        }
        for call in drain_registry(&registry) {
            call.endpoint_closed();
        }
        debug!("server demux for {} exits", port);
    }

    fn accept(
        &self, out: &FrameTx, registry: &Registry, port: &str, stream: u64, path: String,
        authority: String, deadline_ms: Option<u64>, metadata: Metadata,
    ) {
        if registry.lock().unwrap().contains_key(&stream) {
            warn!("duplicate headers for stream {} on {}, dropped", stream, port);
            return;
        }
        if self.shutdown.load(Ordering::Acquire) {
            refuse(out, stream, "server is shutting down");
            return;
        }
        let mut st = self.st.lock().unwrap();
        if st.requests.is_empty() && st.backlog.len() >= self.config.accept_backlog {
            drop(st);
            warn!("accept backlog full on {}, refusing stream {}", port, stream);
            refuse(out, stream, "accept queue is full");
            return;
        }
        let deadline = Deadline::from_wire_ms(deadline_ms);
        let writer = StreamWriter::new(stream, out.clone());
        let inner = CallInner::new_server(
            path.clone(),
            authority.clone(),
            deadline,
            writer,
            self.config.clone(),
            port.to_string(),
            self.active.clone(),
        );
        registry.lock().unwrap().insert(stream, Arc::downgrade(&inner));
        let details =
            CallDetails { call: Call { inner }, method: path, authority, deadline, metadata };
        trace!("incoming call {} {} on {}", details.method, details.deadline, port);
        match st.requests.pop_front() {
            Some(req) => {
                drop(st);
                req.slot.set(details);
                req.cq.end_op(req.tag, true);
            }
            None => st.backlog.push_back(details),
        }
    }
}

fn route(registry: &Registry, frame: Frame) {
    let id = frame.stream();
    let call = {
        let mut reg = registry.lock().unwrap();
        match reg.get(&id).map(|w| w.upgrade()) {
            Some(Some(call)) => Some(call),
            Some(None) => {
                reg.remove(&id);
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
        Frame::Headers { .. } => {}
        Frame::Message { payload, .. } => call.on_message(payload),
        Frame::Trailers { status, .. } => call.on_remote_trailers(status),
        Frame::Reset { code, .. } => call.on_reset(code),
    }
}

// Refusal is a two-frame contract: the status the peer can report,
// then the reset that tears the stream down.
fn refuse(out: &FrameTx, stream: u64, msg: &str) {
    let status = Status::new(StatusCode::Unavailable, msg);
    let _ = out.send(Inbound::Frame(Frame::Trailers { stream, status: Some(status) }));
    let _ = out.send(Inbound::Frame(Frame::Reset { stream, code: StatusCode::Unavailable }));
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let st = self.inner.st.lock().unwrap();
        write!(
            f,
            "server[ports:{}, pending_requests:{}, backlog:{}, active:{}]",
            st.ports.len(),
            st.requests.len(),
            st.backlog.len(),
            self.inner.active_calls()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossfire::mpsc;

    #[test]
    fn test_refuse_sends_trailers_then_reset() {
        let (tx, rx) = mpsc::unbounded_blocking::<Inbound>();
        refuse(&tx, 7, "accept queue is full");
        match rx.recv().expect("trailers frame") {
            Inbound::Frame(Frame::Trailers { stream, status }) => {
                assert_eq!(stream, 7);
                let status = status.expect("refusal carries a status");
                assert_eq!(status.code, StatusCode::Unavailable);
            }
            _ => panic!("expected trailers first"),
        }
        match rx.recv().expect("reset frame") {
            Inbound::Frame(Frame::Reset { stream, code }) => {
                assert_eq!(stream, 7);
                assert_eq!(code, StatusCode::Unavailable);
            }
            _ => panic!("expected reset after trailers"),
        }
    }
}
