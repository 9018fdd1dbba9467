//! One RPC instance: the per-call state machine and the operation
//! batch executor.
//!
//! A [`Call`] is created from a channel (client side) or handed out by
//! the server request loop. Work happens through
//! [`Call::start_batch`]: a group of send/receive ops submitted
//! atomically against a completion queue and a user tag. Validation is
//! synchronous; everything afterwards resolves through transport
//! events, and exactly one event per batch lands on the queue.

mod batch;
mod state;

pub use batch::{CancelledSlot, MessageSlot, MetadataSlot, OutputSlot, StatusSlot};
use batch::{Batch, Inbox, PendingOp};
use state::CallTrack;

use crate::cq::{CompletionQueue, Tag};
use crate::credentials::{CallCredentials, Credentials};
use crate::runtime;
use crate::transport::StreamWriter;
use callmux_core::buffer::ByteBuffer;
use callmux_core::deadline::Deadline;
use callmux_core::error::CallError;
use callmux_core::metadata::Metadata;
use callmux_core::status::{Status, StatusCode};
use callmux_core::RpcConfig;
use log::{trace, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Opaque per-op flag bits, forwarded to the transport untouched.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct OpFlags(pub u32);

/// The public operation set.
///
/// Send ops carry their payload; receive ops carry the caller-held
/// output slot the engine fills before the batch completes.
pub enum Op {
    SendInitialMetadata { metadata: Metadata, flags: OpFlags },
    SendMessage { message: ByteBuffer, flags: OpFlags },
    SendCloseFromClient,
    SendStatusFromServer { status: Status },
    RecvInitialMetadata { into: MetadataSlot },
    RecvMessage { into: MessageSlot },
    RecvStatusOnClient { into: StatusSlot },
    RecvCloseOnServer { cancelled: CancelledSlot },
}

impl Op {
    pub(crate) fn kind(&self) -> u8 {
        match self {
            Op::SendInitialMetadata { .. } => 0,
            Op::SendMessage { .. } => 1,
            Op::SendCloseFromClient => 2,
            Op::SendStatusFromServer { .. } => 3,
            Op::RecvInitialMetadata { .. } => 4,
            Op::RecvMessage { .. } => 5,
            Op::RecvStatusOnClient { .. } => 6,
            Op::RecvCloseOnServer { .. } => 7,
        }
    }

    pub(crate) fn client_only(&self) -> bool {
        matches!(
            self,
            Op::SendCloseFromClient | Op::RecvInitialMetadata { .. } | Op::RecvStatusOnClient { .. }
        )
    }

    pub(crate) fn server_only(&self) -> bool {
        matches!(self, Op::SendStatusFromServer { .. } | Op::RecvCloseOnServer { .. })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SideKind {
    Client,
    Server,
}

pub(crate) struct CallLocked {
    track: CallTrack,
    creds: Option<Arc<dyn CallCredentials>>,
    batches: Vec<Batch>,
    inbox: Inbox,
    /// The call's determined final status, set exactly once.
    terminal: Option<Status>,
    headers_sent: bool,
    status_sent: bool,
    reset_sent: bool,
}

pub(crate) struct CallInner {
    side: SideKind,
    method: String,
    authority: String,
    deadline: Deadline,
    peer: String,
    writer: StreamWriter,
    config: RpcConfig,
    cancelled: AtomicBool,
    st: Mutex<CallLocked>,
    /// Keeps the owning server's active-call count accurate.
    _active: Option<Arc<()>>,
}

/// One RPC. Exclusively owned; dropping an unfinished call cancels it,
/// and any batches still pending complete (unsuccessfully) first.
pub struct Call {
    pub(crate) inner: Arc<CallInner>,
}

impl Call {
    #[inline]
    pub fn method(&self) -> &str {
        &self.inner.method
    }

    #[inline]
    pub fn authority(&self) -> &str {
        &self.inner.authority
    }

    #[inline]
    pub fn deadline(&self) -> Deadline {
        self.inner.deadline
    }

    /// The remote endpoint name, for diagnostics.
    #[inline]
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Submits a batch of ops. Returns synchronously after validation;
    /// exactly one event with `tag` lands on `cq` once every op has
    /// resolved. A rejected batch produces no event.
    pub fn start_batch(
        &self, ops: Vec<Op>, tag: Tag, cq: &CompletionQueue,
    ) -> Result<(), CallError> {
        self.inner.start_batch(ops, tag, cq)
    }

    /// Cancels the call. Idempotent; every outstanding batch still
    /// completes exactly once.
    pub fn cancel(&self) {
        self.inner.cancel_impl(Status::new(StatusCode::Cancelled, "cancelled by application"), true);
    }

    /// As [`cancel`](Self::cancel) with an application-chosen status.
    pub fn cancel_with_status(&self, code: StatusCode, details: &str) {
        self.inner.cancel_impl(Status::new(code, details), true);
    }

    /// Binds, replaces or clears this call's credentials. Client calls
    /// only, and only before send-initial-metadata has been
    /// dispatched. Channel-type credentials are rejected.
    pub fn set_credentials(&self, creds: Option<Credentials>) -> Result<(), CallError> {
        self.inner.set_credentials(creds)
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        self.inner
            .cancel_impl(Status::new(StatusCode::Cancelled, "call handle dropped"), true);
    }
}

impl CallInner {
    fn new(
        side: SideKind, method: String, authority: String, deadline: Deadline,
        writer: StreamWriter, config: RpcConfig, peer: String, active: Option<Arc<()>>,
    ) -> Arc<Self> {
        let inner = Arc::new(Self {
            side,
            method,
            authority,
            deadline,
            peer,
            writer,
            config,
            cancelled: AtomicBool::new(false),
            st: Mutex::new(CallLocked {
                track: CallTrack::default(),
                creds: None,
                batches: Vec::new(),
                inbox: Inbox::default(),
                terminal: None,
                headers_sent: false,
                status_sent: false,
                reset_sent: false,
            }),
            _active: active,
        });
        if deadline.expired() {
            // authoritative: nothing for this call may reach the wire
            inner.cancel_impl(
                Status::new(StatusCode::DeadlineExceeded, "deadline expired before start"),
                false,
            );
        } else if let Some(at) = deadline.instant() {
            runtime::timer().register(at, Arc::downgrade(&inner));
        }
        inner
    }

    pub(crate) fn new_client(
        method: String, authority: String, deadline: Deadline, writer: StreamWriter,
        config: RpcConfig, peer: String,
    ) -> Arc<Self> {
        Self::new(SideKind::Client, method, authority, deadline, writer, config, peer, None)
    }

    pub(crate) fn new_server(
        method: String, authority: String, deadline: Deadline, writer: StreamWriter,
        config: RpcConfig, peer: String, active: Arc<()>,
    ) -> Arc<Self> {
        Self::new(SideKind::Server, method, authority, deadline, writer, config, peer, Some(active))
    }

    fn start_batch(&self, ops: Vec<Op>, tag: Tag, cq: &CompletionQueue) -> Result<(), CallError> {
        let mut st = self.st.lock().unwrap();
        state::validate(self.side, &st.track, &ops)?;
        cq.begin_op()?;
        state::advance(&mut st.track, &ops);

        let mut send_initial: Option<(Metadata, OpFlags)> = None;
        let mut send_message: Option<(ByteBuffer, OpFlags)> = None;
        let mut send_close = false;
        let mut send_status: Option<Status> = None;
        let mut batch = Batch::new(tag, cq.clone());
        for op in ops {
            match op {
                Op::SendInitialMetadata { metadata, flags } => {
                    send_initial = Some((metadata, flags))
                }
                Op::SendMessage { message, flags } => send_message = Some((message, flags)),
                Op::SendCloseFromClient => send_close = true,
                Op::SendStatusFromServer { status } => send_status = Some(status),
                Op::RecvInitialMetadata { into } => {
                    batch.ops.push(PendingOp::InitialMetadata(into))
                }
                Op::RecvMessage { into } => batch.ops.push(PendingOp::Message(into)),
                Op::RecvStatusOnClient { into } => batch.ops.push(PendingOp::StatusOnClient(into)),
                Op::RecvCloseOnServer { cancelled } => {
                    batch.ops.push(PendingOp::CloseOnServer(cancelled))
                }
            }
        }
        let had_message = send_message.is_some();
        let has_sends =
            send_initial.is_some() || had_message || send_close || send_status.is_some();
        if has_sends {
            if self.cancelled.load(Ordering::Relaxed) || st.terminal.is_some() {
                batch.failed = true;
            } else if self
                .issue_sends(&mut st, send_initial, send_message, send_close, send_status)
                .is_err()
            {
                batch.failed = true;
            }
            // writes are accepted synchronously, so the message marker
            // opens up again as soon as the batch is issued
            if had_message {
                st.track.send_message_active = false;
            }
        }
        trace!("{:?} batch {} accepted", self, tag);
        st.batches.push(batch);
        self.sweep(&mut st);
        Ok(())
    }

    // Sends go out in canonical order regardless of their position in
    // the submitted batch: initial metadata, message, then the
    // half-close or trailing status.
    fn issue_sends(
        &self, st: &mut CallLocked, initial: Option<(Metadata, OpFlags)>,
        message: Option<(ByteBuffer, OpFlags)>, close: bool, status: Option<Status>,
    ) -> Result<(), ()> {
        if let Some((mut md, flags)) = initial {
            if self.side == SideKind::Client {
                if let Some(creds) = st.creds.clone() {
                    match creds.mint(&self.authority, &self.method) {
                        Ok(entries) => {
                            for (k, v) in entries {
                                md.insert(k, v);
                            }
                        }
                        Err(e) => {
                            warn!("{:?} credential mint failed: {}", self, e);
                            self.cancel_locked(
                                st,
                                Status::new(StatusCode::Unauthenticated, e.details),
                                false,
                            );
                            return Err(());
                        }
                    }
                }
            }
            let (path, authority, deadline_ms) = match self.side {
                SideKind::Client => {
                    (self.method.clone(), self.authority.clone(), self.deadline.to_wire_ms())
                }
                SideKind::Server => (String::new(), String::new(), None),
            };
            if self.writer.write_headers(path, authority, deadline_ms, md, flags).is_err() {
                self.transport_down(st);
                return Err(());
            }
            st.headers_sent = true;
        }
        if let Some((payload, flags)) = message {
            if self.writer.write_message(payload, flags).is_err() {
                self.transport_down(st);
                return Err(());
            }
        }
        if close {
            if self.writer.write_trailers(None).is_err() {
                self.transport_down(st);
                return Err(());
            }
        }
        if let Some(status) = status {
            if self.writer.write_trailers(Some(status)).is_err() {
                self.transport_down(st);
                return Err(());
            }
            st.status_sent = true;
        }
        Ok(())
    }

    fn transport_down(&self, st: &mut CallLocked) {
        self.cancel_locked(st, Status::new(StatusCode::Unavailable, "transport closed"), false);
    }

    fn set_credentials(&self, creds: Option<Credentials>) -> Result<(), CallError> {
        if self.side == SideKind::Server {
            return Err(CallError::InvalidCredentials);
        }
        let mut st = self.st.lock().unwrap();
        if st.track.sent_initial_md {
            return Err(CallError::AlreadyInvoked);
        }
        match creds {
            None => st.creds = None,
            Some(Credentials::PerCall(c)) => st.creds = Some(c),
            Some(Credentials::Channel(_)) => return Err(CallError::InvalidCredentials),
        }
        Ok(())
    }

    pub(crate) fn cancel_impl(&self, status: Status, notify_peer: bool) {
        let mut st = self.st.lock().unwrap();
        self.cancel_locked(&mut st, status, notify_peer);
        self.sweep(&mut st);
    }

    fn cancel_locked(&self, st: &mut CallLocked, status: Status, notify_peer: bool) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if st.terminal.is_none() {
            st.terminal = Some(status);
        }
        let finished = match self.side {
            SideKind::Client => st.inbox.trailers.is_some(),
            SideKind::Server => st.status_sent && st.inbox.remote_closed,
        };
        let announced = self.side == SideKind::Server || st.headers_sent;
        if notify_peer && announced && !finished && !st.reset_sent && st.inbox.reset.is_none() {
            let code = st.terminal.as_ref().map(|s| s.code).unwrap_or(StatusCode::Cancelled);
            if self.writer.reset(code).is_ok() {
                st.reset_sent = true;
            }
        }
        trace!("{:?} cancelled: {:?}", self, st.terminal);
    }

    pub(crate) fn deadline_fired(&self) {
        self.cancel_impl(Status::new(StatusCode::DeadlineExceeded, "deadline exceeded"), true);
    }

    /// The endpoint under this call went away without a reset.
    pub(crate) fn endpoint_closed(&self) {
        self.cancel_impl(Status::new(StatusCode::Unavailable, "endpoint closed"), false);
    }

    pub(crate) fn on_initial_metadata(&self, md: Metadata) {
        let mut st = self.st.lock().unwrap();
        if st.inbox.initial_md.is_some() {
            warn!("{:?} duplicate initial metadata, dropped", self);
        } else {
            st.inbox.initial_md = Some(md);
        }
        self.sweep(&mut st);
    }

    pub(crate) fn on_message(&self, payload: ByteBuffer) {
        if payload.len() > self.config.max_message_len {
            warn!("{:?} message of {} bytes over limit", self, payload.len());
            self.cancel_impl(
                Status::new(StatusCode::ResourceExhausted, "received message too large"),
                true,
            );
            return;
        }
        let mut st = self.st.lock().unwrap();
        st.inbox.messages.push_back(payload);
        self.sweep(&mut st);
    }

    pub(crate) fn on_remote_trailers(&self, status: Option<Status>) {
        let mut st = self.st.lock().unwrap();
        st.inbox.remote_closed = true;
        if let Some(s) = status {
            match self.side {
                SideKind::Client => {
                    if st.terminal.is_none() {
                        st.terminal = Some(s.clone());
                    }
                    st.inbox.trailers = Some(s);
                }
                SideKind::Server => {
                    warn!("{:?} unexpected status from client, dropped", self);
                }
            }
        }
        self.sweep(&mut st);
    }

    pub(crate) fn on_reset(&self, code: StatusCode) {
        {
            let mut st = self.st.lock().unwrap();
            st.inbox.reset = Some(code);
        }
        let code = if code == StatusCode::Ok { StatusCode::Cancelled } else { code };
        self.cancel_impl(Status::new(code, "stream reset by peer"), false);
    }

    // Resolves every receive op that can make progress and posts the
    // completion for each batch whose last op resolved. Runs under the
    // call lock on every state transition.
    fn sweep(&self, st: &mut CallLocked) {
        let cancelled = self.cancelled.load(Ordering::Relaxed);
        let CallLocked { batches, inbox, track, terminal, status_sent, .. } = st;
        for b in batches.iter_mut() {
            let mut failed = b.failed;
            b.ops.retain_mut(|op| match op {
                PendingOp::InitialMetadata(slot) => {
                    if let Some(md) = inbox.initial_md.take() {
                        slot.set(md);
                        false
                    } else if inbox.trailers.is_some() || inbox.remote_closed {
                        // trailers-only outcome: empty initial metadata
                        slot.set(Metadata::new());
                        false
                    } else if cancelled {
                        failed = true;
                        false
                    } else {
                        true
                    }
                }
                PendingOp::Message(slot) => {
                    if let Some(m) = inbox.messages.pop_front() {
                        slot.set(Some(m));
                        track.recv_message_active = false;
                        false
                    } else if inbox.trailers.is_some() || inbox.remote_closed || *status_sent {
                        slot.set(None);
                        track.recv_message_active = false;
                        false
                    } else if cancelled {
                        slot.set(None);
                        track.recv_message_active = false;
                        failed = true;
                        false
                    } else {
                        true
                    }
                }
                PendingOp::StatusOnClient(slot) => {
                    if let Some(s) = terminal.as_ref() {
                        slot.set(s.clone());
                        false
                    } else {
                        true
                    }
                }
                PendingOp::CloseOnServer(slot) => {
                    if cancelled {
                        slot.set(true);
                        false
                    } else if *status_sent && inbox.remote_closed {
                        slot.set(false);
                        false
                    } else {
                        true
                    }
                }
            });
            b.failed = failed;
        }
        batches.retain(|b| {
            if b.ops.is_empty() {
                trace!("batch {} complete, success:{}", b.tag, !b.failed);
                b.cq.end_op(b.tag, !b.failed);
                false
            } else {
                true
            }
        });
    }
}

impl fmt::Debug for CallInner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let side = match self.side {
            SideKind::Client => "client",
            SideKind::Server => "server",
        };
        write!(f, "call[{} {} @{}]", side, self.method, self.peer)
    }
}

impl Drop for CallInner {
    fn drop(&mut self) {
        // last reference gone with batches still pending: fail them
        // rather than leaving their tags unresolved
        let mut st = self.st.lock().unwrap();
        if !st.batches.is_empty() {
            self.cancel_locked(
                &mut st,
                Status::new(StatusCode::Cancelled, "call released"),
                false,
            );
            self.sweep(&mut st);
        }
    }
}
