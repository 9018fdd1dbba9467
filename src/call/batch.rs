//! Batch bookkeeping and receive-side buffering.

use crate::cq::{CompletionQueue, Tag};
use callmux_core::buffer::ByteBuffer;
use callmux_core::metadata::Metadata;
use callmux_core::status::{Status, StatusCode};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

/// A caller-held output cell a receive op fills before its batch
/// completes. Cloning shares the cell.
pub struct OutputSlot<T> {
    cell: Arc<Mutex<Option<T>>>,
}

impl<T> OutputSlot<T> {
    pub fn new() -> Self {
        Self { cell: Arc::new(Mutex::new(None)) }
    }

    pub(crate) fn set(&self, value: T) {
        *self.cell.lock().unwrap() = Some(value);
    }

    /// Takes the value out, if the op filled it.
    pub fn take(&self) -> Option<T> {
        self.cell.lock().unwrap().take()
    }

    pub fn is_set(&self) -> bool {
        self.cell.lock().unwrap().is_some()
    }
}

impl<T> Clone for OutputSlot<T> {
    fn clone(&self) -> Self {
        Self { cell: self.cell.clone() }
    }
}

impl<T> Default for OutputSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for OutputSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "slot[set:{}]", self.is_set())
    }
}

/// Receives the peer's initial metadata.
pub type MetadataSlot = OutputSlot<Metadata>;
/// Receives one message; `Some(None)` after take means the stream ended
/// cleanly with no further message.
pub type MessageSlot = OutputSlot<Option<ByteBuffer>>;
/// Receives the call's terminal status.
pub type StatusSlot = OutputSlot<Status>;
/// Receives the server-side cancellation verdict.
pub type CancelledSlot = OutputSlot<bool>;

/// A receive op still waiting for its data.
pub(crate) enum PendingOp {
    InitialMetadata(MetadataSlot),
    Message(MessageSlot),
    StatusOnClient(StatusSlot),
    CloseOnServer(CancelledSlot),
}

/// One accepted batch: the ops still pending and the event identity to
/// post when the last of them resolves.
pub(crate) struct Batch {
    pub tag: Tag,
    pub cq: CompletionQueue,
    pub ops: Vec<PendingOp>,
    pub failed: bool,
}

impl Batch {
    pub(crate) fn new(tag: Tag, cq: CompletionQueue) -> Self {
        Self { tag, cq, ops: Vec::new(), failed: false }
    }
}

/// Transport data received for this call but not yet consumed by a
/// receive op. Frames arrive in transport order; ops drain in
/// submission order.
#[derive(Default)]
pub(crate) struct Inbox {
    pub initial_md: Option<Metadata>,
    pub messages: VecDeque<ByteBuffer>,
    /// Trailing status received from the peer (client side).
    pub trailers: Option<Status>,
    /// The peer finished sending: client half-close on the server
    /// side, any trailers on the client side.
    pub remote_closed: bool,
    /// Stream reset received from the peer.
    pub reset: Option<StatusCode>,
}
