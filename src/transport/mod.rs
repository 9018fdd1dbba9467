//! The consumed transport interface.
//!
//! A transport is a stream multiplexer delivering ordered frames per
//! stream. The engine writes [`Frame`]s through a [`StreamWriter`] and
//! drains inbound frames from a blocking channel on a per-endpoint
//! demux thread. Framing below this enum is never interpreted here.

use crate::call::OpFlags;
use callmux_core::buffer::ByteBuffer;
use callmux_core::metadata::Metadata;
use callmux_core::status::{Status, StatusCode};
use crossfire::{MTx, Rx};
use std::fmt;

pub mod mem;

/// One ordered unit on a stream.
///
/// Direction conventions: `Headers` carries path/authority/deadline
/// only client→server; server→client it is the initial-metadata
/// announcement. `Trailers` without a status is the client half-close;
/// with a status it is the server's trailing status.
#[derive(Debug)]
pub enum Frame {
    Headers {
        stream: u64,
        path: String,
        authority: String,
        deadline_ms: Option<u64>,
        metadata: Metadata,
        flags: OpFlags,
    },
    Message {
        stream: u64,
        payload: ByteBuffer,
        flags: OpFlags,
    },
    Trailers {
        stream: u64,
        status: Option<Status>,
    },
    Reset {
        stream: u64,
        code: StatusCode,
    },
}

impl Frame {
    #[inline]
    pub fn stream(&self) -> u64 {
        match self {
            Frame::Headers { stream, .. } => *stream,
            Frame::Message { stream, .. } => *stream,
            Frame::Trailers { stream, .. } => *stream,
            Frame::Reset { stream, .. } => *stream,
        }
    }
}

/// What a demux thread pulls off its endpoint.
pub enum Inbound {
    Frame(Frame),
    /// Endpoint-local close signal; never crosses the wire.
    Closed,
}

/// The peer went away or the endpoint closed under us.
#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone, Copy)]
#[error("transport disconnected")]
pub struct Disconnected;

pub(crate) type FrameTx = MTx<Inbound>;
pub(crate) type FrameRx = Rx<Inbound>;

/// Write half of one multiplexed stream. Cheap to clone; writes are
/// accepted in submission order.
#[derive(Clone)]
pub struct StreamWriter {
    id: u64,
    out: FrameTx,
}

impl StreamWriter {
    pub(crate) fn new(id: u64, out: FrameTx) -> Self {
        Self { id, out }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn write_headers(
        &self, path: String, authority: String, deadline_ms: Option<u64>, metadata: Metadata,
        flags: OpFlags,
    ) -> Result<(), Disconnected> {
        self.send(Frame::Headers { stream: self.id, path, authority, deadline_ms, metadata, flags })
    }

    pub fn write_message(&self, payload: ByteBuffer, flags: OpFlags) -> Result<(), Disconnected> {
        self.send(Frame::Message { stream: self.id, payload, flags })
    }

    pub fn write_trailers(&self, status: Option<Status>) -> Result<(), Disconnected> {
        self.send(Frame::Trailers { stream: self.id, status })
    }

    pub fn reset(&self, code: StatusCode) -> Result<(), Disconnected> {
        self.send(Frame::Reset { stream: self.id, code })
    }

    #[inline]
    fn send(&self, frame: Frame) -> Result<(), Disconnected> {
        self.out.send(Inbound::Frame(frame)).map_err(|_| Disconnected)
    }
}

impl fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "stream:{}", self.id)
    }
}
