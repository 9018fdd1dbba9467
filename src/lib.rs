#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! # callmux
//!
//! A call engine for RPC over multiplexed, bidirectional streaming
//! transports: batched operations on calls, completion-queue
//! notification, deadline propagation, cancellation fan-out and
//! per-call credential injection. Payloads are opaque byte sequences;
//! serialization, retry policy and connection management live above
//! and below this layer.
//!
//! ## Components
//!
//! - [`cq`]: the completion queue (`next`/`pluck`/`shutdown`).
//! - [`call`]: the per-call state machine and the operation batch
//!   executor.
//! - [`channel`] / [`server`]: thin facades — create calls, accept
//!   calls, shut down.
//! - [`credentials`]: per-call credential binding.
//! - [`transport`]: the consumed stream-multiplexer interface plus the
//!   in-process reference pair.
//! - [`runtime`]: process-wide state (the timer thread) with
//!   refcounted teardown.
//!
//! Foundational types (status codes, deadlines, byte buffers,
//! metadata) come from `callmux-core` and are re-exported here.
//!
//! ## Example
//!
//! One unary exchange over the in-process transport, driven from a
//! single thread:
//!
//! ```rust
//! use callmux::transport::mem;
//! use callmux::*;
//! use std::time::Duration;
//!
//! let (client_end, server_end) = mem::pair();
//! let server = Server::new(RpcConfig::default());
//! server.add_port(server_end, "mem:demo");
//! let channel = Channel::connect(client_end, "demo.local", RpcConfig::default());
//! let cq = CompletionQueue::new();
//!
//! // client: one batch drives the whole unary call
//! let call = channel.create_call("/echo", "demo.local", Deadline::after(Duration::from_secs(5)));
//! let reply = MessageSlot::new();
//! let status = StatusSlot::new();
//! call.start_batch(
//!     vec![
//!         Op::SendInitialMetadata { metadata: Metadata::new(), flags: OpFlags::default() },
//!         Op::SendMessage { message: ByteBuffer::from_copied(b"ping"), flags: OpFlags::default() },
//!         Op::SendCloseFromClient,
//!         Op::RecvInitialMetadata { into: MetadataSlot::new() },
//!         Op::RecvMessage { into: reply.clone() },
//!         Op::RecvStatusOnClient { into: status.clone() },
//!     ],
//!     Tag(1),
//!     &cq,
//! )
//! .unwrap();
//!
//! // server: accept the call, read the request, reply with OK
//! let slot = server.request_call(&cq, Tag(100)).unwrap();
//! assert!(cq.pluck(Tag(100), Deadline::after(Duration::from_secs(5))).unwrap().success);
//! let incoming = slot.take().unwrap();
//! assert_eq!(incoming.method, "/echo");
//! let req = MessageSlot::new();
//! incoming
//!     .call
//!     .start_batch(
//!         vec![
//!             Op::SendInitialMetadata { metadata: Metadata::new(), flags: OpFlags::default() },
//!             Op::RecvMessage { into: req.clone() },
//!         ],
//!         Tag(101),
//!         &cq,
//!     )
//!     .unwrap();
//! assert!(cq.pluck(Tag(101), Deadline::after(Duration::from_secs(5))).unwrap().success);
//! assert_eq!(req.take().unwrap().unwrap(), "ping");
//! let cancelled = CancelledSlot::new();
//! incoming
//!     .call
//!     .start_batch(
//!         vec![
//!             Op::SendMessage { message: ByteBuffer::from_copied(b"pong"), flags: OpFlags::default() },
//!             Op::SendStatusFromServer { status: Status::ok() },
//!             Op::RecvCloseOnServer { cancelled: cancelled.clone() },
//!         ],
//!         Tag(102),
//!         &cq,
//!     )
//!     .unwrap();
//! assert!(cq.pluck(Tag(102), Deadline::after(Duration::from_secs(5))).unwrap().success);
//! assert_eq!(cancelled.take(), Some(false));
//!
//! // and the client observes the reply and the OK status
//! assert!(cq.pluck(Tag(1), Deadline::after(Duration::from_secs(5))).unwrap().success);
//! assert_eq!(reply.take().unwrap().unwrap(), "pong");
//! assert!(status.take().unwrap().is_ok());
//! ```

pub mod call;
pub mod channel;
pub mod cq;
pub mod credentials;
pub mod runtime;
pub mod server;
mod timer;
pub mod transport;

pub use call::{
    Call, CancelledSlot, MessageSlot, MetadataSlot, Op, OpFlags, OutputSlot, StatusSlot,
};
pub use callmux_core::buffer::{ByteBuffer, Slice};
pub use callmux_core::deadline::Deadline;
pub use callmux_core::error::{CallError, PluckError};
pub use callmux_core::metadata::Metadata;
pub use callmux_core::status::{Status, StatusCode};
pub use callmux_core::RpcConfig;
pub use channel::{Channel, RegisteredMethod};
pub use cq::{CompletionQueue, Event, EventKind, Tag};
pub use credentials::{AccessTokenCredentials, CallCredentials, ChannelCredentials, Credentials};
pub use server::{CallDetails, RequestSlot, Server};
