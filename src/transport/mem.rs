//! In-process transport pair.
//!
//! Two endpoints joined back-to-back by unbounded frame channels; the
//! reference transport for the test suite and the demos. Stream ids
//! are allocated by the client side, odd and increasing, so they never
//! collide with anything the accepting side tracks.

use super::{FrameRx, FrameTx, Inbound};
use crossfire::mpsc;

/// One side of an in-process connection.
///
/// Carries the write half toward the peer, the inbound frame channel
/// this side's demux thread drains, and a loopback producer used to
/// wake that demux thread for endpoint-local close.
pub struct Endpoint {
    pub(crate) out: FrameTx,
    pub(crate) incoming: FrameRx,
    pub(crate) wake: FrameTx,
}

/// Builds a connected pair: `(client_end, server_end)`.
pub fn pair() -> (Endpoint, Endpoint) {
    // a: client -> server, b: server -> client
    let (a_tx, a_rx) = mpsc::unbounded_blocking::<Inbound>();
    let (b_tx, b_rx) = mpsc::unbounded_blocking::<Inbound>();
    let client = Endpoint { out: a_tx.clone(), incoming: b_rx, wake: b_tx.clone() };
    let server = Endpoint { out: b_tx, incoming: a_rx, wake: a_tx };
    (client, server)
}
