//! Per-call state tracking and batch legality.
//!
//! Send and receive sides advance independently and monotonically.
//! Markers record *submitted* intent: they advance when a batch is
//! accepted, so a later batch that would double-submit an op is
//! rejected synchronously, before anything touches the transport.

use crate::call::{Op, SideKind};
use callmux_core::error::CallError;

#[derive(Default)]
pub(crate) struct CallTrack {
    /// send-initial-metadata submitted
    pub sent_initial_md: bool,
    /// a send-message op is in flight from an accepted batch
    pub send_message_active: bool,
    /// send-close (client) / send-status (server) submitted
    pub sent_final: bool,
    /// recv-initial-metadata submitted
    pub recv_initial_md: bool,
    /// a recv-message op is armed from an accepted batch
    pub recv_message_active: bool,
    /// recv-status (client) / recv-close (server) submitted
    pub recv_final: bool,
}

/// Checks one batch against the call side and the submitted markers.
/// Rejection leaves the markers untouched and produces no event.
pub(crate) fn validate(side: SideKind, track: &CallTrack, ops: &[Op]) -> Result<(), CallError> {
    let mut seen = [false; 8];
    for op in ops {
        let k = op.kind() as usize;
        if seen[k] {
            return Err(CallError::TooManyOperations);
        }
        seen[k] = true;
        match side {
            SideKind::Client => {
                if op.server_only() {
                    return Err(CallError::NotOnClient);
                }
            }
            SideKind::Server => {
                if op.client_only() {
                    return Err(CallError::NotOnServer);
                }
            }
        }
    }
    let batch_sends_initial_md = ops.iter().any(|op| matches!(op, Op::SendInitialMetadata { .. }));
    for op in ops {
        match op {
            Op::SendInitialMetadata { metadata, .. } => {
                if track.sent_initial_md {
                    return Err(CallError::AlreadyInvoked);
                }
                metadata.validate().map_err(|_| CallError::InvalidMetadata)?;
            }
            Op::SendMessage { .. } => {
                if track.sent_final {
                    return Err(CallError::AlreadyFinished);
                }
                if track.send_message_active {
                    return Err(CallError::TooManyOperations);
                }
                if !track.sent_initial_md && !batch_sends_initial_md {
                    return Err(CallError::NotInvoked);
                }
            }
            Op::SendCloseFromClient => {
                if track.sent_final {
                    return Err(CallError::AlreadyFinished);
                }
                if !track.sent_initial_md && !batch_sends_initial_md {
                    return Err(CallError::NotInvoked);
                }
            }
            Op::SendStatusFromServer { status } => {
                if track.sent_final {
                    return Err(CallError::AlreadyFinished);
                }
                status.trailing.validate().map_err(|_| CallError::InvalidMetadata)?;
            }
            Op::RecvInitialMetadata { .. } => {
                if track.recv_initial_md {
                    return Err(CallError::AlreadyInvoked);
                }
            }
            Op::RecvMessage { .. } => {
                if track.recv_final {
                    return Err(CallError::AlreadyFinished);
                }
                if track.recv_message_active {
                    return Err(CallError::TooManyOperations);
                }
            }
            Op::RecvStatusOnClient { .. } | Op::RecvCloseOnServer { .. } => {
                if track.recv_final {
                    return Err(CallError::AlreadyInvoked);
                }
            }
        }
    }
    Ok(())
}

/// Advances the submitted markers for an accepted batch.
pub(crate) fn advance(track: &mut CallTrack, ops: &[Op]) {
    for op in ops {
        match op {
            Op::SendInitialMetadata { .. } => track.sent_initial_md = true,
            Op::SendMessage { .. } => track.send_message_active = true,
            Op::SendCloseFromClient | Op::SendStatusFromServer { .. } => track.sent_final = true,
            Op::RecvInitialMetadata { .. } => track.recv_initial_md = true,
            Op::RecvMessage { .. } => track.recv_message_active = true,
            Op::RecvStatusOnClient { .. } | Op::RecvCloseOnServer { .. } => {
                track.recv_final = true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{MessageSlot, MetadataSlot, OpFlags, StatusSlot};
    use callmux_core::buffer::ByteBuffer;
    use callmux_core::metadata::Metadata;

    fn send_md() -> Op {
        Op::SendInitialMetadata { metadata: Metadata::new(), flags: OpFlags::default() }
    }

    fn send_msg() -> Op {
        Op::SendMessage { message: ByteBuffer::from_copied(b"x"), flags: OpFlags::default() }
    }

    #[test]
    fn test_duplicate_op_rejected() {
        let track = CallTrack::default();
        let ops = vec![send_md(), send_md()];
        assert_eq!(
            validate(SideKind::Client, &track, &ops),
            Err(CallError::TooManyOperations)
        );
    }

    #[test]
    fn test_message_needs_initial_metadata() {
        let track = CallTrack::default();
        assert_eq!(
            validate(SideKind::Client, &track, &[send_msg()]),
            Err(CallError::NotInvoked)
        );
        // combined in one batch is fine
        assert!(validate(SideKind::Client, &track, &[send_md(), send_msg()]).is_ok());
        // already sent earlier is fine
        let mut track = CallTrack::default();
        advance(&mut track, &[send_md()]);
        assert!(validate(SideKind::Client, &track, &[send_msg()]).is_ok());
    }

    #[test]
    fn test_send_side_terminal() {
        let mut track = CallTrack::default();
        advance(&mut track, &[send_md(), Op::SendCloseFromClient]);
        assert_eq!(
            validate(SideKind::Client, &track, &[send_msg()]),
            Err(CallError::AlreadyFinished)
        );
    }

    #[test]
    fn test_recv_side_terminal_on_client() {
        let mut track = CallTrack::default();
        advance(&mut track, &[Op::RecvStatusOnClient { into: StatusSlot::new() }]);
        assert_eq!(
            validate(
                SideKind::Client,
                &track,
                &[Op::RecvMessage { into: MessageSlot::new() }]
            ),
            Err(CallError::AlreadyFinished)
        );
        assert_eq!(
            validate(
                SideKind::Client,
                &track,
                &[Op::RecvStatusOnClient { into: StatusSlot::new() }]
            ),
            Err(CallError::AlreadyInvoked)
        );
    }

    #[test]
    fn test_direction_mixing_rejected() {
        let track = CallTrack::default();
        assert_eq!(
            validate(
                SideKind::Client,
                &track,
                &[Op::RecvCloseOnServer { cancelled: crate::call::CancelledSlot::new() }]
            ),
            Err(CallError::NotOnClient)
        );
        assert_eq!(
            validate(
                SideKind::Server,
                &track,
                &[Op::RecvInitialMetadata { into: MetadataSlot::new() }]
            ),
            Err(CallError::NotOnServer)
        );
    }

    #[test]
    fn test_invalid_metadata_rejected() {
        let track = CallTrack::default();
        let mut md = Metadata::new();
        md.insert("key1", callmux_core::buffer::Slice::from_copied(&[0x00]));
        let ops = vec![Op::SendInitialMetadata { metadata: md, flags: OpFlags::default() }];
        assert_eq!(validate(SideKind::Client, &track, &ops), Err(CallError::InvalidMetadata));
    }
}
