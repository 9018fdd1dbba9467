use std::fmt;

/// Synchronous rejection codes for batch submission and call
/// configuration.
///
/// A rejected submission produces one of these and nothing else: no
/// completion-queue event is generated for it.
#[derive(
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    PartialEq,
    Eq,
    Clone,
    Copy,
    thiserror::Error,
)]
#[repr(u8)]
pub enum CallError {
    /// Catch-all for malformed submissions
    #[strum(serialize = "call_error")]
    Error = 0,
    /// A client-only op was submitted on a server call
    #[strum(serialize = "call_not_on_server")]
    NotOnServer = 1,
    /// A server-only op was submitted on a client call
    #[strum(serialize = "call_not_on_client")]
    NotOnClient = 2,
    /// The op (or credential rebind) arrived after the point it can
    /// legally apply
    #[strum(serialize = "call_already_invoked")]
    AlreadyInvoked = 3,
    /// A receive was requested before the call was started
    #[strum(serialize = "call_not_invoked")]
    NotInvoked = 4,
    /// The send or recv side already passed its terminal transition
    #[strum(serialize = "call_already_finished")]
    AlreadyFinished = 5,
    /// Duplicate op in one batch, or an op of this kind is still in
    /// flight from an earlier batch
    #[strum(serialize = "call_too_many_operations")]
    TooManyOperations = 6,
    /// Unrecognized bits in the op flags
    #[strum(serialize = "call_invalid_flags")]
    InvalidFlags = 7,
    /// Metadata key or value failed validation
    #[strum(serialize = "call_invalid_metadata")]
    InvalidMetadata = 8,
    /// Channel-type credentials on a call, or credentials on a server
    /// call
    #[strum(serialize = "call_invalid_credentials")]
    InvalidCredentials = 9,
    /// The referenced completion queue has been shut down
    #[strum(serialize = "call_queue_shutdown")]
    QueueShutdown = 10,
}

impl fmt::Debug for CallError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Rejection of a `pluck` that would violate the queue's consumer
/// discipline.
#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum PluckError {
    #[error("a pluck for this tag is already in progress")]
    DuplicateTag,
    #[error("too many concurrent pluckers on this queue")]
    TooManyPluckers,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_call_error_names() {
        assert_eq!(CallError::TooManyOperations.as_ref(), "call_too_many_operations");
        let e = CallError::from_str("call_invalid_metadata").expect("parse");
        assert_eq!(e, CallError::InvalidMetadata);
    }
}
