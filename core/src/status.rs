use crate::metadata::Metadata;
use std::fmt;

/// The closed set of call status codes.
///
/// The wire name of each code is the lowercase string carried by
/// `strum`, so codes round-trip through `Display`/`FromStr`.
#[derive(
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    PartialEq,
    Eq,
    PartialOrd,
    Clone,
    Copy,
    Hash,
    thiserror::Error,
)]
#[repr(u8)]
pub enum StatusCode {
    #[strum(serialize = "ok")]
    Ok = 0,
    #[strum(serialize = "cancelled")]
    Cancelled = 1,
    #[strum(serialize = "unknown")]
    Unknown = 2,
    #[strum(serialize = "invalid_argument")]
    InvalidArgument = 3,
    #[strum(serialize = "deadline_exceeded")]
    DeadlineExceeded = 4,
    #[strum(serialize = "not_found")]
    NotFound = 5,
    #[strum(serialize = "already_exists")]
    AlreadyExists = 6,
    #[strum(serialize = "permission_denied")]
    PermissionDenied = 7,
    #[strum(serialize = "resource_exhausted")]
    ResourceExhausted = 8,
    #[strum(serialize = "failed_precondition")]
    FailedPrecondition = 9,
    #[strum(serialize = "aborted")]
    Aborted = 10,
    #[strum(serialize = "out_of_range")]
    OutOfRange = 11,
    #[strum(serialize = "unimplemented")]
    Unimplemented = 12,
    #[strum(serialize = "internal")]
    Internal = 13,
    #[strum(serialize = "unavailable")]
    Unavailable = 14,
    #[strum(serialize = "data_loss")]
    DataLoss = 15,
    #[strum(serialize = "unauthenticated")]
    Unauthenticated = 16,
}

// The default Debug derive would ignore the strum wire names
impl fmt::Debug for StatusCode {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl StatusCode {
    #[inline]
    pub fn as_bytes<'a>(&'a self) -> &'a [u8] {
        self.as_ref().as_bytes()
    }
}

/// The terminal result of a call: code, human-readable details, and
/// trailing metadata delivered alongside.
#[derive(Clone, PartialEq)]
pub struct Status {
    pub code: StatusCode,
    pub details: String,
    pub trailing: Metadata,
}

impl Status {
    #[inline]
    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    #[inline]
    pub fn new<S: Into<String>>(code: StatusCode, details: S) -> Self {
        Self { code, details: details.into(), trailing: Metadata::new() }
    }

    #[inline]
    pub fn with_trailing(mut self, trailing: Metadata) -> Self {
        self.trailing = trailing;
        self
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.details.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.details)
        }
    }
}

impl fmt::Debug for Status {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<StatusCode> for Status {
    #[inline]
    fn from(code: StatusCode) -> Self {
        Self::new(code, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_code_wire_names() {
        assert_eq!(StatusCode::Ok.as_ref(), "ok");
        assert_eq!(StatusCode::DeadlineExceeded.to_string(), "deadline_exceeded");
        let c = StatusCode::from_str("unauthenticated").expect("parse");
        assert_eq!(c, StatusCode::Unauthenticated);
        assert!(StatusCode::from_str("no_such_code").is_err());
    }

    #[test]
    fn test_status_display() {
        let s = Status::new(StatusCode::Internal, "boom");
        assert_eq!(format!("{}", s), "internal: boom");
        assert!(!s.is_ok());
        assert!(Status::ok().is_ok());
    }
}
