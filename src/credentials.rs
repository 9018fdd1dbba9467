//! Per-call credential binding.
//!
//! A call credential mints metadata entries just-in-time, while the
//! engine assembles the outbound initial metadata. Channel credentials
//! exist at this layer only as a type that must be rejected when bound
//! to a call.

use callmux_core::buffer::Slice;
use callmux_core::status::{Status, StatusCode};
use std::fmt;
use std::sync::Arc;

/// Metadata key the stock token credential mints its token under.
pub const AUTHORIZATION_TOKEN_KEY: &str = "rpc-authorization-token";
/// Metadata key the stock token credential mints its selector under.
pub const AUTHORITY_SELECTOR_KEY: &str = "rpc-authority-selector";

/// Mints metadata entries for one outbound call.
///
/// Invoked on the submitting thread while send-initial-metadata is
/// being dispatched, with the call's authority and method path. An
/// error fails the call with `unauthenticated` before anything reaches
/// the wire.
pub trait CallCredentials: Send + Sync + fmt::Debug {
    fn mint(&self, authority: &str, method: &str) -> Result<Vec<(String, Slice)>, Status>;
}

/// Transport-security material consumed when a connection is
/// established. Opaque here; binding one to a call is an error.
pub trait ChannelCredentials: Send + Sync + fmt::Debug {}

/// What [`crate::call::Call::set_credentials`] accepts.
#[derive(Clone, Debug)]
pub enum Credentials {
    Channel(Arc<dyn ChannelCredentials>),
    PerCall(Arc<dyn CallCredentials>),
}

/// Stock per-call credential carrying a bearer token and an authority
/// selector, minted under the two reserved keys.
pub struct AccessTokenCredentials {
    token: String,
    selector: String,
}

impl AccessTokenCredentials {
    pub fn new<T: Into<String>, S: Into<String>>(token: T, selector: S) -> Credentials {
        Credentials::PerCall(Arc::new(Self { token: token.into(), selector: selector.into() }))
    }
}

impl CallCredentials for AccessTokenCredentials {
    fn mint(&self, _authority: &str, _method: &str) -> Result<Vec<(String, Slice)>, Status> {
        if self.token.is_empty() {
            return Err(Status::new(StatusCode::Unauthenticated, "empty access token"));
        }
        Ok(vec![
            (AUTHORIZATION_TOKEN_KEY.to_string(), Slice::from(self.token.as_str())),
            (AUTHORITY_SELECTOR_KEY.to_string(), Slice::from(self.selector.as_str())),
        ])
    }
}

impl fmt::Debug for AccessTokenCredentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // never log the token itself
        write!(f, "access_token(selector:{})", self.selector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_mint() {
        let creds = AccessTokenCredentials::new("tok", "sel");
        let Credentials::PerCall(c) = creds else { panic!("wrong kind") };
        let entries = c.mint("svc.test", "/foo").expect("mint");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, AUTHORIZATION_TOKEN_KEY);
        assert_eq!(entries[0].1.as_ref(), b"tok");
        assert_eq!(entries[1].0, AUTHORITY_SELECTOR_KEY);
    }

    #[test]
    fn test_empty_token_rejected() {
        let creds = AccessTokenCredentials::new("", "sel");
        let Credentials::PerCall(c) = creds else { panic!("wrong kind") };
        let err = c.mint("svc.test", "/foo").unwrap_err();
        assert_eq!(err.code, StatusCode::Unauthenticated);
    }
}
