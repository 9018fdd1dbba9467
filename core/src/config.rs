use std::time::Duration;

/// Engine tuning knobs, shared by channels and servers.
#[derive(Clone)]
pub struct RpcConfig {
    /// How many incoming streams may wait for a matching `request_call`
    /// before the server starts refusing them with `unavailable`.
    pub accept_backlog: usize,
    /// How long server shutdown waits for in-flight calls before
    /// cancelling the stragglers.
    pub shutdown_grace: Duration,
    /// Largest message a receive op will accept. An oversize message
    /// fails the call with `resource_exhausted`.
    pub max_message_len: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            accept_backlog: 32,
            shutdown_grace: Duration::from_secs(5),
            max_message_len: 100 * 1024 * 1024,
        }
    }
}
