//! Configuration for peer sessions.

use std::time::Duration;

/// The default request timeout for a single request.
pub const INITIAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// The timeout after which a peer that has not answered a request at all is
/// considered in protocol violation.
pub const PROTOCOL_BREACH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Capacity of the bounded queue between a session and its message workers.
///
/// A peer that fills the queue faster than the workers drain it is
/// disconnected rather than allowed to stall the socket task.
pub const HEAVY_MESSAGE_QUEUE_CAPACITY: usize = 32;

/// Number of worker tasks draining the heavy message queue per session.
pub const SESSION_WORKERS: usize = 2;

/// Configuration options for peer sessions.
#[derive(Debug, Clone)]
pub struct SessionsConfig {
    /// Size of the session command buffer (per session).
    pub session_command_buffer: usize,
    /// Size of the session event buffer (shared by all sessions).
    pub session_event_buffer: usize,
    /// Capacity of the per-session heavy message queue.
    pub heavy_message_queue_capacity: usize,
    /// Number of workers draining the heavy message queue.
    pub session_workers: usize,
    /// The maximum time to wait for a response from a peer.
    pub request_timeout: Duration,
    /// The maximum time to wait for a response before the peer is considered
    /// in protocol violation.
    pub protocol_breach_request_timeout: Duration,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            // This should be sufficient to slots for handling commands sent to the session task,
            // since the manager is the sender.
            session_command_buffer: 32,
            // This should be greater since the manager is the receiver. The total size will be
            // `buffer + num sessions`. Each session can therefore fit at least 1 message in the
            // channel. The buffer size is additional capacity.
            session_event_buffer: 260,
            heavy_message_queue_capacity: HEAVY_MESSAGE_QUEUE_CAPACITY,
            session_workers: SESSION_WORKERS,
            request_timeout: INITIAL_REQUEST_TIMEOUT,
            protocol_breach_request_timeout: PROTOCOL_BREACH_REQUEST_TIMEOUT,
        }
    }
}

impl SessionsConfig {
    /// Sets the buffer size for the bounded communication channel between the manager and its
    /// sessions for events emitted by the sessions.
    pub const fn with_session_event_buffer(mut self, n: usize) -> Self {
        self.session_event_buffer = n;
        self
    }

    /// Sets the timeout for a single request.
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
