//! Dispatch error taxonomy shared by workers and the router

use thiserror::Error;

/// Errors surfaced at the worker/router boundary.
///
/// A well-formed JSON-RPC error body from an upstream is not represented
/// here: the worker forwards it as a successful response. Only failures
/// that influence routing decisions appear as variants.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Upstream returned a JSON-RPC error classified as retryable elsewhere
    #[error("transient upstream error: {message} (endpoint: {endpoint}, code: {code:?})")]
    TransientUpstream {
        endpoint: String,
        code: Option<i64>,
        message: String,
    },

    /// The HTTP exchange itself failed (DNS, reset, timeout)
    #[error("transport error: {message} (endpoint: {endpoint})")]
    Transport {
        endpoint: String,
        message: String,
        timed_out: bool,
    },

    /// The worker queue is at capacity
    #[error("queue full (endpoint: {endpoint}, capacity: {capacity})")]
    QueueFull { endpoint: String, capacity: usize },

    /// The worker task went away before completing the request
    #[error("worker stopped before completing the request (endpoint: {endpoint})")]
    WorkerGone { endpoint: String },

    /// Every endpoint was exhausted under the retry policy
    #[error("All RPC endpoints failed: {last_error}")]
    AllEndpointsFailed { attempts: u32, last_error: String },
}

impl DispatchError {
    /// Whether the router should try another endpoint after this error
    pub fn is_failover(&self) -> bool {
        match self {
            DispatchError::TransientUpstream { .. } => true,
            DispatchError::Transport { .. } => true,
            DispatchError::QueueFull { .. } => true,
            DispatchError::WorkerGone { .. } => true,
            DispatchError::AllEndpointsFailed { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failover_classification() {
        assert!(DispatchError::TransientUpstream {
            endpoint: "https://rpc-a.example.com".to_string(),
            code: Some(19),
            message: "Temporary internal error".to_string(),
        }
        .is_failover());

        assert!(DispatchError::Transport {
            endpoint: "https://rpc-a.example.com".to_string(),
            message: "connection reset".to_string(),
            timed_out: false,
        }
        .is_failover());

        assert!(DispatchError::QueueFull {
            endpoint: "https://rpc-a.example.com".to_string(),
            capacity: 1000,
        }
        .is_failover());

        assert!(!DispatchError::AllEndpointsFailed {
            attempts: 4,
            last_error: "transport error".to_string(),
        }
        .is_failover());
    }
}
