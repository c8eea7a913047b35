//! Service state definitions.

use serde::Serialize;

/// Ledger service operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Service is constructed but the reconciliation loop is not running.
    Starting,
    /// Service is running and accepting requests.
    Running,
    /// Service is shutting down, not accepting new requests.
    ShuttingDown,
    /// Service is stopped.
    Stopped,
}

impl ServiceState {
    /// Check if the service is accepting new requests.
    pub fn accepts_requests(&self) -> bool {
        matches!(self, ServiceState::Running)
    }

    /// Check if the service is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_running_accepts_requests() {
        assert!(ServiceState::Running.accepts_requests());
        assert!(!ServiceState::Starting.accepts_requests());
        assert!(!ServiceState::ShuttingDown.accepts_requests());
        assert!(ServiceState::Stopped.is_terminal());
    }
}
