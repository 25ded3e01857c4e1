use super::breaker::BreakerState;
use thiserror::Error;

/// Closed set of failure classes a protected call can report
///
/// Errors are classified once, where the network result is received, and
/// the breaker only ever looks at this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Server-side error (5xx)
    Server { status: u16 },
    /// Client-side error (4xx); counted only when allow-listed
    Client { status: u16 },
    /// Connection refused/reset, DNS, TLS
    Network,
    /// Transport timeout
    Timeout,
    /// Anything else: decode errors, domain rejections, reverts
    Application,
}

impl FailureKind {
    /// Whether this failure moves the breaker toward Open
    pub fn is_counted(&self, counted_client_statuses: &[u16]) -> bool {
        match self {
            FailureKind::Server { .. } | FailureKind::Network | FailureKind::Timeout => true,
            FailureKind::Client { status } => counted_client_statuses.contains(status),
            FailureKind::Application => false,
        }
    }

    /// Classify a bare HTTP status
    pub fn from_status(status: u16) -> Self {
        if status >= 500 {
            FailureKind::Server { status }
        } else if status >= 400 {
            FailureKind::Client { status }
        } else {
            FailureKind::Application
        }
    }
}

/// Errors that can be fed through a circuit breaker
pub trait ClassifyFailure {
    fn failure_kind(&self) -> FailureKind;
}

/// Outcome of a call routed through a breaker
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Breaker rejected the call and no fallback was supplied
    #[error("{dependency} temporarily unavailable (circuit {state})")]
    Unavailable {
        dependency: String,
        state: BreakerState,
    },

    /// The protected operation ran and failed
    #[error("{0}")]
    Operation(E),

    /// The breaker rejected the call and the fallback failed too
    #[error("fallback failed: {0}")]
    Fallback(E),
}

impl<E> BreakerError<E> {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, BreakerError::Unavailable { .. })
    }

    /// The underlying operation or fallback error, if any
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Operation(e) | BreakerError::Fallback(e) => Some(e),
            BreakerError::Unavailable { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_counting() {
        let allow = [401, 408, 429];
        assert!(FailureKind::Server { status: 502 }.is_counted(&allow));
        assert!(FailureKind::Network.is_counted(&allow));
        assert!(FailureKind::Timeout.is_counted(&allow));
        assert!(FailureKind::Client { status: 429 }.is_counted(&allow));
        assert!(!FailureKind::Client { status: 404 }.is_counted(&allow));
        assert!(!FailureKind::Application.is_counted(&allow));
        assert!(!FailureKind::Client { status: 429 }.is_counted(&[]));
    }

    #[test]
    fn test_from_status() {
        assert_eq!(FailureKind::from_status(500), FailureKind::Server { status: 500 });
        assert_eq!(FailureKind::from_status(401), FailureKind::Client { status: 401 });
        assert_eq!(FailureKind::from_status(302), FailureKind::Application);
    }

    #[test]
    fn test_breaker_error_display() {
        let err: BreakerError<String> = BreakerError::Unavailable {
            dependency: "simulation".to_string(),
            state: BreakerState::Open,
        };
        assert_eq!(err.to_string(), "simulation temporarily unavailable (circuit open)");
        assert!(err.is_unavailable());
        assert!(err.into_inner().is_none());

        let err: BreakerError<String> = BreakerError::Operation("boom".to_string());
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.into_inner().as_deref(), Some("boom"));
    }
}
