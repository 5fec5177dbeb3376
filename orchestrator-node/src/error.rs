use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in the orchestrator control plane
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Configuration error (bad file, unknown key, invalid value)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transient I/O failure on an external API (retriable)
    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    /// Capacity bound reached or no healthy instance available
    #[error("No capacity: {0}")]
    Capacity(String),

    /// Instance failed to become active within the health-check timeout
    #[error("Health probe timed out for instance {0}")]
    HealthTimeout(Uuid),

    /// Metric re-registration with an incompatible kind or label set
    #[error("Metric schema mismatch for '{name}': {detail}")]
    SchemaMismatch { name: String, detail: String },

    /// Insufficient data or fit failure; callers fall back to thresholds
    #[error("Forecast unavailable: {0}")]
    ForecastUnavailable(String),

    /// Agent-suggested action violates an invariant
    #[error("Invalid action: {0}")]
    InvalidAction(String),

    /// Container image not present in the runtime
    #[error("Image missing: {0}")]
    ImageMissing(String),

    /// The container runtime refused the create for lack of resources
    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    /// Operation on an instance that was already destroyed
    #[error("Instance already destroyed: {0}")]
    AlreadyDestroyed(Uuid),

    /// A second active flow rule for the same (instance, priority)
    #[error("Flow rule conflict: {0}")]
    FlowConflict(String),

    /// Instance pool or flow table corruption; triggers safe mode
    #[error("Fatal state corruption: {0}")]
    Fatal(String),

    /// Network I/O error
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias using OrchestratorError
pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Whether a bounded-backoff retry is appropriate
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::TransientIo(_) | OrchestratorError::Io(_)
        )
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for OrchestratorError {
    fn from(err: toml::de::Error) -> Self {
        OrchestratorError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(err: reqwest::Error) -> Self {
        OrchestratorError::TransientIo(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::Config("unknown key 'frobnicate'".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: unknown key 'frobnicate'"
        );
    }

    #[test]
    fn test_retriable_classification() {
        assert!(OrchestratorError::TransientIo("reset".into()).is_retriable());
        assert!(!OrchestratorError::Capacity("max instances".into()).is_retriable());
        assert!(!OrchestratorError::Fatal("pool corrupt".into()).is_retriable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "probe timed out");
        let err: OrchestratorError = io_err.into();
        assert!(err.is_retriable());
    }
}
