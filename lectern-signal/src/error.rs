use thiserror::Error;

/// Signaling error taxonomy.
///
/// Every variant is recovered at the request boundary and returned to the
/// single requesting peer as a structured failure acknowledgement; none
/// propagate as a crash. Cleanup-path double-closes are swallowed as no-ops
/// and logged for diagnostics only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Room already exists: {0}")]
    RoomAlreadyExists(String),

    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    #[error("Transport already exists for this peer and direction: {0}")]
    TransportAlreadyExists(String),

    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    #[error("Incompatible capabilities: {0}")]
    IncompatibleCapabilities(String),

    #[error("Media engine not ready")]
    EngineNotReady,

    #[error("Media engine error: {0}")]
    EngineError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl SignalError {
    /// Stable wire code carried in failure acknowledgements
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::RoomNotFound(_) => "roomNotFound",
            Self::RoomAlreadyExists(_) => "roomAlreadyExists",
            Self::TransportNotFound(_) => "transportNotFound",
            Self::TransportAlreadyExists(_) => "transportAlreadyExists",
            Self::ProducerNotFound(_) => "producerNotFound",
            Self::IncompatibleCapabilities(_) => "incompatibleCapabilities",
            Self::EngineNotReady => "engineNotReady",
            Self::EngineError(_) => "engineError",
            Self::Unauthorized(_) => "unauthorized",
        }
    }
}

pub type Result<T> = std::result::Result<T, SignalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            SignalError::RoomNotFound("r1".to_string()).code(),
            "roomNotFound"
        );
        assert_eq!(SignalError::EngineNotReady.code(), "engineNotReady");
        assert_eq!(
            SignalError::TransportAlreadyExists("send".to_string()).code(),
            "transportAlreadyExists"
        );
    }

    #[test]
    fn test_display_includes_context() {
        let err = SignalError::ProducerNotFound("p1".to_string());
        assert_eq!(err.to_string(), "Producer not found: p1");
    }
}
