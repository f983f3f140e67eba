// ============================================================================
// ENGINE ERRORS: one taxonomy shared by every component
// ============================================================================

use std::fmt;

/// Errors surfaced by the compositing engine.
///
/// Only `BackendUnavailable` is terminal (for the service it names). Every
/// other variant is absorbed by the component that produced it and shown to
/// the user as a status line; the affected state is left as it was before the
/// attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Every execution backend failed to initialise for a service.
    BackendUnavailable(String),
    /// The segmentation or background-removal service returned an error or
    /// an output the engine cannot interpret.
    Inference(String),
    /// Source bytes could not be decoded into a pixel buffer.
    Decode(String),
    /// A request was malformed or referred to something that does not exist.
    InvalidInput(String),
    /// The composited frame could not be encoded.
    Encode(String),
    /// Filesystem access failed (settings, CLI output).
    Io(String),
}

impl EngineError {
    /// True for errors that leave the system usable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, EngineError::BackendUnavailable(_))
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::BackendUnavailable(e) => write!(f, "No backend available: {}", e),
            EngineError::Inference(e) => write!(f, "Inference failed: {}", e),
            EngineError::Decode(e) => write!(f, "Could not decode image: {}", e),
            EngineError::InvalidInput(e) => write!(f, "Invalid input: {}", e),
            EngineError::Encode(e) => write!(f, "Could not encode image: {}", e),
            EngineError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<image::ImageError> for EngineError {
    fn from(e: image::ImageError) -> Self {
        EngineError::Decode(e.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_backend_exhaustion_is_fatal() {
        assert!(!EngineError::BackendUnavailable("segmentation".into()).is_recoverable());
        assert!(EngineError::Inference("timeout".into()).is_recoverable());
        assert!(EngineError::Decode("truncated".into()).is_recoverable());
        assert!(EngineError::InvalidInput("nan".into()).is_recoverable());
    }

    #[test]
    fn display_names_the_failure() {
        let msg = EngineError::Decode("bad header".into()).to_string();
        assert_eq!(msg, "Could not decode image: bad header");
    }
}
