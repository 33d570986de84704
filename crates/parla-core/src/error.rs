use thiserror::Error;

/// Classification used by the dispatcher to decide whether an attempt may
/// be retried and how a failure is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Microphone unavailable. Fatal to the session, never retried.
    Device,
    /// Timeout, connection failure or 5xx-class response. Retried with
    /// backoff up to the configured bound.
    Transient,
    /// Bad credentials, malformed config, hardware-incompatible model.
    /// Surfaced immediately, never retried.
    Validation,
    /// Local provider selected but the container service is not running.
    ServiceUnavailable,
    /// Container image/build/start failure.
    Lifecycle,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("audio device error: {0}")]
    Device(String),

    #[error("provider request failed: {0}")]
    Transient(String),

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("local service is not running: {0}")]
    ServiceUnavailable(String),

    #[error("local service lifecycle error: {0}")]
    Lifecycle(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Device(_) => ErrorKind::Device,
            PipelineError::Transient(_) => ErrorKind::Transient,
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            PipelineError::Lifecycle(_) => ErrorKind::Lifecycle,
        }
    }

    /// Only transient provider failures are eligible for retry.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Map an HTTP status to the retry classification: 5xx and 429 are
    /// transient, any other 4xx is a validation failure.
    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        let message = format!("{status}: {body}");
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            PipelineError::Transient(message)
        } else {
            PipelineError::Validation(message)
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        // Connect/timeout/body errors are transport-level and retryable;
        // anything that got far enough to carry a status is classified by it.
        match err.status() {
            Some(status) => PipelineError::from_status(status, err.to_string()),
            None => PipelineError::Transient(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        let err = PipelineError::from_status(
            reqwest::StatusCode::BAD_GATEWAY,
            "upstream".to_string(),
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn rate_limit_is_transient() {
        let err = PipelineError::from_status(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            String::new(),
        );
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn client_errors_are_validation() {
        let err = PipelineError::from_status(
            reqwest::StatusCode::UNAUTHORIZED,
            "bad key".to_string(),
        );
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_retryable());
    }
}
