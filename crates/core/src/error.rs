use thiserror::Error;

/// The failure taxonomy every Porthole error maps into.
///
/// The kind decides policy: only `Transient` failures are retried, and only
/// with the jittered backoff; everything else is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid inputs. Surfaced, never retried.
    Configuration,
    /// Credentials missing or expired.
    Authentication,
    /// Permission denied. Never retried.
    Authorization,
    /// Network blips, throttling, transiently unavailable services.
    Transient,
    /// Bastion not active, no endpoints, quota exceeded. Actionable, not
    /// retried.
    Resource,
    /// Invariant violations inside Porthole itself.
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Transient => "transient",
            ErrorKind::Resource => "resource",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every crate error so callers can apply kind-based policy
/// without matching concrete variants.
pub trait Classify {
    fn kind(&self) -> ErrorKind;

    fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Invariant violation. Carries enough context to make the fatal log line
/// useful on its own.
#[derive(Error, Debug)]
#[error("internal invariant violated: {0}")]
pub struct InvariantError(pub String);

impl Classify for InvariantError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}
