//! Error types for the MongoDB controller

use std::time::Duration;

use thiserror::Error;

/// Error variants are named with the `Error` suffix where they wrap a foreign
/// error (e.g., `KubeError`); lifecycle failures are named after what happened.
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Patch error: {0}")]
    PatchError(#[from] json_patch::PatchError),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency check failed; someone else changed the object
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// An admission invariant was violated
    #[error("Rejected by policy ({reason}): {message}")]
    RejectedByPolicy { reason: String, message: String },

    /// Certificates, secrets or storage classes are not there yet
    #[error("Dependency not ready ({reason}): {message}")]
    DependencyNotReady { reason: String, message: String },

    /// A resume attempt diverges from the retained origin spec
    #[error("Spec mismatch: {0}")]
    SpecMismatch(String),

    #[error("Initialization timed out: {0}")]
    InitializationTimeout(String),

    /// An object with the intended name belongs to something else
    #[error("Ownership conflict: {0}")]
    OwnershipConflict(String),

    #[error("Transient error (will retry): {0}")]
    TransientError(String),

    #[error("Permanent error (will not retry): {0}")]
    PermanentError(String),

    #[error("Operation cancelled by shutdown")]
    Cancelled,
}

impl Error {
    pub fn rejected(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Error::RejectedByPolicy {
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn not_ready(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Error::DependencyNotReady {
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are usually not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                // Network and other errors are retryable
                _ => true,
            },
            Error::Conflict(_) => true,
            Error::AlreadyExists(_) => true,
            Error::TransientError(_) => true,
            Error::DependencyNotReady { .. } => true,
            // Resource might appear later
            Error::NotFound(_) => true,
            Error::FinalizerError(_) => true,
            Error::PermanentError(_) => false,
            Error::InvalidConfig(_) => false,
            Error::RejectedByPolicy { .. } => false,
            Error::SpecMismatch(_) => false,
            Error::InitializationTimeout(_) => false,
            Error::OwnershipConflict(_) => false,
            Error::SerializationError(_) => false,
            Error::PatchError(_) => false,
            Error::MissingObjectKey(_) => false,
            Error::Cancelled => false,
        }
    }

    /// Whether the error reports an admission invariant reaching the reconciler
    pub fn is_policy_violation(&self) -> bool {
        matches!(self, Error::RejectedByPolicy { .. } | Error::SpecMismatch(_))
    }

    /// Whether a store lookup failed because the object is absent
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Stable reason code used for conditions and events
    pub fn reason(&self) -> String {
        match self {
            Error::RejectedByPolicy { reason, .. } => reason.clone(),
            Error::DependencyNotReady { reason, .. } => reason.clone(),
            Error::SpecMismatch(_) => "IrrecoverableSpecMismatch".to_string(),
            Error::InitializationTimeout(_) => "InitializationTimeout".to_string(),
            Error::OwnershipConflict(_) => "OwnershipConflict".to_string(),
            Error::Conflict(_) | Error::AlreadyExists(_) | Error::TransientError(_) => {
                "TransientStoreError".to_string()
            }
            Error::KubeError(_) => "TransientStoreError".to_string(),
            Error::Cancelled => "Cancelled".to_string(),
            Error::InvalidConfig(_) => "InvalidConfiguration".to_string(),
            _ => "ReconcileError".to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300), // 5 minutes
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !base_delay_secs.is_finite() {
            return self.max_delay;
        }

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        // Cap at max delay
        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }
}
