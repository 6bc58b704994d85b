/// ocibake error types and handling utilities
use thiserror::Error;

/// Main error type for image assembly
#[derive(Debug, Error)]
pub enum BakeError {
    /// Image reference could not be parsed
    #[error("invalid image reference {reference:?}: {reason}")]
    Reference { reference: String, reason: String },

    /// Registry lookup failed at the transport level
    #[error("registry {registry} unavailable: {message}")]
    RegistryUnavailable { registry: String, message: String },

    /// Registry answered but the image or blob does not exist
    #[error("not found in registry: {reference}")]
    NotFound { reference: String },

    /// Writing the image to a registry failed
    #[error("push to {reference} failed: {message}")]
    Push { reference: String, message: String },

    /// Malformed declarative document
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("layer {layer}: invalid path {path:?}: {reason}")]
    InvalidPath {
        layer: usize,
        path: String,
        reason: String,
    },

    #[error("layer {layer}: duplicate file path {path:?}")]
    DuplicatePath { layer: usize, path: String },

    #[error("layer {layer}: file {path:?} sets both contents and data")]
    ConflictingContent { layer: usize, path: String },

    #[error("layer {layer}: file {path:?} has malformed base64 data: {reason}")]
    Encoding {
        layer: usize,
        path: String,
        reason: String,
    },

    /// Archive download failed or returned a non-success status
    #[error("layer {layer}: fetching {url}: {message}")]
    Fetch {
        layer: usize,
        url: String,
        message: String,
    },

    #[error("layer {layer}: fetching {url}: size mismatch: got {actual} bytes, want {expected}")]
    SizeMismatch {
        layer: usize,
        url: String,
        expected: u64,
        actual: u64,
    },

    #[error("layer {layer}: fetching {url}: digest mismatch: got sha256:{actual}, want sha256:{expected}")]
    Integrity {
        layer: usize,
        url: String,
        expected: String,
        actual: String,
    },

    /// Tar or gzip codec failure while producing a layer
    #[error("layer {layer}: {message}")]
    Layer { layer: usize, message: String },

    #[error("merging runtime config: {0}")]
    Merge(String),

    #[error("build cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BakeError>;

/// Helper to determine if an error is retryable by a caller-level wrapper
pub fn is_retryable(err: &BakeError) -> bool {
    match err {
        BakeError::RegistryUnavailable { .. } => true,
        BakeError::Push { .. } => true,
        BakeError::Fetch { .. } => true,
        BakeError::Io(_) => true,
        BakeError::Reference { .. }
        | BakeError::NotFound { .. }
        | BakeError::Config(_)
        | BakeError::InvalidPath { .. }
        | BakeError::DuplicatePath { .. }
        | BakeError::ConflictingContent { .. }
        | BakeError::Encoding { .. }
        | BakeError::SizeMismatch { .. }
        | BakeError::Integrity { .. }
        | BakeError::Layer { .. }
        | BakeError::Merge(_)
        | BakeError::Cancelled => false,
    }
}

/// Retry configuration for resilient registry operations
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: crate::constants::DEFAULT_MAX_RETRY_ATTEMPTS,
            initial_backoff_ms: crate::constants::DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: crate::constants::DEFAULT_MAX_BACKOFF_MS,
            backoff_multiplier: 2.0,
        }
    }
}

/// Calculates exponential backoff with jitter
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> u64 {
    let backoff = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powi(attempt as i32))
    .min(config.max_backoff_ms as f64) as u64;

    // Add jitter: ±20% of backoff, then clamp to max
    let jitter = (backoff as f64) * (rand::random::<f64>() * 0.4 - 0.2);
    ((backoff as f64) + jitter)
        .max(0.0)
        .min(config.max_backoff_ms as f64) as u64
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is exhausted.
pub fn with_retry<T, F>(config: &RetryConfig, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_retryable(&err) && attempt + 1 < config.max_attempts => {
                let wait = calculate_backoff(attempt, config);
                tracing::warn!(
                    operation = what,
                    attempt = attempt + 1,
                    backoff_ms = wait,
                    error = %err,
                    "Retrying after transient failure"
                );
                std::thread::sleep(std::time::Duration::from_millis(wait));
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
