/// Userland error types and retry utilities

/// Remediation hint appended when no source could provide the sandbox executable
const ACQUISITION_REMEDY: &str = "Fix: place a proot binary for this architecture in the bundled \
directory (proot-x86_64 or proot-arm64), or list a reachable mirror in config.json under \
\"sandbox_sources\".";

/// Main error type for provisioning and execution operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A file or resource that must exist is missing
    #[error("Not found: {what}")]
    NotFound { what: String },
    /// Cooperative abort requested by the caller; not a failure
    #[error("Operation cancelled")]
    Cancelled,
    /// Non-2xx response or network fault
    #[error("Transfer failed for {url}: {message}")]
    Transfer {
        url: String,
        status: Option<u16>,
        message: String,
        retryable: bool,
    },
    /// Archive did not have the expected format or did not contain the entry
    #[error("Extraction failed: {reason}")]
    Extraction { reason: String },
    /// Every sandbox source failed
    #[error(
        "Could not get proot from any source.\nErrors:\n{}\n\n{}",
        causes.join("\n"),
        ACQUISITION_REMEDY
    )]
    AcquisitionExhausted { causes: Vec<String> },
    /// A sandboxed command exceeded its time budget
    #[error("Timed out after {millis}ms")]
    TimeoutExpired { millis: u64 },
    /// A provisioning step failed
    #[error("Setup failed while {step}: {reason}")]
    Setup { step: String, reason: String },
    /// Environment ids name a single directory under the environment root
    #[error("Invalid environment id {id:?}")]
    InvalidEnvironmentId { id: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Wrapped anyhow error for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn extraction(reason: impl Into<String>) -> Self {
        Self::Extraction {
            reason: reason.into(),
        }
    }

    pub fn setup(step: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Setup {
            step: step.into(),
            reason: reason.to_string(),
        }
    }

    pub fn http_status(url: &str, status: u16) -> Self {
        Self::Transfer {
            url: url.to_string(),
            status: Some(status),
            message: format!("HTTP {status}"),
            retryable: status >= 500,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Helper to determine if an error is worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transfer { retryable, .. } => *retryable,
            Self::NotFound { .. } => false,
            Self::Cancelled => false,
            Self::Extraction { .. } => false,
            Self::AcquisitionExhausted { .. } => false,
            Self::TimeoutExpired { .. } => false,
            Self::Setup { .. } => false,
            Self::InvalidEnvironmentId { .. } => false,
            Self::Io(_) => false,
            Self::Other(_) => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let url = err
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        Self::Transfer {
            url,
            status: err.status().map(|s| s.as_u16()),
            retryable: err.is_connect() || err.is_timeout(),
            message: err.to_string(),
        }
    }
}

/// Retry configuration for transfers
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Calculates exponential backoff with jitter
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> u64 {
    let backoff = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powi(attempt as i32))
    .min(config.max_backoff_ms as f64) as u64;

    // Add jitter: ±20% of backoff
    let jitter = (backoff as f64) * (rand::random::<f64>() * 0.4 - 0.2);
    ((backoff as f64) + jitter).max(0.0) as u64
}
