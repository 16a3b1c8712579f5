//! Error types for the proxy cache.
//!
//! Every operation in the crate reports failures through [`DepotError`]. The
//! error is `Clone` so that a single upstream failure can be handed to every
//! caller coalesced behind a singleflight key.

use std::sync::Arc;
use thiserror::Error;

#[cfg(test)]
mod tests;

/// Shared, type-erased source error.
pub type SharedSource = Arc<dyn std::error::Error + Send + Sync>;

/// Main error type for proxy cache operations
#[derive(Error, Debug, Clone)]
pub enum DepotError {
    /// Upstream or local store reports the artifact as absent (404)
    #[error("{resource_type} not found: {name}")]
    NotFound { resource_type: String, name: String },

    /// Upstream throttling (429)
    #[error("Rate limit: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<u64>,
    },

    /// A concurrent identical push is already in progress
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// The caller is not allowed to perform the operation (403)
    #[error("Denied: {message}")]
    Denied { message: String },

    /// Bytes delivered differ from the advertised length
    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Transient network errors (connection, timeout, DNS, truncated stream)
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<SharedSource>,
    },

    /// Upstream answered with a server error (500, 502, 503, 504)
    #[error("Server error (status: {status_code}): {message}")]
    Server { message: String, status_code: u16 },

    /// Upstream refused our credentials (401, 403)
    #[error("Authentication error (status: {status_code:?}): {message}")]
    Authentication {
        message: String,
        status_code: Option<u16>,
    },

    /// Validation errors (invalid manifest, digest mismatch, bad reference)
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        #[source]
        source: Option<SharedSource>,
    },

    /// Configuration errors (invalid config file, missing settings)
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<String>,
        #[source]
        source: Option<SharedSource>,
    },
}

/// Result type alias for proxy cache operations
pub type Result<T> = std::result::Result<T, DepotError>;

impl DepotError {
    /// Creates a new not found error.
    ///
    /// # Examples
    ///
    /// ```
    /// use libdepot::error::DepotError;
    ///
    /// let err = DepotError::not_found("manifest", "library/hello:latest");
    /// assert!(err.is_not_found());
    /// ```
    pub fn not_found<S: Into<String>>(resource_type: S, name: S) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// Creates a new rate limit error.
    ///
    /// # Examples
    ///
    /// ```
    /// use libdepot::error::DepotError;
    ///
    /// let err = DepotError::rate_limit("too many requests", Some(60));
    /// assert!(err.is_rate_limit());
    /// ```
    pub fn rate_limit<S: Into<String>>(message: S, retry_after: Option<u64>) -> Self {
        Self::RateLimit {
            message: message.into(),
            retry_after,
        }
    }

    /// Creates a new conflict error.
    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates a new denied error.
    ///
    /// # Examples
    ///
    /// ```
    /// use libdepot::error::DepotError;
    ///
    /// let err = DepotError::denied("push to proxy project");
    /// assert!(matches!(err, DepotError::Denied { .. }));
    /// ```
    pub fn denied<S: Into<String>>(message: S) -> Self {
        Self::Denied {
            message: message.into(),
        }
    }

    /// Creates a new size mismatch error.
    pub fn size_mismatch(expected: u64, actual: u64) -> Self {
        Self::SizeMismatch { expected, actual }
    }

    /// Creates a new network error.
    ///
    /// # Examples
    ///
    /// ```
    /// use libdepot::error::DepotError;
    ///
    /// let err = DepotError::network("connection refused");
    /// assert!(matches!(err, DepotError::Network { .. }));
    /// ```
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new network error with a source error.
    pub fn network_with_source<S, E>(message: S, source: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Network {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Creates a new server error.
    pub fn server<S: Into<String>>(message: S, status_code: u16) -> Self {
        Self::Server {
            message: message.into(),
            status_code,
        }
    }

    /// Creates a new authentication error.
    pub fn authentication<S: Into<String>>(message: S, status_code: Option<u16>) -> Self {
        Self::Authentication {
            message: message.into(),
            status_code,
        }
    }

    /// Creates a new validation error.
    ///
    /// # Examples
    ///
    /// ```
    /// use libdepot::error::DepotError;
    ///
    /// let err = DepotError::validation("invalid manifest format");
    /// assert!(matches!(err, DepotError::Validation { .. }));
    /// ```
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new validation error with a source error.
    pub fn validation_with_source<S, E>(message: S, source: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Validation {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Creates a new configuration error.
    pub fn config<S: Into<String>>(message: S, path: Option<S>) -> Self {
        Self::Config {
            message: message.into(),
            path: path.map(|p| p.into()),
            source: None,
        }
    }

    /// Creates a new configuration error with a source error.
    pub fn config_with_source<S, E>(message: S, path: Option<S>, source: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Config {
            message: message.into(),
            path: path.map(|p| p.into()),
            source: Some(Arc::new(source)),
        }
    }

    /// Returns true for errors meaning "the artifact does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true when upstream throttled the request.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimit { .. })
    }

    /// Returns true when an identical push was already running and this one
    /// was skipped.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// HTTP status a client should see for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::RateLimit { .. } => 429,
            Self::Conflict { .. } => 409,
            Self::Denied { .. } => 403,
            Self::Authentication { .. } => 401,
            Self::Validation { .. } => 400,
            Self::Server { .. } | Self::Network { .. } => 502,
            Self::SizeMismatch { .. } | Self::Config { .. } => 500,
        }
    }
}
