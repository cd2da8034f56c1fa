//! Error types for the request pipeline, the retry/breaker layers and the caches.
//!
//! Every failure surfaces as a single [`Error`] enum. HTTP failures carry an
//! [`ApiError`] with a locale-resolved message, the raw response body and the
//! response headers, so callers can always build a user-facing message. The
//! enum is `Clone` because a deduplicated query hands the same outcome to
//! every waiter.

use http::{HeaderMap, StatusCode};
use std::sync::Arc;
use std::time::Duration;

/// A non-2xx HTTP response (or a timed-out request) normalized into a typed error.
///
/// # Examples
///
/// ```
/// use querykit::ApiError;
/// use http::StatusCode;
///
/// let err = ApiError::new(StatusCode::NOT_FOUND, "Resource not found.");
/// assert_eq!(err.status.as_u16(), 404);
/// assert_eq!(err.status_text, "Not Found");
/// assert_eq!(err.to_string(), "Resource not found.");
/// assert!(!err.timed_out);
/// ```
#[derive(thiserror::Error, Debug, Clone)]
#[error("{message}")]
pub struct ApiError {
    /// The HTTP status code (408 for client-side timeouts).
    pub status: StatusCode,
    /// The canonical reason phrase for `status`.
    pub status_text: String,
    /// Human readable message, resolved against the request or client locale.
    pub message: String,
    /// The raw response body.
    pub raw_response: String,
    /// The response body parsed as JSON, when it was JSON.
    pub data: Option<serde_json::Value>,
    /// The response headers.
    pub headers: HeaderMap,
    /// `true` when the request was aborted because it exceeded its timeout.
    pub timed_out: bool,
    /// Delay requested by the server through `Retry-After`.
    pub retry_after: Option<Duration>,
}

impl ApiError {
    /// Creates an error for `status` with the given message and no body.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            message: message.into(),
            raw_response: String::new(),
            data: None,
            headers: HeaderMap::new(),
            timed_out: false,
            retry_after: None,
        }
    }

    /// Creates the error reported when a request exceeds its timeout.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            timed_out: true,
            ..Self::new(StatusCode::REQUEST_TIMEOUT, message)
        }
    }

    /// Returns `true` for 4xx statuses.
    pub fn is_client_error(&self) -> bool {
        self.status.is_client_error()
    }

    /// Returns `true` for 5xx statuses.
    pub fn is_server_error(&self) -> bool {
        self.status.is_server_error()
    }
}

/// The main error type of the crate.
///
/// # Examples
///
/// ```no_run
/// use querykit::{ApiClient, Error};
///
/// # async fn example() -> Result<(), Error> {
/// let client = ApiClient::builder()
///     .base_url("https://api.example.com")?
///     .build()?;
///
/// match client.get::<serde_json::Value>("/endpoint").await {
///     Ok(response) => println!("Success: {:?}", response.data),
///     Err(Error::Api(api)) if api.timed_out => eprintln!("Timed out"),
///     Err(Error::Api(api)) => eprintln!("HTTP {}: {}", api.status, api.message),
///     Err(Error::RetryExhausted { attempts, last_error }) => {
///         eprintln!("Gave up after {} attempts: {}", attempts, last_error)
///     }
///     Err(Error::CircuitOpen { retry_in }) => eprintln!("Backing off for {:?}", retry_in),
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// A transport-level failure (connection refused, DNS, reset...).
    ///
    /// The underlying error is passed through unchanged.
    #[error("Network error: {0}")]
    Network(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// The server answered with a non-2xx status, or the request timed out.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The call was cancelled through its cancellation token.
    #[error("Request was aborted")]
    Aborted,

    /// The circuit breaker is open and the operation was not attempted.
    #[error("Circuit breaker is open, retry in {retry_in:?}")]
    CircuitOpen {
        /// Time left before the breaker admits a trial call.
        retry_in: Duration,
    },

    /// Every allowed attempt failed.
    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetryExhausted {
        /// Number of attempts made.
        attempts: usize,
        /// The error returned by the final attempt.
        last_error: Box<Error>,
    },

    /// The response body did not match the caller-supplied schema.
    #[error("Response failed validation: {message}")]
    Validation {
        /// What the schema rejected.
        message: String,
        /// The raw response body.
        raw_response: String,
    },

    /// The response body could not be turned into the requested type.
    #[error("Failed to deserialize response (status {status}): {serde_error}")]
    DeserializationFailed {
        /// The raw response body that failed to deserialize
        raw_response: String,
        /// The serde error message
        serde_error: String,
        /// The HTTP status code
        status: StatusCode,
    },

    /// The request body could not be serialized.
    #[error("Failed to serialize request: {0}")]
    SerializationFailed(String),

    /// A storage backend rejected an operation.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid client or request configuration.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// An invalid URL was provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl Error {
    /// Wraps any transport error.
    pub fn network(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Network(Arc::new(error))
    }

    /// Returns `true` if the default retry predicate would retry this error.
    ///
    /// Everything is retryable except errors that cannot succeed on a second
    /// try: 4xx responses other than 408 and 429, cancellation, an open
    /// breaker, exhausted retries, schema rejections and configuration
    /// problems (bad URLs, unserializable payloads).
    ///
    /// # Examples
    ///
    /// ```
    /// use querykit::{ApiError, Error};
    /// use http::StatusCode;
    ///
    /// let err = Error::Api(ApiError::new(StatusCode::BAD_GATEWAY, "Bad gateway."));
    /// assert!(err.is_retryable());
    ///
    /// let err = Error::Api(ApiError::new(StatusCode::NOT_FOUND, "Resource not found."));
    /// assert!(!err.is_retryable());
    ///
    /// assert!(!Error::Aborted.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Api(api) => {
                api.timed_out
                    || !api.status.is_client_error()
                    || api.status == StatusCode::TOO_MANY_REQUESTS
                    || api.status == StatusCode::REQUEST_TIMEOUT
            }
            Error::Aborted
            | Error::CircuitOpen { .. }
            | Error::RetryExhausted { .. }
            | Error::Validation { .. }
            | Error::SerializationFailed(_)
            | Error::ConfigurationError(_)
            | Error::InvalidUrl(_) => false,
            Error::Network(_) | Error::DeserializationFailed { .. } | Error::Storage(_) => true,
        }
    }

    /// Returns `true` if this is (or wraps) a timed-out request.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Api(api) => api.timed_out,
            Error::RetryExhausted { last_error, .. } => last_error.is_timeout(),
            _ => false,
        }
    }

    /// Returns the HTTP status code if this error has one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Api(api) => Some(api.status),
            Error::DeserializationFailed { status, .. } => Some(*status),
            Error::RetryExhausted { last_error, .. } => last_error.status(),
            _ => None,
        }
    }

    /// Returns the raw response body if this error has one.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            Error::Api(api) => Some(&api.raw_response),
            Error::Validation { raw_response, .. } => Some(raw_response),
            Error::DeserializationFailed { raw_response, .. } => Some(raw_response),
            Error::RetryExhausted { last_error, .. } => last_error.raw_response(),
            _ => None,
        }
    }

    /// Returns the [`ApiError`] behind this error, looking through retry exhaustion.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Error::Api(api) => Some(api),
            Error::RetryExhausted { last_error, .. } => last_error.api_error(),
            _ => None,
        }
    }

    /// Returns the server-requested retry delay, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Api(api) => api.retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::network(error)
    }
}

/// A specialized `Result` type for this crate.
///
/// This is a convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Parses a `Retry-After` header given either as delay-seconds or as an HTTP date.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(seconds) = header.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = httpdate::parse_http_date(header).ok()?;
    date.duration_since(std::time::SystemTime::now()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_timeout_error_shape() {
        let err = ApiError::timeout("The request timed out.");
        assert_eq!(err.status, StatusCode::REQUEST_TIMEOUT);
        assert!(err.timed_out);

        let err = Error::from(err);
        assert!(err.is_timeout());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_accessors_look_through_retry_exhaustion() {
        let mut api = ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "Service unavailable.");
        api.raw_response = "down".to_string();
        let err = Error::RetryExhausted {
            attempts: 3,
            last_error: Box::new(Error::Api(api)),
        };

        assert_eq!(err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(err.raw_response(), Some("down"));
        assert!(err.api_error().is_some());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_only_known_permanent_errors_are_not_retryable() {
        let retryable = [
            Error::network(std::io::Error::other("reset")),
            Error::Api(ApiError::new(StatusCode::BAD_GATEWAY, "Bad gateway.")),
            Error::Api(ApiError::new(StatusCode::TOO_MANY_REQUESTS, "Too many requests.")),
            Error::DeserializationFailed {
                raw_response: "{".to_string(),
                serde_error: "EOF while parsing".to_string(),
                status: StatusCode::OK,
            },
            Error::Storage("disk full".to_string()),
        ];
        for err in &retryable {
            assert!(err.is_retryable(), "{:?} should be retryable", err);
        }

        let permanent = [
            Error::Api(ApiError::new(StatusCode::UNAUTHORIZED, "Unauthorized.")),
            Error::Aborted,
            Error::CircuitOpen {
                retry_in: Duration::from_secs(1),
            },
            Error::Validation {
                message: "missing field `id`".to_string(),
                raw_response: "{}".to_string(),
            },
            Error::SerializationFailed("key must be a string".to_string()),
            Error::ConfigurationError("Base URL is required".to_string()),
        ];
        for err in &permanent {
            assert!(!err.is_retryable(), "{:?} should not be retryable", err);
        }
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let when = std::time::SystemTime::now() + Duration::from_secs(120);
        let mut headers = HeaderMap::new();
        headers.insert(
            "retry-after",
            HeaderValue::from_str(&httpdate::fmt_http_date(when)).unwrap(),
        );

        let delay = parse_retry_after(&headers).unwrap();
        assert!(delay <= Duration::from_secs(120));
        assert!(delay >= Duration::from_secs(110));
    }

    #[test]
    fn test_parse_retry_after_garbage() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers), None);
    }
}
