//! Request and response interceptors.
//!
//! Interceptors run on every attempt, inside the retry and breaker layers,
//! once they have been enabled on the client builder.

use crate::transport::{HttpRequest, HttpResponse};
use crate::Result;
use async_trait::async_trait;

/// Rewrites an outgoing request (auth headers, tracing ids, URL rewrites...).
///
/// Returning an error fails the attempt without touching the network.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use http::HeaderValue;
/// use querykit::interceptor::RequestInterceptor;
/// use querykit::transport::HttpRequest;
///
/// struct BearerAuth(String);
///
/// #[async_trait]
/// impl RequestInterceptor for BearerAuth {
///     async fn intercept(&self, request: &mut HttpRequest) -> querykit::Result<()> {
///         let value = HeaderValue::from_str(&format!("Bearer {}", self.0))
///             .map_err(|e| querykit::Error::ConfigurationError(e.to_string()))?;
///         request.headers.insert(http::header::AUTHORIZATION, value);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    /// Inspects or modifies the request before it is sent.
    async fn intercept(&self, request: &mut HttpRequest) -> Result<()>;
}

/// Inspects or rewrites a response before status handling and parsing.
#[async_trait]
pub trait ResponseInterceptor: Send + Sync {
    /// Inspects or modifies the response.
    async fn intercept(&self, response: &mut HttpResponse) -> Result<()>;
}
