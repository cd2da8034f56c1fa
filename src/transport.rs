//! The seam between the client and the network.
//!
//! [`ApiClient`](crate::ApiClient) never talks to a socket directly: every
//! attempt is handed to a [`Transport`]. The default is [`ReqwestTransport`];
//! tests and embedders can plug in their own.

use crate::Result;
use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};
use url::Url;

/// A fully prepared outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// The HTTP method.
    pub method: Method,
    /// The absolute URL, including the query string.
    pub url: Url,
    /// Merged headers.
    pub headers: HeaderMap,
    /// Encoded body, if any.
    pub body: Option<Vec<u8>>,
}

/// A response as returned by a [`Transport`], body fully read.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// The HTTP status code.
    pub status: StatusCode,
    /// The response headers.
    pub headers: HeaderMap,
    /// The raw body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Returns the `Content-Type` header, if present and valid UTF-8.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)?
            .to_str()
            .ok()
    }

    /// Returns the body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends a single request and reads the whole response.
///
/// Implementations must not retry on their own and should return
/// [`Error::Network`](crate::Error::Network) for transport failures; status
/// codes are interpreted by the client.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use querykit::transport::{HttpRequest, HttpResponse, Transport};
/// use http::{HeaderMap, StatusCode};
///
/// struct AlwaysEmpty;
///
/// #[async_trait]
/// impl Transport for AlwaysEmpty {
///     async fn send(&self, _request: HttpRequest) -> querykit::Result<HttpResponse> {
///         Ok(HttpResponse {
///             status: StatusCode::NO_CONTENT,
///             headers: HeaderMap::new(),
///             body: Vec::new(),
///         })
///     }
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs the request.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// [`Transport`] backed by a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Wraps an existing `reqwest::Client`.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
