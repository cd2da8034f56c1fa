//! HTTP client with retries, circuit breaking and locale-aware errors.
//!
//! The [`ApiClient`] type is the main entry point for making HTTP requests.
//! Use [`ApiClientBuilder`] to configure and create clients.

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig},
    error::parse_retry_after,
    interceptor::{RequestInterceptor, ResponseInterceptor},
    messages::Messages,
    request::RequestOptions,
    retry::{RetryConfig, RetryPolicy, RetryPredicate},
    transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport},
    ApiError, Error, Response, Result,
};
use http::{header::CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

/// An HTTP client for JSON APIs.
///
/// Every call goes through the same pipeline: the retry policy wraps the
/// circuit breaker, which wraps a single attempt (interceptors, transport,
/// timeout, status handling, parsing, schema validation). The client is cheap
/// to clone; clones share the connection pool and the circuit breaker.
///
/// # Examples
///
/// ```no_run
/// use querykit::{ApiClient, Response, RetryConfig};
/// use serde::{Deserialize, Serialize};
/// use std::time::Duration;
///
/// #[derive(Serialize)]
/// struct CreateUser {
///     name: String,
///     email: String,
/// }
///
/// #[derive(Deserialize)]
/// struct User {
///     id: u64,
///     name: String,
/// }
///
/// # async fn example() -> Result<(), querykit::Error> {
/// let client = ApiClient::builder()
///     .base_url("https://api.example.com")?
///     .timeout(Duration::from_secs(30))
///     .retry_config(RetryConfig {
///         max_attempts: 4,
///         jitter: true,
///         ..Default::default()
///     })
///     .build()?;
///
/// let user: Response<User> = client.get("/users/123").await?;
/// println!("User: {}", user.data.name);
///
/// let new_user = CreateUser {
///     name: "Alice".to_string(),
///     email: "alice@example.com".to_string(),
/// };
/// let created: Response<User> = client.post("/users", &new_user).await?;
/// println!("Created user with ID: {}", created.data.id);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    base_url: Url,
    default_headers: HeaderMap,
    timeout: Option<Duration>,
    retry_policy: RetryPolicy,
    breaker: CircuitBreaker,
    locale: String,
    messages: Messages,
    interceptors_enabled: bool,
    request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
    response_interceptors: Vec<Arc<dyn ResponseInterceptor>>,
}

/// What a successful attempt produced, before typed conversion.
struct Received {
    data: Value,
    raw_body: String,
    status: StatusCode,
    headers: HeaderMap,
}

impl ApiClient {
    /// Creates a new `ApiClientBuilder` for configuring a client.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use querykit::ApiClient;
    ///
    /// # fn example() -> Result<(), querykit::Error> {
    /// let client = ApiClient::builder()
    ///     .base_url("https://api.example.com")?
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder() -> ApiClientBuilder {
        ApiClientBuilder::new()
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    /// Returns the default locale used for error messages.
    pub fn locale(&self) -> &str {
        &self.inner.locale
    }

    /// Returns the circuit breaker shared by every call made through this client.
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// Makes a request described by `options` and parses the body into `T`.
    ///
    /// This is the method every other request helper delegates to.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use querykit::{ApiClient, RequestOptions};
    /// use http::Method;
    /// use serde::Deserialize;
    ///
    /// #[derive(Deserialize)]
    /// struct SearchResults { results: Vec<String> }
    ///
    /// # async fn example() -> Result<(), querykit::Error> {
    /// let client = ApiClient::builder()
    ///     .base_url("https://api.example.com")?
    ///     .build()?;
    ///
    /// let options = RequestOptions::new()
    ///     .method(Method::POST)
    ///     .json(&serde_json::json!({ "query": "rust" }))?
    ///     .query("page", "1")
    ///     .locale("es");
    ///
    /// let response = client.request::<SearchResults>("/search", options).await?;
    /// println!("Found {} results", response.data.results.len());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn request<T>(&self, path: &str, options: RequestOptions) -> Result<Response<T>>
    where
        T: DeserializeOwned,
    {
        let (received, latency, attempts) = self.execute(path, &options).await?;
        let Received {
            data,
            raw_body,
            status,
            headers,
        } = received;

        match serde_json::from_value::<T>(data) {
            Ok(data) => Ok(Response::new(
                data, raw_body, status, headers, latency, attempts,
            )),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    raw_response = %raw_body,
                    "Failed to deserialize response"
                );
                Err(Error::DeserializationFailed {
                    raw_response: raw_body,
                    serde_error: e.to_string(),
                    status,
                })
            }
        }
    }

    /// Runs the retry/breaker pipeline and returns the untyped result with
    /// the elapsed time and the number of attempts made.
    async fn execute(
        &self,
        path: &str,
        options: &RequestOptions,
    ) -> Result<(Received, Duration, usize)> {
        let prepared = self.prepare(path, options)?;
        let start_time = Instant::now();
        let attempts = AtomicUsize::new(0);

        let mut run = {
            let (attempts, prepared) = (&attempts, &prepared);
            move || {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.attempt(prepared, options)
            }
        };

        let result = if options.retry {
            self.inner
                .retry_policy
                .execute_with_cancel(&mut run, options.signal.as_ref())
                .await
        } else {
            run().await
        };

        let attempts = attempts.load(Ordering::Relaxed);
        let latency = start_time.elapsed();
        match result {
            Ok(received) => {
                tracing::info!(
                    method = %prepared.method,
                    url = %prepared.url,
                    status = received.status.as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    attempts = attempts,
                    "Received HTTP response"
                );
                Ok((received, latency, attempts))
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    method = %prepared.method,
                    url = %prepared.url,
                    attempts = attempts,
                    "Request failed"
                );
                Err(e)
            }
        }
    }

    /// One attempt guarded by the circuit breaker.
    async fn attempt(&self, prepared: &HttpRequest, options: &RequestOptions) -> Result<Received> {
        self.inner
            .breaker
            .execute(|| self.send_once(prepared.clone(), options))
            .await
    }

    /// Builds the absolute URL, merged headers and encoded body for a call.
    fn prepare(&self, path: &str, options: &RequestOptions) -> Result<HttpRequest> {
        let url = self.build_url(path, &options.search_params)?;

        let mut headers = self.inner.default_headers.clone();
        for name in options.headers.keys() {
            headers.remove(name);
        }
        for (name, value) in &options.headers {
            headers.append(name.clone(), value.clone());
        }

        let body = match &options.body {
            Some(body) => {
                let (bytes, content_type) = body.encode()?;
                if !content_type.is_empty() && !headers.contains_key(CONTENT_TYPE) {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
                }
                Some(bytes)
            }
            None => None,
        };

        Ok(HttpRequest {
            method: options.method.clone(),
            url,
            headers,
            body,
        })
    }

    fn build_url(&self, path: &str, search_params: &[(String, String)]) -> Result<Url> {
        let mut url = if path.starts_with("http://") || path.starts_with("https://") {
            Url::parse(path)?
        } else {
            let (path, query) = match path.split_once('?') {
                Some((path, query)) => (path, Some(query)),
                None => (path, None),
            };
            let mut url = self.inner.base_url.clone();
            let base_path = url.path().trim_end_matches('/').to_string();
            let path = path.trim_start_matches('/');
            if !path.is_empty() {
                url.set_path(&format!("{}/{}", base_path, path));
            }
            url.set_query(query);
            url.set_fragment(None);
            url
        };

        if !search_params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in search_params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Executes a single attempt: interceptors, transport, timeout, parsing.
    async fn send_once(&self, mut request: HttpRequest, options: &RequestOptions) -> Result<Received> {
        if options.is_cancelled() {
            return Err(Error::Aborted);
        }

        if self.inner.interceptors_enabled {
            for interceptor in &self.inner.request_interceptors {
                interceptor.intercept(&mut request).await?;
            }
        }

        tracing::debug!(
            method = %request.method,
            url = %request.url,
            "Executing HTTP request"
        );

        let timeout = options.timeout.or(self.inner.timeout);
        let send = self.inner.transport.send(request);
        let sent = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, send).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(timeout_ms = limit.as_millis() as u64, "Request timed out");
                        Err(Error::Api(ApiError::timeout(
                            self.message(StatusCode::REQUEST_TIMEOUT, options),
                        )))
                    }
                },
                None => send.await,
            }
        };

        let mut response = match &options.signal {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Error::Aborted),
                result = sent => result?,
            },
            None => sent.await?,
        };

        if self.inner.interceptors_enabled {
            for interceptor in &self.inner.response_interceptors {
                interceptor.intercept(&mut response).await?;
            }
        }

        self.handle_response(response, options)
    }

    fn handle_response(&self, response: HttpResponse, options: &RequestOptions) -> Result<Received> {
        let status = response.status;
        let raw_body = response.text();

        if !status.is_success() {
            if status.is_client_error() {
                tracing::error!(
                    status = status.as_u16(),
                    response = %raw_body,
                    "Client error (4xx)"
                );
            } else if status.is_server_error() {
                tracing::warn!(
                    status = status.as_u16(),
                    response = %raw_body,
                    "Server error (5xx)"
                );
            }

            let data = parse_body(&response, &raw_body)
                .ok()
                .filter(|value| !value.is_null());
            let mut error = ApiError::new(status, self.message(status, options));
            error.retry_after = parse_retry_after(&response.headers);
            error.raw_response = raw_body;
            error.data = data;
            error.headers = response.headers;
            return Err(Error::Api(error));
        }

        let data = match parse_body(&response, &raw_body) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    raw_response = %raw_body,
                    "Failed to parse response body"
                );
                return Err(Error::DeserializationFailed {
                    raw_response: raw_body,
                    serde_error: e.to_string(),
                    status,
                });
            }
        };

        if let Some(schema) = &options.schema {
            if let Err(message) = schema.validate(&data) {
                tracing::error!(message = %message, "Response failed validation");
                return Err(Error::Validation {
                    message,
                    raw_response: raw_body,
                });
            }
        }

        Ok(Received {
            data,
            raw_body,
            status,
            headers: response.headers,
        })
    }

    fn message(&self, status: StatusCode, options: &RequestOptions) -> String {
        self.inner.messages.resolve(
            status.as_u16(),
            options.locale.as_deref(),
            &self.inner.locale,
        )
    }

    /// Makes a GET request to the specified path.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use querykit::ApiClient;
    /// use serde::Deserialize;
    ///
    /// #[derive(Deserialize)]
    /// struct User { name: String }
    ///
    /// # async fn example() -> Result<(), querykit::Error> {
    /// let client = ApiClient::builder()
    ///     .base_url("https://api.example.com")?
    ///     .build()?;
    ///
    /// let user: querykit::Response<User> = client.get("/users/123").await?;
    /// println!("User: {}", user.data.name);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get<T>(&self, path: &str) -> Result<Response<T>>
    where
        T: DeserializeOwned,
    {
        self.get_with(path, RequestOptions::new()).await
    }

    /// Makes a GET request with full options.
    pub async fn get_with<T>(&self, path: &str, options: RequestOptions) -> Result<Response<T>>
    where
        T: DeserializeOwned,
    {
        self.request(path, options.method(Method::GET)).await
    }

    /// Makes a POST request with `body` as the payload.
    ///
    /// The argument is always the payload, whatever its shape: a value such as
    /// `json!({ "body": "text" })` is sent as-is. Use
    /// [`post_with`](Self::post_with) to pass request options.
    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<Response<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.post_with(path, RequestOptions::new().json(body)?).await
    }

    /// Makes a POST request with full options.
    pub async fn post_with<T>(&self, path: &str, options: RequestOptions) -> Result<Response<T>>
    where
        T: DeserializeOwned,
    {
        self.request(path, options.method(Method::POST)).await
    }

    /// Makes a PUT request with `body` as the payload.
    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<Response<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.put_with(path, RequestOptions::new().json(body)?).await
    }

    /// Makes a PUT request with full options.
    pub async fn put_with<T>(&self, path: &str, options: RequestOptions) -> Result<Response<T>>
    where
        T: DeserializeOwned,
    {
        self.request(path, options.method(Method::PUT)).await
    }

    /// Makes a PATCH request with `body` as the payload.
    pub async fn patch<B, T>(&self, path: &str, body: &B) -> Result<Response<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.patch_with(path, RequestOptions::new().json(body)?).await
    }

    /// Makes a PATCH request with full options.
    pub async fn patch_with<T>(&self, path: &str, options: RequestOptions) -> Result<Response<T>>
    where
        T: DeserializeOwned,
    {
        self.request(path, options.method(Method::PATCH)).await
    }

    /// Makes a DELETE request to the specified path.
    pub async fn delete<T>(&self, path: &str) -> Result<Response<T>>
    where
        T: DeserializeOwned,
    {
        self.delete_with(path, RequestOptions::new()).await
    }

    /// Makes a DELETE request with full options.
    pub async fn delete_with<T>(&self, path: &str, options: RequestOptions) -> Result<Response<T>>
    where
        T: DeserializeOwned,
    {
        self.request(path, options.method(Method::DELETE)).await
    }

    /// Makes a GET request for a collection.
    ///
    /// Accepts either a bare JSON array or an envelope object whose `data`
    /// or `items` field holds the array.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use querykit::{ApiClient, RequestOptions};
    ///
    /// # async fn example() -> Result<(), querykit::Error> {
    /// let client = ApiClient::builder()
    ///     .base_url("https://api.example.com")?
    ///     .build()?;
    ///
    /// let names = client
    ///     .get_list::<String>("/names", RequestOptions::new().query("limit", "10"))
    ///     .await?;
    /// println!("{} names", names.len());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get_list<T>(&self, path: &str, options: RequestOptions) -> Result<Response<Vec<T>>>
    where
        T: DeserializeOwned,
    {
        let response = self
            .request::<Value>(path, options.method(Method::GET))
            .await?;

        let items = match &response.data {
            Value::Array(_) => response.data.clone(),
            Value::Object(map) => match map.get("data").or_else(|| map.get("items")) {
                Some(items @ Value::Array(_)) => items.clone(),
                _ => {
                    return Err(Error::DeserializationFailed {
                        raw_response: response.raw_body,
                        serde_error: "expected an array or an object with a `data` or `items` array"
                            .to_string(),
                        status: response.status,
                    })
                }
            },
            _ => {
                return Err(Error::DeserializationFailed {
                    raw_response: response.raw_body,
                    serde_error: "expected an array".to_string(),
                    status: response.status,
                })
            }
        };

        match serde_json::from_value::<Vec<T>>(items) {
            Ok(items) => Ok(response.map(|_| items)),
            Err(e) => Err(Error::DeserializationFailed {
                raw_response: response.raw_body,
                serde_error: e.to_string(),
                status: response.status,
            }),
        }
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.inner.base_url.as_str())
            .field("timeout", &self.inner.timeout)
            .field("locale", &self.inner.locale)
            .field("retry_policy", &self.inner.retry_policy)
            .field("breaker", &self.inner.breaker)
            .finish_non_exhaustive()
    }
}

/// Parses a body as JSON or text depending on status and content type.
fn parse_body(response: &HttpResponse, raw: &str) -> serde_json::Result<Value> {
    if response.status == StatusCode::NO_CONTENT || raw.trim().is_empty() {
        return Ok(Value::Null);
    }

    let is_json = response
        .content_type()
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"));
    if is_json {
        serde_json::from_str(raw)
    } else {
        Ok(Value::String(raw.to_string()))
    }
}

/// Builder for configuring and creating an [`ApiClient`].
///
/// # Examples
///
/// ```no_run
/// use querykit::{ApiClientBuilder, CircuitBreakerConfig, RetryConfig};
/// use std::time::Duration;
///
/// # fn example() -> Result<(), querykit::Error> {
/// let client = ApiClientBuilder::new()
///     .base_url("https://api.example.com/v1")?
///     .timeout(Duration::from_secs(30))
///     .retry_config(RetryConfig::default())
///     .circuit_breaker(CircuitBreakerConfig {
///         failure_threshold: 3,
///         ..Default::default()
///     })
///     .default_header("User-Agent", "my-app/1.0")?
///     .locale("es")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ApiClientBuilder {
    base_url: Option<Url>,
    default_headers: HeaderMap,
    timeout: Option<Duration>,
    retry_config: RetryConfig,
    retry_predicate: Option<Box<dyn RetryPredicate>>,
    breaker: Option<CircuitBreaker>,
    locale: String,
    messages: Messages,
    interceptors_enabled: bool,
    request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
    response_interceptors: Vec<Arc<dyn ResponseInterceptor>>,
    transport: Option<Arc<dyn Transport>>,
}

impl ApiClientBuilder {
    /// Creates a new `ApiClientBuilder` with default settings.
    pub fn new() -> Self {
        Self {
            base_url: None,
            default_headers: HeaderMap::new(),
            timeout: None,
            retry_config: RetryConfig::default(),
            retry_predicate: None,
            breaker: None,
            locale: "en".to_string(),
            messages: Messages::new(),
            interceptors_enabled: true,
            request_interceptors: Vec::new(),
            response_interceptors: Vec::new(),
            transport: None,
        }
    }

    /// Sets the base URL for all requests. Its path is kept as a prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.base_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Adds a default header that will be included in all requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn default_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    /// Sets the default timeout for each attempt.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the retry configuration. Defaults to [`RetryConfig::default`].
    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    /// Sets a custom retry predicate.
    ///
    /// By default, requests are retried based on `Error::is_retryable()`.
    pub fn retry_predicate(mut self, predicate: Box<dyn RetryPredicate>) -> Self {
        self.retry_predicate = Some(predicate);
        self
    }

    /// Gives the client its own breaker with `config`.
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = Some(CircuitBreaker::new(config));
        self
    }

    /// Uses an existing breaker, shared with whoever else holds it.
    pub fn shared_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Sets the default locale for error messages (`"en"` by default).
    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    /// Sets custom error-message dictionaries.
    pub fn messages(mut self, messages: Messages) -> Self {
        self.messages = messages;
        self
    }

    /// Adds a request interceptor. Interceptors run in insertion order.
    pub fn request_interceptor(mut self, interceptor: impl RequestInterceptor + 'static) -> Self {
        self.request_interceptors.push(Arc::new(interceptor));
        self
    }

    /// Adds a response interceptor. Interceptors run in insertion order.
    pub fn response_interceptor(mut self, interceptor: impl ResponseInterceptor + 'static) -> Self {
        self.response_interceptors.push(Arc::new(interceptor));
        self
    }

    /// Turns interceptor execution on or off (on by default).
    pub fn interceptors_enabled(mut self, enabled: bool) -> Self {
        self.interceptors_enabled = enabled;
        self
    }

    /// Replaces the default reqwest transport.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Builds the configured `ApiClient`.
    ///
    /// # Errors
    ///
    /// Returns an error if no base URL was provided or if the HTTP client
    /// could not be created.
    pub fn build(self) -> Result<ApiClient> {
        let base_url = self
            .base_url
            .ok_or_else(|| Error::ConfigurationError("Base URL is required".to_string()))?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => {
                let http_client = reqwest::Client::builder().build().map_err(|e| {
                    Error::ConfigurationError(format!("Failed to build HTTP client: {}", e))
                })?;
                Arc::new(ReqwestTransport::new(http_client))
            }
        };

        let mut retry_policy = RetryPolicy::new(self.retry_config);
        if let Some(predicate) = self.retry_predicate {
            retry_policy = retry_policy.with_predicate(predicate);
        }

        let breaker = self
            .breaker
            .unwrap_or_else(|| CircuitBreaker::new(CircuitBreakerConfig::default()));

        Ok(ApiClient {
            inner: Arc::new(ClientInner {
                transport,
                base_url,
                default_headers: self.default_headers,
                timeout: self.timeout,
                retry_policy,
                breaker,
                locale: self.locale,
                messages: self.messages,
                interceptors_enabled: self.interceptors_enabled,
                request_interceptors: self.request_interceptors,
                response_interceptors: self.response_interceptors,
            }),
        })
    }
}

impl Default for ApiClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Body;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records requests and answers from a queue of canned responses.
    #[derive(Default)]
    struct Scripted {
        requests: Mutex<Vec<HttpRequest>>,
        responses: Mutex<Vec<Result<HttpResponse>>>,
    }

    impl Scripted {
        fn push(&self, status: u16, content_type: Option<&str>, body: &str) {
            let mut headers = HeaderMap::new();
            if let Some(ct) = content_type {
                headers.insert(CONTENT_TYPE, HeaderValue::from_str(ct).unwrap());
            }
            self.responses.lock().push(Ok(HttpResponse {
                status: StatusCode::from_u16(status).unwrap(),
                headers,
                body: body.as_bytes().to_vec(),
            }));
        }
    }

    #[async_trait]
    impl Transport for Arc<Scripted> {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
            self.requests.lock().push(request);
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                return Err(Error::network(std::io::Error::other("no scripted response")));
            }
            responses.remove(0)
        }
    }

    fn client(base: &str, transport: Arc<Scripted>) -> ApiClient {
        ApiClient::builder()
            .base_url(base)
            .unwrap()
            .retry_config(RetryConfig::none())
            .transport(transport)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_url_joins_base_path_and_repeats_params() {
        let transport = Arc::new(Scripted::default());
        transport.push(200, Some("application/json"), "[]");
        let client = client("https://x.com/api/v1/", transport.clone());

        let _: Response<Value> = client
            .get_with("/users", RequestOptions::new().query_all("tags", ["a", "b"]))
            .await
            .unwrap();

        let requests = transport.requests.lock();
        assert_eq!(
            requests[0].url.as_str(),
            "https://x.com/api/v1/users?tags=a&tags=b"
        );
    }

    #[tokio::test]
    async fn test_absolute_path_bypasses_base_url() {
        let transport = Arc::new(Scripted::default());
        transport.push(204, None, "");
        let client = client("https://x.com", transport.clone());

        let response: Response<()> = client.delete("https://other.example/thing").await.unwrap();
        assert_eq!(response.status, StatusCode::NO_CONTENT);
        assert_eq!(
            transport.requests.lock()[0].url.as_str(),
            "https://other.example/thing"
        );
    }

    #[tokio::test]
    async fn test_call_headers_override_defaults_case_insensitively() {
        let transport = Arc::new(Scripted::default());
        transport.push(200, Some("text/plain"), "ok");
        let client = ApiClient::builder()
            .base_url("https://x.com")
            .unwrap()
            .default_header("X-Client", "default")
            .unwrap()
            .default_header("Accept", "application/json")
            .unwrap()
            .transport(transport.clone())
            .build()
            .unwrap();

        let response: Response<String> = client
            .get_with("/", RequestOptions::new().header("x-client", "call").unwrap())
            .await
            .unwrap();
        assert_eq!(response.data, "ok");

        let requests = transport.requests.lock();
        let headers = &requests[0].headers;
        assert_eq!(headers.get_all("x-client").iter().count(), 1);
        assert_eq!(headers["x-client"], "call");
        assert_eq!(headers["accept"], "application/json");
    }

    #[tokio::test]
    async fn test_json_body_sets_content_type_only_when_missing() {
        let transport = Arc::new(Scripted::default());
        transport.push(201, Some("application/json"), r#"{"id":1}"#);
        transport.push(201, Some("application/json"), r#"{"id":2}"#);
        let client = client("https://x.com", transport.clone());

        let _: Response<Value> = client
            .post("/items", &serde_json::json!({"name": "a"}))
            .await
            .unwrap();
        let _: Response<Value> = client
            .post_with(
                "/items",
                RequestOptions::new()
                    .header("Content-Type", "application/vnd.api+json")
                    .unwrap()
                    .body(Body::Json(serde_json::json!({"name": "b"}))),
            )
            .await
            .unwrap();

        let requests = transport.requests.lock();
        assert_eq!(requests[0].headers[CONTENT_TYPE], "application/json");
        assert_eq!(requests[0].body.as_deref(), Some(br#"{"name":"a"}"#.as_slice()));
        assert_eq!(requests[1].headers[CONTENT_TYPE], "application/vnd.api+json");
    }

    #[tokio::test]
    async fn test_non_json_response_is_text() {
        let transport = Arc::new(Scripted::default());
        transport.push(200, Some("text/html"), "<p>hi</p>");
        let client = client("https://x.com", transport);

        let response: Response<Value> = client.get("/page").await.unwrap();
        assert_eq!(response.data, Value::String("<p>hi</p>".into()));
    }

    #[tokio::test]
    async fn test_error_message_uses_locale_fallbacks() {
        let transport = Arc::new(Scripted::default());
        transport.push(404, Some("application/json"), r#"{"error":"nope"}"#);
        transport.push(404, Some("application/json"), r#"{"error":"nope"}"#);
        let client = client("https://x.com", transport);

        let err = client.get::<Value>("/missing").await.unwrap_err();
        let api = err.api_error().unwrap();
        assert_eq!(api.message, "Resource not found.");
        assert_eq!(api.data, Some(serde_json::json!({"error": "nope"})));

        let err = client
            .get_with::<Value>("/missing", RequestOptions::new().locale("es-MX"))
            .await
            .unwrap_err();
        assert_eq!(err.api_error().unwrap().message, "Recurso no encontrado.");
    }

    #[tokio::test]
    async fn test_request_interceptor_rewrites_and_can_be_disabled() {
        struct Tag;

        #[async_trait]
        impl RequestInterceptor for Tag {
            async fn intercept(&self, request: &mut HttpRequest) -> Result<()> {
                request
                    .headers
                    .insert("x-intercepted", HeaderValue::from_static("yes"));
                Ok(())
            }
        }

        for enabled in [true, false] {
            let transport = Arc::new(Scripted::default());
            transport.push(204, None, "");
            let client = ApiClient::builder()
                .base_url("https://x.com")
                .unwrap()
                .request_interceptor(Tag)
                .interceptors_enabled(enabled)
                .transport(transport.clone())
                .build()
                .unwrap();

            let _: Response<()> = client.get("/").await.unwrap();
            let intercepted = transport.requests.lock()[0].headers.contains_key("x-intercepted");
            assert_eq!(intercepted, enabled);
        }
    }

    #[tokio::test]
    async fn test_get_list_unwraps_envelopes() {
        let transport = Arc::new(Scripted::default());
        transport.push(200, Some("application/json"), "[1,2]");
        transport.push(200, Some("application/json"), r#"{"data":[3]}"#);
        transport.push(200, Some("application/json"), r#"{"items":[4,5,6]}"#);
        transport.push(200, Some("application/json"), r#"{"count":1}"#);
        let client = client("https://x.com", transport);

        let lists = [
            client.get_list::<u32>("/a", RequestOptions::new()).await.unwrap().data,
            client.get_list::<u32>("/b", RequestOptions::new()).await.unwrap().data,
            client.get_list::<u32>("/c", RequestOptions::new()).await.unwrap().data,
        ];
        assert_eq!(lists, [vec![1, 2], vec![3], vec![4, 5, 6]]);

        let err = client.get_list::<u32>("/d", RequestOptions::new()).await.unwrap_err();
        assert!(matches!(err, Error::DeserializationFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_signal_aborts_without_sending() {
        let transport = Arc::new(Scripted::default());
        transport.push(200, Some("application/json"), "{}");
        let client = client("https://x.com", transport.clone());
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();

        let err = client
            .get_with::<Value>("/", RequestOptions::new().signal(token))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Aborted));
        assert!(transport.requests.lock().is_empty());
    }
}
