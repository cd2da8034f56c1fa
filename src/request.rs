//! Per-call request options.
//!
//! [`RequestOptions`] is the request descriptor handed to
//! [`ApiClient::request`](crate::ApiClient::request): method, headers, body,
//! search params, timeout, response schema, locale override, retry opt-out
//! and cancellation. Client-level defaults are merged underneath it, with the
//! call's values winning.

use crate::{Error, Result};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A request body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Encoded with `serde_json`; gets `Content-Type: application/json` unless one is set.
    Json(Value),
    /// Sent as-is; gets `Content-Type: text/plain; charset=utf-8` unless one is set.
    Text(String),
    /// Sent as-is with no implied content type.
    Bytes(Vec<u8>),
}

impl Body {
    /// Serializes `value` into a body.
    ///
    /// Strings are sent verbatim as text; every other value is sent as JSON.
    /// An object that happens to have a single `body` field is still data:
    ///
    /// ```
    /// use querykit::Body;
    /// use serde_json::json;
    ///
    /// assert_eq!(Body::from_value(&"hello").unwrap(), Body::Text("hello".into()));
    /// assert_eq!(
    ///     Body::from_value(&json!({ "body": "hello" })).unwrap(),
    ///     Body::Json(json!({ "body": "hello" })),
    /// );
    /// ```
    pub fn from_value<B: Serialize + ?Sized>(value: &B) -> Result<Self> {
        let value =
            serde_json::to_value(value).map_err(|e| Error::SerializationFailed(e.to_string()))?;
        Ok(match value {
            Value::String(text) => Body::Text(text),
            other => Body::Json(other),
        })
    }

    pub(crate) fn encode(&self) -> Result<(Vec<u8>, &'static str)> {
        match self {
            Body::Json(value) => {
                let bytes = serde_json::to_vec(value)
                    .map_err(|e| Error::SerializationFailed(e.to_string()))?;
                Ok((bytes, "application/json"))
            }
            Body::Text(text) => Ok((text.clone().into_bytes(), "text/plain; charset=utf-8")),
            Body::Bytes(bytes) => Ok((bytes.clone(), "")),
        }
    }
}

/// Validates a parsed response body before it is handed back to the caller.
///
/// Closures of the right shape implement it directly.
///
/// ```
/// use querykit::{RequestOptions, ResponseSchema};
/// use serde_json::Value;
///
/// let options = RequestOptions::new().schema(|value: &Value| {
///     if value.get("id").is_some() {
///         Ok(())
///     } else {
///         Err("missing id".to_string())
///     }
/// });
/// # let _ = options;
/// ```
pub trait ResponseSchema: Send + Sync {
    /// Returns a description of the mismatch when `value` is rejected.
    fn validate(&self, value: &Value) -> std::result::Result<(), String>;
}

impl<F> ResponseSchema for F
where
    F: Fn(&Value) -> std::result::Result<(), String> + Send + Sync,
{
    fn validate(&self, value: &Value) -> std::result::Result<(), String> {
        self(value)
    }
}

/// Schema requiring the body to be a JSON object with the listed fields.
#[derive(Debug, Clone)]
pub struct RequiredFields(pub Vec<String>);

impl RequiredFields {
    /// Builds the schema from field names.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fields.into_iter().map(Into::into).collect())
    }
}

impl ResponseSchema for RequiredFields {
    fn validate(&self, value: &Value) -> std::result::Result<(), String> {
        let object = value
            .as_object()
            .ok_or_else(|| "expected a JSON object".to_string())?;
        let missing: Vec<&str> = self
            .0
            .iter()
            .filter(|field| !object.contains_key(field.as_str()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing fields: {}", missing.join(", ")))
        }
    }
}

/// Options for a single request.
///
/// # Examples
///
/// ```
/// use querykit::RequestOptions;
/// use std::time::Duration;
///
/// let options = RequestOptions::new()
///     .header("x-trace-id", "abc123")?
///     .query("page", "2")
///     .query_all("tags", ["a", "b"])
///     .timeout(Duration::from_secs(5))
///     .locale("es");
/// # Ok::<(), querykit::Error>(())
/// ```
#[derive(Clone)]
pub struct RequestOptions {
    /// The HTTP method. Defaults to GET.
    pub method: Method,
    /// Headers for this call; they override client defaults with the same name.
    pub headers: HeaderMap,
    /// The request body.
    pub body: Option<Body>,
    /// Query parameters in order. Repeated keys are sent repeatedly.
    pub search_params: Vec<(String, String)>,
    /// Overrides the client timeout for this call.
    pub timeout: Option<Duration>,
    /// Validates the parsed body.
    pub schema: Option<Arc<dyn ResponseSchema>>,
    /// Overrides the client locale for error messages.
    pub locale: Option<String>,
    /// When `false` the call bypasses the retry policy (the breaker still applies).
    pub retry: bool,
    /// Cancels the call, including any pending backoff sleep.
    pub signal: Option<CancellationToken>,
}

impl RequestOptions {
    /// Creates options for a GET request with nothing else set.
    pub fn new() -> Self {
        Self {
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            search_params: Vec::new(),
            timeout: None,
            schema: None,
            locale: None,
            retry: true,
            signal: None,
        }
    }

    /// Sets the HTTP method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Adds a header, replacing any previous value with the same name.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Appends a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.search_params.push((key.into(), value.into()));
        self
    }

    /// Appends one query parameter per value, all under `key`.
    pub fn query_all<I, V>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let key = key.into();
        self.search_params
            .extend(values.into_iter().map(|v| (key.clone(), v.into())));
        self
    }

    /// Sets the body.
    pub fn body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    /// Serializes `value` into the body (see [`Body::from_value`]).
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be serialized.
    pub fn json<B: Serialize + ?Sized>(mut self, value: &B) -> Result<Self> {
        self.body = Some(Body::from_value(value)?);
        Ok(self)
    }

    /// Sets the per-request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Validates the parsed response body with `schema`.
    pub fn schema(mut self, schema: impl ResponseSchema + 'static) -> Self {
        self.schema = Some(Arc::new(schema));
        self
    }

    /// Overrides the locale used for error messages.
    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    /// Skips the retry policy for this call.
    pub fn no_retry(mut self) -> Self {
        self.retry = false;
        self
    }

    /// Attaches a cancellation token.
    pub fn signal(mut self, token: CancellationToken) -> Self {
        self.signal = Some(token);
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.signal.as_ref().is_some_and(|t| t.is_cancelled())
    }
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("search_params", &self.search_params)
            .field("timeout", &self.timeout)
            .field("schema", &self.schema.is_some())
            .field("locale", &self.locale)
            .field("retry", &self.retry)
            .field("signal", &self.signal)
            .finish()
    }
}
