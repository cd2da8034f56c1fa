//! # querykit - a resilient HTTP and query client
//!
//! querykit is an async HTTP client for JSON APIs built on top of `reqwest`.
//! Every call runs through a retry policy and a circuit breaker, failures
//! come back as typed errors with locale-resolved messages, and a query layer
//! adds caching, staleness and request deduplication on top.
//!
//! ## Quick Start
//!
//! ```no_run
//! use querykit::{ApiClient, RetryConfig};
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//!
//! #[derive(Serialize)]
//! struct CreateUser {
//!     name: String,
//!     email: String,
//! }
//!
//! #[derive(Deserialize)]
//! struct User {
//!     id: u64,
//!     name: String,
//!     email: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), querykit::Error> {
//!     let client = ApiClient::builder()
//!         .base_url("https://api.example.com")?
//!         .timeout(Duration::from_secs(30))
//!         .retry_config(RetryConfig {
//!             max_attempts: 4,
//!             jitter: true,
//!             ..Default::default()
//!         })
//!         .build()?;
//!
//!     let user = client.get::<User>("/users/123").await?;
//!     println!("User: {}", user.data.name);
//!     println!("Request took {:?}", user.latency);
//!
//!     let new_user = CreateUser {
//!         name: "Alice".to_string(),
//!         email: "alice@example.com".to_string(),
//!     };
//!     let created = client.post::<_, User>("/users", &new_user).await?;
//!     println!("Created user with ID: {}", created.data.id);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Typed requests and responses** - JSON in and out through `serde`
//! - **Retries** - Bounded exponential backoff with optional jitter, `Retry-After` aware, cancellable
//! - **Circuit breaking** - Fail fast after repeated failures, single half-open trial call
//! - **Locale-aware errors** - English and Spanish status messages, custom dictionaries
//! - **Interceptors and pluggable transport** - Rewrite requests and responses, or swap `reqwest` out
//! - **TTL cache** - Insertion-order eviction, hit/miss stats, single-flight computation, storage mirror
//! - **Queries** - Stale-time aware caching, request deduplication, state tracking, hooks and events
//!
//! ## Error Handling
//!
//! ```no_run
//! use querykit::{ApiClient, Error};
//!
//! # async fn example() -> Result<(), Error> {
//! # let client = ApiClient::builder().base_url("https://api.example.com")?.build()?;
//! match client.get::<serde_json::Value>("/endpoint").await {
//!     Ok(response) => {
//!         println!("Success: {:?}", response.data);
//!     }
//!     Err(Error::Api(api)) if api.timed_out => {
//!         eprintln!("Timed out: {}", api.message);
//!     }
//!     Err(Error::Api(api)) => {
//!         eprintln!("HTTP {} {}: {}", api.status.as_u16(), api.status_text, api.message);
//!     }
//!     Err(Error::CircuitOpen { retry_in }) => {
//!         eprintln!("Service unavailable, try again in {:?}", retry_in);
//!     }
//!     Err(e) => {
//!         eprintln!("Other error: {}", e);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Queries
//!
//! ```no_run
//! use querykit::{ApiClient, QueryClient, QueryOptions};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), querykit::Error> {
//! let api = ApiClient::builder().base_url("https://api.example.com")?.build()?;
//! let queries = QueryClient::new(api);
//!
//! let todos: Vec<String> = queries
//!     .query(QueryOptions::new(["todos"], "/todos").stale_time(Duration::from_secs(60)))
//!     .await?;
//!
//! // Served from the cache: the data is still fresh.
//! let again: Vec<String> = queries.query(QueryOptions::new(["todos"], "/todos")
//!     .stale_time(Duration::from_secs(60))).await?;
//! assert_eq!(todos, again);
//! # Ok(())
//! # }
//! ```

mod cache;
mod circuit_breaker;
mod client;
mod error;
pub mod interceptor;
mod messages;
mod query;
mod request;
mod response;
pub mod retry;
pub mod storage;
pub mod transport;

pub use cache::{CacheConfig, CacheManager, CacheStats};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState,
};
pub use client::{ApiClient, ApiClientBuilder};
pub use error::{ApiError, Error, Result};
pub use messages::Messages;
pub use query::{
    is_stale, CachedQuery, MutationHooks, MutationOptions, QueryClient, QueryClientBuilder,
    QueryEvent, QueryHooks, QueryKey, QueryOptions, QueryStatus, RequestState,
};
pub use request::{Body, RequestOptions, RequiredFields, ResponseSchema};
pub use response::Response;
pub use retry::{RetryConfig, RetryPolicy, RetryPredicate};
