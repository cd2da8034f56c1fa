//! Query client tests against a wiremock server.

use querykit::{
    ApiClient, CacheConfig, Error, MutationHooks, MutationOptions, QueryClient, QueryEvent,
    QueryHooks, QueryKey, QueryOptions, QueryStatus, RetryConfig,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn queries(server: &MockServer) -> QueryClient {
    init_tracing();
    let api = ApiClient::builder()
        .base_url(server.uri())
        .unwrap()
        .retry_config(RetryConfig::none())
        .build()
        .unwrap();
    QueryClient::new(api)
}

async fn mount_users(server: &MockServer, expected_calls: u64) {
    Mock::given(method("GET"))
        .and(path("/users"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!(["ada", "grace"]))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(expected_calls)
        .mount(server)
        .await;
}

#[derive(Clone, Default)]
struct Recorder {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn push(&self, what: &str) {
        self.log.lock().unwrap().push(format!("{}:{}", self.name, what));
    }
}

impl QueryHooks for Recorder {
    fn on_start(&self, _key: &QueryKey) {
        self.push("start");
    }

    fn on_success(&self, _key: &QueryKey, _data: &Value) {
        self.push("success");
    }

    fn on_error(&self, _key: &QueryKey, _error: &Error) {
        self.push("error");
    }

    fn on_settled(&self, _key: &QueryKey, _result: Result<&Value, &Error>) {
        self.push("settled");
    }
}

impl MutationHooks for Recorder {
    fn on_mutate(&self, path: &str, _body: Option<&querykit::Body>) {
        self.push(&format!("mutate {}", path));
    }

    fn on_success(&self, _data: &Value) {
        self.push("success");
    }

    fn on_error(&self, _error: &Error) {
        self.push("error");
    }

    fn on_settled(&self, _result: Result<&Value, &Error>) {
        self.push("settled");
    }
}

#[tokio::test]
async fn test_concurrent_identical_queries_share_one_request() {
    let server = MockServer::start().await;
    mount_users(&server, 1).await;
    let queries = queries(&server);

    let (a, b, c) = tokio::join!(
        queries.query_value(QueryOptions::new(["users"], "/users")),
        queries.query_value(QueryOptions::new(["users"], "/users")),
        queries.query_value(QueryOptions::new(["users"], "/users")),
    );

    assert_eq!(a.unwrap(), json!(["ada", "grace"]));
    assert_eq!(b.unwrap(), json!(["ada", "grace"]));
    assert_eq!(c.unwrap(), json!(["ada", "grace"]));
}

#[tokio::test]
async fn test_dedupe_can_be_disabled() {
    let server = MockServer::start().await;
    mount_users(&server, 2).await;
    let queries = queries(&server);

    let options = QueryOptions::new(["users"], "/users").dedupe(false);
    let (a, b) = tokio::join!(
        queries.query_value(options.clone()),
        queries.query_value(options),
    );
    assert!(a.is_ok() && b.is_ok());
}

#[tokio::test]
async fn test_fresh_cache_avoids_network() {
    let server = MockServer::start().await;
    mount_users(&server, 1).await;
    let queries = queries(&server);

    let options = QueryOptions::new(["users"], "/users").stale_time(Duration::from_secs(60));
    let first: Vec<String> = queries.query(options.clone()).await.unwrap();
    let second: Vec<String> = queries.query(options).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(queries.cache_stats().hits, 1);
}

#[tokio::test]
async fn test_stale_data_is_refetched() {
    let server = MockServer::start().await;
    mount_users(&server, 2).await;
    let queries = queries(&server);

    // Default stale time is zero.
    let options = QueryOptions::new(["users"], "/users");
    queries.query_value(options.clone()).await.unwrap();
    queries.query_value(options).await.unwrap();
}

#[tokio::test]
async fn test_infinite_stale_time_never_refetches() {
    let server = MockServer::start().await;
    mount_users(&server, 1).await;
    let queries = queries(&server);

    let options = QueryOptions::new(["users"], "/users").stale_time(Duration::MAX);
    for _ in 0..3 {
        queries.query_value(options.clone()).await.unwrap();
    }
}

#[tokio::test]
async fn test_invalidate_resets_state_and_forces_refetch() {
    let server = MockServer::start().await;
    mount_users(&server, 2).await;
    let queries = queries(&server);

    let options = QueryOptions::new(["users", "list"], "/users").stale_time(Duration::MAX);
    queries.query_value(options.clone()).await.unwrap();
    assert_eq!(
        queries.get_query_state(["users", "list"]).status,
        QueryStatus::Success
    );

    assert_eq!(queries.invalidate_queries(&QueryKey::from(["posts"])), 0);
    assert_eq!(queries.invalidate_queries(&QueryKey::from(["users"])), 1);

    let state = queries.get_query_state(["users", "list"]);
    assert_eq!(state.status, QueryStatus::Idle);
    assert!(state.data.is_none());
    assert_eq!(
        queries.get_query_data::<Value>(["users", "list"]).unwrap(),
        None
    );

    queries.query_value(options).await.unwrap();
}

#[tokio::test]
async fn test_set_and_get_query_data() {
    let server = MockServer::start().await;
    let queries = queries(&server);

    queries
        .set_query_data(["settings"], &json!({ "theme": "dark" }))
        .unwrap();

    let data: Option<Value> = queries.get_query_data(["settings"]).unwrap();
    assert_eq!(data, Some(json!({ "theme": "dark" })));
    assert_eq!(
        queries.get_query_state(["settings"]).status,
        QueryStatus::Success
    );
    assert_eq!(queries.get_query_data::<Value>(["other"]).unwrap(), None);

    let wrong_type = queries.get_query_data::<Vec<u32>>(["settings"]);
    assert!(matches!(wrong_type, Err(Error::DeserializationFailed { .. })));

    queries.clear_cache();
    assert_eq!(queries.get_query_data::<Value>(["settings"]).unwrap(), None);
    assert_eq!(queries.get_query_state(["settings"]).status, QueryStatus::Idle);
}

#[tokio::test]
async fn test_events_are_emitted_in_order() {
    let server = MockServer::start().await;
    mount_users(&server, 1).await;
    let queries = queries(&server);
    let mut events = queries.subscribe();

    queries
        .query_value(QueryOptions::new(["users"], "/users"))
        .await
        .unwrap();

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let QueryEvent::StateChange { state, .. } = &event {
            names.push(format!("state:change({})", state.status));
        } else {
            names.push(event.name().to_string());
        }
    }

    assert_eq!(
        names,
        [
            "state:change(loading)",
            "query:start",
            "cache:update",
            "state:change(success)",
            "query:success",
            "query:settled",
        ]
    );
}

#[tokio::test]
async fn test_error_is_recorded_and_returned() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    Mock::given(method("GET"))
        .and(path("/report"))
        .respond_with(move |_req: &wiremock::Request| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(200).set_body_json(json!({ "rows": 1 }))
            } else {
                ResponseTemplate::new(500)
            }
        })
        .mount(&server)
        .await;

    let recorder = Recorder {
        name: "call",
        ..Default::default()
    };
    let queries = queries(&server);
    let options = QueryOptions::new(["report"], "/report").hooks(recorder.clone());

    queries.query_value(options.clone()).await.unwrap();
    let err = queries.query_value(options).await.unwrap_err();
    assert_eq!(err.status().map(|s| s.as_u16()), Some(500));

    let state = queries.get_query_state(["report"]);
    assert_eq!(state.status, QueryStatus::Error);
    assert!(!state.is_fetching);
    assert_eq!(state.data, Some(json!({ "rows": 1 })));
    assert!(state.error.is_some());

    assert_eq!(
        *recorder.log.lock().unwrap(),
        [
            "call:start",
            "call:success",
            "call:settled",
            "call:start",
            "call:error",
            "call:settled",
        ]
    );
}

#[tokio::test]
async fn test_global_hooks_run_before_per_call_hooks() {
    let server = MockServer::start().await;
    mount_users(&server, 1).await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let global = Recorder {
        name: "global",
        log: log.clone(),
    };
    let local = Recorder {
        name: "local",
        log: log.clone(),
    };

    let api = ApiClient::builder()
        .base_url(server.uri())
        .unwrap()
        .build()
        .unwrap();
    let queries = QueryClient::builder(api).hooks(global).build();

    queries
        .query_value(QueryOptions::new(["users"], "/users").hooks(local))
        .await
        .unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        [
            "global:start",
            "local:start",
            "global:success",
            "local:success",
            "global:settled",
            "local:settled",
        ]
    );
}

#[tokio::test]
async fn test_mutation_invalidates_queries() {
    let server = MockServer::start().await;
    mount_users(&server, 1).await;
    Mock::given(method("POST"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 3 })))
        .expect(1)
        .mount(&server)
        .await;

    let queries = queries(&server);
    queries
        .query_value(QueryOptions::new(["users"], "/users").stale_time(Duration::MAX))
        .await
        .unwrap();

    let recorder = Recorder {
        name: "m",
        ..Default::default()
    };
    let created: Value = queries
        .mutate(
            MutationOptions::new("/users")
                .json(&json!({ "name": "linus" }))
                .unwrap()
                .invalidates(["users"])
                .hooks(recorder.clone()),
        )
        .await
        .unwrap();

    assert_eq!(created, json!({ "id": 3 }));
    assert_eq!(queries.get_query_state(["users"]).status, QueryStatus::Idle);
    assert_eq!(
        *recorder.log.lock().unwrap(),
        ["m:mutate /users", "m:success", "m:settled"]
    );
}

#[tokio::test]
async fn test_prefetch_warms_cache() {
    let server = MockServer::start().await;
    mount_users(&server, 1).await;
    let queries = queries(&server);

    queries
        .prefetch_query(QueryOptions::new(["users"], "/users"))
        .await
        .unwrap();

    let cached: Option<Vec<String>> = queries.get_query_data(["users"]).unwrap();
    assert_eq!(cached, Some(vec!["ada".to_string(), "grace".to_string()]));
}

#[tokio::test]
async fn test_dropped_query_settles_its_state() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!(["ada", "grace"]))
                .set_delay(Duration::from_millis(100)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "done": true }))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let recorder = Recorder {
        name: "call",
        ..Default::default()
    };
    let queries = queries(&server);
    let mut events = queries.subscribe();

    let timed_out = tokio::time::timeout(
        Duration::from_millis(50),
        queries.query_value(QueryOptions::new(["slow"], "/slow").hooks(recorder.clone())),
    )
    .await;
    assert!(timed_out.is_err());

    let state = queries.get_query_state(["slow"]);
    assert_eq!(state.status, QueryStatus::Idle);
    assert!(!state.is_fetching);
    assert!(state.data.is_none() && state.error.is_none());
    assert_eq!(*recorder.log.lock().unwrap(), ["call:start", "call:settled"]);

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let QueryEvent::StateChange { state, .. } = &event {
            names.push(format!("state:change({})", state.status));
        } else {
            names.push(event.name().to_string());
        }
    }
    assert_eq!(
        names,
        [
            "state:change(loading)",
            "query:start",
            "state:change(idle)",
            "query:settled",
        ]
    );

    // A successful key falls back to success, keeping its data.
    queries
        .query_value(QueryOptions::new(["users"], "/users"))
        .await
        .unwrap();
    let timed_out = tokio::time::timeout(
        Duration::from_millis(20),
        queries.query_value(QueryOptions::new(["users"], "/users")),
    )
    .await;
    assert!(timed_out.is_err());

    let state = queries.get_query_state(["users"]);
    assert_eq!(state.status, QueryStatus::Success);
    assert!(!state.is_fetching);
    assert_eq!(state.data, Some(json!(["ada", "grace"])));
}

#[tokio::test]
async fn test_query_cache_is_unbounded_by_default() {
    let server = MockServer::start().await;
    let queries = queries(&server);

    for i in 0..150 {
        queries.set_query_data([format!("k{}", i).as_str()], &i).unwrap();
    }

    assert_eq!(queries.get_query_data::<u32>(["k0"]).unwrap(), Some(0));
    assert_eq!(queries.get_query_state(["k0"]).status, QueryStatus::Success);
    assert_eq!(queries.cache_stats().evictions, 0);
}

#[tokio::test]
async fn test_evicted_query_is_reset_to_idle() {
    let server = MockServer::start().await;
    let api = ApiClient::builder()
        .base_url(server.uri())
        .unwrap()
        .build()
        .unwrap();
    let queries = QueryClient::builder(api)
        .cache_config(CacheConfig {
            max_size: 2,
            ..Default::default()
        })
        .build();
    let mut events = queries.subscribe();

    for key in ["a", "b", "c"] {
        queries.set_query_data([key], &key).unwrap();
    }

    assert_eq!(queries.get_query_data::<String>(["a"]).unwrap(), None);
    let state = queries.get_query_state(["a"]);
    assert_eq!(state.status, QueryStatus::Idle);
    assert!(state.data.is_none());
    assert_eq!(
        queries.get_query_data::<String>(["c"]).unwrap().as_deref(),
        Some("c")
    );

    let mut invalidated = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let QueryEvent::CacheInvalidate { key } = event {
            invalidated.push(key);
        }
    }
    assert_eq!(invalidated, [QueryKey::from(["a"])]);
}
