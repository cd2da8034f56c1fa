//! Query client example: caching, deduplication, events and mutations.
//!
//! Run with: `cargo run --example queries`

use querykit::{ApiClient, Error, MutationOptions, QueryClient, QueryOptions};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct Todo {
    id: u32,
    title: String,
    completed: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter("querykit=debug,queries=info")
        .init();

    let api = ApiClient::builder()
        .base_url("https://jsonplaceholder.typicode.com")?
        .build()?;
    let queries = QueryClient::builder(api)
        .stale_time(Duration::from_secs(30))
        .build();

    let mut events = queries.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("  event {} {}", event.name(), event.key());
        }
    });

    println!("=== Three identical queries, one request ===");
    let todos = || QueryOptions::new(["todos", "user", "1"], "/todos?userId=1");
    let (a, b, c) = tokio::join!(
        queries.query::<Vec<Todo>>(todos()),
        queries.query::<Vec<Todo>>(todos()),
        queries.query::<Vec<Todo>>(todos()),
    );
    println!("Got {}, {} and {} todos", a?.len(), b?.len(), c?.len());

    println!("=== Served from cache ===");
    let cached = queries.query::<Vec<Todo>>(todos()).await?;
    println!("{} todos, cache stats: {:?}", cached.len(), queries.cache_stats());

    println!("=== Mutation with invalidation ===");
    let created: serde_json::Value = queries
        .mutate(
            MutationOptions::new("/todos")
                .json(&json!({ "title": "write docs", "userId": 1, "completed": false }))?
                .invalidates(["todos"]),
        )
        .await?;
    println!("Created {}", created);
    println!("State after invalidation: {:?}", queries.get_query_state(["todos", "user", "1"]).status);

    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
