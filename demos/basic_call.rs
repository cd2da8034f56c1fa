//! Basic example: GET and POST requests, error messages and the breaker.
//!
//! Run with: `cargo run --example basic_call`

use querykit::{ApiClient, Error, RequestOptions, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct Post {
    #[serde(rename = "userId")]
    user_id: u32,
    id: u32,
    title: String,
    body: String,
}

#[derive(Debug, Serialize)]
struct NewPost {
    title: String,
    body: String,
    #[serde(rename = "userId")]
    user_id: u32,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter("querykit=debug,basic_call=info")
        .init();

    let client = ApiClient::builder()
        .base_url("https://jsonplaceholder.typicode.com")?
        .timeout(Duration::from_secs(10))
        .retry_config(RetryConfig {
            max_attempts: 3,
            jitter: true,
            ..Default::default()
        })
        .build()?;

    println!("=== GET ===");
    let response = client.get::<Post>("/posts/1").await?;
    println!("Post {}: {}", response.data.id, response.data.title);
    println!("Latency: {:?}, attempts: {}", response.latency, response.attempts);
    println!();

    println!("=== POST ===");
    let new_post = NewPost {
        title: "My New Post".to_string(),
        body: "This is the content of my new post!".to_string(),
        user_id: 1,
    };
    let response = client.post::<_, Post>("/posts", &new_post).await?;
    println!("Created post {}", response.data.id);
    println!("Content-Type: {:?}", response.header("content-type"));
    println!();

    println!("=== Query parameters ===");
    let posts = client
        .get_list::<Post>("/posts", RequestOptions::new().query("userId", "1"))
        .await?;
    println!("User 1 has {} posts", posts.len());
    println!();

    println!("=== Localized errors ===");
    for locale in ["en", "es"] {
        match client
            .get_with::<Post>("/posts/does-not-exist", RequestOptions::new().locale(locale))
            .await
        {
            Ok(_) => println!("[{}] unexpectedly found", locale),
            Err(e) => println!("[{}] {}", locale, e),
        }
    }

    let snapshot = client.circuit_breaker().snapshot();
    println!();
    println!("Breaker: {:?}", snapshot);

    Ok(())
}
