//! Basic prompt caching example
//!
//! Simulates a slow model call and shows that repeated identical prompts are served from the
//! cache, and that concurrent identical prompts share a single call.
//!
//! Usage:
//!   RUST_LOG=flowprompt=debug cargo run --example caching_basic

use flowprompt::cache::{derive_fingerprint, CacheOptions};
use flowprompt::{configure_cache, get_cache};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct User {
    name: String,
    age: u32,
}

async fn fake_model_call(text: &str) -> flowprompt::Result<User> {
    tokio::time::sleep(Duration::from_millis(500)).await;
    let age = text
        .split_whitespace()
        .find_map(|w| w.parse().ok())
        .unwrap_or_default();
    let name = text.split_whitespace().next().unwrap_or("unknown").to_string();
    Ok(User { name, age })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // Environment variables first, explicit options on top.
    configure_cache(CacheOptions::from_env()?)?;
    configure_cache(CacheOptions::new().enabled(true).default_ttl(Duration::from_secs(3600)))?;
    let cache = get_cache();

    let text = "John is 25";
    let fp = derive_fingerprint(
        "extract_user",
        &json!({ "text": text }),
        "gpt-4o",
        &json!({ "temperature": 0.0 }),
    )?;

    for attempt in 1..=2 {
        let started = Instant::now();
        let user: User = cache.get_or_compute(&fp, None, || fake_model_call(text)).await?;
        println!("call {attempt}: {user:?} in {:?}", started.elapsed());
    }

    let other = derive_fingerprint(
        "extract_user",
        &json!({ "text": "Mary is 31" }),
        "gpt-4o",
        &json!({ "temperature": 0.0 }),
    )?;
    let started = Instant::now();
    let calls = (0..4).map(|_| {
        let cache = cache.clone();
        let fp = other.clone();
        tokio::spawn(async move {
            cache
                .get_or_compute::<User, _, _>(&fp, None, || fake_model_call("Mary is 31"))
                .await
        })
    });
    for handle in futures::future::join_all(calls).await {
        println!("concurrent: {:?}", handle??);
    }
    println!("4 concurrent calls took {:?}", started.elapsed());

    println!("\nStats: {:?}", cache.stats());
    Ok(())
}
