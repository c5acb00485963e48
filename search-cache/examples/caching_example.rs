use chrono::Duration;
use search_cache::{canonical, CacheConfig, CacheFacade, KeyCodec};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Serialize)]
struct SearchOptions {
    #[serde(serialize_with = "canonical::normalized_text")]
    query: String,
    category: &'static str,
    #[serde(serialize_with = "canonical::sorted")]
    providers: HashSet<&'static str>,
}

/// Stand-in for a slow, rate-limited provider search
async fn search_providers(query: String) -> Result<Vec<String>, String> {
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    Ok(vec![
        format!("{} [1080p] (PirateBay)", query),
        format!("{} [720p] (BitSearch)", query),
    ])
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    let cache_config = CacheConfig::new(
        Duration::minutes(30), // 30-minute TTL
        1000,                  // Cache up to 1000 searches
        Duration::minutes(5),  // Cleanup every 5 minutes
    );
    let cache: Arc<CacheFacade<Vec<String>, String>> = Arc::new(CacheFacade::new(cache_config));

    let search_options = SearchOptions {
        query: "Rust Programming".to_string(),
        category: "video",
        providers: ["piratebay", "bitsearch"].into_iter().collect(),
    };
    let key = KeyCodec::encode_scoped("search", &search_options)?;
    println!("Cache key: {}", key);

    // First search (will be cached)
    let start = std::time::Instant::now();
    let query = search_options.query.clone();
    let (results, source) = cache
        .get_or_compute_with_source(key, move || search_providers(query))
        .await?;
    println!("First search took {:?} ({}), {} results", start.elapsed(), source, results.len());

    // Second search (should be from cache)
    let start = std::time::Instant::now();
    let query = search_options.query.clone();
    let (_, source) = cache
        .get_or_compute_with_source(key, move || search_providers(query))
        .await?;
    println!("Cached search took {:?} ({})", start.elapsed(), source);

    // Concurrent identical searches share one provider call
    let other = KeyCodec::encode_scoped("search", "debian netinst")?;
    let mut handles = vec![];
    for _ in 0..5 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get_or_compute_with_source(other, || {
                    search_providers("debian netinst".to_string())
                })
                .await
        }));
    }
    for handle in handles {
        let (_, source) = handle.await??;
        println!("Concurrent search served as {}", source);
    }

    println!("Cache stats: {:?}", cache.stats());
    println!("Hit ratio: {:.2}", cache.stats().hit_ratio());

    cache.shutdown();
    Ok(())
}
