//! Recommendation Service Example
//!
//! Wraps a slow, occasionally failing provider with the layered cache and
//! shows hits, streaming bypass and the circuit breaker.
//!
//! Run with: cargo run --example recommendation_service
//! Configure with `RECCACHE_*` and `REDIS_URL` environment variables.

use recommender_cache::{
    CacheSystem, ModuleRecommendation, RecommendationProvider, RecommendationRequest,
    Recommendations, async_trait,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Stands in for an LLM client: 300ms per call, fails when asked about "outage"
struct DemoProvider {
    calls: AtomicU32,
}

#[async_trait]
impl RecommendationProvider for DemoProvider {
    async fn recommend(&self, request: &RecommendationRequest) -> anyhow::Result<Recommendations> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;

        if request.requirements.contains("outage") {
            anyhow::bail!("upstream returned 503 Service Unavailable");
        }

        let module = |name: &str, category: &str| ModuleRecommendation {
            name: name.to_string(),
            description: format!("{name} module"),
            key_features: vec!["reporting".to_string()],
            category: category.to_string(),
        };
        Ok(Recommendations {
            modules: vec![module("Inventory", "operations"), module("Purchase", "operations")],
            summary: format!("Suggested for: {}", request.requirements),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    println!("=== Recommender Cache: Recommendation Service ===\n");

    let cache = CacheSystem::from_env().await?;
    cache.start()?;

    if cache.health_check().await {
        println!("Cache system is healthy\n");
    }

    let provider = Arc::new(DemoProvider { calls: AtomicU32::new(0) });
    let recommender = cache.recommender(Arc::clone(&provider));
    let request = RecommendationRequest::new("Track stock across three warehouses")
        .industry("retail")
        .company_size("50-200");

    // 1. Miss, then hit
    for attempt in 1..=2 {
        let start = Instant::now();
        let answer = recommender.recommend(&request).await?;
        println!(
            "Attempt {attempt}: {:?} in {:?}",
            answer.module_names(),
            start.elapsed()
        );
    }

    // 2. Streaming requests always reach the provider
    let streamed = request.clone().stream(true);
    recommender.recommend(&streamed).await?;
    println!(
        "\nStreaming request went upstream (provider calls: {})",
        provider.calls.load(Ordering::SeqCst)
    );

    // 3. Repeated failures open the circuit
    println!("\nSimulating an upstream outage...");
    for i in 1..=6 {
        let failing = RecommendationRequest::new(format!("outage #{i}"));
        match recommender.recommend(&failing).await {
            Ok(_) => println!("  #{i}: unexpected success"),
            Err(e) => println!("  #{i}: {}", e.user_message()),
        }
    }
    if let Some(breaker) = cache.breaker() {
        println!("Circuit state: {:?}", breaker.state());
    }

    // Cached answers keep working while the circuit is open
    let cached = recommender.recommend(&request).await?;
    println!("Cached answer still served: {:?}", cached.module_names());

    // 4. Statistics
    let stats = cache.cache().stats();
    println!("\n=== Cache Statistics ===");
    println!("Hits: {}", stats.hits);
    println!("Misses: {}", stats.misses);
    println!("Sets: {}", stats.sets);
    println!("Errors: {}", stats.errors);
    println!("Hit rate: {:.1}%", stats.hit_rate() * 100.0);
    println!("Promotions: {}", cache.cache().promotions());
    for tier in cache.cache().tier_stats() {
        println!(
            "  {} (L{}): hits={} misses={} writes={}",
            tier.backend_name,
            tier.tier_level,
            tier.hit_count(),
            tier.miss_count(),
            tier.write_count()
        );
    }

    cache.shutdown().await;
    println!("\n=== Example Complete ===");
    Ok(())
}
