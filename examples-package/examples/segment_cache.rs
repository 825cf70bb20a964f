//! Segment Cache Example
//!
//! Shows per-segment caching: a repeated query is served from the cache,
//! a wider query only fetches the new segments, and dropping a segment from
//! the cluster invalidates its entries.

use anyhow::Result;
use query_broker::{BrokerConfig, BrokerServerView, ClusterClient, ResponseContext};
use query_broker_examples::{add_data_server, hour_segment, init_logging, HOUR};
use query_cache::{MemoryCache, NamespaceInvalidator};
use query_core::{Aggregator, Granularity, Interval, Query};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    println!("=== Segment Cache Example ===\n");

    let cache = Arc::new(MemoryCache::with_defaults());
    let invalidator = Arc::new(NamespaceInvalidator::new(cache.clone()));
    let config = BrokerConfig::default();
    let view = Arc::new(BrokerServerView::with_invalidator(
        config.selection.clone(),
        invalidator,
    ));
    add_data_server(&view, "historical-1", 0, &[0, 1, 2])?;
    add_data_server(&view, "historical-2", 0, &[3, 4, 5])?;

    let client = ClusterClient::new(view.clone(), cache.clone(), config)?;
    let query = |hours: i64| {
        Query::timeseries(
            "wiki",
            vec![Interval::new(0, hours * HOUR)],
            vec![Aggregator::count("edits"), Aggregator::long_sum("added", "added")],
        )
        .with_granularity(Granularity::Hour)
    };

    // Example 1: Cold, then warm
    println!("--- Example 1: Cold and Warm Runs ---\n");
    run(&client, "cold run, 3 hours", query(3)).await?;
    run(&client, "warm run, 3 hours", query(3)).await?;

    // Example 2: Only new segments are fetched
    println!("\n--- Example 2: Wider Range ---\n");
    run(&client, "6 hours", query(6)).await?;

    // Example 3: Dropping a segment invalidates it
    println!("\n--- Example 3: Invalidation ---\n");
    println!("  cache entries before drop: {}", cache.len());
    view.remove_segment("historical-1", &hour_segment(0, "v1"))?;
    println!("  cache entries after drop:  {}", cache.len());
    run(&client, "6 hours after drop", query(6)).await?;

    let stats = client.cache_stats();
    println!("\nCache Statistics:");
    println!("  Hits: {}", stats.hits());
    println!("  Misses: {}", stats.misses());
    println!("  Hit rate: {:.1}%", stats.hit_rate() * 100.0);
    println!("  Entries written: {}", client.populator_stats().ok());
    println!("  Memory used: {} bytes", cache.memory_used());

    println!("\n=== All caching examples completed! ===");
    Ok(())
}

async fn run(client: &ClusterClient, label: &str, query: Query) -> Result<()> {
    let context = ResponseContext::new();
    let rows = client.run(query, context.clone())?.collect_rows().await?;
    println!(
        "  {:<22} {} rows, {} hits, {} misses, {} sub-queries",
        label,
        rows.len(),
        context.cache_hits(),
        context.cache_misses(),
        context.rpc_count()
    );
    Ok(())
}
