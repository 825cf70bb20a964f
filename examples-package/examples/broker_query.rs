//! Broker Query Example
//!
//! Runs timeseries, groupBy and scan queries across three in-process data
//! servers and prints the response context of each.

use anyhow::Result;
use query_broker::{BrokerConfig, BrokerServerView, ClusterClient, ResponseContext};
use query_broker_examples::{add_data_server, init_logging, HOUR};
use query_cache::MemoryCache;
use query_core::{
    Aggregator, ArithmeticOp, DimFilter, Granularity, Interval, PostAggregator, Query, ScanOrder,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    println!("=== Broker Query Example ===\n");

    let config = BrokerConfig::default();
    let view = Arc::new(BrokerServerView::from_config(&config));
    add_data_server(&view, "historical-1", 0, &[0, 1])?;
    add_data_server(&view, "historical-2", 0, &[2, 3])?;
    add_data_server(&view, "historical-3", 0, &[1, 4])?;

    let client = ClusterClient::new(
        view,
        Arc::new(MemoryCache::with_defaults()),
        config,
    )?;

    // Example 1: Hourly timeseries
    println!("--- Example 1: Hourly Timeseries ---\n");
    let query = Query::timeseries(
        "wiki",
        vec![Interval::new(0, 5 * HOUR)],
        vec![Aggregator::count("edits"), Aggregator::long_sum("added", "added")],
    )
    .with_granularity(Granularity::Hour)
    .with_post_aggregator(PostAggregator::new(
        "avg_added",
        ArithmeticOp::Divide,
        vec!["added".to_string(), "edits".to_string()],
    ));
    run_and_print(&client, query).await?;

    // Example 2: GroupBy with a filter
    println!("\n--- Example 2: GroupBy Page ---\n");
    let query = Query::group_by(
        "wiki",
        vec![Interval::new(0, 5 * HOUR)],
        vec!["page".to_string()],
        vec![Aggregator::count("edits"), Aggregator::long_max("max_added", "added")],
    )
    .with_filter(DimFilter::Not(Box::new(DimFilter::selector("page", "help"))));
    run_and_print(&client, query).await?;

    // Example 3: Newest edits first
    println!("\n--- Example 3: Scan ---\n");
    let query = Query::scan(
        "wiki",
        vec![Interval::new(3 * HOUR, 5 * HOUR)],
        vec!["page".to_string(), "user".to_string()],
    )
    .with_order(ScanOrder::Descending)
    .with_limit(5);
    run_and_print(&client, query).await?;

    println!("\n=== All broker examples completed! ===");
    Ok(())
}

async fn run_and_print(client: &ClusterClient, query: Query) -> Result<()> {
    let context = ResponseContext::new();
    let rows = client.run(query, context.clone())?.collect_rows().await?;

    for row in &rows {
        let columns: Vec<String> = row
            .columns
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        println!("  {:>10}  {}", row.timestamp, columns.join(", "));
    }
    println!(
        "\n  {} rows, {} sub-queries, {} cache hits, {} misses",
        rows.len(),
        context.rpc_count(),
        context.cache_hits(),
        context.cache_misses()
    );
    println!("  context header: {}", context.to_header(client.config().max_response_context_chars));
    Ok(())
}
