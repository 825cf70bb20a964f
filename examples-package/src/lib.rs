//! Shared setup for the broker demos

use query_broker::{BrokerServerView, LocalDataServer, QueryableServer, ServerMetadata};
use query_core::{Interval, ResultRow, SegmentId};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const HOUR: i64 = 3_600_000;

/// Install a `tracing` subscriber honouring `RUST_LOG`
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "query_broker=info,query_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// One hour-long segment of the `wiki` datasource
pub fn hour_segment(hour: i64, version: &str) -> SegmentId {
    SegmentId::new("wiki", Interval::new(hour * HOUR, (hour + 1) * HOUR), version, 0)
}

/// Synthetic page edits for one hour
pub fn wiki_edits(hour: i64) -> Vec<ResultRow> {
    let pages = ["home", "about", "news", "help"];
    (0..24)
        .map(|i| {
            let page = pages[(i as usize + hour as usize) % pages.len()];
            ResultRow::new(hour * HOUR + i * 150_000)
                .with("page", page)
                .with("user", format!("user-{}", i % 5))
                .with("added", (i * 7 + hour) % 50)
        })
        .collect()
}

/// Register an in-process data server holding the given hours
pub fn add_data_server(
    view: &BrokerServerView,
    name: &str,
    priority: i32,
    hours: &[i64],
) -> anyhow::Result<Arc<QueryableServer>> {
    let local = LocalDataServer::new();
    for hour in hours {
        local.add_segment(hour_segment(*hour, "v1"), wiki_edits(*hour));
    }

    let server = Arc::new(QueryableServer::new(
        ServerMetadata::new(name, format!("{}:8083", name), "_default_tier", priority),
        Arc::new(local),
    ));
    view.add_server(Arc::clone(&server))?;
    for hour in hours {
        view.add_segment(name, hour_segment(*hour, "v1"))?;
    }
    Ok(server)
}
