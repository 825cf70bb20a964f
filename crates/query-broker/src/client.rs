//! Cluster client: the broker's query entry point
//!
//! [`ClusterClient::run_query`] resolves a query onto segments, serves what
//! it can from the per-segment cache, fans the rest out to data servers, and
//! merges everything into one lazy, ordered [`QueryResultStream`].

use crate::config::BrokerConfig;
use crate::context::ResponseContext;
use crate::error::{BrokerError, Result};
use crate::merge::{RowMerger, TaggedRow, TaggedRowStream};
use crate::parallel::{parallel_merge, MergePool, MergeSettings};
use crate::scatter::{dispatch, group_by_server, FetchContext};
use crate::server::QueryableServer;
use crate::stream::{AbortOnDrop, QueryResultStream};
use crate::view::ServerView;
use futures::stream::{self, StreamExt};
use query_cache::{
    decode_rows, populator_for, Cache, CacheCoordinator, CachePartition, CachePopulator, CacheStats,
    PopulatorStats, QueryScopedPopulator,
};
use query_core::{
    CacheKeyBuilder, Interval, Query, QuerySegment, ResultRow, SegmentDescriptor, ToolChestRegistry,
};
use query_timeline::resolve;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

/// ETag over a query's cache signature and the segments it reads
///
/// Stable across brokers and builds, so clients can reuse it anywhere.
fn compute_etag(signature: &[u8], segments: &[QuerySegment]) -> String {
    let key = segments.iter().fold(
        CacheKeyBuilder::new(0).append_bytes(signature),
        |key, segment| {
            let descriptor = &segment.descriptor;
            key.append_i64(descriptor.interval.start)
                .append_i64(descriptor.interval.end)
                .append_string(&descriptor.version)
                .append_i64(i64::from(descriptor.partition))
        },
    );
    format!("{:016x}", xxh3_64(&key.build()))
}

/// Runs queries against the cluster described by a [`ServerView`]
pub struct ClusterClient {
    view: Arc<dyn ServerView>,
    toolchests: ToolChestRegistry,
    coordinator: CacheCoordinator,
    populator: Arc<dyn CachePopulator>,
    merge_pool: MergePool,
    config: BrokerConfig,
}

impl ClusterClient {
    pub fn new(view: Arc<dyn ServerView>, cache: Arc<dyn Cache>, config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            view,
            toolchests: ToolChestRegistry::default(),
            coordinator: CacheCoordinator::new(Arc::clone(&cache)),
            populator: populator_for(&config.cache, cache),
            merge_pool: MergePool::new(config.merge.pool_size),
            config,
        })
    }

    /// Replace the toolchests used to look up query types
    pub fn with_toolchests(mut self, toolchests: ToolChestRegistry) -> Self {
        self.toolchests = toolchests;
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn merge_pool(&self) -> &MergePool {
        &self.merge_pool
    }

    /// Cache lookup statistics
    pub fn cache_stats(&self) -> Arc<CacheStats> {
        self.coordinator.stats()
    }

    /// Cache write statistics
    pub fn populator_stats(&self) -> Arc<PopulatorStats> {
        self.populator.stats()
    }

    /// Run a query over its own intervals
    pub fn run(&self, query: Query, context: ResponseContext) -> Result<QueryResultStream> {
        let intervals = query.intervals.clone();
        self.run_query(query, &intervals, context)
    }

    /// Run a query over `intervals`
    ///
    /// Must be called within a Tokio runtime; fetch and merge tasks are
    /// spawned on it. Nothing is read until the returned stream is polled,
    /// and dropping the stream cancels the query.
    pub fn run_query(
        &self,
        mut query: Query,
        intervals: &[Interval],
        response: ResponseContext,
    ) -> Result<QueryResultStream> {
        let runtime = Handle::try_current()
            .map_err(|e| BrokerError::Config(format!("queries need a Tokio runtime: {}", e)))?;

        query.intervals = intervals.to_vec();
        query.validate()?;
        let toolchest = self.toolchests.for_query(&query)?;
        let settings = self.config.settings_for(&query.context);
        let deadline = Instant::now() + settings.timeout;
        let query = Arc::new(query);

        info!(
            "Starting {} query {} on {}",
            query.query_type(),
            query.id,
            query.datasource
        );

        let resolved = resolve(self.view.as_ref(), &query.datasource, &query.intervals);
        if settings.uncovered_intervals_limit > 0 && !resolved.uncovered.is_empty() {
            response.add_uncovered_intervals(&resolved.uncovered, settings.uncovered_intervals_limit);
        }

        let signature: Arc<[u8]> = toolchest.cache_signature(&query).into();

        if let Some(expected) = &query.context.if_none_match {
            let etag = compute_etag(&signature, &resolved.segments);
            response.set_etag(etag.clone());
            if *expected == etag {
                info!("Query {} matches etag {}, returning no rows", query.id, etag);
                return Ok(QueryResultStream::empty(response));
            }
        }

        // Server selection
        let total_segments = resolved.segments.len();
        let mut placement: HashMap<SegmentDescriptor, (usize, Arc<QueryableServer>)> = HashMap::new();
        let mut available: Vec<QuerySegment> = Vec::with_capacity(total_segments);
        let mut unavailable = 0usize;
        for (ordinal, segment) in resolved.segments.into_iter().enumerate() {
            match self.view.select_server(&segment.id) {
                Some(server) => {
                    placement.insert(segment.descriptor.clone(), (ordinal, server));
                    available.push(segment);
                }
                None => {
                    if !settings.allow_partial_results {
                        response.add_unavailable_segment(segment.descriptor.clone());
                        return Err(BrokerError::SegmentUnavailable(segment.descriptor.to_string()));
                    }
                    warn!("No server available for segment {}, skipping", segment.descriptor);
                    response.add_unavailable_segment(segment.descriptor);
                    unavailable += 1;
                }
            }
        }

        // Cache partition
        let cache_eligible = toolchest.is_cacheable(&query)
            && self.config.cache.is_cacheable_type(query.query_type());
        let partition: CachePartition<Vec<ResultRow>> = if cache_eligible && settings.use_cache {
            let partition = self
                .coordinator
                .partition(available, &signature, decode_rows::<ResultRow>);
            response.add_cache_hits(partition.hits.len() as u64);
            response.add_cache_misses(partition.misses.len() as u64);
            partition
        } else {
            CachePartition::all_misses(available)
        };

        let merger = Arc::new(RowMerger::new(Arc::clone(&query), Arc::clone(&toolchest)));
        let mut inputs: Vec<(usize, TaggedRowStream)> = Vec::new();

        let num_hits = partition.hits.len();
        for (segment, rows) in partition.hits {
            let Some((ordinal, _)) = placement.get(&segment.descriptor) else {
                continue;
            };
            let ordinal = *ordinal;
            let tagged: Vec<Result<TaggedRow>> = rows
                .into_iter()
                .map(|row| Ok(TaggedRow::new(ordinal, row)))
                .collect();
            inputs.push((ordinal, stream::iter(tagged).boxed()));
        }

        // Scatter the misses
        let assignments: Vec<(usize, QuerySegment, Arc<QueryableServer>)> = partition
            .misses
            .into_iter()
            .filter_map(|segment| {
                let (ordinal, server) = placement.remove(&segment.descriptor)?;
                Some((ordinal, segment, server))
            })
            .collect();
        let groups = group_by_server(assignments);
        let num_servers = groups.len();

        let populate = (cache_eligible && settings.populate_cache).then(|| {
            let scoped: Arc<dyn CachePopulator> =
                Arc::new(QueryScopedPopulator::new(Arc::clone(&self.populator)));
            (scoped, Arc::clone(&signature))
        });
        let fetch = Arc::new(FetchContext {
            merger: Arc::clone(&merger),
            response: response.clone(),
            populate,
            deadline,
            timeout_ms: settings.timeout.as_millis() as u64,
            allow_partial: settings.allow_partial_results,
            gathered_bytes: AtomicU64::new(0),
            max_scatter_gather_bytes: settings.max_scatter_gather_bytes,
        });

        let mut tasks = AbortOnDrop::default();
        for group in groups {
            debug!(
                "Dispatching {} segments of query {} to {}",
                group.segments.len(),
                query.id,
                group.server.name()
            );
            let (segment_inputs, handle) = dispatch(group, Arc::clone(&fetch), &runtime);
            inputs.extend(segment_inputs);
            tasks.push(handle);
        }
        // Segment-ordered merges read inputs in this order
        inputs.sort_by_key(|(ordinal, _)| *ordinal);
        let inputs: Vec<TaggedRowStream> = inputs.into_iter().map(|(_, input)| input).collect();

        info!(
            "Query {}: {} segments, {} cached, {} unavailable, {} servers",
            query.id, total_segments, num_hits, unavailable, num_servers
        );

        // Merge, finalize, limit
        let merged = if settings.parallelism > 0 {
            let merge_settings = MergeSettings {
                parallelism: settings.parallelism,
                batch_size: settings.batch_size,
                max_queued_batches: settings.max_queued_batches,
                deadline,
                timeout_ms: settings.timeout.as_millis() as u64,
            };
            let (merged, handles) =
                parallel_merge(merger, inputs, &self.merge_pool, merge_settings, &runtime);
            for handle in handles {
                tasks.push(handle);
            }
            merged
        } else {
            merger.merge(inputs)
        };

        let finalize_query = Arc::clone(&query);
        let rows = merged.map(move |item| -> Result<ResultRow> {
            let tagged = item?;
            Ok(toolchest.finalize(&finalize_query, tagged.row)?)
        });
        let rows = match query.limit {
            Some(limit) => rows.take(limit).boxed(),
            None => rows.boxed(),
        };

        Ok(QueryResultStream::new(rows, tasks, response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParallelMergeConfig;
    use crate::local::LocalDataServer;
    use crate::selector::SelectionStrategy;
    use crate::server::{SegmentQueryRunner, ServerMetadata};
    use crate::test_util::{Behavior, ScriptedRunner};
    use crate::view::BrokerServerView;
    use query_cache::{segment_cache_key, CacheConfig, MemoryCache, PopulateMode};
    use query_core::{
        Aggregator, ArithmeticOp, Granularity, PostAggregator, QueryContext, QueryToolChest,
        ScanOrder, SegmentId, TimeseriesToolChest, Value,
    };
    use query_timeline::{TimelineObjectHolder, TimelineView};
    use std::time::Duration;

    const MINUTE: i64 = 60_000;

    fn segment_id(minute: i64, version: &str) -> SegmentId {
        SegmentId::new("wiki", Interval::new(minute * MINUTE, (minute + 1) * MINUTE), version, 0)
    }

    fn edit(ts: i64, page: &str, added: i64) -> ResultRow {
        ResultRow::new(ts).with("page", page).with("added", added)
    }

    fn minute_rows(minute: i64) -> Vec<ResultRow> {
        let base = minute * MINUTE;
        match minute {
            0 => vec![edit(1_000, "home", 10), edit(2_000, "about", 20), edit(30_000, "home", 5)],
            1 => vec![edit(base + 1_000, "home", 1), edit(base + 30_000, "about", 2)],
            _ => vec![edit(base + 30_000, "home", 4)],
        }
    }

    struct Cluster {
        view: Arc<BrokerServerView>,
        cache: Arc<MemoryCache>,
        runners: HashMap<String, Arc<ScriptedRunner>>,
    }

    impl Cluster {
        fn new() -> Self {
            Self {
                view: Arc::new(BrokerServerView::new(SelectionStrategy::default())),
                cache: Arc::new(MemoryCache::with_defaults()),
                runners: HashMap::new(),
            }
        }

        fn add_server(
            &mut self,
            name: &str,
            behavior: Behavior,
            delay: Option<Duration>,
            segments: Vec<(SegmentId, Vec<ResultRow>)>,
        ) {
            let local = LocalDataServer::new();
            for (id, rows) in &segments {
                local.add_segment(id.clone(), rows.clone());
            }
            let mut runner = ScriptedRunner::new(Arc::new(local)).with_behavior(behavior);
            if let Some(delay) = delay {
                runner = runner.with_delay(delay);
            }
            let runner = Arc::new(runner);
            let as_runner: Arc<dyn SegmentQueryRunner> = runner.clone();

            self.view
                .add_server(Arc::new(QueryableServer::new(
                    ServerMetadata::new(name, format!("{}:8083", name), "_default_tier", 0),
                    as_runner,
                )))
                .unwrap();
            for (id, _) in segments {
                self.view.add_segment(name, id).unwrap();
            }
            self.runners.insert(name.to_string(), runner);
        }

        /// Server `a` holds minute 0, server `b` holds minutes 1 and 2
        fn standard(b_behavior: Behavior, b_delay: Option<Duration>) -> Self {
            let mut cluster = Self::new();
            cluster.add_server("a", Behavior::Normal, None, vec![(segment_id(0, "v1"), minute_rows(0))]);
            cluster.add_server(
                "b",
                b_behavior,
                b_delay,
                vec![
                    (segment_id(1, "v1"), minute_rows(1)),
                    (segment_id(2, "v1"), minute_rows(2)),
                ],
            );
            cluster
        }

        fn client(&self, config: BrokerConfig) -> ClusterClient {
            ClusterClient::new(self.view.clone(), self.cache.clone(), config).unwrap()
        }

        fn calls(&self, name: &str) -> usize {
            self.runners[name].calls()
        }
    }

    fn timeseries() -> Query {
        Query::timeseries(
            "wiki",
            vec![Interval::new(0, 3 * MINUTE)],
            vec![Aggregator::count("rows"), Aggregator::long_sum("added", "added")],
        )
        .with_granularity(Granularity::Minute)
    }

    fn with_context(query: Query, context: QueryContext) -> Query {
        query.with_context(context)
    }

    fn summary(rows: &[ResultRow]) -> Vec<(i64, Value, Value)> {
        rows.iter()
            .map(|r| (r.timestamp, r.value("rows").clone(), r.value("added").clone()))
            .collect()
    }

    async fn run(client: &ClusterClient, query: Query) -> (Result<Vec<ResultRow>>, ResponseContext) {
        let context = ResponseContext::new();
        match client.run(query, context.clone()) {
            Ok(stream) => (stream.collect_rows().await, context),
            Err(e) => (Err(e), context),
        }
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cluster = Cluster::standard(Behavior::Normal, None);
        let client = cluster.client(BrokerConfig::default());

        let (first, ctx) = run(&client, timeseries()).await;
        let first = first.unwrap();
        assert_eq!(
            summary(&first),
            vec![
                (0, Value::Long(3), Value::Long(35)),
                (MINUTE, Value::Long(2), Value::Long(3)),
                (2 * MINUTE, Value::Long(1), Value::Long(4)),
            ]
        );
        assert_eq!(ctx.cache_misses(), 3);
        assert_eq!(ctx.cache_hits(), 0);
        assert_eq!(ctx.rpc_count(), 2);
        assert_eq!(ctx.rows_gathered(), 3);
        assert_eq!(cluster.cache.len(), 3);

        let (second, ctx) = run(&client, timeseries()).await;
        assert_eq!(second.unwrap(), first);
        assert_eq!(ctx.cache_hits(), 3);
        assert_eq!(ctx.cache_misses(), 0);
        assert_eq!(ctx.rpc_count(), 0);
        assert_eq!(cluster.calls("a"), 1);
        assert_eq!(cluster.calls("b"), 1);
    }

    #[tokio::test]
    async fn test_partial_cache_hit_fetches_only_misses() {
        let cluster = Cluster::standard(Behavior::Normal, None);
        let client = cluster.client(BrokerConfig::default());

        let mut narrow = timeseries();
        narrow.intervals = vec![Interval::new(0, MINUTE)];
        run(&client, narrow).await.0.unwrap();
        assert_eq!(cluster.calls("a"), 1);

        let (rows, ctx) = run(&client, timeseries()).await;
        assert_eq!(rows.unwrap().len(), 3);
        assert_eq!(ctx.cache_hits(), 1);
        assert_eq!(ctx.cache_misses(), 2);
        assert_eq!(cluster.calls("a"), 1);
        assert_eq!(cluster.calls("b"), 1);
    }

    #[tokio::test]
    async fn test_newer_version_shadows_older() {
        let mut cluster = Cluster::standard(Behavior::Normal, None);
        cluster.add_server(
            "c",
            Behavior::Normal,
            None,
            vec![(segment_id(0, "v2"), vec![edit(5_000, "home", 1_000)])],
        );
        let client = cluster.client(BrokerConfig::default());

        let (rows, _) = run(&client, timeseries()).await;
        let rows = rows.unwrap();
        assert_eq!(rows[0].value("added"), &Value::Long(1_000));
        assert_eq!(cluster.calls("a"), 0);
        assert_eq!(cluster.calls("c"), 1);
    }

    #[tokio::test]
    async fn test_merge_is_deterministic_across_parallelism() {
        let mut cluster = Cluster::new();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            let segments: Vec<(SegmentId, Vec<ResultRow>)> = (0..3)
                .map(|k| {
                    let minute = (i * 3 + k) as i64;
                    let rows: Vec<ResultRow> = (0..5)
                        .map(|r| {
                            let page = if (r + k) % 2 == 0 { "home" } else { "about" };
                            edit(minute * MINUTE + r as i64 * 1_000, page, (r * 10 + k) as i64)
                        })
                        .collect();
                    (segment_id(minute, "v1"), rows)
                })
                .collect();
            cluster.add_server(name, Behavior::Normal, None, segments);
        }
        let config = BrokerConfig::default().with_merge(ParallelMergeConfig::default().with_pool_size(4));
        let client = cluster.client(config);

        let query = |parallelism: usize| {
            Query::group_by(
                "wiki",
                vec![Interval::new(0, 9 * MINUTE)],
                vec!["page".to_string()],
                vec![Aggregator::count("rows"), Aggregator::long_sum("added", "added")],
            )
            .with_granularity(Granularity::Hour)
            .with_context(QueryContext {
                use_cache: Some(false),
                parallel_merge: Some(true),
                parallelism: Some(parallelism),
                ..Default::default()
            })
        };

        let (sequential, _) = run(&client, query(0)).await;
        let sequential = sequential.unwrap();
        assert_eq!(sequential.len(), 2);
        assert_eq!(sequential[0].value("page"), &Value::from("about"));

        for parallelism in [1, 4] {
            let (rows, _) = run(&client, query(parallelism)).await;
            assert_eq!(rows.unwrap(), sequential);
        }
        assert_eq!(client.merge_pool().available(), 4);
    }

    #[tokio::test]
    async fn test_server_failure_strict_and_partial() {
        let cluster = Cluster::standard(Behavior::Fail, None);
        let client = cluster.client(BrokerConfig::default());
        let no_cache = QueryContext {
            use_cache: Some(false),
            ..Default::default()
        };

        let (strict, _) = run(&client, with_context(timeseries(), no_cache.clone())).await;
        assert!(matches!(strict, Err(BrokerError::ServerFailure { .. })));

        let tolerant = QueryContext {
            allow_partial_results: Some(true),
            ..no_cache
        };
        let (rows, ctx) = run(&client, with_context(timeseries(), tolerant)).await;
        let rows = rows.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp, 0);
        assert_eq!(
            ctx.missing_segments(),
            vec![
                segment_id(1, "v1").descriptor(segment_id(1, "v1").interval),
                segment_id(2, "v1").descriptor(segment_id(2, "v1").interval),
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_mid_stream_keeps_delivered_segments() {
        let cluster = Cluster::standard(Behavior::FailAfter(1), None);
        let client = cluster.client(BrokerConfig::default().with_allow_partial_results(true));

        let (rows, ctx) = run(&client, timeseries()).await;
        assert_eq!(rows.unwrap().len(), 2);
        assert_eq!(ctx.missing_segments().len(), 1);
        // The delivered segment was cached, the failed one was not
        assert_eq!(cluster.cache.len(), 2);
    }

    #[tokio::test]
    async fn test_omitted_segment() {
        let cluster = Cluster::standard(Behavior::OmitLast, None);
        let client = cluster.client(BrokerConfig::default());

        let (strict, _) = run(&client, timeseries()).await;
        assert!(matches!(strict, Err(BrokerError::MissingSegments { count: 1, .. })));

        let tolerant = with_context(
            timeseries(),
            QueryContext {
                allow_partial_results: Some(true),
                use_cache: Some(false),
                ..Default::default()
            },
        );
        let (rows, ctx) = run(&client, tolerant).await;
        assert_eq!(rows.unwrap().len(), 2);
        assert_eq!(ctx.missing_segments().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_results_are_fatal() {
        for behavior in [Behavior::Duplicate, Behavior::Unsorted] {
            let cluster = Cluster::standard(behavior, None);
            let client = cluster.client(BrokerConfig::default().with_allow_partial_results(true));
            let (result, _) = run(&client, timeseries().with_granularity(Granularity::None)).await;
            assert!(matches!(result, Err(BrokerError::MalformedResult { .. })));
        }
    }

    /// View that hides the servers of one segment
    struct OutageView {
        inner: BrokerServerView,
        down: SegmentId,
    }

    impl TimelineView for OutageView {
        fn lookup(&self, datasource: &str, interval: &Interval) -> Option<Vec<TimelineObjectHolder<SegmentId>>> {
            self.inner.lookup(datasource, interval)
        }
    }

    impl ServerView for OutageView {
        fn select_server(&self, segment: &SegmentId) -> Option<Arc<QueryableServer>> {
            if *segment == self.down {
                return None;
            }
            self.inner.select_server(segment)
        }

        fn server(&self, name: &str) -> Option<Arc<QueryableServer>> {
            self.inner.server(name)
        }
    }

    #[tokio::test]
    async fn test_unavailable_segment() {
        let inner = BrokerServerView::new(SelectionStrategy::default());
        inner
            .add_server(Arc::new(QueryableServer::new(
                ServerMetadata::new("a", "a:8083", "_default_tier", 0),
                {
                    let local = LocalDataServer::new();
                    local.add_segment(segment_id(0, "v1"), minute_rows(0));
                    local.add_segment(segment_id(1, "v1"), minute_rows(1));
                    Arc::new(local) as Arc<dyn SegmentQueryRunner>
                },
            )))
            .unwrap();
        inner.add_segment("a", segment_id(0, "v1")).unwrap();
        inner.add_segment("a", segment_id(1, "v1")).unwrap();
        let view = Arc::new(OutageView {
            inner,
            down: segment_id(1, "v1"),
        });
        let client =
            ClusterClient::new(view, Arc::new(MemoryCache::with_defaults()), BrokerConfig::default()).unwrap();

        let context = ResponseContext::new();
        let strict = client.run(timeseries(), context.clone());
        assert!(matches!(strict, Err(BrokerError::SegmentUnavailable(_))));
        assert_eq!(context.unavailable_segments().len(), 1);

        let tolerant = with_context(
            timeseries(),
            QueryContext {
                allow_partial_results: Some(true),
                ..Default::default()
            },
        );
        let (rows, ctx) = run(&client, tolerant).await;
        assert_eq!(rows.unwrap().len(), 1);
        assert_eq!(ctx.unavailable_segments().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout() {
        let cluster = Cluster::standard(Behavior::Normal, Some(Duration::from_millis(500)));
        let client = cluster.client(BrokerConfig::default());

        let query = with_context(
            timeseries(),
            QueryContext {
                timeout: Some(50),
                ..Default::default()
            },
        );
        let (result, _) = run(&client, query).await;
        assert!(matches!(result, Err(BrokerError::Timeout { timeout_ms: 50, .. })));
    }

    #[tokio::test]
    async fn test_drop_cancels_fetches() {
        let cluster = Cluster::standard(Behavior::Normal, Some(Duration::from_millis(200)));
        let client = cluster.client(BrokerConfig::default());
        let server_b = cluster.view.server("b").unwrap();

        let stream = client.run(timeseries(), ResponseContext::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server_b.in_flight(), 1);

        drop(stream);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server_b.in_flight(), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        // Server a answered right away; b was cancelled before it could
        assert_eq!(cluster.cache.len(), 1);
    }

    #[tokio::test]
    async fn test_background_population() {
        let cluster = Cluster::standard(Behavior::Normal, None);
        let config = BrokerConfig::default()
            .with_cache(CacheConfig::default().with_populate_mode(PopulateMode::Background));
        let client = cluster.client(config);

        run(&client, timeseries()).await.0.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(client.populator_stats().ok(), 3);
        assert_eq!(cluster.cache.len(), 3);
    }

    #[tokio::test]
    async fn test_oversized_entries_are_skipped() {
        let cluster = Cluster::standard(Behavior::Normal, None);
        let config = BrokerConfig::default().with_cache(CacheConfig::default().with_max_entry_size(8));
        let client = cluster.client(config);

        let (rows, _) = run(&client, timeseries()).await;
        assert_eq!(rows.unwrap().len(), 3);
        assert_eq!(client.populator_stats().oversized(), 3);
        assert!(cluster.cache.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let cluster = Cluster::standard(Behavior::Normal, None);
        let client = cluster.client(BrokerConfig::default());

        let query = timeseries();
        let signature = TimeseriesToolChest.cache_signature(&query);
        let id = segment_id(0, "v1");
        let key = segment_cache_key(&QuerySegment::new(id.clone(), id.interval), &signature);
        cluster.cache.put(key, b"not json".to_vec()).unwrap();

        let (rows, ctx) = run(&client, query).await;
        assert_eq!(rows.unwrap().len(), 3);
        assert_eq!(ctx.cache_misses(), 3);
        assert_eq!(client.cache_stats().errors(), 1);

        let (_, ctx) = run(&client, timeseries()).await;
        assert_eq!(ctx.cache_hits(), 3);
    }

    #[tokio::test]
    async fn test_etag_match_returns_nothing() {
        let cluster = Cluster::standard(Behavior::Normal, None);
        let client = cluster.client(BrokerConfig::default());

        let first = with_context(
            timeseries(),
            QueryContext {
                if_none_match: Some("stale".to_string()),
                ..Default::default()
            },
        );
        let (rows, ctx) = run(&client, first).await;
        assert_eq!(rows.unwrap().len(), 3);
        let etag = ctx.etag().unwrap();

        let matching = with_context(
            timeseries(),
            QueryContext {
                if_none_match: Some(etag.clone()),
                ..Default::default()
            },
        );
        let (rows, ctx) = run(&client, matching).await;
        assert!(rows.unwrap().is_empty());
        assert_eq!(ctx.rpc_count(), 0);
        assert_eq!(ctx.etag(), Some(etag));
    }

    #[test]
    fn test_etag_depends_only_on_signature_and_segments() {
        let signature = TimeseriesToolChest.cache_signature(&timeseries());
        let segments = |version: &str| {
            let id = segment_id(0, version);
            vec![QuerySegment::new(id.clone(), id.interval)]
        };

        let etag = compute_etag(&signature, &segments("v1"));
        assert_eq!(etag.len(), 16);
        assert_eq!(etag, compute_etag(&signature.clone(), &segments("v1")));
        assert_ne!(etag, compute_etag(&signature, &segments("v2")));
        assert_ne!(etag, compute_etag(b"other", &segments("v1")));
    }

    #[tokio::test]
    async fn test_scan_order_and_limit() {
        let cluster = Cluster::standard(Behavior::Normal, None);
        let client = cluster.client(BrokerConfig::default());

        let query = Query::scan("wiki", vec![Interval::new(0, 3 * MINUTE)], vec!["page".to_string()])
            .with_order(ScanOrder::Descending)
            .with_limit(4);
        let (rows, _) = run(&client, query).await;
        let rows = rows.unwrap();

        let timestamps: Vec<i64> = rows.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![2 * MINUTE + 30_000, MINUTE + 30_000, MINUTE + 1_000, 30_000]);
        assert!(rows.iter().all(|r| r.columns.len() == 1));
        assert!(cluster.cache.is_empty());
    }

    #[tokio::test]
    async fn test_first_row_does_not_wait_for_slow_segment() {
        let mut cluster = Cluster::new();
        cluster.add_server(
            "a",
            Behavior::SlowTail(Duration::from_secs(2)),
            None,
            vec![
                (segment_id(0, "v1"), minute_rows(0)),
                (segment_id(1, "v1"), minute_rows(1)),
            ],
        );
        let client = cluster.client(BrokerConfig::default());

        let query = Query::scan("wiki", vec![Interval::new(0, 2 * MINUTE)], vec!["page".to_string()]).with_limit(1);
        let mut rows = client.run(query, ResponseContext::new()).unwrap();
        let first = tokio::time::timeout(Duration::from_secs(1), rows.next())
            .await
            .expect("first row waited for the last segment");

        assert_eq!(first.unwrap().unwrap().timestamp, 1_000);
    }

    #[tokio::test]
    async fn test_gathered_bytes_are_capped() {
        let cluster = Cluster::standard(Behavior::Normal, None);
        let client = cluster.client(BrokerConfig::default().with_max_scatter_gather_bytes(64));
        let scan = || Query::scan("wiki", vec![Interval::new(0, 3 * MINUTE)], vec!["page".to_string()]);

        let (result, _) = run(&client, scan()).await;
        assert!(matches!(result, Err(BrokerError::ResourceLimitExceeded(_))));

        let raised = with_context(
            scan(),
            QueryContext {
                max_scatter_gather_bytes: Some(1 << 30),
                allow_partial_results: Some(true),
                ..Default::default()
            },
        );
        let (result, _) = run(&client, raised).await;
        assert!(matches!(result, Err(BrokerError::ResourceLimitExceeded(_))));

        let unlimited = cluster.client(BrokerConfig::default());
        let (rows, _) = run(&unlimited, scan()).await;
        assert_eq!(rows.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_post_aggregators_and_all_granularity() {
        let cluster = Cluster::standard(Behavior::Normal, None);
        let client = cluster.client(BrokerConfig::default());

        let query = Query::timeseries(
            "wiki",
            vec![Interval::new(0, 3 * MINUTE)],
            vec![Aggregator::count("rows"), Aggregator::long_sum("added", "added")],
        )
        .with_post_aggregator(PostAggregator::new(
            "avg",
            ArithmeticOp::Divide,
            vec!["added".to_string(), "rows".to_string()],
        ));
        let (rows, _) = run(&client, query).await;
        let rows = rows.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp, 0);
        assert_eq!(rows[0].value("rows"), &Value::Long(6));
        assert_eq!(rows[0].value("added"), &Value::Long(42));
        assert_eq!(rows[0].value("avg"), &Value::Double(7.0));
    }

    #[tokio::test]
    async fn test_uncovered_intervals_reported() {
        let cluster = Cluster::standard(Behavior::Normal, None);
        let client = cluster.client(BrokerConfig::default().with_uncovered_intervals_limit(5));

        let mut query = timeseries();
        query.intervals = vec![Interval::new(0, 5 * MINUTE)];
        let (rows, ctx) = run(&client, query).await;

        assert_eq!(rows.unwrap().len(), 3);
        assert_eq!(ctx.uncovered_intervals(), vec![Interval::new(3 * MINUTE, 5 * MINUTE)]);
    }

    #[tokio::test]
    async fn test_unknown_datasource_is_empty() {
        let cluster = Cluster::standard(Behavior::Normal, None);
        let client = cluster.client(BrokerConfig::default());

        let query = Query::timeseries("missing", vec![Interval::new(0, MINUTE)], vec![Aggregator::count("rows")]);
        let (rows, ctx) = run(&client, query).await;
        assert!(rows.unwrap().is_empty());
        assert_eq!(ctx.rpc_count(), 0);
    }

    #[test]
    fn test_requires_runtime() {
        let cluster = Cluster::standard(Behavior::Normal, None);
        let client = cluster.client(BrokerConfig::default());
        assert!(matches!(
            client.run(timeseries(), ResponseContext::new()),
            Err(BrokerError::Config(_))
        ));
    }
}
