//! Scatter/gather: one sub-query per server, results streamed back
//!
//! Each [`ServerGroup`] becomes a fetch task. The task sends a single
//! [`SubQuery`] for the group's segments and checks and caches every segment
//! result as it arrives. Each segment is its own merge input: its rows are
//! handed over the moment the segment is validated, without waiting for the
//! rest of the server's response.
//!
//! A failure is parked in a slot shared by the group's inputs before any of
//! them closes. The first input that finds its segment missing reports it. A
//! trailing status input reports failures found after every segment arrived.

use crate::context::ResponseContext;
use crate::error::{BrokerError, Result};
use crate::merge::{RowMerger, TaggedRow, TaggedRowStream};
use crate::server::{QueryableServer, SegmentResult, SubQuery};
use ahash::AHashMap;
use futures::future;
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use query_cache::{segment_cache_key, CachePopulator};
use query_core::{QuerySegment, SegmentDescriptor};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{self, AtomicU64};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

/// Merge key of a group's status input, after every segment
pub(crate) const STATUS_ORDINAL: usize = usize::MAX;

/// Segments assigned to one server, each with its ordinal
#[derive(Debug, Clone)]
pub struct ServerGroup {
    pub server: Arc<QueryableServer>,
    pub segments: Vec<(usize, QuerySegment)>,
}

/// Group segment assignments by server, ordered by server name
pub fn group_by_server(assignments: Vec<(usize, QuerySegment, Arc<QueryableServer>)>) -> Vec<ServerGroup> {
    let mut groups: BTreeMap<String, ServerGroup> = BTreeMap::new();
    for (ordinal, segment, server) in assignments {
        groups
            .entry(server.name().to_string())
            .or_insert_with(|| ServerGroup {
                server,
                segments: Vec::new(),
            })
            .segments
            .push((ordinal, segment));
    }
    groups.into_values().collect()
}

/// Per-query state shared by all fetch tasks
pub(crate) struct FetchContext {
    pub merger: Arc<RowMerger>,
    pub response: ResponseContext,
    /// Populator and cache signature, when results should be cached
    pub populate: Option<(Arc<dyn CachePopulator>, Arc<[u8]>)>,
    pub deadline: Instant,
    pub timeout_ms: u64,
    pub allow_partial: bool,
    /// Bytes gathered so far across all servers
    pub gathered_bytes: AtomicU64,
    /// 0 means unlimited
    pub max_scatter_gather_bytes: u64,
}

type Failure = Arc<Mutex<Option<BrokerError>>>;
type Senders = AHashMap<SegmentDescriptor, oneshot::Sender<Vec<TaggedRow>>>;

/// Start the fetch task for one server group
///
/// Returns one input per segment keyed by its ordinal, followed by the
/// group's status input keyed by [`STATUS_ORDINAL`].
pub(crate) fn dispatch(
    group: ServerGroup,
    ctx: Arc<FetchContext>,
    runtime: &Handle,
) -> (Vec<(usize, TaggedRowStream)>, JoinHandle<()>) {
    let failure: Failure = Arc::new(Mutex::new(None));
    let mut senders: Senders = AHashMap::with_capacity(group.segments.len());
    let mut inputs: Vec<(usize, TaggedRowStream)> = Vec::with_capacity(group.segments.len() + 1);

    for (ordinal, segment) in &group.segments {
        let (tx, rx) = oneshot::channel();
        senders.insert(segment.descriptor.clone(), tx);
        inputs.push((*ordinal, segment_input(rx, Arc::clone(&failure))));
    }
    let (done_tx, done_rx) = oneshot::channel::<()>();
    inputs.push((STATUS_ORDINAL, status_input(done_rx, Arc::clone(&failure))));

    let handle = runtime.spawn(async move {
        if let Err(e) = fetch(&group, &ctx, &mut senders).await {
            tracing::warn!("Query to server {} failed: {}", group.server.name(), e);
            *failure.lock() = Some(e);
        }
        // The slot is filled before any input can observe a closed channel
        drop(senders);
        drop(done_tx);
    });

    (inputs, handle)
}

/// Rows of one segment, or the group's failure if the segment never arrives
fn segment_input(rx: oneshot::Receiver<Vec<TaggedRow>>, failure: Failure) -> TaggedRowStream {
    stream::once(async move {
        let rows = match rx.await {
            Ok(rows) => rows,
            Err(_) => match failure.lock().take() {
                Some(e) => return Err(e),
                None => Vec::new(),
            },
        };
        Ok(stream::iter(rows.into_iter().map(Ok::<TaggedRow, BrokerError>)))
    })
    .try_flatten()
    .boxed()
}

/// Empty unless the group failed and no segment input reported it
fn status_input(done: oneshot::Receiver<()>, failure: Failure) -> TaggedRowStream {
    stream::once(async move {
        let _ = done.await;
        let taken = failure.lock().take();
        taken
    })
    .filter_map(|failure| future::ready(failure.map(Err)))
    .boxed()
}

async fn fetch(group: &ServerGroup, ctx: &FetchContext, senders: &mut Senders) -> Result<()> {
    let server = group.server.name().to_string();
    let requested: AHashMap<&SegmentDescriptor, (usize, &QuerySegment)> = group
        .segments
        .iter()
        .map(|(ordinal, segment)| (&segment.descriptor, (*ordinal, segment)))
        .collect();

    ctx.response.increment_rpc_count();
    let _in_flight = group.server.begin_query();
    tracing::debug!("Sending {} segments to server {}", group.segments.len(), server);

    let outcome = receive(group, ctx, &requested, senders).await;
    let undelivered: Vec<SegmentDescriptor> = group
        .segments
        .iter()
        .map(|(_, segment)| &segment.descriptor)
        .filter(|descriptor| senders.contains_key(*descriptor))
        .cloned()
        .collect();

    match outcome {
        Err(e) if !e.is_fetch_error() => return Err(e),
        Err(e) if !ctx.allow_partial => return Err(e),
        Err(e) => {
            tracing::warn!(
                "Dropping {} segments from server {}: {}",
                undelivered.len(),
                server,
                e
            );
            ctx.response.add_missing_segments(undelivered);
        }
        Ok(()) if !undelivered.is_empty() => {
            if !ctx.allow_partial {
                return Err(BrokerError::MissingSegments {
                    server,
                    count: undelivered.len(),
                });
            }
            tracing::warn!("Server {} did not return {} segments", server, undelivered.len());
            ctx.response.add_missing_segments(undelivered);
        }
        Ok(()) => {}
    }
    Ok(())
}

/// Pull segment results from the server until it finishes or fails
///
/// Each validated segment is handed to its input straight away.
async fn receive(
    group: &ServerGroup,
    ctx: &FetchContext,
    requested: &AHashMap<&SegmentDescriptor, (usize, &QuerySegment)>,
    senders: &mut Senders,
) -> Result<()> {
    let server = group.server.name();
    let timed_out = || BrokerError::Timeout {
        server: server.to_string(),
        timeout_ms: ctx.timeout_ms,
    };

    let sub_query = SubQuery {
        query: Arc::clone(ctx.merger.query()),
        segments: group.segments.iter().map(|(_, s)| s.descriptor.clone()).collect(),
    };
    let runner = group.server.runner();
    let mut results = timeout_at(ctx.deadline, runner.run(sub_query))
        .await
        .map_err(|_| timed_out())??;

    while let Some(result) = timeout_at(ctx.deadline, results.next())
        .await
        .map_err(|_| timed_out())?
    {
        let SegmentResult { descriptor, rows: segment_rows } = result?;

        let Some(&(ordinal, segment)) = requested.get(&descriptor) else {
            return Err(malformed(server, format!("unrequested segment {}", descriptor)));
        };
        let Some(sender) = senders.remove(&descriptor) else {
            return Err(malformed(server, format!("duplicate segment {}", descriptor)));
        };

        let tagged: Vec<TaggedRow> = segment_rows
            .iter()
            .cloned()
            .map(|row| TaggedRow::new(ordinal, row))
            .collect();
        if tagged
            .windows(2)
            .any(|w| ctx.merger.order(&w[0], &w[1]) == Ordering::Greater)
        {
            return Err(malformed(server, format!("rows of segment {} are out of order", descriptor)));
        }

        let bytes: u64 = segment_rows.iter().map(|row| row.estimated_size() as u64).sum();
        let gathered = ctx.gathered_bytes.fetch_add(bytes, atomic::Ordering::Relaxed) + bytes;
        if ctx.max_scatter_gather_bytes > 0 && gathered > ctx.max_scatter_gather_bytes {
            return Err(BrokerError::ResourceLimitExceeded(format!(
                "gathered {} bytes from data servers, limit is {}",
                gathered, ctx.max_scatter_gather_bytes
            )));
        }

        if let Some((populator, signature)) = &ctx.populate {
            populator.populate(segment_cache_key(segment, signature), segment_rows);
        }
        ctx.response.add_rows_gathered(tagged.len() as u64);
        // The input may already be gone once the query has its rows
        let _ = sender.send(tagged);
    }
    Ok(())
}

fn malformed(server: &str, message: String) -> BrokerError {
    BrokerError::MalformedResult {
        server: server.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerMetadata;
    use crate::test_util::{Behavior, ScriptedRunner};
    use query_core::{Interval, Query, SegmentId, TimeseriesToolChest};
    use std::time::Duration;

    fn server(name: &str) -> Arc<QueryableServer> {
        failing_server(name, Behavior::Normal)
    }

    fn failing_server(name: &str, behavior: Behavior) -> Arc<QueryableServer> {
        Arc::new(QueryableServer::new(
            ServerMetadata::new(name, format!("{}:8083", name), "_default_tier", 0),
            Arc::new(ScriptedRunner::empty().with_behavior(behavior)),
        ))
    }

    fn fetch_context(allow_partial: bool) -> Arc<FetchContext> {
        let query = Query::timeseries("wiki", vec![Interval::new(0, 100)], vec![]);
        Arc::new(FetchContext {
            merger: Arc::new(RowMerger::new(Arc::new(query), Arc::new(TimeseriesToolChest))),
            response: ResponseContext::new(),
            populate: None,
            deadline: Instant::now() + Duration::from_secs(5),
            timeout_ms: 5000,
            allow_partial,
            gathered_bytes: AtomicU64::new(0),
            max_scatter_gather_bytes: 0,
        })
    }

    async fn drain(inputs: Vec<(usize, TaggedRowStream)>) -> Vec<Result<Vec<TaggedRow>>> {
        let mut drained = Vec::new();
        for (_, input) in inputs {
            drained.push(input.try_collect::<Vec<TaggedRow>>().await);
        }
        drained
    }

    fn segment(start: i64) -> QuerySegment {
        let id = SegmentId::new("wiki", Interval::new(start, start + 10), "v1", 0);
        QuerySegment::new(id, Interval::new(start, start + 10))
    }

    #[test]
    fn test_group_by_server_orders_by_name() {
        let b = server("b");
        let a = server("a");
        let groups = group_by_server(vec![
            (0, segment(0), b.clone()),
            (1, segment(10), a.clone()),
            (2, segment(20), b.clone()),
        ]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].server.name(), "a");
        assert_eq!(groups[1].server.name(), "b");
        let ordinals: Vec<usize> = groups[1].segments.iter().map(|(o, _)| *o).collect();
        assert_eq!(ordinals, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_dispatch_without_segments_finishes_empty() {
        let ctx = fetch_context(false);
        let group = ServerGroup {
            server: server("a"),
            segments: Vec::new(),
        };

        let (inputs, handle) = dispatch(group, ctx.clone(), &Handle::current());
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].0, STATUS_ORDINAL);
        let drained = drain(inputs).await;
        handle.await.unwrap();

        assert!(drained[0].as_ref().unwrap().is_empty());
        assert_eq!(ctx.response.rpc_count(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_keys_inputs_by_ordinal() {
        let group = ServerGroup {
            server: server("a"),
            segments: vec![(4, segment(0)), (7, segment(10))],
        };

        let (inputs, handle) = dispatch(group, fetch_context(true), &Handle::current());
        let keys: Vec<usize> = inputs.iter().map(|(ordinal, _)| *ordinal).collect();
        assert_eq!(keys, vec![4, 7, STATUS_ORDINAL]);
        drop(inputs);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_failure_is_reported_once() {
        let group = ServerGroup {
            server: failing_server("a", Behavior::Fail),
            segments: vec![(0, segment(0)), (1, segment(10))],
        };

        let (inputs, handle) = dispatch(group, fetch_context(false), &Handle::current());
        let drained = drain(inputs).await;
        handle.await.unwrap();

        let failures = drained.iter().filter(|r| r.is_err()).count();
        assert_eq!(failures, 1);
        assert!(matches!(drained[0], Err(BrokerError::ServerFailure { .. })));
    }

    #[tokio::test]
    async fn test_tolerated_failure_leaves_inputs_empty() {
        let ctx = fetch_context(true);
        let group = ServerGroup {
            server: failing_server("a", Behavior::Fail),
            segments: vec![(0, segment(0)), (1, segment(10))],
        };

        let (inputs, handle) = dispatch(group, ctx.clone(), &Handle::current());
        let drained = drain(inputs).await;
        handle.await.unwrap();

        assert!(drained.iter().all(|r| matches!(r, Ok(rows) if rows.is_empty())));
        assert_eq!(ctx.response.missing_segments().len(), 2);
    }
}
