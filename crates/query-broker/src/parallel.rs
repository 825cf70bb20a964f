//! Parallel merge on a bounded pool of merge tasks
//!
//! Inputs are split into contiguous groups, each group is merged on its own
//! task, and the group outputs are merged once more on the caller's side.
//! Because the merge order includes segment ordinals, the result is the same
//! as a sequential merge of all inputs.
//!
//! A query waits for merge slots no longer than its own deadline.

use crate::error::{BrokerError, Result};
use crate::merge::{RowMerger, TaggedRow, TaggedRowStream};
use futures::future::FutureExt;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

/// Fixed number of merge task slots shared by all queries
#[derive(Debug, Clone)]
pub struct MergePool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl MergePool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots not held by any query
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Tuning for one parallel merge
#[derive(Debug, Clone, Copy)]
pub struct MergeSettings {
    pub parallelism: usize,
    pub batch_size: usize,
    pub max_queued_batches: usize,
    /// When the query gives up waiting for merge slots
    pub deadline: Instant,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy)]
enum PermitFailure {
    Closed,
    TimedOut,
}

/// Split `inputs` into `groups` contiguous runs of near-equal size
fn split_contiguous<T>(inputs: Vec<T>, groups: usize) -> Vec<Vec<T>> {
    let total = inputs.len();
    let mut iter = inputs.into_iter();
    (0..groups)
        .map(|g| {
            let take = total / groups + usize::from(g < total % groups);
            iter.by_ref().take(take).collect()
        })
        .collect()
}

/// Merge `inputs`, in parallel when the settings and pool allow it
///
/// Returns the merged stream plus the spawned group tasks, which the caller
/// must abort when it stops reading. Merges that read inputs in sequence
/// always run on the caller's side.
pub fn parallel_merge(
    merger: Arc<RowMerger>,
    inputs: Vec<TaggedRowStream>,
    pool: &MergePool,
    settings: MergeSettings,
    runtime: &Handle,
) -> (TaggedRowStream, Vec<JoinHandle<()>>) {
    let groups = settings.parallelism.min(pool.size()).min(inputs.len());
    // Batching would hold back rows a sequential read hands over at once
    if groups < 2 || merger.reads_in_sequence() {
        return (merger.merge(inputs), Vec::new());
    }

    // Every group waits on the same acquisition, so a query takes all of its
    // permits at once or none of them
    let semaphore = Arc::clone(&pool.permits);
    let deadline = settings.deadline;
    let permits = async move {
        match timeout_at(deadline, semaphore.acquire_many_owned(groups as u32)).await {
            Ok(Ok(held)) => Ok(Arc::new(held)),
            Ok(Err(_)) => Err(PermitFailure::Closed),
            Err(_) => Err(PermitFailure::TimedOut),
        }
    }
    .boxed()
    .shared();
    let timeout_ms = settings.timeout_ms;

    let batch_size = settings.batch_size.max(1);
    let mut receivers = Vec::with_capacity(groups);
    let mut handles = Vec::with_capacity(groups);
    for group in split_contiguous(inputs, groups) {
        let (tx, rx) = mpsc::channel::<Result<Vec<TaggedRow>>>(settings.max_queued_batches.max(1));
        let permits = permits.clone();
        let merger = Arc::clone(&merger);
        handles.push(runtime.spawn(async move {
            let _held = match permits.await {
                Ok(held) => held,
                Err(failure) => {
                    let e = match failure {
                        PermitFailure::Closed => BrokerError::Merge("merge pool is closed".to_string()),
                        PermitFailure::TimedOut => BrokerError::MergeTimeout { timeout_ms },
                    };
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            merge_group(merger, group, tx, batch_size).await;
        }));
        receivers.push(rx);
    }
    tracing::debug!("Merging {} groups in parallel", groups);

    let group_streams: Vec<TaggedRowStream> = receivers
        .into_iter()
        .map(|rx| {
            stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|batch| (batch, rx)) })
                .flat_map(|batch| {
                    let rows: Vec<Result<TaggedRow>> = match batch {
                        Ok(rows) => rows.into_iter().map(Ok).collect(),
                        Err(e) => vec![Err(e)],
                    };
                    stream::iter(rows)
                })
                .boxed()
        })
        .collect();

    (merger.merge(group_streams), handles)
}

async fn merge_group(
    merger: Arc<RowMerger>,
    inputs: Vec<TaggedRowStream>,
    tx: mpsc::Sender<Result<Vec<TaggedRow>>>,
    batch_size: usize,
) {
    let mut merged = merger.merge(inputs);
    let mut batch = Vec::with_capacity(batch_size);
    while let Some(item) = merged.next().await {
        match item {
            Ok(row) => {
                batch.push(row);
                if batch.len() >= batch_size {
                    let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                    if tx.send(Ok(full)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
    if !batch.is_empty() {
        let _ = tx.send(Ok(batch)).await;
    }
}
