//! Scriptable data server for tests

use crate::error::{BrokerError, Result};
use crate::server::{SegmentQueryRunner, SegmentResult, SegmentResultStream, SubQuery};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How a [`ScriptedRunner`] misbehaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Normal,
    /// Reject the sub-query outright
    Fail,
    /// Deliver this many segments, then fail
    FailAfter(usize),
    /// Silently leave out the last segment
    OmitLast,
    /// Send the first segment twice
    Duplicate,
    /// Reverse the rows of every segment
    Unsorted,
    /// Hold back the last segment for this long
    SlowTail(Duration),
}

/// Wraps a runner, counting calls and optionally misbehaving
pub struct ScriptedRunner {
    inner: Option<Arc<dyn SegmentQueryRunner>>,
    behavior: Behavior,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedRunner {
    /// A runner that holds no segments
    pub fn empty() -> Self {
        Self {
            inner: None,
            behavior: Behavior::Normal,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn new(inner: Arc<dyn SegmentQueryRunner>) -> Self {
        Self {
            inner: Some(inner),
            ..Self::empty()
        }
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SegmentQueryRunner for ScriptedRunner {
    async fn run(&self, query: SubQuery) -> Result<SegmentResultStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.behavior == Behavior::Fail {
            return Err(BrokerError::ServerFailure {
                server: "scripted".to_string(),
                message: "scripted failure".to_string(),
            });
        }

        let mut results: Vec<SegmentResult> = match &self.inner {
            Some(inner) => inner.run(query).await?.try_collect().await?,
            None => Vec::new(),
        };

        if let Behavior::SlowTail(delay) = self.behavior {
            let last = results.pop();
            let head = stream::iter(results.into_iter().map(Ok::<SegmentResult, BrokerError>));
            let tail = stream::iter(last).then(move |result| async move {
                tokio::time::sleep(delay).await;
                Ok(result)
            });
            return Ok(head.chain(tail).boxed());
        }

        let items: Vec<Result<SegmentResult>> = match self.behavior {
            Behavior::OmitLast => {
                results.pop();
                results.into_iter().map(Ok).collect()
            }
            Behavior::Duplicate => {
                if let Some(first) = results.first().cloned() {
                    results.push(first);
                }
                results.into_iter().map(Ok).collect()
            }
            Behavior::Unsorted => results
                .into_iter()
                .map(|mut r| {
                    r.rows.reverse();
                    Ok(r)
                })
                .collect(),
            Behavior::FailAfter(n) => {
                let mut items: Vec<Result<SegmentResult>> = results.into_iter().take(n).map(Ok).collect();
                items.push(Err(BrokerError::ServerFailure {
                    server: "scripted".to_string(),
                    message: "connection reset".to_string(),
                }));
                items
            }
            Behavior::Normal | Behavior::Fail | Behavior::SlowTail(_) => results.into_iter().map(Ok).collect(),
        };
        Ok(stream::iter(items).boxed())
    }
}
