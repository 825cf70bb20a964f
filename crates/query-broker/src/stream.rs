//! Client-facing result stream

use crate::context::ResponseContext;
use crate::error::Result;
use futures::stream::{BoxStream, Stream, StreamExt, TryStreamExt};
use query_core::ResultRow;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;

/// Aborts the wrapped tasks when dropped
#[derive(Default)]
pub(crate) struct AbortOnDrop(Vec<JoinHandle<()>>);

impl AbortOnDrop {
    pub(crate) fn push(&mut self, handle: JoinHandle<()>) {
        self.0.push(handle);
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Finalized, ordered rows of one query
///
/// Dropping the stream before it ends cancels every outstanding sub-query
/// and merge task.
pub struct QueryResultStream {
    inner: BoxStream<'static, Result<ResultRow>>,
    _tasks: AbortOnDrop,
    context: ResponseContext,
}

impl QueryResultStream {
    pub(crate) fn new(
        inner: BoxStream<'static, Result<ResultRow>>,
        tasks: AbortOnDrop,
        context: ResponseContext,
    ) -> Self {
        Self {
            inner,
            _tasks: tasks,
            context,
        }
    }

    pub(crate) fn empty(context: ResponseContext) -> Self {
        Self::new(futures::stream::empty().boxed(), AbortOnDrop::default(), context)
    }

    /// Metadata recorded for this query so far
    pub fn response_context(&self) -> &ResponseContext {
        &self.context
    }

    /// Drain the stream into a vector, failing on the first error
    pub async fn collect_rows(self) -> Result<Vec<ResultRow>> {
        self.try_collect().await
    }
}

impl Stream for QueryResultStream {
    type Item = Result<ResultRow>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_drop_aborts_tasks() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            flag.store(true, Ordering::SeqCst);
        });

        let stream = QueryResultStream::new(
            futures::stream::pending().boxed(),
            AbortOnDrop(vec![handle]),
            ResponseContext::new(),
        );
        drop(stream);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_collect_rows() {
        let rows = vec![Ok(ResultRow::new(1)), Ok(ResultRow::new(2))];
        let stream = QueryResultStream::new(
            futures::stream::iter(rows).boxed(),
            AbortOnDrop::default(),
            ResponseContext::new(),
        );
        let collected = stream.collect_rows().await.unwrap();
        assert_eq!(collected.len(), 2);
    }
}
