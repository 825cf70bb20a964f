//! Sequential k-way merge of ordered row streams
//!
//! Every row carries the ordinal of the segment it came from. Rows are merged
//! by the toolchest ordering, ties broken by ordinal, so the output depends
//! only on the set of inputs and never on how they were grouped or when they
//! arrived.
//!
//! When the toolchest orders rows by segment alone, inputs are read one after
//! another instead, so the first rows flow before later inputs have produced
//! anything.

use crate::error::{BrokerError, Result};
use futures::future::{self, join_all};
use futures::stream::{self, BoxStream, StreamExt};
use query_core::{Query, QueryToolChest, ResultRow};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// A result row tagged with its segment's position in the resolved list
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedRow {
    pub ordinal: usize,
    pub row: ResultRow,
}

impl TaggedRow {
    pub fn new(ordinal: usize, row: ResultRow) -> Self {
        Self { ordinal, row }
    }
}

pub type TaggedRowStream = BoxStream<'static, Result<TaggedRow>>;

/// Ordering and combining rules of one query
pub struct RowMerger {
    query: Arc<Query>,
    toolchest: Arc<dyn QueryToolChest>,
}

impl RowMerger {
    pub fn new(query: Arc<Query>, toolchest: Arc<dyn QueryToolChest>) -> Self {
        Self { query, toolchest }
    }

    pub fn query(&self) -> &Arc<Query> {
        &self.query
    }

    /// Merge order: toolchest ordering, then ordinal
    pub fn order(&self, a: &TaggedRow, b: &TaggedRow) -> Ordering {
        self.toolchest
            .compare(&self.query, &a.row, &b.row)
            .then(a.ordinal.cmp(&b.ordinal))
    }

    fn same_key(&self, a: &TaggedRow, b: &TaggedRow) -> bool {
        self.toolchest.compare(&self.query, &a.row, &b.row) == Ordering::Equal
    }

    fn combines(&self) -> bool {
        self.toolchest.combines(&self.query)
    }

    fn combine(&self, a: TaggedRow, b: TaggedRow) -> Result<TaggedRow> {
        let ordinal = a.ordinal.min(b.ordinal);
        let row = self.toolchest.combine(&self.query, a.row, b.row)?;
        Ok(TaggedRow { ordinal, row })
    }

    /// Whether inputs can be read in sequence rather than interleaved
    pub fn reads_in_sequence(&self) -> bool {
        !self.combines() && self.toolchest.orders_by_segment(&self.query)
    }

    /// Merge ordered inputs into one ordered stream
    ///
    /// Rows with equal ordering keys are combined when the query type
    /// combines. An input that goes backwards fails the stream. When
    /// [`reads_in_sequence`](Self::reads_in_sequence) holds, inputs must be
    /// given in segment order; they are drained one at a time.
    pub fn merge(self: &Arc<Self>, inputs: Vec<TaggedRowStream>) -> TaggedRowStream {
        match inputs.len() {
            0 => stream::empty().boxed(),
            1 if !self.combines() => {
                let mut inputs = inputs;
                match inputs.pop() {
                    Some(input) => input,
                    None => stream::empty().boxed(),
                }
            }
            _ if self.reads_in_sequence() => concat(inputs),
            _ => {
                let state = MergeState::new(Arc::clone(self), inputs);
                stream::unfold(state, |mut state| async move {
                    let item = state.next().await?;
                    Some((item, state))
                })
                .boxed()
            }
        }
    }
}

/// Drain inputs in order, failing on a segment ordinal that goes backwards
fn concat(inputs: Vec<TaggedRowStream>) -> TaggedRowStream {
    stream::iter(inputs)
        .flatten()
        .scan((None::<usize>, false), |(last, failed), item| {
            if *failed {
                return future::ready(None);
            }
            let item = match (item, *last) {
                (Ok(row), Some(previous)) if row.ordinal < previous => Err(BrokerError::Merge(format!(
                    "segment ordinal {} arrived after {}",
                    row.ordinal, previous
                ))),
                (Ok(row), _) => {
                    *last = Some(row.ordinal);
                    Ok(row)
                }
                (Err(e), _) => Err(e),
            };
            *failed = item.is_err();
            future::ready(Some(item))
        })
        .boxed()
}

struct HeapItem {
    row: TaggedRow,
    input: usize,
    merger: Arc<RowMerger>,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    // Reversed so the max-heap pops the smallest row; input index breaks
    // ties between rows of the same ordinal
    fn cmp(&self, other: &Self) -> Ordering {
        self.merger
            .order(&other.row, &self.row)
            .then(other.input.cmp(&self.input))
    }
}

struct MergeState {
    merger: Arc<RowMerger>,
    inputs: Vec<TaggedRowStream>,
    heap: BinaryHeap<HeapItem>,
    primed: bool,
    done: bool,
}

impl MergeState {
    fn new(merger: Arc<RowMerger>, inputs: Vec<TaggedRowStream>) -> Self {
        let capacity = inputs.len();
        Self {
            merger,
            inputs,
            heap: BinaryHeap::with_capacity(capacity),
            primed: false,
            done: false,
        }
    }

    async fn prime(&mut self) -> Result<()> {
        let heads = join_all(self.inputs.iter_mut().map(|input| input.next())).await;
        for (input, head) in heads.into_iter().enumerate() {
            if let Some(row) = head.transpose()? {
                self.heap.push(HeapItem {
                    row,
                    input,
                    merger: Arc::clone(&self.merger),
                });
            }
        }
        Ok(())
    }

    /// Pull the row after `previous` from `input` into the heap
    async fn refill(&mut self, input: usize, previous: &TaggedRow) -> Result<()> {
        let Some(next) = self.inputs[input].next().await.transpose()? else {
            return Ok(());
        };
        if self.merger.order(&next, previous) == Ordering::Less {
            return Err(BrokerError::Merge(format!(
                "input {} is out of order at segment ordinal {}",
                input, next.ordinal
            )));
        }
        self.heap.push(HeapItem {
            row: next,
            input,
            merger: Arc::clone(&self.merger),
        });
        Ok(())
    }

    async fn advance(&mut self) -> Result<Option<TaggedRow>> {
        if !self.primed {
            self.primed = true;
            self.prime().await?;
        }

        let Some(HeapItem { row, input, .. }) = self.heap.pop() else {
            return Ok(None);
        };
        self.refill(input, &row).await?;

        if !self.merger.combines() {
            return Ok(Some(row));
        }

        let mut current = row;
        while self
            .heap
            .peek()
            .is_some_and(|head| self.merger.same_key(&head.row, &current))
        {
            let Some(HeapItem { row, input, .. }) = self.heap.pop() else {
                break;
            };
            self.refill(input, &row).await?;
            current = self.merger.combine(current, row)?;
        }
        Ok(Some(current))
    }

    async fn next(&mut self) -> Option<Result<TaggedRow>> {
        if self.done {
            return None;
        }
        match self.advance().await {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
