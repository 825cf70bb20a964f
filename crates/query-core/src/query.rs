//! Query model: query types, aggregators, filters and per-query context

use crate::cache_key::{CacheKeyBuilder, Cacheable};
use crate::error::{QueryError, Result};
use crate::row::{ResultRow, Value};
use crate::types::Interval;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(pub Uuid);

impl QueryId {
    /// Create a new random query ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query-{}", &self.0.to_string()[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryType {
    Timeseries,
    GroupBy,
    Scan,
}

impl QueryType {
    /// Leading byte of every cache signature for this query type
    pub fn cache_type_id(&self) -> u8 {
        match self {
            QueryType::Timeseries => 0x01,
            QueryType::GroupBy => 0x02,
            QueryType::Scan => 0x03,
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryType::Timeseries => "timeseries",
            QueryType::GroupBy => "groupBy",
            QueryType::Scan => "scan",
        };
        write!(f, "{}", name)
    }
}

/// Time bucketing applied by data servers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    None,
    Minute,
    Hour,
    Day,
    All,
}

impl Granularity {
    fn period_millis(&self) -> Option<i64> {
        match self {
            Granularity::Minute => Some(60_000),
            Granularity::Hour => Some(3_600_000),
            Granularity::Day => Some(86_400_000),
            Granularity::None | Granularity::All => None,
        }
    }

    /// Start of the bucket holding `timestamp`
    ///
    /// `All` collapses everything into the start of `interval`.
    pub fn bucket_start(&self, timestamp: i64, interval: &Interval) -> i64 {
        match (self, self.period_millis()) {
            (Granularity::All, _) => interval.start,
            (_, Some(period)) => timestamp - timestamp.rem_euclid(period),
            (_, None) => timestamp,
        }
    }
}

impl Cacheable for Granularity {
    fn cache_key(&self) -> Vec<u8> {
        let id = match self {
            Granularity::None => 0,
            Granularity::Minute => 1,
            Granularity::Hour => 2,
            Granularity::Day => 3,
            Granularity::All => 4,
        };
        vec![id]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregatorKind {
    Count,
    LongSum,
    DoubleSum,
    LongMin,
    LongMax,
}

/// A named aggregation over an input field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregator {
    pub name: String,
    pub kind: AggregatorKind,
    pub field: Option<String>,
}

impl Aggregator {
    pub fn count(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: AggregatorKind::Count,
            field: None,
        }
    }

    pub fn long_sum(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::with_field(name, AggregatorKind::LongSum, field)
    }

    pub fn double_sum(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::with_field(name, AggregatorKind::DoubleSum, field)
    }

    pub fn long_min(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::with_field(name, AggregatorKind::LongMin, field)
    }

    pub fn long_max(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::with_field(name, AggregatorKind::LongMax, field)
    }

    fn with_field(name: impl Into<String>, kind: AggregatorKind, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            field: Some(field.into()),
        }
    }

    /// Combine two partial aggregates into one
    ///
    /// Null is the identity: combining with null returns the other side.
    pub fn combine(&self, a: &Value, b: &Value) -> Result<Value> {
        if a.is_null() {
            return Ok(b.clone());
        }
        if b.is_null() {
            return Ok(a.clone());
        }

        match self.kind {
            AggregatorKind::DoubleSum => {
                let (x, y) = (self.double_of(a)?, self.double_of(b)?);
                Ok(Value::Double(x + y))
            }
            AggregatorKind::Count | AggregatorKind::LongSum => {
                let (x, y) = (self.long_of(a)?, self.long_of(b)?);
                Ok(Value::Long(x.wrapping_add(y)))
            }
            AggregatorKind::LongMin => {
                let (x, y) = (self.long_of(a)?, self.long_of(b)?);
                Ok(Value::Long(x.min(y)))
            }
            AggregatorKind::LongMax => {
                let (x, y) = (self.long_of(a)?, self.long_of(b)?);
                Ok(Value::Long(x.max(y)))
            }
        }
    }

    fn long_of(&self, value: &Value) -> Result<i64> {
        value.as_long().ok_or_else(|| QueryError::TypeMismatch {
            column: self.name.clone(),
            expected: "long".to_string(),
            found: value.type_name().to_string(),
        })
    }

    fn double_of(&self, value: &Value) -> Result<f64> {
        value.as_double().ok_or_else(|| QueryError::TypeMismatch {
            column: self.name.clone(),
            expected: "double".to_string(),
            found: value.type_name().to_string(),
        })
    }
}

impl Cacheable for Aggregator {
    fn cache_key(&self) -> Vec<u8> {
        let kind = match self.kind {
            AggregatorKind::Count => 0,
            AggregatorKind::LongSum => 1,
            AggregatorKind::DoubleSum => 2,
            AggregatorKind::LongMin => 3,
            AggregatorKind::LongMax => 4,
        };
        CacheKeyBuilder::new(kind)
            .append_string(&self.name)
            .append_string(self.field.as_deref().unwrap_or(""))
            .build()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

/// Arithmetic over named columns, evaluated on finalized rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostAggregator {
    pub name: String,
    pub op: ArithmeticOp,
    pub fields: Vec<String>,
}

impl PostAggregator {
    pub fn new(name: impl Into<String>, op: ArithmeticOp, fields: Vec<String>) -> Self {
        Self {
            name: name.into(),
            op,
            fields,
        }
    }

    /// Evaluate against `row`; absent or non-numeric inputs count as zero
    pub fn compute(&self, row: &ResultRow) -> Value {
        let mut operands = self
            .fields
            .iter()
            .map(|field| row.value(field).as_double().unwrap_or(0.0));

        let Some(first) = operands.next() else {
            return Value::Null;
        };

        let result = operands.fold(first, |acc, x| match self.op {
            ArithmeticOp::Add => acc + x,
            ArithmeticOp::Subtract => acc - x,
            ArithmeticOp::Multiply => acc * x,
            ArithmeticOp::Divide => {
                if x == 0.0 {
                    0.0
                } else {
                    acc / x
                }
            }
        });
        Value::Double(result)
    }
}

/// Row filter pushed down to data servers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DimFilter {
    Selector { dimension: String, value: String },
    In { dimension: String, values: Vec<String> },
    And(Vec<DimFilter>),
    Or(Vec<DimFilter>),
    Not(Box<DimFilter>),
}

impl DimFilter {
    pub fn selector(dimension: impl Into<String>, value: impl Into<String>) -> Self {
        DimFilter::Selector {
            dimension: dimension.into(),
            value: value.into(),
        }
    }

    /// Evaluate the filter against a row
    pub fn matches(&self, row: &ResultRow) -> bool {
        match self {
            DimFilter::Selector { dimension, value } => {
                matches!(row.get(dimension), Some(Value::String(v)) if v == value)
            }
            DimFilter::In { dimension, values } => {
                matches!(row.get(dimension), Some(Value::String(v)) if values.contains(v))
            }
            DimFilter::And(filters) => filters.iter().all(|f| f.matches(row)),
            DimFilter::Or(filters) => filters.iter().any(|f| f.matches(row)),
            DimFilter::Not(filter) => !filter.matches(row),
        }
    }
}

impl Cacheable for DimFilter {
    fn cache_key(&self) -> Vec<u8> {
        match self {
            DimFilter::Selector { dimension, value } => CacheKeyBuilder::new(0)
                .append_string(dimension)
                .append_string(value)
                .build(),
            DimFilter::In { dimension, values } => {
                let mut sorted = values.clone();
                sorted.sort();
                CacheKeyBuilder::new(1)
                    .append_string(dimension)
                    .append_strings(sorted.as_slice())
                    .build()
            }
            DimFilter::And(filters) => CacheKeyBuilder::new(2).append_cacheables(filters.as_slice()).build(),
            DimFilter::Or(filters) => CacheKeyBuilder::new(3).append_cacheables(filters.as_slice()).build(),
            DimFilter::Not(filter) => CacheKeyBuilder::new(4)
                .append_cacheable(filter.as_ref())
                .build(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanOrder {
    None,
    Ascending,
    Descending,
}

/// Type-specific part of a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryKind {
    Timeseries {
        granularity: Granularity,
        aggregators: Vec<Aggregator>,
        post_aggregators: Vec<PostAggregator>,
        descending: bool,
    },
    GroupBy {
        granularity: Granularity,
        dimensions: Vec<String>,
        aggregators: Vec<Aggregator>,
        post_aggregators: Vec<PostAggregator>,
    },
    Scan {
        columns: Vec<String>,
        order: ScanOrder,
    },
}

/// Per-query overrides of broker configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryContext {
    pub use_cache: Option<bool>,
    pub populate_cache: Option<bool>,
    /// Timeout in milliseconds
    pub timeout: Option<u64>,
    pub parallel_merge: Option<bool>,
    pub parallelism: Option<usize>,
    pub allow_partial_results: Option<bool>,
    pub uncovered_intervals_limit: Option<usize>,
    pub if_none_match: Option<String>,
    /// Lowers the broker's limit on bytes gathered from data servers
    pub max_scatter_gather_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub id: QueryId,
    pub datasource: String,
    pub intervals: Vec<Interval>,
    pub filter: Option<DimFilter>,
    pub kind: QueryKind,
    pub limit: Option<usize>,
    pub context: QueryContext,
}

impl Query {
    fn new(datasource: impl Into<String>, intervals: Vec<Interval>, kind: QueryKind) -> Self {
        Self {
            id: QueryId::new(),
            datasource: datasource.into(),
            intervals,
            filter: None,
            kind,
            limit: None,
            context: QueryContext::default(),
        }
    }

    /// Create a timeseries query with `All` granularity
    pub fn timeseries(
        datasource: impl Into<String>,
        intervals: Vec<Interval>,
        aggregators: Vec<Aggregator>,
    ) -> Self {
        Self::new(
            datasource,
            intervals,
            QueryKind::Timeseries {
                granularity: Granularity::All,
                aggregators,
                post_aggregators: Vec::new(),
                descending: false,
            },
        )
    }

    /// Create a group-by query with `All` granularity
    pub fn group_by(
        datasource: impl Into<String>,
        intervals: Vec<Interval>,
        dimensions: Vec<String>,
        aggregators: Vec<Aggregator>,
    ) -> Self {
        Self::new(
            datasource,
            intervals,
            QueryKind::GroupBy {
                granularity: Granularity::All,
                dimensions,
                aggregators,
                post_aggregators: Vec::new(),
            },
        )
    }

    /// Create an unordered scan query
    pub fn scan(datasource: impl Into<String>, intervals: Vec<Interval>, columns: Vec<String>) -> Self {
        Self::new(
            datasource,
            intervals,
            QueryKind::Scan {
                columns,
                order: ScanOrder::None,
            },
        )
    }

    pub fn with_filter(mut self, filter: DimFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_context(mut self, context: QueryContext) -> Self {
        self.context = context;
        self
    }

    /// Set the granularity; ignored by scans
    pub fn with_granularity(mut self, value: Granularity) -> Self {
        match &mut self.kind {
            QueryKind::Timeseries { granularity, .. } | QueryKind::GroupBy { granularity, .. } => {
                *granularity = value;
            }
            QueryKind::Scan { .. } => {}
        }
        self
    }

    /// Add a post-aggregator; ignored by scans
    pub fn with_post_aggregator(mut self, post: PostAggregator) -> Self {
        match &mut self.kind {
            QueryKind::Timeseries {
                post_aggregators, ..
            }
            | QueryKind::GroupBy {
                post_aggregators, ..
            } => post_aggregators.push(post),
            QueryKind::Scan { .. } => {}
        }
        self
    }

    /// Reverse time order of a timeseries query
    pub fn with_descending(mut self, value: bool) -> Self {
        if let QueryKind::Timeseries { descending, .. } = &mut self.kind {
            *descending = value;
        }
        self
    }

    /// Set the time order of a scan query
    pub fn with_order(mut self, value: ScanOrder) -> Self {
        if let QueryKind::Scan { order, .. } = &mut self.kind {
            *order = value;
        }
        self
    }

    pub fn query_type(&self) -> QueryType {
        match self.kind {
            QueryKind::Timeseries { .. } => QueryType::Timeseries,
            QueryKind::GroupBy { .. } => QueryType::GroupBy,
            QueryKind::Scan { .. } => QueryType::Scan,
        }
    }

    /// Aggregators of an aggregating query, empty for scans
    pub fn aggregators(&self) -> &[Aggregator] {
        match &self.kind {
            QueryKind::Timeseries { aggregators, .. } | QueryKind::GroupBy { aggregators, .. } => {
                aggregators
            }
            QueryKind::Scan { .. } => &[],
        }
    }

    /// Check that the query is well formed
    pub fn validate(&self) -> Result<()> {
        if self.datasource.is_empty() {
            return Err(QueryError::InvalidQuery("datasource is empty".to_string()));
        }
        if self.intervals.is_empty() {
            return Err(QueryError::InvalidQuery("no intervals".to_string()));
        }
        for interval in &self.intervals {
            Interval::try_new(interval.start, interval.end)?;
        }

        let mut names: Vec<&str> = self.aggregators().iter().map(|a| a.name.as_str()).collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(QueryError::InvalidQuery(format!(
                "duplicate aggregator name '{}'",
                dup[0]
            )));
        }
        Ok(())
    }
}
