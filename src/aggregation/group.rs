// src/aggregation/group.rs
// $group and the bucket stages. Accumulators fold document-by-document;
// group keys are canonical-key strings so numeric types unify and the
// active collation folds string keys. Emission is first-occurrence order,
// which callers must not rely on.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use bson::{Bson, Document};

use crate::collation::Collation;
use crate::error::{Result, SiftError};
use crate::expr::{EvalCtx, Expression};
use crate::options::Options;
use crate::value::{canonical_key, cmp_bson_collated, eq_bson_collated, numeric_value};

use super::{blocking, DocStream};

// ---------------------------------------------------------------------------
// Welford online variance
// ---------------------------------------------------------------------------

/// Streaming mean/variance state, shared with the expression-side
/// $stdDevPop/$stdDevSamp and $setWindowFields.
#[derive(Debug, Clone, Default)]
pub struct Welford {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Welford {
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    /// Standard deviation, or `None` when under-populated (0 values for
    /// population, fewer than 2 for sample).
    pub fn finish(&self, sample: bool) -> Option<f64> {
        if sample {
            if self.count < 2 {
                return None;
            }
            Some((self.m2 / (self.count - 1) as f64).sqrt())
        } else {
            if self.count == 0 {
                return None;
            }
            Some((self.m2 / self.count as f64).sqrt())
        }
    }
}

// ---------------------------------------------------------------------------
// Accumulators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumOp {
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    Push,
    AddToSet,
    StdDevPop,
    StdDevSamp,
    MergeObjects,
    Count,
}

impl AccumOp {
    pub fn parse(name: &str) -> Option<AccumOp> {
        Some(match name {
            "$sum" => AccumOp::Sum,
            "$avg" => AccumOp::Avg,
            "$min" => AccumOp::Min,
            "$max" => AccumOp::Max,
            "$first" => AccumOp::First,
            "$last" => AccumOp::Last,
            "$push" => AccumOp::Push,
            "$addToSet" => AccumOp::AddToSet,
            "$stdDevPop" => AccumOp::StdDevPop,
            "$stdDevSamp" => AccumOp::StdDevSamp,
            "$mergeObjects" => AccumOp::MergeObjects,
            "$count" => AccumOp::Count,
            _ => return None,
        })
    }
}

/// One named accumulator in a $group / $bucket output spec.
#[derive(Debug, Clone)]
pub struct Accumulator {
    pub field: String,
    pub op: AccumOp,
    pub expr: Option<Expression>,
}

impl Accumulator {
    pub fn parse(field: &str, spec: &Bson, options: &Options) -> Result<Self> {
        let spec = spec.as_document().ok_or_else(|| {
            SiftError::AggregationError(format!(
                "accumulator for {} must be a document",
                field
            ))
        })?;
        if spec.len() != 1 {
            return Err(SiftError::AggregationError(format!(
                "accumulator for {} must have exactly one operator",
                field
            )));
        }
        let (op_name, operand) = spec.iter().next().expect("len checked");
        let op = AccumOp::parse(op_name).ok_or_else(|| {
            SiftError::AggregationError(format!("unknown accumulator: {}", op_name))
        })?;

        let expr = if op == AccumOp::Count {
            match operand.as_document() {
                Some(empty) if empty.is_empty() => None,
                _ => {
                    return Err(SiftError::AggregationError(
                        "$count takes an empty document".into(),
                    ))
                }
            }
        } else {
            Some(Expression::parse(operand, options)?)
        };
        Ok(Accumulator {
            field: field.to_string(),
            op,
            expr,
        })
    }

    pub fn fresh_state(&self) -> AccumState {
        AccumState::new(self.op)
    }

    /// Evaluate this accumulator's expression for one document.
    pub fn value_for(&self, ctx: &EvalCtx<'_>) -> Result<Option<Bson>> {
        match &self.expr {
            Some(expr) => ctx.compute_opt(expr),
            None => Ok(None),
        }
    }
}

/// Per-group running state for one accumulator.
#[derive(Debug, Clone)]
pub enum AccumState {
    Sum {
        int: i64,
        float: f64,
        saw_float: bool,
    },
    Avg {
        sum: f64,
        count: u64,
    },
    Extremum {
        keep: Ordering,
        best: Option<Bson>,
    },
    First {
        seen: bool,
        value: Option<Bson>,
    },
    Last {
        value: Option<Bson>,
    },
    Push(Vec<Bson>),
    AddToSet {
        seen: HashSet<String>,
        items: Vec<Bson>,
    },
    StdDev {
        sample: bool,
        welford: Welford,
    },
    Merge(Document),
    Count(i64),
}

impl AccumState {
    pub fn new(op: AccumOp) -> Self {
        match op {
            AccumOp::Sum => AccumState::Sum {
                int: 0,
                float: 0.0,
                saw_float: false,
            },
            AccumOp::Avg => AccumState::Avg { sum: 0.0, count: 0 },
            AccumOp::Min => AccumState::Extremum {
                keep: Ordering::Less,
                best: None,
            },
            AccumOp::Max => AccumState::Extremum {
                keep: Ordering::Greater,
                best: None,
            },
            AccumOp::First => AccumState::First {
                seen: false,
                value: None,
            },
            AccumOp::Last => AccumState::Last { value: None },
            AccumOp::Push => AccumState::Push(Vec::new()),
            AccumOp::AddToSet => AccumState::AddToSet {
                seen: HashSet::new(),
                items: Vec::new(),
            },
            AccumOp::StdDevPop => AccumState::StdDev {
                sample: false,
                welford: Welford::default(),
            },
            AccumOp::StdDevSamp => AccumState::StdDev {
                sample: true,
                welford: Welford::default(),
            },
            AccumOp::MergeObjects => AccumState::Merge(Document::new()),
            AccumOp::Count => AccumState::Count(0),
        }
    }

    /// Fold one evaluated value (None = missing) into the state.
    pub fn update(&mut self, value: Option<Bson>, collation: Option<&Collation>) -> Result<()> {
        match self {
            AccumState::Sum {
                int,
                float,
                saw_float,
            } => {
                // Non-numeric values are ignored.
                match value {
                    Some(Bson::Int32(n)) => fold_int(int, float, saw_float, n as i64),
                    Some(Bson::Int64(n)) => fold_int(int, float, saw_float, n),
                    Some(ref v) => {
                        if let Some(f) = numeric_value(v) {
                            *float += f;
                            *saw_float = true;
                        }
                    }
                    None => {}
                }
            }
            AccumState::Avg { sum, count } => {
                if let Some(f) = value.as_ref().and_then(numeric_value) {
                    *sum += f;
                    *count += 1;
                }
            }
            AccumState::Extremum { keep, best } => {
                if let Some(v) = value {
                    if matches!(v, Bson::Null | Bson::Undefined) {
                        return Ok(());
                    }
                    let better = match best {
                        None => true,
                        Some(current) => cmp_bson_collated(&v, current, collation) == *keep,
                    };
                    if better {
                        *best = Some(v);
                    }
                }
            }
            AccumState::First { seen, value: slot } => {
                if !*seen {
                    *seen = true;
                    *slot = value;
                }
            }
            AccumState::Last { value: slot } => *slot = value,
            AccumState::Push(items) => {
                if let Some(v) = value {
                    items.push(v);
                }
            }
            AccumState::AddToSet { seen, items } => {
                if let Some(v) = value {
                    if seen.insert(canonical_key(&v, collation)) {
                        items.push(v);
                    }
                }
            }
            AccumState::StdDev { welford, .. } => {
                if let Some(f) = value.as_ref().and_then(numeric_value) {
                    welford.push(f);
                }
            }
            AccumState::Merge(merged) => match value {
                Some(Bson::Document(doc)) => {
                    for (key, val) in doc {
                        merged.insert(key, val);
                    }
                }
                Some(Bson::Null) | Some(Bson::Undefined) | None => {}
                Some(other) => {
                    return Err(SiftError::type_mismatch(
                        "$mergeObjects",
                        format!("expected a document, got {:?}", other),
                    ))
                }
            },
            AccumState::Count(count) => *count += 1,
        }
        Ok(())
    }

    /// Final value; `None` omits the output key (a `$first` of a missing
    /// field stays missing).
    pub fn finalize(self) -> Option<Bson> {
        match self {
            AccumState::Sum {
                int,
                float,
                saw_float,
            } => Some(if saw_float {
                Bson::Double(float + int as f64)
            } else {
                Bson::Int64(int)
            }),
            AccumState::Avg { sum, count } => Some(if count == 0 {
                Bson::Null
            } else {
                Bson::Double(sum / count as f64)
            }),
            AccumState::Extremum { best, .. } => Some(best.unwrap_or(Bson::Null)),
            AccumState::First { value, .. } => value,
            AccumState::Last { value } => value,
            AccumState::Push(items) => Some(Bson::Array(items)),
            AccumState::AddToSet { items, .. } => Some(Bson::Array(items)),
            AccumState::StdDev { sample, welford } => Some(
                welford
                    .finish(sample)
                    .map(Bson::Double)
                    .unwrap_or(Bson::Null),
            ),
            AccumState::Merge(merged) => Some(Bson::Document(merged)),
            AccumState::Count(count) => Some(Bson::Int64(count)),
        }
    }
}

fn fold_int(int: &mut i64, float: &mut f64, saw_float: &mut bool, n: i64) {
    match int.checked_add(n) {
        Some(sum) => *int = sum,
        None => {
            *float += n as f64;
            *saw_float = true;
        }
    }
}

// ---------------------------------------------------------------------------
// $group
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub id: Expression,
    pub accumulators: Vec<Accumulator>,
}

impl GroupSpec {
    pub fn parse(spec: &Document, options: &Options) -> Result<Self> {
        let id_value = spec
            .get("_id")
            .ok_or_else(|| SiftError::AggregationError("$group requires _id".into()))?;
        let id = Expression::parse(id_value, options)?;

        let mut accumulators = Vec::new();
        for (field, value) in spec.iter() {
            if field == "_id" {
                continue;
            }
            accumulators.push(Accumulator::parse(field, value, options)?);
        }
        Ok(GroupSpec { id, accumulators })
    }
}

struct GroupState {
    id: Bson,
    states: Vec<AccumState>,
}

pub(crate) fn apply_group<'a>(
    input: DocStream<'a>,
    spec: &'a GroupSpec,
    options: &'a Options,
) -> DocStream<'a> {
    blocking(input, move |buffered| {
        let collation = options.collation();
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, GroupState> = HashMap::new();

        for doc in &buffered {
            let ctx = EvalCtx::new(doc.as_ref(), options);
            // A missing _id expression folds to null, like the server.
            let id = ctx.compute_opt(&spec.id)?.unwrap_or(Bson::Null);
            let key = canonical_key(&id, collation);

            let state = groups.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                GroupState {
                    id,
                    states: spec
                        .accumulators
                        .iter()
                        .map(Accumulator::fresh_state)
                        .collect(),
                }
            });
            for (accumulator, accum_state) in
                spec.accumulators.iter().zip(state.states.iter_mut())
            {
                accum_state.update(accumulator.value_for(&ctx)?, collation)?;
            }
        }

        let mut out = Vec::with_capacity(order.len());
        for key in order {
            let state = groups.remove(&key).expect("group recorded");
            let mut doc = Document::new();
            doc.insert("_id", state.id);
            for (accumulator, accum_state) in
                spec.accumulators.iter().zip(state.states.into_iter())
            {
                if let Some(value) = accum_state.finalize() {
                    doc.insert(accumulator.field.clone(), value);
                }
            }
            out.push(Cow::Owned(doc));
        }
        Ok(out)
    })
}

// ---------------------------------------------------------------------------
// $sortByCount
// ---------------------------------------------------------------------------

pub(crate) fn apply_sort_by_count<'a>(
    input: DocStream<'a>,
    expr: &'a Expression,
    options: &'a Options,
) -> DocStream<'a> {
    blocking(input, move |buffered| {
        let collation = options.collation();
        let mut order: Vec<String> = Vec::new();
        let mut counts: HashMap<String, (Bson, i64)> = HashMap::new();
        for doc in &buffered {
            let ctx = EvalCtx::new(doc.as_ref(), options);
            let id = ctx.compute_opt(expr)?.unwrap_or(Bson::Null);
            let key = canonical_key(&id, collation);
            let entry = counts.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                (id, 0)
            });
            entry.1 += 1;
        }

        let mut grouped: Vec<(Bson, i64)> = order
            .into_iter()
            .map(|key| counts.remove(&key).expect("group recorded"))
            .collect();
        // Stable: equal counts keep first-occurrence order.
        grouped.sort_by(|a, b| b.1.cmp(&a.1));

        Ok(grouped
            .into_iter()
            .map(|(id, count)| {
                let mut doc = Document::new();
                doc.insert("_id", id);
                doc.insert("count", Bson::Int64(count));
                Cow::Owned(doc)
            })
            .collect())
    })
}

// ---------------------------------------------------------------------------
// $bucket
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BucketSpec {
    pub group_by: Expression,
    pub boundaries: Vec<Bson>,
    pub default: Option<Bson>,
    pub output: Vec<Accumulator>,
}

impl BucketSpec {
    pub fn parse(spec: &Document, options: &Options) -> Result<Self> {
        for key in spec.keys() {
            if !matches!(key.as_str(), "groupBy" | "boundaries" | "default" | "output") {
                return Err(SiftError::AggregationError(format!(
                    "$bucket: unknown option {}",
                    key
                )));
            }
        }
        let group_by = Expression::parse(
            spec.get("groupBy").ok_or_else(|| {
                SiftError::AggregationError("$bucket requires groupBy".into())
            })?,
            options,
        )?;
        let boundaries = spec
            .get_array("boundaries")
            .map_err(|_| SiftError::AggregationError("$bucket requires boundaries".into()))?
            .clone();
        if boundaries.len() < 2 {
            return Err(SiftError::AggregationError(
                "$bucket requires at least 2 boundaries".into(),
            ));
        }
        for pair in boundaries.windows(2) {
            if cmp_bson_collated(&pair[0], &pair[1], None) != Ordering::Less {
                return Err(SiftError::AggregationError(
                    "$bucket boundaries must be strictly ascending".into(),
                ));
            }
        }
        let default = spec.get("default").cloned();
        let output = parse_output(spec.get("output"), options)?;
        Ok(BucketSpec {
            group_by,
            boundaries,
            default,
            output,
        })
    }
}

/// `output` spec shared by the bucket stages; defaults to a count.
fn parse_output(spec: Option<&Bson>, options: &Options) -> Result<Vec<Accumulator>> {
    match spec {
        None => Ok(vec![Accumulator {
            field: "count".to_string(),
            op: AccumOp::Sum,
            expr: Some(Expression::Literal(Bson::Int32(1))),
        }]),
        Some(Bson::Document(fields)) => fields
            .iter()
            .map(|(field, value)| Accumulator::parse(field, value, options))
            .collect(),
        Some(_) => Err(SiftError::AggregationError(
            "output must be a document".into(),
        )),
    }
}

pub(crate) fn apply_bucket<'a>(
    input: DocStream<'a>,
    spec: &'a BucketSpec,
    options: &'a Options,
) -> DocStream<'a> {
    blocking(input, move |buffered| {
        let collation = options.collation();
        let bucket_count = spec.boundaries.len() - 1;
        // One slot per boundary bucket, plus the default at the end.
        let mut states: Vec<Option<Vec<AccumState>>> = vec![None; bucket_count + 1];

        for doc in &buffered {
            let ctx = EvalCtx::new(doc.as_ref(), options);
            let key = ctx.compute_opt(&spec.group_by)?.unwrap_or(Bson::Null);

            let slot = (0..bucket_count)
                .find(|&i| {
                    cmp_bson_collated(&key, &spec.boundaries[i], collation) != Ordering::Less
                        && cmp_bson_collated(&key, &spec.boundaries[i + 1], collation)
                            == Ordering::Less
                })
                .or_else(|| spec.default.is_some().then_some(bucket_count));
            let Some(slot) = slot else {
                return Err(SiftError::AggregationError(format!(
                    "$bucket: value {:?} does not fall into any bucket and no default was given",
                    key
                )));
            };

            let states = states[slot].get_or_insert_with(|| {
                spec.output.iter().map(Accumulator::fresh_state).collect()
            });
            for (accumulator, state) in spec.output.iter().zip(states.iter_mut()) {
                state.update(accumulator.value_for(&ctx)?, collation)?;
            }
        }

        let mut out = Vec::new();
        for (slot, slot_states) in states.into_iter().enumerate() {
            let Some(slot_states) = slot_states else { continue };
            let id = if slot == bucket_count {
                spec.default.clone().expect("default slot only when set")
            } else {
                spec.boundaries[slot].clone()
            };
            let mut doc = Document::new();
            doc.insert("_id", id);
            for (accumulator, state) in spec.output.iter().zip(slot_states.into_iter()) {
                if let Some(value) = state.finalize() {
                    doc.insert(accumulator.field.clone(), value);
                }
            }
            out.push(Cow::Owned(doc));
        }
        Ok(out)
    })
}

// ---------------------------------------------------------------------------
// $bucketAuto
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BucketAutoSpec {
    pub group_by: Expression,
    pub buckets: usize,
    pub output: Vec<Accumulator>,
}

impl BucketAutoSpec {
    pub fn parse(spec: &Document, options: &Options) -> Result<Self> {
        for key in spec.keys() {
            match key.as_str() {
                "groupBy" | "buckets" | "output" => {}
                "granularity" => {
                    return Err(SiftError::Unsupported(
                        "$bucketAuto granularity is not supported".into(),
                    ))
                }
                other => {
                    return Err(SiftError::AggregationError(format!(
                        "$bucketAuto: unknown option {}",
                        other
                    )))
                }
            }
        }
        let group_by = Expression::parse(
            spec.get("groupBy").ok_or_else(|| {
                SiftError::AggregationError("$bucketAuto requires groupBy".into())
            })?,
            options,
        )?;
        let buckets = match spec.get("buckets") {
            Some(Bson::Int32(n)) if *n > 0 => *n as usize,
            Some(Bson::Int64(n)) if *n > 0 => *n as usize,
            Some(Bson::Double(f)) if f.fract() == 0.0 && *f > 0.0 => *f as usize,
            _ => {
                return Err(SiftError::AggregationError(
                    "$bucketAuto requires a positive integer bucket count".into(),
                ))
            }
        };
        let output = parse_output(spec.get("output"), options)?;
        Ok(BucketAutoSpec {
            group_by,
            buckets,
            output,
        })
    }
}

pub(crate) fn apply_bucket_auto<'a>(
    input: DocStream<'a>,
    spec: &'a BucketAutoSpec,
    options: &'a Options,
) -> DocStream<'a> {
    blocking(input, move |buffered| {
        let collation = options.collation();

        // Compute each document's key once, then sort stably by key.
        let mut null_docs: Vec<Cow<'_, Document>> = Vec::new();
        let mut keyed: Vec<(Bson, Cow<'_, Document>)> = Vec::new();
        for doc in buffered {
            let key = {
                let ctx = EvalCtx::new(doc.as_ref(), options);
                ctx.compute_opt(&spec.group_by)?
            };
            match key {
                None | Some(Bson::Null) => null_docs.push(doc),
                Some(key) => keyed.push((key, doc)),
            }
        }
        keyed.sort_by(|a, b| cmp_bson_collated(&a.0, &b.0, collation));

        // Null/missing keys form their own bucket at the low end; it
        // counts toward the requested bucket total.
        let mut chunks: Vec<(Bson, Vec<Cow<'_, Document>>)> = Vec::new();
        if !null_docs.is_empty() {
            chunks.push((Bson::Null, null_docs));
        }
        let value_buckets = spec.buckets.saturating_sub(chunks.len()).max(1);

        let mut index = 0usize;
        let mut built = 0usize;
        while index < keyed.len() {
            let buckets_left = value_buckets.saturating_sub(built).max(1);
            let remaining = keyed.len() - index;
            let size = remaining.div_ceil(buckets_left);
            let mut end = (index + size).min(keyed.len());
            // Equal keys never span buckets: extend until the key changes.
            while end < keyed.len()
                && eq_bson_collated(&keyed[end].0, &keyed[end - 1].0, collation)
            {
                end += 1;
            }
            let chunk_docs: Vec<_> = keyed[index..end].iter().map(|(_, d)| d.clone()).collect();
            chunks.push((keyed[index].0.clone(), chunk_docs));
            index = end;
            built += 1;
        }

        // _id = {min, max}: max chains to the next bucket's min; the last
        // bucket's max is the greatest key observed.
        let greatest = keyed.last().map(|(key, _)| key.clone());
        let mut out = Vec::with_capacity(chunks.len());
        for (chunk_index, (min, docs)) in chunks.iter().enumerate() {
            let max = if chunk_index + 1 < chunks.len() {
                chunks[chunk_index + 1].0.clone()
            } else {
                greatest.clone().unwrap_or(Bson::Null)
            };

            let mut states: Vec<AccumState> =
                spec.output.iter().map(Accumulator::fresh_state).collect();
            for doc in docs {
                let ctx = EvalCtx::new(doc.as_ref(), options);
                for (accumulator, state) in spec.output.iter().zip(states.iter_mut()) {
                    state.update(accumulator.value_for(&ctx)?, collation)?;
                }
            }

            let mut id = Document::new();
            id.insert("min", min.clone());
            id.insert("max", max);
            let mut doc = Document::new();
            doc.insert("_id", Bson::Document(id));
            for (accumulator, state) in spec.output.iter().zip(states.into_iter()) {
                if let Some(value) = state.finalize() {
                    doc.insert(accumulator.field.clone(), value);
                }
            }
            out.push(Cow::Owned(doc));
        }
        Ok(out)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::Aggregator;
    use bson::doc;

    fn run(pipeline: &[Document], docs: Vec<Document>) -> Vec<Document> {
        Aggregator::new(pipeline, Options::default())
            .unwrap()
            .run(&docs)
            .unwrap()
    }

    #[test]
    fn test_group_sum_by_key() {
        let got = run(
            &[doc! {"$group": {"_id": "$k", "s": {"$sum": "$v"}}}],
            vec![
                doc! {"k": 1, "v": 10},
                doc! {"k": 1, "v": 20},
                doc! {"k": 2, "v": 30},
            ],
        );
        assert_eq!(got.len(), 2);
        let by_id = |id: i32| {
            got.iter()
                .find(|d| d.get("_id") == Some(&Bson::Int32(id)))
                .unwrap()
                .clone()
        };
        assert_eq!(by_id(1).get_i64("s").unwrap(), 30);
        assert_eq!(by_id(2).get_i64("s").unwrap(), 30);
    }

    #[test]
    fn test_group_null_id_spans_all() {
        let got = run(
            &[doc! {"$group": {"_id": Bson::Null, "n": {"$count": {}}, "avg": {"$avg": "$v"}}}],
            vec![doc! {"v": 1}, doc! {"v": 2}, doc! {"v": 3}],
        );
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].get_i64("n").unwrap(), 3);
        assert_eq!(got[0].get_f64("avg").unwrap(), 2.0);
    }

    #[test]
    fn test_group_numeric_keys_unify() {
        // Int64(1) and Double(1.0) land in one group.
        let got = run(
            &[doc! {"$group": {"_id": "$k", "n": {"$sum": 1}}}],
            vec![doc! {"k": 1_i64}, doc! {"k": 1.0}],
        );
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].get_i64("n").unwrap(), 2);
    }

    #[test]
    fn test_group_first_last_push_add_to_set() {
        let got = run(
            &[doc! {"$group": {
                "_id": Bson::Null,
                "first": {"$first": "$v"},
                "last": {"$last": "$v"},
                "all": {"$push": "$v"},
                "distinct": {"$addToSet": "$v"}
            }}],
            vec![doc! {"v": 1}, doc! {"v": 2}, doc! {"v": 1}],
        );
        assert_eq!(got[0].get("first"), Some(&Bson::Int32(1)));
        assert_eq!(got[0].get("last"), Some(&Bson::Int32(1)));
        assert_eq!(
            got[0].get_array("all").unwrap(),
            &vec![Bson::Int32(1), Bson::Int32(2), Bson::Int32(1)]
        );
        assert_eq!(
            got[0].get_array("distinct").unwrap(),
            &vec![Bson::Int32(1), Bson::Int32(2)]
        );
    }

    #[test]
    fn test_group_std_dev() {
        let got = run(
            &[doc! {"$group": {"_id": Bson::Null, "sd": {"$stdDevPop": "$v"}}}],
            vec![
                doc! {"v": 2},
                doc! {"v": 4},
                doc! {"v": 4},
                doc! {"v": 4},
                doc! {"v": 5},
                doc! {"v": 5},
                doc! {"v": 7},
                doc! {"v": 9},
            ],
        );
        let sd = got[0].get_f64("sd").unwrap();
        assert!((sd - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_group_merge_objects() {
        let got = run(
            &[doc! {"$group": {"_id": Bson::Null, "merged": {"$mergeObjects": "$d"}}}],
            vec![doc! {"d": {"a": 1, "b": 1}}, doc! {"d": {"b": 2}}],
        );
        assert_eq!(
            got[0].get_document("merged").unwrap(),
            &doc! {"a": 1, "b": 2}
        );
    }

    #[test]
    fn test_group_requires_id() {
        assert!(Aggregator::new(
            &[doc! {"$group": {"n": {"$sum": 1}}}],
            Options::default()
        )
        .is_err());
    }

    #[test]
    fn test_group_unknown_accumulator() {
        assert!(Aggregator::new(
            &[doc! {"$group": {"_id": Bson::Null, "n": {"$frob": 1}}}],
            Options::default()
        )
        .is_err());
    }

    #[test]
    fn test_sort_by_count() {
        let got = run(
            &[doc! {"$sortByCount": "$tag"}],
            vec![
                doc! {"tag": "a"},
                doc! {"tag": "b"},
                doc! {"tag": "a"},
                doc! {"tag": "a"},
                doc! {"tag": "b"},
            ],
        );
        assert_eq!(got[0].get("_id"), Some(&Bson::String("a".into())));
        assert_eq!(got[0].get_i64("count").unwrap(), 3);
        assert_eq!(got[1].get_i64("count").unwrap(), 2);
    }

    #[test]
    fn test_bucket_with_default() {
        let got = run(
            &[doc! {"$bucket": {
                "groupBy": "$score",
                "boundaries": [0, 50, 100],
                "default": "offscale",
                "output": {"n": {"$sum": 1}, "scores": {"$push": "$score"}}
            }}],
            vec![
                doc! {"score": 10},
                doc! {"score": 55},
                doc! {"score": 49},
                doc! {"score": 200},
            ],
        );
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].get("_id"), Some(&Bson::Int32(0)));
        assert_eq!(got[0].get_i64("n").unwrap(), 2);
        assert_eq!(got[1].get("_id"), Some(&Bson::Int32(50)));
        assert_eq!(got[2].get("_id"), Some(&Bson::String("offscale".into())));
    }

    #[test]
    fn test_bucket_without_default_errors_on_stray() {
        let aggregator = Aggregator::new(
            &[doc! {"$bucket": {"groupBy": "$v", "boundaries": [0, 10]}}],
            Options::default(),
        )
        .unwrap();
        assert!(aggregator.run(&[doc! {"v": 99}]).is_err());
    }

    #[test]
    fn test_bucket_boundary_validation() {
        assert!(Aggregator::new(
            &[doc! {"$bucket": {"groupBy": "$v", "boundaries": [10, 0]}}],
            Options::default()
        )
        .is_err());
        assert!(Aggregator::new(
            &[doc! {"$bucket": {"groupBy": "$v", "boundaries": [1]}}],
            Options::default()
        )
        .is_err());
    }

    #[test]
    fn test_bucket_auto_chains_boundaries() {
        let docs: Vec<Document> = (1..=6).map(|i| doc! {"_id": i}).collect();
        let got = run(
            &[doc! {"$bucketAuto": {"groupBy": "$_id", "buckets": 3}}],
            docs,
        );
        assert_eq!(got.len(), 3);
        let id = |i: usize| got[i].get_document("_id").unwrap();
        assert_eq!(id(0).get("min"), Some(&Bson::Int32(1)));
        assert_eq!(id(0).get("max"), id(1).get("min"));
        assert_eq!(id(1).get("max"), id(2).get("min"));
        assert_eq!(id(2).get("max"), Some(&Bson::Int32(6)));
        let total: i64 = got.iter().map(|d| d.get_i64("count").unwrap()).sum();
        assert_eq!(total, 6);
    }

    #[test]
    fn test_bucket_auto_equal_keys_stay_together() {
        let docs = vec![
            doc! {"k": 1},
            doc! {"k": 1},
            doc! {"k": 1},
            doc! {"k": 2},
        ];
        let got = run(
            &[doc! {"$bucketAuto": {"groupBy": "$k", "buckets": 2}}],
            docs,
        );
        // The run of equal keys cannot split: first bucket takes all three.
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].get_i64("count").unwrap(), 3);
        assert_eq!(got[1].get_i64("count").unwrap(), 1);
    }

    #[test]
    fn test_bucket_auto_null_bucket_at_low_end() {
        let got = run(
            &[doc! {"$bucketAuto": {"groupBy": "$k", "buckets": 3}}],
            vec![doc! {"k": 5}, doc! {}, doc! {"k": 7}],
        );
        let first_id = got[0].get_document("_id").unwrap();
        assert_eq!(first_id.get("min"), Some(&Bson::Null));
        assert_eq!(got[0].get_i64("count").unwrap(), 1);
    }

    #[test]
    fn test_bucket_auto_validation() {
        assert!(Aggregator::new(
            &[doc! {"$bucketAuto": {"groupBy": "$v", "buckets": 0}}],
            Options::default()
        )
        .is_err());
        assert!(Aggregator::new(
            &[doc! {"$bucketAuto": {"groupBy": "$v"}}],
            Options::default()
        )
        .is_err());
    }
}
