// src/aggregation/window.rs
// $setWindowFields: partition, sort, then compute window-framed values per
// document. Accumulator outputs reuse the $group fold states over a
// documents-frame; the rank family and $shift are positional.

use std::borrow::Cow;
use std::collections::HashMap;

use bson::{Bson, Document};

use crate::error::{Result, SiftError};
use crate::expr::{EvalCtx, Expression};
use crate::options::Options;
use crate::value::{self, canonical_key};

use super::group::{AccumOp, AccumState};
use super::sort::SortSpec;
use super::{blocking, DocStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameBound {
    Unbounded,
    Current,
    Offset(i64),
}

#[derive(Debug, Clone, Copy)]
pub struct DocumentFrame {
    pub lower: FrameBound,
    pub upper: FrameBound,
}

#[derive(Debug, Clone)]
pub enum WindowOp {
    /// One of the $group accumulators over a documents frame.
    Accumulate {
        op: AccumOp,
        expr: Option<Expression>,
        frame: Option<DocumentFrame>,
    },
    DocumentNumber,
    Rank,
    DenseRank,
    Shift {
        output: Expression,
        by: i64,
        default: Option<Expression>,
    },
}

#[derive(Debug, Clone)]
pub struct WindowOutput {
    pub field: String,
    pub op: WindowOp,
}

#[derive(Debug, Clone)]
pub struct WindowSpec {
    pub partition_by: Option<Expression>,
    pub sort_by: Option<SortSpec>,
    pub output: Vec<WindowOutput>,
}

impl WindowSpec {
    pub fn parse(spec: &Document, options: &Options) -> Result<Self> {
        for key in spec.keys() {
            if !matches!(key.as_str(), "partitionBy" | "sortBy" | "output") {
                return Err(SiftError::AggregationError(format!(
                    "$setWindowFields: unknown option {}",
                    key
                )));
            }
        }
        let partition_by = match spec.get("partitionBy") {
            Some(value) => Some(Expression::parse(value, options)?),
            None => None,
        };
        let sort_by = match spec.get("sortBy") {
            Some(Bson::Document(sort_doc)) => Some(SortSpec::parse(sort_doc)?),
            Some(_) => {
                return Err(SiftError::AggregationError(
                    "$setWindowFields sortBy must be a document".into(),
                ))
            }
            None => None,
        };
        let output_spec = spec.get_document("output").map_err(|_| {
            SiftError::AggregationError("$setWindowFields requires output".into())
        })?;
        if output_spec.is_empty() {
            return Err(SiftError::AggregationError(
                "$setWindowFields output must not be empty".into(),
            ));
        }

        let mut output = Vec::with_capacity(output_spec.len());
        for (field, op_spec) in output_spec.iter() {
            let op = parse_window_op(field, op_spec, sort_by.is_some(), options)?;
            output.push(WindowOutput {
                field: field.clone(),
                op,
            });
        }
        Ok(WindowSpec {
            partition_by,
            sort_by,
            output,
        })
    }
}

fn parse_window_op(
    field: &str,
    spec: &Bson,
    has_sort: bool,
    options: &Options,
) -> Result<WindowOp> {
    let spec = spec.as_document().ok_or_else(|| {
        SiftError::AggregationError(format!(
            "$setWindowFields output {} must be a document",
            field
        ))
    })?;

    let mut operator: Option<(&String, &Bson)> = None;
    let mut window: Option<&Bson> = None;
    for (key, value) in spec.iter() {
        if key == "window" {
            window = Some(value);
        } else if operator.is_none() {
            operator = Some((key, value));
        } else {
            return Err(SiftError::AggregationError(format!(
                "$setWindowFields output {} must have exactly one operator",
                field
            )));
        }
    }
    let (op_name, operand) = operator.ok_or_else(|| {
        SiftError::AggregationError(format!(
            "$setWindowFields output {} is missing an operator",
            field
        ))
    })?;

    let require_sort = |what: &str| -> Result<()> {
        if !has_sort {
            return Err(SiftError::AggregationError(format!(
                "{} requires a sortBy",
                what
            )));
        }
        Ok(())
    };
    let no_window = |what: &str| -> Result<()> {
        if window.is_some() {
            return Err(SiftError::AggregationError(format!(
                "{} does not accept a window",
                what
            )));
        }
        Ok(())
    };

    match op_name.as_str() {
        "$documentNumber" => {
            require_sort("$documentNumber")?;
            no_window("$documentNumber")?;
            Ok(WindowOp::DocumentNumber)
        }
        "$rank" => {
            require_sort("$rank")?;
            no_window("$rank")?;
            Ok(WindowOp::Rank)
        }
        "$denseRank" => {
            require_sort("$denseRank")?;
            no_window("$denseRank")?;
            Ok(WindowOp::DenseRank)
        }
        "$shift" => {
            require_sort("$shift")?;
            no_window("$shift")?;
            let operand = operand.as_document().ok_or_else(|| {
                SiftError::AggregationError("$shift requires a document".into())
            })?;
            let output = Expression::parse(
                operand.get("output").ok_or_else(|| {
                    SiftError::AggregationError("$shift requires output".into())
                })?,
                options,
            )?;
            let by = match operand.get("by") {
                Some(Bson::Int32(n)) => *n as i64,
                Some(Bson::Int64(n)) => *n,
                _ => {
                    return Err(SiftError::AggregationError(
                        "$shift requires an integer by".into(),
                    ))
                }
            };
            let default = match operand.get("default") {
                Some(value) => Some(Expression::parse(value, options)?),
                None => None,
            };
            Ok(WindowOp::Shift {
                output,
                by,
                default,
            })
        }
        accumulator => {
            let op = AccumOp::parse(accumulator).ok_or_else(|| {
                SiftError::AggregationError(format!(
                    "unknown window operator: {}",
                    accumulator
                ))
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
            let frame = match window {
                Some(window) => Some(parse_frame(window)?),
                None => None,
            };
            Ok(WindowOp::Accumulate { op, expr, frame })
        }
    }
}

fn parse_frame(window: &Bson) -> Result<DocumentFrame> {
    let window = window.as_document().ok_or_else(|| {
        SiftError::AggregationError("window must be a document".into())
    })?;
    if window.contains_key("range") || window.contains_key("unit") {
        return Err(SiftError::Unsupported(
            "range windows are not supported, use documents".into(),
        ));
    }
    let bounds = window.get_array("documents").map_err(|_| {
        SiftError::AggregationError("window requires documents: [lower, upper]".into())
    })?;
    if bounds.len() != 2 {
        return Err(SiftError::AggregationError(
            "window documents must be [lower, upper]".into(),
        ));
    }
    let parse_bound = |bound: &Bson| -> Result<FrameBound> {
        match bound {
            Bson::String(s) if s == "unbounded" => Ok(FrameBound::Unbounded),
            Bson::String(s) if s == "current" => Ok(FrameBound::Current),
            Bson::Int32(n) => Ok(FrameBound::Offset(*n as i64)),
            Bson::Int64(n) => Ok(FrameBound::Offset(*n)),
            _ => Err(SiftError::AggregationError(
                "window bounds must be \"unbounded\", \"current\" or an integer".into(),
            )),
        }
    };
    Ok(DocumentFrame {
        lower: parse_bound(&bounds[0])?,
        upper: parse_bound(&bounds[1])?,
    })
}

fn bound_index(bound: FrameBound, current: usize, len: usize, lower: bool) -> i64 {
    match bound {
        FrameBound::Unbounded => {
            if lower {
                0
            } else {
                len as i64 - 1
            }
        }
        FrameBound::Current => current as i64,
        FrameBound::Offset(offset) => current as i64 + offset,
    }
}

pub(crate) fn apply_window_fields<'a>(
    input: DocStream<'a>,
    spec: &'a WindowSpec,
    options: &'a Options,
) -> DocStream<'a> {
    blocking(input, move |buffered| {
        let collation = options.collation();

        // Partitions form in first-occurrence order.
        let mut partition_order: Vec<String> = Vec::new();
        let mut partitions: HashMap<String, Vec<Cow<'a, Document>>> = HashMap::new();
        for doc in buffered {
            let key = match &spec.partition_by {
                Some(expr) => {
                    let ctx = EvalCtx::new(doc.as_ref(), options);
                    let id = ctx.compute_opt(expr)?.unwrap_or(Bson::Null);
                    canonical_key(&id, collation)
                }
                None => String::new(),
            };
            partitions
                .entry(key.clone())
                .or_insert_with(|| {
                    partition_order.push(key);
                    Vec::new()
                })
                .push(doc);
        }

        let mut out: Vec<Cow<'a, Document>> = Vec::new();
        for key in partition_order {
            let mut docs = partitions.remove(&key).expect("partition recorded");
            if let Some(sort_by) = &spec.sort_by {
                docs.sort_by(|a, b| sort_by.compare(a.as_ref(), b.as_ref(), options));
            }
            let len = docs.len();

            // Compute all output values before mutating any document.
            let mut computed: Vec<Vec<(String, Option<Bson>)>> =
                vec![Vec::with_capacity(spec.output.len()); len];
            for output in &spec.output {
                match &output.op {
                    WindowOp::DocumentNumber => {
                        for (index, slots) in computed.iter_mut().enumerate() {
                            slots.push((
                                output.field.clone(),
                                Some(Bson::Int64(index as i64 + 1)),
                            ));
                        }
                    }
                    WindowOp::Rank | WindowOp::DenseRank => {
                        let dense = matches!(output.op, WindowOp::DenseRank);
                        let sort_by = spec.sort_by.as_ref().expect("validated at parse");
                        let mut rank: i64 = 0;
                        let mut dense_rank: i64 = 0;
                        for index in 0..len {
                            let tied = index > 0
                                && sort_by.compare(
                                    docs[index - 1].as_ref(),
                                    docs[index].as_ref(),
                                    options,
                                ) == std::cmp::Ordering::Equal;
                            if !tied {
                                rank = index as i64 + 1;
                                dense_rank += 1;
                            }
                            computed[index].push((
                                output.field.clone(),
                                Some(Bson::Int64(if dense { dense_rank } else { rank })),
                            ));
                        }
                    }
                    WindowOp::Shift {
                        output: shift_expr,
                        by,
                        default,
                    } => {
                        for index in 0..len {
                            let target = index as i64 + by;
                            let value = if target >= 0 && (target as usize) < len {
                                let ctx =
                                    EvalCtx::new(docs[target as usize].as_ref(), options);
                                ctx.compute(shift_expr)?
                            } else {
                                match default {
                                    Some(default_expr) => {
                                        let ctx =
                                            EvalCtx::new(docs[index].as_ref(), options);
                                        ctx.compute(default_expr)?
                                    }
                                    None => Bson::Null,
                                }
                            };
                            computed[index].push((output.field.clone(), Some(value)));
                        }
                    }
                    WindowOp::Accumulate { op, expr, frame } => {
                        // Default frame: the whole partition, or everything
                        // up to the current document when sorted.
                        let frame = frame.unwrap_or(DocumentFrame {
                            lower: FrameBound::Unbounded,
                            upper: if spec.sort_by.is_some() {
                                FrameBound::Current
                            } else {
                                FrameBound::Unbounded
                            },
                        });
                        for index in 0..len {
                            let lower =
                                bound_index(frame.lower, index, len, true).max(0) as usize;
                            let upper = bound_index(frame.upper, index, len, false)
                                .min(len as i64 - 1);
                            let mut state = AccumState::new(*op);
                            if upper >= 0 && lower <= upper as usize {
                                for frame_doc in docs[lower..=(upper as usize)].iter() {
                                    let ctx = EvalCtx::new(frame_doc.as_ref(), options);
                                    let value = match expr {
                                        Some(expr) => ctx.compute_opt(expr)?,
                                        None => None,
                                    };
                                    state.update(value, collation)?;
                                }
                            }
                            computed[index].push((output.field.clone(), state.finalize()));
                        }
                    }
                }
            }

            for (doc, slots) in docs.into_iter().zip(computed.into_iter()) {
                let mut owned = doc.into_owned();
                for (field, value) in slots {
                    if let Some(value) = value {
                        value::assign(&mut owned, &field, value);
                    }
                }
                out.push(Cow::Owned(owned));
            }
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

    fn sales() -> Vec<Document> {
        vec![
            doc! {"state": "CA", "qty": 100},
            doc! {"state": "NY", "qty": 200},
            doc! {"state": "CA", "qty": 300},
            doc! {"state": "NY", "qty": 50},
        ]
    }

    #[test]
    fn test_running_total_per_partition() {
        let got = run(
            &[doc! {"$setWindowFields": {
                "partitionBy": "$state",
                "sortBy": {"qty": 1},
                "output": {"running": {"$sum": "$qty"}}
            }}],
            sales(),
        );
        // CA partition first (first occurrence), sorted by qty.
        assert_eq!(got[0].get_str("state").unwrap(), "CA");
        assert_eq!(got[0].get_i64("running").unwrap(), 100);
        assert_eq!(got[1].get_i64("running").unwrap(), 400);
        assert_eq!(got[2].get_str("state").unwrap(), "NY");
        assert_eq!(got[2].get_i64("running").unwrap(), 50);
        assert_eq!(got[3].get_i64("running").unwrap(), 250);
    }

    #[test]
    fn test_whole_partition_total_without_sort() {
        let got = run(
            &[doc! {"$setWindowFields": {
                "partitionBy": "$state",
                "output": {"total": {"$sum": "$qty"}}
            }}],
            sales(),
        );
        assert!(got
            .iter()
            .filter(|d| d.get_str("state").map_or(false, |s| s == "CA"))
            .all(|d| d.get_i64("total").map_or(false, |t| t == 400)));
        assert!(got
            .iter()
            .filter(|d| d.get_str("state").map_or(false, |s| s == "NY"))
            .all(|d| d.get_i64("total").map_or(false, |t| t == 250)));
    }

    #[test]
    fn test_explicit_sliding_frame() {
        let docs: Vec<Document> = (1..=4).map(|n| doc! {"n": n}).collect();
        let got = run(
            &[doc! {"$setWindowFields": {
                "sortBy": {"n": 1},
                "output": {"near": {
                    "$sum": "$n",
                    "window": {"documents": [-1, 1]}
                }}
            }}],
            docs,
        );
        let sums: Vec<i64> = got.iter().map(|d| d.get_i64("near").unwrap()).collect();
        assert_eq!(sums, vec![3, 6, 9, 7]);
    }

    #[test]
    fn test_rank_family() {
        let docs = vec![
            doc! {"score": 10},
            doc! {"score": 20},
            doc! {"score": 20},
            doc! {"score": 30},
        ];
        let got = run(
            &[doc! {"$setWindowFields": {
                "sortBy": {"score": 1},
                "output": {
                    "r": {"$rank": {}},
                    "dr": {"$denseRank": {}},
                    "num": {"$documentNumber": {}}
                }
            }}],
            docs,
        );
        let ranks: Vec<i64> = got.iter().map(|d| d.get_i64("r").unwrap()).collect();
        let dense: Vec<i64> = got.iter().map(|d| d.get_i64("dr").unwrap()).collect();
        let nums: Vec<i64> = got.iter().map(|d| d.get_i64("num").unwrap()).collect();
        assert_eq!(ranks, vec![1, 2, 2, 4]);
        assert_eq!(dense, vec![1, 2, 2, 3]);
        assert_eq!(nums, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_shift() {
        let docs: Vec<Document> = (1..=3).map(|n| doc! {"n": n}).collect();
        let got = run(
            &[doc! {"$setWindowFields": {
                "sortBy": {"n": 1},
                "output": {"prev": {"$shift": {"output": "$n", "by": -1, "default": 0}}}
            }}],
            docs,
        );
        let prevs: Vec<i32> = got
            .iter()
            .map(|d| match d.get("prev").unwrap() {
                Bson::Int32(n) => *n,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(prevs, vec![0, 1, 2]);
    }

    #[test]
    fn test_validation() {
        // Rank without sortBy.
        assert!(Aggregator::new(
            &[doc! {"$setWindowFields": {"output": {"r": {"$rank": {}}}}}],
            Options::default()
        )
        .is_err());
        // Range windows are unsupported.
        assert!(Aggregator::new(
            &[doc! {"$setWindowFields": {
                "sortBy": {"n": 1},
                "output": {"s": {"$sum": "$n", "window": {"range": [-1, 1]}}}
            }}],
            Options::default()
        )
        .is_err());
        // Empty output.
        assert!(Aggregator::new(
            &[doc! {"$setWindowFields": {"output": {}}}],
            Options::default()
        )
        .is_err());
    }
}
