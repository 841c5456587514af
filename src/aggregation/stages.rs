// src/aggregation/stages.rs
// The streaming reshape stages: $match, $project, $addFields/$set, $unset,
// $replaceRoot/$replaceWith, $limit, $skip, $count, $unwind.

use std::borrow::Cow;

use bson::{Bson, Document};

use crate::error::{Result, SiftError};
use crate::expr::{EvalCtx, Expression};
use crate::options::Options;
use crate::query::{Predicate, Projection};
use crate::value;

use super::{blocking, flat_map_docs, map_docs, DocStream};

pub(crate) fn apply_match<'a>(
    input: DocStream<'a>,
    predicate: &'a Predicate,
    options: &'a Options,
) -> DocStream<'a> {
    map_docs(input, move |doc| {
        if predicate.matches(doc.as_ref(), options)? {
            Ok(Some(doc))
        } else {
            Ok(None)
        }
    })
}

pub(crate) fn apply_project<'a>(
    input: DocStream<'a>,
    projection: &'a Projection,
    options: &'a Options,
) -> DocStream<'a> {
    map_docs(input, move |doc| {
        let projected = projection.apply(doc.as_ref(), options, None)?;
        Ok(Some(Cow::Owned(projected)))
    })
}

/// `$addFields` / `$set` assignment list: dotted paths to expressions.
pub(crate) fn parse_assignments(
    stage: &str,
    spec: &Document,
    options: &Options,
) -> Result<Vec<(String, Expression)>> {
    if spec.is_empty() {
        return Err(SiftError::AggregationError(format!(
            "{} requires at least one field",
            stage
        )));
    }
    let mut assignments = Vec::with_capacity(spec.len());
    for (path, value) in spec.iter() {
        if path.starts_with('$') {
            return Err(SiftError::AggregationError(format!(
                "{}: field names may not start with $ ({})",
                stage, path
            )));
        }
        assignments.push((path.clone(), Expression::parse(value, options)?));
    }
    Ok(assignments)
}

pub(crate) fn apply_add_fields<'a>(
    input: DocStream<'a>,
    assignments: &'a [(String, Expression)],
    options: &'a Options,
) -> DocStream<'a> {
    map_docs(input, move |mut doc| {
        // Evaluate against the incoming document, then write; assignments
        // in one stage do not see each other.
        let mut computed = Vec::with_capacity(assignments.len());
        {
            let ctx = EvalCtx::new(doc.as_ref(), options);
            for (path, expr) in assignments {
                computed.push((path, ctx.compute_opt(expr)?));
            }
        }
        let target = doc.to_mut();
        for (path, outcome) in computed {
            match outcome {
                Some(value) => value::assign(target, path, value),
                // Assigning missing removes the key ($$REMOVE).
                None => value::remove(target, path),
            }
        }
        Ok(Some(doc))
    })
}

pub(crate) fn parse_unset(spec: &Bson) -> Result<Vec<String>> {
    let paths = match spec {
        Bson::String(path) => vec![path.clone()],
        Bson::Array(paths) => paths
            .iter()
            .map(|p| {
                p.as_str().map(str::to_string).ok_or_else(|| {
                    SiftError::AggregationError("$unset paths must be strings".into())
                })
            })
            .collect::<Result<Vec<_>>>()?,
        _ => {
            return Err(SiftError::AggregationError(
                "$unset requires a path or array of paths".into(),
            ))
        }
    };
    if paths.is_empty() || paths.iter().any(|p| p.is_empty() || p.starts_with('$')) {
        return Err(SiftError::AggregationError(
            "$unset requires non-empty field paths".into(),
        ));
    }
    Ok(paths)
}

pub(crate) fn apply_unset<'a>(input: DocStream<'a>, paths: &'a [String]) -> DocStream<'a> {
    map_docs(input, move |mut doc| {
        let target = doc.to_mut();
        for path in paths {
            value::remove(target, path);
        }
        Ok(Some(doc))
    })
}

pub(crate) fn apply_replace_root<'a>(
    input: DocStream<'a>,
    expr: &'a Expression,
    options: &'a Options,
) -> DocStream<'a> {
    map_docs(input, move |doc| {
        let replacement = EvalCtx::new(doc.as_ref(), options).compute(expr)?;
        match replacement {
            Bson::Document(new_root) => Ok(Some(Cow::Owned(new_root))),
            other => Err(SiftError::type_mismatch(
                "$replaceRoot",
                format!("newRoot must evaluate to a document, got {:?}", other),
            )),
        }
    })
}

pub(crate) fn parse_positive_int(stage: &str, spec: &Bson, allow_zero: bool) -> Result<u64> {
    let n = match spec {
        Bson::Int32(n) => *n as i64,
        Bson::Int64(n) => *n,
        Bson::Double(f) if f.fract() == 0.0 => *f as i64,
        _ => {
            return Err(SiftError::AggregationError(format!(
                "{} requires an integer",
                stage
            )))
        }
    };
    if n < 0 || (n == 0 && !allow_zero) {
        return Err(SiftError::AggregationError(format!(
            "{} requires a positive integer",
            stage
        )));
    }
    Ok(n as u64)
}

pub(crate) fn apply_limit(input: DocStream<'_>, limit: u64) -> DocStream<'_> {
    let mut input = input;
    let mut remaining = limit;
    Box::new(std::iter::from_fn(move || {
        if remaining == 0 {
            return None;
        }
        match input.next() {
            Some(Ok(doc)) => {
                remaining -= 1;
                Some(Ok(doc))
            }
            other => {
                remaining = 0;
                other
            }
        }
    }))
}

pub(crate) fn apply_skip(input: DocStream<'_>, skip: u64) -> DocStream<'_> {
    let mut remaining = skip;
    map_docs(input, move |doc| {
        if remaining > 0 {
            remaining -= 1;
            return Ok(None);
        }
        Ok(Some(doc))
    })
}

pub(crate) fn parse_count_field(spec: &Bson) -> Result<String> {
    let field = spec.as_str().ok_or_else(|| {
        SiftError::AggregationError("$count requires a string field name".into())
    })?;
    if field.is_empty() || field.starts_with('$') || field.contains('.') {
        return Err(SiftError::AggregationError(
            "$count field name must be non-empty without $ or .".into(),
        ));
    }
    Ok(field.to_string())
}

pub(crate) fn apply_count<'a>(input: DocStream<'a>, field: &'a str) -> DocStream<'a> {
    blocking(input, move |buffered| {
        let count = buffered.len() as i64;
        let value = if count <= i32::MAX as i64 {
            Bson::Int32(count as i32)
        } else {
            Bson::Int64(count)
        };
        let mut out = Document::new();
        out.insert(field.to_string(), value);
        Ok(vec![Cow::Owned(out)])
    })
}

/// Parsed `$unwind` options.
#[derive(Debug, Clone)]
pub struct UnwindSpec {
    pub path: String,
    pub include_array_index: Option<String>,
    pub preserve_null_and_empty: bool,
}

impl UnwindSpec {
    pub fn parse(spec: &Bson) -> Result<Self> {
        match spec {
            Bson::String(path) => Ok(UnwindSpec {
                path: field_path(path)?,
                include_array_index: None,
                preserve_null_and_empty: false,
            }),
            Bson::Document(spec) => {
                let path = spec.get_str("path").map_err(|_| {
                    SiftError::AggregationError("$unwind requires a path".into())
                })?;
                let include_array_index = match spec.get("includeArrayIndex") {
                    Some(Bson::String(name)) if !name.is_empty() && !name.starts_with('$') => {
                        Some(name.clone())
                    }
                    Some(_) => {
                        return Err(SiftError::AggregationError(
                            "$unwind includeArrayIndex must be a plain field name".into(),
                        ))
                    }
                    None => None,
                };
                let preserve_null_and_empty = match spec.get("preserveNullAndEmptyArrays") {
                    Some(Bson::Boolean(b)) => *b,
                    Some(_) => {
                        return Err(SiftError::AggregationError(
                            "$unwind preserveNullAndEmptyArrays must be a boolean".into(),
                        ))
                    }
                    None => false,
                };
                for key in spec.keys() {
                    if !matches!(
                        key.as_str(),
                        "path" | "includeArrayIndex" | "preserveNullAndEmptyArrays"
                    ) {
                        return Err(SiftError::AggregationError(format!(
                            "$unwind: unknown option {}",
                            key
                        )));
                    }
                }
                Ok(UnwindSpec {
                    path: field_path(path)?,
                    include_array_index,
                    preserve_null_and_empty,
                })
            }
            _ => Err(SiftError::AggregationError(
                "$unwind requires a field path or options document".into(),
            )),
        }
    }
}

fn field_path(path: &str) -> Result<String> {
    path.strip_prefix('$')
        .filter(|rest| !rest.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            SiftError::AggregationError("$unwind path must start with $".into())
        })
}

pub(crate) fn apply_unwind<'a>(input: DocStream<'a>, spec: &'a UnwindSpec) -> DocStream<'a> {
    flat_map_docs(input, move |doc| {
        let resolved = value::resolve_in_doc(doc.as_ref(), &spec.path);
        match resolved {
            Some(Bson::Array(elements)) => {
                if elements.is_empty() {
                    if !spec.preserve_null_and_empty {
                        return Ok(Vec::new());
                    }
                    let mut kept = doc.into_owned();
                    value::remove(&mut kept, &spec.path);
                    if let Some(index_field) = &spec.include_array_index {
                        value::assign(&mut kept, index_field, Bson::Null);
                    }
                    return Ok(vec![Cow::Owned(kept)]);
                }
                let mut fanned = Vec::with_capacity(elements.len());
                for (index, element) in elements.into_iter().enumerate() {
                    let mut copy = doc.as_ref().clone();
                    value::assign(&mut copy, &spec.path, element);
                    if let Some(index_field) = &spec.include_array_index {
                        value::assign(&mut copy, index_field, Bson::Int64(index as i64));
                    }
                    fanned.push(Cow::Owned(copy));
                }
                Ok(fanned)
            }
            // Null and missing drop unless preserved.
            None | Some(Bson::Null) => {
                if spec.preserve_null_and_empty {
                    let mut kept = doc.into_owned();
                    if let Some(index_field) = &spec.include_array_index {
                        value::assign(&mut kept, index_field, Bson::Null);
                    }
                    Ok(vec![Cow::Owned(kept)])
                } else {
                    Ok(Vec::new())
                }
            }
            // Non-array values pass through as a single element.
            Some(_) => {
                let mut kept = doc;
                if let Some(index_field) = &spec.include_array_index {
                    value::assign(kept.to_mut(), index_field, Bson::Null);
                }
                Ok(vec![kept])
            }
        }
    })
}
