// src/aggregation/lookup.rs
// The join-shaped stages: $lookup (equality and pipeline forms),
// $graphLookup (breadth-first self-join) and $facet (sub-pipelines over a
// shared upstream). Foreign collections come from the options context;
// every match is a scan, as everywhere else in this engine.

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;

use bson::{Bson, Document};

use crate::error::{Result, SiftError};
use crate::expr::{EvalCtx, Expression};
use crate::options::Options;
use crate::query::Predicate;
use crate::value::{canonical_key_opt, eq_bson_collated, resolve_in_doc};

use super::{blocking, map_docs, run_stages, DocStream, Stage};

// ---------------------------------------------------------------------------
// $lookup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LookupSpec {
    pub from: String,
    pub as_field: String,
    pub kind: LookupKind,
}

#[derive(Debug, Clone)]
pub enum LookupKind {
    /// The simple equality form: localField / foreignField.
    Fields {
        local_field: String,
        foreign_field: String,
    },
    /// The generalized form: per-document let bindings plus a sub-pipeline
    /// over the foreign collection.
    Pipeline {
        let_vars: Vec<(String, Expression)>,
        stages: Vec<Stage>,
    },
}

impl LookupSpec {
    pub fn parse(spec: &Document, options: &Options) -> Result<Self> {
        for key in spec.keys() {
            if !matches!(
                key.as_str(),
                "from" | "as" | "localField" | "foreignField" | "let" | "pipeline"
            ) {
                return Err(SiftError::AggregationError(format!(
                    "$lookup: unknown option {}",
                    key
                )));
            }
        }
        let from = spec
            .get_str("from")
            .map_err(|_| SiftError::AggregationError("$lookup requires from".into()))?
            .to_string();
        let as_field = spec
            .get_str("as")
            .map_err(|_| SiftError::AggregationError("$lookup requires as".into()))?
            .to_string();

        if let Some(pipeline) = spec.get("pipeline") {
            let stage_docs = pipeline.as_array().ok_or_else(|| {
                SiftError::AggregationError("$lookup pipeline must be an array".into())
            })?;
            let stages = stage_docs
                .iter()
                .map(|stage| match stage {
                    Bson::Document(descriptor) => Stage::parse(descriptor, options),
                    _ => Err(SiftError::AggregationError(
                        "$lookup pipeline stages must be documents".into(),
                    )),
                })
                .collect::<Result<Vec<_>>>()?;

            let let_vars = match spec.get("let") {
                None => Vec::new(),
                Some(Bson::Document(bindings)) => bindings
                    .iter()
                    .map(|(name, value)| {
                        Ok((name.clone(), Expression::parse(value, options)?))
                    })
                    .collect::<Result<Vec<_>>>()?,
                Some(_) => {
                    return Err(SiftError::AggregationError(
                        "$lookup let must be a document".into(),
                    ))
                }
            };
            return Ok(LookupSpec {
                from,
                as_field,
                kind: LookupKind::Pipeline { let_vars, stages },
            });
        }

        let local_field = spec
            .get_str("localField")
            .map_err(|_| {
                SiftError::AggregationError(
                    "$lookup requires localField/foreignField or a pipeline".into(),
                )
            })?
            .to_string();
        let foreign_field = spec
            .get_str("foreignField")
            .map_err(|_| {
                SiftError::AggregationError("$lookup requires foreignField".into())
            })?
            .to_string();
        Ok(LookupSpec {
            from,
            as_field,
            kind: LookupKind::Fields {
                local_field,
                foreign_field,
            },
        })
    }
}

fn foreign_collection(from: &str, options: &Options) -> Result<Arc<Vec<Document>>> {
    options.context.collection(from).ok_or_else(|| {
        SiftError::AggregationError(format!(
            "$lookup: no collection named {} in the context",
            from
        ))
    })
}

/// Equality with null/missing unification and array-element semantics on
/// both sides, which is how the server's $lookup equality behaves.
fn lookup_eq(local: Option<&Bson>, foreign: Option<&Bson>, options: &Options) -> bool {
    let collation = options.collation();
    let null = Bson::Null;
    let local_value = local.unwrap_or(&null);
    let foreign_value = foreign.unwrap_or(&null);

    let mut local_side: Vec<&Bson> = vec![local_value];
    if let Bson::Array(elements) = local_value {
        local_side.extend(elements.iter());
    }
    let mut foreign_side: Vec<&Bson> = vec![foreign_value];
    if let Bson::Array(elements) = foreign_value {
        foreign_side.extend(elements.iter());
    }

    local_side.iter().any(|l| {
        foreign_side
            .iter()
            .any(|f| eq_bson_collated(l, f, collation))
    })
}

pub(crate) fn apply_lookup<'a>(
    input: DocStream<'a>,
    spec: &'a LookupSpec,
    options: &'a Options,
) -> DocStream<'a> {
    map_docs(input, move |mut doc| {
        let foreign = foreign_collection(&spec.from, options)?;
        let matched: Vec<Bson> = match &spec.kind {
            LookupKind::Fields {
                local_field,
                foreign_field,
            } => {
                let local = resolve_in_doc(doc.as_ref(), local_field);
                foreign
                    .iter()
                    .filter(|candidate| {
                        let foreign_value = resolve_in_doc(candidate, foreign_field);
                        lookup_eq(local.as_ref(), foreign_value.as_ref(), options)
                    })
                    .map(|candidate| Bson::Document(candidate.clone()))
                    .collect()
            }
            LookupKind::Pipeline { let_vars, stages } => {
                // Bind let variables against the current document, then run
                // the sub-pipeline over the foreign collection.
                let mut sub_options = options.clone();
                {
                    let ctx = EvalCtx::new(doc.as_ref(), options);
                    for (name, expr) in let_vars {
                        let value = ctx.compute(expr)?;
                        sub_options.variables.insert(name.clone(), value);
                    }
                }
                run_stages(stages, foreign.as_ref().clone(), &sub_options)?
                    .into_iter()
                    .map(Bson::Document)
                    .collect()
            }
        };
        doc.to_mut()
            .insert(spec.as_field.clone(), Bson::Array(matched));
        Ok(Some(doc))
    })
}

// ---------------------------------------------------------------------------
// $graphLookup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GraphLookupSpec {
    pub from: String,
    pub start_with: Expression,
    pub connect_from_field: String,
    pub connect_to_field: String,
    pub as_field: String,
    pub max_depth: Option<u64>,
    pub depth_field: Option<String>,
    pub restrict: Option<Predicate>,
}

impl GraphLookupSpec {
    pub fn parse(spec: &Document, options: &Options) -> Result<Self> {
        for key in spec.keys() {
            if !matches!(
                key.as_str(),
                "from"
                    | "startWith"
                    | "connectFromField"
                    | "connectToField"
                    | "as"
                    | "maxDepth"
                    | "depthField"
                    | "restrictSearchWithMatch"
            ) {
                return Err(SiftError::AggregationError(format!(
                    "$graphLookup: unknown option {}",
                    key
                )));
            }
        }
        let required_str = |field: &str| -> Result<String> {
            spec.get_str(field).map(str::to_string).map_err(|_| {
                SiftError::AggregationError(format!("$graphLookup requires {}", field))
            })
        };
        let start_with = Expression::parse(
            spec.get("startWith").ok_or_else(|| {
                SiftError::AggregationError("$graphLookup requires startWith".into())
            })?,
            options,
        )?;
        let max_depth = match spec.get("maxDepth") {
            None => None,
            Some(Bson::Int32(n)) if *n >= 0 => Some(*n as u64),
            Some(Bson::Int64(n)) if *n >= 0 => Some(*n as u64),
            Some(_) => {
                return Err(SiftError::AggregationError(
                    "$graphLookup maxDepth must be a non-negative integer".into(),
                ))
            }
        };
        let depth_field = match spec.get("depthField") {
            None => None,
            Some(Bson::String(name)) => Some(name.clone()),
            Some(_) => {
                return Err(SiftError::AggregationError(
                    "$graphLookup depthField must be a string".into(),
                ))
            }
        };
        let restrict = match spec.get("restrictSearchWithMatch") {
            None => None,
            Some(Bson::Document(filter)) => Some(Predicate::parse(filter, options)?),
            Some(_) => {
                return Err(SiftError::AggregationError(
                    "$graphLookup restrictSearchWithMatch must be a document".into(),
                ))
            }
        };
        Ok(GraphLookupSpec {
            from: required_str("from")?,
            start_with,
            connect_from_field: required_str("connectFromField")?,
            connect_to_field: required_str("connectToField")?,
            as_field: required_str("as")?,
            max_depth,
            depth_field,
            restrict,
        })
    }
}

fn frontier_values(value: Option<Bson>, out: &mut Vec<Bson>) {
    match value {
        None => {}
        Some(Bson::Array(elements)) => out.extend(elements),
        Some(single) => out.push(single),
    }
}

pub(crate) fn apply_graph_lookup<'a>(
    input: DocStream<'a>,
    spec: &'a GraphLookupSpec,
    options: &'a Options,
) -> DocStream<'a> {
    map_docs(input, move |mut doc| {
        let foreign = foreign_collection(&spec.from, options)?;
        let id_key = options.id_key.as_str();

        let mut frontier: Vec<Bson> = Vec::new();
        {
            let ctx = EvalCtx::new(doc.as_ref(), options);
            frontier_values(ctx.compute_opt(&spec.start_with)?, &mut frontier);
        }

        // Cycle detection by id key; discovery order is breadth-first.
        let mut visited: HashSet<String> = HashSet::new();
        let mut found: Vec<(Document, u64)> = Vec::new();
        let mut depth: u64 = 0;

        while !frontier.is_empty() {
            if let Some(max_depth) = spec.max_depth {
                if depth > max_depth {
                    break;
                }
            }
            let mut next_frontier: Vec<Bson> = Vec::new();
            for candidate in foreign.iter() {
                if let Some(restrict) = &spec.restrict {
                    if !restrict.matches(candidate, options)? {
                        continue;
                    }
                }
                let to_value = resolve_in_doc(candidate, &spec.connect_to_field);
                let hit = frontier
                    .iter()
                    .any(|value| lookup_eq(Some(value), to_value.as_ref(), options));
                if !hit {
                    continue;
                }
                let id = canonical_key_opt(candidate.get(id_key), None);
                if !visited.insert(id) {
                    continue;
                }
                frontier_values(
                    resolve_in_doc(candidate, &spec.connect_from_field),
                    &mut next_frontier,
                );
                found.push((candidate.clone(), depth));
            }
            frontier = next_frontier;
            depth += 1;
        }

        let matched: Vec<Bson> = found
            .into_iter()
            .map(|(mut candidate, depth)| {
                if let Some(depth_field) = &spec.depth_field {
                    candidate.insert(depth_field.clone(), Bson::Int64(depth as i64));
                }
                Bson::Document(candidate)
            })
            .collect();
        doc.to_mut()
            .insert(spec.as_field.clone(), Bson::Array(matched));
        Ok(Some(doc))
    })
}

// ---------------------------------------------------------------------------
// $facet
// ---------------------------------------------------------------------------

pub(crate) fn parse_facet(
    spec: &Document,
    options: &Options,
) -> Result<Vec<(String, Vec<Stage>)>> {
    if spec.is_empty() {
        return Err(SiftError::AggregationError(
            "$facet requires at least one facet".into(),
        ));
    }
    let mut facets = Vec::with_capacity(spec.len());
    for (name, pipeline) in spec.iter() {
        if name.starts_with('$') || name.contains('.') {
            return Err(SiftError::AggregationError(format!(
                "$facet: invalid facet name {}",
                name
            )));
        }
        let stage_docs = pipeline.as_array().ok_or_else(|| {
            SiftError::AggregationError("$facet pipelines must be arrays".into())
        })?;
        let stages = stage_docs
            .iter()
            .map(|stage| match stage {
                Bson::Document(descriptor) => {
                    let key = descriptor.keys().next().map(String::as_str);
                    if matches!(key, Some("$facet" | "$out" | "$merge")) {
                        return Err(SiftError::AggregationError(format!(
                            "$facet pipelines may not contain {}",
                            key.expect("matched above")
                        )));
                    }
                    Stage::parse(descriptor, options)
                }
                _ => Err(SiftError::AggregationError(
                    "$facet pipeline stages must be documents".into(),
                )),
            })
            .collect::<Result<Vec<_>>>()?;
        facets.push((name.clone(), stages));
    }
    Ok(facets)
}

pub(crate) fn apply_facet<'a>(
    input: DocStream<'a>,
    facets: &'a [(String, Vec<Stage>)],
    options: &'a Options,
) -> DocStream<'a> {
    blocking(input, move |buffered| {
        let upstream: Vec<Document> = buffered
            .iter()
            .map(|doc| doc.as_ref().clone())
            .collect();
        let mut out = Document::new();
        // Facets run in spec key order against the same buffered upstream.
        for (name, stages) in facets {
            let results = run_stages(stages, upstream.clone(), options)?;
            out.insert(
                name.clone(),
                Bson::Array(results.into_iter().map(Bson::Document).collect()),
            );
        }
        Ok(vec![Cow::Owned(out)])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::Aggregator;
    use bson::doc;

    fn orders() -> Vec<Document> {
        vec![
            doc! {"_id": 1, "item": "a", "price": 10},
            doc! {"_id": 2, "item": "b", "price": 20},
            doc! {"_id": 3, "item": "a", "price": 5},
        ]
    }

    #[test]
    fn test_lookup_fields_form() {
        let options = Options::default().with_collection("orders", orders());
        let aggregator = Aggregator::new(
            &[doc! {"$lookup": {
                "from": "orders",
                "localField": "sku",
                "foreignField": "item",
                "as": "matched"
            }}],
            options,
        )
        .unwrap();
        let got = aggregator
            .run(&[doc! {"sku": "a"}, doc! {"sku": "z"}])
            .unwrap();
        assert_eq!(got[0].get_array("matched").unwrap().len(), 2);
        assert_eq!(got[1].get_array("matched").unwrap().len(), 0);
    }

    #[test]
    fn test_lookup_null_matches_missing() {
        let options = Options::default()
            .with_collection("things", vec![doc! {"_id": 1}, doc! {"_id": 2, "k": 5}]);
        let aggregator = Aggregator::new(
            &[doc! {"$lookup": {
                "from": "things",
                "localField": "none",
                "foreignField": "k",
                "as": "hit"
            }}],
            options,
        )
        .unwrap();
        let got = aggregator.run(&[doc! {"x": 1}]).unwrap();
        // The missing local value unifies with the foreign doc missing k.
        assert_eq!(got[0].get_array("hit").unwrap().len(), 1);
    }

    #[test]
    fn test_lookup_pipeline_form_with_let() {
        let options = Options::default().with_collection("orders", orders());
        let aggregator = Aggregator::new(
            &[doc! {"$lookup": {
                "from": "orders",
                "let": {"min": "$floor"},
                "pipeline": [
                    {"$match": {"$expr": {"$gte": ["$price", "$$min"]}}},
                    {"$sort": {"price": -1}}
                ],
                "as": "expensive"
            }}],
            options,
        )
        .unwrap();
        let got = aggregator.run(&[doc! {"floor": 10}]).unwrap();
        let matched = got[0].get_array("expensive").unwrap();
        assert_eq!(matched.len(), 2);
        assert_eq!(
            matched[0].as_document().unwrap().get_i32("price").unwrap(),
            20
        );
    }

    #[test]
    fn test_lookup_unknown_collection_errors_at_pull() {
        let aggregator = Aggregator::new(
            &[doc! {"$lookup": {
                "from": "nowhere", "localField": "a", "foreignField": "b", "as": "x"
            }}],
            Options::default(),
        )
        .unwrap();
        assert!(aggregator.run(&[doc! {}]).is_err());
    }

    fn org_chart() -> Vec<Document> {
        vec![
            doc! {"_id": 1, "name": "root", "reportsTo": Bson::Null},
            doc! {"_id": 2, "name": "mid", "reportsTo": "root"},
            doc! {"_id": 3, "name": "leaf", "reportsTo": "mid"},
            doc! {"_id": 4, "name": "stray", "reportsTo": "nobody"},
        ]
    }

    #[test]
    fn test_graph_lookup_walks_up() {
        let options = Options::default().with_collection("employees", org_chart());
        let aggregator = Aggregator::new(
            &[doc! {"$graphLookup": {
                "from": "employees",
                "startWith": "$reportsTo",
                "connectFromField": "reportsTo",
                "connectToField": "name",
                "as": "chain",
                "depthField": "level"
            }}],
            options,
        )
        .unwrap();
        let got = aggregator
            .run(&[doc! {"name": "leaf", "reportsTo": "mid"}])
            .unwrap();
        let chain = got[0].get_array("chain").unwrap();
        assert_eq!(chain.len(), 2);
        let first = chain[0].as_document().unwrap();
        assert_eq!(first.get_str("name").unwrap(), "mid");
        assert_eq!(first.get_i64("level").unwrap(), 0);
        let second = chain[1].as_document().unwrap();
        assert_eq!(second.get_str("name").unwrap(), "root");
        assert_eq!(second.get_i64("level").unwrap(), 1);
    }

    #[test]
    fn test_graph_lookup_max_depth_and_cycles() {
        let cyclic = vec![
            doc! {"_id": 1, "name": "a", "next": "b"},
            doc! {"_id": 2, "name": "b", "next": "a"},
        ];
        let options = Options::default().with_collection("nodes", cyclic);
        let aggregator = Aggregator::new(
            &[doc! {"$graphLookup": {
                "from": "nodes",
                "startWith": "$start",
                "connectFromField": "next",
                "connectToField": "name",
                "as": "reached"
            }}],
            options,
        )
        .unwrap();
        // The cycle terminates via the visited set.
        let got = aggregator.run(&[doc! {"start": "a"}]).unwrap();
        assert_eq!(got[0].get_array("reached").unwrap().len(), 2);

        let options = Options::default().with_collection(
            "nodes",
            vec![
                doc! {"_id": 1, "name": "a", "next": "b"},
                doc! {"_id": 2, "name": "b", "next": "c"},
                doc! {"_id": 3, "name": "c", "next": Bson::Null},
            ],
        );
        let aggregator = Aggregator::new(
            &[doc! {"$graphLookup": {
                "from": "nodes",
                "startWith": "$start",
                "connectFromField": "next",
                "connectToField": "name",
                "as": "reached",
                "maxDepth": 0
            }}],
            options,
        )
        .unwrap();
        let got = aggregator.run(&[doc! {"start": "a"}]).unwrap();
        // maxDepth 0 keeps only the directly connected node.
        assert_eq!(got[0].get_array("reached").unwrap().len(), 1);
    }

    #[test]
    fn test_facet_runs_sub_pipelines_over_same_input() {
        let aggregator = Aggregator::new(
            &[doc! {"$facet": {
                "byCount": [{"$count": "n"}],
                "over10": [{"$match": {"v": {"$gt": 10}}}]
            }}],
            Options::default(),
        )
        .unwrap();
        let got = aggregator
            .run(&[doc! {"v": 5}, doc! {"v": 15}, doc! {"v": 25}])
            .unwrap();
        assert_eq!(got.len(), 1);
        let by_count = got[0].get_array("byCount").unwrap();
        assert_eq!(
            by_count[0].as_document().unwrap().get_i32("n").unwrap(),
            3
        );
        assert_eq!(got[0].get_array("over10").unwrap().len(), 2);
        // Facet key order follows the spec.
        let keys: Vec<&str> = got[0].keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["byCount", "over10"]);
    }

    #[test]
    fn test_facet_rejects_nested_facet() {
        assert!(Aggregator::new(
            &[doc! {"$facet": {"inner": [{"$facet": {"deeper": []}}]}}],
            Options::default()
        )
        .is_err());
    }
}
