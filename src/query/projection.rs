// src/query/projection.rs
// Projection compilation and application, shared by find() and the
// $project / $addFields stages.
//
// A spec entry is a flag (include/exclude), a projection operator ($slice,
// $elemMatch, positional $), or a computed expression. Include and exclude
// entries cannot mix, except for suppressing the id field inside an
// include-spec; violations fail at construction.

use bson::{Bson, Document};

use crate::error::{Result, SiftError};
use crate::expr::{EvalCtx, Expression};
use crate::options::Options;
use crate::value;

use super::predicate::{self, ElemMatch, Predicate};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Include,
    Exclude,
}

#[derive(Debug, Clone)]
enum ProjKind {
    Include,
    Exclude,
    Compute(Expression),
    Slice { skip: Option<i64>, limit: i64 },
    ElemMatch(ElemMatch),
    /// `"path.$"`: first array element matched by the accompanying query.
    Positional,
}

#[derive(Debug, Clone)]
struct Entry {
    path: String,
    kind: ProjKind,
}

/// A compiled projection spec.
#[derive(Debug, Clone)]
pub struct Projection {
    mode: Mode,
    entries: Vec<Entry>,
    id_excluded: bool,
}

impl Projection {
    /// Compile a projection document. `allow_expressions` is false for the
    /// find() surface, which accepts operators but not computed fields.
    pub fn parse(spec: &Document, options: &Options, allow_expressions: bool) -> Result<Self> {
        let mut entries = Vec::new();
        flatten(spec, String::new(), options, allow_expressions, &mut entries)?;

        let id_key = options.id_key.as_str();
        let mut id_excluded = false;
        let mut includes = false;
        let mut excludes = false;
        for entry in &entries {
            match entry.kind {
                ProjKind::Exclude if entry.path == id_key => id_excluded = true,
                ProjKind::Exclude => excludes = true,
                ProjKind::Include
                | ProjKind::Compute(_)
                | ProjKind::ElemMatch(_)
                | ProjKind::Positional => includes = true,
                // $slice is legal in either mode.
                ProjKind::Slice { .. } => {}
            }
        }
        if includes && excludes {
            return Err(SiftError::InvalidQuery(
                "cannot mix inclusion and exclusion in one projection".into(),
            ));
        }

        let mode = if includes { Mode::Include } else { Mode::Exclude };
        Ok(Projection {
            mode,
            entries,
            id_excluded,
        })
    }

    /// True when the spec lists nothing at all (identity projection).
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && !self.id_excluded
    }

    /// Project one document. `query` supplies the conditions consumed by
    /// the positional operator.
    pub fn apply(
        &self,
        doc: &Document,
        options: &Options,
        query: Option<&Predicate>,
    ) -> Result<Document> {
        match self.mode {
            Mode::Exclude => self.apply_exclude(doc, options),
            Mode::Include => self.apply_include(doc, options, query),
        }
    }

    fn apply_exclude(&self, doc: &Document, options: &Options) -> Result<Document> {
        let mut out = doc.clone();
        if self.id_excluded {
            out.remove(&options.id_key);
        }
        for entry in &self.entries {
            match &entry.kind {
                ProjKind::Exclude => value::remove(&mut out, &entry.path),
                ProjKind::Slice { skip, limit } => {
                    apply_slice(&mut out, &entry.path, *skip, *limit)
                }
                _ => {}
            }
        }
        Ok(out)
    }

    fn apply_include(
        &self,
        doc: &Document,
        options: &Options,
        query: Option<&Predicate>,
    ) -> Result<Document> {
        let mut out = Document::new();
        let id_key = options.id_key.as_str();
        if !self.id_excluded {
            if let Some(id) = doc.get(id_key) {
                out.insert(id_key.to_string(), id.clone());
            }
        }

        for entry in &self.entries {
            match &entry.kind {
                ProjKind::Include => {
                    if entry.path == id_key && out.contains_key(id_key) {
                        continue;
                    }
                    let segments: Vec<&str> = entry.path.split('.').collect();
                    include_into(&mut out, doc, &segments);
                }
                ProjKind::Compute(expr) => {
                    let ctx = EvalCtx::new(doc, options);
                    if let Some(computed) = ctx.compute_opt(expr)? {
                        value::assign(&mut out, &entry.path, computed);
                    }
                }
                ProjKind::Slice { skip, limit } => {
                    let segments: Vec<&str> = entry.path.split('.').collect();
                    include_into(&mut out, doc, &segments);
                    apply_slice(&mut out, &entry.path, *skip, *limit);
                }
                ProjKind::ElemMatch(elem_match) => {
                    if let Some(Bson::Array(elements)) = doc.get(&entry.path) {
                        if let Some(hit) =
                            first_elem_match(elements, elem_match, options)?
                        {
                            out.insert(entry.path.clone(), Bson::Array(vec![hit]));
                        }
                    }
                }
                ProjKind::Positional => {
                    if let Some(Bson::Array(elements)) = value::resolve_in_doc(doc, &entry.path) {
                        let index = query
                            .and_then(|q| {
                                predicate::first_matching_index(
                                    q,
                                    &entry.path,
                                    &elements,
                                    options,
                                )
                            })
                            .unwrap_or(0);
                        if let Some(element) = elements.get(index) {
                            value::assign(
                                &mut out,
                                &entry.path,
                                Bson::Array(vec![element.clone()]),
                            );
                        }
                    }
                }
                ProjKind::Exclude => {}
            }
        }
        Ok(out)
    }
}

/// Recursively flatten a spec document into dotted-path entries.
fn flatten(
    spec: &Document,
    prefix: String,
    options: &Options,
    allow_expressions: bool,
    entries: &mut Vec<Entry>,
) -> Result<()> {
    for (key, value) in spec.iter() {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };

        // "path.$": positional projection.
        if let Some(base) = path.strip_suffix(".$") {
            entries.push(Entry {
                path: base.to_string(),
                kind: ProjKind::Positional,
            });
            continue;
        }

        let kind = match value {
            Bson::Boolean(true) => ProjKind::Include,
            Bson::Boolean(false) => ProjKind::Exclude,
            Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => {
                if crate::value::numeric_value(value) == Some(0.0) {
                    ProjKind::Exclude
                } else {
                    ProjKind::Include
                }
            }
            Bson::Document(sub) => {
                if let Some(op_kind) = parse_projection_operator(sub, options)? {
                    op_kind
                } else if is_flag_document(sub) {
                    flatten(sub, path, options, allow_expressions, entries)?;
                    continue;
                } else {
                    require_expressions(&path, allow_expressions)?;
                    ProjKind::Compute(Expression::parse(value, options)?)
                }
            }
            other => {
                require_expressions(&path, allow_expressions)?;
                ProjKind::Compute(Expression::parse(other, options)?)
            }
        };
        entries.push(Entry { path, kind });
    }
    Ok(())
}

fn require_expressions(path: &str, allowed: bool) -> Result<()> {
    if !allowed {
        return Err(SiftError::InvalidQuery(format!(
            "projection field {} must be 0, 1 or a projection operator",
            path
        )));
    }
    Ok(())
}

/// `{$slice: ...}` / `{$elemMatch: ...}` as a field's projection value.
fn parse_projection_operator(spec: &Document, options: &Options) -> Result<Option<ProjKind>> {
    if spec.len() != 1 {
        return Ok(None);
    }
    let (op, operand) = spec.iter().next().expect("len checked");
    match op.as_str() {
        "$slice" => match operand {
            Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => {
                let limit = int_value(operand).ok_or_else(|| {
                    SiftError::InvalidQuery("$slice requires an integer".into())
                })?;
                Ok(Some(ProjKind::Slice { skip: None, limit }))
            }
            Bson::Array(parts) if parts.len() == 2 => {
                let skip = int_value(&parts[0]).ok_or_else(|| {
                    SiftError::InvalidQuery("$slice skip must be an integer".into())
                })?;
                let limit = int_value(&parts[1]).ok_or_else(|| {
                    SiftError::InvalidQuery("$slice limit must be an integer".into())
                })?;
                if limit <= 0 {
                    return Err(SiftError::InvalidQuery(
                        "$slice limit must be positive".into(),
                    ));
                }
                Ok(Some(ProjKind::Slice {
                    skip: Some(skip),
                    limit,
                }))
            }
            _ => Err(SiftError::InvalidQuery(
                "$slice requires a count or [skip, count]".into(),
            )),
        },
        "$elemMatch" => {
            let sub = operand.as_document().ok_or_else(|| {
                SiftError::InvalidQuery("$elemMatch projection requires a document".into())
            })?;
            let all_operators = !sub.is_empty() && sub.keys().all(|k| k.starts_with('$'));
            let elem_match = if all_operators {
                // Parse through a wrapper filter so the operator set gets
                // the same validation as the query dialect.
                match Predicate::parse(&bson::doc! {"element": sub.clone()}, options)? {
                    Predicate::Field { conds, .. } => ElemMatch::Conditions(conds),
                    _ => unreachable!("single-field filter parses to Field"),
                }
            } else {
                ElemMatch::Predicate(Box::new(Predicate::parse(sub, options)?))
            };
            Ok(Some(ProjKind::ElemMatch(elem_match)))
        }
        "$meta" => Err(SiftError::Unsupported(
            "$meta projections are not supported".into(),
        )),
        _ => Ok(None),
    }
}

/// True when every leaf of the document is an include/exclude flag, which
/// makes it a nested projection spec rather than a computed document.
fn is_flag_document(spec: &Document) -> bool {
    !spec.is_empty()
        && spec.iter().all(|(key, value)| {
            !key.starts_with('$')
                && match value {
                    Bson::Boolean(_) | Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => true,
                    Bson::Document(sub) => {
                        // Operator documents are not flags.
                        sub.keys().next().map_or(false, |k| !k.starts_with('$'))
                            && is_flag_document(sub)
                    }
                    _ => false,
                }
        })
}

fn int_value(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        Bson::Double(f) if f.fract() == 0.0 => Some(*f as i64),
        _ => None,
    }
}

/// Structure-preserving include of one dotted path, mapping across arrays
/// of documents and merging with previously included siblings.
fn include_into(out: &mut Document, src: &Document, segments: &[&str]) {
    let (head, rest) = match segments.split_first() {
        Some(split) => split,
        None => return,
    };
    let Some(value) = src.get(*head) else { return };

    if rest.is_empty() {
        out.insert(head.to_string(), value.clone());
        return;
    }

    match value {
        Bson::Document(sub) => {
            if !matches!(out.get(*head), Some(Bson::Document(_))) {
                out.insert(head.to_string(), Bson::Document(Document::new()));
            }
            if let Some(Bson::Document(target)) = out.get_mut(*head) {
                include_into(target, sub, rest);
            }
        }
        Bson::Array(elements) => {
            let existing: Vec<Document> = match out.get(*head) {
                Some(Bson::Array(prior)) => prior
                    .iter()
                    .filter_map(|e| e.as_document().cloned())
                    .collect(),
                _ => Vec::new(),
            };
            let mut mapped = Vec::new();
            let mut doc_index = 0usize;
            for element in elements {
                if let Bson::Document(sub) = element {
                    let mut target = existing.get(doc_index).cloned().unwrap_or_default();
                    include_into(&mut target, sub, rest);
                    mapped.push(Bson::Document(target));
                    doc_index += 1;
                }
            }
            out.insert(head.to_string(), Bson::Array(mapped));
        }
        _ => {}
    }
}

fn apply_slice(out: &mut Document, path: &str, skip: Option<i64>, limit: i64) {
    let Some(Bson::Array(elements)) = value::resolve_in_doc(out, path) else {
        return;
    };
    let len = elements.len() as i64;
    let sliced: Vec<Bson> = match skip {
        None => {
            if limit >= 0 {
                elements.into_iter().take(limit.min(len) as usize).collect()
            } else {
                let start = (len + limit).max(0) as usize;
                elements.into_iter().skip(start).collect()
            }
        }
        Some(skip) => {
            let start = if skip < 0 {
                (len + skip).max(0)
            } else {
                skip.min(len)
            } as usize;
            elements
                .into_iter()
                .skip(start)
                .take(limit as usize)
                .collect()
        }
    };
    value::assign(out, path, Bson::Array(sliced));
}

fn first_elem_match(
    elements: &[Bson],
    elem_match: &ElemMatch,
    options: &Options,
) -> Result<Option<Bson>> {
    for element in elements {
        let hit = match elem_match {
            ElemMatch::Predicate(predicate) => match element {
                Bson::Document(doc) => predicate.matches(doc, options)?,
                _ => false,
            },
            ElemMatch::Conditions(conds) => {
                // Wrap the element so the shared matcher sees it as a field.
                let field = Predicate::Field {
                    path: "element".to_string(),
                    conds: conds.clone(),
                };
                field.matches(&bson::doc! {"element": element.clone()}, options)?
            }
        };
        if hit {
            return Ok(Some(element.clone()));
        }
    }
    Ok(None)
}
