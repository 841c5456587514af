// src/aggregation/mod.rs
// The pipeline runtime: stage parsing, the lazy document stream, and the
// Aggregator facade.
//
// A pipeline compiles to a Vec<Stage> eagerly (malformed stages fail at
// construction). stream() builds a chain of pull-driven iterators over
// Cow<Document>: streaming stages wrap their upstream, blocking stages
// drain it on first pull. An error is yielded once at the pull that
// triggered it and the stream then fuses.

pub mod group;
pub mod lookup;
pub mod sort;
pub mod stages;
pub mod window;

use std::borrow::Cow;

use bson::{Bson, Document};

use crate::error::{Result, SiftError};
use crate::expr::Expression;
use crate::options::{Options, ProcessingMode};
use crate::query::{Predicate, Projection};
use crate::sift_debug;

/// The lazy document stream threaded between stages.
pub type DocStream<'a> = Box<dyn Iterator<Item = Result<Cow<'a, Document>>> + 'a>;

/// One parsed pipeline stage.
#[derive(Debug, Clone)]
pub enum Stage {
    Match(Predicate),
    Project(Projection),
    AddFields(Vec<(String, Expression)>),
    Unset(Vec<String>),
    ReplaceRoot(Expression),
    Limit(u64),
    Skip(u64),
    Count(String),
    Sort(sort::SortSpec),
    SortByCount(Expression),
    Sample(usize),
    Group(group::GroupSpec),
    Bucket(group::BucketSpec),
    BucketAuto(group::BucketAutoSpec),
    Unwind(stages::UnwindSpec),
    Lookup(lookup::LookupSpec),
    GraphLookup(lookup::GraphLookupSpec),
    Facet(Vec<(String, Vec<Stage>)>),
    SetWindowFields(window::WindowSpec),
    /// Recognized but unsupported in an in-memory runtime; raises on pull.
    Out(String),
}

impl Stage {
    /// Parse one `{$stage: spec}` descriptor.
    pub fn parse(descriptor: &Document, options: &Options) -> Result<Self> {
        if descriptor.len() != 1 {
            return Err(SiftError::AggregationError(
                "each stage must have exactly one operator".into(),
            ));
        }
        let (name, spec) = descriptor.iter().next().expect("len checked");

        match name.as_str() {
            "$match" => {
                let filter = spec_document(name, spec)?;
                Ok(Stage::Match(Predicate::parse(filter, options)?))
            }
            "$project" => {
                let projection = spec_document(name, spec)?;
                if projection.is_empty() {
                    return Err(SiftError::AggregationError(
                        "$project requires at least one field".into(),
                    ));
                }
                Ok(Stage::Project(Projection::parse(projection, options, true)?))
            }
            "$addFields" | "$set" => {
                Ok(Stage::AddFields(stages::parse_assignments(
                    name,
                    spec_document(name, spec)?,
                    options,
                )?))
            }
            "$unset" => Ok(Stage::Unset(stages::parse_unset(spec)?)),
            "$replaceRoot" => {
                let spec = spec_document(name, spec)?;
                let new_root = spec.get("newRoot").ok_or_else(|| {
                    SiftError::AggregationError("$replaceRoot requires newRoot".into())
                })?;
                Ok(Stage::ReplaceRoot(Expression::parse(new_root, options)?))
            }
            "$replaceWith" => Ok(Stage::ReplaceRoot(Expression::parse(spec, options)?)),
            "$limit" => Ok(Stage::Limit(stages::parse_positive_int(name, spec, false)?)),
            "$skip" => Ok(Stage::Skip(stages::parse_positive_int(name, spec, true)?)),
            "$count" => Ok(Stage::Count(stages::parse_count_field(spec)?)),
            "$sort" => Ok(Stage::Sort(sort::SortSpec::parse(spec_document(name, spec)?)?)),
            "$sortByCount" => Ok(Stage::SortByCount(Expression::parse(spec, options)?)),
            "$sample" => Ok(Stage::Sample(sort::parse_sample(spec)?)),
            "$group" => Ok(Stage::Group(group::GroupSpec::parse(
                spec_document(name, spec)?,
                options,
            )?)),
            "$bucket" => Ok(Stage::Bucket(group::BucketSpec::parse(
                spec_document(name, spec)?,
                options,
            )?)),
            "$bucketAuto" => Ok(Stage::BucketAuto(group::BucketAutoSpec::parse(
                spec_document(name, spec)?,
                options,
            )?)),
            "$unwind" => Ok(Stage::Unwind(stages::UnwindSpec::parse(spec)?)),
            "$lookup" => Ok(Stage::Lookup(lookup::LookupSpec::parse(
                spec_document(name, spec)?,
                options,
            )?)),
            "$graphLookup" => Ok(Stage::GraphLookup(lookup::GraphLookupSpec::parse(
                spec_document(name, spec)?,
                options,
            )?)),
            "$facet" => Ok(Stage::Facet(lookup::parse_facet(
                spec_document(name, spec)?,
                options,
            )?)),
            "$setWindowFields" => Ok(Stage::SetWindowFields(window::WindowSpec::parse(
                spec_document(name, spec)?,
                options,
            )?)),
            "$out" | "$merge" => {
                // Materialization belongs to the embedder; keep the stage
                // so pipelines validate, raise when pulled.
                Ok(Stage::Out(name.to_string()))
            }
            other => Err(SiftError::AggregationError(format!(
                "unknown pipeline stage: {}",
                other
            ))),
        }
    }

    /// Wrap the upstream with this stage's iterator adapter.
    fn apply<'a>(&'a self, input: DocStream<'a>, options: &'a Options) -> DocStream<'a> {
        match self {
            Stage::Match(predicate) => stages::apply_match(input, predicate, options),
            Stage::Project(projection) => stages::apply_project(input, projection, options),
            Stage::AddFields(assignments) => {
                stages::apply_add_fields(input, assignments, options)
            }
            Stage::Unset(paths) => stages::apply_unset(input, paths),
            Stage::ReplaceRoot(expr) => stages::apply_replace_root(input, expr, options),
            Stage::Limit(n) => stages::apply_limit(input, *n),
            Stage::Skip(n) => stages::apply_skip(input, *n),
            Stage::Count(field) => stages::apply_count(input, field),
            Stage::Sort(spec) => sort::apply_sort(input, spec, options),
            Stage::SortByCount(expr) => group::apply_sort_by_count(input, expr, options),
            Stage::Sample(size) => sort::apply_sample(input, *size),
            Stage::Group(spec) => group::apply_group(input, spec, options),
            Stage::Bucket(spec) => group::apply_bucket(input, spec, options),
            Stage::BucketAuto(spec) => group::apply_bucket_auto(input, spec, options),
            Stage::Unwind(spec) => stages::apply_unwind(input, spec),
            Stage::Lookup(spec) => lookup::apply_lookup(input, spec, options),
            Stage::GraphLookup(spec) => lookup::apply_graph_lookup(input, spec, options),
            Stage::Facet(facets) => lookup::apply_facet(input, facets, options),
            Stage::SetWindowFields(spec) => window::apply_window_fields(input, spec, options),
            Stage::Out(name) => {
                let name = name.clone();
                let mut raised = false;
                Box::new(std::iter::from_fn(move || {
                    if raised {
                        return None;
                    }
                    raised = true;
                    Some(Err(SiftError::Unsupported(format!(
                        "{} is not supported by the in-memory runtime",
                        name
                    ))))
                }))
            }
        }
    }
}

fn spec_document<'a>(stage: &str, spec: &'a Bson) -> Result<&'a Document> {
    spec.as_document().ok_or_else(|| {
        SiftError::AggregationError(format!("{} requires a document spec", stage))
    })
}

/// A compiled aggregation pipeline.
#[derive(Debug, Clone)]
pub struct Aggregator {
    stages: Vec<Stage>,
    options: Options,
}

impl Aggregator {
    /// Parse a pipeline. The empty pipeline is valid and is the identity.
    pub fn new(pipeline: &[Document], options: Options) -> Result<Self> {
        let stages = pipeline
            .iter()
            .map(|descriptor| Stage::parse(descriptor, &options))
            .collect::<Result<Vec<_>>>()?;
        sift_debug!("compiled pipeline with {} stage(s)", stages.len());
        Ok(Aggregator { stages, options })
    }

    pub fn from_stages(stages: Vec<Stage>, options: Options) -> Self {
        Aggregator { stages, options }
    }

    /// Build the lazy stream over the caller's documents. Nothing runs
    /// until the stream is pulled.
    pub fn stream<'a>(&'a self, docs: &'a [Document]) -> DocStream<'a> {
        let mut stream: DocStream<'a> = match self.options.processing_mode {
            ProcessingMode::CloneInput => {
                Box::new(docs.iter().map(|doc| Ok(Cow::Owned(doc.clone()))))
            }
            ProcessingMode::CloneOff | ProcessingMode::CopyInput => {
                Box::new(docs.iter().map(|doc| Ok(Cow::Borrowed(doc))))
            }
        };
        for stage in &self.stages {
            stream = stage.apply(stream, &self.options);
        }
        stream
    }

    /// Run the pipeline to completion.
    pub fn run(&self, docs: &[Document]) -> Result<Vec<Document>> {
        self.stream(docs)
            .map(|item| item.map(Cow::into_owned))
            .collect()
    }

    pub fn options(&self) -> &Options {
        &self.options
    }
}

/// Run a sub-pipeline (facet, lookup) over owned documents.
pub(crate) fn run_stages(
    stages: &[Stage],
    docs: Vec<Document>,
    options: &Options,
) -> Result<Vec<Document>> {
    let mut stream: DocStream<'_> = Box::new(docs.iter().map(|doc| Ok(Cow::Borrowed(doc))));
    for stage in stages {
        stream = stage.apply(stream, options);
    }
    stream.map(|item| item.map(Cow::into_owned)).collect()
}

// ---------------------------------------------------------------------------
// Stream plumbing shared by the stage modules
// ---------------------------------------------------------------------------

/// Streaming adapter: `f` maps a document to zero-or-one documents.
/// Errors fuse the stream.
pub(crate) fn map_docs<'a, F>(input: DocStream<'a>, f: F) -> DocStream<'a>
where
    F: FnMut(Cow<'a, Document>) -> Result<Option<Cow<'a, Document>>> + 'a,
{
    let mut input = input;
    let mut f = f;
    let mut done = false;
    Box::new(std::iter::from_fn(move || {
        if done {
            return None;
        }
        loop {
            match input.next() {
                None => return None,
                Some(Err(error)) => {
                    done = true;
                    return Some(Err(error));
                }
                Some(Ok(doc)) => match f(doc) {
                    Ok(Some(out)) => return Some(Ok(out)),
                    Ok(None) => continue,
                    Err(error) => {
                        done = true;
                        return Some(Err(error));
                    }
                },
            }
        }
    }))
}

/// Streaming adapter: `f` fans a document out to many (for $unwind).
pub(crate) fn flat_map_docs<'a, F>(input: DocStream<'a>, f: F) -> DocStream<'a>
where
    F: FnMut(Cow<'a, Document>) -> Result<Vec<Cow<'a, Document>>> + 'a,
{
    let mut input = input;
    let mut f = f;
    let mut done = false;
    let mut pending: std::vec::IntoIter<Cow<'a, Document>> = Vec::new().into_iter();
    Box::new(std::iter::from_fn(move || {
        if done {
            return None;
        }
        loop {
            if let Some(next) = pending.next() {
                return Some(Ok(next));
            }
            match input.next() {
                None => return None,
                Some(Err(error)) => {
                    done = true;
                    return Some(Err(error));
                }
                Some(Ok(doc)) => match f(doc) {
                    Ok(fanned) => pending = fanned.into_iter(),
                    Err(error) => {
                        done = true;
                        return Some(Err(error));
                    }
                },
            }
        }
    }))
}

/// Blocking adapter: drain the upstream into a buffer on first pull, run
/// `f` once, then stream its output.
pub(crate) fn blocking<'a, F>(input: DocStream<'a>, f: F) -> DocStream<'a>
where
    F: FnOnce(Vec<Cow<'a, Document>>) -> Result<Vec<Cow<'a, Document>>> + 'a,
{
    enum State<'a, F> {
        Pending(DocStream<'a>, F),
        Active(std::vec::IntoIter<Cow<'a, Document>>),
        Done,
    }
    let mut state = State::Pending(input, f);
    Box::new(std::iter::from_fn(move || loop {
        match std::mem::replace(&mut state, State::Done) {
            State::Pending(mut input, f) => {
                let mut buffered = Vec::new();
                for item in input.by_ref() {
                    match item {
                        Ok(doc) => buffered.push(doc),
                        Err(error) => return Some(Err(error)),
                    }
                }
                match f(buffered) {
                    Ok(output) => state = State::Active(output.into_iter()),
                    Err(error) => return Some(Err(error)),
                }
            }
            State::Active(mut output) => {
                let next = output.next();
                state = State::Active(output);
                return next.map(Ok);
            }
            State::Done => return None,
        }
    }))
}
