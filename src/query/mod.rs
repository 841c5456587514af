// src/query/mod.rs
// The query surface: a compiled filter plus the match/find/remove API.

pub mod predicate;
pub mod projection;

pub use predicate::Predicate;
pub use projection::Projection;

use bson::Document;

use crate::error::Result;
use crate::options::Options;
use crate::sift_trace;

/// A compiled query filter.
///
/// Construction parses and validates the filter eagerly; matching a
/// document never re-parses anything.
#[derive(Debug, Clone)]
pub struct Query {
    predicate: Predicate,
    options: Options,
}

impl Query {
    /// Compile a filter document.
    pub fn new(filter: &Document, options: Options) -> Result<Self> {
        let predicate = Predicate::parse(filter, &options)?;
        sift_trace!("compiled filter over {} top-level key(s)", filter.len());
        Ok(Query { predicate, options })
    }

    /// Compile a filter with default options.
    pub fn from_filter(filter: &Document) -> Result<Self> {
        Query::new(filter, Options::default())
    }

    /// True when the document matches. Runtime evaluation failures count
    /// as a non-match; use [`Query::try_test`] to observe them.
    pub fn test(&self, doc: &Document) -> bool {
        self.try_test(doc).unwrap_or(false)
    }

    /// Match one document, surfacing runtime errors (script hooks).
    pub fn try_test(&self, doc: &Document) -> Result<bool> {
        self.predicate.matches(doc, &self.options)
    }

    /// Lazily yield the documents that match, in input order.
    pub fn find<'a>(&'a self, docs: &'a [Document]) -> impl Iterator<Item = &'a Document> + 'a {
        docs.iter().filter(move |doc| self.test(doc))
    }

    /// Lazily yield the complement: documents the filter does not match.
    pub fn remove<'a>(&'a self, docs: &'a [Document]) -> impl Iterator<Item = &'a Document> + 'a {
        docs.iter().filter(move |doc| !self.test(doc))
    }

    pub(crate) fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    pub fn options(&self) -> &Options {
        &self.options
    }
}
