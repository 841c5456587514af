// src/lib.rs
// IronSift - in-memory MongoDB-style query and aggregation engine.

//! Evaluate MongoDB-style query filters and aggregation pipelines against
//! documents held in process memory. No storage, no indexes, no network:
//! the caller owns the documents, the engine owns the semantics.
//!
//! ```
//! use bson::doc;
//! use ironsift::{aggregate, Options, Query};
//!
//! let docs = vec![
//!     doc! {"name": "Alice", "age": 30},
//!     doc! {"name": "Bob", "age": 20},
//! ];
//!
//! let query = Query::from_filter(&doc! {"age": {"$gte": 25}}).unwrap();
//! let adults: Vec<_> = query.find(&docs).collect();
//! assert_eq!(adults.len(), 1);
//!
//! let grouped = aggregate(
//!     &docs,
//!     &[doc! {"$group": {"_id": null, "total": {"$sum": "$age"}}}],
//!     Options::default(),
//! )
//! .unwrap();
//! assert_eq!(grouped[0].get_i64("total").unwrap(), 50);
//! ```

pub mod aggregation;
pub mod collation;
pub mod error;
pub mod expr;
pub mod logging;
pub mod options;
pub mod query;
mod regex_util;
pub mod value;

use bson::{Bson, Document};

pub use aggregation::{Aggregator, DocStream, Stage};
pub use collation::{Alternate, CaseFirst, Collation};
pub use error::{Result, SiftError};
pub use expr::{EvalCtx, Expression};
pub use logging::{get_log_level, set_log_level, LogLevel};
pub use options::{Context, CustomOperator, Options, ProcessingMode, ScriptEvaluator};
pub use query::{Predicate, Projection, Query};

/// Filter documents, optionally projecting each match.
///
/// The projection accepts find-surface specs: include/exclude flags and the
/// `$slice` / `$elemMatch` / positional operators.
pub fn find(
    docs: &[Document],
    filter: &Document,
    projection: Option<&Document>,
    options: Options,
) -> Result<Vec<Document>> {
    let query = Query::new(filter, options)?;
    let projection = match projection {
        Some(spec) if !spec.is_empty() => {
            Some(Projection::parse(spec, query.options(), false)?)
        }
        _ => None,
    };

    let mut out = Vec::new();
    for doc in query.find(docs) {
        match &projection {
            Some(projection) => out.push(projection.apply(
                doc,
                query.options(),
                Some(query.predicate()),
            )?),
            None => out.push(doc.clone()),
        }
    }
    Ok(out)
}

/// Run an aggregation pipeline to completion.
pub fn aggregate(
    docs: &[Document],
    pipeline: &[Document],
    options: Options,
) -> Result<Vec<Document>> {
    Aggregator::new(pipeline, options)?.run(docs)
}

/// Evaluate one aggregation expression against one document.
pub fn compute(doc: &Document, expression: &Bson, options: &Options) -> Result<Bson> {
    let parsed = Expression::parse(expression, options)?;
    EvalCtx::new(doc, options).compute(&parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_find_with_projection() {
        let docs = vec![
            doc! {"_id": 1, "a": {"b": 1}},
            doc! {"_id": 2, "a": {"b": 2}},
        ];
        let got = find(
            &docs,
            &doc! {"a.b": {"$gt": 1}},
            Some(&doc! {"a.b": 1, "_id": 0}),
            Options::default(),
        )
        .unwrap();
        assert_eq!(got, vec![doc! {"a": {"b": 2}}]);
    }

    #[test]
    fn test_find_empty_filter_yields_all_in_order() {
        let docs = vec![doc! {"n": 1}, doc! {"n": 2}];
        let got = find(&docs, &doc! {}, None, Options::default()).unwrap();
        assert_eq!(got, docs);
    }

    #[test]
    fn test_compute_short_circuit() {
        let got = compute(
            &doc! {},
            &bson::bson!({"$cond": [false, {"$divide": [1, 0]}, 42]}),
            &Options::default(),
        )
        .unwrap();
        assert_eq!(got, Bson::Int32(42));
    }
}
