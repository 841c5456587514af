// src/aggregation/sort.rs
// $sort (stable, collation-aware, compound keys computed once per
// document) and $sample (reservoir).

use std::borrow::Cow;
use std::cmp::Ordering;

use bson::{Bson, Document};
use rand::Rng;

use crate::error::{Result, SiftError};
use crate::options::Options;
use crate::value::{cmp_opt, resolve_in_doc};

use super::{blocking, DocStream};

/// A compound sort key: per-field path and direction.
#[derive(Debug, Clone)]
pub struct SortSpec {
    fields: Vec<(String, bool)>,
}

impl SortSpec {
    pub fn parse(spec: &Document) -> Result<Self> {
        if spec.is_empty() {
            return Err(SiftError::AggregationError(
                "$sort requires at least one field".into(),
            ));
        }
        let mut fields = Vec::with_capacity(spec.len());
        for (path, direction) in spec.iter() {
            let ascending = match direction {
                Bson::Int32(1) | Bson::Int64(1) => true,
                Bson::Int32(-1) | Bson::Int64(-1) => false,
                Bson::Double(f) if *f == 1.0 => true,
                Bson::Double(f) if *f == -1.0 => false,
                _ => {
                    return Err(SiftError::AggregationError(
                        "$sort direction must be 1 or -1".into(),
                    ))
                }
            };
            fields.push((path.clone(), ascending));
        }
        Ok(SortSpec { fields })
    }

    /// Compare two documents under this spec.
    pub(crate) fn compare(&self, a: &Document, b: &Document, options: &Options) -> Ordering {
        for (path, ascending) in &self.fields {
            let av = resolve_in_doc(a, path);
            let bv = resolve_in_doc(b, path);
            let ord = cmp_opt(av.as_ref(), bv.as_ref(), options.collation());
            if ord != Ordering::Equal {
                return if *ascending { ord } else { ord.reverse() };
            }
        }
        Ordering::Equal
    }
}

pub(crate) fn apply_sort<'a>(
    input: DocStream<'a>,
    spec: &'a SortSpec,
    options: &'a Options,
) -> DocStream<'a> {
    blocking(input, move |buffered| {
        // Decorate once so each document's keys are computed a single time
        // however many comparisons the sort makes.
        let mut decorated: Vec<(Vec<Option<Bson>>, Cow<'a, Document>)> = buffered
            .into_iter()
            .map(|doc| {
                let keys = spec
                    .fields
                    .iter()
                    .map(|(path, _)| resolve_in_doc(doc.as_ref(), path))
                    .collect();
                (keys, doc)
            })
            .collect();

        let collation = options.collation();
        decorated.sort_by(|(a_keys, _), (b_keys, _)| {
            for (index, (_, ascending)) in spec.fields.iter().enumerate() {
                let ord = cmp_opt(a_keys[index].as_ref(), b_keys[index].as_ref(), collation);
                if ord != Ordering::Equal {
                    return if *ascending { ord } else { ord.reverse() };
                }
            }
            Ordering::Equal
        });

        Ok(decorated.into_iter().map(|(_, doc)| doc).collect())
    })
}

pub(crate) fn parse_sample(spec: &Bson) -> Result<usize> {
    let spec = spec.as_document().ok_or_else(|| {
        SiftError::AggregationError("$sample requires {size: n}".into())
    })?;
    match spec.get("size") {
        Some(Bson::Int32(n)) if *n >= 0 && spec.len() == 1 => Ok(*n as usize),
        Some(Bson::Int64(n)) if *n >= 0 && spec.len() == 1 => Ok(*n as usize),
        _ => Err(SiftError::AggregationError(
            "$sample requires a non-negative integer size".into(),
        )),
    }
}

pub(crate) fn apply_sample(input: DocStream<'_>, size: usize) -> DocStream<'_> {
    blocking(input, move |buffered| {
        if buffered.len() <= size {
            return Ok(buffered);
        }
        let mut rng = rand::thread_rng();
        let mut reservoir: Vec<Cow<'_, Document>> = Vec::with_capacity(size);
        for (index, doc) in buffered.into_iter().enumerate() {
            if index < size {
                reservoir.push(doc);
            } else {
                let slot = rng.gen_range(0..=index);
                if slot < size {
                    reservoir[slot] = doc;
                }
            }
        }
        Ok(reservoir)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::Aggregator;
    use crate::collation::Collation;
    use bson::doc;

    fn run(pipeline: &[Document], docs: Vec<Document>) -> Vec<Document> {
        Aggregator::new(pipeline, Options::default())
            .unwrap()
            .run(&docs)
            .unwrap()
    }

    #[test]
    fn test_sort_ascending_descending() {
        let docs = vec![doc! {"n": 2}, doc! {"n": 3}, doc! {"n": 1}];
        let got = run(&[doc! {"$sort": {"n": 1}}], docs.clone());
        assert_eq!(got, vec![doc! {"n": 1}, doc! {"n": 2}, doc! {"n": 3}]);
        let got = run(&[doc! {"$sort": {"n": -1}}], docs);
        assert_eq!(got, vec![doc! {"n": 3}, doc! {"n": 2}, doc! {"n": 1}]);
    }

    #[test]
    fn test_sort_compound_keys() {
        let got = run(
            &[doc! {"$sort": {"city": 1, "age": -1}}],
            vec![
                doc! {"city": "NYC", "age": 30},
                doc! {"city": "LA", "age": 25},
                doc! {"city": "NYC", "age": 40},
            ],
        );
        assert_eq!(
            got,
            vec![
                doc! {"city": "LA", "age": 25},
                doc! {"city": "NYC", "age": 40},
                doc! {"city": "NYC", "age": 30}
            ]
        );
    }

    #[test]
    fn test_sort_is_stable() {
        let docs = vec![
            doc! {"k": 1, "tag": "first"},
            doc! {"k": 0, "tag": "x"},
            doc! {"k": 1, "tag": "second"},
            doc! {"k": 1, "tag": "third"},
        ];
        let got = run(&[doc! {"$sort": {"k": 1}}], docs);
        let tags: Vec<&str> = got
            .iter()
            .filter(|d| d.get_i32("k").map_or(false, |k| k == 1))
            .map(|d| d.get_str("tag").unwrap())
            .collect();
        assert_eq!(tags, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_sort_missing_sorts_with_null_first() {
        let got = run(
            &[doc! {"$sort": {"n": 1}}],
            vec![doc! {"n": 1}, doc! {"x": 0}, doc! {"n": Bson::Null}],
        );
        // Missing and null tie; stability keeps their input order.
        assert_eq!(got[0], doc! {"x": 0});
        assert_eq!(got[1], doc! {"n": Bson::Null});
        assert_eq!(got[2], doc! {"n": 1});
    }

    #[test]
    fn test_sort_with_collation_strength_one() {
        let options = Options::default().with_collation(
            Collation::from_document(&doc! {"locale": "en", "strength": 1}).unwrap(),
        );
        let docs = vec![
            doc! {"n": "A"},
            doc! {"n": "a"},
            doc! {"n": "B"},
            doc! {"n": "b"},
        ];
        let got = Aggregator::new(&[doc! {"$sort": {"n": 1}}], options)
            .unwrap()
            .run(&docs)
            .unwrap();
        // Case-equivalent strings tie, so stability preserves input order
        // pairwise: A a B b.
        let names: Vec<&str> = got.iter().map(|d| d.get_str("n").unwrap()).collect();
        assert_eq!(names, vec!["A", "a", "B", "b"]);
    }

    #[test]
    fn test_sort_dotted_path() {
        let got = run(
            &[doc! {"$sort": {"a.b": 1}}],
            vec![doc! {"a": {"b": 3}}, doc! {"a": {"b": 1}}],
        );
        assert_eq!(got[0], doc! {"a": {"b": 1}});
    }

    #[test]
    fn test_sort_validation() {
        assert!(Aggregator::new(&[doc! {"$sort": {}}], Options::default()).is_err());
        assert!(Aggregator::new(&[doc! {"$sort": {"a": 2}}], Options::default()).is_err());
    }

    #[test]
    fn test_sample_bounds() {
        let docs: Vec<Document> = (0..10).map(|n| doc! {"n": n}).collect();
        let got = run(&[doc! {"$sample": {"size": 3}}], docs.clone());
        assert_eq!(got.len(), 3);
        for doc in &got {
            assert!(docs.contains(doc));
        }
        // Asking for more than exists returns everything.
        let got = run(&[doc! {"$sample": {"size": 99}}], docs.clone());
        assert_eq!(got.len(), 10);
    }

    #[test]
    fn test_sample_validation() {
        assert!(Aggregator::new(&[doc! {"$sample": 3}], Options::default()).is_err());
        assert!(
            Aggregator::new(&[doc! {"$sample": {"size": -1}}], Options::default()).is_err()
        );
    }
}
