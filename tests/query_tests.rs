// tests/query_tests.rs
// The find/query surface over the public API.

use bson::{doc, Bson, Document};
use ironsift::{find, Collation, Options, Query, SiftError};

fn people() -> Vec<Document> {
    vec![
        doc! {"_id": 1, "name": "Alice", "age": 30, "tags": ["admin", "dev"],
              "address": {"city": "NYC", "zip": "10001"}},
        doc! {"_id": 2, "name": "Bob", "age": 20, "tags": ["dev"],
              "address": {"city": "LA", "zip": "90001"}},
        doc! {"_id": 3, "name": "carol", "age": 41,
              "address": {"city": "NYC", "zip": "10002"}},
    ]
}

#[test]
fn test_empty_filter_yields_all_in_order() {
    let docs = people();
    let got = find(&docs, &doc! {}, None, Options::default()).unwrap();
    assert_eq!(got, docs);
}

#[test]
fn test_nested_path_comparison() {
    let docs = vec![doc! {"a": {"b": 1}}, doc! {"a": {"b": 2}}];
    let got = find(&docs, &doc! {"a.b": {"$gt": 1}}, None, Options::default()).unwrap();
    assert_eq!(got, vec![doc! {"a": {"b": 2}}]);
}

#[test]
fn test_array_membership_and_elem_match() {
    let docs = people();
    let query = Query::from_filter(&doc! {"tags": "admin"}).unwrap();
    let admins: Vec<_> = query.find(&docs).collect();
    assert_eq!(admins.len(), 1);
    assert_eq!(admins[0].get_str("name").unwrap(), "Alice");

    let scored = vec![
        doc! {"scores": [{"kind": "quiz", "n": 9}, {"kind": "exam", "n": 4}]},
        doc! {"scores": [{"kind": "exam", "n": 9}]},
    ];
    let query =
        Query::from_filter(&doc! {"scores": {"$elemMatch": {"kind": "exam", "n": {"$gte": 8}}}})
            .unwrap();
    assert!(!query.test(&scored[0]));
    assert!(query.test(&scored[1]));
}

#[test]
fn test_logical_combinations() {
    let docs = people();
    let filter = doc! {"$or": [
        {"age": {"$lt": 25}},
        {"$and": [{"address.city": "NYC"}, {"age": {"$gt": 40}}]}
    ]};
    let got = find(&docs, &filter, None, Options::default()).unwrap();
    let names: Vec<&str> = got.iter().map(|d| d.get_str("name").unwrap()).collect();
    assert_eq!(names, vec!["Bob", "carol"]);
}

#[test]
fn test_find_with_projection_and_positional() {
    let docs = vec![doc! {"_id": 1, "grades": [70, 88, 92]}];
    let got = find(
        &docs,
        &doc! {"grades": {"$gte": 85}},
        Some(&doc! {"grades.$": 1}),
        Options::default(),
    )
    .unwrap();
    assert_eq!(got, vec![doc! {"_id": 1, "grades": [88]}]);
}

#[test]
fn test_remove_returns_complement() {
    let docs = people();
    let query = Query::from_filter(&doc! {"address.city": "NYC"}).unwrap();
    let kept: Vec<_> = query.find(&docs).collect();
    let removed: Vec<_> = query.remove(&docs).collect();
    assert_eq!(kept.len(), 2);
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].get_str("name").unwrap(), "Bob");
}

#[test]
fn test_collation_changes_matching() {
    let docs = people();
    let plain = Query::from_filter(&doc! {"name": "ALICE"}).unwrap();
    assert_eq!(plain.find(&docs).count(), 0);

    let folded = Query::new(
        &doc! {"name": "ALICE"},
        Options::default().with_collation(
            Collation::from_document(&doc! {"locale": "en", "strength": 2}).unwrap(),
        ),
    )
    .unwrap();
    assert_eq!(folded.find(&docs).count(), 1);
}

#[test]
fn test_regex_and_type_operators() {
    let docs = people();
    let query = Query::from_filter(&doc! {"address.zip": {"$regex": "^100"}}).unwrap();
    assert_eq!(query.find(&docs).count(), 2);

    let mixed = vec![doc! {"v": 1}, doc! {"v": "one"}, doc! {"v": 1.5}];
    let query = Query::from_filter(&doc! {"v": {"$type": "number"}}).unwrap();
    assert_eq!(query.find(&mixed).count(), 2);
}

#[test]
fn test_custom_id_key() {
    let docs = vec![doc! {"key": 1, "a": 1, "b": 2}];
    let got = find(
        &docs,
        &doc! {},
        Some(&doc! {"a": 1}),
        Options::default().with_id_key("key"),
    )
    .unwrap();
    // The custom identity field rides along like _id would.
    assert_eq!(got, vec![doc! {"key": 1, "a": 1}]);
}

#[test]
fn test_where_requires_script_hook() {
    let err = Query::from_filter(&doc! {"$where": "this.a > 1"}).unwrap_err();
    assert!(matches!(err, SiftError::ScriptDisabled(_)));
}

#[test]
fn test_where_runs_through_hook() {
    use std::sync::Arc;

    struct HasField(&'static str);
    impl ironsift::ScriptEvaluator for HasField {
        fn call(&self, _source: &str, args: &[Bson]) -> ironsift::Result<Bson> {
            let doc = args[0].as_document().expect("document argument");
            Ok(Bson::Boolean(doc.contains_key(self.0)))
        }
    }

    let options = Options::default()
        .with_scripts_enabled(true)
        .with_script_evaluator(Arc::new(HasField("flag")));
    let query = Query::new(&doc! {"$where": "has flag"}, options).unwrap();
    assert!(query.test(&doc! {"flag": 1}));
    assert!(!query.test(&doc! {"other": 1}));
}

#[test]
fn test_malformed_filters_fail_eagerly() {
    for filter in [
        doc! {"a": {"$unknown": 1}},
        doc! {"$nope": []},
        doc! {"$and": "not an array"},
        doc! {"a": {"$mod": [0, 1]}},
        doc! {"a": {"$size": -1}},
    ] {
        assert!(
            Query::from_filter(&filter).is_err(),
            "{:?} should be rejected",
            filter
        );
    }
}
