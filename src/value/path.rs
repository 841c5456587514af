// src/value/path.rs
// Dotted-path resolution, assignment and removal over BSON trees.
//
// The traversal rule that makes this MongoDB-shaped: a non-numeric segment
// applied to an array maps the remaining path across every element and
// collects the non-missing results into a fresh array. A numeric segment
// indexes arrays but matches document keys literally.

use bson::{Bson, Document};

/// Resolve a dotted path against any value. `None` means missing, which is
/// distinct from `Some(Bson::Null)`.
pub fn resolve(value: &Bson, path: &str) -> Option<Bson> {
    let segments: Vec<&str> = path.split('.').collect();
    resolve_segments(value, &segments)
}

/// Resolve a dotted path against a document.
pub fn resolve_in_doc(doc: &Document, path: &str) -> Option<Bson> {
    match path.split_once('.') {
        None => doc.get(path).cloned(),
        Some((head, rest)) => {
            let segments: Vec<&str> = rest.split('.').collect();
            resolve_segments(doc.get(head)?, &segments)
        }
    }
}

fn resolve_segments(value: &Bson, segments: &[&str]) -> Option<Bson> {
    let Some((segment, rest)) = segments.split_first() else {
        return Some(value.clone());
    };

    match value {
        Bson::Document(doc) => resolve_segments(doc.get(*segment)?, rest),
        Bson::Array(elements) => {
            if let Ok(index) = segment.parse::<usize>() {
                resolve_segments(elements.get(index)?, rest)
            } else {
                // Implicit array traversal: map the whole remaining path
                // (current segment included) over every element.
                let mapped: Vec<Bson> = elements
                    .iter()
                    .filter_map(|element| resolve_segments(element, segments))
                    .collect();
                Some(Bson::Array(mapped))
            }
        }
        _ => None,
    }
}

/// Assign a value at a dotted path, creating intermediate documents.
/// Numeric segments on arrays replace or extend (padding with `Null`);
/// non-numeric segments on arrays replicate the assignment into each
/// document element. Type mismatches are skipped silently.
pub fn assign(doc: &mut Document, path: &str, value: Bson) {
    let segments: Vec<&str> = path.split('.').collect();
    assign_in_doc(doc, &segments, &value);
}

fn assign_in_doc(doc: &mut Document, segments: &[&str], value: &Bson) {
    let (segment, rest) = match segments.split_first() {
        Some(split) => split,
        None => return,
    };
    if rest.is_empty() {
        doc.insert(segment.to_string(), value.clone());
        return;
    }
    match doc.get_mut(*segment) {
        Some(child) => assign_in_value(child, rest, value),
        None => {
            let mut sub = Document::new();
            assign_in_doc(&mut sub, rest, value);
            doc.insert(segment.to_string(), Bson::Document(sub));
        }
    }
}

fn assign_in_value(current: &mut Bson, segments: &[&str], value: &Bson) {
    let (segment, rest) = match segments.split_first() {
        Some(split) => split,
        None => return,
    };
    match current {
        Bson::Document(doc) => assign_in_doc(doc, segments, value),
        Bson::Array(elements) => {
            if let Ok(index) = segment.parse::<usize>() {
                if index >= elements.len() {
                    elements.resize(index + 1, Bson::Null);
                }
                if rest.is_empty() {
                    elements[index] = value.clone();
                } else {
                    if !matches!(elements[index], Bson::Document(_) | Bson::Array(_)) {
                        elements[index] = Bson::Document(Document::new());
                    }
                    assign_in_value(&mut elements[index], rest, value);
                }
            } else {
                for element in elements.iter_mut() {
                    if let Bson::Document(doc) = element {
                        assign_in_doc(doc, segments, value);
                    }
                }
            }
        }
        _ => {}
    }
}

/// Remove the value at a dotted path. Containers that become empty stay in
/// place. Non-numeric segments on arrays replicate the removal into each
/// document element, mirroring `assign`.
pub fn remove(doc: &mut Document, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    remove_in_doc(doc, &segments);
}

fn remove_in_doc(doc: &mut Document, segments: &[&str]) {
    let (segment, rest) = match segments.split_first() {
        Some(split) => split,
        None => return,
    };
    if rest.is_empty() {
        doc.remove(*segment);
        return;
    }
    if let Some(child) = doc.get_mut(*segment) {
        remove_in_value(child, rest);
    }
}

fn remove_in_value(current: &mut Bson, segments: &[&str]) {
    let (segment, rest) = match segments.split_first() {
        Some(split) => split,
        None => return,
    };
    match current {
        Bson::Document(doc) => remove_in_doc(doc, segments),
        Bson::Array(elements) => {
            if let Ok(index) = segment.parse::<usize>() {
                if rest.is_empty() {
                    if index < elements.len() {
                        elements.remove(index);
                    }
                } else if let Some(element) = elements.get_mut(index) {
                    remove_in_value(element, rest);
                }
            } else {
                for element in elements.iter_mut() {
                    if let Bson::Document(doc) = element {
                        remove_in_doc(doc, segments);
                    }
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{bson, doc};

    #[test]
    fn test_resolve_simple_and_nested() {
        let doc = Bson::Document(doc! {"a": {"b": {"c": 42}}});
        assert_eq!(resolve(&doc, "a.b.c"), Some(bson!(42)));
        assert_eq!(resolve(&doc, "a.b"), Some(bson!({"c": 42})));
        assert_eq!(resolve(&doc, "a.x"), None);
        assert_eq!(resolve(&doc, "x"), None);
    }

    #[test]
    fn test_resolve_null_is_not_missing() {
        let doc = Bson::Document(doc! {"a": Bson::Null});
        assert_eq!(resolve(&doc, "a"), Some(Bson::Null));
        assert_eq!(resolve(&doc, "b"), None);
    }

    #[test]
    fn test_resolve_array_index() {
        let doc = Bson::Document(doc! {"items": [{"name": "x"}, {"name": "y"}]});
        assert_eq!(resolve(&doc, "items.0.name"), Some(bson!("x")));
        assert_eq!(resolve(&doc, "items.1.name"), Some(bson!("y")));
        assert_eq!(resolve(&doc, "items.7.name"), None);
    }

    #[test]
    fn test_resolve_implicit_array_traversal() {
        let doc = Bson::Document(doc! {"items": [{"n": 1}, {"x": 0}, {"n": 3}]});
        // Elements that resolve to missing are omitted.
        assert_eq!(resolve(&doc, "items.n"), Some(bson!([1, 3])));
        // Mapping over scalars yields an empty array, not missing.
        let doc = Bson::Document(doc! {"items": [1, 2]});
        assert_eq!(resolve(&doc, "items.n"), Some(bson!([])));
    }

    #[test]
    fn test_resolve_numeric_key_on_document() {
        let doc = Bson::Document(doc! {"a": {"0": "zero"}});
        assert_eq!(resolve(&doc, "a.0"), Some(bson!("zero")));
    }

    #[test]
    fn test_assign_creates_intermediates() {
        let mut doc = doc! {};
        assign(&mut doc, "a.b.c", bson!(1));
        assert_eq!(doc, doc! {"a": {"b": {"c": 1}}});
    }

    #[test]
    fn test_assign_array_index_extends() {
        let mut doc = doc! {"arr": [10]};
        assign(&mut doc, "arr.2", bson!(30));
        assert_eq!(doc, doc! {"arr": [10, Bson::Null, 30]});
    }

    #[test]
    fn test_assign_maps_over_array_elements() {
        let mut doc = doc! {"items": [{"a": 1}, {"a": 2}]};
        assign(&mut doc, "items.flag", bson!(true));
        assert_eq!(
            doc,
            doc! {"items": [{"a": 1, "flag": true}, {"a": 2, "flag": true}]}
        );
    }

    #[test]
    fn test_assign_scalar_mismatch_is_skipped() {
        let mut doc = doc! {"a": 5};
        assign(&mut doc, "a.b", bson!(1));
        assert_eq!(doc, doc! {"a": 5});
    }

    #[test]
    fn test_remove_terminal_key() {
        let mut doc = doc! {"a": {"b": 1, "c": 2}};
        remove(&mut doc, "a.b");
        assert_eq!(doc, doc! {"a": {"c": 2}});
        // Emptied containers stay.
        remove(&mut doc, "a.c");
        assert_eq!(doc, doc! {"a": {}});
    }

    #[test]
    fn test_remove_assign_round_trip() {
        let original = doc! {"a": {"b": 1}, "keep": true};
        let mut doc = original.clone();
        assign(&mut doc, "a.x", bson!(9));
        remove(&mut doc, "a.x");
        assert_eq!(doc, original);
    }

    #[test]
    fn test_remove_maps_over_array_elements() {
        let mut doc = doc! {"items": [{"a": 1, "b": 2}, {"b": 3}]};
        remove(&mut doc, "items.b");
        assert_eq!(doc, doc! {"items": [{"a": 1}, {}]});
    }
}
