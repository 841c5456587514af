// src/value/mod.rs
// Value-level services: canonical ordering, dotted-path traversal and
// deterministic hashing keys. Everything above this layer (expressions,
// predicates, stages) goes through these functions instead of touching
// `Bson` shape details directly.

pub mod canonical;
pub mod compare;
pub mod path;

pub use canonical::{canonical_key, canonical_key_opt};
pub use compare::{
    cmp_bson, cmp_bson_collated, cmp_opt, eq_bson, eq_bson_collated, is_numeric, numeric_value,
    type_rank,
};
pub use path::{assign, remove, resolve, resolve_in_doc};

use bson::Bson;

/// Aggregation truthiness: `false`, `0`, `Null` and missing are falsy;
/// everything else is truthy, including `""`, `[]` and `{}`.
pub fn is_truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Null | Bson::Undefined => false,
        _ => match numeric_value(value) {
            Some(f) => f != 0.0,
            None => true,
        },
    }
}

/// Truthiness over a possibly-missing value.
pub fn is_truthy_opt(value: Option<&Bson>) -> bool {
    value.map(is_truthy).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::bson;

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&Bson::Null));
        assert!(!is_truthy(&bson!(false)));
        assert!(!is_truthy(&bson!(0)));
        assert!(!is_truthy(&bson!(0.0)));
        assert!(is_truthy(&bson!("")));
        assert!(is_truthy(&bson!([])));
        assert!(is_truthy(&bson!({})));
        assert!(is_truthy(&bson!(-1)));
        assert!(!is_truthy_opt(None));
    }
}
