// src/value/compare.rs
// Total ordering over BSON values following the canonical type order, so
// $sort is total and cross-type comparisons never panic.

use std::cmp::Ordering;

use bson::Bson;

use crate::collation::Collation;

/// Canonical type rank. Values of different ranks order by rank alone;
/// all numeric types share one rank and compare by value.
pub fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::JavaScriptCode(_) | Bson::JavaScriptCodeWithScope(_) => 12,
        Bson::MaxKey => 13,
        Bson::DbPointer(_) => 14,
    }
}

/// Numeric view of a value, if it has one. `Decimal128` is read through its
/// decimal string; values outside `f64` range saturate.
pub fn numeric_value(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(f) => Some(*f),
        Bson::Decimal128(d) => d.to_string().parse::<f64>().ok(),
        _ => None,
    }
}

/// True when the value is one of the numeric types.
pub fn is_numeric(value: &Bson) -> bool {
    matches!(
        value,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_)
    )
}

/// Compare two values in the canonical total order, byte order for strings.
pub fn cmp_bson(a: &Bson, b: &Bson) -> Ordering {
    cmp_bson_collated(a, b, None)
}

/// Compare two values, routing string comparisons (including strings nested
/// in documents and arrays) through the collation when one is supplied.
pub fn cmp_bson_collated(a: &Bson, b: &Bson, collation: Option<&Collation>) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }

    match (a, b) {
        (Bson::Null | Bson::Undefined, _) => Ordering::Equal,
        (Bson::MinKey, _) | (Bson::MaxKey, _) => Ordering::Equal,

        _ if is_numeric(a) => cmp_numeric(a, b),

        (Bson::String(x), Bson::String(y))
        | (Bson::Symbol(x), Bson::Symbol(y))
        | (Bson::String(x), Bson::Symbol(y))
        | (Bson::Symbol(x), Bson::String(y)) => match collation {
            Some(c) => c.compare(x, y),
            None => x.cmp(y),
        },

        (Bson::Document(x), Bson::Document(y)) => {
            for ((xk, xv), (yk, yv)) in x.iter().zip(y.iter()) {
                let ord = xk.as_str().cmp(yk.as_str());
                if ord != Ordering::Equal {
                    return ord;
                }
                let ord = cmp_bson_collated(xv, yv, collation);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }

        (Bson::Array(x), Bson::Array(y)) => {
            for (xv, yv) in x.iter().zip(y.iter()) {
                let ord = cmp_bson_collated(xv, yv, collation);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }

        (Bson::Binary(x), Bson::Binary(y)) => x
            .bytes
            .len()
            .cmp(&y.bytes.len())
            .then_with(|| u8::from(x.subtype).cmp(&u8::from(y.subtype)))
            .then_with(|| x.bytes.cmp(&y.bytes)),

        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),

        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),

        (Bson::DateTime(x), Bson::DateTime(y)) => {
            x.timestamp_millis().cmp(&y.timestamp_millis())
        }

        (Bson::Timestamp(x), Bson::Timestamp(y)) => x
            .time
            .cmp(&y.time)
            .then_with(|| x.increment.cmp(&y.increment)),

        (Bson::RegularExpression(x), Bson::RegularExpression(y)) => x
            .pattern
            .cmp(&y.pattern)
            .then_with(|| x.options.cmp(&y.options)),

        (Bson::JavaScriptCode(x), Bson::JavaScriptCode(y)) => x.cmp(y),

        // Remaining same-rank pairs carry no meaningful order.
        _ => Ordering::Equal,
    }
}

/// Numeric comparison: exact for two integers, `f64` otherwise, `NaN`
/// below every other number.
fn cmp_numeric(a: &Bson, b: &Bson) -> Ordering {
    if let (Some(x), Some(y)) = (as_i64(a), as_i64(b)) {
        return x.cmp(&y);
    }
    let x = numeric_value(a).unwrap_or(f64::NAN);
    let y = numeric_value(b).unwrap_or(f64::NAN);
    match x.partial_cmp(&y) {
        Some(ord) => ord,
        None => match (x.is_nan(), y.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => Ordering::Equal,
        },
    }
}

fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        _ => None,
    }
}

/// Semantic equality: `1 == 1.0`, documents order-sensitive.
pub fn eq_bson(a: &Bson, b: &Bson) -> bool {
    cmp_bson(a, b) == Ordering::Equal
}

/// Collation-aware equality.
pub fn eq_bson_collated(a: &Bson, b: &Bson, collation: Option<&Collation>) -> bool {
    cmp_bson_collated(a, b, collation) == Ordering::Equal
}

/// Compare optional values; a missing value sorts with `Null`.
pub fn cmp_opt(a: Option<&Bson>, b: Option<&Bson>, collation: Option<&Collation>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(v)) => cmp_bson_collated(&Bson::Null, v, collation),
        (Some(v), None) => cmp_bson_collated(v, &Bson::Null, collation),
        (Some(x), Some(y)) => cmp_bson_collated(x, y, collation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{bson, doc};

    #[test]
    fn test_cross_type_order() {
        // Null < numbers < strings < documents < arrays < bool < date
        assert_eq!(cmp_bson(&Bson::Null, &bson!(0)), Ordering::Less);
        assert_eq!(cmp_bson(&bson!(99), &bson!("a")), Ordering::Less);
        assert_eq!(cmp_bson(&bson!("z"), &bson!({"a": 1})), Ordering::Less);
        assert_eq!(cmp_bson(&bson!({"a": 1}), &bson!([1])), Ordering::Less);
        assert_eq!(cmp_bson(&bson!([1]), &bson!(true)), Ordering::Less);
        assert_eq!(
            cmp_bson(&bson!(true), &Bson::DateTime(bson::DateTime::from_millis(0))),
            Ordering::Less
        );
    }

    #[test]
    fn test_numeric_cross_type() {
        assert_eq!(cmp_bson(&bson!(1), &bson!(1.0)), Ordering::Equal);
        assert_eq!(cmp_bson(&Bson::Int64(2), &bson!(1.5)), Ordering::Greater);
        assert!(eq_bson(&Bson::Int32(7), &Bson::Int64(7)));
    }

    #[test]
    fn test_nan_sorts_low() {
        assert_eq!(cmp_bson(&bson!(f64::NAN), &bson!(-1e308)), Ordering::Less);
        assert_eq!(cmp_bson(&bson!(0.0), &bson!(f64::NAN)), Ordering::Greater);
    }

    #[test]
    fn test_array_and_document_compare() {
        assert_eq!(cmp_bson(&bson!([1, 2]), &bson!([1, 3])), Ordering::Less);
        assert_eq!(cmp_bson(&bson!([1, 2]), &bson!([1, 2, 0])), Ordering::Less);
        // Documents compare by key first, in insertion order.
        let a = Bson::Document(doc! {"a": 1, "b": 2});
        let b = Bson::Document(doc! {"a": 1, "c": 0});
        assert_eq!(cmp_bson(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_missing_sorts_with_null() {
        assert_eq!(cmp_opt(None, Some(&Bson::Null), None), Ordering::Equal);
        assert_eq!(cmp_opt(None, Some(&bson!(0)), None), Ordering::Less);
        assert_eq!(cmp_opt(Some(&bson!("")), None, None), Ordering::Greater);
    }

    #[test]
    fn test_collated_string_compare() {
        let c = crate::collation::Collation::from_document(
            &doc! {"locale": "en", "strength": 1},
        )
        .unwrap();
        assert_eq!(
            cmp_bson_collated(&bson!("ALPHA"), &bson!("alpha"), Some(&c)),
            Ordering::Equal
        );
        assert_eq!(
            cmp_bson_collated(&bson!(["B"]), &bson!(["b"]), Some(&c)),
            Ordering::Equal
        );
    }
}
