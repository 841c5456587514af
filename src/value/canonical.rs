// src/value/canonical.rs
// Deterministic string keys for hashing values: $group keys, $addToSet
// membership, $graphLookup visited-sets, window partitions.
//
// Numeric types normalize to one representation (Int32(1), Int64(1) and
// Double(1.0) share a key) while every other type is tagged so `1` and "1"
// never collide. Strings go through JSON escaping, which doubles as the
// delimiter guard for container keys.

use bson::Bson;

use crate::collation::Collation;

/// Canonical key for a value. Collation-equal strings (at strength <= 2)
/// share a key so `$group` honors the active collation.
pub fn canonical_key(value: &Bson, collation: Option<&Collation>) -> String {
    let mut out = String::new();
    write_key(&mut out, value, collation);
    out
}

/// Canonical key for a possibly-missing value; missing folds into null,
/// as `$group` treats documents without the `_id` expression's fields.
pub fn canonical_key_opt(value: Option<&Bson>, collation: Option<&Collation>) -> String {
    match value {
        Some(v) => canonical_key(v, collation),
        None => "null".to_string(),
    }
}

fn write_key(out: &mut String, value: &Bson, collation: Option<&Collation>) {
    match value {
        Bson::Null | Bson::Undefined => out.push_str("null"),
        Bson::MinKey => out.push_str("min"),
        Bson::MaxKey => out.push_str("max"),
        Bson::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),

        Bson::Int32(n) => write_integer(out, *n as i64),
        Bson::Int64(n) => write_integer(out, *n),
        Bson::Double(f) => write_double(out, *f),
        Bson::Decimal128(d) => match d.to_string().parse::<f64>() {
            Ok(f) => write_double(out, f),
            Err(_) => {
                out.push('D');
                out.push_str(&d.to_string());
            }
        },

        Bson::String(s) | Bson::Symbol(s) => write_string(out, s, collation),

        Bson::Array(elements) => {
            out.push('[');
            for (i, element) in elements.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_key(out, element, collation);
            }
            out.push(']');
        }

        Bson::Document(doc) => {
            out.push('{');
            for (i, (key, val)) in doc.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_key(out, val, collation);
            }
            out.push('}');
        }

        Bson::DateTime(dt) => {
            out.push('d');
            out.push_str(&dt.timestamp_millis().to_string());
        }
        Bson::Timestamp(ts) => {
            out.push('t');
            out.push_str(&ts.time.to_string());
            out.push(':');
            out.push_str(&ts.increment.to_string());
        }
        Bson::RegularExpression(re) => {
            out.push('r');
            out.push_str(&serde_json::to_string(&re.pattern).unwrap_or_default());
            out.push('/');
            out.push_str(&re.options);
        }
        Bson::ObjectId(oid) => {
            out.push('o');
            out.push_str(&oid.to_hex());
        }
        Bson::Binary(bin) => {
            out.push('b');
            out.push_str(&u8::from(bin.subtype).to_string());
            out.push(':');
            for byte in &bin.bytes {
                out.push_str(&format!("{:02x}", byte));
            }
        }
        Bson::JavaScriptCode(code) => {
            out.push('j');
            out.push_str(&serde_json::to_string(code).unwrap_or_default());
        }
        Bson::JavaScriptCodeWithScope(code) => {
            out.push('j');
            out.push_str(&serde_json::to_string(&code.code).unwrap_or_default());
        }
        Bson::DbPointer(_) => out.push('p'),
    }
}

fn write_integer(out: &mut String, n: i64) {
    out.push_str(&n.to_string());
}

fn write_double(out: &mut String, f: f64) {
    // Integral doubles share their key with the integer types.
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        write_integer(out, f as i64);
    } else {
        out.push_str(&f.to_string());
    }
}

fn write_string(out: &mut String, s: &str, collation: Option<&Collation>) {
    let folded;
    let body = match collation {
        Some(c) if c.strength <= 2 => {
            folded = s.to_lowercase();
            folded.as_str()
        }
        _ => s,
    };
    out.push_str(&serde_json::to_string(body).unwrap_or_default());
}
