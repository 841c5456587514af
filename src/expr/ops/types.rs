// src/expr/ops/types.rs
// Type inspection and conversion. $type reports int/long/double separately.
// The bare $to* forms raise on non-coercible input; $convert routes those
// failures through onError and null input through onNull.

use bson::Bson;
use chrono::TimeZone;

use crate::error::{Result, SiftError};
use crate::expr::eval::{nullish, require_args};
use crate::expr::{check_named_args, named_arg, EvalCtx, Expression};
use crate::value::is_numeric;

use super::Registry;

pub(super) fn register(registry: &mut Registry) {
    registry.insert("$convert", op_convert);
    registry.insert("$isNumber", op_is_number);
    registry.insert("$toBool", |ctx, arg| shorthand(ctx, arg, "$toBool", "bool"));
    registry.insert("$toDate", |ctx, arg| shorthand(ctx, arg, "$toDate", "date"));
    registry.insert("$toDouble", |ctx, arg| shorthand(ctx, arg, "$toDouble", "double"));
    registry.insert("$toInt", |ctx, arg| shorthand(ctx, arg, "$toInt", "int"));
    registry.insert("$toLong", |ctx, arg| shorthand(ctx, arg, "$toLong", "long"));
    registry.insert("$toString", |ctx, arg| shorthand(ctx, arg, "$toString", "string"));
    registry.insert("$type", op_type);
}

/// The `$type` name for a value; `None` (missing) reports "missing".
pub(crate) fn type_name(value: Option<&Bson>) -> &'static str {
    match value {
        None => "missing",
        Some(Bson::Double(_)) => "double",
        Some(Bson::String(_)) => "string",
        Some(Bson::Document(_)) => "object",
        Some(Bson::Array(_)) => "array",
        Some(Bson::Binary(_)) => "binData",
        Some(Bson::Undefined) => "undefined",
        Some(Bson::ObjectId(_)) => "objectId",
        Some(Bson::Boolean(_)) => "bool",
        Some(Bson::DateTime(_)) => "date",
        Some(Bson::Null) => "null",
        Some(Bson::RegularExpression(_)) => "regex",
        Some(Bson::DbPointer(_)) => "dbPointer",
        Some(Bson::JavaScriptCode(_)) => "javascript",
        Some(Bson::JavaScriptCodeWithScope(_)) => "javascriptWithScope",
        Some(Bson::Symbol(_)) => "symbol",
        Some(Bson::Int32(_)) => "int",
        Some(Bson::Timestamp(_)) => "timestamp",
        Some(Bson::Int64(_)) => "long",
        Some(Bson::Decimal128(_)) => "decimal",
        Some(Bson::MinKey) => "minKey",
        Some(Bson::MaxKey) => "maxKey",
    }
}

fn op_type(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let operands = arg.operands();
    if operands.len() != 1 {
        return Err(SiftError::InvalidExpression(
            "$type expects 1 argument".into(),
        ));
    }
    // Missing must stay distinguishable from null here.
    let value = ctx.compute_opt(operands[0])?;
    Ok(Bson::String(type_name(value.as_ref()).to_string()))
}

fn op_is_number(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$isNumber", &args, 1)?;
    Ok(Bson::Boolean(is_numeric(&args[0])))
}

fn shorthand(ctx: &EvalCtx, arg: &Expression, operator: &'static str, target: &str) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args(operator, &args, 1)?;
    if nullish(&args[0]) {
        return Ok(Bson::Null);
    }
    convert_to(operator, &args[0], target)
}

fn op_convert(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let fields = arg.named_args("$convert")?;
    check_named_args(fields, "$convert", &["input", "to", "onError", "onNull"])?;
    let input_expr = named_arg(fields, "input")
        .ok_or_else(|| SiftError::InvalidExpression("$convert requires input".into()))?;
    let to_expr = named_arg(fields, "to")
        .ok_or_else(|| SiftError::InvalidExpression("$convert requires to".into()))?;

    let target = match ctx.compute(to_expr)? {
        Bson::String(name) => name,
        Bson::Int32(code) => numeric_type_code("$convert", code as i64)?.to_string(),
        Bson::Int64(code) => numeric_type_code("$convert", code)?.to_string(),
        other => {
            return Err(SiftError::type_mismatch(
                "$convert",
                format!("to must be a type name or code, got {:?}", other),
            ))
        }
    };

    let input = ctx.compute(input_expr)?;
    if nullish(&input) {
        return match named_arg(fields, "onNull") {
            Some(expr) => ctx.compute(expr),
            None => Ok(Bson::Null),
        };
    }

    match convert_to("$convert", &input, &target) {
        Ok(converted) => Ok(converted),
        Err(error) => match named_arg(fields, "onError") {
            Some(expr) => ctx.compute(expr),
            None => Err(error),
        },
    }
}

fn numeric_type_code(operator: &'static str, code: i64) -> Result<&'static str> {
    match code {
        1 => Ok("double"),
        2 => Ok("string"),
        8 => Ok("bool"),
        9 => Ok("date"),
        16 => Ok("int"),
        18 => Ok("long"),
        _ => Err(SiftError::InvalidExpression(format!(
            "{}: unsupported type code {}",
            operator, code
        ))),
    }
}

fn convert_to(operator: &'static str, value: &Bson, target: &str) -> Result<Bson> {
    match target {
        "double" => to_double(operator, value).map(Bson::Double),
        "int" => {
            let n = to_integer(operator, value)?;
            if n < i32::MIN as i64 || n > i32::MAX as i64 {
                return Err(SiftError::type_mismatch(operator, "value out of int range"));
            }
            Ok(Bson::Int32(n as i32))
        }
        "long" => to_integer(operator, value).map(Bson::Int64),
        "bool" => Ok(Bson::Boolean(to_bool(value))),
        "string" => to_string(operator, value).map(Bson::String),
        "date" => to_date(operator, value),
        other => Err(SiftError::InvalidExpression(format!(
            "{}: cannot convert to {}",
            operator, other
        ))),
    }
}

fn to_double(operator: &'static str, value: &Bson) -> Result<f64> {
    match value {
        Bson::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Bson::DateTime(dt) => Ok(dt.timestamp_millis() as f64),
        Bson::String(s) => s.trim().parse::<f64>().map_err(|_| {
            SiftError::type_mismatch(operator, format!("cannot parse \"{}\" as a double", s))
        }),
        _ => crate::value::numeric_value(value).ok_or_else(|| {
            SiftError::type_mismatch(operator, format!("cannot convert {:?}", value))
        }),
    }
}

fn to_integer(operator: &'static str, value: &Bson) -> Result<i64> {
    match value {
        Bson::Int32(n) => Ok(*n as i64),
        Bson::Int64(n) => Ok(*n),
        Bson::Double(f) => {
            if f.is_nan() || f.is_infinite() || *f < i64::MIN as f64 || *f > i64::MAX as f64 {
                Err(SiftError::type_mismatch(operator, "value out of range"))
            } else {
                Ok(f.trunc() as i64)
            }
        }
        Bson::Boolean(b) => Ok(if *b { 1 } else { 0 }),
        Bson::DateTime(dt) => Ok(dt.timestamp_millis()),
        Bson::String(s) => s.trim().parse::<i64>().map_err(|_| {
            SiftError::type_mismatch(operator, format!("cannot parse \"{}\" as an integer", s))
        }),
        _ => Err(SiftError::type_mismatch(
            operator,
            format!("cannot convert {:?}", value),
        )),
    }
}

fn to_bool(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        _ => match crate::value::numeric_value(value) {
            Some(f) => f != 0.0,
            // Strings, dates, containers all convert to true.
            None => true,
        },
    }
}

fn to_string(operator: &'static str, value: &Bson) -> Result<String> {
    match value {
        Bson::String(s) => Ok(s.clone()),
        Bson::Int32(n) => Ok(n.to_string()),
        Bson::Int64(n) => Ok(n.to_string()),
        Bson::Double(f) => {
            if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e15 {
                Ok(format!("{}", *f as i64))
            } else {
                Ok(f.to_string())
            }
        }
        Bson::Boolean(b) => Ok(b.to_string()),
        Bson::DateTime(dt) => Ok(dt
            .to_chrono()
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string()),
        Bson::ObjectId(oid) => Ok(oid.to_hex()),
        Bson::Decimal128(d) => Ok(d.to_string()),
        _ => Err(SiftError::type_mismatch(
            operator,
            format!("cannot convert {:?} to string", value),
        )),
    }
}

fn to_date(operator: &'static str, value: &Bson) -> Result<Bson> {
    match value {
        Bson::DateTime(_) => Ok(value.clone()),
        Bson::Int32(n) => Ok(Bson::DateTime(bson::DateTime::from_millis(*n as i64))),
        Bson::Int64(n) => Ok(Bson::DateTime(bson::DateTime::from_millis(*n))),
        Bson::Double(f) => Ok(Bson::DateTime(bson::DateTime::from_millis(*f as i64))),
        Bson::Timestamp(ts) => Ok(Bson::DateTime(bson::DateTime::from_millis(
            ts.time as i64 * 1000,
        ))),
        Bson::String(s) => parse_date_string(s).ok_or_else(|| {
            SiftError::type_mismatch(operator, format!("cannot parse \"{}\" as a date", s))
        }),
        _ => Err(SiftError::type_mismatch(
            operator,
            format!("cannot convert {:?} to date", value),
        )),
    }
}

/// Accepts RFC 3339 plus the common date / date-time shorthands, UTC.
fn parse_date_string(s: &str) -> Option<Bson> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(Bson::DateTime(bson::DateTime::from_millis(
            dt.timestamp_millis(),
        )));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        let dt = chrono::Utc.from_utc_datetime(&naive);
        return Some(Bson::DateTime(bson::DateTime::from_millis(
            dt.timestamp_millis(),
        )));
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let dt = chrono::Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?);
        return Some(Bson::DateTime(bson::DateTime::from_millis(
            dt.timestamp_millis(),
        )));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use bson::{bson, doc};

    fn eval(spec: Bson) -> Result<Bson> {
        let options = Options::default();
        let expr = Expression::parse(&spec, &options)?;
        let doc = doc! {"i": 5, "d": 2.0, "l": Bson::Int64(9)};
        EvalCtx::new(&doc, &options).compute(&expr)
    }

    #[test]
    fn test_type_distinguishes_numeric_tags() {
        assert_eq!(eval(bson!({"$type": "$i"})).unwrap(), bson!("int"));
        assert_eq!(eval(bson!({"$type": "$d"})).unwrap(), bson!("double"));
        assert_eq!(eval(bson!({"$type": "$l"})).unwrap(), bson!("long"));
        assert_eq!(eval(bson!({"$type": "$missing"})).unwrap(), bson!("missing"));
        assert_eq!(eval(bson!({"$type": [Bson::Null]})).unwrap(), bson!("null"));
    }

    #[test]
    fn test_is_number() {
        assert_eq!(eval(bson!({"$isNumber": ["$d"]})).unwrap(), bson!(true));
        assert_eq!(eval(bson!({"$isNumber": ["five"]})).unwrap(), bson!(false));
    }

    #[test]
    fn test_to_int_and_long() {
        assert_eq!(eval(bson!({"$toInt": ["12"]})).unwrap(), Bson::Int32(12));
        assert_eq!(eval(bson!({"$toInt": [7.9]})).unwrap(), Bson::Int32(7));
        assert_eq!(eval(bson!({"$toLong": [true]})).unwrap(), Bson::Int64(1));
        assert!(eval(bson!({"$toInt": ["twelve"]})).is_err());
        assert_eq!(eval(bson!({"$toInt": [Bson::Null]})).unwrap(), Bson::Null);
    }

    #[test]
    fn test_to_double_and_bool() {
        assert_eq!(eval(bson!({"$toDouble": ["2.5"]})).unwrap(), bson!(2.5));
        assert_eq!(eval(bson!({"$toBool": [0]})).unwrap(), bson!(false));
        assert_eq!(eval(bson!({"$toBool": ["false"]})).unwrap(), bson!(true)); // any string is true
    }

    #[test]
    fn test_to_string() {
        assert_eq!(eval(bson!({"$toString": [12]})).unwrap(), bson!("12"));
        assert_eq!(eval(bson!({"$toString": [1.0]})).unwrap(), bson!("1"));
        assert_eq!(eval(bson!({"$toString": [2.5]})).unwrap(), bson!("2.5"));
        assert_eq!(eval(bson!({"$toString": [true]})).unwrap(), bson!("true"));
    }

    #[test]
    fn test_to_date() {
        assert_eq!(
            eval(bson!({"$toDate": [0]})).unwrap(),
            Bson::DateTime(bson::DateTime::from_millis(0))
        );
        assert_eq!(
            eval(bson!({"$toDate": ["1970-01-01T00:00:01Z"]})).unwrap(),
            Bson::DateTime(bson::DateTime::from_millis(1000))
        );
        assert!(eval(bson!({"$toDate": ["yesterday"]})).is_err());
    }

    #[test]
    fn test_convert_on_error_on_null() {
        assert_eq!(
            eval(bson!({"$convert": {"input": "nope", "to": "int", "onError": -1}})).unwrap(),
            bson!(-1)
        );
        assert_eq!(
            eval(bson!({"$convert": {"input": "$missing", "to": "int", "onNull": 0}})).unwrap(),
            bson!(0)
        );
        assert_eq!(
            eval(bson!({"$convert": {"input": "33", "to": "long"}})).unwrap(),
            Bson::Int64(33)
        );
        // Type codes are accepted.
        assert_eq!(
            eval(bson!({"$convert": {"input": 1, "to": 2}})).unwrap(),
            bson!("1")
        );
    }
}
