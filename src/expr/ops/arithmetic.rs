// src/expr/ops/arithmetic.rs
// Arithmetic and numeric-fold operators. Null operands propagate null;
// non-numeric operands raise (these operators are in the documented
// raising subset). Integer inputs keep integer results where the operation
// allows it, promoting to double on overflow; $divide always yields a
// double.

use bson::Bson;

use crate::error::{Result, SiftError};
use crate::expr::eval::{nullish, require_args};
use crate::expr::{EvalCtx, Expression};
use crate::value::{cmp_bson, numeric_value};

use super::Registry;

pub(super) fn register(registry: &mut Registry) {
    registry.insert("$abs", op_abs);
    registry.insert("$add", op_add);
    registry.insert("$avg", op_avg);
    registry.insert("$ceil", op_ceil);
    registry.insert("$divide", op_divide);
    registry.insert("$exp", op_exp);
    registry.insert("$floor", op_floor);
    registry.insert("$ln", op_ln);
    registry.insert("$log", op_log);
    registry.insert("$log10", op_log10);
    registry.insert("$max", op_max);
    registry.insert("$min", op_min);
    registry.insert("$mod", op_mod);
    registry.insert("$multiply", op_multiply);
    registry.insert("$pow", op_pow);
    registry.insert("$round", op_round);
    registry.insert("$sqrt", op_sqrt);
    registry.insert("$stdDevPop", op_std_dev_pop);
    registry.insert("$stdDevSamp", op_std_dev_samp);
    registry.insert("$subtract", op_subtract);
    registry.insert("$sum", op_sum);
    registry.insert("$trunc", op_trunc);
}

fn as_int(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        _ => None,
    }
}

fn require_number(operator: &'static str, value: &Bson) -> Result<f64> {
    numeric_value(value).ok_or_else(|| {
        SiftError::type_mismatch(operator, format!("expected a number, got {:?}", value))
    })
}

fn op_add(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    let mut date_millis: Option<i64> = None;
    let mut int_sum: i64 = 0;
    let mut float_sum: f64 = 0.0;
    let mut saw_float = false;
    let mut overflowed = false;

    for value in &args {
        if nullish(value) {
            return Ok(Bson::Null);
        }
        if let Bson::DateTime(dt) = value {
            if date_millis.is_some() {
                return Err(SiftError::type_mismatch(
                    "$add",
                    "at most one date operand is allowed",
                ));
            }
            date_millis = Some(dt.timestamp_millis());
            continue;
        }
        if let Some(n) = as_int(value) {
            match int_sum.checked_add(n) {
                Some(sum) => int_sum = sum,
                None => {
                    overflowed = true;
                    float_sum += n as f64;
                }
            }
        } else {
            float_sum += require_number("$add", value)?;
            saw_float = true;
        }
    }

    if let Some(base) = date_millis {
        let offset = float_sum + int_sum as f64;
        return Ok(Bson::DateTime(bson::DateTime::from_millis(
            base + offset as i64,
        )));
    }
    if saw_float || overflowed {
        Ok(Bson::Double(float_sum + int_sum as f64))
    } else {
        Ok(Bson::Int64(int_sum))
    }
}

fn op_subtract(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$subtract", &args, 2)?;
    if args.iter().any(nullish) {
        return Ok(Bson::Null);
    }
    match (&args[0], &args[1]) {
        (Bson::DateTime(a), Bson::DateTime(b)) => {
            Ok(Bson::Int64(a.timestamp_millis() - b.timestamp_millis()))
        }
        (Bson::DateTime(a), b) => {
            let offset = require_number("$subtract", b)?;
            Ok(Bson::DateTime(bson::DateTime::from_millis(
                a.timestamp_millis() - offset as i64,
            )))
        }
        (a, b) => {
            if let (Some(x), Some(y)) = (as_int(a), as_int(b)) {
                if let Some(diff) = x.checked_sub(y) {
                    return Ok(Bson::Int64(diff));
                }
            }
            let x = require_number("$subtract", a)?;
            let y = require_number("$subtract", b)?;
            Ok(Bson::Double(x - y))
        }
    }
}

fn op_multiply(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    let mut int_product: i64 = 1;
    let mut float_product: f64 = 1.0;
    let mut saw_float = false;

    for value in &args {
        if nullish(value) {
            return Ok(Bson::Null);
        }
        if !saw_float {
            if let Some(n) = as_int(value) {
                match int_product.checked_mul(n) {
                    Some(product) => {
                        int_product = product;
                        continue;
                    }
                    None => {
                        saw_float = true;
                        float_product = int_product as f64 * n as f64;
                        continue;
                    }
                }
            }
            saw_float = true;
            float_product = int_product as f64 * require_number("$multiply", value)?;
        } else {
            float_product *= require_number("$multiply", value)?;
        }
    }

    if saw_float {
        Ok(Bson::Double(float_product))
    } else {
        Ok(Bson::Int64(int_product))
    }
}

fn op_divide(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$divide", &args, 2)?;
    if args.iter().any(nullish) {
        return Ok(Bson::Null);
    }
    let dividend = require_number("$divide", &args[0])?;
    let divisor = require_number("$divide", &args[1])?;
    if divisor == 0.0 {
        return Err(SiftError::DivideByZero("$divide"));
    }
    Ok(Bson::Double(dividend / divisor))
}

fn op_mod(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$mod", &args, 2)?;
    if args.iter().any(nullish) {
        return Ok(Bson::Null);
    }
    if let (Some(x), Some(y)) = (as_int(&args[0]), as_int(&args[1])) {
        if y == 0 {
            return Err(SiftError::DivideByZero("$mod"));
        }
        return Ok(Bson::Int64(x % y));
    }
    let x = require_number("$mod", &args[0])?;
    let y = require_number("$mod", &args[1])?;
    if y == 0.0 {
        return Err(SiftError::DivideByZero("$mod"));
    }
    Ok(Bson::Double(x % y))
}

fn op_abs(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$abs", &args, 1)?;
    if nullish(&args[0]) {
        return Ok(Bson::Null);
    }
    if let Some(n) = as_int(&args[0]) {
        return Ok(match n.checked_abs() {
            Some(a) => Bson::Int64(a),
            None => Bson::Double((n as f64).abs()),
        });
    }
    Ok(Bson::Double(require_number("$abs", &args[0])?.abs()))
}

fn op_pow(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$pow", &args, 2)?;
    if args.iter().any(nullish) {
        return Ok(Bson::Null);
    }
    if let (Some(base), Some(exp)) = (as_int(&args[0]), as_int(&args[1])) {
        if (0..=u32::MAX as i64).contains(&exp) {
            if let Some(result) = base.checked_pow(exp as u32) {
                return Ok(Bson::Int64(result));
            }
        }
    }
    let base = require_number("$pow", &args[0])?;
    let exp = require_number("$pow", &args[1])?;
    Ok(Bson::Double(base.powf(exp)))
}

fn op_sqrt(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$sqrt", &args, 1)?;
    if nullish(&args[0]) {
        return Ok(Bson::Null);
    }
    let x = require_number("$sqrt", &args[0])?;
    if x < 0.0 {
        return Err(SiftError::type_mismatch("$sqrt", "argument must be >= 0"));
    }
    Ok(Bson::Double(x.sqrt()))
}

fn op_exp(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    unary_float(ctx, arg, "$exp", |x| Ok(x.exp()))
}

fn op_ln(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    unary_float(ctx, arg, "$ln", |x| {
        if x <= 0.0 {
            Err(SiftError::type_mismatch("$ln", "argument must be > 0"))
        } else {
            Ok(x.ln())
        }
    })
}

fn op_log10(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    unary_float(ctx, arg, "$log10", |x| {
        if x <= 0.0 {
            Err(SiftError::type_mismatch("$log10", "argument must be > 0"))
        } else {
            Ok(x.log10())
        }
    })
}

fn op_log(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$log", &args, 2)?;
    if args.iter().any(nullish) {
        return Ok(Bson::Null);
    }
    let x = require_number("$log", &args[0])?;
    let base = require_number("$log", &args[1])?;
    if x <= 0.0 || base <= 0.0 || base == 1.0 {
        return Err(SiftError::type_mismatch(
            "$log",
            "argument must be > 0 with a base > 0 and != 1",
        ));
    }
    Ok(Bson::Double(x.log(base)))
}

fn op_ceil(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    int_preserving_unary(ctx, arg, "$ceil", f64::ceil)
}

fn op_floor(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    int_preserving_unary(ctx, arg, "$floor", f64::floor)
}

fn op_trunc(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    placed_rounding(ctx, arg, "$trunc", |x| x.trunc())
}

fn op_round(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    placed_rounding(ctx, arg, "$round", round_ties_even)
}

/// Round-half-to-even, MongoDB's rounding mode.
fn round_ties_even(x: f64) -> f64 {
    let floor = x.floor();
    let diff = x - floor;
    if diff > 0.5 {
        floor + 1.0
    } else if diff < 0.5 {
        floor
    } else if (floor as i64) % 2 == 0 {
        floor
    } else {
        floor + 1.0
    }
}

fn placed_rounding(
    ctx: &EvalCtx,
    arg: &Expression,
    operator: &'static str,
    f: fn(f64) -> f64,
) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    if args.is_empty() || args.len() > 2 {
        return Err(SiftError::InvalidExpression(format!(
            "{} expects 1 or 2 arguments, got {}",
            operator,
            args.len()
        )));
    }
    if args.iter().any(nullish) {
        return Ok(Bson::Null);
    }
    let place = match args.get(1) {
        Some(p) => as_int(p).ok_or_else(|| {
            SiftError::type_mismatch(operator, "place must be an integer")
        })?,
        None => 0,
    };
    if !(-20..=100).contains(&place) {
        return Err(SiftError::type_mismatch(
            operator,
            "place must be between -20 and 100",
        ));
    }
    let scale = 10f64.powi(place as i32);
    let is_int = as_int(&args[0]).is_some();
    let x = require_number(operator, &args[0])?;
    let result = f(x * scale) / scale;
    if is_int {
        Ok(Bson::Int64(result as i64))
    } else {
        Ok(Bson::Double(result))
    }
}

fn int_preserving_unary(
    ctx: &EvalCtx,
    arg: &Expression,
    operator: &'static str,
    f: fn(f64) -> f64,
) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args(operator, &args, 1)?;
    if nullish(&args[0]) {
        return Ok(Bson::Null);
    }
    if let Some(n) = as_int(&args[0]) {
        return Ok(Bson::Int64(n));
    }
    Ok(Bson::Double(f(require_number(operator, &args[0])?)))
}

fn unary_float(
    ctx: &EvalCtx,
    arg: &Expression,
    operator: &'static str,
    f: impl Fn(f64) -> Result<f64>,
) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args(operator, &args, 1)?;
    if nullish(&args[0]) {
        return Ok(Bson::Null);
    }
    Ok(Bson::Double(f(require_number(operator, &args[0])?)?))
}

// ---------------------------------------------------------------------------
// Numeric folds (the accumulator names usable in plain expressions)
// ---------------------------------------------------------------------------

/// A single operand that evaluates to an array folds its elements;
/// otherwise the positional operands fold directly.
fn fold_inputs(ctx: &EvalCtx, arg: &Expression) -> Result<Vec<Bson>> {
    let mut args = ctx.eval_operands(arg)?;
    if args.len() == 1 {
        return Ok(match args.pop().expect("len checked") {
            Bson::Array(elements) => elements,
            other => vec![other],
        });
    }
    Ok(args)
}

fn op_sum(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let values = fold_inputs(ctx, arg)?;
    let mut int_sum: i64 = 0;
    let mut float_sum: f64 = 0.0;
    let mut saw_float = false;
    for value in &values {
        // Non-numeric values are ignored, matching the accumulator.
        if let Some(n) = as_int(value) {
            match int_sum.checked_add(n) {
                Some(sum) => int_sum = sum,
                None => {
                    saw_float = true;
                    float_sum += n as f64;
                }
            }
        } else if let Some(f) = numeric_value(value) {
            saw_float = true;
            float_sum += f;
        }
    }
    if saw_float {
        Ok(Bson::Double(float_sum + int_sum as f64))
    } else {
        Ok(Bson::Int64(int_sum))
    }
}

fn op_avg(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let values = fold_inputs(ctx, arg)?;
    let mut sum = 0.0;
    let mut count = 0u64;
    for value in &values {
        if let Some(f) = numeric_value(value) {
            sum += f;
            count += 1;
        }
    }
    if count == 0 {
        Ok(Bson::Null)
    } else {
        Ok(Bson::Double(sum / count as f64))
    }
}

fn op_min(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    fold_extremum(ctx, arg, std::cmp::Ordering::Less)
}

fn op_max(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    fold_extremum(ctx, arg, std::cmp::Ordering::Greater)
}

fn fold_extremum(ctx: &EvalCtx, arg: &Expression, keep: std::cmp::Ordering) -> Result<Bson> {
    let values = fold_inputs(ctx, arg)?;
    let mut best: Option<Bson> = None;
    for value in values {
        if nullish(&value) {
            continue;
        }
        best = Some(match best {
            None => value,
            Some(current) => {
                if cmp_bson(&value, &current) == keep {
                    value
                } else {
                    current
                }
            }
        });
    }
    Ok(best.unwrap_or(Bson::Null))
}

fn op_std_dev_pop(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    std_dev(ctx, arg, false)
}

fn op_std_dev_samp(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    std_dev(ctx, arg, true)
}

fn std_dev(ctx: &EvalCtx, arg: &Expression, sample: bool) -> Result<Bson> {
    let values = fold_inputs(ctx, arg)?;
    let mut state = crate::aggregation::group::Welford::default();
    for value in &values {
        if let Some(f) = numeric_value(value) {
            state.push(f);
        }
    }
    Ok(state
        .finish(sample)
        .map(Bson::Double)
        .unwrap_or(Bson::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use bson::{bson, doc};

    fn eval(spec: Bson) -> Result<Bson> {
        let options = Options::default();
        let expr = Expression::parse(&spec, &options)?;
        let doc = doc! {"n": 4, "xs": [1, 2, 3, 4]};
        EvalCtx::new(&doc, &options).compute(&expr)
    }

    #[test]
    fn test_add_integers_stay_integral() {
        assert_eq!(eval(bson!({"$add": [1, 2, 3]})).unwrap(), Bson::Int64(6));
        assert_eq!(
            eval(bson!({"$add": [1, 2.5]})).unwrap(),
            Bson::Double(3.5)
        );
    }

    #[test]
    fn test_add_null_propagates() {
        assert_eq!(eval(bson!({"$add": [1, Bson::Null]})).unwrap(), Bson::Null);
        assert_eq!(eval(bson!({"$add": [1, "$missing"]})).unwrap(), Bson::Null);
    }

    #[test]
    fn test_add_date_shifts() {
        let date = Bson::DateTime(bson::DateTime::from_millis(1_000));
        let got = eval(bson!({"$add": [date, 500]})).unwrap();
        assert_eq!(got, Bson::DateTime(bson::DateTime::from_millis(1_500)));
    }

    #[test]
    fn test_add_string_raises() {
        assert!(eval(bson!({"$add": [1, "two"]})).is_err());
    }

    #[test]
    fn test_subtract_dates_gives_millis() {
        let a = Bson::DateTime(bson::DateTime::from_millis(5_000));
        let b = Bson::DateTime(bson::DateTime::from_millis(2_000));
        assert_eq!(
            eval(bson!({"$subtract": [a, b]})).unwrap(),
            Bson::Int64(3_000)
        );
    }

    #[test]
    fn test_divide_and_zero() {
        assert_eq!(
            eval(bson!({"$divide": [7, 2]})).unwrap(),
            Bson::Double(3.5)
        );
        assert!(matches!(
            eval(bson!({"$divide": [1, 0]})),
            Err(SiftError::DivideByZero("$divide"))
        ));
    }

    #[test]
    fn test_mod() {
        assert_eq!(eval(bson!({"$mod": [7, 3]})).unwrap(), Bson::Int64(1));
        assert!(eval(bson!({"$mod": [7, 0]})).is_err());
    }

    #[test]
    fn test_round_ties_even() {
        assert_eq!(eval(bson!({"$round": [2.5]})).unwrap(), Bson::Double(2.0));
        assert_eq!(eval(bson!({"$round": [3.5]})).unwrap(), Bson::Double(4.0));
        assert_eq!(
            eval(bson!({"$round": [3.14159, 2]})).unwrap(),
            Bson::Double(3.14)
        );
    }

    #[test]
    fn test_trunc_and_floor_and_ceil() {
        assert_eq!(eval(bson!({"$trunc": [7.9]})).unwrap(), Bson::Double(7.0));
        assert_eq!(eval(bson!({"$floor": [-1.5]})).unwrap(), Bson::Double(-2.0));
        assert_eq!(eval(bson!({"$ceil": [1.1]})).unwrap(), Bson::Double(2.0));
        assert_eq!(eval(bson!({"$ceil": [5]})).unwrap(), Bson::Int64(5));
    }

    #[test]
    fn test_sum_over_array_field() {
        assert_eq!(eval(bson!({"$sum": "$xs"})).unwrap(), Bson::Int64(10));
        // Non-numeric elements are ignored.
        assert_eq!(
            eval(bson!({"$sum": [1, "skip", 2]})).unwrap(),
            Bson::Int64(3)
        );
        assert_eq!(eval(bson!({"$sum": "$missing"})).unwrap(), Bson::Int64(0));
    }

    #[test]
    fn test_avg_min_max() {
        assert_eq!(eval(bson!({"$avg": "$xs"})).unwrap(), Bson::Double(2.5));
        assert_eq!(eval(bson!({"$min": "$xs"})).unwrap(), Bson::Int32(1));
        assert_eq!(eval(bson!({"$max": "$xs"})).unwrap(), Bson::Int32(4));
        assert_eq!(eval(bson!({"$avg": "$missing"})).unwrap(), Bson::Null);
    }

    #[test]
    fn test_std_dev() {
        let got = eval(bson!({"$stdDevPop": [2, 4, 4, 4, 5, 5, 7, 9]})).unwrap();
        match got {
            Bson::Double(f) => assert!((f - 2.0).abs() < 1e-9),
            other => panic!("expected double, got {:?}", other),
        }
        assert_eq!(eval(bson!({"$stdDevSamp": [1]})).unwrap(), Bson::Null);
    }

    #[test]
    fn test_pow_sqrt_logs() {
        assert_eq!(eval(bson!({"$pow": [2, 10]})).unwrap(), Bson::Int64(1024));
        assert_eq!(eval(bson!({"$sqrt": [9]})).unwrap(), Bson::Double(3.0));
        assert!(eval(bson!({"$sqrt": [-1]})).is_err());
        assert_eq!(eval(bson!({"$log": [8, 2]})).unwrap(), Bson::Double(3.0));
        assert!(eval(bson!({"$ln": [0]})).is_err());
    }

    #[test]
    fn test_abs() {
        assert_eq!(eval(bson!({"$abs": [-5]})).unwrap(), Bson::Int64(5));
        assert_eq!(eval(bson!({"$abs": [-2.5]})).unwrap(), Bson::Double(2.5));
        assert_eq!(eval(bson!({"$abs": [Bson::Null]})).unwrap(), Bson::Null);
    }
}
