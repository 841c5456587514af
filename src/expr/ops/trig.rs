// src/expr/ops/trig.rs
// Trigonometric and angle-conversion operators. All take a single numeric
// operand (two for $atan2), propagate null and raise on non-numeric input.

use bson::Bson;

use crate::error::{Result, SiftError};
use crate::expr::eval::{nullish, require_args};
use crate::expr::{EvalCtx, Expression};
use crate::value::numeric_value;

use super::Registry;

pub(super) fn register(registry: &mut Registry) {
    registry.insert("$acos", |ctx, arg| checked(ctx, arg, "$acos", f64::acos));
    registry.insert("$acosh", |ctx, arg| checked(ctx, arg, "$acosh", f64::acosh));
    registry.insert("$asin", |ctx, arg| checked(ctx, arg, "$asin", f64::asin));
    registry.insert("$asinh", |ctx, arg| unary(ctx, arg, "$asinh", f64::asinh));
    registry.insert("$atan", |ctx, arg| unary(ctx, arg, "$atan", f64::atan));
    registry.insert("$atan2", op_atan2);
    registry.insert("$atanh", |ctx, arg| checked(ctx, arg, "$atanh", f64::atanh));
    registry.insert("$cos", |ctx, arg| unary(ctx, arg, "$cos", f64::cos));
    registry.insert("$cosh", |ctx, arg| unary(ctx, arg, "$cosh", f64::cosh));
    registry.insert("$degreesToRadians", |ctx, arg| {
        unary(ctx, arg, "$degreesToRadians", f64::to_radians)
    });
    registry.insert("$radiansToDegrees", |ctx, arg| {
        unary(ctx, arg, "$radiansToDegrees", f64::to_degrees)
    });
    registry.insert("$sin", |ctx, arg| unary(ctx, arg, "$sin", f64::sin));
    registry.insert("$sinh", |ctx, arg| unary(ctx, arg, "$sinh", f64::sinh));
    registry.insert("$tan", |ctx, arg| unary(ctx, arg, "$tan", f64::tan));
    registry.insert("$tanh", |ctx, arg| unary(ctx, arg, "$tanh", f64::tanh));
}

fn unary(ctx: &EvalCtx, arg: &Expression, operator: &'static str, f: fn(f64) -> f64) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args(operator, &args, 1)?;
    if nullish(&args[0]) {
        return Ok(Bson::Null);
    }
    let x = numeric_value(&args[0]).ok_or_else(|| {
        SiftError::type_mismatch(operator, format!("expected a number, got {:?}", args[0]))
    })?;
    Ok(Bson::Double(f(x)))
}

/// Like `unary` but rejects inputs outside the function's domain (the
/// inverse functions return NaN there, which MongoDB reports as an error).
fn checked(ctx: &EvalCtx, arg: &Expression, operator: &'static str, f: fn(f64) -> f64) -> Result<Bson> {
    match unary(ctx, arg, operator, f)? {
        Bson::Double(r) if r.is_nan() => Err(SiftError::type_mismatch(
            operator,
            "argument outside the function domain",
        )),
        other => Ok(other),
    }
}

fn op_atan2(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$atan2", &args, 2)?;
    if args.iter().any(nullish) {
        return Ok(Bson::Null);
    }
    let y = numeric_value(&args[0])
        .ok_or_else(|| SiftError::type_mismatch("$atan2", "expected numbers"))?;
    let x = numeric_value(&args[1])
        .ok_or_else(|| SiftError::type_mismatch("$atan2", "expected numbers"))?;
    Ok(Bson::Double(y.atan2(x)))
}
