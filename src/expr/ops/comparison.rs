// src/expr/ops/comparison.rs
// Comparison operators over the canonical total order: unlike the query
// dialect these never type-bracket, so {"$lt": ["a", {}]} is true (strings
// order before documents). String comparisons honor the active collation.

use std::cmp::Ordering;

use bson::Bson;

use crate::error::Result;
use crate::expr::eval::require_args;
use crate::expr::{EvalCtx, Expression};
use crate::value::cmp_bson_collated;

use super::Registry;

pub(super) fn register(registry: &mut Registry) {
    registry.insert("$cmp", op_cmp);
    registry.insert("$eq", |ctx, arg| compare(ctx, arg, "$eq", |o| o == Ordering::Equal));
    registry.insert("$ne", |ctx, arg| compare(ctx, arg, "$ne", |o| o != Ordering::Equal));
    registry.insert("$gt", |ctx, arg| compare(ctx, arg, "$gt", |o| o == Ordering::Greater));
    registry.insert("$gte", |ctx, arg| compare(ctx, arg, "$gte", |o| o != Ordering::Less));
    registry.insert("$lt", |ctx, arg| compare(ctx, arg, "$lt", |o| o == Ordering::Less));
    registry.insert("$lte", |ctx, arg| compare(ctx, arg, "$lte", |o| o != Ordering::Greater));
}

fn ordered(ctx: &EvalCtx, arg: &Expression, operator: &'static str) -> Result<Ordering> {
    let args = ctx.eval_operands(arg)?;
    require_args(operator, &args, 2)?;
    Ok(cmp_bson_collated(&args[0], &args[1], ctx.collation()))
}

fn op_cmp(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    Ok(Bson::Int32(match ordered(ctx, arg, "$cmp")? {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }))
}

fn compare(
    ctx: &EvalCtx,
    arg: &Expression,
    operator: &'static str,
    test: fn(Ordering) -> bool,
) -> Result<Bson> {
    Ok(Bson::Boolean(test(ordered(ctx, arg, operator)?)))
}
