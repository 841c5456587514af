// src/expr/ops/set.rs
// Set operators. Membership is canonical-key equality (numeric types
// unify, collation folds string case at strength <= 2); result order is
// first occurrence, duplicates dropped.

use std::collections::HashSet;

use bson::Bson;

use crate::error::{Result, SiftError};
use crate::expr::eval::{nullish, require_args};
use crate::expr::{EvalCtx, Expression};
use crate::value::{canonical_key, is_truthy};

use super::Registry;

pub(super) fn register(registry: &mut Registry) {
    registry.insert("$allElementsTrue", op_all_elements_true);
    registry.insert("$anyElementTrue", op_any_element_true);
    registry.insert("$setDifference", op_set_difference);
    registry.insert("$setEquals", op_set_equals);
    registry.insert("$setIntersection", op_set_intersection);
    registry.insert("$setIsSubset", op_set_is_subset);
    registry.insert("$setUnion", op_set_union);
}

fn require_array<'a>(operator: &'static str, value: &'a Bson) -> Result<&'a Vec<Bson>> {
    match value {
        Bson::Array(elements) => Ok(elements),
        other => Err(SiftError::type_mismatch(
            operator,
            format!("expected an array, got {:?}", other),
        )),
    }
}

fn key_set(ctx: &EvalCtx, elements: &[Bson]) -> HashSet<String> {
    elements
        .iter()
        .map(|element| canonical_key(element, ctx.collation()))
        .collect()
}

fn dedupe(ctx: &EvalCtx, elements: &[Bson]) -> Vec<Bson> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for element in elements {
        if seen.insert(canonical_key(element, ctx.collation())) {
            out.push(element.clone());
        }
    }
    out
}

fn op_set_equals(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    if args.len() < 2 {
        return Err(SiftError::InvalidExpression(
            "$setEquals expects at least 2 arguments".into(),
        ));
    }
    let first = key_set(ctx, require_array("$setEquals", &args[0])?);
    for value in &args[1..] {
        if key_set(ctx, require_array("$setEquals", value)?) != first {
            return Ok(Bson::Boolean(false));
        }
    }
    Ok(Bson::Boolean(true))
}

fn op_set_union(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    let mut combined = Vec::new();
    for value in &args {
        if nullish(value) {
            return Ok(Bson::Null);
        }
        combined.extend(require_array("$setUnion", value)?.iter().cloned());
    }
    Ok(Bson::Array(dedupe(ctx, &combined)))
}

fn op_set_intersection(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    let mut result: Option<Vec<Bson>> = None;
    for value in &args {
        if nullish(value) {
            return Ok(Bson::Null);
        }
        let elements = require_array("$setIntersection", value)?;
        result = Some(match result {
            None => dedupe(ctx, elements),
            Some(current) => {
                let keys = key_set(ctx, elements);
                current
                    .into_iter()
                    .filter(|element| keys.contains(&canonical_key(element, ctx.collation())))
                    .collect()
            }
        });
    }
    Ok(Bson::Array(result.unwrap_or_default()))
}

fn op_set_difference(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$setDifference", &args, 2)?;
    if args.iter().any(nullish) {
        return Ok(Bson::Null);
    }
    let left = require_array("$setDifference", &args[0])?;
    let right = key_set(ctx, require_array("$setDifference", &args[1])?);
    let kept: Vec<Bson> = dedupe(ctx, left)
        .into_iter()
        .filter(|element| !right.contains(&canonical_key(element, ctx.collation())))
        .collect();
    Ok(Bson::Array(kept))
}

fn op_set_is_subset(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$setIsSubset", &args, 2)?;
    let left = require_array("$setIsSubset", &args[0])?;
    let right = key_set(ctx, require_array("$setIsSubset", &args[1])?);
    let subset = left
        .iter()
        .all(|element| right.contains(&canonical_key(element, ctx.collation())));
    Ok(Bson::Boolean(subset))
}

fn op_any_element_true(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$anyElementTrue", &args, 1)?;
    let elements = require_array("$anyElementTrue", &args[0])?;
    Ok(Bson::Boolean(elements.iter().any(is_truthy)))
}

fn op_all_elements_true(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$allElementsTrue", &args, 1)?;
    let elements = require_array("$allElementsTrue", &args[0])?;
    Ok(Bson::Boolean(elements.iter().all(is_truthy)))
}
