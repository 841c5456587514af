// src/expr/ops/array.rs
// Array operators, including the higher-order ones ($map, $filter, $reduce)
// that bind iteration variables into a child frame.

use bson::{Bson, Document};

use crate::error::{Result, SiftError};
use crate::expr::eval::{nullish, require_args};
use crate::expr::{check_named_args, named_arg, EvalCtx, Expression};
use crate::value::{cmp_bson_collated, eq_bson_collated};

use super::Registry;

pub(super) fn register(registry: &mut Registry) {
    registry.insert("$arrayElemAt", op_array_elem_at);
    registry.insert("$arrayToObject", op_array_to_object);
    registry.insert("$concatArrays", op_concat_arrays);
    registry.insert("$filter", op_filter);
    registry.insert("$first", |ctx, arg| first_or_last(ctx, arg, "$first", false));
    registry.insert("$firstN", |ctx, arg| first_or_last_n(ctx, arg, "$firstN", false));
    registry.insert("$in", op_in);
    registry.insert("$indexOfArray", op_index_of_array);
    registry.insert("$isArray", op_is_array);
    registry.insert("$last", |ctx, arg| first_or_last(ctx, arg, "$last", true));
    registry.insert("$lastN", |ctx, arg| first_or_last_n(ctx, arg, "$lastN", true));
    registry.insert("$map", op_map);
    registry.insert("$range", op_range);
    registry.insert("$reduce", op_reduce);
    registry.insert("$reverseArray", op_reverse_array);
    registry.insert("$size", op_size);
    registry.insert("$slice", op_slice);
    registry.insert("$sortArray", op_sort_array);
    registry.insert("$zip", op_zip);
}

fn require_array(operator: &'static str, value: &Bson) -> Result<Vec<Bson>> {
    match value {
        Bson::Array(elements) => Ok(elements.clone()),
        other => Err(SiftError::type_mismatch(
            operator,
            format!("expected an array, got {:?}", other),
        )),
    }
}

fn int_arg(operator: &'static str, value: &Bson) -> Result<i64> {
    match value {
        Bson::Int32(n) => Ok(*n as i64),
        Bson::Int64(n) => Ok(*n),
        Bson::Double(f) if f.fract() == 0.0 => Ok(*f as i64),
        _ => Err(SiftError::type_mismatch(
            operator,
            format!("expected an integer, got {:?}", value),
        )),
    }
}

fn op_size(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$size", &args, 1)?;
    Ok(Bson::Int32(require_array("$size", &args[0])?.len() as i32))
}

fn op_is_array(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$isArray", &args, 1)?;
    Ok(Bson::Boolean(matches!(args[0], Bson::Array(_))))
}

fn op_array_elem_at(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$arrayElemAt", &args, 2)?;
    if args.iter().any(nullish) {
        return Ok(Bson::Null);
    }
    let elements = require_array("$arrayElemAt", &args[0])?;
    let index = int_arg("$arrayElemAt", &args[1])?;
    let index = if index < 0 {
        index + elements.len() as i64
    } else {
        index
    };
    if index < 0 || index as usize >= elements.len() {
        // Out of range resolves to missing; null at the value boundary.
        return Ok(Bson::Null);
    }
    Ok(elements[index as usize].clone())
}

fn first_or_last(ctx: &EvalCtx, arg: &Expression, operator: &'static str, last: bool) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args(operator, &args, 1)?;
    if nullish(&args[0]) {
        return Ok(Bson::Null);
    }
    let elements = require_array(operator, &args[0])?;
    let picked = if last {
        elements.last()
    } else {
        elements.first()
    };
    Ok(picked.cloned().unwrap_or(Bson::Null))
}

fn first_or_last_n(
    ctx: &EvalCtx,
    arg: &Expression,
    operator: &'static str,
    last: bool,
) -> Result<Bson> {
    let fields = arg.named_args(operator)?;
    check_named_args(fields, operator, &["n", "input"])?;
    let n_expr = named_arg(fields, "n")
        .ok_or_else(|| SiftError::InvalidExpression(format!("{} requires n", operator)))?;
    let input_expr = named_arg(fields, "input")
        .ok_or_else(|| SiftError::InvalidExpression(format!("{} requires input", operator)))?;

    let n = int_arg(operator, &ctx.compute(n_expr)?)?;
    if n <= 0 {
        return Err(SiftError::InvalidExpression(format!(
            "{}: n must be a positive integer",
            operator
        )));
    }
    let input = ctx.compute(input_expr)?;
    if nullish(&input) {
        return Ok(Bson::Null);
    }
    let elements = require_array(operator, &input)?;
    let n = (n as usize).min(elements.len());
    let picked = if last {
        elements[elements.len() - n..].to_vec()
    } else {
        elements[..n].to_vec()
    };
    Ok(Bson::Array(picked))
}

fn op_in(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$in", &args, 2)?;
    let elements = require_array("$in", &args[1])?;
    let found = elements
        .iter()
        .any(|element| eq_bson_collated(element, &args[0], ctx.collation()));
    Ok(Bson::Boolean(found))
}

fn op_index_of_array(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    if args.len() < 2 || args.len() > 4 {
        return Err(SiftError::InvalidExpression(
            "$indexOfArray expects 2 to 4 arguments".into(),
        ));
    }
    if nullish(&args[0]) {
        return Ok(Bson::Null);
    }
    let elements = require_array("$indexOfArray", &args[0])?;
    let start = match args.get(2) {
        Some(v) => int_arg("$indexOfArray", v)?.max(0) as usize,
        None => 0,
    };
    let end = match args.get(3) {
        Some(v) => (int_arg("$indexOfArray", v)?.max(0) as usize).min(elements.len()),
        None => elements.len(),
    };
    for index in start..end {
        if eq_bson_collated(&elements[index], &args[1], ctx.collation()) {
            return Ok(Bson::Int32(index as i32));
        }
    }
    Ok(Bson::Int32(-1))
}

fn op_concat_arrays(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    let mut out = Vec::new();
    for value in &args {
        if nullish(value) {
            return Ok(Bson::Null);
        }
        out.extend(require_array("$concatArrays", value)?);
    }
    Ok(Bson::Array(out))
}

fn op_reverse_array(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$reverseArray", &args, 1)?;
    if nullish(&args[0]) {
        return Ok(Bson::Null);
    }
    let mut elements = require_array("$reverseArray", &args[0])?;
    elements.reverse();
    Ok(Bson::Array(elements))
}

fn op_slice(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    if args.len() < 2 || args.len() > 3 {
        return Err(SiftError::InvalidExpression(
            "$slice expects 2 or 3 arguments".into(),
        ));
    }
    if nullish(&args[0]) {
        return Ok(Bson::Null);
    }
    let elements = require_array("$slice", &args[0])?;
    let len = elements.len() as i64;

    if args.len() == 2 {
        let n = int_arg("$slice", &args[1])?;
        let slice = if n >= 0 {
            &elements[..(n.min(len)) as usize]
        } else {
            &elements[(len + n.max(-len)) as usize..]
        };
        return Ok(Bson::Array(slice.to_vec()));
    }

    let position = int_arg("$slice", &args[1])?;
    let count = int_arg("$slice", &args[2])?;
    if count <= 0 {
        return Err(SiftError::InvalidExpression(
            "$slice: count must be positive when a position is given".into(),
        ));
    }
    let start = if position < 0 {
        (len + position).max(0)
    } else {
        position.min(len)
    } as usize;
    let end = (start + count as usize).min(elements.len());
    Ok(Bson::Array(elements[start..end].to_vec()))
}

fn op_range(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    if args.len() < 2 || args.len() > 3 {
        return Err(SiftError::InvalidExpression(
            "$range expects 2 or 3 arguments".into(),
        ));
    }
    let start = int_arg("$range", &args[0])?;
    let end = int_arg("$range", &args[1])?;
    let step = match args.get(2) {
        Some(v) => int_arg("$range", v)?,
        None => 1,
    };
    if step == 0 {
        return Err(SiftError::InvalidExpression(
            "$range: step must be non-zero".into(),
        ));
    }
    let mut out = Vec::new();
    let mut current = start;
    while (step > 0 && current < end) || (step < 0 && current > end) {
        out.push(Bson::Int32(current as i32));
        current += step;
    }
    Ok(Bson::Array(out))
}

fn op_map(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let fields = arg.named_args("$map")?;
    check_named_args(fields, "$map", &["input", "as", "in"])?;
    let input_expr = named_arg(fields, "input")
        .ok_or_else(|| SiftError::InvalidExpression("$map requires input".into()))?;
    let in_expr = named_arg(fields, "in")
        .ok_or_else(|| SiftError::InvalidExpression("$map requires in".into()))?;
    let var_name = match named_arg(fields, "as") {
        Some(expr) => expr.literal_str("$map", "as")?.to_string(),
        None => "this".to_string(),
    };

    let input = ctx.compute(input_expr)?;
    if nullish(&input) {
        return Ok(Bson::Null);
    }
    let elements = require_array("$map", &input)?;
    let mut out = Vec::with_capacity(elements.len());
    for element in elements {
        let child = ctx.bind(&var_name, element);
        out.push(child.compute(in_expr)?);
    }
    Ok(Bson::Array(out))
}

fn op_filter(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let fields = arg.named_args("$filter")?;
    check_named_args(fields, "$filter", &["input", "as", "cond", "limit"])?;
    let input_expr = named_arg(fields, "input")
        .ok_or_else(|| SiftError::InvalidExpression("$filter requires input".into()))?;
    let cond_expr = named_arg(fields, "cond")
        .ok_or_else(|| SiftError::InvalidExpression("$filter requires cond".into()))?;
    let var_name = match named_arg(fields, "as") {
        Some(expr) => expr.literal_str("$filter", "as")?.to_string(),
        None => "this".to_string(),
    };
    let limit = match named_arg(fields, "limit") {
        Some(limit_expr) => {
            let limit = ctx.compute(limit_expr)?;
            if nullish(&limit) {
                None
            } else {
                let n = int_arg("$filter", &limit)?;
                if n < 1 {
                    return Err(SiftError::InvalidExpression(
                        "$filter: limit must be at least 1".into(),
                    ));
                }
                Some(n as usize)
            }
        }
        None => None,
    };

    let input = ctx.compute(input_expr)?;
    if nullish(&input) {
        return Ok(Bson::Null);
    }
    let elements = require_array("$filter", &input)?;
    let mut out = Vec::new();
    for element in elements {
        if limit.map_or(false, |n| out.len() >= n) {
            break;
        }
        let child = ctx.bind(&var_name, element.clone());
        if child.truthy(cond_expr)? {
            out.push(element);
        }
    }
    Ok(Bson::Array(out))
}

fn op_reduce(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let fields = arg.named_args("$reduce")?;
    check_named_args(fields, "$reduce", &["input", "initialValue", "in"])?;
    let input_expr = named_arg(fields, "input")
        .ok_or_else(|| SiftError::InvalidExpression("$reduce requires input".into()))?;
    let initial_expr = named_arg(fields, "initialValue")
        .ok_or_else(|| SiftError::InvalidExpression("$reduce requires initialValue".into()))?;
    let in_expr = named_arg(fields, "in")
        .ok_or_else(|| SiftError::InvalidExpression("$reduce requires in".into()))?;

    let input = ctx.compute(input_expr)?;
    if nullish(&input) {
        return Ok(Bson::Null);
    }
    let elements = require_array("$reduce", &input)?;
    let mut accumulator = ctx.compute(initial_expr)?;
    for element in elements {
        let child = ctx.bind("value", accumulator).bind("this", element);
        accumulator = child.compute(in_expr)?;
    }
    Ok(accumulator)
}

fn op_zip(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let fields = arg.named_args("$zip")?;
    check_named_args(fields, "$zip", &["inputs", "useLongestLength", "defaults"])?;
    let inputs_expr = named_arg(fields, "inputs")
        .ok_or_else(|| SiftError::InvalidExpression("$zip requires inputs".into()))?;

    let inputs = ctx.compute(inputs_expr)?;
    let inputs = require_array("$zip", &inputs)?;
    let mut arrays = Vec::with_capacity(inputs.len());
    for input in &inputs {
        if nullish(input) {
            return Ok(Bson::Null);
        }
        arrays.push(require_array("$zip", input)?);
    }
    if arrays.is_empty() {
        return Err(SiftError::InvalidExpression(
            "$zip requires a non-empty inputs array".into(),
        ));
    }

    let use_longest = match named_arg(fields, "useLongestLength") {
        Some(expr) => matches!(ctx.compute(expr)?, Bson::Boolean(true)),
        None => false,
    };
    let defaults: Option<Vec<Bson>> = match named_arg(fields, "defaults") {
        Some(expr) => {
            if !use_longest {
                return Err(SiftError::InvalidExpression(
                    "$zip: defaults requires useLongestLength".into(),
                ));
            }
            Some(require_array("$zip", &ctx.compute(expr)?)?)
        }
        None => None,
    };

    let length = if use_longest {
        arrays.iter().map(|a| a.len()).max().unwrap_or(0)
    } else {
        arrays.iter().map(|a| a.len()).min().unwrap_or(0)
    };

    let mut out = Vec::with_capacity(length);
    for index in 0..length {
        let mut row = Vec::with_capacity(arrays.len());
        for (array_index, array) in arrays.iter().enumerate() {
            let value = match array.get(index) {
                Some(value) => value.clone(),
                None => defaults
                    .as_ref()
                    .and_then(|d| d.get(array_index).cloned())
                    .unwrap_or(Bson::Null),
            };
            row.push(value);
        }
        out.push(Bson::Array(row));
    }
    Ok(Bson::Array(out))
}

fn op_sort_array(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let fields = arg.named_args("$sortArray")?;
    check_named_args(fields, "$sortArray", &["input", "sortBy"])?;
    let input_expr = named_arg(fields, "input")
        .ok_or_else(|| SiftError::InvalidExpression("$sortArray requires input".into()))?;
    let sort_by = named_arg(fields, "sortBy")
        .ok_or_else(|| SiftError::InvalidExpression("$sortArray requires sortBy".into()))?;

    let input = ctx.compute(input_expr)?;
    if nullish(&input) {
        return Ok(Bson::Null);
    }
    let mut elements = require_array("$sortArray", &input)?;
    let collation = ctx.collation();

    match sort_by {
        // Whole-value sort: sortBy is 1 or -1.
        Expression::Literal(direction) => {
            let ascending = sort_direction("$sortArray", direction)?;
            elements.sort_by(|a, b| {
                let ord = cmp_bson_collated(a, b, collation);
                if ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        // Field sort: sortBy is {field: 1, other: -1}.
        Expression::Document(sort_fields) => {
            let mut spec = Vec::with_capacity(sort_fields.len());
            for (path, direction_expr) in sort_fields {
                let direction = match direction_expr {
                    Expression::Literal(value) => sort_direction("$sortArray", value)?,
                    _ => {
                        return Err(SiftError::InvalidExpression(
                            "$sortArray: sort directions must be 1 or -1".into(),
                        ))
                    }
                };
                spec.push((path.clone(), direction));
            }
            elements.sort_by(|a, b| {
                for (path, ascending) in &spec {
                    let av = crate::value::resolve(a, path);
                    let bv = crate::value::resolve(b, path);
                    let ord = crate::value::cmp_opt(av.as_ref(), bv.as_ref(), collation);
                    if ord != std::cmp::Ordering::Equal {
                        return if *ascending { ord } else { ord.reverse() };
                    }
                }
                std::cmp::Ordering::Equal
            });
        }
        _ => {
            return Err(SiftError::InvalidExpression(
                "$sortArray: sortBy must be 1, -1 or a sort document".into(),
            ))
        }
    }
    Ok(Bson::Array(elements))
}

fn sort_direction(operator: &'static str, value: &Bson) -> Result<bool> {
    match int_arg(operator, value)? {
        1 => Ok(true),
        -1 => Ok(false),
        _ => Err(SiftError::InvalidExpression(format!(
            "{}: sort direction must be 1 or -1",
            operator
        ))),
    }
}

fn op_array_to_object(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$arrayToObject", &args, 1)?;
    if nullish(&args[0]) {
        return Ok(Bson::Null);
    }
    let elements = require_array("$arrayToObject", &args[0])?;
    let mut out = Document::new();
    for element in &elements {
        match element {
            // [["k", v], ...] form
            Bson::Array(pair) if pair.len() == 2 => {
                let key = pair[0].as_str().ok_or_else(|| {
                    SiftError::type_mismatch("$arrayToObject", "pair keys must be strings")
                })?;
                out.insert(key.to_string(), pair[1].clone());
            }
            // [{k: "k", v: v}, ...] form
            Bson::Document(pair) => {
                let key = pair.get_str("k").map_err(|_| {
                    SiftError::type_mismatch("$arrayToObject", "expected a k field of type string")
                })?;
                let value = pair.get("v").ok_or_else(|| {
                    SiftError::type_mismatch("$arrayToObject", "expected a v field")
                })?;
                out.insert(key.to_string(), value.clone());
            }
            other => {
                return Err(SiftError::type_mismatch(
                    "$arrayToObject",
                    format!("expected [k, v] pairs or {{k, v}} documents, got {:?}", other),
                ))
            }
        }
    }
    Ok(Bson::Document(out))
}
