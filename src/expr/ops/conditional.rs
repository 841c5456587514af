// src/expr/ops/conditional.rs
// $cond / $ifNull / $switch. Exactly one branch of a conditional is
// evaluated; untaken branches may contain expressions that would raise.

use bson::Bson;

use crate::error::{Result, SiftError};
use crate::expr::eval::nullish;
use crate::expr::{check_named_args, named_arg, EvalCtx, Expression};

use super::Registry;

pub(super) fn register(registry: &mut Registry) {
    registry.insert("$cond", op_cond);
    registry.insert("$ifNull", op_if_null);
    registry.insert("$switch", op_switch);
}

fn op_cond(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let (condition, then_branch, else_branch) = match arg {
        Expression::Array(parts) if parts.len() == 3 => (&parts[0], &parts[1], &parts[2]),
        Expression::Document(fields) => {
            check_named_args(fields, "$cond", &["if", "then", "else"])?;
            let condition = named_arg(fields, "if").ok_or_else(|| {
                SiftError::InvalidExpression("$cond requires an if branch".into())
            })?;
            let then_branch = named_arg(fields, "then").ok_or_else(|| {
                SiftError::InvalidExpression("$cond requires a then branch".into())
            })?;
            let else_branch = named_arg(fields, "else").ok_or_else(|| {
                SiftError::InvalidExpression("$cond requires an else branch".into())
            })?;
            (condition, then_branch, else_branch)
        }
        _ => {
            return Err(SiftError::InvalidExpression(
                "$cond expects [if, then, else] or {if, then, else}".into(),
            ))
        }
    };

    if ctx.truthy(condition)? {
        ctx.compute(then_branch)
    } else {
        ctx.compute(else_branch)
    }
}

fn op_if_null(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let operands = arg.operands();
    if operands.len() < 2 {
        return Err(SiftError::InvalidExpression(
            "$ifNull expects at least 2 arguments".into(),
        ));
    }
    let (replacement, candidates) = operands.split_last().expect("len checked");
    for candidate in candidates {
        if let Some(value) = ctx.compute_opt(candidate)? {
            if !nullish(&value) {
                return Ok(value);
            }
        }
    }
    ctx.compute(replacement)
}

fn op_switch(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let fields = arg.named_args("$switch")?;
    check_named_args(fields, "$switch", &["branches", "default"])?;
    let branches = match named_arg(fields, "branches") {
        Some(Expression::Array(branches)) => branches,
        _ => {
            return Err(SiftError::InvalidExpression(
                "$switch requires an array of branches".into(),
            ))
        }
    };

    for branch in branches {
        let branch_fields = branch.named_args("$switch")?;
        check_named_args(branch_fields, "$switch", &["case", "then"])?;
        let case = named_arg(branch_fields, "case").ok_or_else(|| {
            SiftError::InvalidExpression("$switch branch requires a case".into())
        })?;
        let then = named_arg(branch_fields, "then").ok_or_else(|| {
            SiftError::InvalidExpression("$switch branch requires a then".into())
        })?;
        if ctx.truthy(case)? {
            return ctx.compute(then);
        }
    }

    match named_arg(fields, "default") {
        Some(default) => ctx.compute(default),
        None => Err(SiftError::InvalidExpression(
            "$switch found no matching branch and no default".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use bson::{bson, doc};

    fn eval(spec: Bson) -> Result<Bson> {
        let options = Options::default();
        let expr = Expression::parse(&spec, &options)?;
        let doc = doc! {"score": 75};
        EvalCtx::new(&doc, &options).compute(&expr)
    }

    #[test]
    fn test_cond_array_form_short_circuits() {
        // The untaken branch would divide by zero.
        assert_eq!(
            eval(bson!({"$cond": [false, {"$divide": [1, 0]}, 42]})).unwrap(),
            bson!(42)
        );
        assert_eq!(
            eval(bson!({"$cond": [true, "yes", "no"]})).unwrap(),
            bson!("yes")
        );
    }

    #[test]
    fn test_cond_keyword_form() {
        assert_eq!(
            eval(bson!({"$cond": {"if": {"$gte": ["$score", 70]}, "then": "pass", "else": "fail"}}))
                .unwrap(),
            bson!("pass")
        );
    }

    #[test]
    fn test_if_null() {
        assert_eq!(eval(bson!({"$ifNull": ["$missing", "d"]})).unwrap(), bson!("d"));
        assert_eq!(eval(bson!({"$ifNull": ["$score", 0]})).unwrap(), bson!(75));
        // Second operand is not evaluated when the first is non-null.
        assert_eq!(
            eval(bson!({"$ifNull": [1, {"$divide": [1, 0]}]})).unwrap(),
            bson!(1)
        );
        // Chained candidates.
        assert_eq!(
            eval(bson!({"$ifNull": [Bson::Null, "$missing", "last"]})).unwrap(),
            bson!("last")
        );
    }

    #[test]
    fn test_switch() {
        let spec = bson!({"$switch": {
            "branches": [
                {"case": {"$lt": ["$score", 60]}, "then": "F"},
                {"case": {"$lt": ["$score", 80]}, "then": "C"},
                {"case": {"$lt": ["$score", 90]}, "then": "B"}
            ],
            "default": "A"
        }});
        assert_eq!(eval(spec).unwrap(), bson!("C"));
    }

    #[test]
    fn test_switch_no_match_no_default_errors() {
        let spec = bson!({"$switch": {"branches": [{"case": false, "then": 1}]}});
        assert!(eval(spec).is_err());
    }
}
