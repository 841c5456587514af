// src/expr/ops/variable.rs
// $let variable binding and the host-script escape hatch.

use bson::Bson;

use crate::error::{Result, SiftError};
use crate::expr::{check_named_args, named_arg, EvalCtx, Expression};

use super::Registry;

pub(super) fn register(registry: &mut Registry) {
    registry.insert("$function", op_function);
    registry.insert("$let", op_let);
}

fn op_let(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let fields = arg.named_args("$let")?;
    check_named_args(fields, "$let", &["vars", "in"])?;
    let vars = match named_arg(fields, "vars") {
        Some(Expression::Document(vars)) => vars,
        _ => {
            return Err(SiftError::InvalidExpression(
                "$let requires a vars document".into(),
            ))
        }
    };
    let in_expr = named_arg(fields, "in")
        .ok_or_else(|| SiftError::InvalidExpression("$let requires in".into()))?;

    // Bindings are evaluated in the outer frame: vars in one block cannot
    // reference each other.
    let mut child = ctx.clone();
    for (name, value_expr) in vars {
        let value = ctx.compute(value_expr)?;
        child = child.bind(name, value);
    }
    child.compute(in_expr)
}

fn op_function(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let fields = arg.named_args("$function")?;
    check_named_args(fields, "$function", &["body", "args", "lang"])?;
    let body_expr = named_arg(fields, "body")
        .ok_or_else(|| SiftError::InvalidExpression("$function requires body".into()))?;
    let body = body_expr.literal_str("$function", "body")?;

    let args = match named_arg(fields, "args") {
        Some(args_expr) => ctx.eval_operands(args_expr)?,
        None => Vec::new(),
    };

    let evaluator = ctx.options().script("$function")?;
    evaluator.call(body, &args)
}
