// src/expr/ops/boolean.rs
// Boolean connectives. $and and $or short-circuit: operands after the
// deciding one are never evaluated, so guarded expressions like
// {$and: [{$isArray: "$x"}, {$gt: [{$size: "$x"}, 0]}]} are safe.

use bson::Bson;

use crate::error::Result;
use crate::expr::eval::require_args;
use crate::expr::{EvalCtx, Expression};
use crate::value::is_truthy;

use super::Registry;

pub(super) fn register(registry: &mut Registry) {
    registry.insert("$and", op_and);
    registry.insert("$not", op_not);
    registry.insert("$or", op_or);
}

fn op_and(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    for operand in arg.operands() {
        if !ctx.truthy(operand)? {
            return Ok(Bson::Boolean(false));
        }
    }
    Ok(Bson::Boolean(true))
}

fn op_or(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    for operand in arg.operands() {
        if ctx.truthy(operand)? {
            return Ok(Bson::Boolean(true));
        }
    }
    Ok(Bson::Boolean(false))
}

fn op_not(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$not", &args, 1)?;
    Ok(Bson::Boolean(!is_truthy(&args[0])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use bson::{bson, doc};

    fn eval(spec: Bson) -> Result<Bson> {
        let options = Options::default();
        let expr = Expression::parse(&spec, &options)?;
        let doc = doc! {"flag": true};
        EvalCtx::new(&doc, &options).compute(&expr)
    }

    #[test]
    fn test_and_or_not() {
        assert_eq!(eval(bson!({"$and": [true, 1, "x"]})).unwrap(), bson!(true));
        assert_eq!(eval(bson!({"$and": [true, 0]})).unwrap(), bson!(false));
        assert_eq!(eval(bson!({"$or": [false, Bson::Null, 2]})).unwrap(), bson!(true));
        assert_eq!(eval(bson!({"$or": [false]})).unwrap(), bson!(false));
        assert_eq!(eval(bson!({"$not": [false]})).unwrap(), bson!(true));
        assert_eq!(eval(bson!({"$not": ["$flag"]})).unwrap(), bson!(false));
    }

    #[test]
    fn test_empty_connectives() {
        assert_eq!(eval(bson!({"$and": []})).unwrap(), bson!(true));
        assert_eq!(eval(bson!({"$or": []})).unwrap(), bson!(false));
    }

    #[test]
    fn test_short_circuit_skips_errors() {
        // The divide-by-zero operand is never evaluated.
        assert_eq!(
            eval(bson!({"$or": [true, {"$divide": [1, 0]}]})).unwrap(),
            bson!(true)
        );
        assert_eq!(
            eval(bson!({"$and": [false, {"$divide": [1, 0]}]})).unwrap(),
            bson!(false)
        );
    }
}
