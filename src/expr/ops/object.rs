// src/expr/ops/object.rs
// Document-shaping operators.

use bson::{Bson, Document};

use crate::error::{Result, SiftError};
use crate::expr::eval::{nullish, require_args};
use crate::expr::{check_named_args, named_arg, EvalCtx, Expression};

use super::Registry;

pub(super) fn register(registry: &mut Registry) {
    registry.insert("$getField", op_get_field);
    registry.insert("$mergeObjects", op_merge_objects);
    registry.insert("$objectToArray", op_object_to_array);
}

fn op_merge_objects(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    let mut out = Document::new();
    for value in &args {
        match value {
            // Null and missing operands are skipped, not propagated.
            Bson::Null | Bson::Undefined => {}
            Bson::Document(doc) => {
                for (key, val) in doc.iter() {
                    out.insert(key.clone(), val.clone());
                }
            }
            other => {
                return Err(SiftError::type_mismatch(
                    "$mergeObjects",
                    format!("expected a document, got {:?}", other),
                ))
            }
        }
    }
    Ok(Bson::Document(out))
}

fn op_object_to_array(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$objectToArray", &args, 1)?;
    if nullish(&args[0]) {
        return Ok(Bson::Null);
    }
    let doc = args[0].as_document().ok_or_else(|| {
        SiftError::type_mismatch(
            "$objectToArray",
            format!("expected a document, got {:?}", args[0]),
        )
    })?;
    let pairs: Vec<Bson> = doc
        .iter()
        .map(|(key, value)| {
            let mut pair = Document::new();
            pair.insert("k", Bson::String(key.clone()));
            pair.insert("v", value.clone());
            Bson::Document(pair)
        })
        .collect();
    Ok(Bson::Array(pairs))
}

fn op_get_field(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    // Shorthand: {$getField: "name"} reads from $$CURRENT.
    let (field_expr, input_expr) = match arg {
        Expression::Document(fields) => {
            check_named_args(fields, "$getField", &["field", "input"])?;
            let field = named_arg(fields, "field").ok_or_else(|| {
                SiftError::InvalidExpression("$getField requires field".into())
            })?;
            (field, named_arg(fields, "input"))
        }
        other => (other, None),
    };

    let field = match ctx.compute(field_expr)? {
        Bson::String(s) => s,
        other => {
            return Err(SiftError::type_mismatch(
                "$getField",
                format!("field must be a string, got {:?}", other),
            ))
        }
    };

    let input = match input_expr {
        Some(expr) => ctx.compute(expr)?,
        None => Bson::Document(ctx.current().clone()),
    };
    match input {
        Bson::Document(doc) => Ok(doc.get(&field).cloned().unwrap_or(Bson::Null)),
        value if nullish(&value) => Ok(Bson::Null),
        other => Err(SiftError::type_mismatch(
            "$getField",
            format!("input must be a document, got {:?}", other),
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
        let doc = doc! {"a": 1, "sub": {"x": 1, "y": 2}};
        EvalCtx::new(&doc, &options).compute(&expr)
    }

    #[test]
    fn test_merge_objects_later_wins() {
        assert_eq!(
            eval(bson!({"$mergeObjects": [{"a": 1, "b": 1}, {"b": 2}]})).unwrap(),
            Bson::Document(doc! {"a": 1, "b": 2})
        );
        // Nulls are skipped.
        assert_eq!(
            eval(bson!({"$mergeObjects": [Bson::Null, {"a": 1}]})).unwrap(),
            Bson::Document(doc! {"a": 1})
        );
    }

    #[test]
    fn test_object_to_array_preserves_order() {
        assert_eq!(
            eval(bson!({"$objectToArray": ["$sub"]})).unwrap(),
            bson!([{"k": "x", "v": 1}, {"k": "y", "v": 2}])
        );
        assert_eq!(
            eval(bson!({"$objectToArray": ["$missing"]})).unwrap(),
            Bson::Null
        );
    }

    #[test]
    fn test_get_field() {
        assert_eq!(eval(bson!({"$getField": "a"})).unwrap(), bson!(1));
        assert_eq!(
            eval(bson!({"$getField": {"field": "x", "input": "$sub"}})).unwrap(),
            bson!(1)
        );
        // Dots are literal key characters for $getField, not paths.
        assert_eq!(
            eval(bson!({"$getField": {"field": "x.y", "input": "$sub"}})).unwrap(),
            Bson::Null
        );
    }
}
