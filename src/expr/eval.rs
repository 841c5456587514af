// src/expr/eval.rs
// Expression evaluation. A frame carries the pipeline root document, the
// current document, the variable bindings in scope and the engine options;
// operators receive the frame plus their unevaluated operand.

use std::collections::HashMap;

use bson::{Bson, Document};

use crate::collation::Collation;
use crate::error::{Result, SiftError};
use crate::options::Options;
use crate::value;

use super::{ops, Expression};

/// The evaluation frame for one document.
#[derive(Clone)]
pub struct EvalCtx<'a> {
    root: &'a Document,
    current: &'a Document,
    vars: HashMap<String, Bson>,
    options: &'a Options,
}

impl<'a> EvalCtx<'a> {
    /// Frame for a fresh document: `$$ROOT` and `$$CURRENT` both point at
    /// it, caller-supplied variables and `$$NOW` are in scope.
    pub fn new(doc: &'a Document, options: &'a Options) -> Self {
        let mut vars = options.variables.clone();
        vars.entry("NOW".to_string())
            .or_insert_with(|| Bson::DateTime(bson::DateTime::now()));
        EvalCtx {
            root: doc,
            current: doc,
            vars,
            options,
        }
    }

    /// A child frame with one extra variable bound.
    pub fn bind(&self, name: &str, value: Bson) -> EvalCtx<'a> {
        let mut child = self.clone();
        child.vars.insert(name.to_string(), value);
        child
    }

    pub fn options(&self) -> &'a Options {
        self.options
    }

    pub fn collation(&self) -> Option<&'a Collation> {
        self.options.collation()
    }

    pub fn current(&self) -> &'a Document {
        self.current
    }

    /// Evaluate, coercing missing to `Null` (what most operators consume).
    pub fn compute(&self, expr: &Expression) -> Result<Bson> {
        Ok(self.compute_opt(expr)?.unwrap_or(Bson::Null))
    }

    /// Evaluate preserving the missing/null distinction.
    pub fn compute_opt(&self, expr: &Expression) -> Result<Option<Bson>> {
        match expr {
            Expression::Literal(value) => Ok(Some(value.clone())),

            Expression::FieldPath(path) => Ok(value::resolve_in_doc(self.current, path)),

            Expression::Variable { name, path } => {
                let base = match name.as_str() {
                    "ROOT" => Some(Bson::Document(self.root.clone())),
                    "CURRENT" => Some(Bson::Document(self.current.clone())),
                    "REMOVE" => None,
                    _ => match self.vars.get(name) {
                        Some(value) => Some(value.clone()),
                        None => {
                            return Err(SiftError::InvalidExpression(format!(
                                "undefined variable: $${}",
                                name
                            )))
                        }
                    },
                };
                Ok(match (base, path) {
                    (Some(v), Some(p)) => value::resolve(&v, p),
                    (base, None) => base,
                    (None, Some(_)) => None,
                })
            }

            Expression::Array(elements) => {
                let mut out = Vec::with_capacity(elements.len());
                for element in elements {
                    // Missing becomes null inside arrays.
                    out.push(self.compute(element)?);
                }
                Ok(Some(Bson::Array(out)))
            }

            Expression::Document(fields) => {
                let mut out = Document::new();
                for (key, field_expr) in fields {
                    if let Some(v) = self.compute_opt(field_expr)? {
                        out.insert(key.clone(), v);
                    }
                }
                Ok(Some(Bson::Document(out)))
            }

            Expression::Call { name, arg } => {
                if let Some(custom) = self.options.custom_operator(name) {
                    let args = self.eval_operands(arg)?;
                    return custom(&args).map(Some);
                }
                match ops::lookup(name) {
                    Some(operator) => operator(self, arg).map(Some),
                    None => Err(SiftError::InvalidExpression(format!(
                        "unknown expression operator: {}",
                        name
                    ))),
                }
            }
        }
    }

    /// Evaluate an operand list positionally; missing coerces to null.
    pub fn eval_operands(&self, arg: &Expression) -> Result<Vec<Bson>> {
        arg.operands()
            .into_iter()
            .map(|operand| self.compute(operand))
            .collect()
    }

    /// Evaluate and test aggregation truthiness.
    pub fn truthy(&self, expr: &Expression) -> Result<bool> {
        Ok(value::is_truthy_opt(self.compute_opt(expr)?.as_ref()))
    }
}

/// Arity check shared by the fixed-arity operators.
pub(crate) fn require_args(
    operator: &'static str,
    args: &[Bson],
    expected: usize,
) -> Result<()> {
    if args.len() != expected {
        return Err(SiftError::InvalidExpression(format!(
            "{} expects {} argument(s), got {}",
            operator,
            expected,
            args.len()
        )));
    }
    Ok(())
}

/// True for null (missing has already been coerced by `compute`).
pub(crate) fn nullish(value: &Bson) -> bool {
    matches!(value, Bson::Null | Bson::Undefined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{bson, doc};

    fn eval(doc: &Document, spec: Bson) -> Result<Bson> {
        let options = Options::default();
        let expr = Expression::parse(&spec, &options)?;
        EvalCtx::new(doc, &options).compute(&expr)
    }

    #[test]
    fn test_literal_and_field_path() {
        let doc = doc! {"a": {"b": 7}};
        assert_eq!(eval(&doc, bson!(5)).unwrap(), bson!(5));
        assert_eq!(eval(&doc, bson!("$a.b")).unwrap(), bson!(7));
        // Missing coerces to null at the compute boundary.
        assert_eq!(eval(&doc, bson!("$nope")).unwrap(), Bson::Null);
    }

    #[test]
    fn test_root_and_current() {
        let doc = doc! {"a": 1};
        assert_eq!(
            eval(&doc, bson!("$$ROOT")).unwrap(),
            Bson::Document(doc.clone())
        );
        assert_eq!(eval(&doc, bson!("$$CURRENT.a")).unwrap(), bson!(1));
    }

    #[test]
    fn test_undefined_variable_errors() {
        let doc = doc! {};
        assert!(eval(&doc, bson!("$$nobody")).is_err());
    }

    #[test]
    fn test_caller_variables() {
        let options = Options::default().with_variable("limit", bson!(10));
        let expr = Expression::parse(&bson!("$$limit"), &options).unwrap();
        let doc = doc! {};
        let got = EvalCtx::new(&doc, &options).compute(&expr).unwrap();
        assert_eq!(got, bson!(10));
    }

    #[test]
    fn test_document_expr_omits_missing() {
        let doc = doc! {"a": 1};
        let got = eval(&doc, bson!({"x": "$a", "y": "$missing"})).unwrap();
        assert_eq!(got, Bson::Document(doc! {"x": 1}));
    }

    #[test]
    fn test_array_expr_coerces_missing_to_null() {
        let doc = doc! {"a": 1};
        let got = eval(&doc, bson!(["$a", "$missing"])).unwrap();
        assert_eq!(got, bson!([1, Bson::Null]));
    }

    #[test]
    fn test_remove_variable_is_missing() {
        let doc = doc! {};
        let got = eval(&doc, bson!({"x": "$$REMOVE", "y": 1})).unwrap();
        assert_eq!(got, Bson::Document(doc! {"y": 1}));
    }

    #[test]
    fn test_custom_operator() {
        use std::sync::Arc;
        let options = Options::default().with_operator(
            "$double",
            Arc::new(|args: &[Bson]| {
                let n = args
                    .first()
                    .and_then(crate::value::numeric_value)
                    .unwrap_or(0.0);
                Ok(Bson::Double(n * 2.0))
            }),
        );
        let expr = Expression::parse(&bson!({"$double": "$n"}), &options).unwrap();
        let doc = doc! {"n": 21};
        let got = EvalCtx::new(&doc, &options).compute(&expr).unwrap();
        assert_eq!(got, bson!(42.0));
    }
}
