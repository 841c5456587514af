// src/expr/mod.rs
// The aggregation expression language: a tagged tree built once at
// construction time, then evaluated per document. Parsing validates
// operator names and argument shapes eagerly so malformed specs fail
// before the first document is pulled.

pub mod eval;
pub mod ops;

pub use eval::EvalCtx;

use bson::{Bson, Document};

use crate::error::{Result, SiftError};
use crate::options::Options;

/// A parsed aggregation expression.
#[derive(Debug, Clone)]
pub enum Expression {
    /// A constant value.
    Literal(Bson),
    /// `"$a.b.c"`: a dotted path into the current document.
    FieldPath(String),
    /// `"$$name.rest"`: a variable reference with an optional sub-path.
    Variable {
        name: String,
        path: Option<String>,
    },
    /// `[expr, ...]`: evaluates elementwise; missing elements become null.
    Array(Vec<Expression>),
    /// `{key: expr, ...}`: insertion-ordered; keys whose value evaluates
    /// to missing are omitted.
    Document(Vec<(String, Expression)>),
    /// `{$op: operand}`: the operand is handed to the operator unevaluated
    /// so keyword forms and short-circuiting work.
    Call {
        name: String,
        arg: Box<Expression>,
    },
}

impl Expression {
    /// Parse a BSON value into an expression tree.
    pub fn parse(value: &Bson, options: &Options) -> Result<Self> {
        match value {
            Bson::String(s) if s.starts_with("$$") => {
                let body = &s[2..];
                if body.is_empty() {
                    return Err(SiftError::InvalidExpression(
                        "empty variable reference \"$$\"".into(),
                    ));
                }
                let (name, path) = match body.split_once('.') {
                    Some((name, rest)) => (name.to_string(), Some(rest.to_string())),
                    None => (body.to_string(), None),
                };
                Ok(Expression::Variable { name, path })
            }
            Bson::String(s) if s.starts_with('$') => {
                let path = &s[1..];
                if path.is_empty() {
                    return Err(SiftError::InvalidExpression(
                        "empty field reference \"$\"".into(),
                    ));
                }
                Ok(Expression::FieldPath(path.to_string()))
            }
            Bson::Array(elements) => {
                let parsed = elements
                    .iter()
                    .map(|element| Expression::parse(element, options))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Expression::Array(parsed))
            }
            Bson::Document(doc) => Self::parse_document(doc, options),
            other => Ok(Expression::Literal(other.clone())),
        }
    }

    fn parse_document(doc: &Document, options: &Options) -> Result<Self> {
        // A document whose single key is $-prefixed is an operator call.
        if doc.len() == 1 {
            let (key, operand) = doc.iter().next().expect("len checked");
            if key.starts_with('$') {
                let name = key.as_str();
                if name == "$literal" {
                    return Ok(Expression::Literal(operand.clone()));
                }
                if !ops::is_known_operator(name) && options.custom_operator(name).is_none() {
                    return Err(SiftError::InvalidExpression(format!(
                        "unknown expression operator: {}",
                        name
                    )));
                }
                if name == "$function" {
                    // Validate the script gate eagerly; the hook itself runs
                    // per document.
                    options.script("$function")?;
                }
                return Ok(Expression::Call {
                    name: name.to_string(),
                    arg: Box::new(Expression::parse(operand, options)?),
                });
            }
        }

        // Otherwise a plain document expression; operator keys may not mix
        // with field keys.
        let mut fields = Vec::with_capacity(doc.len());
        for (key, value) in doc.iter() {
            if key.starts_with('$') {
                return Err(SiftError::InvalidExpression(format!(
                    "operator {} is not allowed inside a document expression",
                    key
                )));
            }
            fields.push((key.clone(), Expression::parse(value, options)?));
        }
        Ok(Expression::Document(fields))
    }

    /// The operand list for a positional operator: an `Array` node yields
    /// its elements, anything else is a single operand.
    pub(crate) fn operands(&self) -> Vec<&Expression> {
        match self {
            Expression::Array(elements) => elements.iter().collect(),
            other => vec![other],
        }
    }

    /// The named-argument pairs for a keyword-form operator.
    pub(crate) fn named_args(&self, operator: &'static str) -> Result<&[(String, Expression)]> {
        match self {
            Expression::Document(fields) => Ok(fields),
            _ => Err(SiftError::InvalidExpression(format!(
                "{} expects a document of named arguments",
                operator
            ))),
        }
    }

    /// A literal string operand (used for `as` names and formats).
    pub(crate) fn literal_str(&self, operator: &'static str, what: &str) -> Result<&str> {
        match self {
            Expression::Literal(Bson::String(s)) => Ok(s),
            _ => Err(SiftError::InvalidExpression(format!(
                "{}: {} must be a string literal",
                operator, what
            ))),
        }
    }
}

/// Look up a named argument in a keyword-form operand.
pub(crate) fn named_arg<'a>(
    fields: &'a [(String, Expression)],
    name: &str,
) -> Option<&'a Expression> {
    fields
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, expr)| expr)
}

/// Reject named arguments outside the allowed set.
pub(crate) fn check_named_args(
    fields: &[(String, Expression)],
    operator: &'static str,
    allowed: &[&str],
) -> Result<()> {
    for (key, _) in fields {
        if !allowed.contains(&key.as_str()) {
            return Err(SiftError::InvalidExpression(format!(
                "{}: unknown argument {}",
                operator, key
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::bson;

    fn parse(value: Bson) -> Result<Expression> {
        Expression::parse(&value, &Options::default())
    }

    #[test]
    fn test_parse_scalars_are_literals() {
        assert!(matches!(parse(bson!(5)).unwrap(), Expression::Literal(_)));
        assert!(matches!(
            parse(bson!("plain")).unwrap(),
            Expression::Literal(_)
        ));
        assert!(matches!(parse(Bson::Null).unwrap(), Expression::Literal(_)));
    }

    #[test]
    fn test_parse_field_and_variable_refs() {
        match parse(bson!("$a.b")).unwrap() {
            Expression::FieldPath(p) => assert_eq!(p, "a.b"),
            other => panic!("expected field path, got {:?}", other),
        }
        match parse(bson!("$$ROOT.x")).unwrap() {
            Expression::Variable { name, path } => {
                assert_eq!(name, "ROOT");
                assert_eq!(path.as_deref(), Some("x"));
            }
            other => panic!("expected variable, got {:?}", other),
        }
        assert!(parse(bson!("$")).is_err());
        assert!(parse(bson!("$$")).is_err());
    }

    #[test]
    fn test_parse_call_vs_document() {
        assert!(matches!(
            parse(bson!({"$add": [1, 2]})).unwrap(),
            Expression::Call { .. }
        ));
        assert!(matches!(
            parse(bson!({"a": 1, "b": "$x"})).unwrap(),
            Expression::Document(_)
        ));
        // Operator keys cannot mix with field keys.
        assert!(parse(bson!({"a": 1, "$add": [1, 2]})).is_err());
    }

    #[test]
    fn test_parse_unknown_operator() {
        let err = parse(bson!({"$frobnicate": 1})).unwrap_err();
        assert!(err.to_string().contains("$frobnicate"));
    }

    #[test]
    fn test_parse_literal_is_not_recursed() {
        match parse(bson!({"$literal": {"$add": [1, 2]}})).unwrap() {
            Expression::Literal(Bson::Document(d)) => {
                assert!(d.contains_key("$add"));
            }
            other => panic!("expected literal document, got {:?}", other),
        }
    }

    #[test]
    fn test_function_requires_script_gate() {
        let err = parse(bson!({"$function": {"body": "x", "args": []}})).unwrap_err();
        assert!(matches!(err, SiftError::ScriptDisabled(_)));
    }
}
