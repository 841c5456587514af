// src/error.rs
// Error types shared across the engine.
//
// Two broad families, mirrored in how they surface:
// - malformed-spec errors (InvalidQuery / InvalidExpression / AggregationError)
//   are raised while parsing a filter, expression or pipeline, before any
//   document is touched;
// - runtime errors (TypeMismatch, DivideByZero, ...) terminate the stream at
//   the pull that triggered them.

use thiserror::Error;

/// All errors the engine can produce.
#[derive(Error, Debug)]
pub enum SiftError {
    /// A query filter is structurally invalid (unknown operator, wrong
    /// operand shape, ...). Raised at `Query` construction.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// An aggregation expression is structurally invalid. Raised while
    /// parsing the expression tree.
    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    /// A pipeline stage spec is malformed (unknown stage, bad spec shape,
    /// non-positive bucket count, ...). Raised at `Aggregator` construction.
    #[error("invalid aggregation pipeline: {0}")]
    AggregationError(String),

    /// An operator was applied to a value it cannot handle and the operator
    /// is documented to raise rather than return null.
    #[error("type mismatch in {operator}: {detail}")]
    TypeMismatch {
        operator: &'static str,
        detail: String,
    },

    /// `$divide` or `$mod` with a zero divisor.
    #[error("{0}: division by zero")]
    DivideByZero(&'static str),

    /// `$where` / `$function` used without script evaluation enabled and a
    /// script hook installed.
    #[error("script evaluation is disabled ({0})")]
    ScriptDisabled(&'static str),

    /// A recognized but unsupported operation (`$out`, `$merge`).
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// A `$regex`-family pattern failed to compile.
    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl SiftError {
    /// Shorthand used by the conversion operators.
    pub(crate) fn type_mismatch(operator: &'static str, detail: impl Into<String>) -> Self {
        SiftError::TypeMismatch {
            operator,
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SiftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SiftError::InvalidQuery("$foo is not a known operator".into());
        assert!(err.to_string().contains("invalid query"));

        let err = SiftError::DivideByZero("$divide");
        assert_eq!(err.to_string(), "$divide: division by zero");

        let err = SiftError::type_mismatch("$toInt", "cannot convert array");
        assert!(err.to_string().contains("$toInt"));
        assert!(err.to_string().contains("cannot convert array"));
    }

    #[test]
    fn test_regex_error_conversion() {
        let bad = regex::Regex::new("(unclosed").unwrap_err();
        let err: SiftError = bad.into();
        assert!(matches!(err, SiftError::Regex(_)));
    }
}
