// src/expr/ops/mod.rs
// The expression operator catalog: a name-keyed table of function pointers,
// populated once. Operators receive the evaluation frame plus their
// unevaluated operand so keyword forms can destructure and short-circuit
// forms can control evaluation order.

mod arithmetic;
mod array;
mod boolean;
mod comparison;
mod conditional;
mod date;
mod object;
mod set;
mod string;
mod trig;
mod types;
mod variable;

use std::collections::HashMap;

use bson::Bson;
use lazy_static::lazy_static;

use crate::error::Result;

use super::{EvalCtx, Expression};

pub(crate) use types::type_name;

/// An expression operator implementation.
pub(crate) type ExprOperator = fn(&EvalCtx, &Expression) -> Result<Bson>;

pub(crate) type Registry = HashMap<&'static str, ExprOperator>;

lazy_static! {
    static ref EXPRESSION_REGISTRY: Registry = {
        let mut registry: Registry = HashMap::new();
        arithmetic::register(&mut registry);
        array::register(&mut registry);
        boolean::register(&mut registry);
        comparison::register(&mut registry);
        conditional::register(&mut registry);
        date::register(&mut registry);
        object::register(&mut registry);
        set::register(&mut registry);
        string::register(&mut registry);
        trig::register(&mut registry);
        types::register(&mut registry);
        variable::register(&mut registry);
        registry
    };
}

/// Look up a built-in operator.
pub(crate) fn lookup(name: &str) -> Option<ExprOperator> {
    EXPRESSION_REGISTRY.get(name).copied()
}

/// True when `name` is a built-in expression operator. `$literal` is
/// handled by the parser but counts as known.
pub fn is_known_operator(name: &str) -> bool {
    name == "$literal" || EXPRESSION_REGISTRY.contains_key(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_families_present() {
        for name in [
            "$add", "$divide", "$sum", "$cmp", "$eq", "$and", "$not", "$cond", "$ifNull",
            "$switch", "$concat", "$toLower", "$split", "$regexMatch", "$map", "$filter",
            "$reduce", "$zip", "$range", "$setUnion", "$mergeObjects", "$objectToArray",
            "$type", "$convert", "$toInt", "$year", "$dateToString", "$let", "$sin",
            "$arrayElemAt", "$size", "$in",
        ] {
            assert!(is_known_operator(name), "{} missing from registry", name);
        }
        assert!(is_known_operator("$literal"));
        assert!(!is_known_operator("$noSuchOperator"));
    }
}
