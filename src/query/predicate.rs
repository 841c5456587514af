// src/query/predicate.rs
// The query predicate dialect: a distinct tagged sum from the expression
// language, parsed eagerly (unknown operators, bad operand shapes and the
// script gate all fail at construction) and matched per document.
//
// Matching semantics that differ from the expression dialect:
// - comparisons are type-bracketed: values only compare within their
//   canonical type class (numbers form one class);
// - a non-array condition against an array field matches if any element
//   matches, or if the array itself equals the value.

use std::cmp::Ordering;
use std::sync::Arc;

use bson::{Bson, Document};

use crate::error::{Result, SiftError};
use crate::expr::{EvalCtx, Expression};
use crate::options::Options;
use crate::regex_util;
use crate::value::{cmp_bson_collated, eq_bson_collated, resolve_in_doc, type_rank};

/// A parsed query predicate.
#[derive(Debug, Clone)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Nor(Vec<Predicate>),
    /// All conditions on one dotted path.
    Field { path: String, conds: Vec<FieldCond> },
    /// `$expr`: an aggregation expression tested for truthiness.
    Expr(Expression),
    /// `$where`: host-script source, gated by `script_enabled`.
    Where(String),
}

/// One operator applied to a field's resolved value.
#[derive(Debug, Clone)]
pub enum FieldCond {
    Eq(Bson),
    Ne(Bson),
    Gt(Bson),
    Gte(Bson),
    Lt(Bson),
    Lte(Bson),
    In(Vec<Bson>),
    Nin(Vec<Bson>),
    Exists(bool),
    Type(Vec<String>),
    Size(i64),
    Mod(i64, i64),
    Regex(Arc<regex::Regex>),
    All(Vec<Bson>),
    ElemMatch(ElemMatch),
    Not(Vec<FieldCond>),
}

/// `$elemMatch` takes either an operator set (scalar elements) or a full
/// predicate (document elements).
#[derive(Debug, Clone)]
pub enum ElemMatch {
    Conditions(Vec<FieldCond>),
    Predicate(Box<Predicate>),
}

impl Predicate {
    /// Parse a filter document. The empty filter matches everything.
    pub fn parse(filter: &Document, options: &Options) -> Result<Self> {
        let mut clauses = Vec::with_capacity(filter.len());
        for (key, value) in filter.iter() {
            match key.as_str() {
                "$and" => clauses.push(Predicate::And(parse_clause_list(value, options, "$and")?)),
                "$or" => clauses.push(Predicate::Or(parse_clause_list(value, options, "$or")?)),
                "$nor" => clauses.push(Predicate::Nor(parse_clause_list(value, options, "$nor")?)),
                "$expr" => clauses.push(Predicate::Expr(Expression::parse(value, options)?)),
                "$where" => {
                    options.script("$where")?;
                    let source = match value {
                        Bson::String(s) => s.clone(),
                        Bson::JavaScriptCode(s) => s.clone(),
                        _ => {
                            return Err(SiftError::InvalidQuery(
                                "$where requires a string".into(),
                            ))
                        }
                    };
                    clauses.push(Predicate::Where(source));
                }
                "$comment" => {}
                other if other.starts_with('$') => {
                    return Err(SiftError::InvalidQuery(format!(
                        "unknown top-level operator: {}",
                        other
                    )))
                }
                path => clauses.push(Predicate::Field {
                    path: path.to_string(),
                    conds: parse_field_value(value, options)?,
                }),
            }
        }
        Ok(match clauses.len() {
            1 => clauses.pop().expect("len checked"),
            _ => Predicate::And(clauses),
        })
    }

    /// Match one document. Runtime failures (a script hook error, say) are
    /// surfaced; spec-shape problems were already rejected at parse.
    pub fn matches(&self, doc: &Document, options: &Options) -> Result<bool> {
        match self {
            Predicate::And(clauses) => {
                for clause in clauses {
                    if !clause.matches(doc, options)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Or(clauses) => {
                for clause in clauses {
                    if clause.matches(doc, options)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::Nor(clauses) => {
                for clause in clauses {
                    if clause.matches(doc, options)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Field { path, conds } => {
                let resolved = resolve_in_doc(doc, path);
                for cond in conds {
                    if !cond_matches(resolved.as_ref(), cond, options)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Expr(expr) => EvalCtx::new(doc, options).truthy(expr),
            Predicate::Where(source) => {
                let evaluator = options.script("$where")?;
                let result = evaluator.call(source, &[Bson::Document(doc.clone())])?;
                Ok(crate::value::is_truthy(&result))
            }
        }
    }
}

fn parse_clause_list(value: &Bson, options: &Options, operator: &str) -> Result<Vec<Predicate>> {
    let clauses = value.as_array().ok_or_else(|| {
        SiftError::InvalidQuery(format!("{} requires an array of filters", operator))
    })?;
    if clauses.is_empty() {
        return Err(SiftError::InvalidQuery(format!(
            "{} requires a non-empty array",
            operator
        )));
    }
    clauses
        .iter()
        .map(|clause| match clause {
            Bson::Document(doc) => Predicate::parse(doc, options),
            _ => Err(SiftError::InvalidQuery(format!(
                "{} clauses must be documents",
                operator
            ))),
        })
        .collect()
}

/// A field's filter value: an operator document, a literal regex, or a
/// plain value (implicit equality).
fn parse_field_value(value: &Bson, options: &Options) -> Result<Vec<FieldCond>> {
    match value {
        Bson::Document(spec) if spec.keys().next().map_or(false, |k| k.starts_with('$')) => {
            parse_operator_set(spec, options)
        }
        Bson::RegularExpression(re) => Ok(vec![FieldCond::Regex(regex_util::compile(
            &re.pattern,
            &re.options,
        )?)]),
        other => Ok(vec![FieldCond::Eq(other.clone())]),
    }
}

fn parse_operator_set(spec: &Document, options: &Options) -> Result<Vec<FieldCond>> {
    let mut conds = Vec::with_capacity(spec.len());
    for (op, operand) in spec.iter() {
        match op.as_str() {
            "$eq" => conds.push(FieldCond::Eq(operand.clone())),
            "$ne" => conds.push(FieldCond::Ne(operand.clone())),
            "$gt" => conds.push(FieldCond::Gt(operand.clone())),
            "$gte" => conds.push(FieldCond::Gte(operand.clone())),
            "$lt" => conds.push(FieldCond::Lt(operand.clone())),
            "$lte" => conds.push(FieldCond::Lte(operand.clone())),
            "$in" => conds.push(FieldCond::In(member_list(operand, "$in")?)),
            "$nin" => conds.push(FieldCond::Nin(member_list(operand, "$nin")?)),
            "$exists" => conds.push(FieldCond::Exists(match operand {
                Bson::Boolean(b) => *b,
                other => crate::value::is_truthy(other),
            })),
            "$type" => conds.push(FieldCond::Type(parse_type_list(operand)?)),
            "$size" => {
                let n = integer_operand(operand).ok_or_else(|| {
                    SiftError::InvalidQuery("$size requires a non-negative integer".into())
                })?;
                if n < 0 {
                    return Err(SiftError::InvalidQuery(
                        "$size requires a non-negative integer".into(),
                    ));
                }
                conds.push(FieldCond::Size(n));
            }
            "$mod" => {
                let parts = operand.as_array().ok_or_else(|| {
                    SiftError::InvalidQuery("$mod requires [divisor, remainder]".into())
                })?;
                if parts.len() != 2 {
                    return Err(SiftError::InvalidQuery(
                        "$mod requires [divisor, remainder]".into(),
                    ));
                }
                let divisor = integer_operand(&parts[0]).ok_or_else(|| {
                    SiftError::InvalidQuery("$mod divisor must be an integer".into())
                })?;
                let remainder = integer_operand(&parts[1]).ok_or_else(|| {
                    SiftError::InvalidQuery("$mod remainder must be an integer".into())
                })?;
                if divisor == 0 {
                    return Err(SiftError::InvalidQuery("$mod divisor must not be 0".into()));
                }
                conds.push(FieldCond::Mod(divisor, remainder));
            }
            "$regex" => {
                let regex_options = match spec.get("$options") {
                    Some(Bson::String(o)) => o.clone(),
                    Some(_) => {
                        return Err(SiftError::InvalidQuery(
                            "$options requires a string".into(),
                        ))
                    }
                    None => String::new(),
                };
                let compiled = match operand {
                    Bson::String(pattern) => regex_util::compile(pattern, &regex_options)?,
                    Bson::RegularExpression(re) => {
                        let merged = if regex_options.is_empty() {
                            re.options.clone()
                        } else {
                            regex_options
                        };
                        regex_util::compile(&re.pattern, &merged)?
                    }
                    _ => {
                        return Err(SiftError::InvalidQuery(
                            "$regex requires a string or regex".into(),
                        ))
                    }
                };
                conds.push(FieldCond::Regex(compiled));
            }
            "$options" => {
                if !spec.contains_key("$regex") {
                    return Err(SiftError::InvalidQuery(
                        "$options requires a $regex".into(),
                    ));
                }
            }
            "$all" => {
                let members = member_list(operand, "$all")?;
                conds.push(FieldCond::All(members));
            }
            "$elemMatch" => {
                let sub = operand.as_document().ok_or_else(|| {
                    SiftError::InvalidQuery("$elemMatch requires a document".into())
                })?;
                let all_operators = !sub.is_empty()
                    && sub.keys().all(|k| k.starts_with('$'));
                let elem_match = if all_operators {
                    ElemMatch::Conditions(parse_operator_set(sub, options)?)
                } else {
                    ElemMatch::Predicate(Box::new(Predicate::parse(sub, options)?))
                };
                conds.push(FieldCond::ElemMatch(elem_match));
            }
            "$not" => match operand {
                Bson::Document(sub) => {
                    conds.push(FieldCond::Not(parse_operator_set(sub, options)?))
                }
                Bson::RegularExpression(re) => conds.push(FieldCond::Not(vec![FieldCond::Regex(
                    regex_util::compile(&re.pattern, &re.options)?,
                )])),
                _ => {
                    return Err(SiftError::InvalidQuery(
                        "$not requires an operator document or regex".into(),
                    ))
                }
            },
            other => {
                return Err(SiftError::InvalidQuery(format!(
                    "unknown query operator: {}",
                    other
                )))
            }
        }
    }
    Ok(conds)
}

fn member_list(operand: &Bson, operator: &str) -> Result<Vec<Bson>> {
    operand
        .as_array()
        .cloned()
        .ok_or_else(|| SiftError::InvalidQuery(format!("{} requires an array", operator)))
}

fn integer_operand(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        Bson::Double(f) if f.fract() == 0.0 => Some(*f as i64),
        _ => None,
    }
}

fn parse_type_list(operand: &Bson) -> Result<Vec<String>> {
    match operand {
        Bson::Array(names) => names.iter().map(parse_type_name).collect(),
        single => Ok(vec![parse_type_name(single)?]),
    }
}

fn parse_type_name(value: &Bson) -> Result<String> {
    match value {
        Bson::String(name) => Ok(name.clone()),
        other => match integer_operand(other) {
            Some(1) => Ok("double".into()),
            Some(2) => Ok("string".into()),
            Some(3) => Ok("object".into()),
            Some(4) => Ok("array".into()),
            Some(5) => Ok("binData".into()),
            Some(7) => Ok("objectId".into()),
            Some(8) => Ok("bool".into()),
            Some(9) => Ok("date".into()),
            Some(10) => Ok("null".into()),
            Some(11) => Ok("regex".into()),
            Some(16) => Ok("int".into()),
            Some(17) => Ok("timestamp".into()),
            Some(18) => Ok("long".into()),
            Some(19) => Ok("decimal".into()),
            _ => Err(SiftError::InvalidQuery(format!(
                "unknown BSON type: {:?}",
                other
            ))),
        },
    }
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// Candidate values for element-wise operators: the resolved value itself,
/// plus its elements when it is an array.
fn candidates(resolved: Option<&Bson>) -> Vec<Option<&Bson>> {
    let mut out = vec![resolved];
    if let Some(Bson::Array(elements)) = resolved {
        out.extend(elements.iter().map(Some));
    }
    out
}

fn cond_matches(resolved: Option<&Bson>, cond: &FieldCond, options: &Options) -> Result<bool> {
    match cond {
        FieldCond::Eq(target) => Ok(eq_matches(resolved, target, options)),
        FieldCond::Ne(target) => Ok(!eq_matches(resolved, target, options)),

        FieldCond::Gt(target) => Ok(order_matches(resolved, target, options, |o| {
            o == Ordering::Greater
        })),
        FieldCond::Gte(target) => Ok(order_matches(resolved, target, options, |o| {
            o != Ordering::Less
        })),
        FieldCond::Lt(target) => Ok(order_matches(resolved, target, options, |o| {
            o == Ordering::Less
        })),
        FieldCond::Lte(target) => Ok(order_matches(resolved, target, options, |o| {
            o != Ordering::Greater
        })),

        FieldCond::In(members) => Ok(members
            .iter()
            .any(|member| in_member_matches(resolved, member, options))),
        FieldCond::Nin(members) => Ok(!members
            .iter()
            .any(|member| in_member_matches(resolved, member, options))),

        FieldCond::Exists(expected) => Ok(resolved.is_some() == *expected),

        FieldCond::Type(names) => Ok(candidates(resolved).into_iter().any(|candidate| {
            let actual = crate::expr::ops::type_name(candidate);
            names.iter().any(|wanted| type_name_matches(wanted, actual))
        })),

        FieldCond::Size(expected) => Ok(matches!(
            resolved,
            Some(Bson::Array(elements)) if elements.len() as i64 == *expected
        )),

        FieldCond::Mod(divisor, remainder) => {
            Ok(candidates(resolved).into_iter().any(|candidate| {
                candidate
                    .and_then(integer_valued)
                    .map_or(false, |n| n % divisor == *remainder)
            }))
        }

        FieldCond::Regex(re) => Ok(candidates(resolved).into_iter().any(|candidate| {
            match candidate {
                Some(Bson::String(s)) => re.is_match(s),
                Some(Bson::RegularExpression(field_re)) => field_re.pattern == *re.as_str(),
                _ => false,
            }
        })),

        // An empty $all list matches no documents.
        FieldCond::All(members) => Ok(!members.is_empty()
            && members
                .iter()
                .all(|member| eq_matches(resolved, member, options))),

        FieldCond::ElemMatch(elem_match) => {
            let elements = match resolved {
                Some(Bson::Array(elements)) => elements,
                _ => return Ok(false),
            };
            for element in elements {
                let hit = match elem_match {
                    ElemMatch::Conditions(conds) => {
                        let mut all = true;
                        for cond in conds {
                            if !cond_matches(Some(element), cond, options)? {
                                all = false;
                                break;
                            }
                        }
                        all
                    }
                    ElemMatch::Predicate(predicate) => match element {
                        Bson::Document(doc) => predicate.matches(doc, options)?,
                        _ => false,
                    },
                };
                if hit {
                    return Ok(true);
                }
            }
            Ok(false)
        }

        FieldCond::Not(conds) => {
            for cond in conds {
                if !cond_matches(resolved, cond, options)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

/// Equality with array-element semantics: the value matches, or any array
/// element matches, or the target is null and the field is missing.
fn eq_matches(resolved: Option<&Bson>, target: &Bson, options: &Options) -> bool {
    let collation = options.collation();
    match resolved {
        None => matches!(target, Bson::Null),
        Some(value) => {
            if eq_bson_collated(value, target, collation) {
                return true;
            }
            if let Bson::Array(elements) = value {
                return elements
                    .iter()
                    .any(|element| eq_bson_collated(element, target, collation));
            }
            false
        }
    }
}

/// Type-bracketed ordering: candidates only compare against targets of the
/// same canonical type class.
fn order_matches(
    resolved: Option<&Bson>,
    target: &Bson,
    options: &Options,
    test: fn(Ordering) -> bool,
) -> bool {
    let collation = options.collation();
    candidates(resolved).into_iter().any(|candidate| {
        let Some(value) = candidate else { return false };
        if type_rank(value) != type_rank(target) {
            return false;
        }
        test(cmp_bson_collated(value, target, collation))
    })
}

/// `$in` members: equality, except regex members which match strings.
fn in_member_matches(resolved: Option<&Bson>, member: &Bson, options: &Options) -> bool {
    if let Bson::RegularExpression(re) = member {
        if let Ok(compiled) = regex_util::compile(&re.pattern, &re.options) {
            return candidates(resolved).into_iter().any(|candidate| {
                matches!(candidate, Some(Bson::String(s)) if compiled.is_match(s))
            });
        }
        return false;
    }
    eq_matches(resolved, member, options)
}

/// First index in `elements` satisfying the predicate's conditions on
/// `array_path` (used by the positional `$` projection operator). `None`
/// when the predicate has no condition on that path.
pub(crate) fn first_matching_index(
    predicate: &Predicate,
    array_path: &str,
    elements: &[Bson],
    options: &Options,
) -> Option<usize> {
    let mut relevant: Vec<(&str, &FieldCond)> = Vec::new();
    collect_path_conds(predicate, array_path, &mut relevant);
    if relevant.is_empty() {
        return None;
    }
    let prefix_len = array_path.len() + 1;
    'elements: for (index, element) in elements.iter().enumerate() {
        for (path, cond) in &relevant {
            let target = if path.len() == array_path.len() {
                Some(element.clone())
            } else {
                crate::value::resolve(element, &path[prefix_len..])
            };
            match cond_matches(target.as_ref(), cond, options) {
                Ok(true) => {}
                _ => continue 'elements,
            }
        }
        return Some(index);
    }
    None
}

fn collect_path_conds<'a>(
    predicate: &'a Predicate,
    array_path: &str,
    out: &mut Vec<(&'a str, &'a FieldCond)>,
) {
    match predicate {
        Predicate::And(clauses) => {
            for clause in clauses {
                collect_path_conds(clause, array_path, out);
            }
        }
        Predicate::Field { path, conds } => {
            let relevant = path == array_path
                || (path.starts_with(array_path)
                    && path.as_bytes().get(array_path.len()) == Some(&b'.'));
            if relevant {
                out.extend(conds.iter().map(|cond| (path.as_str(), cond)));
            }
        }
        _ => {}
    }
}

fn integer_valued(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        Bson::Double(f) => Some(f.trunc() as i64),
        _ => None,
    }
}

fn type_name_matches(wanted: &str, actual: &'static str) -> bool {
    if wanted == "number" {
        return matches!(actual, "int" | "long" | "double" | "decimal");
    }
    wanted == actual
}
