// src/expr/ops/string.rs
// String operators. Byte/code-point pairs ($strLenBytes/$strLenCP, ...) are
// distinct operators rather than flags, matching the operator catalog. The
// $regex* family compiles through the shared pattern cache since patterns
// may be computed per document.

use bson::{Bson, Document};

use crate::error::{Result, SiftError};
use crate::expr::eval::{nullish, require_args};
use crate::expr::{check_named_args, named_arg, EvalCtx, Expression};
use crate::regex_util;

use super::Registry;

pub(super) fn register(registry: &mut Registry) {
    registry.insert("$concat", op_concat);
    registry.insert("$indexOfBytes", |ctx, arg| index_of(ctx, arg, "$indexOfBytes", false));
    registry.insert("$indexOfCP", |ctx, arg| index_of(ctx, arg, "$indexOfCP", true));
    registry.insert("$ltrim", |ctx, arg| trim(ctx, arg, "$ltrim", true, false));
    registry.insert("$regexFind", op_regex_find);
    registry.insert("$regexFindAll", op_regex_find_all);
    registry.insert("$regexMatch", op_regex_match);
    registry.insert("$replaceAll", |ctx, arg| replace(ctx, arg, "$replaceAll", true));
    registry.insert("$replaceOne", |ctx, arg| replace(ctx, arg, "$replaceOne", false));
    registry.insert("$rtrim", |ctx, arg| trim(ctx, arg, "$rtrim", false, true));
    registry.insert("$split", op_split);
    registry.insert("$strLenBytes", op_str_len_bytes);
    registry.insert("$strLenCP", op_str_len_cp);
    registry.insert("$strcasecmp", op_strcasecmp);
    registry.insert("$substr", |ctx, arg| substr(ctx, arg, "$substr", false));
    registry.insert("$substrBytes", |ctx, arg| substr(ctx, arg, "$substrBytes", false));
    registry.insert("$substrCP", |ctx, arg| substr(ctx, arg, "$substrCP", true));
    registry.insert("$toLower", |ctx, arg| case_fold(ctx, arg, "$toLower", false));
    registry.insert("$toUpper", |ctx, arg| case_fold(ctx, arg, "$toUpper", true));
    registry.insert("$trim", |ctx, arg| trim(ctx, arg, "$trim", true, true));
}

fn require_string<'a>(operator: &'static str, value: &'a Bson) -> Result<&'a str> {
    value.as_str().ok_or_else(|| {
        SiftError::type_mismatch(operator, format!("expected a string, got {:?}", value))
    })
}

/// Stringify for the operators that coerce scalars ($concat does not; this
/// backs $substr and $strcasecmp's null-to-"" behavior).
fn string_or_empty(value: &Bson) -> Option<String> {
    match value {
        Bson::Null | Bson::Undefined => Some(String::new()),
        Bson::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn op_concat(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    let mut out = String::new();
    for value in &args {
        if nullish(value) {
            return Ok(Bson::Null);
        }
        out.push_str(require_string("$concat", value)?);
    }
    Ok(Bson::String(out))
}

fn case_fold(ctx: &EvalCtx, arg: &Expression, operator: &'static str, upper: bool) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args(operator, &args, 1)?;
    // Null folds to the empty string for the case operators.
    if nullish(&args[0]) {
        return Ok(Bson::String(String::new()));
    }
    let s = require_string(operator, &args[0])?;
    Ok(Bson::String(if upper {
        s.to_uppercase()
    } else {
        s.to_lowercase()
    }))
}

fn op_str_len_bytes(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$strLenBytes", &args, 1)?;
    Ok(Bson::Int32(require_string("$strLenBytes", &args[0])?.len() as i32))
}

fn op_str_len_cp(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$strLenCP", &args, 1)?;
    Ok(Bson::Int32(
        require_string("$strLenCP", &args[0])?.chars().count() as i32,
    ))
}

fn op_strcasecmp(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$strcasecmp", &args, 2)?;
    let a = string_or_empty(&args[0])
        .ok_or_else(|| SiftError::type_mismatch("$strcasecmp", "expected strings"))?;
    let b = string_or_empty(&args[1])
        .ok_or_else(|| SiftError::type_mismatch("$strcasecmp", "expected strings"))?;
    Ok(Bson::Int32(match a.to_lowercase().cmp(&b.to_lowercase()) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }))
}

fn op_split(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args("$split", &args, 2)?;
    if nullish(&args[0]) {
        return Ok(Bson::Null);
    }
    let input = require_string("$split", &args[0])?;
    let delimiter = require_string("$split", &args[1])?;
    if delimiter.is_empty() {
        return Err(SiftError::type_mismatch(
            "$split",
            "delimiter must not be empty",
        ));
    }
    Ok(Bson::Array(
        input
            .split(delimiter)
            .map(|part| Bson::String(part.to_string()))
            .collect(),
    ))
}

fn substr(ctx: &EvalCtx, arg: &Expression, operator: &'static str, code_points: bool) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    require_args(operator, &args, 3)?;
    let input = string_or_empty(&args[0])
        .ok_or_else(|| SiftError::type_mismatch(operator, "expected a string input"))?;
    let start = int_arg(operator, &args[1])?.max(0) as usize;
    let length = int_arg(operator, &args[2])?;

    if code_points {
        let chars: Vec<char> = input.chars().collect();
        let start = start.min(chars.len());
        let end = if length < 0 {
            chars.len()
        } else {
            (start + length as usize).min(chars.len())
        };
        return Ok(Bson::String(chars[start..end].iter().collect()));
    }

    let start = start.min(input.len());
    let end = if length < 0 {
        input.len()
    } else {
        (start + length as usize).min(input.len())
    };
    if !input.is_char_boundary(start) || !input.is_char_boundary(end) {
        return Err(SiftError::type_mismatch(
            operator,
            "byte range splits a UTF-8 character",
        ));
    }
    Ok(Bson::String(input[start..end].to_string()))
}

fn trim(
    ctx: &EvalCtx,
    arg: &Expression,
    operator: &'static str,
    left: bool,
    right: bool,
) -> Result<Bson> {
    let fields = arg.named_args(operator)?;
    check_named_args(fields, operator, &["input", "chars"])?;
    let input_expr = named_arg(fields, "input").ok_or_else(|| {
        SiftError::InvalidExpression(format!("{} requires an input argument", operator))
    })?;
    let input = ctx.compute(input_expr)?;
    if nullish(&input) {
        return Ok(Bson::Null);
    }
    let input = require_string(operator, &input)?;

    let chars: Option<Vec<char>> = match named_arg(fields, "chars") {
        Some(chars_expr) => {
            let chars = ctx.compute(chars_expr)?;
            if nullish(&chars) {
                return Ok(Bson::Null);
            }
            Some(require_string(operator, &chars)?.chars().collect())
        }
        None => None,
    };
    let is_trimmed = |c: char| match &chars {
        Some(set) => set.contains(&c),
        None => c.is_whitespace(),
    };

    let trimmed = match (left, right) {
        (true, true) => input.trim_matches(is_trimmed),
        (true, false) => input.trim_start_matches(is_trimmed),
        (false, true) => input.trim_end_matches(is_trimmed),
        (false, false) => input,
    };
    Ok(Bson::String(trimmed.to_string()))
}

fn index_of(ctx: &EvalCtx, arg: &Expression, operator: &'static str, code_points: bool) -> Result<Bson> {
    let args = ctx.eval_operands(arg)?;
    if args.len() < 2 || args.len() > 4 {
        return Err(SiftError::InvalidExpression(format!(
            "{} expects 2 to 4 arguments",
            operator
        )));
    }
    if nullish(&args[0]) {
        return Ok(Bson::Null);
    }
    let haystack = require_string(operator, &args[0])?;
    let needle = require_string(operator, &args[1])?;

    let unit_len = |s: &str| {
        if code_points {
            s.chars().count()
        } else {
            s.len()
        }
    };
    let total = unit_len(haystack);
    let start = match args.get(2) {
        Some(v) => int_arg(operator, v)?.max(0) as usize,
        None => 0,
    };
    let end = match args.get(3) {
        Some(v) => (int_arg(operator, v)?.max(0) as usize).min(total),
        None => total,
    };
    if start > end || start > total {
        return Ok(Bson::Int32(-1));
    }

    if code_points {
        let chars: Vec<char> = haystack.chars().collect();
        let window: String = chars[start..end].iter().collect();
        match window.find(needle) {
            Some(byte_idx) => {
                let cp_offset = window[..byte_idx].chars().count();
                Ok(Bson::Int32((start + cp_offset) as i32))
            }
            None => Ok(Bson::Int32(-1)),
        }
    } else {
        let end = end.min(haystack.len());
        if !haystack.is_char_boundary(start) || !haystack.is_char_boundary(end) {
            return Ok(Bson::Int32(-1));
        }
        match haystack[start..end].find(needle) {
            Some(idx) => Ok(Bson::Int32((start + idx) as i32)),
            None => Ok(Bson::Int32(-1)),
        }
    }
}

fn replace(ctx: &EvalCtx, arg: &Expression, operator: &'static str, all: bool) -> Result<Bson> {
    let fields = arg.named_args(operator)?;
    check_named_args(fields, operator, &["input", "find", "replacement"])?;
    let mut resolved = [Bson::Null, Bson::Null, Bson::Null];
    for (i, name) in ["input", "find", "replacement"].iter().enumerate() {
        let expr = named_arg(fields, name).ok_or_else(|| {
            SiftError::InvalidExpression(format!("{} requires {}", operator, name))
        })?;
        resolved[i] = ctx.compute(expr)?;
    }
    if resolved.iter().any(nullish) {
        return Ok(Bson::Null);
    }
    let input = require_string(operator, &resolved[0])?;
    let find = require_string(operator, &resolved[1])?;
    let replacement = require_string(operator, &resolved[2])?;
    Ok(Bson::String(if all {
        input.replace(find, replacement)
    } else {
        input.replacen(find, replacement, 1)
    }))
}

// ---------------------------------------------------------------------------
// $regexMatch / $regexFind / $regexFindAll
// ---------------------------------------------------------------------------

struct RegexArgs {
    input: Option<String>,
    regex: Option<std::sync::Arc<regex::Regex>>,
}

fn regex_args(ctx: &EvalCtx, arg: &Expression, operator: &'static str) -> Result<RegexArgs> {
    let fields = arg.named_args(operator)?;
    check_named_args(fields, operator, &["input", "regex", "options"])?;
    let input_expr = named_arg(fields, "input").ok_or_else(|| {
        SiftError::InvalidExpression(format!("{} requires input", operator))
    })?;
    let regex_expr = named_arg(fields, "regex").ok_or_else(|| {
        SiftError::InvalidExpression(format!("{} requires regex", operator))
    })?;

    let input = match ctx.compute(input_expr)? {
        value if nullish(&value) => None,
        Bson::String(s) => Some(s),
        other => {
            return Err(SiftError::type_mismatch(
                operator,
                format!("input must be a string, got {:?}", other),
            ))
        }
    };

    let extra_options = match named_arg(fields, "options") {
        Some(options_expr) => match ctx.compute(options_expr)? {
            Bson::String(s) => Some(s),
            value if nullish(&value) => None,
            _ => {
                return Err(SiftError::type_mismatch(
                    operator,
                    "options must be a string",
                ))
            }
        },
        None => None,
    };

    let regex = match ctx.compute(regex_expr)? {
        value if nullish(&value) => None,
        Bson::String(pattern) => Some(regex_util::compile(
            &pattern,
            extra_options.as_deref().unwrap_or(""),
        )?),
        Bson::RegularExpression(re) => {
            if extra_options.is_some() && !re.options.is_empty() {
                return Err(SiftError::InvalidExpression(format!(
                    "{}: options set on both the regex and the options field",
                    operator
                )));
            }
            let options = extra_options.unwrap_or_else(|| re.options.clone());
            Some(regex_util::compile(&re.pattern, &options)?)
        }
        other => {
            return Err(SiftError::type_mismatch(
                operator,
                format!("regex must be a string or regex, got {:?}", other),
            ))
        }
    };

    Ok(RegexArgs { input, regex })
}

fn match_document(input: &str, m: regex::Match<'_>, captures: &regex::Captures<'_>) -> Document {
    let mut doc = Document::new();
    doc.insert("match", Bson::String(m.as_str().to_string()));
    // idx counts code points, not bytes.
    doc.insert(
        "idx",
        Bson::Int32(input[..m.start()].chars().count() as i32),
    );
    let groups: Vec<Bson> = captures
        .iter()
        .skip(1)
        .map(|group| match group {
            Some(g) => Bson::String(g.as_str().to_string()),
            None => Bson::Null,
        })
        .collect();
    doc.insert("captures", Bson::Array(groups));
    doc
}

fn op_regex_match(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = regex_args(ctx, arg, "$regexMatch")?;
    match (args.input, args.regex) {
        (Some(input), Some(regex)) => Ok(Bson::Boolean(regex.is_match(&input))),
        _ => Ok(Bson::Boolean(false)),
    }
}

fn op_regex_find(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = regex_args(ctx, arg, "$regexFind")?;
    if let (Some(input), Some(regex)) = (args.input, args.regex) {
        if let Some(captures) = regex.captures(&input) {
            let m = captures.get(0).expect("group 0 always present");
            return Ok(Bson::Document(match_document(&input, m, &captures)));
        }
    }
    Ok(Bson::Null)
}

fn op_regex_find_all(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let args = regex_args(ctx, arg, "$regexFindAll")?;
    let mut out = Vec::new();
    if let (Some(input), Some(regex)) = (args.input, args.regex) {
        for captures in regex.captures_iter(&input) {
            let m = captures.get(0).expect("group 0 always present");
            out.push(Bson::Document(match_document(&input, m, &captures)));
        }
    }
    Ok(Bson::Array(out))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use bson::{bson, doc};

    fn eval(spec: Bson) -> Result<Bson> {
        let options = Options::default();
        let expr = Expression::parse(&spec, &options)?;
        let doc = doc! {"name": "Ada Lovelace", "tags": "a,b,c"};
        EvalCtx::new(&doc, &options).compute(&expr)
    }

    #[test]
    fn test_concat() {
        assert_eq!(
            eval(bson!({"$concat": ["a", "-", "b"]})).unwrap(),
            bson!("a-b")
        );
        assert_eq!(
            eval(bson!({"$concat": ["a", "$missing"]})).unwrap(),
            Bson::Null
        );
        assert!(eval(bson!({"$concat": ["a", 1]})).is_err());
    }

    #[test]
    fn test_case_folding() {
        assert_eq!(eval(bson!({"$toUpper": ["abc"]})).unwrap(), bson!("ABC"));
        assert_eq!(eval(bson!({"$toLower": ["AbC"]})).unwrap(), bson!("abc"));
        assert_eq!(eval(bson!({"$toLower": [Bson::Null]})).unwrap(), bson!(""));
    }

    #[test]
    fn test_str_lengths() {
        assert_eq!(eval(bson!({"$strLenBytes": ["héllo"]})).unwrap(), Bson::Int32(6));
        assert_eq!(eval(bson!({"$strLenCP": ["héllo"]})).unwrap(), Bson::Int32(5));
    }

    #[test]
    fn test_substr_variants() {
        assert_eq!(
            eval(bson!({"$substrCP": ["héllo", 1, 3]})).unwrap(),
            bson!("éll")
        );
        assert_eq!(
            eval(bson!({"$substrBytes": ["hello", 1, 3]})).unwrap(),
            bson!("ell")
        );
        // Negative length reads to the end.
        assert_eq!(
            eval(bson!({"$substr": ["hello", 2, -1]})).unwrap(),
            bson!("llo")
        );
    }

    #[test]
    fn test_split() {
        assert_eq!(
            eval(bson!({"$split": ["$tags", ","]})).unwrap(),
            bson!(["a", "b", "c"])
        );
        assert_eq!(eval(bson!({"$split": ["$missing", ","]})).unwrap(), Bson::Null);
        assert!(eval(bson!({"$split": ["a", ""]})).is_err());
    }

    #[test]
    fn test_trim_family() {
        assert_eq!(
            eval(bson!({"$trim": {"input": "  x  "}})).unwrap(),
            bson!("x")
        );
        assert_eq!(
            eval(bson!({"$ltrim": {"input": "  x "}})).unwrap(),
            bson!("x ")
        );
        assert_eq!(
            eval(bson!({"$rtrim": {"input": " x  "}})).unwrap(),
            bson!(" x")
        );
        assert_eq!(
            eval(bson!({"$trim": {"input": "xxhixx", "chars": "x"}})).unwrap(),
            bson!("hi")
        );
    }

    #[test]
    fn test_index_of() {
        assert_eq!(
            eval(bson!({"$indexOfBytes": ["hello", "l"]})).unwrap(),
            Bson::Int32(2)
        );
        assert_eq!(
            eval(bson!({"$indexOfBytes": ["hello", "z"]})).unwrap(),
            Bson::Int32(-1)
        );
        assert_eq!(
            eval(bson!({"$indexOfCP": ["héllo", "l"]})).unwrap(),
            Bson::Int32(2)
        );
    }

    #[test]
    fn test_replace() {
        assert_eq!(
            eval(bson!({"$replaceOne": {"input": "a.b.c", "find": ".", "replacement": "-"}}))
                .unwrap(),
            bson!("a-b.c")
        );
        assert_eq!(
            eval(bson!({"$replaceAll": {"input": "a.b.c", "find": ".", "replacement": "-"}}))
                .unwrap(),
            bson!("a-b-c")
        );
    }

    #[test]
    fn test_regex_match() {
        assert_eq!(
            eval(bson!({"$regexMatch": {"input": "$name", "regex": "^Ada"}})).unwrap(),
            bson!(true)
        );
        assert_eq!(
            eval(bson!({"$regexMatch": {"input": "$name", "regex": "^ada", "options": "i"}}))
                .unwrap(),
            bson!(true)
        );
        assert_eq!(
            eval(bson!({"$regexMatch": {"input": "$missing", "regex": "x"}})).unwrap(),
            bson!(false)
        );
    }

    #[test]
    fn test_regex_find() {
        let got = eval(bson!({"$regexFind": {"input": "$name", "regex": "(L\\w+)"}})).unwrap();
        let doc = got.as_document().unwrap();
        assert_eq!(doc.get_str("match").unwrap(), "Lovelace");
        assert_eq!(doc.get_i32("idx").unwrap(), 4);
        assert_eq!(
            doc.get_array("captures").unwrap(),
            &vec![bson!("Lovelace")]
        );
        assert_eq!(
            eval(bson!({"$regexFind": {"input": "abc", "regex": "z"}})).unwrap(),
            Bson::Null
        );
    }

    #[test]
    fn test_regex_find_all() {
        let got = eval(bson!({"$regexFindAll": {"input": "$tags", "regex": "[a-z]"}})).unwrap();
        assert_eq!(got.as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_strcasecmp() {
        assert_eq!(
            eval(bson!({"$strcasecmp": ["Hello", "hello"]})).unwrap(),
            Bson::Int32(0)
        );
        assert_eq!(
            eval(bson!({"$strcasecmp": ["abc", "abd"]})).unwrap(),
            Bson::Int32(-1)
        );
    }
}
