// src/collation.rs
// Locale-aware string ordering for $sort, $group keys and string comparisons.
//
// The descriptor mirrors MongoDB's collation document. Comparison implements
// the observable contract directly: strength 1-2 fold case, strength >= 3
// (or caseLevel) breaks primary ties by case, numericOrdering compares
// embedded digit runs as integers, and the shifted alternate skips spaces
// and punctuation below strength 4. Locale tailorings beyond simple
// case-folding are not modelled; `backwards` is accepted and validated but
// has no effect without secondary (accent) weights.

use std::cmp::Ordering;

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SiftError};

/// Whether upper- or lowercase sorts first on a primary tie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseFirst {
    Upper,
    Lower,
    /// Locale default; behaves like `Lower` (the Unicode default ordering).
    #[default]
    Off,
}

/// Whether spaces and punctuation participate in the comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Alternate {
    #[default]
    #[serde(rename = "non-ignorable")]
    NonIgnorable,
    #[serde(rename = "shifted")]
    Shifted,
}

/// A parsed collation descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Collation {
    pub locale: String,
    /// Comparison level, 1-5. Levels 1 and 2 compare case-insensitively.
    pub strength: u8,
    pub case_level: bool,
    pub case_first: CaseFirst,
    pub numeric_ordering: bool,
    pub alternate: Alternate,
    pub backwards: bool,
}

impl Default for Collation {
    fn default() -> Self {
        Collation::new("simple")
    }
}

impl Collation {
    /// A collation with MongoDB's defaults for the given locale.
    pub fn new(locale: impl Into<String>) -> Self {
        Collation {
            locale: locale.into(),
            strength: 3,
            case_level: false,
            case_first: CaseFirst::Off,
            numeric_ordering: false,
            alternate: Alternate::NonIgnorable,
            backwards: false,
        }
    }

    /// Parse a collation document, e.g. `{locale: "en", strength: 1}`.
    pub fn from_document(spec: &Document) -> Result<Self> {
        let locale = spec
            .get_str("locale")
            .map_err(|_| SiftError::InvalidQuery("collation requires a string locale".into()))?;
        let mut collation = Collation::new(locale);

        for (key, value) in spec.iter() {
            match key.as_str() {
                "locale" => {}
                "strength" => {
                    let n = int_field(value, "collation strength")?;
                    if !(1..=5).contains(&n) {
                        return Err(SiftError::InvalidQuery(format!(
                            "collation strength must be 1-5, got {}",
                            n
                        )));
                    }
                    collation.strength = n as u8;
                }
                "caseLevel" => collation.case_level = bool_field(value, "collation caseLevel")?,
                "caseFirst" => {
                    collation.case_first = match value.as_str() {
                        Some("upper") => CaseFirst::Upper,
                        Some("lower") => CaseFirst::Lower,
                        Some("off") => CaseFirst::Off,
                        _ => {
                            return Err(SiftError::InvalidQuery(
                                "collation caseFirst must be \"upper\", \"lower\" or \"off\""
                                    .into(),
                            ))
                        }
                    }
                }
                "numericOrdering" => {
                    collation.numeric_ordering = bool_field(value, "collation numericOrdering")?
                }
                "alternate" => {
                    collation.alternate = match value.as_str() {
                        Some("non-ignorable") => Alternate::NonIgnorable,
                        Some("shifted") => Alternate::Shifted,
                        _ => {
                            return Err(SiftError::InvalidQuery(
                                "collation alternate must be \"non-ignorable\" or \"shifted\""
                                    .into(),
                            ))
                        }
                    }
                }
                "backwards" => collation.backwards = bool_field(value, "collation backwards")?,
                other => {
                    return Err(SiftError::InvalidQuery(format!(
                        "unknown collation field: {}",
                        other
                    )))
                }
            }
        }

        Ok(collation)
    }

    /// Compare two strings under this collation.
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        if self.numeric_ordering {
            let ord = self.compare_numeric(a, b);
            if ord != Ordering::Equal {
                return ord;
            }
        } else {
            let ord = self.compare_primary(a, b);
            if ord != Ordering::Equal {
                return ord;
            }
        }

        if self.strength >= 3 || self.case_level {
            let ord = self.compare_case(a, b);
            if ord != Ordering::Equal {
                return ord;
            }
        }

        Ordering::Equal
    }

    /// True when two strings are equal under this collation.
    pub fn eq(&self, a: &str, b: &str) -> bool {
        self.compare(a, b) == Ordering::Equal
    }

    /// Primary-level comparison: folded characters, ignorables skipped under
    /// the shifted alternate.
    fn compare_primary(&self, a: &str, b: &str) -> Ordering {
        let mut ai = self.significant_chars(a);
        let mut bi = self.significant_chars(b);
        loop {
            match (ai.next(), bi.next()) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(x), Some(y)) => {
                    let ord = self.fold(x).cmp(&self.fold(y));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
            }
        }
    }

    /// Digit runs compare as integers; the surrounding text compares at the
    /// primary level.
    fn compare_numeric(&self, a: &str, b: &str) -> Ordering {
        let mut ac: Vec<char> = self.significant_chars(a).collect();
        let mut bc: Vec<char> = self.significant_chars(b).collect();
        ac.reverse();
        bc.reverse();

        loop {
            match (ac.last().copied(), bc.last().copied()) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                    let xa = take_digit_run(&mut ac);
                    let ya = take_digit_run(&mut bc);
                    let ord = cmp_digit_runs(&xa, &ya);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                (Some(x), Some(y)) => {
                    let ord = self.fold(x).cmp(&self.fold(y));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                    ac.pop();
                    bc.pop();
                }
            }
        }
    }

    /// Case tie-break: first position where the two strings disagree in
    /// case decides, per `caseFirst`. Falls back to byte order so the
    /// comparison stays total.
    fn compare_case(&self, a: &str, b: &str) -> Ordering {
        for (x, y) in self.significant_chars(a).zip(self.significant_chars(b)) {
            if self.fold(x) != self.fold(y) {
                break;
            }
            let xu = x.is_uppercase();
            let yu = y.is_uppercase();
            if xu != yu {
                return match self.case_first {
                    CaseFirst::Upper => {
                        if xu {
                            Ordering::Less
                        } else {
                            Ordering::Greater
                        }
                    }
                    CaseFirst::Lower | CaseFirst::Off => {
                        if xu {
                            Ordering::Greater
                        } else {
                            Ordering::Less
                        }
                    }
                };
            }
        }
        a.cmp(b)
    }

    fn significant_chars<'a>(&self, s: &'a str) -> impl Iterator<Item = char> + 'a {
        let skip_ignorable = self.alternate == Alternate::Shifted && self.strength < 4;
        s.chars()
            .filter(move |c| !skip_ignorable || !(c.is_whitespace() || c.is_ascii_punctuation()))
    }

    /// Primary weight of one character. Case always folds here; strength
    /// >= 3 reintroduces case at the tie-break stage. Multi-char
    /// expansions (ß -> ss) are locale tailorings this engine does not
    /// model.
    fn fold(&self, c: char) -> char {
        c.to_lowercase().next().unwrap_or(c)
    }
}

/// Parse an optional collation value out of an options/stage document.
pub fn collation_from_bson(value: &Bson) -> Result<Collation> {
    match value {
        Bson::Document(spec) => Collation::from_document(spec),
        _ => Err(SiftError::InvalidQuery(
            "collation must be a document".into(),
        )),
    }
}

fn take_digit_run(rev: &mut Vec<char>) -> Vec<char> {
    let mut run = Vec::new();
    while let Some(c) = rev.last().copied() {
        if c.is_ascii_digit() {
            run.push(c);
            rev.pop();
        } else {
            break;
        }
    }
    run
}

/// Compare digit runs numerically: strip leading zeros, then longer wins,
/// then lexical.
fn cmp_digit_runs(a: &[char], b: &[char]) -> Ordering {
    let a = strip_leading_zeros(a);
    let b = strip_leading_zeros(b);
    a.len().cmp(&b.len()).then_with(|| a.cmp(&b))
}

fn strip_leading_zeros(run: &[char]) -> &[char] {
    let start = run.iter().take_while(|c| **c == '0').count();
    if start == run.len() && !run.is_empty() {
        &run[run.len() - 1..]
    } else {
        &run[start..]
    }
}

fn int_field(value: &Bson, what: &str) -> Result<i64> {
    match value {
        Bson::Int32(n) => Ok(*n as i64),
        Bson::Int64(n) => Ok(*n),
        Bson::Double(f) if f.fract() == 0.0 => Ok(*f as i64),
        _ => Err(SiftError::InvalidQuery(format!(
            "{} must be an integer",
            what
        ))),
    }
}

fn bool_field(value: &Bson, what: &str) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| SiftError::InvalidQuery(format!("{} must be a boolean", what)))
}
