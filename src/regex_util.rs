// src/regex_util.rs
// Compiled-regex cache shared by the $regex query operator and the
// $regexMatch expression family. Compilation is the expensive part, and
// expression-side patterns can be computed per document, so compiled
// patterns live in a bounded LRU keyed by (options, pattern).

use std::num::NonZeroUsize;
use std::sync::Arc;

use lazy_static::lazy_static;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;

use crate::error::{Result, SiftError};

const CACHE_CAPACITY: usize = 256;

lazy_static! {
    static ref PATTERN_CACHE: Mutex<LruCache<String, Arc<Regex>>> =
        Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap()));
}

/// Compile a MongoDB-style pattern with option letters (`i`, `m`, `s`, `x`),
/// reusing a cached compilation when one exists.
pub(crate) fn compile(pattern: &str, options: &str) -> Result<Arc<Regex>> {
    let mut flags = String::new();
    for letter in options.chars() {
        match letter {
            'i' | 'm' | 's' | 'x' => flags.push(letter),
            // Unicode matching is the regex crate's default.
            'u' => {}
            other => {
                return Err(SiftError::InvalidQuery(format!(
                    "unknown regex option: {}",
                    other
                )))
            }
        }
    }

    let key = format!("{}\u{1}{}", flags, pattern);
    if let Some(compiled) = PATTERN_CACHE.lock().get(&key) {
        return Ok(compiled.clone());
    }

    let translated = if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{}){}", flags, pattern)
    };
    let compiled = Arc::new(Regex::new(&translated)?);
    PATTERN_CACHE.lock().put(key, compiled.clone());
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_plain() {
        let re = compile("^ab+c$", "").unwrap();
        assert!(re.is_match("abbc"));
        assert!(!re.is_match("ac"));
    }

    #[test]
    fn test_compile_case_insensitive() {
        let re = compile("hello", "i").unwrap();
        assert!(re.is_match("HELLO world"));
    }

    #[test]
    fn test_unknown_option_rejected() {
        assert!(compile("a", "z").is_err());
    }

    #[test]
    fn test_cache_returns_same_instance() {
        let a = compile("cached", "i").unwrap();
        let b = compile("cached", "i").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(compile("(unclosed", "").is_err());
    }
}
