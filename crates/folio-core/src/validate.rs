//! Field validation run before any store round trip.
//!
//! Validation checks what the descriptor declares: required fields, text
//! length, decimal precision and regex patterns. Store-side constraints
//! (uniqueness, foreign keys) are left to the store.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use regex::Regex;

use crate::error::ValidationError;
use crate::field::{FieldDescriptor, FieldType};
use crate::record::Record;
use crate::value::Value;

/// Thread-safe regex cache for compiled patterns.
///
/// Patterns are compiled lazily on first use and cached for the lifetime
/// of the program.
struct RegexCache {
    cache: RwLock<HashMap<String, Regex>>,
}

impl RegexCache {
    fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_compile(&self, pattern: &str) -> Result<Regex, regex::Error> {
        // Use unwrap_or_else to recover from poisoned lock (another thread panicked)
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(regex) = cache.get(pattern) {
                return Ok(regex.clone());
            }
        }

        let regex = Regex::new(pattern)?;
        {
            let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
            cache.insert(pattern.to_string(), regex.clone());
        }
        Ok(regex)
    }
}

fn regex_cache() -> &'static RegexCache {
    static CACHE: OnceLock<RegexCache> = OnceLock::new();
    CACHE.get_or_init(RegexCache::new)
}

/// Get a compiled regex for `pattern` from the process-wide cache.
pub fn cached_regex(pattern: &str) -> Result<Regex, regex::Error> {
    regex_cache().get_or_compile(pattern)
}

/// Check if a string matches a regex pattern.
///
/// Returns `false` if the pattern is invalid (logs a warning).
pub fn matches_pattern(value: &str, pattern: &str) -> bool {
    match cached_regex(pattern) {
        Ok(regex) => regex.is_match(value),
        Err(e) => {
            tracing::warn!(
                pattern = pattern,
                error = %e,
                "Invalid regex pattern in validation, treating as non-match"
            );
            false
        }
    }
}

/// Which fields of a record a write will touch.
#[derive(Debug, Clone, Copy)]
pub enum ValidationScope<'a> {
    /// A new row: every field is checked
    Insert,
    /// An update: only the listed field positions are checked
    Update(&'a [usize]),
}

/// Validate a record against its descriptor.
pub fn validate_record(record: &Record, scope: ValidationScope<'_>) -> Result<(), ValidationError> {
    let descriptor = record.descriptor();
    let mut errors = ValidationError::for_entity(descriptor.name);

    let check = |index: usize, errors: &mut ValidationError| {
        let field = &descriptor.fields[index];
        validate_field(field, record.value_at(index), errors);
    };

    match scope {
        ValidationScope::Insert => {
            for index in 0..descriptor.fields.len() {
                check(index, &mut errors);
            }
        }
        ValidationScope::Update(changed) => {
            for &index in changed {
                check(index, &mut errors);
            }
        }
    }

    errors.into_result()
}

fn validate_field(field: &FieldDescriptor, value: &Value, errors: &mut ValidationError) {
    if matches!(value, Value::Null | Value::Default) {
        if field.required && !field.store_fills() {
            errors.add_required(field.name);
        }
        return;
    }

    if !field.field_type.accepts(value) {
        errors.add_type(field.name, field.field_type.name(), value.type_name());
        return;
    }

    if let Value::Text(text) = value {
        if let Some(max) = field.max_length {
            let len = text.chars().count();
            if len > max {
                errors.add_max_length(field.name, max, len);
            }
        }
        if let Some(pattern) = field.pattern {
            if !matches_pattern(text, pattern) {
                errors.add_pattern(field.name, pattern);
            }
        }
    }

    if let FieldType::Decimal { precision, scale } = field.field_type {
        if let Value::Decimal(text) = value {
            if !fits_decimal(text, precision, scale) {
                errors.add_precision(field.name, precision, scale);
            }
        }
    }
}

/// Does a decimal literal fit `decimal(precision, scale)`?
pub fn fits_decimal(text: &str, precision: u8, scale: u8) -> bool {
    let digits = text.strip_prefix(['-', '+']).unwrap_or(text);
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return false;
    }
    if !int_part.chars().all(|c| c.is_ascii_digit()) || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return false;
    }
    let int_digits = int_part.trim_start_matches('0').len();
    let frac_digits = frac_part.trim_end_matches('0').len();
    int_digits <= usize::from(precision.saturating_sub(scale)) && frac_digits <= usize::from(scale)
}
