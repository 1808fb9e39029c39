//! JSON-Schema-subset validation of tool arguments.
//!
//! The supported subset is `type`, `properties` (with `type`, `enum`,
//! `pattern`, `minimum`, `maximum`), and `required`. Validation is pure:
//! it never mutates the arguments and never touches the outside world.

use crate::errors::ValidationError;
use regex::Regex;
use serde_json::{Map, Value};

/// Validate a candidate argument map against a tool's input schema.
///
/// Checks, in order: every `required` name is present; each supplied value
/// whose name appears in `properties` matches the declared primitive type;
/// `enum` membership; `pattern` match for strings; inclusive
/// `minimum`/`maximum` for numerics. Unknown argument names pass through
/// unchecked.
pub fn validate_arguments(
    schema: &Value,
    args: &Map<String, Value>,
) -> Result<(), ValidationError> {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !args.contains_key(name) {
                return Err(ValidationError::MissingRequired(name.to_string()));
            }
        }
    }

    let properties = match schema.get("properties").and_then(Value::as_object) {
        Some(properties) => properties,
        None => return Ok(()),
    };

    for (name, value) in args {
        let property = match properties.get(name) {
            Some(property) => property,
            None => continue,
        };
        check_type(name, property, value)?;
        check_enum(name, property, value)?;
        check_pattern(name, property, value)?;
        check_range(name, property, value)?;
    }

    Ok(())
}

fn check_type(name: &str, property: &Value, value: &Value) -> Result<(), ValidationError> {
    let declared = match property.get("type").and_then(Value::as_str) {
        Some(declared) => declared,
        None => return Ok(()),
    };
    let matches = match declared {
        "string" => value.is_string(),
        "integer" => is_whole_number(value),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    };
    if matches {
        Ok(())
    } else {
        Err(ValidationError::TypeMismatch {
            name: name.to_string(),
            expected: declared.to_string(),
        })
    }
}

fn is_whole_number(value: &Value) -> bool {
    if value.as_i64().is_some() || value.as_u64().is_some() {
        return true;
    }
    value.as_f64().is_some_and(|f| f.fract() == 0.0)
}

fn check_enum(name: &str, property: &Value, value: &Value) -> Result<(), ValidationError> {
    if let Some(allowed) = property.get("enum").and_then(Value::as_array) {
        if !allowed.iter().any(|candidate| candidate == value) {
            return Err(ValidationError::NotInEnum(name.to_string()));
        }
    }
    Ok(())
}

fn check_pattern(name: &str, property: &Value, value: &Value) -> Result<(), ValidationError> {
    let pattern = match property.get("pattern").and_then(Value::as_str) {
        Some(pattern) => pattern,
        None => return Ok(()),
    };
    let text = match value.as_str() {
        Some(text) => text,
        None => return Ok(()),
    };
    let re = Regex::new(pattern).map_err(|e| ValidationError::BadSchema {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    if re.is_match(text) {
        Ok(())
    } else {
        Err(ValidationError::PatternMismatch {
            name: name.to_string(),
            pattern: pattern.to_string(),
        })
    }
}

fn check_range(name: &str, property: &Value, value: &Value) -> Result<(), ValidationError> {
    let number = match value.as_f64() {
        Some(number) => number,
        None => return Ok(()),
    };
    let minimum = property.get("minimum").and_then(Value::as_f64);
    let maximum = property.get("maximum").and_then(Value::as_f64);
    let low = minimum.unwrap_or(f64::NEG_INFINITY);
    let high = maximum.unwrap_or(f64::INFINITY);
    if number < low || number > high {
        return Err(ValidationError::OutOfRange {
            name: name.to_string(),
            low,
            high,
        });
    }
    Ok(())
}
