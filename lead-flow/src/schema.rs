//! A small evaluator for the JSON-schema fragments produced by field types.
//!
//! Only the keywords the field types emit are understood: `type`, `enum`,
//! `minimum`, `maximum`, `minLength`, `maxLength`, `items`, `required`,
//! `properties` and `format: date`. Messages follow the vocabulary end users
//! already see ("15 is greater than the maximum of 10",
//! "'hello' is not of type 'integer'"), so values are rendered the way a
//! Python `repr` would render them.

use chrono::NaiveDate;
use serde_json::{Map, Value};

/// Evaluate `instance` against `schema`, returning every violation in schema
/// keyword order. An empty vector means the instance is valid.
pub fn validate(instance: &Value, schema: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    check(instance, schema, &mut errors);
    errors
}

fn check(instance: &Value, schema: &Value, errors: &mut Vec<String>) {
    let Some(keywords) = schema.as_object() else {
        return;
    };

    for (keyword, expected) in keywords {
        match keyword.as_str() {
            "type" => check_type(instance, expected, errors),
            "enum" => check_enum(instance, expected, errors),
            "minimum" => check_bound(instance, expected, Bound::Minimum, errors),
            "maximum" => check_bound(instance, expected, Bound::Maximum, errors),
            "minLength" => check_length(instance, expected, Bound::Minimum, errors),
            "maxLength" => check_length(instance, expected, Bound::Maximum, errors),
            "items" => {
                if let Value::Array(items) = instance {
                    for item in items {
                        check(item, expected, errors);
                    }
                }
            }
            "required" => check_required(instance, expected, errors),
            "properties" => check_properties(instance, expected, errors),
            "format" => check_format(instance, expected, errors),
            _ => {}
        }
    }
}

#[derive(Clone, Copy)]
enum Bound {
    Minimum,
    Maximum,
}

fn check_type(instance: &Value, expected: &Value, errors: &mut Vec<String>) {
    let types: Vec<&str> = match expected {
        Value::String(name) => vec![name.as_str()],
        Value::Array(names) => names.iter().filter_map(Value::as_str).collect(),
        _ => return,
    };

    if types.iter().any(|name| is_type(instance, name)) {
        return;
    }

    let names = types
        .iter()
        .map(|name| format!("'{name}'"))
        .collect::<Vec<_>>()
        .join(", ");
    errors.push(format!("{} is not of type {}", py_repr(instance), names));
}

/// JSON type membership, with booleans excluded from the numeric types and
/// integral floats (`7.0`) accepted as integers.
pub fn is_type(instance: &Value, name: &str) -> bool {
    match name {
        "string" => instance.is_string(),
        "number" => instance.is_number(),
        "integer" => match instance {
            Value::Number(n) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            _ => false,
        },
        "boolean" => instance.is_boolean(),
        "array" => instance.is_array(),
        "object" => instance.is_object(),
        "null" => instance.is_null(),
        _ => true,
    }
}

fn check_enum(instance: &Value, expected: &Value, errors: &mut Vec<String>) {
    let Value::Array(allowed) = expected else {
        return;
    };
    if !allowed.iter().any(|candidate| json_eq(candidate, instance)) {
        errors.push(format!(
            "{} is not one of {}",
            py_repr(instance),
            py_repr(expected)
        ));
    }
}

fn check_bound(instance: &Value, expected: &Value, bound: Bound, errors: &mut Vec<String>) {
    let (Value::Number(value), Value::Number(limit)) = (instance, expected) else {
        return;
    };
    let (Some(v), Some(l)) = (value.as_f64(), limit.as_f64()) else {
        return;
    };
    match bound {
        Bound::Minimum if v < l => errors.push(format!(
            "{} is less than the minimum of {}",
            py_repr(instance),
            py_repr(expected)
        )),
        Bound::Maximum if v > l => errors.push(format!(
            "{} is greater than the maximum of {}",
            py_repr(instance),
            py_repr(expected)
        )),
        _ => {}
    }
}

fn check_length(instance: &Value, expected: &Value, bound: Bound, errors: &mut Vec<String>) {
    let (Value::String(text), Some(limit)) = (instance, expected.as_u64()) else {
        return;
    };
    let length = text.chars().count() as u64;
    match bound {
        Bound::Minimum if length < limit => {
            errors.push(format!("{} is too short", py_repr(instance)))
        }
        Bound::Maximum if length > limit => {
            errors.push(format!("{} is too long", py_repr(instance)))
        }
        _ => {}
    }
}

fn check_required(instance: &Value, expected: &Value, errors: &mut Vec<String>) {
    let (Value::Object(object), Value::Array(names)) = (instance, expected) else {
        return;
    };
    for name in names.iter().filter_map(Value::as_str) {
        if !object.contains_key(name) {
            errors.push(format!("{} is a required property", py_str(name)));
        }
    }
}

fn check_properties(instance: &Value, expected: &Value, errors: &mut Vec<String>) {
    let (Value::Object(object), Value::Object(properties)) = (instance, expected) else {
        return;
    };
    for (name, property_schema) in properties {
        if let Some(value) = object.get(name) {
            check(value, property_schema, errors);
        }
    }
}

fn check_format(instance: &Value, expected: &Value, errors: &mut Vec<String>) {
    let (Value::String(text), Some("date")) = (instance, expected.as_str()) else {
        return;
    };
    if NaiveDate::parse_from_str(text, "%Y-%m-%d").is_err() {
        errors.push(format!("{} is not a 'date'", py_repr(instance)));
    }
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Render a JSON value the way error messages quote it.
pub fn py_repr(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => py_str(s),
        Value::Array(items) => format!(
            "[{}]",
            items.iter().map(py_repr).collect::<Vec<_>>().join(", ")
        ),
        Value::Object(object) => py_dict(object),
    }
}

fn py_dict(object: &Map<String, Value>) -> String {
    let entries = object
        .iter()
        .map(|(k, v)| format!("{}: {}", py_str(k), py_repr(v)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{{{entries}}}")
}

fn py_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integer_range_messages() {
        let schema = json!({"type": "integer", "minimum": 5, "maximum": 10});

        assert!(validate(&json!(7), &schema).is_empty());
        assert_eq!(
            validate(&json!(15), &schema),
            vec!["15 is greater than the maximum of 10"]
        );
        assert_eq!(
            validate(&json!(2), &schema),
            vec!["2 is less than the minimum of 5"]
        );
        assert_eq!(
            validate(&json!("hello"), &schema),
            vec!["'hello' is not of type 'integer'"]
        );
    }

    #[test]
    fn test_booleans_are_not_numbers() {
        assert_eq!(
            validate(&json!(true), &json!({"type": "number"})),
            vec!["True is not of type 'number'"]
        );
    }

    #[test]
    fn test_integral_float_is_integer() {
        assert!(validate(&json!(7.0), &json!({"type": "integer"})).is_empty());
        assert_eq!(
            validate(&json!(7.5), &json!({"type": "integer"})),
            vec!["7.5 is not of type 'integer'"]
        );
    }

    #[test]
    fn test_enum_and_items() {
        let schema = json!({"type": "array", "items": {"type": "string", "enum": ["X", "Y"]}});

        assert!(validate(&json!(["X", "Y"]), &schema).is_empty());
        assert_eq!(
            validate(&json!(["X", "Q", 3]), &schema),
            vec![
                "'Q' is not one of ['X', 'Y']",
                "3 is not of type 'string'",
                "3 is not one of ['X', 'Y']",
            ]
        );
    }

    #[test]
    fn test_string_lengths() {
        let schema = json!({"type": "string", "minLength": 1, "maxLength": 3});

        assert_eq!(validate(&json!(""), &schema), vec!["'' is too short"]);
        assert_eq!(validate(&json!("abcd"), &schema), vec!["'abcd' is too long"]);
        assert!(validate(&json!("abc"), &schema).is_empty());
    }

    #[test]
    fn test_required_properties() {
        let schema = json!({
            "type": "object",
            "required": ["start", "end"],
            "properties": {"start": {"type": "integer"}, "end": {"type": "integer"}}
        });

        assert_eq!(
            validate(&json!({"start": 5}), &schema),
            vec!["'end' is a required property"]
        );
    }

    #[test]
    fn test_date_format() {
        let schema = json!({"type": "string", "format": "date"});

        assert!(validate(&json!("2020-12-12"), &schema).is_empty());
        assert_eq!(
            validate(&json!("12.12.2012"), &schema),
            vec!["'12.12.2012' is not a 'date'"]
        );
    }

    #[test]
    fn test_repr_quotes() {
        assert_eq!(py_repr(&json!("it's")), "\"it's\"");
        assert_eq!(py_repr(&json!(null)), "None");
        assert_eq!(py_repr(&json!({"a": [1, false]})), "{'a': [1, False]}");
    }
}
