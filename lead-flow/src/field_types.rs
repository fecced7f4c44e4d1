//! Field types: how a declared field turns into a value schema and how
//! submitted values are checked against it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::{
    error::{FlowError, Result},
    schema,
};

/// The closed set of field kinds a question can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Date,
    Range,
    SingleSelect,
    MultipleSelect,
    InputType,
}

/// Registry entry describing one field type to authoring tools.
#[derive(Debug, Clone, Serialize)]
pub struct FieldTypeDescriptor {
    pub name: &'static str,
    pub options_schema: Value,
}

impl FieldType {
    pub const ALL: [FieldType; 5] = [
        FieldType::Date,
        FieldType::Range,
        FieldType::SingleSelect,
        FieldType::MultipleSelect,
        FieldType::InputType,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Date => "date",
            FieldType::Range => "range",
            FieldType::SingleSelect => "single_select",
            FieldType::MultipleSelect => "multiple_select",
            FieldType::InputType => "input_type",
        }
    }

    /// Every known field type with the schema its configuration must satisfy.
    pub fn registry() -> Vec<FieldTypeDescriptor> {
        Self::ALL
            .iter()
            .map(|field_type| FieldTypeDescriptor {
                name: field_type.as_str(),
                options_schema: field_type.options_schema(),
            })
            .collect()
    }

    /// Schema for the type-specific configuration stored in `FieldDefinition::data`.
    pub fn options_schema(&self) -> Value {
        match self {
            FieldType::Date => json!({"type": "object"}),
            FieldType::Range => json!({
                "type": "object",
                "required": ["start", "end"],
                "properties": {
                    "start": {"type": "integer"},
                    "end": {"type": "integer"},
                },
            }),
            FieldType::SingleSelect | FieldType::MultipleSelect => json!({
                "type": "object",
                "required": ["options"],
                "properties": {
                    "options": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["label", "value"],
                            "properties": {
                                "label": {"type": "string"},
                                "value": {"type": "string"},
                            },
                        },
                    },
                },
            }),
            FieldType::InputType => json!({
                "type": "object",
                "required": ["type"],
                "properties": {
                    "type": {"type": "string"},
                    "minLength": {"type": "integer"},
                    "maxLength": {"type": "integer"},
                    "min": {"type": "number"},
                    "max": {"type": "number"},
                },
            }),
        }
    }

    /// Check a field configuration at authoring time.
    pub fn validate_field_options(&self, data: &Value) -> std::result::Result<(), Vec<String>> {
        let errors = schema::validate(data, &self.options_schema());
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|field_type| field_type.as_str() == s)
            .ok_or_else(|| FlowError::NotFound(format!("field type '{s}'")))
    }
}

/// Sub-type of an `input_type` field, read from `data.type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputKind {
    Number,
    /// `String`, `Address`, `Email`... anything rendered as text.
    Text,
}

impl InputKind {
    fn from_data(data: &Value) -> Self {
        match data.get("type").and_then(Value::as_str) {
            Some("Number") => InputKind::Number,
            _ => InputKind::Text,
        }
    }
}

/// A single answerable field belonging to a question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_text: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType, data: Value) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            required_text: None,
            data,
        }
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn with_required_text(mut self, text: impl Into<String>) -> Self {
        self.required_text = Some(text.into());
        self
    }

    /// Authoring-time check of `data` against the type's options schema.
    pub fn check_options(&self) -> Result<()> {
        self.field_type
            .validate_field_options(&self.data)
            .map_err(|errors| self.config_error(errors.join("; ")))
    }

    /// The JSON-schema fragment describing valid values for this field.
    pub fn value_schema(&self) -> Result<Value> {
        match self.field_type {
            FieldType::Date => Ok(json!({"type": "string", "format": "date"})),
            FieldType::Range => {
                let start = self.integer_option("start")?;
                let end = self.integer_option("end")?;
                Ok(json!({"type": "integer", "minimum": start, "maximum": end}))
            }
            FieldType::SingleSelect => Ok(json!({
                "type": "string",
                "enum": self.option_values()?,
            })),
            FieldType::MultipleSelect => Ok(json!({
                "type": "array",
                "items": {"type": "string", "enum": self.option_values()?},
            })),
            FieldType::InputType => Ok(self.input_schema()),
        }
    }

    /// Every schema violation for `value`; empty when the value is accepted.
    ///
    /// Only a malformed field configuration is an error.
    pub fn violations(&self, value: &Value) -> Result<Vec<String>> {
        let schema = self.value_schema()?;
        Ok(schema::validate(value, &schema))
    }

    /// Lenient check used when prefilling answers from untrusted input.
    pub fn accepts(&self, value: &Value) -> bool {
        match self.violations(value) {
            Ok(errors) => errors.is_empty(),
            Err(e) => {
                warn!(field = %self.name, error = %e, "Field configuration rejected");
                false
            }
        }
    }

    fn input_schema(&self) -> Value {
        let mut schema = Map::new();
        match InputKind::from_data(&self.data) {
            InputKind::Number => {
                schema.insert("type".into(), json!("number"));
                if let Some(min) = self.present_option("min") {
                    schema.insert("minimum".into(), min.clone());
                }
                if let Some(max) = self.present_option("max") {
                    schema.insert("maximum".into(), max.clone());
                }
            }
            InputKind::Text => {
                schema.insert("type".into(), json!("string"));
                match self.positive_option("minLength") {
                    Some(min) => {
                        schema.insert("minLength".into(), json!(min));
                    }
                    None if self.required => {
                        schema.insert("minLength".into(), json!(1));
                    }
                    None => {}
                }
                if let Some(max) = self.positive_option("maxLength") {
                    schema.insert("maxLength".into(), json!(max));
                }
            }
        }
        Value::Object(schema)
    }

    fn present_option(&self, key: &str) -> Option<&Value> {
        self.data.get(key).filter(|v| !v.is_null())
    }

    // Zero counts as "not configured" for lengths.
    fn positive_option(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(Value::as_u64).filter(|n| *n > 0)
    }

    fn integer_option(&self, key: &str) -> Result<Value> {
        match self.data.get(key) {
            Some(value) if schema::is_type(value, "integer") => Ok(value.clone()),
            Some(value) => Err(self.config_error(format!(
                "{} is not of type 'integer'",
                schema::py_repr(value)
            ))),
            None => Err(self.config_error(format!("'{key}' is a required property"))),
        }
    }

    fn option_values(&self) -> Result<Vec<Value>> {
        let options = self
            .data
            .get("options")
            .and_then(Value::as_array)
            .ok_or_else(|| self.config_error("'options' is a required property".to_string()))?;

        Ok(options
            .iter()
            .filter_map(|option| option.get("value").cloned())
            .collect())
    }

    fn config_error(&self, reason: String) -> FlowError {
        FlowError::InvalidFieldConfig {
            field: self.name.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select_data() -> Value {
        json!({
            "options": [
                {"label": "foo", "value": "X"},
                {"label": "bar", "value": "Y"},
                {"label": "baz", "value": "Z"},
            ]
        })
    }

    fn input(required: bool, data: Value) -> FieldDefinition {
        FieldDefinition::new("f", FieldType::InputType, data).required(required)
    }

    #[test]
    fn test_date_accepts_iso_date() {
        let field = FieldDefinition::new("d", FieldType::Date, Value::Null);
        assert!(field.violations(&json!("2020-12-12")).unwrap().is_empty());
    }

    #[test]
    fn test_range_options_require_end() {
        let result = FieldType::Range.validate_field_options(&json!({"start": 5}));
        assert_eq!(result, Err(vec!["'end' is a required property".to_string()]));

        assert!(
            FieldType::Range
                .validate_field_options(&json!({"start": 5, "end": 6}))
                .is_ok()
        );
    }

    #[test]
    fn test_range_values() {
        let field = FieldDefinition::new("r", FieldType::Range, json!({"start": 5, "end": 10}));

        assert!(field.violations(&json!(7)).unwrap().is_empty());
        assert_eq!(
            field.violations(&json!("hello")).unwrap(),
            vec!["'hello' is not of type 'integer'"]
        );
        assert_eq!(
            field.violations(&json!(15)).unwrap(),
            vec!["15 is greater than the maximum of 10"]
        );
    }

    #[test]
    fn test_range_without_bounds_is_config_error() {
        let field = FieldDefinition::new("r", FieldType::Range, json!({"start": 5}));
        assert!(matches!(
            field.violations(&json!(7)),
            Err(FlowError::InvalidFieldConfig { .. })
        ));
        assert!(!field.accepts(&json!(7)));
    }

    #[test]
    fn test_single_select_schema() {
        let field = FieldDefinition::new("s", FieldType::SingleSelect, select_data());
        assert_eq!(
            field.value_schema().unwrap(),
            json!({"type": "string", "enum": ["X", "Y", "Z"]})
        );
    }

    #[test]
    fn test_multiple_select_schema() {
        let field = FieldDefinition::new("m", FieldType::MultipleSelect, select_data());
        assert_eq!(
            field.value_schema().unwrap(),
            json!({"type": "array", "items": {"type": "string", "enum": ["X", "Y", "Z"]}})
        );
    }

    #[test]
    fn test_input_string_schemas() {
        let cases = [
            (false, json!({"type": "String", "minLength": 0, "maxLength": 0}), json!({"type": "string"})),
            (true, json!({"type": "String", "minLength": 0, "maxLength": 0}), json!({"type": "string", "minLength": 1})),
            (true, json!({"type": "String", "minLength": 3, "maxLength": 0}), json!({"type": "string", "minLength": 3})),
            (false, json!({"type": "String", "minLength": 0, "maxLength": 9}), json!({"type": "string", "maxLength": 9})),
            (true, json!({"type": "String", "minLength": 1, "maxLength": 10}), json!({"type": "string", "minLength": 1, "maxLength": 10})),
            (true, json!({"type": "Address"}), json!({"type": "string", "minLength": 1})),
        ];

        for (required, data, expected) in cases {
            assert_eq!(input(required, data.clone()).value_schema().unwrap(), expected, "{data}");
        }
    }

    #[test]
    fn test_input_number_schemas() {
        let cases = [
            (false, json!({"type": "Number"}), json!({"type": "number"})),
            (true, json!({"type": "Number", "min": 0}), json!({"type": "number", "minimum": 0})),
            (false, json!({"type": "Number", "max": 99}), json!({"type": "number", "maximum": 99})),
            (true, json!({"type": "Number", "min": 1, "max": 10}), json!({"type": "number", "minimum": 1, "maximum": 10})),
        ];

        for (required, data, expected) in cases {
            assert_eq!(input(required, data.clone()).value_schema().unwrap(), expected, "{data}");
        }
    }

    #[test]
    fn test_registry_lists_every_type() {
        let names: Vec<_> = FieldType::registry().iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec!["date", "range", "single_select", "multiple_select", "input_type"]
        );
        assert_eq!("range".parse::<FieldType>().unwrap(), FieldType::Range);
        assert!("slider".parse::<FieldType>().is_err());
    }
}
