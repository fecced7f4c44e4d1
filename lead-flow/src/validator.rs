use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

use crate::{error::Result, flow::Step};

pub const DEFAULT_REQUIRED_TEXT: &str = "This field is required";

/// Per-field validation errors, keyed by field name.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Validates one step's submitted answers against the fields of its questions.
#[derive(Debug, Clone)]
pub struct StepValidator {
    errors: FieldErrors,
}

impl StepValidator {
    /// Evaluate every field of `step` against `answers`.
    ///
    /// Fails only when a field definition itself is malformed.
    pub fn new(step: &Step, answers: &Map<String, Value>) -> Result<Self> {
        let mut errors = FieldErrors::new();

        for field in step.fields() {
            let messages = match answers.get(&field.name) {
                None if field.required => vec![
                    field
                        .required_text
                        .clone()
                        .unwrap_or_else(|| DEFAULT_REQUIRED_TEXT.to_string()),
                ],
                None => continue,
                Some(value) => field.violations(value)?,
            };

            if !messages.is_empty() {
                errors.insert(field.name.clone(), messages);
            }
        }

        debug!(
            step = step.order,
            invalid_fields = errors.len(),
            "Validated step answers"
        );

        Ok(Self { errors })
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &FieldErrors {
        &self.errors
    }

    pub fn into_errors(self) -> FieldErrors {
        self.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        field_types::{FieldDefinition, FieldType},
        flow::{Question, StepType},
    };
    use serde_json::json;

    fn step(field_2_required: bool) -> Step {
        let field_1 =
            FieldDefinition::new("f_1", FieldType::Range, json!({"start": 5, "end": 10})).required(true);
        let field_2 = FieldDefinition::new("f_2", FieldType::InputType, json!({"type": "Number"}))
            .required(field_2_required)
            .with_required_text("required yo");

        Step::new(1, 0, StepType::Question)
            .with_question(Question::new("q_1").with_field(field_1))
            .with_question(Question::new("q_2").with_field(field_2))
    }

    fn answers(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_valid_answers() {
        let validator = StepValidator::new(&step(false), &answers(json!({"f_1": 6, "f_2": 10}))).unwrap();
        assert!(validator.is_valid());
        assert!(validator.errors().is_empty());
    }

    #[test]
    fn test_missing_optional_field_is_accepted() {
        let validator = StepValidator::new(&step(false), &answers(json!({"f_1": 6}))).unwrap();
        assert!(validator.is_valid());
    }

    #[test]
    fn test_missing_required_uses_default_text() {
        let validator = StepValidator::new(&step(false), &Map::new()).unwrap();
        assert!(!validator.is_valid());
        assert_eq!(
            validator.errors(),
            &FieldErrors::from([("f_1".to_string(), vec![DEFAULT_REQUIRED_TEXT.to_string()])])
        );
    }

    #[test]
    fn test_missing_required_uses_custom_text() {
        let validator = StepValidator::new(&step(true), &answers(json!({"f_1": 7}))).unwrap();
        assert!(!validator.is_valid());
        assert_eq!(
            validator.errors(),
            &FieldErrors::from([("f_2".to_string(), vec!["required yo".to_string()])])
        );
    }

    #[test]
    fn test_invalid_values() {
        let validator =
            StepValidator::new(&step(false), &answers(json!({"f_1": 15, "f_2": "wat"}))).unwrap();
        assert!(!validator.is_valid());
        assert_eq!(
            validator.into_errors(),
            FieldErrors::from([
                ("f_1".to_string(), vec!["15 is greater than the maximum of 10".to_string()]),
                ("f_2".to_string(), vec!["'wat' is not of type 'number'".to_string()]),
            ])
        );
    }
}
