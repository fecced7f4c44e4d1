//! Display strings summarizing a visitor's answers.

use serde_json::{Map, Value};
use std::fmt;
use tracing::warn;

const WILDCARD: &str = "*";
const PLACEHOLDER: &str = "{}";

/// An answer the recap mapping had nothing for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecapMiss {
    Question(String),
    Answer { question: String, answer: String },
}

impl fmt::Display for RecapMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecapMiss::Question(question) => write!(f, "recap question {question} not found"),
            RecapMiss::Answer { question, answer } => {
                write!(f, "no recap answer {answer} matched for question {question}")
            }
        }
    }
}

/// Resolve each stored answer through `recap` (question -> answer text ->
/// template), in answer order. Misses are logged and skipped.
pub fn recap_answers(answers: &Map<String, Value>, recap: &Map<String, Value>) -> Vec<String> {
    let (lines, misses) = resolve(answers, recap);
    for miss in &misses {
        warn!("{miss}");
    }
    lines
}

/// Like [`recap_answers`] but hands back the misses instead of logging them.
pub fn resolve(
    answers: &Map<String, Value>,
    recap: &Map<String, Value>,
) -> (Vec<String>, Vec<RecapMiss>) {
    let mut lines = Vec::new();
    let mut misses = Vec::new();

    for (question, stored) in answers {
        let Some(templates) = recap.get(question).and_then(Value::as_object) else {
            misses.push(RecapMiss::Question(question.clone()));
            continue;
        };

        let items: Vec<&Value> = match stored {
            Value::Array(items) => items.iter().collect(),
            single => vec![single],
        };

        for item in items {
            let answer = answer_text(item);
            let template = templates
                .get(&answer)
                .or_else(|| templates.get(WILDCARD))
                .and_then(Value::as_str);

            match template {
                Some(template) => lines.push(template.replacen(PLACEHOLDER, &answer, 1)),
                None => misses.push(RecapMiss::Answer {
                    question: question.clone(),
                    answer,
                }),
            }
        }
    }

    (lines, misses)
}

fn answer_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
