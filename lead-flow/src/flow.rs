use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::{
    error::{FlowError, Result},
    field_types::FieldDefinition,
};

/// A named group of fields. The same question may be attached to several steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

impl Question {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: FieldDefinition) -> Self {
        self.fields.push(field);
        self
    }
}

/// Role a step plays in the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Question,
    Distribution,
    /// Timed exit shown when a visitor leaves before finishing.
    Timed,
    NoMatch,
    CrossSell,
}

/// Comparison applied by a branch rule to one stored answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOp {
    Equals,
    NotEquals,
    In,
    Exists,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRule {
    pub field: String,
    pub op: RuleOp,
    #[serde(default)]
    pub value: Value,
}

impl BranchRule {
    pub fn holds(&self, answers: &Map<String, Value>) -> bool {
        let answer = answers.get(&self.field);
        match self.op {
            RuleOp::Exists => answer.is_some_and(|v| !v.is_null()),
            RuleOp::Equals => answer == Some(&self.value),
            RuleOp::NotEquals => answer != Some(&self.value),
            RuleOp::In => match (&self.value, answer) {
                (Value::Array(candidates), Some(answer)) => candidates.contains(answer),
                _ => false,
            },
        }
    }
}

/// Conditional jump from a step to the step with order `destination`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub destination: i32,
    #[serde(default)]
    pub rules: Vec<BranchRule>,
}

impl Branch {
    /// A branch with no rules always applies.
    pub fn applies(&self, answers: &Map<String, Value>) -> bool {
        self.rules.iter().all(|rule| rule.holds(answers))
    }
}

/// One stage of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: i64,
    pub order: i32,
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default)]
    pub questions: Vec<Question>,
    #[serde(default)]
    pub branches: Vec<Branch>,
    /// Step-type specific configuration (`options.ping_tree`, `cross_sell`, ...).
    #[serde(default)]
    pub data: Value,
}

impl Step {
    pub fn new(id: i64, order: i32, step_type: StepType) -> Self {
        Self {
            id,
            order,
            step_type,
            name: None,
            template: None,
            questions: Vec::new(),
            branches: Vec::new(),
            data: Value::Null,
        }
    }

    pub fn with_question(mut self, question: Question) -> Self {
        self.questions.push(question);
        self
    }

    pub fn with_branch(mut self, branch: Branch) -> Self {
        self.branches.push(branch);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn is_abandon(&self) -> bool {
        self.step_type == StepType::Timed
    }

    pub fn is_last(&self) -> bool {
        self.step_type == StepType::NoMatch
    }

    pub fn is_no_match(&self) -> bool {
        self.step_type == StepType::NoMatch
    }

    pub fn is_distribution(&self) -> bool {
        self.step_type == StepType::Distribution
    }

    pub fn is_cross_sell(&self) -> bool {
        self.step_type == StepType::CrossSell
    }

    /// Fields across all attached questions, first occurrence of each name wins.
    pub fn fields(&self) -> Vec<&FieldDefinition> {
        let mut seen = HashSet::new();
        self.questions
            .iter()
            .flat_map(|question| question.fields.iter())
            .filter(|field| seen.insert(field.name.as_str()))
            .collect()
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields().iter().map(|f| f.name.clone()).collect()
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.questions
            .iter()
            .flat_map(|question| question.fields.iter())
            .any(|field| field.name == name)
    }

    /// `data.options.ping_tree`, when the step configures it.
    pub fn ping_tree(&self) -> Option<bool> {
        self.data
            .get("options")
            .and_then(|options| options.get("ping_tree"))
            .and_then(Value::as_bool)
    }
}

fn default_version() -> i32 {
    1
}

/// An ordered set of steps plus flow-level policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: i64,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: i32,
    #[serde(default)]
    pub disable_leads: bool,
    #[serde(default)]
    pub subscribe_email: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<i64>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Flow {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            version: default_version(),
            disable_leads: false,
            subscribe_email: false,
            category_id: None,
            steps: Vec::new(),
        }
    }

    /// Parse a flow document (YAML, or JSON since JSON is valid YAML).
    /// Steps are kept sorted by `order` and field options are checked.
    pub fn from_yaml(document: &str) -> Result<Self> {
        let mut flow: Flow = serde_yaml::from_str(document)?;
        flow.steps.sort_by_key(|step| step.order);
        flow.check_definitions()?;
        Ok(flow)
    }

    /// Authoring-time validation of every field's options.
    pub fn check_definitions(&self) -> Result<()> {
        for step in &self.steps {
            for question in &step.questions {
                for field in &question.fields {
                    field.check_options()?;
                }
            }
        }
        Ok(())
    }

    pub fn first_step(&self) -> Option<&Step> {
        self.steps.iter().min_by_key(|step| step.order)
    }

    pub fn step_by_order(&self, order: i32) -> Option<&Step> {
        self.steps.iter().find(|step| step.order == order)
    }

    pub fn step_by_id(&self, id: i64) -> Option<&Step> {
        self.steps.iter().find(|step| step.id == id)
    }

    pub fn require_step(&self, order: i32) -> Result<&Step> {
        self.step_by_order(order)
            .ok_or_else(|| FlowError::StepNotFound(format!("flow {} order {}", self.id, order)))
    }

    /// First timed step in stored order.
    pub fn abandon_step(&self) -> Option<&Step> {
        self.steps.iter().find(|step| step.is_abandon())
    }

    pub fn no_match_step(&self) -> Option<&Step> {
        self.steps.iter().find(|step| step.is_no_match())
    }

    pub fn cross_sell_step(&self) -> Option<&Step> {
        self.steps.iter().find(|step| step.is_cross_sell())
    }

    pub fn first_distribution_step(&self) -> Option<&Step> {
        self.steps.iter().find(|step| step.is_distribution())
    }

    /// First distribution step in stored order whose `order` is below `order`.
    pub fn previous_distribution_step(&self, order: i32) -> Option<&Step> {
        self.steps
            .iter()
            .find(|step| step.is_distribution() && step.order < order)
    }

    /// Field names reachable from the flow's steps, in first-encounter order.
    pub fn flow_fields(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        for step in &self.steps {
            for field in step.fields() {
                if seen.insert(field.name.as_str()) {
                    names.push(field.name.clone());
                }
            }
        }
        names
    }

    pub fn find_field(&self, name: &str) -> Option<&FieldDefinition> {
        self.steps
            .iter()
            .flat_map(|step| step.questions.iter())
            .flat_map(|question| question.fields.iter())
            .find(|field| field.name == name)
    }

    /// Next step after `current`: first applicable branch, else the next step by order.
    pub fn next_step(&self, current: &Step, answers: &Map<String, Value>) -> Option<&Step> {
        for branch in &current.branches {
            if branch.applies(answers) {
                return self.step_by_order(branch.destination);
            }
        }

        self.steps
            .iter()
            .filter(|step| step.order > current.order)
            .min_by_key(|step| step.order)
    }
}

/// Builder for creating flows in code.
pub struct FlowBuilder {
    flow: Flow,
}

impl FlowBuilder {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            flow: Flow::new(id, name),
        }
    }

    pub fn add_step(mut self, step: Step) -> Self {
        self.flow.steps.push(step);
        self
    }

    pub fn disable_leads(mut self, disabled: bool) -> Self {
        self.flow.disable_leads = disabled;
        self
    }

    pub fn subscribe_email(mut self, subscribe: bool) -> Self {
        self.flow.subscribe_email = subscribe;
        self
    }

    pub fn category(mut self, category_id: i64) -> Self {
        self.flow.category_id = Some(category_id);
        self
    }

    pub fn build(mut self) -> Flow {
        self.flow.steps.sort_by_key(|step| step.order);
        self.flow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_types::FieldType;
    use serde_json::json;

    fn range_field(name: &str) -> FieldDefinition {
        FieldDefinition::new(name, FieldType::Range, json!({"start": 5, "end": 10})).required(true)
    }

    fn number_field(name: &str) -> FieldDefinition {
        FieldDefinition::new(name, FieldType::InputType, json!({"type": "Number"}))
    }

    #[test]
    fn test_step_predicates() {
        let timed = Step::new(1, 0, StepType::Timed);
        let no_match = Step::new(2, 1, StepType::NoMatch);

        assert!(timed.is_abandon());
        assert!(!no_match.is_abandon());
        assert!(no_match.is_last());
        assert!(!timed.is_last());
        assert!(no_match.is_no_match());
        assert!(!timed.is_no_match());
    }

    #[test]
    fn test_field_names_are_deduplicated() {
        let question = Question::new("buhbye")
            .with_field(number_field("hiho"))
            .with_field(number_field("buhbye"));
        let step = Step::new(1, 0, StepType::Question)
            .with_question(question.clone())
            .with_question(question);

        assert_eq!(step.field_names(), vec!["hiho", "buhbye"]);
    }

    #[test]
    fn test_abandon_step_scans_in_order() {
        let flow = FlowBuilder::new(1, "f")
            .add_step(Step::new(1, 1, StepType::Question))
            .add_step(Step::new(3, 3, StepType::Timed))
            .add_step(Step::new(2, 2, StepType::Timed))
            .build();

        assert_eq!(flow.abandon_step().map(|s| s.id), Some(2));
        assert!(FlowBuilder::new(2, "empty").build().abandon_step().is_none());
    }

    #[test]
    fn test_flow_fields_only_attached_questions() {
        let flow = FlowBuilder::new(1, "f")
            .add_step(
                Step::new(1, 0, StepType::Question)
                    .with_question(Question::new("q_1").with_field(range_field("field_step_1"))),
            )
            .add_step(
                Step::new(2, 1, StepType::Question)
                    .with_question(Question::new("q_2").with_field(number_field("field_step_2"))),
            )
            .build();

        assert_eq!(flow.flow_fields(), vec!["field_step_1", "field_step_2"]);
        assert!(FlowBuilder::new(2, "empty").build().flow_fields().is_empty());
    }

    #[test]
    fn test_previous_distribution_step() {
        let mut flow = FlowBuilder::new(1, "f")
            .add_step(Step::new(1, 1, StepType::Question))
            .build();
        assert!(flow.previous_distribution_step(1).is_none());

        flow.steps.insert(0, Step::new(9, 0, StepType::Distribution));
        assert_eq!(flow.previous_distribution_step(1).map(|s| s.id), Some(9));
        assert!(flow.previous_distribution_step(0).is_none());
    }

    #[test]
    fn test_next_step_follows_branches() {
        let first = Step::new(1, 0, StepType::Question).with_branch(Branch {
            destination: 5,
            rules: vec![BranchRule {
                field: "owner".into(),
                op: RuleOp::Equals,
                value: json!("no"),
            }],
        });
        let flow = FlowBuilder::new(1, "f")
            .add_step(first.clone())
            .add_step(Step::new(2, 1, StepType::Question))
            .add_step(Step::new(3, 5, StepType::NoMatch))
            .build();

        let mut answers = Map::new();
        answers.insert("owner".into(), json!("yes"));
        assert_eq!(flow.next_step(&first, &answers).map(|s| s.id), Some(2));

        answers.insert("owner".into(), json!("no"));
        assert_eq!(flow.next_step(&first, &answers).map(|s| s.id), Some(3));

        let last = flow.step_by_order(5).unwrap();
        assert!(flow.next_step(last, &answers).is_none());
    }

    #[test]
    fn test_rule_ops() {
        let mut answers = Map::new();
        answers.insert("color".into(), json!("red"));

        let rule = |op, value| BranchRule {
            field: "color".into(),
            op,
            value,
        };
        assert!(rule(RuleOp::In, json!(["red", "blue"])).holds(&answers));
        assert!(!rule(RuleOp::In, json!(["green"])).holds(&answers));
        assert!(rule(RuleOp::NotEquals, json!("blue")).holds(&answers));
        assert!(rule(RuleOp::Exists, Value::Null).holds(&answers));
        assert!(
            !BranchRule {
                field: "size".into(),
                op: RuleOp::Exists,
                value: Value::Null
            }
            .holds(&answers)
        );
    }

    #[test]
    fn test_from_yaml_sorts_and_checks() {
        let document = r#"
id: 7
name: solar
steps:
  - id: 2
    order: 1
    step_type: distribution
    data:
      options:
        ping_tree: true
  - id: 1
    order: 0
    step_type: question
    questions:
      - name: q_1
        fields:
          - name: zip
            field_type: input_type
            required: true
            data:
              type: String
"#;
        let flow = Flow::from_yaml(document).unwrap();
        assert_eq!(flow.steps[0].id, 1);
        assert_eq!(flow.steps[1].ping_tree(), Some(true));
        assert_eq!(flow.version, Flow::new(7, "solar").version);
        assert_eq!(flow.version, 1);

        let broken = r#"
id: 8
name: broken
steps:
  - id: 1
    order: 0
    step_type: question
    questions:
      - name: q
        fields:
          - name: r
            field_type: range
            data:
              start: 5
"#;
        assert!(matches!(
            Flow::from_yaml(broken),
            Err(FlowError::InvalidFieldConfig { .. })
        ));
    }
}
