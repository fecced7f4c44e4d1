pub mod checkpoint;
pub mod config;
pub mod cross_sell;
pub mod distribution;
pub mod enrichment;
pub mod error;
pub mod field_types;
pub mod flow;
pub mod recap;
pub mod runner;
pub mod schema;
pub mod settings;
pub mod storage;
pub mod storage_postgres;
pub mod store;
pub mod telemetry;
pub mod validator;

// Re-export commonly used types
pub use checkpoint::{
    CheckpointLookup, CheckpointRejection, CheckpointService, CheckpointStatus, CheckpointTtl,
    CheckpointType, FlowCheckpoint,
};
pub use config::{Endpoint, FlowConfig};
pub use cross_sell::{Brand, CrossSellCategory, CrossSellSelection, CrossSellSource};
pub use distribution::{
    DistributionEngine, LeadDistributionClient, LeadSubmission, MatchingPolicy, PollOutcome,
    PolledLead, Referral, ReferralStatus, is_lead_duplicate,
};
pub use enrichment::{Enricher, prepopulate_answers};
pub use error::{FlowError, Result};
pub use field_types::{FieldDefinition, FieldType};
pub use flow::{Flow, FlowBuilder, Question, Step, StepType};
pub use recap::recap_answers;
pub use runner::{AbandonLink, FlowRunner, PollResult, ResumeOutcome, StepOutcome, StepRequest};
pub use settings::FlowSettings;
pub use storage::{
    CheckpointStorage, FlowStorage, InMemoryCheckpointStorage, InMemoryFlowStorage,
    InMemorySessionStorage, Session, SessionStorage,
};
pub use storage_postgres::{PostgresCheckpointStorage, PostgresSessionStorage};
pub use store::FlowSessionStore;
pub use validator::StepValidator;
