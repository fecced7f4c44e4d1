use anyhow::{Context as _, bail};
use lead_flow::{
    Endpoint, Flow, FlowConfig, FlowRunner, FlowSettings, FlowStorage, InMemoryCheckpointStorage,
    InMemoryFlowStorage, InMemorySessionStorage, PollOutcome, PostgresCheckpointStorage,
    PostgresSessionStorage, StepOutcome, StepRequest, storage::CheckpointStorage,
    storage::SessionStorage, telemetry::init_tracing,
};
use serde_json::{Map, Value, json};
use std::{sync::Arc, time::Duration};
use tracing::{error, info};
use uuid::Uuid;

const CONFIG_ID: i64 = 1;
const MAX_POLLS: usize = 10;
const POLL_INTERVAL: Duration = Duration::from_secs(2);

fn print_line(value: Value) {
    println!("{value}");
}

fn describe(outcome: &StepOutcome) -> Value {
    match outcome {
        StepOutcome::Invalid { step, errors } => json!({"outcome": "invalid", "step": step, "errors": errors}),
        StepOutcome::Next { step } => json!({"outcome": "next", "step": step}),
        StepOutcome::Distributing { step, lead_id } => {
            json!({"outcome": "distributing", "step": step, "lead_id": lead_id})
        }
        StepOutcome::DistributionSkipped { step } => json!({"outcome": "distribution_skipped", "step": step}),
        StepOutcome::Finished { step } => json!({"outcome": "finished", "step": step}),
    }
}

async fn storages(
    settings: &FlowSettings,
) -> anyhow::Result<(Arc<dyn SessionStorage>, Arc<dyn CheckpointStorage>)> {
    if let Some(database_url) = &settings.database_url {
        info!("Using PostgreSQL session storage");
        match (
            PostgresSessionStorage::connect(database_url).await,
            PostgresCheckpointStorage::connect(database_url).await,
        ) {
            (Ok(sessions), Ok(checkpoints)) => return Ok((Arc::new(sessions), Arc::new(checkpoints))),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to connect to PostgreSQL: {}. Falling back to in-memory storage.", e);
            }
        }
    } else {
        info!("Using in-memory session storage (set DATABASE_URL to use PostgreSQL)");
    }
    Ok((
        Arc::new(InMemorySessionStorage::new()),
        Arc::new(InMemoryCheckpointStorage::new()),
    ))
}

#[cfg(feature = "leads-api")]
fn with_leads_api(runner: FlowRunner, settings: &FlowSettings) -> anyhow::Result<FlowRunner> {
    Ok(match &settings.leads_api_url {
        Some(url) => runner.with_distribution(Arc::new(lead_flow::distribution::HttpLeadsClient::new(url)?)),
        None => runner,
    })
}

#[cfg(not(feature = "leads-api"))]
fn with_leads_api(runner: FlowRunner, _settings: &FlowSettings) -> anyhow::Result<FlowRunner> {
    Ok(runner)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let [_, flow_path, answers_path] = args.as_slice() else {
        bail!("usage: run_flow <flow.yaml> <answers.json>");
    };

    let settings = FlowSettings::from_env()?;

    let document = std::fs::read_to_string(flow_path)
        .with_context(|| format!("reading flow definition {flow_path}"))?;
    let mut flow = Flow::from_yaml(&document)?;

    let answers: Vec<Map<String, Value>> = serde_json::from_str(
        &std::fs::read_to_string(answers_path)
            .with_context(|| format!("reading answers {answers_path}"))?,
    )
    .context("answers must be a JSON array with one object per step")?;

    if settings.leads_api_url.is_none() && !flow.disable_leads {
        info!("LEADS_API_URL not set, running with leads disabled");
        flow.disable_leads = true;
    }

    let flows = Arc::new(InMemoryFlowStorage::new());
    let first_step = flow.first_step().map(|step| step.order).context("flow has no steps")?;
    flows
        .save_config(Arc::new(FlowConfig {
            id: CONFIG_ID,
            flow_id: flow.id,
            category_id: flow.category_id,
            endpoint: Endpoint {
                host: "localhost".into(),
                path: format!("{}/", flow.name),
            },
            brand_ids: vec![],
        }))
        .await?;
    flows.save_flow(Arc::new(flow)).await?;

    let (sessions, checkpoints) = storages(&settings).await?;
    let runner = with_leads_api(
        FlowRunner::new(flows, sessions, checkpoints, &settings),
        &settings,
    )?;

    let session_id = Uuid::new_v4().to_string();
    let ca_session_id = Uuid::new_v4().to_string();
    let mut step_order = first_step;

    for step_answers in answers {
        let outcome = runner
            .submit_step(StepRequest {
                session_id: session_id.clone(),
                ca_session_id: Some(ca_session_id.clone()),
                config_id: CONFIG_ID,
                step_order,
                answers: step_answers,
            })
            .await?;
        print_line(describe(&outcome));

        match outcome {
            StepOutcome::Invalid { .. } => break,
            StepOutcome::Next { step } | StepOutcome::DistributionSkipped { step } => step_order = step,
            StepOutcome::Finished { .. } => return Ok(()),
            StepOutcome::Distributing { .. } => {
                let mut routed = None;
                for _ in 0..MAX_POLLS {
                    let result = runner
                        .poll_lead(&session_id, Some(&ca_session_id), CONFIG_ID)
                        .await?;
                    print_line(json!({
                        "outcome": "poll",
                        "status": result.outcome.status(),
                        "next_step": result.next_step,
                        "match_link": result.match_link,
                    }));
                    if matches!(result.outcome, PollOutcome::Processing) {
                        tokio::time::sleep(POLL_INTERVAL).await;
                        continue;
                    }
                    routed = result.next_step;
                    break;
                }
                match routed {
                    Some(step) => step_order = step,
                    None => return Ok(()),
                }
            }
        }
    }

    Ok(())
}
