// Cron trigger
//
// Expressions are parsed at init so a bad job fails the deployment, not
// the first fire. Each job runs on its own task: sleep to the next fire,
// seed the configured params plus `trigger_time`, dispatch, log failures
// and keep going. An empty action dispatches the job's workflow name as a
// pipeline; a non-empty action fires a state-machine transition.

use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use conveyor_core::config::CronJobConfig;
use conveyor_core::{
    services, AppHost, CoreError, DataMap, Module, Result, RunContext, ServiceDependency,
    TargetConfig, WorkflowDispatcher,
};

pub struct CronTriggerModule {
    name: String,
    jobs: Vec<CronJobConfig>,
    schedules: std::sync::Mutex<Vec<Schedule>>,
}

impl CronTriggerModule {
    pub fn new(name: impl Into<String>, jobs: Vec<CronJobConfig>) -> Self {
        Self {
            name: name.into(),
            jobs,
            schedules: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Module for CronTriggerModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn requires(&self) -> Vec<ServiceDependency> {
        vec![ServiceDependency::required(services::WORKFLOW_DISPATCHER)]
    }

    async fn init(&self, _host: &AppHost) -> Result<()> {
        let mut schedules = self.schedules.lock().expect("cron schedules poisoned");
        schedules.clear();
        for job in &self.jobs {
            let schedule = Schedule::from_str(&job.expression).map_err(|e| {
                CoreError::validation(format!(
                    "cron trigger '{}': bad expression '{}': {}",
                    self.name, job.expression, e
                ))
            })?;
            schedules.push(schedule);
        }
        Ok(())
    }

    async fn start(&self, ctx: &RunContext) -> Result<()> {
        let dispatcher: Arc<WorkflowDispatcher> =
            ctx.services().get(services::WORKFLOW_DISPATCHER)?;
        let schedules = self.schedules.lock().expect("cron schedules poisoned").clone();

        for (job, schedule) in self.jobs.iter().zip(schedules) {
            let job = job.clone();
            let dispatcher = dispatcher.clone();
            let cancel = ctx.background();
            let trigger = self.name.clone();

            tokio::spawn(async move {
                tracing::info!(trigger = %trigger, workflow = %job.workflow, expression = %job.expression, "cron job scheduled");
                run_job(trigger, job, schedule, dispatcher, cancel).await;
            });
        }
        Ok(())
    }
}

async fn run_job(
    trigger: String,
    job: CronJobConfig,
    schedule: Schedule,
    dispatcher: Arc<WorkflowDispatcher>,
    cancel: CancellationToken,
) {
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            tracing::info!(trigger = %trigger, workflow = %job.workflow, "cron schedule exhausted");
            return;
        };
        let wait = (next - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        let mut data: DataMap = job.params.clone();
        data.insert(
            "trigger_time".into(),
            json!(next.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)),
        );

        let target = cron_target(&job);
        tracing::info!(trigger = %trigger, workflow = %job.workflow, action = %job.action, "cron fire");

        // Log-and-discard: a failed fire never stops the schedule
        if let Err(e) = dispatcher.trigger_workflow(&cancel, &target, data).await {
            tracing::error!(trigger = %trigger, workflow = %job.workflow, error = %e, "cron dispatch failed");
        }
    }
}

fn cron_target(job: &CronJobConfig) -> TargetConfig {
    if job.action.is_empty() {
        TargetConfig::Pipeline {
            pipeline: job.workflow.clone(),
        }
    } else {
        TargetConfig::StateMachine {
            workflow: job.workflow.clone(),
            action: job.action.clone(),
        }
    }
}
