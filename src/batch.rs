//! Independent pipeline runs with bounded parallelism.

use crate::pipeline::{Pipeline, PipelineOutcome};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Builds a fresh pipeline for one task, so token counters never overlap.
pub type PipelineFactory = Arc<dyn Fn() -> Result<Pipeline> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTask {
    pub id: String,
    pub prompt: String,
}

impl BatchTask {
    pub fn new(id: &str, prompt: &str) -> Self {
        Self {
            id: id.to_string(),
            prompt: prompt.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded { outcome: PipelineOutcome },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: String,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
}

/// Per-task reports in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub reports: Vec<TaskReport>,
    pub succeeded: usize,
    pub failed: usize,
    pub total_tokens_used: u64,
}

impl BatchSummary {
    fn from_reports(reports: Vec<TaskReport>) -> Self {
        let mut succeeded = 0;
        let mut total_tokens_used = 0;
        for report in &reports {
            if let TaskOutcome::Succeeded { ref outcome } = report.outcome {
                succeeded += 1;
                total_tokens_used += outcome.tokens_used;
            }
        }
        Self {
            failed: reports.len() - succeeded,
            succeeded,
            total_tokens_used,
            reports,
        }
    }
}

pub struct BatchRunner {
    factory: PipelineFactory,
    max_workers: usize,
}

impl BatchRunner {
    pub fn new(factory: PipelineFactory, max_workers: usize) -> Self {
        Self {
            factory,
            max_workers: max_workers.max(1),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run every task. One task failing never stops the others.
    pub async fn run(&self, tasks: Vec<BatchTask>) -> BatchSummary {
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        tracing::info!(tasks = tasks.len(), max_workers = self.max_workers, "Batch started");

        let handles: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                let semaphore = semaphore.clone();
                let factory = self.factory.clone();
                let task_id = task.id.clone();
                let handle = tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await?;
                    let pipeline = factory()?;
                    let outcome = pipeline.execute(&task.prompt, None).await?;
                    anyhow::Ok(outcome)
                });
                (task_id, handle)
            })
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        for (task_id, handle) in handles {
            let outcome = match handle.await {
                Ok(Ok(outcome)) => TaskOutcome::Succeeded { outcome },
                Ok(Err(e)) => {
                    tracing::warn!(task_id = %task_id, error = %e, "Task failed");
                    TaskOutcome::Failed {
                        error: format!("{:#}", e),
                    }
                }
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "Task panicked");
                    TaskOutcome::Failed {
                        error: format!("task panicked: {}", e),
                    }
                }
            };
            reports.push(TaskReport { task_id, outcome });
        }

        let summary = BatchSummary::from_reports(reports);
        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            tokens = summary.total_tokens_used,
            "Batch complete"
        );
        summary
    }
}
