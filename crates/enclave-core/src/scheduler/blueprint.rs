//! Wavefront executor.
//!
//! Each wave runs every pending task whose dependencies have all completed.
//! Failed tasks never count as completed, so their dependents never become
//! ready; unrelated branches keep going. When a wave comes up empty with
//! tasks still pending, the leftovers are reported: tasks downstream of a
//! failure as skipped, the rest as a circular or unsatisfiable dependency.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use super::{BlueprintOutcome, TaskArtifact, TaskNode, TaskRunner};
use crate::error::{EnclaveError, EnclaveResult};
use crate::obs::emit_blueprint_finished;

type LaneResult = Vec<(String, EnclaveResult<Value>)>;

pub struct BlueprintExecutor {
    runner: Arc<dyn TaskRunner>,
    max_concurrent: usize,
}

impl BlueprintExecutor {
    pub fn new(runner: Arc<dyn TaskRunner>, max_concurrent: usize) -> Self {
        Self {
            runner,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Run the blueprint to completion or stall. Only a malformed blueprint
    /// (duplicate ids) is an `Err`; task failures land in the outcome.
    #[instrument(skip_all, fields(tasks = tasks.len()))]
    pub async fn execute(&self, tasks: Vec<TaskNode>) -> EnclaveResult<BlueprintOutcome> {
        reject_duplicates(&tasks)?;

        let total = tasks.len();
        let mut outcome = BlueprintOutcome::default();
        let mut completed: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut pending = tasks;
        let sem = Arc::new(Semaphore::new(self.max_concurrent));

        while !pending.is_empty() {
            let (ready, rest): (Vec<TaskNode>, Vec<TaskNode>) = pending
                .into_iter()
                .partition(|t| t.dependencies.iter().all(|d| completed.contains(d)));
            pending = rest;

            if ready.is_empty() {
                record_stall(&mut outcome, &pending, &failed);
                break;
            }

            outcome.waves += 1;
            debug!(wave = outcome.waves, ready = ready.len(), "starting wave");

            for (task_id, result) in self.run_wave(ready, &sem).await {
                match result {
                    Ok(value) => {
                        completed.insert(task_id.clone());
                        outcome.completed.push(task_id.clone());
                        outcome.artifacts.push(TaskArtifact {
                            task_id,
                            success: true,
                            result: Some(value),
                            error: None,
                        });
                    }
                    Err(e) => {
                        let message = format!("task {task_id} failed: {e}");
                        warn!(task_id = %task_id, error = %e, "task failed");
                        failed.insert(task_id.clone());
                        outcome.errors.push(message.clone());
                        outcome.artifacts.push(TaskArtifact {
                            task_id,
                            success: false,
                            result: None,
                            error: Some(message),
                        });
                    }
                }
            }
        }

        outcome.success = outcome.errors.is_empty();
        emit_blueprint_finished(total, outcome.completed.len(), outcome.errors.len());
        Ok(outcome)
    }

    /// Group the wave into lanes, run lanes concurrently (bounded) and tasks
    /// within a lane in order.
    async fn run_wave(&self, ready: Vec<TaskNode>, sem: &Arc<Semaphore>) -> LaneResult {
        let mut lanes: BTreeMap<String, Vec<TaskNode>> = BTreeMap::new();
        for task in ready {
            lanes.entry(self.runner.lane(&task)).or_default().push(task);
        }

        let mut lane_ids = Vec::with_capacity(lanes.len());
        let mut handles = Vec::with_capacity(lanes.len());
        for lane in lanes.into_values() {
            lane_ids.push(lane.iter().map(|t| t.id.clone()).collect::<Vec<_>>());
            let runner = Arc::clone(&self.runner);
            let sem = Arc::clone(sem);
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                let mut results = Vec::with_capacity(lane.len());
                for task in lane {
                    let result = runner.run(&task).await;
                    results.push((task.id, result));
                }
                results
            }));
        }

        let mut results = Vec::new();
        for (ids, joined) in lane_ids
            .into_iter()
            .zip(futures::future::join_all(handles).await)
        {
            match joined {
                Ok(lane_results) => results.extend(lane_results),
                Err(e) => {
                    warn!(error = %e, "lane panicked");
                    for id in ids {
                        results.push((
                            id,
                            Err(EnclaveError::InvalidBlueprint(format!("task aborted: {e}"))),
                        ));
                    }
                }
            }
        }
        results
    }
}

fn reject_duplicates(tasks: &[TaskNode]) -> EnclaveResult<()> {
    let mut seen = HashSet::new();
    for task in tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(EnclaveError::InvalidBlueprint(format!(
                "duplicate task id {}",
                task.id
            )));
        }
    }
    Ok(())
}

fn record_stall(outcome: &mut BlueprintOutcome, remaining: &[TaskNode], failed: &HashSet<String>) {
    // Transitively downstream of a failed task.
    let mut blocked: HashSet<&str> = HashSet::new();
    loop {
        let before = blocked.len();
        for task in remaining {
            if !blocked.contains(task.id.as_str())
                && task
                    .dependencies
                    .iter()
                    .any(|d| failed.contains(d) || blocked.contains(d.as_str()))
            {
                blocked.insert(task.id.as_str());
            }
        }
        if blocked.len() == before {
            break;
        }
    }

    let mut stalled = Vec::new();
    for task in remaining {
        if !blocked.contains(task.id.as_str()) {
            stalled.push(task.id.clone());
            continue;
        }
        let upstream: Vec<&str> = task
            .dependencies
            .iter()
            .filter(|d| failed.contains(*d) || blocked.contains(d.as_str()))
            .map(String::as_str)
            .collect();
        let message = format!(
            "task {} skipped: dependency {} did not complete",
            task.id,
            upstream.join(", ")
        );
        outcome.errors.push(message.clone());
        outcome.artifacts.push(TaskArtifact {
            task_id: task.id.clone(),
            success: false,
            result: None,
            error: Some(message),
        });
    }

    if stalled.is_empty() {
        return;
    }
    let message = EnclaveError::CircularDependency {
        tasks: stalled.clone(),
    }
    .to_string();
    warn!(tasks = ?stalled, "blueprint stalled");
    outcome.errors.push(message.clone());
    for task_id in stalled {
        outcome.artifacts.push(TaskArtifact {
            task_id,
            success: false,
            result: None,
            error: Some(message.clone()),
        });
    }
}
