//! Background task state machine driver.
//!
//! One loop per control plane. Each tick enumerates clusters and their
//! unsettled tasks and advances PROVISIONING -> PENDING -> RUNNING ->
//! STOPPED. When a pod source is attached (non-test mode), observed pod
//! state takes precedence; the time-driven path is the fallback.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kecs_storage::Database;
use kecs_types::task::{Task, status, stop_code};
use kecs_types::{Error, Result};
use tokio_util::sync::CancellationToken;

use crate::hub::Hub;

/// Observed state of a task's backing pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodState {
    Pending,
    Running,
    Succeeded { exit_code: i64 },
    Failed { exit_code: i64 },
    Missing,
}

#[async_trait]
pub trait PodStatusSource: Send + Sync {
    async fn pod_state(&self, namespace: &str, name: &str) -> anyhow::Result<PodState>;
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    pub test_mode: bool,
}

impl ReconcilerConfig {
    fn tick(&self) -> Duration {
        if self.test_mode {
            Duration::from_millis(100)
        } else {
            Duration::from_secs(1)
        }
    }

    /// PROVISIONING -> PENDING threshold, measured from creation.
    fn t_provision(&self) -> i64 {
        if self.test_mode { 50 } else { 5_000 }
    }

    /// PENDING -> RUNNING threshold, measured from creation.
    fn t_pending(&self) -> i64 {
        if self.test_mode { 100 } else { 10_000 }
    }

    /// RUNNING tasks older than this auto-stop (the short-lived container
    /// fallback when no pod state is observable).
    fn t_short_lived(&self) -> i64 {
        if self.test_mode { 2_000 } else { 300_000 }
    }
}

/// Task-log retention applied opportunistically from the loop.
const LOG_RETENTION_MS: i64 = 7 * 24 * 60 * 60 * 1000;
const LOG_SWEEP_EVERY_TICKS: u64 = 600;

pub struct Reconciler {
    db: Database,
    hub: Hub,
    config: ReconcilerConfig,
    pods: Option<Arc<dyn PodStatusSource>>,
    stop: CancellationToken,
}

impl Reconciler {
    pub fn new(db: Database, hub: Hub, config: ReconcilerConfig) -> Self {
        Self {
            db,
            hub,
            config,
            pods: None,
            stop: CancellationToken::new(),
        }
    }

    pub fn with_pod_source(mut self, pods: Arc<dyn PodStatusSource>) -> Self {
        self.pods = Some(pods);
        self
    }

    /// Handle for shutting the loop down from outside.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// The loop. Exits on [`stop`] or the caller's cancellation token.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(test_mode = self.config.test_mode, "task reconciler started");
        let mut ticks: u64 = 0;
        loop {
            let sleep = if self.config.test_mode {
                self.config.tick()
            } else {
                // Jitter the real tick so co-located instances do not beat
                // in lockstep.
                self.config.tick() + Duration::from_millis(rand::random_range(0..250))
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
            if let Err(e) = self.tick_once().await {
                tracing::warn!(error = %e, "reconciler tick failed");
            }
            ticks += 1;
            if ticks % LOG_SWEEP_EVERY_TICKS == 0 {
                let cutoff = kecs_common::now_ms() - LOG_RETENTION_MS;
                match self.db.task_logs().delete_old_logs(cutoff).await {
                    Ok(0) => {}
                    Ok(deleted) => tracing::info!(deleted, "task log retention sweep"),
                    Err(e) => tracing::warn!(error = %e, "task log retention sweep failed"),
                }
            }
        }
        tracing::info!("task reconciler stopped");
    }

    /// One reconciliation pass over every cluster's unsettled tasks.
    pub async fn tick_once(&self) -> Result<()> {
        let clusters = self.db.clusters();
        let tasks = self.db.tasks();
        let mut token = None;
        loop {
            let (page, next) = clusters.list(Some(100), token).await?;
            for cluster in &page {
                for task in tasks.list_unsettled(&cluster.arn).await? {
                    self.advance(task).await;
                }
                // Converge the denormalized counters toward the children.
                if let Err(e) = clusters.refresh_counts(&cluster.arn).await {
                    tracing::debug!(cluster = %cluster.name, error = %e, "count refresh failed");
                }
            }
            match next {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        Ok(())
    }

    /// Advance one task. A CAS miss means someone else won this round;
    /// the next tick re-reads.
    async fn advance(&self, mut task: Task) {
        let now = kecs_common::now_ms();
        let age = now - task.created_at;

        // Observed pod state outranks timers.
        if let Some(change) = self.pod_override(&task).await {
            match change {
                PodState::Failed { exit_code } | PodState::Succeeded { exit_code } => {
                    stop_task(&mut task, stop_code::ESSENTIAL_CONTAINER_EXITED, exit_code, now);
                    self.commit(task).await;
                    return;
                }
                PodState::Missing => {
                    stop_task(&mut task, stop_code::ESSENTIAL_CONTAINER_EXITED, 0, now);
                    self.commit(task).await;
                    return;
                }
                PodState::Running | PodState::Pending => {}
            }
        }

        match task.last_status.as_str() {
            status::PROVISIONING if age >= self.config.t_provision() => {
                task.last_status = status::PENDING.to_string();
                self.commit(task).await;
            }
            status::PENDING if age >= self.config.t_pending() => {
                task.last_status = status::RUNNING.to_string();
                task.started_at = Some(now);
                task.pull_started_at = Some(now);
                task.pull_stopped_at = Some(now);
                for container in &mut task.containers {
                    container.last_status = status::RUNNING.to_string();
                }
                self.commit(task).await;
            }
            status::RUNNING if task.desired_status == status::STOPPED => {
                stop_task(&mut task, stop_code::USER_INITIATED, 0, now);
                self.commit(task).await;
            }
            status::RUNNING => {
                let running_for = task.started_at.map(|s| now - s).unwrap_or(0);
                if running_for >= self.config.t_short_lived() {
                    stop_task(&mut task, stop_code::ESSENTIAL_CONTAINER_EXITED, 0, now);
                    self.commit(task).await;
                }
            }
            _ => {}
        }
    }

    async fn pod_override(&self, task: &Task) -> Option<PodState> {
        let pods = self.pods.as_ref()?;
        let (namespace, name) = (task.namespace.as_deref()?, task.pod_name.as_deref()?);
        // Only terminal observations force transitions; a pod that has not
        // landed yet is indistinguishable from one still scheduling.
        if task.last_status != status::RUNNING {
            return None;
        }
        match pods.pod_state(namespace, name).await {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::debug!(task = %task.arn, error = %e, "pod state lookup failed");
                None
            }
        }
    }

    async fn commit(&self, task: Task) {
        let from_version = task.version;
        match self.db.tasks().update(task).await {
            Ok(updated) => {
                tracing::info!(
                    task = %updated.arn,
                    status = %updated.last_status,
                    version = updated.version,
                    "task transition"
                );
                self.hub.task_update(
                    &updated.id,
                    serde_json::json!({
                        "taskArn": updated.arn,
                        "lastStatus": updated.last_status,
                        "desiredStatus": updated.desired_status,
                        "stopCode": updated.stop_code,
                        "version": updated.version,
                    }),
                );
            }
            Err(Error::Conflict(_)) => {
                tracing::debug!(version = from_version, "task transition lost CAS race");
            }
            Err(e) => tracing::warn!(error = %e, "task update failed"),
        }
    }
}

fn stop_task(task: &mut Task, code: &str, exit_code: i64, now: i64) {
    task.last_status = status::STOPPED.to_string();
    task.desired_status = status::STOPPED.to_string();
    task.stopped_at = Some(now);
    task.execution_stopped_at = Some(now);
    task.stop_code = Some(code.to_string());
    if task.started_at.is_none() {
        task.started_at = Some(now);
    }
    for container in &mut task.containers {
        container.last_status = status::STOPPED.to_string();
        container.exit_code = Some(exit_code);
    }
}
