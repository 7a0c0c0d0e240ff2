use crate::hub::Hub;
use crate::normalizer::Normalizer;
use chrono::{DateTime, Utc};
use lab_core::RunStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, RwLock};
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub cmd: Vec<String>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub dropped_lines: u64,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("run command is empty")]
    EmptyCommand,
}

struct RunEntry {
    info: RunInfo,
    kill: Option<oneshot::Sender<()>>,
}

/// Owned registry of runs (explicit register/deregister, no ambient
/// globals). One supervisor task per run; tasks share nothing but the
/// hub handle they publish into.
pub struct RunRegistry {
    hub: Arc<Hub>,
    counter: AtomicU64,
    runs: RwLock<HashMap<String, RunEntry>>,
}

impl RunRegistry {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self {
            hub,
            counter: AtomicU64::new(0),
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Spawns one external process and wires its stdout into the
    /// normalizer. A spawn failure surfaces as `status: failed` on the
    /// run, which stays listed for diagnostics; it never takes the
    /// host down.
    pub async fn start(self: &Arc<Self>, config: RunConfig) -> Result<String, StartError> {
        if config.cmd.is_empty() {
            return Err(StartError::EmptyCommand);
        }
        let id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let run_id = format!("run-{id}");
        let mut normalizer = Normalizer::new(&run_id);

        let mut entry = RunEntry {
            info: RunInfo {
                id: run_id.clone(),
                label: config.label.clone(),
                status: RunStatus::Pending,
                started_at: Utc::now(),
                ended_at: None,
                failure: None,
                dropped_lines: 0,
            },
            kill: None,
        };
        self.hub
            .publish(normalizer.status_event(RunStatus::Pending, None))
            .await;

        let mut command = Command::new(&config.cmd[0]);
        command
            .args(&config.cmd[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let reason = format!("spawn failed: {err}");
                warn!(event = "spawn_failed", run_id = %run_id, error = %err);
                self.hub
                    .publish(normalizer.status_event(RunStatus::Failed, Some(reason.clone())))
                    .await;
                entry.info.status = RunStatus::Failed;
                entry.info.ended_at = Some(Utc::now());
                entry.info.failure = Some(reason);
                self.runs.write().await.insert(run_id.clone(), entry);
                return Ok(run_id);
            }
        };

        self.hub
            .publish(normalizer.status_event(RunStatus::Running, None))
            .await;
        entry.info.status = RunStatus::Running;

        let (kill_tx, kill_rx) = oneshot::channel();
        entry.kill = Some(kill_tx);
        self.runs.write().await.insert(run_id.clone(), entry);
        info!(event = "run_started", run_id = %run_id, cmd = %config.cmd[0]);

        let registry = self.clone();
        let task_run_id = run_id.clone();
        tokio::spawn(async move {
            registry
                .supervise(task_run_id, child, normalizer, kill_rx)
                .await;
        });
        Ok(run_id)
    }

    /// Requests termination. Idempotent: stopping an unknown or
    /// already-stopped run is a no-op.
    pub async fn stop(&self, run_id: &str) -> bool {
        let mut runs = self.runs.write().await;
        match runs.get_mut(run_id) {
            Some(entry) => {
                if let Some(kill) = entry.kill.take() {
                    let _ = kill.send(());
                    info!(event = "run_stop_requested", run_id = %run_id);
                }
                true
            }
            None => false,
        }
    }

    pub async fn list(&self) -> Vec<RunInfo> {
        let runs = self.runs.read().await;
        let mut infos: Vec<_> = runs.values().map(|entry| entry.info.clone()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn get(&self, run_id: &str) -> Option<RunInfo> {
        self.runs
            .read()
            .await
            .get(run_id)
            .map(|entry| entry.info.clone())
    }

    async fn supervise(
        self: Arc<Self>,
        run_id: String,
        mut child: tokio::process::Child,
        mut normalizer: Normalizer,
        mut kill_rx: oneshot::Receiver<()>,
    ) {
        let stderr_task = child.stderr.take().map(|stderr| {
            let run_id = run_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut count = 0u64;
                while let Ok(Some(line)) = lines.next_line().await {
                    count += 1;
                    warn!(event = "run_stderr", run_id = %run_id, line = %line);
                }
                count
            })
        });

        let mut stopped = false;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = &mut kill_rx, if !stopped => {
                        stopped = true;
                        let _ = child.start_kill();
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if let Some(event) = normalizer.normalize(&line) {
                                self.hub.publish(event).await;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(event = "run_read_error", run_id = %run_id, error = %err);
                            break;
                        }
                    }
                }
            }
        }

        let (status, failure) = match child.wait().await {
            Ok(exit) if exit.success() => (RunStatus::Completed, None),
            Ok(exit) => {
                let reason = if stopped {
                    "stopped by request".to_string()
                } else {
                    match exit.code() {
                        Some(code) => format!("exit code {code}"),
                        None => "terminated by signal".to_string(),
                    }
                };
                (RunStatus::Failed, Some(reason))
            }
            Err(err) => (RunStatus::Failed, Some(format!("wait failed: {err}"))),
        };

        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let dropped = normalizer.dropped();
        self.hub
            .publish(normalizer.status_event(status, failure.clone()))
            .await;
        info!(
            event = "run_ended",
            run_id = %run_id,
            status = %status,
            dropped_lines = dropped
        );

        let mut runs = self.runs.write().await;
        if let Some(entry) = runs.get_mut(&run_id) {
            entry.info.status = status;
            entry.info.ended_at = Some(Utc::now());
            entry.info.failure = failure;
            entry.info.dropped_lines = dropped;
            entry.kill = None;
        }
    }
}
