//! Hunt execution: ordered steps against a session's SSH channel.
//!
//! Each hunt runs as a background task. Step failures are recorded in the
//! observation and the hunt proceeds; only channel death, explicit cancel,
//! or session termination are fatal.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use log::{info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::ai::AiPipeline;
use crate::assets::Asset;
use crate::events::{EventBus, EventKind};
use crate::intelligence::TimelineRecorder;
use crate::security::SudoPolicy;
use crate::ssh::{ExecOutcome, ExecRequest, ExitStatus, SshError};

use super::loader::ModuleRegistry;
use super::models::{HuntModule, HuntRecord, HuntStatus, Observation};
use super::repository::HuntRepository;

/// Per-observation output cap (bytes per stream).
const OBSERVATION_CAPTURE_CAP: usize = 256 * 1024;

/// Executes one step's command on a session. The session handle implements
/// this against the live SSH channel; tests substitute a fake.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, request: ExecRequest, analyst: &str) -> Result<ExecOutcome, SshError>;
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("hunt module '{0}' not found")]
    ModuleNotFound(String),
    #[error("module '{module}' does not support os '{os}'")]
    IncompatibleOs { module: String, os: String },
    #[error("session {0} already has a hunt in flight")]
    Busy(String),
    #[error("hunt {0} not found")]
    HuntNotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

struct ActiveHunt {
    session_id: String,
    cancel: watch::Sender<bool>,
}

/// Schedules and runs hunts.
pub struct HuntScheduler {
    bus: Arc<EventBus>,
    hunts: HuntRepository,
    timeline: TimelineRecorder,
    modules: Arc<ModuleRegistry>,
    pipeline: Option<Arc<AiPipeline>>,
    active: DashMap<String, ActiveHunt>,
    admission: Mutex<()>,
    per_session_cap: usize,
}

impl HuntScheduler {
    pub fn new(
        bus: Arc<EventBus>,
        hunts: HuntRepository,
        timeline: TimelineRecorder,
        modules: Arc<ModuleRegistry>,
        pipeline: Option<Arc<AiPipeline>>,
        per_session_cap: usize,
    ) -> Self {
        Self {
            bus,
            hunts,
            timeline,
            modules,
            pipeline,
            active: DashMap::new(),
            admission: Mutex::new(()),
            per_session_cap: per_session_cap.max(1),
        }
    }

    /// Start a hunt. Fails fast on unknown module, OS mismatch, or the
    /// per-session concurrency cap; nothing is emitted in those cases.
    pub async fn start(
        self: &Arc<Self>,
        executor: Arc<dyn StepExecutor>,
        session_id: &str,
        asset: Asset,
        module_id: &str,
        run_ai: bool,
        analyst: &str,
    ) -> Result<HuntRecord, SchedulerError> {
        let module = self
            .modules
            .get(module_id)
            .ok_or_else(|| SchedulerError::ModuleNotFound(module_id.to_string()))?;

        if !module.supports_os(asset.os_type) {
            return Err(SchedulerError::IncompatibleOs {
                module: module_id.to_string(),
                os: asset.os_type.to_string(),
            });
        }

        let hunt_id = Uuid::new_v4().to_string();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        {
            let _admission = self.admission.lock().expect("admission lock poisoned");
            let in_flight = self
                .active
                .iter()
                .filter(|entry| entry.value().session_id == session_id)
                .count();
            if in_flight >= self.per_session_cap {
                return Err(SchedulerError::Busy(session_id.to_string()));
            }
            self.active.insert(
                hunt_id.clone(),
                ActiveHunt {
                    session_id: session_id.to_string(),
                    cancel: cancel_tx,
                },
            );
        }

        let record = HuntRecord {
            id: hunt_id.clone(),
            session_id: session_id.to_string(),
            asset_id: asset.id.clone(),
            module_id: module_id.to_string(),
            run_ai,
            status: HuntStatus::Pending,
            started_at: Utc::now().to_rfc3339(),
            ended_at: None,
            findings_count: 0,
            error: None,
            ai_report_text: None,
        };
        if let Err(err) = self.hunts.create(&record).await {
            self.active.remove(&hunt_id);
            return Err(SchedulerError::Internal(err));
        }

        let scheduler = self.clone();
        let task_record = record.clone();
        let analyst = analyst.to_string();
        tokio::spawn(async move {
            scheduler
                .run_hunt(task_record, module, asset, executor, cancel_rx, &analyst)
                .await;
        });

        Ok(record)
    }

    /// Cancel an in-flight hunt: the current exec is interrupted, remaining
    /// steps are skipped.
    pub fn cancel(&self, hunt_id: &str) -> Result<(), SchedulerError> {
        match self.active.get(hunt_id) {
            Some(entry) => {
                let _ = entry.value().cancel.send(true);
                Ok(())
            }
            None => Err(SchedulerError::HuntNotFound(hunt_id.to_string())),
        }
    }

    /// Cancel every in-flight hunt (shutdown path).
    pub fn cancel_all(&self) {
        for entry in self.active.iter() {
            let _ = entry.value().cancel.send(true);
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    async fn run_hunt(
        self: Arc<Self>,
        record: HuntRecord,
        module: HuntModule,
        asset: Asset,
        executor: Arc<dyn StepExecutor>,
        cancel: watch::Receiver<bool>,
        analyst: &str,
    ) {
        let hunt_id = record.id.clone();
        let session_id = record.session_id.clone();

        self.bus.publish(EventKind::HuntStarted {
            session_id: session_id.clone(),
            hunt_id: hunt_id.clone(),
            module_id: module.id.clone(),
        });
        self.record_timeline(
            &asset.id,
            "hunt.started",
            analyst,
            serde_json::json!({
                "hunt_id": hunt_id,
                "module_id": module.id,
                "module_name": module.name,
            }),
            &session_id,
        )
        .await;

        if let Err(err) = self.hunts.update_status(&hunt_id, HuntStatus::Running).await {
            warn!("failed to mark hunt {hunt_id} running: {err}");
        }

        // Sudo password is resolved once and reused for every step.
        let policy = SudoPolicy::new(asset.sudo());
        let sudo_password = asset.sudo_password_for_policy();

        let mut observations: Vec<Observation> = Vec::new();
        let mut fatal: Option<String> = None;
        let mut cancelled = false;

        for step in &module.steps {
            if *cancel.borrow() {
                cancelled = true;
                break;
            }

            self.bus.publish(EventKind::HuntStepStarted {
                session_id: session_id.clone(),
                hunt_id: hunt_id.clone(),
                step_id: step.id.clone(),
                description: step.description.clone(),
            });

            // A sudo step on an asset without a sudo policy is recorded and
            // skipped, never executed.
            if step.requires_sudo && policy.method.is_none() {
                let observation = Observation {
                    hunt_id: hunt_id.clone(),
                    step_id: step.id.clone(),
                    command: step.command.clone(),
                    stdout: String::new(),
                    stderr: String::new(),
                    exit: ExitStatus::Skipped("no_sudo".to_string()),
                    wall_ms: 0,
                    truncated: false,
                };
                self.emit_observation(&session_id, &hunt_id, &step.id, &observation);
                observations.push(observation);
                continue;
            }

            let command = policy.wrap_command(&step.command, step.requires_sudo);
            let stdin = (step.requires_sudo && policy.needs_password())
                .then(|| sudo_password.clone().map(|pw| format!("{pw}\n")))
                .flatten();
            let piped_sudo = stdin.is_some();

            let request = ExecRequest {
                command: command.clone(),
                timeout: Duration::from_secs(step.timeout),
                stdin,
                // Module steps are curated content started deliberately by
                // an analyst; the SUSPECT gate applies to ad-hoc commands.
                allow_suspect: true,
                max_capture: OBSERVATION_CAPTURE_CAP,
                cancel: Some(cancel.clone()),
            };

            let observation = match executor.execute(request, analyst).await {
                Ok(outcome) => {
                    // The sudo prompt would otherwise pollute every
                    // elevated observation's stderr.
                    let stderr = if piped_sudo {
                        crate::security::classifier::strip_sudo_prompt(&outcome.stderr)
                    } else {
                        outcome.stderr
                    };
                    Observation {
                        hunt_id: hunt_id.clone(),
                        step_id: step.id.clone(),
                        command,
                        stdout: outcome.stdout,
                        stderr,
                        exit: outcome.exit,
                        wall_ms: outcome.duration_ms,
                        truncated: outcome.stdout_truncated || outcome.stderr_truncated,
                    }
                }
                Err(SshError::Cancelled) => {
                    let observation = Observation {
                        hunt_id: hunt_id.clone(),
                        step_id: step.id.clone(),
                        command,
                        stdout: String::new(),
                        stderr: "cancelled".to_string(),
                        exit: ExitStatus::Signal("cancelled".to_string()),
                        wall_ms: 0,
                        truncated: false,
                    };
                    self.emit_observation(&session_id, &hunt_id, &step.id, &observation);
                    observations.push(observation);
                    cancelled = true;
                    break;
                }
                Err(err) if err.is_fatal_to_client() => {
                    fatal = Some(err.to_string());
                    break;
                }
                Err(err) => {
                    // Non-fatal: record the failure, keep hunting.
                    warn!("step {} failed in hunt {hunt_id}: {err}", step.id);
                    Observation {
                        hunt_id: hunt_id.clone(),
                        step_id: step.id.clone(),
                        command,
                        stdout: String::new(),
                        stderr: err.to_string(),
                        exit: ExitStatus::Code(-1),
                        wall_ms: 0,
                        truncated: false,
                    }
                }
            };

            self.emit_observation(&session_id, &hunt_id, &step.id, &observation);
            observations.push(observation);
        }

        if cancelled {
            if let Err(err) = self
                .hunts
                .finish(&hunt_id, HuntStatus::Cancelled, 0, &observations, None)
                .await
            {
                warn!("failed to finish cancelled hunt {hunt_id}: {err}");
            }
            self.bus.publish(EventKind::HuntCancelled {
                session_id: session_id.clone(),
                hunt_id: hunt_id.clone(),
            });
            self.active.remove(&hunt_id);
            info!("hunt {hunt_id} cancelled");
            return;
        }

        if let Some(error) = fatal {
            if let Err(err) = self
                .hunts
                .finish(&hunt_id, HuntStatus::Failed, 0, &observations, Some(&error))
                .await
            {
                warn!("failed to finish failed hunt {hunt_id}: {err}");
            }
            self.bus.publish(EventKind::HuntFailed {
                session_id: session_id.clone(),
                hunt_id: hunt_id.clone(),
                error: error.clone(),
            });
            self.record_timeline(
                &asset.id,
                "hunt.failed",
                analyst,
                serde_json::json!({"hunt_id": hunt_id, "module_id": module.id, "error": error}),
                &session_id,
            )
            .await;
            self.active.remove(&hunt_id);
            return;
        }

        let mut findings_count: u32 = 0;
        let mut status = HuntStatus::Completed;
        let mut hunt_error: Option<String> = None;

        if record.run_ai {
            if let Some(pipeline) = &self.pipeline {
                let outcome = pipeline
                    .analyze(
                        &session_id,
                        &hunt_id,
                        &asset.id,
                        analyst,
                        &module,
                        &observations,
                    )
                    .await;
                findings_count = outcome.findings_count;
                if let Some(error) = outcome.error {
                    // A failed stream keeps the hunt COMPLETED only when
                    // every step itself succeeded.
                    let all_steps_ok = observations.iter().all(|o| o.exit.is_success());
                    if !all_steps_ok {
                        status = HuntStatus::Failed;
                    }
                    hunt_error = Some(error);
                }
            } else {
                warn!("hunt {hunt_id} requested AI analysis but no driver is configured");
            }
        }

        if let Err(err) = self
            .hunts
            .finish(
                &hunt_id,
                status,
                findings_count as i64,
                &observations,
                hunt_error.as_deref(),
            )
            .await
        {
            warn!("failed to finish hunt {hunt_id}: {err}");
        }

        match status {
            HuntStatus::Failed => {
                self.bus.publish(EventKind::HuntFailed {
                    session_id: session_id.clone(),
                    hunt_id: hunt_id.clone(),
                    error: hunt_error.clone().unwrap_or_default(),
                });
            }
            _ => {
                self.bus.publish(EventKind::HuntCompleted {
                    session_id: session_id.clone(),
                    hunt_id: hunt_id.clone(),
                    findings_count,
                });
            }
        }
        self.record_timeline(
            &asset.id,
            if status == HuntStatus::Failed {
                "hunt.failed"
            } else {
                "hunt.completed"
            },
            analyst,
            serde_json::json!({
                "hunt_id": hunt_id,
                "module_id": module.id,
                "findings_count": findings_count,
            }),
            &session_id,
        )
        .await;

        self.active.remove(&hunt_id);
        info!("hunt {hunt_id} finished: status={status} findings={findings_count}");
    }

    fn emit_observation(
        &self,
        session_id: &str,
        hunt_id: &str,
        step_id: &str,
        observation: &Observation,
    ) {
        let data = serde_json::to_value(observation).unwrap_or_default();
        self.bus.publish(EventKind::HuntObservation {
            session_id: session_id.to_string(),
            hunt_id: hunt_id.to_string(),
            observation_id: Uuid::new_v4().to_string(),
            data,
        });
        self.bus.publish(EventKind::HuntStepCompleted {
            session_id: session_id.to_string(),
            hunt_id: hunt_id.to_string(),
            step_id: step_id.to_string(),
        });
    }

    async fn record_timeline(
        &self,
        asset_id: &str,
        event_type: &str,
        analyst: &str,
        payload: serde_json::Value,
        session_id: &str,
    ) {
        if let Err(err) = self
            .timeline
            .record(asset_id, event_type, analyst, payload, Some(session_id))
            .await
        {
            warn!("timeline record failed for {event_type}: {err}");
        }
    }
}
