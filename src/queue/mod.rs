//! The queue coordinator: a durable FIFO of build requests over the executor.
//!
//! All orchestration runs on one tokio task that owns the [`BuildExecutor`]
//! and drains a single inbox. Callers, log sinks and finished attempts all
//! talk to it by message, so the busy flag and the persisted queue are only
//! ever touched from that one loop and need no lock.
//!
//! # Usage
//!
//! ```ignore
//! let coordinator = QueueCoordinator::spawn(store, Arc::new(TokioProcessRunner::new()));
//! let mut events = coordinator.subscribe();
//! let build_id = coordinator.enqueue_build("project-id").await?;
//! while let Some(event) = events.recv().await {
//!     if let BuildEvent::Completed { .. } = event { break; }
//! }
//! coordinator.shutdown().await;
//! ```

pub mod events;

pub use events::{BuildEvent, EventBus, EventReceiver};

use crate::config::{ConfigError, ConfigStore};
use crate::models::{AppConfig, BuildRecord, BuildStatus, ValidationError};
use crate::services::executor::{AttemptFailure, AttemptOutcome, BuildExecutor};
use crate::services::invocation::BuildPlan;
use crate::services::process::{LogSink, ProcessRunner};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Marker appended to records that were still `building` when the tool last exited
pub const INTERRUPTED_MARKER: &str = "[BUILD INTERRUPTED]";

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to persist build queue: {0}")]
    Persistence(#[from] ConfigError),

    #[error("Build coordinator has stopped")]
    Stopped,
}

/// Why a queued record could not be turned into a [`BuildPlan`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("Project {0} not found")]
    ProjectNotFound(String),

    #[error("Engine {engine} used by project {project} not found")]
    EngineNotFound { engine: String, project: String },

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Resolve a queued record against the current document.
///
/// An explicit profile on the record wins over the project's default profile.
pub fn resolve_build(
    config: &AppConfig,
    record: &BuildRecord,
) -> Result<BuildPlan, ResolutionError> {
    let project = config
        .project(&record.project_id)
        .ok_or_else(|| ResolutionError::ProjectNotFound(record.project_id.clone()))?;

    let engine = config
        .engine(&project.engine_id)
        .ok_or_else(|| ResolutionError::EngineNotFound {
            engine: project.engine_id.clone(),
            project: project.name.clone(),
        })?;

    let profile = match record.profile_id.as_ref().or(project.default_profile_id.as_ref()) {
        Some(id) => Some(
            config
                .profile(id)
                .ok_or_else(|| ValidationError::UnknownProfile(id.clone()))?,
        ),
        None => None,
    };

    Ok(BuildPlan::resolve(&record.id, project, engine, profile)?)
}

/// Fail every record left in `building` by a previous run.
///
/// Analytics are not touched since the attempt never reported an outcome.
/// Returns the number of records changed.
pub fn recover_interrupted(config: &mut AppConfig) -> usize {
    let now = Utc::now();
    let mut recovered = 0;
    for record in config
        .build_history
        .iter_mut()
        .filter(|r| r.status == BuildStatus::Building)
    {
        let mut log = std::mem::take(&mut record.log);
        log.push_str(&format!(
            "\n{} The tool exited before this build finished\n",
            INTERRUPTED_MARKER
        ));
        match record.mark_finished(false, now, log) {
            Ok(()) => recovered += 1,
            Err(e) => tracing::error!("Failed to recover build {}: {}", record.id, e),
        }
    }
    recovered
}

enum Command {
    Enqueue {
        project_id: String,
        profile_id: Option<String>,
        reply: oneshot::Sender<Result<String, QueueError>>,
    },
    Cancel {
        reply: oneshot::Sender<bool>,
    },
    Log {
        build_id: String,
        chunk: String,
    },
    Finished {
        build_id: String,
        outcome: AttemptOutcome,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Log text gathered for the active build, written onto its record at the end
struct BuildLog {
    build_id: String,
    text: String,
}

/// Owns the executor and the control loop
pub struct QueueCoordinator {
    store: ConfigStore,
    executor: BuildExecutor,
    events: EventBus,
    inbox: mpsc::WeakUnboundedSender<Command>,
    active_log: Option<BuildLog>,
    shutdown_reply: Option<oneshot::Sender<()>>,
}

impl QueueCoordinator {
    /// Start the control loop on the current tokio runtime.
    ///
    /// Records left `building` by an earlier run are failed, then any
    /// records still `queued` start draining immediately.
    pub fn spawn(store: ConfigStore, runner: Arc<dyn ProcessRunner>) -> CoordinatorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = EventBus::new();

        let coordinator = QueueCoordinator {
            store,
            executor: BuildExecutor::new(runner),
            events: events.clone(),
            inbox: tx.downgrade(),
            active_log: None,
            shutdown_reply: None,
        };
        tokio::spawn(coordinator.run(rx));

        CoordinatorHandle { tx, events }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        self.recover();
        self.advance_queue();

        while let Some(command) = rx.recv().await {
            match command {
                Command::Enqueue {
                    project_id,
                    profile_id,
                    reply,
                } => {
                    let result = self.enqueue(project_id, profile_id);
                    let accepted = result.is_ok();
                    let _ = reply.send(result);
                    if accepted {
                        self.advance_queue();
                    }
                }
                Command::Cancel { reply } => {
                    let cancelled = self.executor.cancel();
                    if let Some(build_id) = &cancelled {
                        tracing::info!("Cancel requested for build {}", build_id);
                    }
                    let _ = reply.send(cancelled.is_some());
                }
                Command::Log { build_id, chunk } => self.on_log(build_id, chunk),
                Command::Finished { build_id, outcome } => {
                    self.on_finished(&build_id, outcome);
                    if self.shutdown_reply.is_some() {
                        break;
                    }
                    self.advance_queue();
                }
                Command::Shutdown { reply } => {
                    self.shutdown_reply = Some(reply);
                    if self.executor.cancel().is_none() {
                        break;
                    }
                    tracing::info!("Waiting for the active build to stop before shutting down");
                }
            }
        }

        if let Some(reply) = self.shutdown_reply.take() {
            let _ = reply.send(());
        }
        tracing::debug!("Build coordinator stopped");
    }

    fn emit(&self, event: BuildEvent) {
        self.events.publish(event);
    }

    fn persist(&self, config: &mut AppConfig) -> bool {
        match self.store.save(config) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to save build state: {}", e);
                false
            }
        }
    }

    fn recover(&self) {
        let mut config = self.store.load();
        let recovered = recover_interrupted(&mut config);
        if recovered > 0 {
            tracing::warn!("Marked {} interrupted build(s) as failed", recovered);
            self.persist(&mut config);
        }
    }

    fn enqueue(
        &mut self,
        project_id: String,
        profile_id: Option<String>,
    ) -> Result<String, QueueError> {
        let record = BuildRecord::queued(project_id, profile_id);
        let build_id = record.id.clone();
        tracing::info!("Queued build {} for project {}", build_id, record.project_id);
        self.store.update(|config| config.build_history.push(record))?;
        Ok(build_id)
    }

    /// Start the oldest queued record if the executor is free.
    ///
    /// A record that fails to resolve is failed on the spot and the queue is
    /// not advanced past it; the next enqueue or completion does that.
    fn advance_queue(&mut self) {
        if self.executor.is_busy() || self.shutdown_reply.is_some() {
            return;
        }

        let mut config = self.store.load();
        let Some(index) = config
            .build_history
            .iter()
            .position(|r| r.status == BuildStatus::Queued)
        else {
            return;
        };

        let build_id = config.build_history[index].id.clone();
        let plan = match resolve_build(&config, &config.build_history[index]) {
            Ok(plan) => plan,
            Err(e) => {
                self.fail_unresolvable(&mut config, index, &e.to_string());
                return;
            }
        };

        let record = &mut config.build_history[index];
        if let Err(e) = record.mark_building(Utc::now(), plan.platforms.clone()) {
            tracing::error!("{}", e);
            return;
        }
        if !self.persist(&mut config) {
            return;
        }

        let Some(inbox) = self.inbox.upgrade() else {
            return;
        };

        self.active_log = Some(BuildLog {
            build_id: build_id.clone(),
            text: String::new(),
        });
        self.emit(BuildEvent::Started {
            build_id: build_id.clone(),
        });

        let sink = {
            let inbox = inbox.clone();
            let build_id = build_id.clone();
            LogSink::new(move |chunk| {
                let _ = inbox.send(Command::Log {
                    build_id: build_id.clone(),
                    chunk: chunk.to_string(),
                });
            })
        };

        let attempt = match self.executor.start(plan, sink) {
            Ok(attempt) => attempt,
            Err(e) => {
                tracing::error!("Executor refused build {}: {}", build_id, e);
                return;
            }
        };

        tokio::spawn(async move {
            let outcome = match tokio::spawn(attempt).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("Build task {} failed: {}", build_id, e);
                    AttemptOutcome::Failed(AttemptFailure::Launch(e.to_string()))
                }
            };
            let _ = inbox.send(Command::Finished { build_id, outcome });
        });
    }

    fn fail_unresolvable(&mut self, config: &mut AppConfig, index: usize, reason: &str) {
        let record = &mut config.build_history[index];
        tracing::warn!("Build {} cannot be resolved: {}", record.id, reason);
        if let Err(e) = record.mark_unresolvable(Utc::now(), reason) {
            tracing::error!("{}", e);
            return;
        }
        let build_id = record.id.clone();
        let log = record.log.clone();
        self.persist(config);

        self.emit(BuildEvent::Log {
            build_id: build_id.clone(),
            chunk: log,
        });
        self.emit(BuildEvent::Completed {
            build_id,
            success: false,
        });
    }

    fn on_log(&mut self, build_id: String, chunk: String) {
        match &mut self.active_log {
            Some(log) if log.build_id == build_id => log.text.push_str(&chunk),
            _ => return,
        }
        tracing::debug!(target: "build_output", "{}", chunk.trim_end());
        self.emit(BuildEvent::Log { build_id, chunk });
    }

    fn on_finished(&mut self, build_id: &str, outcome: AttemptOutcome) {
        if !self.executor.complete(build_id) {
            tracing::warn!("Completion for build {} which is not the active build", build_id);
        }
        let log = match self.active_log.take() {
            Some(log) if log.build_id == build_id => log.text,
            other => {
                self.active_log = other;
                String::new()
            }
        };

        let success = outcome.is_success();
        let mut config = self.store.load();
        let Some(record) = config.build_mut(build_id) else {
            tracing::warn!("Build {} disappeared from history before it finished", build_id);
            self.emit(BuildEvent::Completed {
                build_id: build_id.to_string(),
                success,
            });
            return;
        };
        if let Err(e) = record.mark_finished(success, Utc::now(), log) {
            tracing::error!("{}", e);
            self.emit(BuildEvent::Completed {
                build_id: build_id.to_string(),
                success,
            });
            return;
        }

        let duration = record.duration().unwrap_or_default();
        let platforms = record.platforms.clone().unwrap_or_default();
        config.analytics.record_build(duration, success, &platforms);
        tracing::info!(
            "Build {} {} in {:.1}s",
            build_id,
            if success { "succeeded" } else { "failed" },
            duration.as_secs_f64()
        );
        self.persist(&mut config);

        self.emit(BuildEvent::Completed {
            build_id: build_id.to_string(),
            success,
        });
    }
}

/// Cheap, cloneable front door to a running [`QueueCoordinator`]
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Command>,
    events: EventBus,
}

impl CoordinatorHandle {
    /// Queue a build of `project_id` and return the new record's id
    pub async fn enqueue_build(
        &self,
        project_id: impl Into<String>,
    ) -> Result<String, QueueError> {
        self.enqueue(project_id.into(), None).await
    }

    /// Queue a build with an explicit profile, overriding the project default
    pub async fn enqueue_build_with_profile(
        &self,
        project_id: impl Into<String>,
        profile_id: impl Into<String>,
    ) -> Result<String, QueueError> {
        self.enqueue(project_id.into(), Some(profile_id.into())).await
    }

    async fn enqueue(
        &self,
        project_id: String,
        profile_id: Option<String>,
    ) -> Result<String, QueueError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Command::Enqueue {
                project_id,
                profile_id,
                reply,
            })
            .map_err(|_| QueueError::Stopped)?;
        response.await.map_err(|_| QueueError::Stopped)?
    }

    /// Terminate whatever is currently running.
    ///
    /// Returns false when nothing was running (or the coordinator is gone).
    pub async fn cancel_active_build(&self) -> bool {
        let (reply, response) = oneshot::channel();
        if self.tx.send(Command::Cancel { reply }).is_err() {
            return false;
        }
        response.await.unwrap_or(false)
    }

    /// Receive every event from now on; nothing is dropped for slow readers
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Stop the control loop, cancelling and finalizing any active build first
    pub async fn shutdown(&self) {
        let (reply, response) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).is_ok() {
            let _ = response.await;
        }
    }
}
