//! The build executor: one attempt at a time, pre-hook → main → post-hook.

use super::hooks::{HookRole, HookRunner};
use super::invocation::{BuildPlan, banner};
use super::process::{
    CancelHandle, CancelToken, LogSink, ProcessOutcome, ProcessRunner, cancel_pair,
};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

pub const CANCELLED_MARKER: &str = "[BUILD CANCELLED BY USER]";
pub const FATAL_MARKER: &str = "[FATAL ERROR]";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("Build {active} is already running")]
    Busy { active: String },
}

/// Where the in-flight attempt currently is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AttemptPhase {
    #[default]
    Idle,
    RunningPreHook,
    RunningMain,
    RunningPostHook,
}

impl fmt::Display for AttemptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptPhase::Idle => "idle",
            AttemptPhase::RunningPreHook => "running pre-build hook",
            AttemptPhase::RunningMain => "running build",
            AttemptPhase::RunningPostHook => "running post-build hook",
        };
        f.write_str(name)
    }
}

/// Why an attempt failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    PreHookFailed,
    ExitCode(i32),
    Launch(String),
    Cancelled,
}

/// Final result of one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The main build exited with code zero; a failed post-hook is only a warning
    Succeeded { post_hook_failed: bool },
    Failed(AttemptFailure),
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Succeeded { .. })
    }
}

pub type AttemptFuture = Pin<Box<dyn Future<Output = AttemptOutcome> + Send>>;

#[derive(Debug)]
struct ActiveAttempt {
    build_id: String,
    cancel: CancelHandle,
    phase: watch::Receiver<AttemptPhase>,
}

/// Owns the "at most one attempt in flight" invariant.
///
/// [`start`](Self::start) hands back the attempt as a future for the caller
/// to drive. The executor stays busy until the caller reports the attempt
/// finished through [`complete`](Self::complete), so a second start can never
/// overlap the first even while its process is still being torn down.
pub struct BuildExecutor {
    runner: Arc<dyn ProcessRunner>,
    hooks: HookRunner,
    active: Option<ActiveAttempt>,
}

impl BuildExecutor {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            hooks: HookRunner::new(runner.clone()),
            runner,
            active: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn current_build_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.build_id.as_str())
    }

    pub fn phase(&self) -> AttemptPhase {
        self.active
            .as_ref()
            .map(|a| *a.phase.borrow())
            .unwrap_or_default()
    }

    /// Begin an attempt for `plan`, streaming its log through `sink`.
    ///
    /// Rejected without side effects while another attempt is active.
    pub fn start(
        &mut self,
        plan: BuildPlan,
        sink: LogSink,
    ) -> Result<AttemptFuture, ExecutorError> {
        if let Some(active) = &self.active {
            tracing::warn!(
                "Rejected build {}: build {} is still active",
                plan.build_id,
                active.build_id
            );
            return Err(ExecutorError::Busy {
                active: active.build_id.clone(),
            });
        }

        let (cancel, token) = cancel_pair();
        let (phase_tx, phase_rx) = watch::channel(AttemptPhase::Idle);
        self.active = Some(ActiveAttempt {
            build_id: plan.build_id.clone(),
            cancel,
            phase: phase_rx,
        });

        tracing::info!("Starting build {} for {}", plan.build_id, plan.project_name);

        let attempt = Attempt {
            runner: self.runner.clone(),
            hooks: self.hooks.clone(),
            plan,
            sink,
            cancel: token,
            phase: phase_tx,
        };
        Ok(Box::pin(attempt.run()))
    }

    /// Request termination of the active attempt.
    ///
    /// Returns the id of the build that was signalled, or `None` when idle.
    pub fn cancel(&mut self) -> Option<String> {
        let active = self.active.as_ref()?;
        tracing::info!("Cancelling build {} while {}", active.build_id, *active.phase.borrow());
        active.cancel.cancel();
        Some(active.build_id.clone())
    }

    /// Release the in-flight slot once the attempt for `build_id` has resolved
    pub fn complete(&mut self, build_id: &str) -> bool {
        match &self.active {
            Some(active) if active.build_id == build_id => {
                self.active = None;
                true
            }
            _ => false,
        }
    }
}

struct Attempt {
    runner: Arc<dyn ProcessRunner>,
    hooks: HookRunner,
    plan: BuildPlan,
    sink: LogSink,
    cancel: CancelToken,
    phase: watch::Sender<AttemptPhase>,
}

impl Attempt {
    async fn run(self) -> AttemptOutcome {
        let outcome = self.run_stages().await;
        self.phase.send_replace(AttemptPhase::Idle);

        match &outcome {
            AttemptOutcome::Succeeded { post_hook_failed } => tracing::info!(
                "Build {} succeeded{}",
                self.plan.build_id,
                if *post_hook_failed { " (post-build hook failed)" } else { "" }
            ),
            AttemptOutcome::Failed(failure) => {
                tracing::warn!("Build {} failed: {:?}", self.plan.build_id, failure)
            }
        }
        outcome
    }

    async fn run_stages(&self) -> AttemptOutcome {
        self.sink.emit(&self.plan.header());
        let hook_env = self.plan.hook_env();

        if let Some(script) = &self.plan.pre_build_script {
            self.phase.send_replace(AttemptPhase::RunningPreHook);
            let ok = self
                .hooks
                .run(script, HookRole::Pre, &hook_env, &self.sink, self.cancel.clone())
                .await;
            if self.cancel.is_cancelled() {
                return self.cancelled();
            }
            if !ok {
                self.sink.emit(&format!(
                    "\n{}\n{} Pre-build hook failed, build aborted\n",
                    banner(),
                    FATAL_MARKER
                ));
                return AttemptOutcome::Failed(AttemptFailure::PreHookFailed);
            }
        }

        if self.cancel.is_cancelled() {
            return self.cancelled();
        }

        self.phase.send_replace(AttemptPhase::RunningMain);
        let command = self.plan.main_command();
        self.sink.emit(&format!("Command: {}\n\n", command.display_line()));

        match self
            .runner
            .run(command, self.sink.clone(), self.cancel.clone())
            .await
        {
            ProcessOutcome::Exited { code: 0 } => {}
            ProcessOutcome::Exited { code } => {
                self.sink.emit(&format!(
                    "\n{}\n✗ Build failed with exit code {}\n",
                    banner(),
                    code
                ));
                return AttemptOutcome::Failed(AttemptFailure::ExitCode(code));
            }
            ProcessOutcome::LaunchFailed { message } => {
                self.sink.emit(&format!(
                    "\n{}\n{} Build tool could not be started: {}\n",
                    banner(),
                    FATAL_MARKER,
                    message
                ));
                return AttemptOutcome::Failed(AttemptFailure::Launch(message));
            }
            ProcessOutcome::Cancelled => return self.cancelled(),
        }

        let mut post_hook_failed = false;
        if let Some(script) = &self.plan.post_build_script {
            self.phase.send_replace(AttemptPhase::RunningPostHook);
            let ok = self
                .hooks
                .run(script, HookRole::Post, &hook_env, &self.sink, self.cancel.clone())
                .await;
            if self.cancel.is_cancelled() {
                return self.cancelled();
            }
            if !ok {
                post_hook_failed = true;
                self.sink
                    .emit("[WARNING] Post-build hook failed; the build itself succeeded\n");
            }
        }

        self.sink
            .emit(&format!("\n{}\n✓ Build completed successfully!\n", banner()));
        AttemptOutcome::Succeeded { post_hook_failed }
    }

    fn cancelled(&self) -> AttemptOutcome {
        self.sink.emit(&format!("\n{}\n{}\n", banner(), CANCELLED_MARKER));
        AttemptOutcome::Failed(AttemptFailure::Cancelled)
    }
}
