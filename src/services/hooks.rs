use super::process::{CancelToken, CommandSpec, LogSink, ProcessRunner};
use camino::Utf8Path;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// When a hook script runs relative to the main build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookRole {
    Pre,
    Post,
}

impl HookRole {
    /// Value exported to the script as `UEB_HOOK_ROLE`
    pub fn as_str(&self) -> &'static str {
        match self {
            HookRole::Pre => "pre",
            HookRole::Post => "post",
        }
    }
}

impl fmt::Display for HookRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookRole::Pre => f.write_str("PRE-BUILD"),
            HookRole::Post => f.write_str("POST-BUILD"),
        }
    }
}

/// Runs pre/post build scripts through a [`ProcessRunner`].
///
/// A hook never errors: every problem (missing script, launch failure,
/// non-zero exit, cancellation) comes back as `false` with an explanation
/// in the log.
#[derive(Clone)]
pub struct HookRunner {
    runner: Arc<dyn ProcessRunner>,
}

impl HookRunner {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    /// Pick an interpreter from the script extension.
    ///
    /// Batch files are spawned directly; the OS runs them through cmd with
    /// the path quoted correctly even when it contains spaces.
    pub fn command_for(script: &Utf8Path) -> CommandSpec {
        let extension = script.extension().map(|e| e.to_ascii_lowercase());
        let command = match extension.as_deref() {
            Some("ps1") => CommandSpec::new("powershell").args([
                "-NoProfile",
                "-ExecutionPolicy",
                "Bypass",
                "-File",
                script.as_str(),
            ]),
            Some("sh") => CommandSpec::new("sh").arg(script.as_str()),
            _ => CommandSpec::new(script),
        };

        match script.parent() {
            Some(dir) if !dir.as_str().is_empty() => command.current_dir(dir),
            _ => command,
        }
    }

    /// Run one hook script and report whether it succeeded
    ///
    /// # Arguments
    /// * `script` - Path to the hook script
    /// * `role` - Pre- or post-build, used for banners and `UEB_HOOK_ROLE`
    /// * `env` - Build context exported to the script
    /// * `sink` - Receives the banners and the script's own output
    /// * `cancel` - Terminates the script when fired
    pub async fn run(
        &self,
        script: &Utf8Path,
        role: HookRole,
        env: &IndexMap<String, String>,
        sink: &LogSink,
        cancel: CancelToken,
    ) -> bool {
        sink.emit(&format!("\n--- {} HOOK: {} ---\n", role, script));

        if !script.is_file() {
            tracing::warn!("{} hook script not found: {}", role, script);
            sink.emit(&format!("[HOOK ERROR] {} script not found: {}\n", role, script));
            return false;
        }

        let command = Self::command_for(script)
            .envs(env)
            .env("UEB_HOOK_ROLE", role.as_str());

        let start = Instant::now();
        let outcome = self.runner.run(command, sink.clone(), cancel).await;
        let elapsed = start.elapsed().as_secs_f64();

        if outcome.success() {
            tracing::info!("{} hook succeeded in {:.1}s", role, elapsed);
            sink.emit(&format!("--- {} HOOK SUCCEEDED in {:.1}s ---\n", role, elapsed));
            true
        } else {
            tracing::warn!("{} hook failed ({}) after {:.1}s", role, outcome, elapsed);
            sink.emit(&format!(
                "--- {} HOOK FAILED ({}) after {:.1}s ---\n",
                role, outcome, elapsed
            ));
            false
        }
    }
}
