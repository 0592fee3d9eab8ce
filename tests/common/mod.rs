//! Shared fixtures for the integration tests

#![allow(dead_code)]

use camino::{Utf8Path, Utf8PathBuf};
use std::collections::VecDeque;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use unreal_builder::models::{
    AppConfig, ArtifactKind, BuildConfiguration, EngineInstallation, EngineOrigin, ProjectConfig,
};
use unreal_builder::services::engine_locator::version_file_path;
use unreal_builder::services::{
    CancelToken, CommandSpec, LogSink, ProcessOutcome, ProcessRunner, RunFuture, entry_script_path,
};
use unreal_builder::{BuildEvent, ConfigStore, EventReceiver};

/// What the next spawned "process" does
#[derive(Debug, Clone)]
pub enum Step {
    Exit(i32),
    /// Print this many lines, then exit 0
    Chatty(usize),
    LaunchFail,
    UntilCancelled,
}

/// A [`ProcessRunner`] that plays back a script of outcomes and records
/// every command it was asked to run
#[derive(Default)]
pub struct ScriptedRunner {
    steps: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<CommandSpec>>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl ScriptedRunner {
    /// Runner that exits 0 for every call beyond `steps`
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of processes that were ever running at once
    pub fn max_concurrent(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

impl ProcessRunner for ScriptedRunner {
    fn run(&self, command: CommandSpec, sink: LogSink, mut cancel: CancelToken) -> RunFuture {
        self.calls.lock().unwrap().push(command.clone());
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Exit(0));
        let running = self.running.clone();
        let max_running = self.max_running.clone();

        Box::pin(async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            max_running.fetch_max(now, Ordering::SeqCst);

            sink.emit(&format!("running {}\n", command.program));
            tokio::time::sleep(Duration::from_millis(5)).await;

            let outcome = match step {
                Step::Exit(code) => {
                    sink.emit(&format!("Process exited with code {}\n", code));
                    ProcessOutcome::Exited { code }
                }
                Step::Chatty(lines) => {
                    for i in 0..lines {
                        sink.emit(&format!("line {}\n", i));
                    }
                    sink.emit("Process exited with code 0\n");
                    ProcessOutcome::Exited { code: 0 }
                }
                Step::LaunchFail => {
                    sink.emit("[FATAL ERROR] Failed to launch\n");
                    ProcessOutcome::LaunchFailed {
                        message: "not found".to_string(),
                    }
                }
                Step::UntilCancelled => {
                    cancel.cancelled().await;
                    sink.emit("Process terminated: cancelled\n");
                    ProcessOutcome::Cancelled
                }
            };

            running.fetch_sub(1, Ordering::SeqCst);
            outcome
        })
    }
}

/// Temporary directory with a store inside it
pub struct Fixture {
    pub temp_dir: TempDir,
    pub root: Utf8PathBuf,
    pub store: ConfigStore,
}

pub fn fixture() -> Fixture {
    let temp_dir = TempDir::new().unwrap();
    let root = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
    let store = ConfigStore::new(root.join("data").join("config.json"));
    Fixture {
        temp_dir,
        root,
        store,
    }
}

/// Lay out an engine directory; the entry script only exists when `valid`
pub fn fake_engine_dir(
    parent: &Utf8Path,
    name: &str,
    valid: bool,
    version_json: Option<&str>,
) -> Utf8PathBuf {
    let root = parent.join(name);
    fs::create_dir_all(&root).unwrap();

    if valid {
        let script = entry_script_path(&root);
        fs::create_dir_all(script.parent().unwrap()).unwrap();
        fs::write(&script, "exit 0\n").unwrap();
    }
    if let Some(json) = version_json {
        let path = version_file_path(&root);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, json).unwrap();
    }
    root
}

pub fn engine(path: impl Into<Utf8PathBuf>) -> EngineInstallation {
    EngineInstallation::new("5.3", path, EngineOrigin::Launcher, true)
}

pub fn plugin_project(id: &str, engine_id: &str, platforms: &[&str]) -> ProjectConfig {
    ProjectConfig {
        id: id.to_string(),
        name: format!("Plugin{}", id),
        artifact_path: Utf8PathBuf::from(format!("/work/{}/{}.uplugin", id, id)),
        artifact_kind: ArtifactKind::Plugin,
        engine_id: engine_id.to_string(),
        target_platforms: platforms.iter().map(|p| p.to_string()).collect(),
        build_config: None,
        output_path: Utf8PathBuf::from(format!("/out/{}", id)),
        default_profile_id: None,
    }
}

pub fn game_project(
    id: &str,
    engine_id: &str,
    platform: &str,
    config: BuildConfiguration,
) -> ProjectConfig {
    ProjectConfig {
        id: id.to_string(),
        name: format!("Game{}", id),
        artifact_path: Utf8PathBuf::from(format!("/work/{}/{}.uproject", id, id)),
        artifact_kind: ArtifactKind::Project,
        engine_id: engine_id.to_string(),
        target_platforms: vec![platform.to_string()],
        build_config: Some(config),
        output_path: Utf8PathBuf::from(format!("/out/{}", id)),
        default_profile_id: None,
    }
}

/// Store a document with one engine and the given plugin projects
pub fn seed_plugins(store: &ConfigStore, project_ids: &[&str], platforms: &[&str]) -> AppConfig {
    let mut config = AppConfig::default();
    let engine = engine("/opt/UE_5.3");
    let engine_id = engine.id.clone();
    config.add_engine(engine).unwrap();
    for id in project_ids {
        config
            .upsert_project(plugin_project(id, &engine_id, platforms))
            .unwrap();
    }
    store.save(&mut config).unwrap();
    config
}

pub async fn next_event(events: &mut EventReceiver) -> BuildEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a build event")
        .expect("event channel closed")
}

/// Collect `Started`/`Completed` events until `completed` builds have finished
pub async fn lifecycle_events(
    events: &mut EventReceiver,
    completed: usize,
) -> Vec<BuildEvent> {
    let mut seen = Vec::new();
    let mut done = 0;
    while done < completed {
        match next_event(events).await {
            BuildEvent::Log { .. } => {}
            event => {
                if matches!(event, BuildEvent::Completed { .. }) {
                    done += 1;
                }
                seen.push(event);
            }
        }
    }
    seen
}

/// Wait for `build_id` to complete and return its success flag plus all log text seen
pub async fn wait_for_build(events: &mut EventReceiver, build_id: &str) -> (bool, String) {
    let mut log = String::new();
    loop {
        match next_event(events).await {
            BuildEvent::Log { build_id: id, chunk } if id == build_id => log.push_str(&chunk),
            BuildEvent::Completed {
                build_id: id,
                success,
            } if id == build_id => return (success, log),
            _ => {}
        }
    }
}

/// Poll the store until every record in `build_ids` is terminal
pub async fn wait_until_finished(store: &ConfigStore, build_ids: &[String]) {
    let finished = async {
        loop {
            let config = store.load();
            let done = build_ids.iter().all(|id| {
                config
                    .build(id)
                    .is_some_and(|record| record.status.is_terminal())
            });
            if done {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), finished)
        .await
        .expect("builds did not finish in time");
}
