use super::analytics::BuildAnalytics;
use super::build::{BuildRecord, prune_history};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

/// Schema version written by this build of the tool.
///
/// Version 1 is the original `{engines, projects, buildHistory}` document
/// with no version field at all.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Default number of completed builds kept in history.
pub const DEFAULT_MAX_HISTORY_BUILDS: usize = 20;

static ENV_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9_]+$").expect("Invalid env name regex"));

/// Errors raised when an entity or a reference between entities is invalid
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Name must not be empty")]
    EmptyName,

    #[error("{0} must target at least one platform")]
    NoPlatforms(String),

    #[error("{name} packages a full project and must target exactly one platform (found {count})")]
    ProjectPlatformCount { name: String, count: usize },

    #[error("Invalid environment variable name '{0}': only A-Z, 0-9 and _ are allowed")]
    InvalidEnvName(String),

    #[error("Engine {0} is not registered")]
    UnknownEngine(String),

    #[error("Profile {0} does not exist")]
    UnknownProfile(String),

    #[error("Engine {engine} is still used by project {project}")]
    EngineInUse { engine: String, project: String },

    #[error("An engine is already registered at {0}")]
    DuplicateEngine(Utf8PathBuf),

    #[error("Profile {profile} is for {profile_kind} builds and cannot be applied to a {project_kind}")]
    ProfileKindMismatch {
        profile: String,
        profile_kind: ArtifactKind,
        project_kind: ArtifactKind,
    },
}

/// Where an engine installation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineOrigin {
    Launcher,
    Source,
}

/// A discovered or user-registered Unreal Engine installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineInstallation {
    pub id: String,
    pub version: String,
    pub path: Utf8PathBuf,
    #[serde(rename = "type")]
    pub origin: EngineOrigin,
    pub validated: bool,
}

impl EngineInstallation {
    /// Create an installation record with a freshly generated id
    pub fn new(
        version: impl Into<String>,
        path: impl Into<Utf8PathBuf>,
        origin: EngineOrigin,
        validated: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            version: version.into(),
            path: path.into(),
            origin,
            validated,
        }
    }
}

/// Whether a buildable unit is a redistributable plugin or a full project
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    #[default]
    Plugin,
    Project,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Plugin => "plugin",
            ArtifactKind::Project => "project",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Plugin => write!(f, "Plugin"),
            ArtifactKind::Project => write!(f, "Project"),
        }
    }
}

/// Build configuration used when packaging a full project
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildConfiguration {
    #[default]
    Development,
    Shipping,
}

impl BuildConfiguration {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildConfiguration::Development => "Development",
            BuildConfiguration::Shipping => "Shipping",
        }
    }
}

impl fmt::Display for BuildConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A plugin or project registered for packaging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    pub id: String,
    pub name: String,

    /// `.uplugin` or `.uproject` descriptor
    #[serde(alias = "pluginPath")]
    pub artifact_path: Utf8PathBuf,

    #[serde(default)]
    pub artifact_kind: ArtifactKind,

    pub engine_id: String,
    pub target_platforms: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_config: Option<BuildConfiguration>,

    pub output_path: Utf8PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_profile_id: Option<String>,
}

impl ProjectConfig {
    /// Check the invariants that do not depend on other entities
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        check_platforms(&self.name, self.artifact_kind, &self.target_platforms)
    }
}

/// A custom environment variable exported to hooks and the main build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// A reusable bundle of platform, configuration and hook settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildProfile {
    pub id: String,
    pub name: String,

    #[serde(default)]
    pub artifact_kind: ArtifactKind,

    pub target_platforms: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_config: Option<BuildConfiguration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_build_script: Option<Utf8PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_build_script: Option<Utf8PathBuf>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_env: Vec<EnvVar>,
}

impl BuildProfile {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        check_platforms(&self.name, self.artifact_kind, &self.target_platforms)?;

        if let Some(bad) = self
            .custom_env
            .iter()
            .find(|var| !is_valid_env_name(&var.name))
        {
            return Err(ValidationError::InvalidEnvName(bad.name.clone()));
        }

        Ok(())
    }
}

/// Check an environment variable name against the allowed alphabet
pub fn is_valid_env_name(name: &str) -> bool {
    ENV_NAME_PATTERN.is_match(name)
}

pub(crate) fn check_platforms(
    owner: &str,
    kind: ArtifactKind,
    platforms: &[String],
) -> Result<(), ValidationError> {
    if platforms.is_empty() {
        return Err(ValidationError::NoPlatforms(owner.to_string()));
    }
    if kind == ArtifactKind::Project && platforms.len() != 1 {
        return Err(ValidationError::ProjectPlatformCount {
            name: owner.to_string(),
            count: platforms.len(),
        });
    }
    Ok(())
}

/// User preferences stored alongside the build data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub show_notifications: bool,
    pub auto_open_build_queue: bool,
    pub max_history_builds: usize,
    pub minimize_to_tray: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            show_notifications: true,
            auto_open_build_queue: true,
            max_history_builds: DEFAULT_MAX_HISTORY_BUILDS,
            minimize_to_tray: false,
        }
    }
}

/// The whole persisted document.
///
/// Owned by [`ConfigStore`](crate::config::ConfigStore); the build core only
/// ever receives the slices it needs for a single attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default = "legacy_schema_version")]
    pub schema_version: u32,

    #[serde(default)]
    pub engines: Vec<EngineInstallation>,

    #[serde(default)]
    pub projects: Vec<ProjectConfig>,

    #[serde(default)]
    pub build_history: Vec<BuildRecord>,

    #[serde(default)]
    pub settings: Settings,

    #[serde(default)]
    pub profiles: Vec<BuildProfile>,

    #[serde(default)]
    pub analytics: BuildAnalytics,
}

fn legacy_schema_version() -> u32 {
    1
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            engines: Vec::new(),
            projects: Vec::new(),
            build_history: Vec::new(),
            settings: Settings::default(),
            profiles: Vec::new(),
            analytics: BuildAnalytics::default(),
        }
    }
}

impl AppConfig {
    /// Bring a freshly deserialized document up to the current schema.
    ///
    /// Field-level defaults are already applied by serde; this only stamps
    /// the version so the next save writes the current shape.
    pub fn upgrade(&mut self) {
        if self.schema_version < CURRENT_SCHEMA_VERSION {
            tracing::info!(
                "Upgrading config document from schema v{} to v{}",
                self.schema_version,
                CURRENT_SCHEMA_VERSION
            );
            self.schema_version = CURRENT_SCHEMA_VERSION;
        }
    }

    pub fn engine(&self, id: &str) -> Option<&EngineInstallation> {
        self.engines.iter().find(|e| e.id == id)
    }

    pub fn engine_at(&self, path: &Utf8Path) -> Option<&EngineInstallation> {
        self.engines.iter().find(|e| e.path == path)
    }

    pub fn project(&self, id: &str) -> Option<&ProjectConfig> {
        self.projects.iter().find(|p| p.id == id)
    }

    pub fn profile(&self, id: &str) -> Option<&BuildProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn build(&self, id: &str) -> Option<&BuildRecord> {
        self.build_history.iter().find(|b| b.id == id)
    }

    pub fn build_mut(&mut self, id: &str) -> Option<&mut BuildRecord> {
        self.build_history.iter_mut().find(|b| b.id == id)
    }

    /// Register an engine; paths are unique across installations
    pub fn add_engine(&mut self, engine: EngineInstallation) -> Result<(), ValidationError> {
        if self.engine_at(&engine.path).is_some() {
            return Err(ValidationError::DuplicateEngine(engine.path));
        }
        self.engines.push(engine);
        Ok(())
    }

    /// Remove an engine that no project references
    pub fn remove_engine(
        &mut self,
        id: &str,
    ) -> Result<Option<EngineInstallation>, ValidationError> {
        if let Some(project) = self.projects.iter().find(|p| p.engine_id == id) {
            return Err(ValidationError::EngineInUse {
                engine: id.to_string(),
                project: project.name.clone(),
            });
        }
        let removed = self
            .engines
            .iter()
            .position(|e| e.id == id)
            .map(|index| self.engines.remove(index));
        Ok(removed)
    }

    /// Insert or replace a project after checking its references
    pub fn upsert_project(&mut self, project: ProjectConfig) -> Result<(), ValidationError> {
        project.validate()?;
        if self.engine(&project.engine_id).is_none() {
            return Err(ValidationError::UnknownEngine(project.engine_id));
        }
        if let Some(profile_id) = &project.default_profile_id {
            if self.profile(profile_id).is_none() {
                return Err(ValidationError::UnknownProfile(profile_id.clone()));
            }
        }

        match self.projects.iter_mut().find(|p| p.id == project.id) {
            Some(existing) => *existing = project,
            None => self.projects.push(project),
        }
        Ok(())
    }

    pub fn remove_project(&mut self, id: &str) -> Option<ProjectConfig> {
        let index = self.projects.iter().position(|p| p.id == id)?;
        Some(self.projects.remove(index))
    }

    pub fn upsert_profile(&mut self, profile: BuildProfile) -> Result<(), ValidationError> {
        profile.validate()?;
        match self.profiles.iter_mut().find(|p| p.id == profile.id) {
            Some(existing) => *existing = profile,
            None => self.profiles.push(profile),
        }
        Ok(())
    }

    /// Remove a profile and detach it from projects that used it as default
    pub fn remove_profile(&mut self, id: &str) -> Option<BuildProfile> {
        let index = self.profiles.iter().position(|p| p.id == id)?;
        for project in &mut self.projects {
            if project.default_profile_id.as_deref() == Some(id) {
                project.default_profile_id = None;
            }
        }
        Some(self.profiles.remove(index))
    }

    /// Drop a record that is still waiting in the queue.
    ///
    /// Returns false when the record does not exist or has already started.
    pub fn remove_queued_build(&mut self, id: &str) -> bool {
        let before = self.build_history.len();
        self.build_history
            .retain(|b| !(b.id == id && b.status == super::BuildStatus::Queued));
        self.build_history.len() != before
    }

    /// Remove every terminal record, keeping queued and running ones
    pub fn clear_completed_history(&mut self) {
        self.build_history.retain(|b| !b.status.is_terminal());
    }

    /// Trim history to `settings.max_history_builds` terminal records
    pub fn prune_history(&mut self) {
        prune_history(&mut self.build_history, self.settings.max_history_builds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> EngineInstallation {
        EngineInstallation::new("5.3", "/opt/UE_5.3", EngineOrigin::Launcher, true)
    }

    fn project(engine_id: &str) -> ProjectConfig {
        ProjectConfig {
            id: "p1".to_string(),
            name: "MyPlugin".to_string(),
            artifact_path: Utf8PathBuf::from("/work/MyPlugin/MyPlugin.uplugin"),
            artifact_kind: ArtifactKind::Plugin,
            engine_id: engine_id.to_string(),
            target_platforms: vec!["Win64".to_string()],
            build_config: None,
            output_path: Utf8PathBuf::from("/out"),
            default_profile_id: None,
        }
    }

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.max_history_builds, 20);
        assert!(settings.show_notifications);
        assert!(settings.auto_open_build_queue);
        assert!(!settings.minimize_to_tray);
    }

    #[test]
    fn test_project_requires_platforms() {
        let mut p = project("e");
        p.target_platforms.clear();
        assert_eq!(
            p.validate(),
            Err(ValidationError::NoPlatforms("MyPlugin".to_string()))
        );
    }

    #[test]
    fn test_project_kind_requires_single_platform() {
        let mut p = project("e");
        p.artifact_kind = ArtifactKind::Project;
        p.target_platforms = vec!["Win64".to_string(), "Linux".to_string()];
        assert!(matches!(
            p.validate(),
            Err(ValidationError::ProjectPlatformCount { count: 2, .. })
        ));
    }

    #[test]
    fn test_env_name_validation() {
        assert!(is_valid_env_name("MY_VAR_2"));
        assert!(!is_valid_env_name("my_var"));
        assert!(!is_valid_env_name("MY-VAR"));
        assert!(!is_valid_env_name(""));
    }

    #[test]
    fn test_profile_rejects_lowercase_env() {
        let profile = BuildProfile {
            id: "prof".to_string(),
            name: "Nightly".to_string(),
            artifact_kind: ArtifactKind::Plugin,
            target_platforms: vec!["Win64".to_string()],
            build_config: None,
            description: None,
            pre_build_script: None,
            post_build_script: None,
            custom_env: vec![EnvVar {
                name: "lower".to_string(),
                value: "x".to_string(),
            }],
        };
        assert_eq!(
            profile.validate(),
            Err(ValidationError::InvalidEnvName("lower".to_string()))
        );
    }

    #[test]
    fn test_upsert_project_requires_engine() {
        let mut config = AppConfig::default();
        let result = config.upsert_project(project("missing"));
        assert_eq!(
            result,
            Err(ValidationError::UnknownEngine("missing".to_string()))
        );
    }

    #[test]
    fn test_engine_removal_blocked_while_referenced() {
        let mut config = AppConfig::default();
        let e = engine();
        let engine_id = e.id.clone();
        config.add_engine(e).unwrap();
        config.upsert_project(project(&engine_id)).unwrap();

        assert!(matches!(
            config.remove_engine(&engine_id),
            Err(ValidationError::EngineInUse { .. })
        ));

        config.remove_project("p1");
        assert!(config.remove_engine(&engine_id).unwrap().is_some());
        assert!(config.engines.is_empty());
    }

    #[test]
    fn test_duplicate_engine_path_rejected() {
        let mut config = AppConfig::default();
        config.add_engine(engine()).unwrap();
        assert!(matches!(
            config.add_engine(engine()),
            Err(ValidationError::DuplicateEngine(_))
        ));
    }

    #[test]
    fn test_legacy_document_upgrade() {
        let json = r#"{
            "engines": [],
            "projects": [{
                "id": "p1",
                "name": "Legacy",
                "pluginPath": "C:/Plugins/Legacy/Legacy.uplugin",
                "engineId": "e1",
                "targetPlatforms": ["Win64"],
                "outputPath": "C:/Out"
            }],
            "buildHistory": []
        }"#;

        let mut config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.schema_version, 1);
        assert_eq!(config.projects[0].artifact_kind, ArtifactKind::Plugin);
        assert_eq!(
            config.projects[0].artifact_path,
            Utf8PathBuf::from("C:/Plugins/Legacy/Legacy.uplugin")
        );
        assert_eq!(config.settings.max_history_builds, 20);

        config.upgrade();
        assert_eq!(config.schema_version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_remove_profile_detaches_default() {
        let mut config = AppConfig::default();
        let e = engine();
        let engine_id = e.id.clone();
        config.add_engine(e).unwrap();
        config
            .upsert_profile(BuildProfile {
                id: "prof".to_string(),
                name: "Release".to_string(),
                artifact_kind: ArtifactKind::Plugin,
                target_platforms: vec!["Win64".to_string()],
                build_config: None,
                description: None,
                pre_build_script: None,
                post_build_script: None,
                custom_env: Vec::new(),
            })
            .unwrap();
        let mut p = project(&engine_id);
        p.default_profile_id = Some("prof".to_string());
        config.upsert_project(p).unwrap();

        assert!(config.remove_profile("prof").is_some());
        assert_eq!(config.projects[0].default_profile_id, None);
    }
}
