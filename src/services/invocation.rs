//! Construction of the RunUAT invocation for one build.
//!
//! A [`BuildPlan`] is the effective view of a build: the project, with the
//! optional profile layered on top, bound to one engine installation. It is
//! computed once when a queued record is dequeued and is all the executor
//! ever sees.

use super::process::CommandSpec;
use crate::models::config::check_platforms;
use crate::models::{
    ArtifactKind, BuildConfiguration, BuildProfile, EngineInstallation, ProjectConfig,
    ValidationError,
};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;

/// Directory of the toolchain entry script, relative to an engine root
pub const TOOLCHAIN_DIR: [&str; 3] = ["Engine", "Build", "BatchFiles"];

/// Environment variable pointing the toolchain at the engine root
pub const ENGINE_ROOT_ENV: &str = "UE_BuildRoot";

const BANNER_WIDTH: usize = 80;

/// File name of the toolchain entry script on the current platform
pub fn entry_script_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "RunUAT.bat"
    } else {
        "RunUAT.sh"
    }
}

/// Full path of the toolchain entry script inside `engine_root`
pub fn entry_script_path(engine_root: &Utf8Path) -> Utf8PathBuf {
    let mut path = engine_root.to_path_buf();
    for part in TOOLCHAIN_DIR {
        path.push(part);
    }
    path.push(entry_script_name());
    path
}

/// Horizontal rule used around build output
pub fn banner() -> String {
    "=".repeat(BANNER_WIDTH)
}

/// Everything needed to run one build attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub build_id: String,
    pub project_name: String,
    pub artifact_path: Utf8PathBuf,
    pub artifact_kind: ArtifactKind,
    pub platforms: Vec<String>,
    /// Only set for project builds
    pub build_config: Option<BuildConfiguration>,
    pub output_path: Utf8PathBuf,
    pub engine_version: String,
    pub engine_root: Utf8PathBuf,
    pub profile_name: Option<String>,
    pub pre_build_script: Option<Utf8PathBuf>,
    pub post_build_script: Option<Utf8PathBuf>,
    pub custom_env: IndexMap<String, String>,
}

impl BuildPlan {
    /// Layer `profile` over `project` and bind the result to `engine`.
    ///
    /// Profile platforms and configuration replace the project's; hooks and
    /// custom environment variables only ever come from a profile.
    pub fn resolve(
        build_id: impl Into<String>,
        project: &ProjectConfig,
        engine: &EngineInstallation,
        profile: Option<&BuildProfile>,
    ) -> Result<Self, ValidationError> {
        let mut platforms = project.target_platforms.clone();
        let mut build_config = project.build_config;
        let mut pre_build_script = None;
        let mut post_build_script = None;
        let mut custom_env = IndexMap::new();

        if let Some(profile) = profile {
            if profile.artifact_kind != project.artifact_kind {
                return Err(ValidationError::ProfileKindMismatch {
                    profile: profile.name.clone(),
                    profile_kind: profile.artifact_kind,
                    project_kind: project.artifact_kind,
                });
            }
            if !profile.target_platforms.is_empty() {
                platforms = profile.target_platforms.clone();
            }
            build_config = profile.build_config.or(build_config);
            pre_build_script = profile.pre_build_script.clone();
            post_build_script = profile.post_build_script.clone();
            for var in &profile.custom_env {
                custom_env.insert(var.name.clone(), var.value.clone());
            }
        }

        check_platforms(&project.name, project.artifact_kind, &platforms)?;

        let build_config = match project.artifact_kind {
            ArtifactKind::Plugin => None,
            ArtifactKind::Project => Some(build_config.unwrap_or_default()),
        };

        Ok(Self {
            build_id: build_id.into(),
            project_name: project.name.clone(),
            artifact_path: project.artifact_path.clone(),
            artifact_kind: project.artifact_kind,
            platforms,
            build_config,
            output_path: project.output_path.clone(),
            engine_version: engine.version.clone(),
            engine_root: engine.path.clone(),
            profile_name: profile.map(|p| p.name.clone()),
            pre_build_script,
            post_build_script,
            custom_env,
        })
    }

    pub fn entry_script(&self) -> Utf8PathBuf {
        entry_script_path(&self.engine_root)
    }

    /// Where a project build archives its staged output
    pub fn archive_directory(&self) -> Utf8PathBuf {
        self.output_path.join(&self.project_name)
    }

    /// RunUAT arguments for this plan
    pub fn main_args(&self) -> Vec<String> {
        match self.artifact_kind {
            ArtifactKind::Plugin => vec![
                "BuildPlugin".to_string(),
                "-Rocket".to_string(),
                format!("-Plugin={}", self.artifact_path),
                format!("-TargetPlatforms={}", self.platforms.join("+")),
                format!("-Package={}", self.output_path),
            ],
            ArtifactKind::Project => {
                let config = self.build_config.unwrap_or_default();
                let platform = self.platforms.first().map(String::as_str).unwrap_or_default();
                vec![
                    "BuildCookRun".to_string(),
                    format!("-project={}", self.artifact_path),
                    "-noP4".to_string(),
                    format!("-platform={}", platform),
                    format!("-clientconfig={}", config),
                    format!("-serverconfig={}", config),
                    "-build".to_string(),
                    "-cook".to_string(),
                    "-stage".to_string(),
                    "-pak".to_string(),
                    "-archive".to_string(),
                    format!("-archivedirectory={}", self.archive_directory()),
                    "-utf8output".to_string(),
                ]
            }
        }
    }

    /// The main build command.
    ///
    /// The entry script is spawned directly, batch file included, so each
    /// argument is quoted on its own. Going through `cmd /C` would let cmd
    /// strip the outer quotes of paths with spaces.
    pub fn main_command(&self) -> CommandSpec {
        CommandSpec::new(self.entry_script())
            .args(self.main_args())
            .current_dir(&self.engine_root)
            .env(ENGINE_ROOT_ENV, self.engine_root.as_str())
            .envs(&self.custom_env)
    }

    /// Build context exported to hook scripts
    pub fn hook_env(&self) -> IndexMap<String, String> {
        let mut env = IndexMap::new();
        env.insert("UEB_PROJECT_NAME".to_string(), self.project_name.clone());
        env.insert("UEB_ARTIFACT_PATH".to_string(), self.artifact_path.to_string());
        env.insert("UEB_ARTIFACT_KIND".to_string(), self.artifact_kind.as_str().to_string());
        env.insert("UEB_OUTPUT_PATH".to_string(), self.output_path.to_string());
        env.insert("UEB_ENGINE_VERSION".to_string(), self.engine_version.clone());
        env.insert("UEB_ENGINE_PATH".to_string(), self.engine_root.to_string());
        env.insert("UEB_PLATFORMS".to_string(), self.platforms.join(","));
        env.insert(
            "UEB_BUILD_CONFIG".to_string(),
            self.build_config.map(|c| c.to_string()).unwrap_or_default(),
        );
        env.insert(ENGINE_ROOT_ENV.to_string(), self.engine_root.to_string());
        env.extend(self.custom_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// Structured header written at the top of every build log
    pub fn header(&self) -> String {
        let mut header = format!("Starting build: {}\n", self.project_name);
        header.push_str(&format!("Engine: {} ({})\n", self.engine_version, self.engine_root));
        header.push_str(&format!("Type: {}\n", self.artifact_kind));
        header.push_str(&format!("Platforms: {}\n", self.platforms.join(", ")));
        if let Some(config) = self.build_config {
            header.push_str(&format!("Configuration: {}\n", config));
        }
        if let Some(profile) = &self.profile_name {
            header.push_str(&format!("Profile: {}\n", profile));
        }
        header.push_str(&format!("Output: {}\n", self.output_path));
        header.push_str(&format!("\n{}\n\n", banner()));
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EngineOrigin, EnvVar};

    fn engine() -> EngineInstallation {
        EngineInstallation::new("5.3", "/opt/UE_5.3", EngineOrigin::Launcher, true)
    }

    fn plugin_project() -> ProjectConfig {
        ProjectConfig {
            id: "p1".to_string(),
            name: "MyPlugin".to_string(),
            artifact_path: Utf8PathBuf::from("/work/MyPlugin/MyPlugin.uplugin"),
            artifact_kind: ArtifactKind::Plugin,
            engine_id: "e1".to_string(),
            target_platforms: vec!["Win64".to_string(), "Linux".to_string()],
            build_config: None,
            output_path: Utf8PathBuf::from("/out/plugins"),
            default_profile_id: None,
        }
    }

    fn game_project() -> ProjectConfig {
        ProjectConfig {
            id: "p2".to_string(),
            name: "ShooterGame".to_string(),
            artifact_path: Utf8PathBuf::from("/work/ShooterGame/ShooterGame.uproject"),
            artifact_kind: ArtifactKind::Project,
            engine_id: "e1".to_string(),
            target_platforms: vec!["Win64".to_string()],
            build_config: Some(BuildConfiguration::Shipping),
            output_path: Utf8PathBuf::from("/out/games"),
            default_profile_id: None,
        }
    }

    fn profile(kind: ArtifactKind, platforms: &[&str]) -> BuildProfile {
        BuildProfile {
            id: "prof".to_string(),
            name: "CI".to_string(),
            artifact_kind: kind,
            target_platforms: platforms.iter().map(|s| s.to_string()).collect(),
            build_config: None,
            description: None,
            pre_build_script: Some(Utf8PathBuf::from("/hooks/pre.sh")),
            post_build_script: None,
            custom_env: vec![EnvVar {
                name: "CI_BUILD".to_string(),
                value: "1".to_string(),
            }],
        }
    }

    #[test]
    fn test_entry_script_location() {
        let path = entry_script_path(Utf8Path::new("/opt/UE_5.3"));
        let expected = Utf8Path::new("/opt/UE_5.3")
            .join("Engine")
            .join("Build")
            .join("BatchFiles")
            .join(entry_script_name());
        assert_eq!(path, expected);
    }

    #[test]
    fn test_plugin_targets_all_platforms_in_one_call() {
        let plan = BuildPlan::resolve("b1", &plugin_project(), &engine(), None).unwrap();
        let args = plan.main_args();

        assert_eq!(args[0], "BuildPlugin");
        assert!(args.contains(&"-Rocket".to_string()));
        assert!(args.contains(&"-Plugin=/work/MyPlugin/MyPlugin.uplugin".to_string()));
        assert!(args.contains(&"-TargetPlatforms=Win64+Linux".to_string()));
        assert!(args.contains(&"-Package=/out/plugins".to_string()));
        assert_eq!(plan.build_config, None);
    }

    #[test]
    fn test_project_single_platform_and_config_with_archive() {
        let plan = BuildPlan::resolve("b2", &game_project(), &engine(), None).unwrap();
        let args = plan.main_args();

        assert_eq!(args[0], "BuildCookRun");
        assert!(args.contains(&"-project=/work/ShooterGame/ShooterGame.uproject".to_string()));
        assert!(args.contains(&"-platform=Win64".to_string()));
        assert!(args.contains(&"-clientconfig=Shipping".to_string()));
        assert!(args.contains(&"-serverconfig=Shipping".to_string()));
        assert!(args.contains(&"-archive".to_string()));
        assert!(args.contains(&format!(
            "-archivedirectory={}",
            Utf8Path::new("/out/games").join("ShooterGame")
        )));
        assert_eq!(args.iter().filter(|a| a.starts_with("-platform=")).count(), 1);
    }

    #[test]
    fn test_project_config_defaults_to_development() {
        let mut project = game_project();
        project.build_config = None;
        let plan = BuildPlan::resolve("b", &project, &engine(), None).unwrap();
        assert_eq!(plan.build_config, Some(BuildConfiguration::Development));
        assert!(plan.main_args().contains(&"-clientconfig=Development".to_string()));
    }

    #[test]
    fn test_main_command_sets_engine_root() {
        let plan = BuildPlan::resolve("b1", &plugin_project(), &engine(), None).unwrap();
        let command = plan.main_command();

        assert_eq!(
            command.env.get(ENGINE_ROOT_ENV).map(String::as_str),
            Some("/opt/UE_5.3")
        );
        assert_eq!(command.working_dir, Some(Utf8PathBuf::from("/opt/UE_5.3")));
        assert!(command.args.iter().any(|a| a == "BuildPlugin"));
    }

    #[test]
    fn test_main_command_spawns_entry_script_with_spaced_paths() {
        let engine = EngineInstallation::new(
            "5.3",
            "C:/Program Files/Epic Games/UE_5.3",
            EngineOrigin::Launcher,
            true,
        );
        let mut project = plugin_project();
        project.artifact_path =
            Utf8PathBuf::from("C:/Users/dev/Documents/Unreal Projects/MyPlugin/MyPlugin.uplugin");
        let plan = BuildPlan::resolve("b1", &project, &engine, None).unwrap();
        let command = plan.main_command();

        assert_eq!(command.program, entry_script_path(&engine.path));
        assert_eq!(command.args[0], "BuildPlugin");
        assert!(command.args.contains(
            &"-Plugin=C:/Users/dev/Documents/Unreal Projects/MyPlugin/MyPlugin.uplugin".to_string()
        ));
        assert!(!command.args.iter().any(|a| a == "/C"));
    }

    #[test]
    fn test_profile_overrides_platforms_and_adds_env() {
        let p = profile(ArtifactKind::Plugin, &["Mac"]);
        let plan = BuildPlan::resolve("b1", &plugin_project(), &engine(), Some(&p)).unwrap();

        assert_eq!(plan.platforms, vec!["Mac".to_string()]);
        assert_eq!(plan.profile_name.as_deref(), Some("CI"));
        assert_eq!(plan.pre_build_script, Some(Utf8PathBuf::from("/hooks/pre.sh")));
        assert_eq!(plan.main_command().env.get("CI_BUILD").map(String::as_str), Some("1"));
        assert_eq!(plan.hook_env().get("CI_BUILD").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_profile_kind_mismatch_rejected() {
        let p = profile(ArtifactKind::Plugin, &["Win64"]);
        let result = BuildPlan::resolve("b", &game_project(), &engine(), Some(&p));
        assert!(matches!(
            result,
            Err(ValidationError::ProfileKindMismatch { .. })
        ));
    }

    #[test]
    fn test_hook_env_contents() {
        let plan = BuildPlan::resolve("b2", &game_project(), &engine(), None).unwrap();
        let env = plan.hook_env();

        assert_eq!(env["UEB_PROJECT_NAME"], "ShooterGame");
        assert_eq!(env["UEB_ARTIFACT_KIND"], "project");
        assert_eq!(env["UEB_ENGINE_VERSION"], "5.3");
        assert_eq!(env["UEB_PLATFORMS"], "Win64");
        assert_eq!(env["UEB_BUILD_CONFIG"], "Shipping");
    }

    #[test]
    fn test_header_contents() {
        let plan = BuildPlan::resolve("b2", &game_project(), &engine(), None).unwrap();
        let header = plan.header();

        assert!(header.starts_with("Starting build: ShooterGame\n"));
        assert!(header.contains("Engine: 5.3 (/opt/UE_5.3)"));
        assert!(header.contains("Type: Project"));
        assert!(header.contains("Platforms: Win64"));
        assert!(header.contains("Configuration: Shipping"));
        assert!(header.contains("Output: /out/games"));
        assert!(header.contains(&banner()));
    }
}
