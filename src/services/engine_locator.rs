//! Discovery and validation of Unreal Engine installations.
//!
//! Installations are found from two sources:
//! - The Windows registry key written by the Epic Games Launcher
//! - Well-known install roots, whose `UE_*` / `UnrealEngine-*` children are probed
//!
//! A directory only counts as an installation when the toolchain entry script
//! exists at its fixed relative path (see [`entry_script_path`]).
//!
//! # Examples
//!
//! ```ignore
//! use unreal_builder::services::engine_locator::{EngineLocator, merge_scanned_engines};
//!
//! let found = EngineLocator::for_current_platform().scan().await;
//! let added = store.update(|config| merge_scanned_engines(config, found))?;
//! ```

use super::invocation::entry_script_path;
use crate::models::{AppConfig, EngineInstallation, EngineOrigin};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

/// Version reported when neither metadata nor the directory name gives one
pub const UNKNOWN_VERSION: &str = "Unknown";

const REGISTRY_KEY: &str = r"HKEY_LOCAL_MACHINE\SOFTWARE\EpicGames\Unreal Engine";
const REGISTRY_TIMEOUT: Duration = Duration::from_secs(5);

static REGISTRY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"InstallLocation\s+REG_SZ\s+(.+)").expect("Invalid registry line regex")
});

static VERSION_IN_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)UE[_-](\d+)\.(\d+)").expect("Invalid version regex"));

#[derive(Error, Debug)]
pub enum LocatorError {
    #[error("Failed to run registry query: {0}")]
    RegistryQuery(#[source] io::Error),

    #[error("Registry query timed out after {0:?}")]
    RegistryTimeout(Duration),

    #[error("Registry query exited with code {0}")]
    RegistryStatus(i32),

    #[error("Failed to read {path}: {source}")]
    Metadata {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid version metadata in {path}: {source}")]
    MetadataJson {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Check that `path` contains the toolchain entry script for this OS
pub fn validate_engine_installation(path: &Utf8Path) -> bool {
    let script = entry_script_path(path);
    let valid = script.is_file();
    tracing::debug!("Engine at {} valid: {} ({})", path, valid, script);
    valid
}

/// `Engine/Build/Build.version`, the JSON metadata shipped with every engine build
pub fn version_file_path(engine_root: &Utf8Path) -> Utf8PathBuf {
    engine_root.join("Engine").join("Build").join("Build.version")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BuildVersion {
    #[serde(default)]
    major_version: u32,
    #[serde(default)]
    minor_version: u32,
}

/// Detects the `major.minor` version of an engine installation.
///
/// Reads `Engine/Build/Build.version` first. A missing or zero major version
/// there is taken to be 5. Without usable metadata the directory name is
/// searched for `UE_5.3` / `UE-4.27` style patterns.
///
/// # Returns
///
/// A version string such as `"5.3"`, or `"Unknown"`
pub fn detect_version(engine_root: &Utf8Path) -> String {
    match version_from_metadata(engine_root) {
        Ok(version) => return version,
        Err(e) => tracing::debug!("No usable version metadata: {}", e),
    }

    version_from_name(engine_root).unwrap_or_else(|| UNKNOWN_VERSION.to_string())
}

fn version_from_metadata(engine_root: &Utf8Path) -> Result<String, LocatorError> {
    let path = version_file_path(engine_root);
    let contents = fs::read_to_string(&path).map_err(|source| LocatorError::Metadata {
        path: path.clone(),
        source,
    })?;
    let version: BuildVersion = serde_json::from_str(&contents)
        .map_err(|source| LocatorError::MetadataJson { path, source })?;

    let major = if version.major_version == 0 {
        5
    } else {
        version.major_version
    };
    Ok(format!("{}.{}", major, version.minor_version))
}

/// Pull a version out of a path such as `C:/Epic Games/UE_5.3`
pub fn version_from_name(path: &Utf8Path) -> Option<String> {
    let captures = VERSION_IN_NAME.captures(path.as_str())?;
    Some(format!("{}.{}", &captures[1], &captures[2]))
}

/// Extract every `InstallLocation` value from `reg query` output
pub fn parse_registry_output(output: &str) -> Vec<Utf8PathBuf> {
    output
        .lines()
        .filter_map(|line| REGISTRY_LINE.captures(line))
        .map(|captures| Utf8PathBuf::from(captures[1].trim()))
        .collect()
}

fn is_engine_dir_name(name: &str) -> bool {
    name.starts_with("UE_") || name.starts_with("UnrealEngine-")
}

/// Launcher installs are named `UE_x.y`; anything else found on disk is a source build
fn origin_for_dir_name(name: &str) -> EngineOrigin {
    if name.starts_with("UnrealEngine-") {
        EngineOrigin::Source
    } else {
        EngineOrigin::Launcher
    }
}

/// Scans the registry and a list of install roots for engines
#[derive(Debug, Clone)]
pub struct EngineLocator {
    search_roots: Vec<Utf8PathBuf>,
    query_registry: bool,
}

impl EngineLocator {
    /// Locator over explicit roots, without registry lookup
    pub fn new(search_roots: Vec<Utf8PathBuf>) -> Self {
        Self {
            search_roots,
            query_registry: false,
        }
    }

    pub fn with_registry(mut self, query_registry: bool) -> Self {
        self.query_registry = query_registry;
        self
    }

    /// The usual install locations for the current OS
    pub fn for_current_platform() -> Self {
        let mut roots = Vec::new();

        if cfg!(target_os = "windows") {
            for drive in ["C:", "D:", "E:"] {
                for base in ["Program Files/Epic Games", "Epic Games", "UnrealEngine"] {
                    roots.push(Utf8PathBuf::from(format!("{}/{}", drive, base)));
                }
            }
        } else {
            if let Some(home) = dirs::home_dir().and_then(|h| Utf8PathBuf::try_from(h).ok()) {
                roots.push(home.join("UnrealEngine"));
                roots.push(home.join("Epic Games"));
            }
            roots.push(Utf8PathBuf::from("/opt/UnrealEngine"));
            roots.push(Utf8PathBuf::from("/opt/Epic Games"));
        }

        Self::new(roots).with_registry(cfg!(target_os = "windows"))
    }

    pub fn search_roots(&self) -> &[Utf8PathBuf] {
        &self.search_roots
    }

    /// Find every valid installation, de-duplicated by path.
    ///
    /// Unreadable roots and a failed registry query are logged and skipped.
    pub async fn scan(&self) -> Vec<EngineInstallation> {
        let mut found = Vec::new();
        let mut seen = HashSet::new();

        if self.query_registry {
            match query_registry().await {
                Ok(paths) => {
                    for path in paths {
                        self.consider(path, EngineOrigin::Launcher, &mut seen, &mut found);
                    }
                }
                Err(e) => tracing::info!(
                    "Registry scan failed (normal without Launcher installs): {}",
                    e
                ),
            }
        }

        for root in &self.search_roots {
            let entries = match fs::read_dir(root) {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            let mut children: Vec<(String, Utf8PathBuf)> = entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
                .filter_map(|entry| Utf8PathBuf::try_from(entry.path()).ok())
                .filter_map(|path| Some((path.file_name()?.to_string(), path)))
                .filter(|(name, _)| is_engine_dir_name(name))
                .collect();
            children.sort();

            for (name, path) in children {
                self.consider(path, origin_for_dir_name(&name), &mut seen, &mut found);
            }
        }

        tracing::info!("Engine scan found {} installation(s)", found.len());
        found
    }

    fn consider(
        &self,
        path: Utf8PathBuf,
        origin: EngineOrigin,
        seen: &mut HashSet<Utf8PathBuf>,
        found: &mut Vec<EngineInstallation>,
    ) {
        if seen.contains(&path) || !validate_engine_installation(&path) {
            return;
        }
        let version = detect_version(&path);
        tracing::info!("Found Unreal Engine {} at {}", version, path);
        seen.insert(path.clone());
        found.push(EngineInstallation::new(version, path, origin, true));
    }
}

async fn query_registry() -> Result<Vec<Utf8PathBuf>, LocatorError> {
    let mut command = tokio::process::Command::new("reg");
    command.args(["query", REGISTRY_KEY, "/s"]).kill_on_drop(true);
    let query = command.output();

    let output = tokio::time::timeout(REGISTRY_TIMEOUT, query)
        .await
        .map_err(|_| LocatorError::RegistryTimeout(REGISTRY_TIMEOUT))?
        .map_err(LocatorError::RegistryQuery)?;

    if !output.status.success() {
        return Err(LocatorError::RegistryStatus(output.status.code().unwrap_or(-1)));
    }

    Ok(parse_registry_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Add scanned engines that are validated and not yet registered.
///
/// # Returns
///
/// The number of engines added
pub fn merge_scanned_engines(config: &mut AppConfig, found: Vec<EngineInstallation>) -> usize {
    let mut added = 0;
    for engine in found {
        if !engine.validated {
            tracing::debug!("Skipping unvalidated engine at {}", engine.path);
            continue;
        }
        let path = engine.path.clone();
        match config.add_engine(engine) {
            Ok(()) => added += 1,
            Err(_) => tracing::debug!("Engine at {} already registered", path),
        }
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_registry_output() {
        let output = "\r\nHKEY_LOCAL_MACHINE\\SOFTWARE\\EpicGames\\Unreal Engine\\5.3\r\n    InstallLocation    REG_SZ    C:\\Program Files\\Epic Games\\UE_5.3\r\n\r\nHKEY_LOCAL_MACHINE\\SOFTWARE\\EpicGames\\Unreal Engine\\4.27\r\n    InstallLocation    REG_SZ    D:\\UE_4.27\r\n";

        let paths = parse_registry_output(output);
        assert_eq!(
            paths,
            vec![
                Utf8PathBuf::from("C:\\Program Files\\Epic Games\\UE_5.3"),
                Utf8PathBuf::from("D:\\UE_4.27"),
            ]
        );
    }

    #[test]
    fn test_parse_registry_output_without_matches() {
        assert!(
            parse_registry_output(
                "ERROR: The system was unable to find the specified registry key"
            )
            .is_empty()
        );
    }

    #[test]
    fn test_version_from_name() {
        assert_eq!(
            version_from_name(Utf8Path::new("C:/Epic Games/UE_5.3")),
            Some("5.3".to_string())
        );
        assert_eq!(
            version_from_name(Utf8Path::new("/opt/ue-4.27")),
            Some("4.27".to_string())
        );
        assert_eq!(version_from_name(Utf8Path::new("/opt/UnrealEngine")), None);
    }

    #[test]
    fn test_engine_dir_names() {
        assert!(is_engine_dir_name("UE_5.4"));
        assert!(is_engine_dir_name("UnrealEngine-5.4"));
        assert!(!is_engine_dir_name("Launcher"));
        assert_eq!(origin_for_dir_name("UnrealEngine-release"), EngineOrigin::Source);
        assert_eq!(origin_for_dir_name("UE_5.4"), EngineOrigin::Launcher);
    }

    #[test]
    fn test_merge_skips_known_and_unvalidated() {
        let mut config = AppConfig::default();
        config
            .add_engine(EngineInstallation::new("5.3", "/opt/UE_5.3", EngineOrigin::Launcher, true))
            .unwrap();

        let found = vec![
            EngineInstallation::new("5.3", "/opt/UE_5.3", EngineOrigin::Launcher, true),
            EngineInstallation::new("5.4", "/opt/UE_5.4", EngineOrigin::Launcher, true),
            EngineInstallation::new("5.5", "/opt/UE_5.5", EngineOrigin::Launcher, false),
        ];

        assert_eq!(merge_scanned_engines(&mut config, found), 1);
        assert_eq!(config.engines.len(), 2);
        assert!(config.engine_at(Utf8Path::new("/opt/UE_5.4")).is_some());
    }
}
