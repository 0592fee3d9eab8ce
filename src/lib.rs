// Unreal Builder - queued packaging of Unreal Engine plugins and projects
//
// This is the library crate containing the build orchestration core and the
// persisted data model. The binary crate (main.rs) provides a command-line
// front end.

pub mod config;
pub mod logging;
pub mod models;
pub mod queue;
pub mod services;

// Re-export commonly used types for convenience
pub use config::{ConfigError, ConfigStore, RuntimeSettings};
pub use models::{AppConfig, BuildRecord, BuildStatus, EngineInstallation, ProjectConfig};
pub use queue::{BuildEvent, CoordinatorHandle, EventReceiver, QueueCoordinator, QueueError};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
