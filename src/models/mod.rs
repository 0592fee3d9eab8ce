//! Data models for the build orchestrator.
//!
//! Everything in here is part of the persisted JSON document:
//! - [`AppConfig`]: The aggregate root (engines, projects, history, settings, profiles, analytics)
//! - [`EngineInstallation`], [`ProjectConfig`], [`BuildProfile`]: The reference graph a
//!   build resolves against
//! - [`BuildRecord`]: One requested build and its `queued → building → success|failed`
//!   lifecycle
//! - [`BuildAnalytics`]: Running counters updated once per completed build
//!
//! # Architecture Note
//!
//! The models are plain serializable values. Only [`ConfigStore`](crate::config::ConfigStore)
//! owns a whole [`AppConfig`]; the build core is handed a project, an engine and an
//! optional profile per attempt and never keeps the aggregate around.

pub mod analytics;
pub mod build;
pub mod config;

pub use analytics::{BuildAnalytics, PlatformStats};
pub use build::{BuildRecord, BuildStatus, TransitionError, prune_history};
pub use config::{
    AppConfig, ArtifactKind, BuildConfiguration, BuildProfile, CURRENT_SCHEMA_VERSION,
    EngineInstallation, EngineOrigin, EnvVar, ProjectConfig, Settings, ValidationError,
};
