//! Services module - the build orchestration core.
//!
//! Everything here is independent of how builds are requested (CLI, GUI) and
//! of how the document is stored. The pieces, leaves first:
//!
//! - [`engine_locator`]: Finds engine installations and validates them
//! - [`process`]: [`ProcessRunner`] spawns one external process, streams its
//!   output through a [`LogSink`] and honours a [`CancelToken`]
//! - [`hooks`]: [`HookRunner`] wraps pre/post build scripts with banners and timing
//! - [`invocation`]: [`BuildPlan`] merges project, profile and engine into the
//!   concrete RunUAT command line
//! - [`executor`]: [`BuildExecutor`] runs one attempt at a time
//!
//! Queue ordering and persistence live one level up in [`crate::queue`].

pub mod engine_locator;
pub mod executor;
pub mod hooks;
pub mod invocation;
pub mod process;

pub use engine_locator::{
    EngineLocator, LocatorError, detect_version, merge_scanned_engines,
    validate_engine_installation,
};
pub use executor::{
    AttemptFailure, AttemptFuture, AttemptOutcome, AttemptPhase, BuildExecutor, ExecutorError,
};
pub use hooks::{HookRole, HookRunner};
pub use invocation::{BuildPlan, entry_script_name, entry_script_path};
pub use process::{
    CancelHandle, CancelToken, CommandSpec, LogSink, ProcessOutcome, ProcessRunner, RunFuture,
    TokioProcessRunner, cancel_pair,
};
