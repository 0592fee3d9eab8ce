use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Lifecycle status of a build record.
///
/// `Queued → Building → {Success, Failed}`, or `Queued → Failed` when the
/// project, engine or profile cannot be resolved at dequeue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Queued,
    Building,
    Success,
    Failed,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Success | BuildStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Queued => "queued",
            BuildStatus::Building => "building",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Build {id} cannot move from {from} to {to}")]
    Illegal {
        id: String,
        from: BuildStatus,
        to: BuildStatus,
    },
}

/// One requested build and everything recorded about it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRecord {
    pub id: String,
    pub project_id: String,

    /// Explicit profile requested at enqueue time (overrides the project default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,

    pub status: BuildStatus,
    pub start_time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub log: String,

    /// Platforms actually targeted, captured when the build starts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platforms: Option<Vec<String>>,
}

impl BuildRecord {
    /// Create a fresh `queued` record
    pub fn queued(project_id: impl Into<String>, profile_id: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            profile_id,
            status: BuildStatus::Queued,
            start_time: Utc::now(),
            end_time: None,
            log: String::new(),
            platforms: None,
        }
    }

    fn transition(&mut self, to: BuildStatus) -> Result<(), TransitionError> {
        let allowed = matches!(
            (self.status, to),
            (BuildStatus::Queued, BuildStatus::Building)
                | (BuildStatus::Queued, BuildStatus::Failed)
                | (BuildStatus::Building, BuildStatus::Success)
                | (BuildStatus::Building, BuildStatus::Failed)
        );
        if !allowed {
            return Err(TransitionError::Illegal {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// `queued → building`, stamping the start time and platform snapshot
    pub fn mark_building(
        &mut self,
        at: DateTime<Utc>,
        platforms: Vec<String>,
    ) -> Result<(), TransitionError> {
        self.transition(BuildStatus::Building)?;
        self.start_time = at;
        self.platforms = Some(platforms);
        self.log.clear();
        Ok(())
    }

    /// `building → success | failed`, storing the full accumulated log
    pub fn mark_finished(
        &mut self,
        success: bool,
        at: DateTime<Utc>,
        log: String,
    ) -> Result<(), TransitionError> {
        if self.status != BuildStatus::Building {
            let to = if success {
                BuildStatus::Success
            } else {
                BuildStatus::Failed
            };
            return Err(TransitionError::Illegal {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.transition(if success {
            BuildStatus::Success
        } else {
            BuildStatus::Failed
        })?;
        self.end_time = Some(at);
        self.log = log;
        Ok(())
    }

    /// `queued → failed` without ever running
    pub fn mark_unresolvable(
        &mut self,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), TransitionError> {
        if self.status != BuildStatus::Queued {
            return Err(TransitionError::Illegal {
                id: self.id.clone(),
                from: self.status,
                to: BuildStatus::Failed,
            });
        }
        self.transition(BuildStatus::Failed)?;
        self.end_time = Some(at);
        self.log = format!("[RESOLUTION ERROR] {}\n", reason);
        Ok(())
    }

    /// Wall-clock duration between start and end, if the record has ended
    pub fn duration(&self) -> Option<Duration> {
        let end = self.end_time?;
        (end - self.start_time).to_std().ok()
    }
}

/// Keep every non-terminal record plus the `cap` most recent terminal ones.
///
/// Recency is by start time; the relative order of surviving records is
/// preserved.
pub fn prune_history(records: &mut Vec<BuildRecord>, cap: usize) {
    let mut terminal: Vec<&BuildRecord> =
        records.iter().filter(|r| r.status.is_terminal()).collect();
    if terminal.len() <= cap {
        return;
    }

    terminal.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    let keep: HashSet<String> = terminal.iter().take(cap).map(|r| r.id.clone()).collect();

    let before = records.len();
    records.retain(|r| !r.status.is_terminal() || keep.contains(&r.id));
    tracing::debug!("Pruned {} build records (cap {})", before - records.len(), cap);
}
