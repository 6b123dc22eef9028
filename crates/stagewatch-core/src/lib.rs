use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub mod output;
pub mod paging;
pub mod transport;

pub use output::{LogChunk, LogCursor, OutputFamily, OutputSource, LOGGING_ERROR_MARKER};
pub use paging::{Page, PageCursor, PageRequest, Pagination};
pub use transport::{
    CleanupAware, ErrorClassifier, FailureDisposition, FetchError, OutputFetcher, PageFetcher,
    PauseOnError, RequestKind, StageFetcher,
};

/// An asynchronous multi-stage job. Only referenced, never mutated, by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Request {
    pub id: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl Request {
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageState {
    Queued,
    Running,
    Finished,
    Failed,
}

impl StageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageState::Queued => "QUEUED",
            StageState::Running => "RUNNING",
            StageState::Finished => "FINISHED",
            StageState::Failed => "FAILED",
        }
    }

    /// Position in the forward-only lifecycle. Both terminal states share a rank.
    pub fn rank(&self) -> u8 {
        match self {
            StageState::Queued => 0,
            StageState::Running => 1,
            StageState::Finished | StageState::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StageState::Finished | StageState::Failed)
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageState {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_uppercase();
        match normalized.as_str() {
            "QUEUED" => Ok(StageState::Queued),
            "RUNNING" | "IN_PROGRESS" => Ok(StageState::Running),
            "FINISHED" => Ok(StageState::Finished),
            "FAILED" => Ok(StageState::Failed),
            other => Err(format!("Unknown stage state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum StageType {
    InfraProvisioning,
    NetworkingConfig,
    UserConfig,
    #[serde(other)]
    Unknown,
}

impl StageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageType::InfraProvisioning => "infra-provisioning",
            StageType::NetworkingConfig => "networking-config",
            StageType::UserConfig => "user-config",
            StageType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stage {
    pub id: String,
    #[serde(rename = "type")]
    pub stage_type: StageType,
    pub state: StageState,
    #[serde(default, rename = "startedAt")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "finishedAt")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Stage {
    pub fn new(id: impl Into<String>, stage_type: StageType, state: StageState) -> Self {
        Self {
            id: id.into(),
            stage_type,
            state,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Key under which pollers of this stage's detail resources register.
    pub fn poll_key(&self) -> String {
        format!("stage-{}", self.id)
    }

    /// Combines a freshly fetched view of this stage with the current one without ever moving
    /// the state backwards. Returns the merged stage and whether `next` tried to regress.
    pub fn merge_forward(&self, next: Stage) -> (Stage, bool) {
        if next.state.rank() < self.state.rank() {
            let mut kept = next;
            kept.state = self.state;
            kept.started_at = kept.started_at.or(self.started_at);
            kept.finished_at = kept.finished_at.or(self.finished_at);
            return (kept, true);
        }
        (next, false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestLifecycle {
    /// No stages have been materialized yet.
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl RequestLifecycle {
    pub fn of(stages: &[Stage]) -> Self {
        if stages.is_empty() {
            RequestLifecycle::Pending
        } else if any_failed(stages) {
            RequestLifecycle::Failed
        } else if all_finished(stages) {
            RequestLifecycle::Succeeded
        } else {
            RequestLifecycle::InProgress
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestLifecycle::Succeeded | RequestLifecycle::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestLifecycle::Pending => "pending",
            RequestLifecycle::InProgress => "in_progress",
            RequestLifecycle::Succeeded => "succeeded",
            RequestLifecycle::Failed => "failed",
        }
    }
}

pub fn all_finished(stages: &[Stage]) -> bool {
    !stages.is_empty() && stages.iter().all(|stage| stage.state == StageState::Finished)
}

pub fn any_failed(stages: &[Stage]) -> bool {
    stages.iter().any(|stage| stage.state == StageState::Failed)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedSnapshot {
    pub stages: Vec<Stage>,
    /// Ids of stages whose fetched state was older than the one already published.
    pub regressed: Vec<String>,
}

/// Merges a fetched snapshot into the previously published one, stage by stage.
pub fn merge_snapshot(previous: &[Stage], fetched: Vec<Stage>) -> MergedSnapshot {
    let known: HashMap<&str, &Stage> = previous
        .iter()
        .map(|stage| (stage.id.as_str(), stage))
        .collect();
    let mut merged = MergedSnapshot::default();
    for stage in fetched {
        match known.get(stage.id.as_str()) {
            Some(current) => {
                let (stage, regressed) = current.merge_forward(stage);
                if regressed {
                    merged.regressed.push(stage.id.clone());
                }
                merged.stages.push(stage);
            }
            None => merged.stages.push(stage),
        }
    }
    merged
}

/// Builds the all-FINISHED snapshot used when a request's backing resource is already gone.
pub fn synthesize_finished(previous: &[Stage], now: DateTime<Utc>) -> Vec<Stage> {
    previous
        .iter()
        .cloned()
        .map(|mut stage| {
            if stage.state != StageState::Finished {
                stage.state = StageState::Finished;
                stage.finished_at = Some(stage.finished_at.unwrap_or(now));
            }
            stage
        })
        .collect()
}
