use crate::output::{LogChunk, OutputFamily};
use crate::paging::{Page, PageRequest};
use crate::Stage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("resource not found: {resource}")]
    NotFound { resource: String },
    #[error("backend responded with status {code}: {message}")]
    Status { code: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        match self {
            FetchError::NotFound { .. } => true,
            FetchError::Status { code, .. } => *code == 404,
            FetchError::Transport(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Polling pauses until an explicit retry.
    Transient,
    /// The backing resource is gone, which is the expected end state.
    CompletedByAbsence,
}

pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &FetchError) -> FailureDisposition;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PauseOnError;

impl ErrorClassifier for PauseOnError {
    fn classify(&self, _error: &FetchError) -> FailureDisposition {
        FailureDisposition::Transient
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupAware;

impl ErrorClassifier for CleanupAware {
    fn classify(&self, error: &FetchError) -> FailureDisposition {
        if error.is_not_found() {
            FailureDisposition::CompletedByAbsence
        } else {
            FailureDisposition::Transient
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    #[default]
    Allocation,
    Cleanup,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Allocation => "allocation",
            RequestKind::Cleanup => "cleanup",
        }
    }

    pub fn classifier(&self) -> Arc<dyn ErrorClassifier> {
        match self {
            RequestKind::Allocation => Arc::new(PauseOnError),
            RequestKind::Cleanup => Arc::new(CleanupAware),
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "allocation" | "alloc" => Ok(RequestKind::Allocation),
            "cleanup" => Ok(RequestKind::Cleanup),
            other => Err(format!("Unknown request kind: {other}")),
        }
    }
}

#[async_trait]
pub trait StageFetcher: Send + Sync {
    async fn fetch_stages(&self, request_id: &str) -> Result<Vec<Stage>, FetchError>;
}

#[async_trait]
pub trait OutputFetcher: Send + Sync {
    async fn fetch_output(
        &self,
        family: OutputFamily,
        request_id: &str,
        from_row: u64,
    ) -> Result<LogChunk, FetchError>;
}

#[async_trait]
pub trait PageFetcher<T>: Send + Sync {
    async fn fetch_page(&self, stage: &Stage, request: &PageRequest)
        -> Result<Page<T>, FetchError>;
}
