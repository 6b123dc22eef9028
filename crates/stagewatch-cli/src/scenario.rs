use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use stagewatch_core::{
    FetchError, LogChunk, OutputFamily, OutputFetcher, OutputSource, RequestKind, Stage,
    StageFetcher, StageType,
};
use stagewatch_engine::PollingTable;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

/// A scripted backend run, as read from a scenario TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub request: RequestSection,
    #[serde(default)]
    pub polling: PollingTable,
    #[serde(default)]
    pub snapshots: Vec<SnapshotStep>,
    #[serde(default)]
    pub outputs: Vec<OutputScript>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestSection {
    pub id: String,
    #[serde(default)]
    pub kind: Option<RequestKind>,
}

/// One reply of the stage endpoint: a stage list, or a scripted failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnapshotStep {
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub error: Option<ScriptedFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptedFailure {
    NotFound,
    Transport,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputScript {
    pub stage_type: StageType,
    #[serde(default)]
    pub chunks: Vec<ChunkStep>,
}

/// One reply of an output endpoint. `rows` defaults to the cursor plus the chunk's line count.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkStep {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub rows: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Scenario {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let scenario: Scenario = toml::from_str(contents).context("Failed to parse scenario")?;
        Ok(scenario)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        Self::from_toml_str(&contents)
    }
}

impl SnapshotStep {
    fn reply(&self, request_id: &str) -> Result<Vec<Stage>, FetchError> {
        match self.error {
            Some(ScriptedFailure::NotFound) => Err(FetchError::NotFound {
                resource: format!("request {request_id}"),
            }),
            Some(ScriptedFailure::Transport) => {
                Err(FetchError::Transport("scripted transport failure".to_string()))
            }
            None => Ok(self.stages.clone()),
        }
    }
}

impl ChunkStep {
    fn reply(&self, from_row: u64) -> Result<LogChunk, FetchError> {
        if let Some(message) = &self.error {
            return Err(FetchError::Transport(message.clone()));
        }
        let rows = self
            .rows
            .unwrap_or(from_row + self.content.lines().count() as u64);
        Ok(LogChunk::new(self.content.clone(), rows))
    }
}

/// Serves a scenario's replies in order. The stage endpoint repeats its last reply once the
/// script runs out; output endpoints report no new rows.
pub struct ScriptedBackend {
    snapshots: Mutex<VecDeque<SnapshotStep>>,
    last_snapshot: Mutex<Option<SnapshotStep>>,
    outputs: Mutex<HashMap<OutputFamily, VecDeque<ChunkStep>>>,
}

impl ScriptedBackend {
    pub fn new(scenario: &Scenario) -> Self {
        let mut outputs: HashMap<OutputFamily, VecDeque<ChunkStep>> = HashMap::new();
        for script in &scenario.outputs {
            match OutputFamily::resolve(script.stage_type) {
                OutputSource::Supported(family) => {
                    outputs
                        .entry(family)
                        .or_default()
                        .extend(script.chunks.iter().cloned());
                }
                OutputSource::Unsupported(stage_type) => {
                    warn!(event = "scenario_output_ignored", stage_type = %stage_type);
                }
            }
        }
        Self {
            snapshots: Mutex::new(scenario.snapshots.iter().cloned().collect()),
            last_snapshot: Mutex::new(None),
            outputs: Mutex::new(outputs),
        }
    }

    fn next_snapshot(&self) -> SnapshotStep {
        let mut last = self
            .last_snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = self
            .snapshots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        if let Some(step) = next {
            *last = Some(step);
        }
        last.clone().unwrap_or_default()
    }

    fn next_chunk(&self, family: OutputFamily) -> Option<ChunkStep> {
        self.outputs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_mut(&family)
            .and_then(|chunks| chunks.pop_front())
    }
}

#[async_trait]
impl StageFetcher for ScriptedBackend {
    async fn fetch_stages(&self, request_id: &str) -> Result<Vec<Stage>, FetchError> {
        let reply = self.next_snapshot().reply(request_id);
        debug!(event = "scenario_stages_served", request_id = %request_id, ok = reply.is_ok());
        reply
    }
}

#[async_trait]
impl OutputFetcher for ScriptedBackend {
    async fn fetch_output(
        &self,
        family: OutputFamily,
        request_id: &str,
        from_row: u64,
    ) -> Result<LogChunk, FetchError> {
        debug!(
            event = "scenario_output_served",
            request_id = %request_id,
            family = %family,
            from_row = from_row
        );
        match self.next_chunk(family) {
            Some(step) => step.reply(from_row),
            None => Ok(LogChunk::new("", from_row)),
        }
    }
}
