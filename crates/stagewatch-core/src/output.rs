use crate::StageType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Line appended to a tail buffer in place of the output a failed fetch would have returned.
pub const LOGGING_ERROR_MARKER: &str = "[LOGGING ERROR]: Failed to refresh logs.\n";

/// One incremental read of a stage's text output.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogChunk {
    pub content: String,
    /// Total rows available once this chunk is consumed; the offset for the next read.
    pub rows: u64,
}

impl LogChunk {
    pub fn new(content: impl Into<String>, rows: u64) -> Self {
        Self {
            content: content.into(),
            rows,
        }
    }
}

/// Accumulated output of one tail binding. Content is only ever appended and `rows` never
/// decreases until [`LogCursor::reset`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogCursor {
    content: String,
    rows: u64,
}

impl LogCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn has_fetched_rows(&self) -> bool {
        self.rows > 0
    }

    /// Returns true when the visible content changed.
    pub fn append(&mut self, chunk: LogChunk) -> bool {
        self.rows = self.rows.max(chunk.rows);
        if chunk.content.is_empty() {
            return false;
        }
        self.content.push_str(&chunk.content);
        true
    }

    pub fn append_marker(&mut self, marker: &str) {
        if !self.content.is_empty() && !self.content.ends_with('\n') {
            self.content.push('\n');
        }
        self.content.push_str(marker);
    }

    pub fn reset(&mut self) {
        self.content.clear();
        self.rows = 0;
    }
}

/// Backend resource family serving text output for a kind of stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutputFamily {
    Infrastructure,
    Networking,
    User,
}

impl OutputFamily {
    pub fn resolve(stage_type: StageType) -> OutputSource {
        match stage_type {
            StageType::InfraProvisioning => OutputSource::Supported(OutputFamily::Infrastructure),
            StageType::NetworkingConfig => OutputSource::Supported(OutputFamily::Networking),
            StageType::UserConfig => OutputSource::Supported(OutputFamily::User),
            StageType::Unknown => OutputSource::Unsupported(stage_type),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFamily::Infrastructure => "infrastructure",
            OutputFamily::Networking => "networking",
            OutputFamily::User => "user",
        }
    }
}

impl fmt::Display for OutputFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Supported(OutputFamily),
    Unsupported(StageType),
}

impl OutputSource {
    /// Text shown instead of a tail when no output family serves the stage kind.
    pub fn fallback_text(stage_type: StageType) -> String {
        format!("No output is available for stages of kind {stage_type}.\n")
    }
}
