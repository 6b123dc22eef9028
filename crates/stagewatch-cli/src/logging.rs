use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_LEVEL_ENV: &str = "STAGEWATCH_LOG_LEVEL";
pub const LOG_DIR_ENV: &str = "STAGEWATCH_LOG_DIR";
pub const DEBUG_ENV: &str = "STAGEWATCH_DEBUG";
pub const SESSION_ID_ENV: &str = "STAGEWATCH_SESSION_ID";

/// Where and how verbosely a run logs. `RUST_LOG` still overrides `level` when set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub log_file: Option<PathBuf>,
    pub session_id: String,
}

impl LogSettings {
    pub fn from_env(debug_flag: bool, log_dir_flag: &str, request_id: &str) -> Self {
        Self::resolve_with(debug_flag, log_dir_flag, request_id, |key| {
            std::env::var(key).ok()
        })
    }

    /// Flags win over the environment; the session id falls back to `<request id>-<pid>`.
    pub fn resolve_with<F>(debug_flag: bool, log_dir_flag: &str, request_id: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_blank = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let debug = debug_flag || non_blank(DEBUG_ENV).map(|v| is_truthy(&v)).unwrap_or(false);
        let level = if debug {
            "debug".to_string()
        } else {
            non_blank(LOG_LEVEL_ENV).unwrap_or_else(|| "info".to_string())
        };
        let session_id = non_blank(SESSION_ID_ENV)
            .unwrap_or_else(|| format!("{request_id}-{}", std::process::id()));
        let log_dir = if log_dir_flag.trim().is_empty() {
            non_blank(LOG_DIR_ENV)
        } else {
            Some(log_dir_flag.to_string())
        };
        let log_file =
            log_dir.map(|dir| PathBuf::from(dir).join(format!("stagewatch-{session_id}.log")));

        Self {
            level,
            log_file,
            session_id,
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Installs the global subscriber: human-readable events on stderr, plus a plain-text copy in
/// the session's log file when one is configured.
pub fn init(settings: &LogSettings) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));
    let (file, file_error) = match settings.log_file.as_deref().map(open_log_file).transpose() {
        Ok(file) => (file, None),
        Err(err) => (None, Some(err)),
    };
    let file_layer = file.map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(Mutex::new(file))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .try_init()
        .context("Failed to install the log subscriber")?;

    if let (Some(path), Some(err)) = (&settings.log_file, file_error) {
        warn!(event = "log_file_error", path = %path.display(), error = %err);
    }
    info!(
        event = "logging_ready",
        session_id = %settings.session_id,
        level = %settings.level,
        log_file = settings.log_file.as_ref().map(|path| path.display().to_string()).unwrap_or_default()
    );
    Ok(())
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}
