use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::PathBuf,
};

use anyhow::{Context, Error};
use chrono::Utc;
use log::warn;
use serde::{Deserialize, Serialize};

/// How many finished deployment logs are kept around.
const MAX_RETAINED_LOGS: usize = 5;

/// One line of a deployment log, in the shape the server's log endpoint
/// accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

/// Records deployment-scoped log messages to a JSON-lines file per
/// deployment, to be uploaded when a deployment fails.
///
/// This is a scoped resource owned by the state context: states log through
/// it while a deployment is active, and it is disabled again at Idle.
pub struct DeploymentLogManager {
    dir: PathBuf,
    active: Option<(String, File)>,
}

impl DeploymentLogManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            active: None,
        }
    }

    fn log_path(&self, deployment_id: &str) -> PathBuf {
        self.dir.join(format!("deployments.{deployment_id}.log"))
    }

    /// Starts (or resumes, after a restart) logging for a deployment.
    pub fn enable(&mut self, deployment_id: &str) -> Result<(), Error> {
        if let Some((active_id, _)) = &self.active {
            if active_id == deployment_id {
                return Ok(());
            }
        }

        osutils::files::create_dirs(&self.dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(deployment_id))
            .context("Failed to open deployment log")?;
        self.active = Some((deployment_id.to_string(), file));

        self.prune();
        Ok(())
    }

    pub fn disable(&mut self) {
        self.active = None;
    }

    pub fn active_deployment(&self) -> Option<&str> {
        self.active.as_ref().map(|(id, _)| id.as_str())
    }

    /// Appends a message to the active deployment log. Best effort: a full
    /// disk must not take the update down with it.
    pub fn record(&mut self, level: log::Level, message: impl AsRef<str>) {
        let Some((_, file)) = self.active.as_mut() else {
            return;
        };

        let entry = LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_lowercase(),
            message: message.as_ref().to_string(),
        };
        match serde_json::to_string(&entry) {
            Ok(line) => {
                if let Err(e) = writeln!(file, "{line}") {
                    warn!("Failed to append to deployment log: {e}");
                }
            }
            Err(e) => warn!("Failed to serialize deployment log entry: {e}"),
        }
    }

    /// All recorded entries for a deployment, for the log uploader.
    pub fn entries(&self, deployment_id: &str) -> Result<Vec<LogEntry>, Error> {
        let path = self.log_path(deployment_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let contents =
            std::fs::read_to_string(&path).context("Failed to read deployment log")?;
        let mut entries = Vec::new();
        for line in contents.lines() {
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                // A line torn by power loss is dropped, not fatal.
                Err(e) => warn!("Skipping damaged deployment log line: {e}"),
            }
        }
        Ok(entries)
    }

    /// Keeps the newest logs, drops the rest.
    fn prune(&self) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };

        let mut logs: Vec<(std::time::SystemTime, PathBuf)> = entries
            .flatten()
            .filter(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.starts_with("deployments.") && name.ends_with(".log")
            })
            .filter_map(|e| {
                let modified = e.metadata().ok()?.modified().ok()?;
                Some((modified, e.path()))
            })
            .collect();

        if logs.len() <= MAX_RETAINED_LOGS {
            return;
        }

        logs.sort();
        for (_, path) in &logs[..logs.len() - MAX_RETAINED_LOGS] {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Failed to prune old deployment log '{}': {e}", path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    #[test]
    fn test_record_and_read_back() {
        let dir = TempDir::new().unwrap();
        let mut logs = DeploymentLogManager::new(dir.path());

        // Nothing recorded while disabled.
        logs.record(log::Level::Info, "ignored");

        logs.enable("abcdefg").unwrap();
        logs.record(log::Level::Info, "downloading artifact");
        logs.record(log::Level::Error, "install failed");
        logs.disable();

        let entries = logs.entries("abcdefg").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, "info");
        assert_eq!(entries[0].message, "downloading artifact");
        assert_eq!(entries[1].level, "error");

        assert!(logs.entries("other").unwrap().is_empty());
    }

    #[test]
    fn test_enable_is_idempotent_and_resumes() {
        let dir = TempDir::new().unwrap();
        let mut logs = DeploymentLogManager::new(dir.path());

        logs.enable("abcdefg").unwrap();
        logs.record(log::Level::Info, "before restart");
        logs.enable("abcdefg").unwrap();
        logs.record(log::Level::Info, "after restart");

        assert_eq!(logs.entries("abcdefg").unwrap().len(), 2);
    }

    #[test]
    fn test_prunes_old_logs() {
        let dir = TempDir::new().unwrap();
        let mut logs = DeploymentLogManager::new(dir.path());

        for i in 0..(MAX_RETAINED_LOGS + 3) {
            logs.enable(&format!("deploy-{i}")).unwrap();
            logs.record(log::Level::Info, "hello");
            logs.disable();
        }

        let count = std::fs::read_dir(dir.path()).unwrap().count();
        assert!(count <= MAX_RETAINED_LOGS + 1, "kept {count} logs");
    }
}
