use std::{
    io::{self, Read},
    path::PathBuf,
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Error};
use log::{debug, info, warn};

use hawser_api::{config::Config, deployment::RebootRequested};
use osutils::{
    exe,
    fifo::{self, WriterHandle},
    timeout::run_with_timeout,
};

use crate::artifact::FileEntry;

use super::PayloadInstaller;

/// How long to wait for a module to open a payload stream before concluding
/// it does not want it.
const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs an external update module through the fixed state-callout contract.
///
/// Every callout executes the module binary with the callout name as its
/// single argument, inside a sandbox tree holding `tmp/`, `streams/` and
/// `files/`. During `Download` the module drains the payload files from
/// named pipes under `streams/`; a module that exits the callout cleanly
/// without consuming them gets the files materialized under `files/`
/// instead.
pub struct ModuleInstaller {
    payload_type: String,
    module: PathBuf,
    work_dir: PathBuf,
    tree: PathBuf,
    timeout: Duration,
    download: Option<DownloadJob>,
}

struct DownloadJob {
    child: Child,
    /// Set once the module exited its Download callout successfully, which
    /// switches the remaining files to the `files/` fallback.
    finished_early: bool,
}

impl ModuleInstaller {
    pub fn new(config: &Config, payload_type: &str, payload_index: usize) -> Result<Self, Error> {
        let module = config.modules_path.join(payload_type);
        if !module.is_file() {
            bail!(
                "No update module installed for payload type '{payload_type}' (looked at '{}')",
                module.display()
            );
        }

        let work_dir = config
            .modules_work_path
            .join(format!("{payload_index:04}"));

        Ok(Self {
            payload_type: payload_type.to_string(),
            module,
            work_dir: work_dir.clone(),
            tree: work_dir.join("tree"),
            timeout: config.module_timeout(),
            download: None,
        })
    }

    fn streams_dir(&self) -> PathBuf {
        self.tree.join("streams")
    }

    fn files_dir(&self) -> PathBuf {
        self.tree.join("files")
    }

    fn prepare_tree(&self) -> Result<(), Error> {
        for dir in ["tmp", "streams", "files"] {
            osutils::files::create_dirs(self.tree.join(dir))?;
        }
        Ok(())
    }

    /// Runs one bounded state callout to completion.
    fn callout(&self, state: &str) -> Result<std::process::Output, Error> {
        // The sandbox is the callout's working directory; make sure it is
        // there even when resuming from a partially cleaned tree.
        self.prepare_tree()?;
        debug!(
            "Calling update module '{}' with state '{state}'",
            self.payload_type
        );

        let mut command = Command::new(&self.module);
        command.arg(state).current_dir(&self.tree);

        let output = run_with_timeout(&mut command, self.timeout)
            .with_context(|| format!("Update module callout '{state}' failed"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "Update module callout '{state}' failed: {}{}",
                exe::explain_exit(&output),
                if stderr.trim().is_empty() {
                    String::new()
                } else {
                    format!("; stderr: {}", stderr.trim())
                }
            );
        }
        Ok(output)
    }

    fn checked_callout(&self, state: &str) -> Result<(), Error> {
        self.callout(state).map(|_| ())
    }

    /// Last non-empty stdout line of a callout, for the probe answers.
    fn probe_callout(&self, state: &str) -> Result<String, Error> {
        let output = self.callout(state)?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .trim()
            .to_string())
    }
}

impl PayloadInstaller for ModuleInstaller {
    fn payload_type(&self) -> &str {
        &self.payload_type
    }

    fn download_begin(&mut self, files: &[FileEntry]) -> Result<(), Error> {
        // A retried download must not inherit the previous attempt's module
        // process or its half-consumed pipes.
        if let Some(mut stale) = self.download.take() {
            let _ = stale.child.kill();
            let _ = stale.child.wait();
        }
        self.prepare_tree()?;

        for entry in files {
            if entry.name.contains('/') {
                bail!("Payload file name '{}' is not a plain name", entry.name);
            }
            let pipe = self.streams_dir().join(&entry.name);
            if pipe.exists() {
                std::fs::remove_file(&pipe)
                    .with_context(|| format!("Failed to replace stale pipe '{}'", pipe.display()))?;
            }
            fifo::create(&pipe)?;
        }

        let log = osutils::files::create_file(self.work_dir.join("download.log"))?;
        let child = Command::new(&self.module)
            .arg("Download")
            .current_dir(&self.tree)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone().context("Failed to clone log handle")?))
            .stderr(Stdio::from(log))
            .spawn()
            .with_context(|| {
                format!("Failed to start update module '{}'", self.module.display())
            })?;

        self.download = Some(DownloadJob {
            child,
            finished_early: false,
        });
        Ok(())
    }

    fn download_file(&mut self, entry: &FileEntry, reader: &mut dyn Read) -> Result<(), Error> {
        let streams_dir = self.streams_dir();
        let files_dir = self.files_dir();
        let job = self
            .download
            .as_mut()
            .context("Download phase is not running")?;

        if !job.finished_early {
            let pipe = streams_dir.join(&entry.name);
            let handle = fifo::open_writer(&pipe, STREAM_OPEN_TIMEOUT, || {
                matches!(job.child.try_wait(), Ok(None))
            })?;

            match handle {
                WriterHandle::Connected(mut writer) => {
                    debug!("Streaming '{}' to the update module", entry.name);
                    io::copy(reader, &mut writer)
                        .with_context(|| format!("Failed to stream '{}'", entry.name))?;
                    return Ok(());
                }
                WriterHandle::NoReader => {
                    // The module exited without opening the stream. A clean
                    // exit means it wants the files materialized instead.
                    let status = job
                        .child
                        .wait()
                        .context("Failed to reap update module")?;
                    if !status.success() {
                        bail!(
                            "Update module Download callout failed before consuming '{}'",
                            entry.name
                        );
                    }
                    info!(
                        "Update module skipped streaming, materializing files under files/"
                    );
                    job.finished_early = true;
                }
            }
        }

        let target = files_dir.join(&entry.name);
        let mut file = osutils::files::create_file(&target)?;
        io::copy(reader, &mut file)
            .with_context(|| format!("Failed to materialize '{}'", entry.name))?;
        Ok(())
    }

    fn download_finish(&mut self) -> Result<(), Error> {
        let Some(mut job) = self.download.take() else {
            return Ok(());
        };

        if job.finished_early {
            return Ok(());
        }

        // Bounded wait for the Download callout to exit.
        let deadline = Instant::now() + self.timeout;
        loop {
            match job.child.try_wait().context("Failed to reap update module")? {
                Some(status) => {
                    if !status.success() {
                        bail!("Update module Download callout exited unsuccessfully");
                    }
                    return Ok(());
                }
                None if Instant::now() >= deadline => {
                    warn!("Update module Download callout timed out, killing");
                    let _ = job.child.kill();
                    let _ = job.child.wait();
                    bail!("Update module Download callout terminated abnormally: timed out");
                }
                None => thread::sleep(Duration::from_millis(50)),
            }
        }
    }

    fn supports_rollback(&mut self) -> Result<bool, Error> {
        match self.probe_callout("SupportsRollback")?.as_str() {
            "Yes" => Ok(true),
            // Silence means no rollback support.
            "No" | "" => Ok(false),
            other => bail!("Update module answered SupportsRollback with '{other}'"),
        }
    }

    fn needs_reboot(&mut self) -> Result<RebootRequested, Error> {
        let answer = self.probe_callout("NeedsArtifactReboot")?;
        RebootRequested::from_output(&answer).with_context(|| {
            format!("Update module answered NeedsArtifactReboot with '{answer}'")
        })
    }

    fn install_update(&mut self) -> Result<(), Error> {
        self.checked_callout("ArtifactInstall")
    }

    fn reboot(&mut self) -> Result<(), Error> {
        self.checked_callout("ArtifactReboot")
    }

    fn verify_reboot(&mut self) -> Result<(), Error> {
        self.checked_callout("ArtifactVerifyReboot")
    }

    fn commit_update(&mut self) -> Result<(), Error> {
        self.checked_callout("ArtifactCommit")
    }

    fn rollback(&mut self) -> Result<(), Error> {
        self.checked_callout("ArtifactRollback")
    }

    fn rollback_reboot(&mut self) -> Result<(), Error> {
        self.checked_callout("ArtifactRollbackReboot")
    }

    fn verify_rollback_reboot(&mut self) -> Result<(), Error> {
        self.checked_callout("ArtifactVerifyRollbackReboot")
    }

    fn failure(&mut self) -> Result<(), Error> {
        self.checked_callout("ArtifactFailure")
    }

    fn cleanup(&mut self) -> Result<(), Error> {
        let result = self.checked_callout("Cleanup");

        // The sandbox goes away regardless of what the module thought of it.
        if self.work_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.work_dir) {
                warn!(
                    "Failed to remove module work directory '{}': {e}",
                    self.work_dir.display()
                );
            }
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::os::unix::fs::PermissionsExt;

    use sha2::{Digest, Sha256};
    use tempfile::TempDir;

    pub(crate) fn write_module(dir: &std::path::Path, payload_type: &str, body: &str) {
        let modules = dir.join("modules");
        std::fs::create_dir_all(&modules).unwrap();
        let path = modules.join(payload_type);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    pub(crate) fn test_config(dir: &TempDir) -> Config {
        serde_json::from_value(serde_json::json!({
            "ServerUrl": "https://updates.example.com",
            "ModulesPath": dir.path().join("modules"),
            "ModulesWorkPath": dir.path().join("work"),
            "ModuleTimeoutSeconds": 30,
        }))
        .unwrap()
    }

    fn entry(name: &str, contents: &[u8]) -> FileEntry {
        FileEntry {
            name: name.into(),
            size: contents.len() as u64,
            checksum: hex::encode(Sha256::digest(contents)),
        }
    }

    #[test]
    fn test_download_through_streams() {
        let dir = TempDir::new().unwrap();
        write_module(
            dir.path(),
            "streamer",
            r#"
case "$1" in
    Download)
        cat streams/data.bin > tmp/received.bin
        ;;
esac
exit 0"#,
        );

        let mut installer = ModuleInstaller::new(&test_config(&dir), "streamer", 0).unwrap();
        let payload = b"streamed payload bytes".to_vec();

        installer.download_begin(&[entry("data.bin", &payload)]).unwrap();
        installer
            .download_file(&entry("data.bin", &payload), &mut &payload[..])
            .unwrap();
        installer.download_finish().unwrap();

        let received =
            std::fs::read(dir.path().join("work/0000/tree/tmp/received.bin")).unwrap();
        assert_eq!(received, payload);
    }

    #[test]
    fn test_download_fallback_to_files() {
        let dir = TempDir::new().unwrap();
        // The module does not read the streams at all.
        write_module(dir.path(), "lazy", "exit 0");

        let mut installer = ModuleInstaller::new(&test_config(&dir), "lazy", 0).unwrap();
        let payload = b"file payload".to_vec();

        installer.download_begin(&[entry("data.bin", &payload)]).unwrap();
        installer
            .download_file(&entry("data.bin", &payload), &mut &payload[..])
            .unwrap();
        installer.download_finish().unwrap();

        let materialized =
            std::fs::read(dir.path().join("work/0000/tree/files/data.bin")).unwrap();
        assert_eq!(materialized, payload);
    }

    #[test]
    fn test_download_failure() {
        let dir = TempDir::new().unwrap();
        write_module(dir.path(), "broken", r#"[ "$1" = Download ] && exit 7; exit 0"#);

        let mut installer = ModuleInstaller::new(&test_config(&dir), "broken", 0).unwrap();
        let payload = b"bytes".to_vec();

        installer.download_begin(&[entry("data.bin", &payload)]).unwrap();
        installer
            .download_file(&entry("data.bin", &payload), &mut &payload[..])
            .unwrap_err();
    }

    #[test]
    fn test_probes() {
        let dir = TempDir::new().unwrap();
        write_module(
            dir.path(),
            "probed",
            r#"
case "$1" in
    NeedsArtifactReboot) echo "Automatic" ;;
    SupportsRollback) echo "Yes" ;;
esac
exit 0"#,
        );

        let mut installer = ModuleInstaller::new(&test_config(&dir), "probed", 0).unwrap();
        assert_eq!(
            installer.needs_reboot().unwrap(),
            RebootRequested::Automatic
        );
        assert!(installer.supports_rollback().unwrap());

        // Silence on SupportsRollback means No; on NeedsArtifactReboot it
        // is a contract violation.
        write_module(dir.path(), "probed", "exit 0");
        assert!(!installer.supports_rollback().unwrap());
        installer.needs_reboot().unwrap_err();

        // Garbage answers are contract violations.
        write_module(dir.path(), "probed", r#"echo "Maybe"; exit 0"#);
        installer.needs_reboot().unwrap_err();
        installer.supports_rollback().unwrap_err();
    }

    #[test]
    fn test_callout_failure_and_signal() {
        let dir = TempDir::new().unwrap();
        write_module(
            dir.path(),
            "flaky",
            r#"
case "$1" in
    ArtifactInstall) exit 2 ;;
    ArtifactCommit) kill -9 $$ ;;
esac
exit 0"#,
        );

        let mut installer = ModuleInstaller::new(&test_config(&dir), "flaky", 0).unwrap();
        installer.prepare_tree().unwrap();

        let err = format!("{:#}", installer.install_update().unwrap_err());
        assert!(err.contains("status: 2"), "{err}");

        let err = format!("{:#}", installer.commit_update().unwrap_err());
        assert!(err.contains("signal"), "{err}");

        installer.verify_reboot().unwrap();
    }

    #[test]
    fn test_callout_timeout_kills_module() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.module_timeout_seconds = 1;
        write_module(dir.path(), "hung", r#"[ "$1" = ArtifactInstall ] && sleep 60; exit 0"#);

        let mut installer = ModuleInstaller::new(&config, "hung", 0).unwrap();
        installer.prepare_tree().unwrap();

        let started = Instant::now();
        let err = format!("{:#}", installer.install_update().unwrap_err());
        assert!(err.contains("terminated abnormally"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn test_cleanup_removes_sandbox() {
        let dir = TempDir::new().unwrap();
        write_module(dir.path(), "tidy", "exit 0");

        let mut installer = ModuleInstaller::new(&test_config(&dir), "tidy", 0).unwrap();
        installer.prepare_tree().unwrap();
        assert!(dir.path().join("work/0000/tree/streams").exists());

        installer.cleanup().unwrap();
        assert!(!dir.path().join("work/0000").exists());
    }
}
