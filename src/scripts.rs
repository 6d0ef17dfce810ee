use std::{
    path::{Path, PathBuf},
    process::Command,
    thread,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Error};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;

use hawser_api::{
    config::Config,
    constants::{SCRIPT_RETRY_EXIT_CODE, SUPPORTED_SCRIPT_VERSIONS},
};
use osutils::timeout::run_with_timeout;

lazy_static! {
    /// `<TransitionBase>_<Action>_<NN>` with an optional suffix after a dot.
    static ref SCRIPT_NAME: Regex =
        Regex::new(r"^([A-Za-z]+)_(Enter|Leave|Error)_([0-9]{2})(\..+)?$").unwrap();
}

/// The three hooks of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Enter,
    Leave,
    Error,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Action::Enter => "Enter",
            Action::Leave => "Leave",
            Action::Error => "Error",
        }
    }
}

/// Runs the numbered transition scripts surrounding state changes.
///
/// `Idle`, `Sync` and `Download` scripts ship with the root filesystem;
/// `Artifact*` scripts arrive inside the artifact and live in a directory
/// the store phase repopulates per deployment.
pub struct ScriptRunner {
    rootfs_dir: PathBuf,
    artifact_dir: PathBuf,
    timeout: Duration,
    retry_interval: Duration,
    retry_timeout: Duration,
}

impl ScriptRunner {
    pub fn new(config: &Config) -> Self {
        Self {
            rootfs_dir: config.rootfs_scripts_path.clone(),
            artifact_dir: config.artifact_scripts_path.clone(),
            timeout: config.state_script_timeout(),
            retry_interval: config.state_script_retry_interval(),
            retry_timeout: config.state_script_retry_timeout(),
        }
    }

    /// Empties the artifact script directory ahead of a new deployment.
    pub fn clear_artifact_scripts(&self) -> Result<(), Error> {
        if self.artifact_dir.exists() {
            std::fs::remove_dir_all(&self.artifact_dir)
                .context("Failed to clear artifact script directory")?;
        }
        osutils::files::create_dirs(&self.artifact_dir)
    }

    /// Installs one script delivered inside an artifact.
    pub fn install_artifact_script(&self, name: &str, contents: &[u8]) -> Result<(), Error> {
        use std::os::unix::fs::PermissionsExt;

        if !SCRIPT_NAME.is_match(name) && name != "version" {
            bail!("Artifact carries unrecognized script name '{name}'");
        }

        let path = self.artifact_dir.join(name);
        std::fs::write(&path, contents)
            .with_context(|| format!("Failed to install artifact script '{name}'"))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("Failed to mark artifact script '{name}' executable"))?;
        Ok(())
    }

    /// Runs all scripts for one (transition, action) pair in ascending
    /// order. With `ignore_errors` (the Error action, and error transitions)
    /// script failures are logged and swallowed.
    pub fn execute(
        &self,
        transition_base: &str,
        action: Action,
        ignore_errors: bool,
    ) -> Result<(), Error> {
        let dir = if transition_base.starts_with("Artifact") {
            &self.artifact_dir
        } else {
            &self.rootfs_dir
        };

        let scripts = match self.collect(dir, transition_base, action) {
            Ok(scripts) => scripts,
            Err(e) if ignore_errors => {
                warn!("Ignoring script discovery failure for {transition_base}_{}: {e:#}", action.as_str());
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for script in scripts {
            debug!(
                "Executing state script '{}'",
                script.file_name().unwrap_or_default().to_string_lossy()
            );
            match self.run_one(&script) {
                Ok(()) => {}
                Err(e) if ignore_errors => {
                    warn!(
                        "Ignoring failure of state script '{}': {e:#}",
                        script.display()
                    );
                }
                Err(e) => {
                    return Err(e.context(format!(
                        "State script '{}' failed",
                        script.display()
                    )))
                }
            }
        }
        Ok(())
    }

    /// Finds the scripts for a (transition, action) pair, ordered by their
    /// two-digit sequence number, then name.
    fn collect(
        &self,
        dir: &Path,
        transition_base: &str,
        action: Action,
    ) -> Result<Vec<PathBuf>, Error> {
        if !dir.exists() {
            return Ok(Vec::new());
        }

        self.check_version(dir)?;

        let mut found = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to list script directory '{}'", dir.display()))?
        {
            let entry = entry.context("Failed to list script directory")?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(captures) = SCRIPT_NAME.captures(&name) else {
                continue;
            };
            if &captures[1] == transition_base && &captures[2] == action.as_str() {
                found.push((captures[3].to_string(), entry.path()));
            }
        }

        found.sort();
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    /// A `version` file, when present, must name a supported script format.
    fn check_version(&self, dir: &Path) -> Result<(), Error> {
        let version_file = dir.join("version");
        if !version_file.exists() {
            return Ok(());
        }

        let version: u32 = osutils::files::read_file_trim(&version_file)?
            .parse()
            .context("Unparseable state script version file")?;
        if !SUPPORTED_SCRIPT_VERSIONS.contains(&version) {
            bail!(
                "State script version {version} is not supported (supported: {:?})",
                SUPPORTED_SCRIPT_VERSIONS
            );
        }
        Ok(())
    }

    /// Runs one script, honoring the retry-later exit code until the retry
    /// budget runs out.
    fn run_one(&self, script: &Path) -> Result<(), Error> {
        let retry_deadline = Instant::now() + self.retry_timeout;

        loop {
            let output = run_with_timeout(&mut Command::new(script), self.timeout)
                .context("Failed to run state script")?;

            if output.status.success() {
                return Ok(());
            }

            let stderr = String::from_utf8_lossy(&output.stderr);
            if output.status.code() == Some(SCRIPT_RETRY_EXIT_CODE) {
                if Instant::now() + self.retry_interval >= retry_deadline {
                    bail!("script kept asking to be retried until the retry budget ran out");
                }
                info!(
                    "State script '{}' requested a retry in {:?}",
                    script.display(),
                    self.retry_interval
                );
                thread::sleep(self.retry_interval);
                continue;
            }

            bail!(
                "{}{}",
                osutils::exe::explain_exit(&output),
                if stderr.trim().is_empty() {
                    String::new()
                } else {
                    format!("; stderr: {}", stderr.trim())
                }
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::unix::fs::PermissionsExt;

    use tempfile::TempDir;

    fn runner(dir: &TempDir) -> ScriptRunner {
        ScriptRunner {
            rootfs_dir: dir.path().join("rootfs"),
            artifact_dir: dir.path().join("artifact"),
            timeout: Duration::from_secs(30),
            retry_interval: Duration::from_millis(50),
            retry_timeout: Duration::from_millis(400),
        }
    }

    fn add_script(dir: &Path, name: &str, body: &str) {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_runs_in_order() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir);
        let log = dir.path().join("calls.log");

        // Deliberately created out of order, plus entries that must not run.
        for (name, tag) in [
            ("Download_Enter_10", "second"),
            ("Download_Enter_05", "first"),
            ("Download_Enter_20.sh", "third"),
            ("Download_Leave_00", "leave"),
            ("Sync_Enter_00", "sync"),
            ("README", "readme"),
        ] {
            add_script(
                &dir.path().join("rootfs"),
                name,
                &format!("echo {tag} >> {}", log.display()),
            );
        }

        runner.execute("Download", Action::Enter, false).unwrap();

        let calls = std::fs::read_to_string(&log).unwrap();
        assert_eq!(calls, "first\nsecond\nthird\n");
    }

    #[test]
    fn test_missing_directory_is_fine() {
        let dir = TempDir::new().unwrap();
        runner(&dir).execute("Idle", Action::Enter, false).unwrap();
    }

    #[test]
    fn test_artifact_scripts_live_in_artifact_dir() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir);
        let log = dir.path().join("calls.log");

        runner.clear_artifact_scripts().unwrap();
        runner
            .install_artifact_script(
                "ArtifactInstall_Enter_00",
                format!("#!/bin/sh\necho install >> {}\n", log.display()).as_bytes(),
            )
            .unwrap();

        runner
            .execute("ArtifactInstall", Action::Enter, false)
            .unwrap();
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "install\n");

        // Clearing removes the delivered scripts.
        runner.clear_artifact_scripts().unwrap();
        runner
            .execute("ArtifactInstall", Action::Enter, false)
            .unwrap();
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "install\n");
    }

    #[test]
    fn test_rejects_bogus_artifact_script_name() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir);
        runner.clear_artifact_scripts().unwrap();
        runner
            .install_artifact_script("EvilScript", b"#!/bin/sh\n")
            .unwrap_err();
        runner.install_artifact_script("version", b"3").unwrap();
    }

    #[test]
    fn test_failure_propagates_unless_ignored() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir);
        add_script(&dir.path().join("rootfs"), "Sync_Enter_00", "exit 3");

        let err = runner.execute("Sync", Action::Enter, false).unwrap_err();
        assert!(format!("{err:#}").contains("status: 3"));

        runner.execute("Sync", Action::Enter, true).unwrap();
    }

    #[test]
    fn test_retry_exit_code() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir);
        let counter = dir.path().join("count");

        // Asks for a retry twice, then succeeds.
        add_script(
            &dir.path().join("rootfs"),
            "Idle_Enter_00",
            &format!(
                "c=$(cat {counter} 2>/dev/null || echo 0)\n\
                 echo $((c + 1)) > {counter}\n\
                 [ $c -ge 2 ] || exit 21",
                counter = counter.display()
            ),
        );

        runner.execute("Idle", Action::Enter, false).unwrap();
        assert_eq!(std::fs::read_to_string(&counter).unwrap().trim(), "3");
    }

    #[test]
    fn test_retry_budget_exhausted() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir);
        add_script(&dir.path().join("rootfs"), "Idle_Enter_00", "exit 21");

        let err = runner.execute("Idle", Action::Enter, false).unwrap_err();
        assert!(format!("{err:#}").contains("retry budget"), "{err:#}");
    }

    #[test]
    fn test_unsupported_version_file() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir);
        add_script(&dir.path().join("rootfs"), "Idle_Enter_00", "exit 0");
        std::fs::write(dir.path().join("rootfs/version"), "9").unwrap();

        runner.execute("Idle", Action::Enter, false).unwrap_err();

        std::fs::write(dir.path().join("rootfs/version"), "3").unwrap();
        runner.execute("Idle", Action::Enter, false).unwrap();
    }
}
