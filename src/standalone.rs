use std::{fs::File, io::Read};

use anyhow::{bail, Context, Error};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use hawser_api::{
    config::Config,
    deployment::{ArtifactInfo, InstallOutcome, RebootRequested},
};

use crate::{
    datastore::{self, DataStore, KEY_STANDALONE},
    device::Device,
    installer::{self, PayloadInstaller, StagingSink},
    scripts::ScriptRunner,
};

/// What a standalone install leaves behind so `commit` and `rollback` can
/// finish the job, possibly on the other side of a reboot.
#[derive(Debug, Serialize, Deserialize)]
struct StandaloneState {
    artifact: ArtifactInfo,
    reboot_requested: Vec<RebootRequested>,
}

fn open_source(source: &str, config: &Config) -> Result<Box<dyn Read>, Error> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let response = reqwest::blocking::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .context("Failed to construct HTTP client")?
            .get(source)
            .send()
            .with_context(|| format!("Failed to fetch '{source}'"))?
            .error_for_status()
            .with_context(|| format!("Failed to fetch '{source}'"))?;
        Ok(Box::new(response))
    } else {
        Ok(Box::new(File::open(source).with_context(|| {
            format!("Failed to open artifact '{source}'")
        })?))
    }
}

/// Installs an artifact from a file or URL without a deployment server.
/// Returns the outcome so the CLI can phrase the follow-up instructions.
pub fn install(config: &Config, source: &str) -> Result<InstallOutcome, Error> {
    let store = DataStore::open(&config.datastore_path)?;
    if store.read(KEY_STANDALONE)?.is_some() {
        bail!("A standalone update is already in progress; commit or roll it back first");
    }

    let device = Device::new(config);
    let device_type = device.device_type()?;
    let provides = device.provides(&store)?;
    let scripts = ScriptRunner::new(config);

    let reader = open_source(source, config)?;
    let mut installers: Vec<Box<dyn PayloadInstaller>> = Vec::new();
    let mut sink = StagingSink {
        config,
        scripts: &scripts,
        device_type: &device_type,
        provides: &provides,
        expected_name: None,
        installers: &mut installers,
    };
    let header = crate::artifact::stream(reader, config.artifact_verify_key.as_deref(), &mut sink)
        .context("Failed to stage artifact")?;

    let rollback_supported = installer::probe_supports_rollback(&mut installers)?;

    for installer in installers.iter_mut() {
        if let Err(e) = installer.install_update() {
            warn!("Installation failed: {e:#}");
            return if rollback_supported {
                roll_back_installers(&mut installers)?;
                clean_up(&mut installers);
                Ok(InstallOutcome::SuccessfulRollback)
            } else {
                Err(e.context("installation failed without rollback support"))
            };
        }
    }

    let mut reboot_requested = Vec::with_capacity(installers.len());
    for installer in installers.iter_mut() {
        reboot_requested.push(installer.needs_reboot()?);
    }

    let state = StandaloneState {
        artifact: header.artifact,
        reboot_requested,
    };
    store.write(
        KEY_STANDALONE,
        &serde_json::to_string(&state).context("Failed to serialize standalone state")?,
    )?;

    if state.reboot_requested.iter().any(|r| r.needs_reboot()) {
        info!("Artifact '{}' installed; reboot, then run 'hawser commit'", state.artifact.name);
    } else {
        info!("Artifact '{}' installed; run 'hawser commit' to keep it", state.artifact.name);
    }
    Ok(InstallOutcome::SuccessfulUncommitted)
}

fn load_state(store: &DataStore) -> Result<StandaloneState, Error> {
    let raw = store
        .read(KEY_STANDALONE)?
        .context("No standalone update is in progress")?;
    serde_json::from_str(&raw).context("Failed to parse standalone state")
}

fn restore_installers(
    config: &Config,
    state: &StandaloneState,
) -> Result<Vec<Box<dyn PayloadInstaller>>, Error> {
    installer::restore(config, &state.artifact.payload_types)
}

fn roll_back_installers(installers: &mut [Box<dyn PayloadInstaller>]) -> Result<(), Error> {
    for installer in installers.iter_mut() {
        installer
            .rollback()
            .context("Rollback failed; the device state is undefined")?;
    }
    Ok(())
}

fn clean_up(installers: &mut [Box<dyn PayloadInstaller>]) {
    for installer in installers.iter_mut() {
        if let Err(e) = installer.cleanup() {
            warn!("Cleanup failed: {e:#}");
        }
    }
}

/// Commits the pending standalone update and records the new artifact.
pub fn commit(config: &Config) -> Result<(), Error> {
    let store = DataStore::open(&config.datastore_path)?;
    let state = load_state(&store)?;
    let mut installers = restore_installers(config, &state)?;

    for installer in installers.iter_mut() {
        installer.commit_update().context("Commit failed")?;
    }

    datastore::commit_artifact_data(
        &store,
        &state.artifact.name,
        state.artifact.group.as_deref(),
        &state.artifact.provides,
        &state.artifact.clears_provides,
    )?;
    clean_up(&mut installers);
    store.remove(KEY_STANDALONE)?;

    info!("Artifact '{}' committed", state.artifact.name);
    Ok(())
}

/// Rolls the pending standalone update back to the previous software.
pub fn rollback(config: &Config) -> Result<(), Error> {
    let store = DataStore::open(&config.datastore_path)?;
    let state = load_state(&store)?;
    let mut installers = restore_installers(config, &state)?;

    roll_back_installers(&mut installers)?;
    clean_up(&mut installers);
    store.remove(KEY_STANDALONE)?;

    info!("Rolled back to the previous software");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    use crate::{artifact::writer::ArtifactBuilder, installer::modules::tests as module_tests};

    fn setup(dir: &TempDir, module_body: &str) -> Config {
        let mut config = module_tests::test_config(dir);
        config.datastore_path = dir.path().join("store.db");
        config.device_type_path = dir.path().join("device_type");
        config.artifact_info_path = dir.path().join("artifact_info");
        config.rootfs_scripts_path = dir.path().join("scripts");
        config.artifact_scripts_path = dir.path().join("scripts-artifact");
        std::fs::write(&config.device_type_path, "device_type=test-device\n").unwrap();
        std::fs::write(&config.artifact_info_path, "artifact_name=old_name\n").unwrap();
        module_tests::write_module(dir.path(), "test-module", module_body);
        config
    }

    fn artifact(name: &str) -> Vec<u8> {
        ArtifactBuilder::new(ArtifactInfo {
            name: name.into(),
            compatible_devices: vec!["test-device".into()],
            ..Default::default()
        })
        .payload("test-module", vec![("data.bin", b"abc".to_vec(), false)])
        .build()
        .unwrap()
    }

    #[test]
    fn test_install_then_commit() {
        let dir = TempDir::new().unwrap();
        let config = setup(
            &dir,
            r#"
case "$1" in
    NeedsArtifactReboot) echo "No" ;;
    SupportsRollback) echo "Yes" ;;
esac
exit 0"#,
        );

        let path = dir.path().join("release.hawser");
        std::fs::write(&path, artifact("release-1")).unwrap();

        let outcome = install(&config, path.to_str().unwrap()).unwrap();
        assert_eq!(outcome, InstallOutcome::SuccessfulUncommitted);

        // A second install cannot start while one is pending.
        install(&config, path.to_str().unwrap()).unwrap_err();

        commit(&config).unwrap();
        let store = DataStore::open(&config.datastore_path).unwrap();
        assert_eq!(
            datastore::read_artifact_name(&store).unwrap().as_deref(),
            Some("release-1")
        );
        assert!(store.read(KEY_STANDALONE).unwrap().is_none());

        // Nothing left to commit.
        commit(&config).unwrap_err();
    }

    #[test]
    fn test_install_then_rollback() {
        let dir = TempDir::new().unwrap();
        let config = setup(
            &dir,
            r#"
case "$1" in
    NeedsArtifactReboot) echo "No" ;;
    SupportsRollback) echo "Yes" ;;
esac
exit 0"#,
        );

        let path = dir.path().join("release.hawser");
        std::fs::write(&path, artifact("release-1")).unwrap();

        install(&config, path.to_str().unwrap()).unwrap();
        rollback(&config).unwrap();

        let store = DataStore::open(&config.datastore_path).unwrap();
        assert_eq!(datastore::read_artifact_name(&store).unwrap(), None);
        assert!(store.read(KEY_STANDALONE).unwrap().is_none());
    }

    #[test]
    fn test_failed_install_rolls_back() {
        let dir = TempDir::new().unwrap();
        let config = setup(
            &dir,
            r#"
case "$1" in
    NeedsArtifactReboot) echo "No" ;;
    SupportsRollback) echo "Yes" ;;
    ArtifactInstall) exit 1 ;;
esac
exit 0"#,
        );

        let path = dir.path().join("release.hawser");
        std::fs::write(&path, artifact("release-1")).unwrap();

        let outcome = install(&config, path.to_str().unwrap()).unwrap();
        assert_eq!(outcome, InstallOutcome::SuccessfulRollback);

        // No pending update remains.
        let store = DataStore::open(&config.datastore_path).unwrap();
        assert!(store.read(KEY_STANDALONE).unwrap().is_none());
    }
}
