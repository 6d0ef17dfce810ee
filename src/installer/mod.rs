use std::{collections::HashMap, io::Read};

use anyhow::{bail, Context, Error};
use log::info;

use hawser_api::{
    config::Config,
    constants::ROOTFS_IMAGE_PAYLOAD_TYPE,
    deployment::RebootRequested,
};

use crate::{
    artifact::{FileEntry, Header, PayloadHeader, PayloadSink},
    scripts::ScriptRunner,
};

pub mod dualrootfs;
pub mod modules;

pub use dualrootfs::DualRootfsInstaller;
pub use modules::ModuleInstaller;

/// One payload's installer, driven through the life cycle of a deployment.
///
/// The download phase is bracketed so installers that need a running
/// consumer (update modules draining named pipes) can hold a child process
/// across the streamed files.
pub trait PayloadInstaller {
    fn payload_type(&self) -> &str;

    fn download_begin(&mut self, files: &[FileEntry]) -> Result<(), Error>;

    fn download_file(&mut self, entry: &FileEntry, reader: &mut dyn Read) -> Result<(), Error>;

    fn download_finish(&mut self) -> Result<(), Error>;

    fn supports_rollback(&mut self) -> Result<bool, Error>;

    fn needs_reboot(&mut self) -> Result<RebootRequested, Error>;

    fn install_update(&mut self) -> Result<(), Error>;

    fn reboot(&mut self) -> Result<(), Error>;

    fn verify_reboot(&mut self) -> Result<(), Error>;

    fn commit_update(&mut self) -> Result<(), Error>;

    fn rollback(&mut self) -> Result<(), Error>;

    fn rollback_reboot(&mut self) -> Result<(), Error>;

    fn verify_rollback_reboot(&mut self) -> Result<(), Error>;

    fn failure(&mut self) -> Result<(), Error>;

    fn cleanup(&mut self) -> Result<(), Error>;
}

/// Builds one installer per payload from a freshly parsed artifact header.
pub fn from_payloads(
    config: &Config,
    payloads: &[PayloadHeader],
) -> Result<Vec<Box<dyn PayloadInstaller>>, Error> {
    payloads
        .iter()
        .enumerate()
        .map(|(index, payload)| new_installer(config, &payload.payload_type, index))
        .collect()
}

/// Rebuilds the installer set from the payload types recorded in state
/// data, after a restart. Update modules find their sandbox trees where the
/// interrupted run left them.
pub fn restore(
    config: &Config,
    payload_types: &[String],
) -> Result<Vec<Box<dyn PayloadInstaller>>, Error> {
    payload_types
        .iter()
        .enumerate()
        .map(|(index, payload_type)| new_installer(config, payload_type, index))
        .collect()
}

fn new_installer(
    config: &Config,
    payload_type: &str,
    index: usize,
) -> Result<Box<dyn PayloadInstaller>, Error> {
    if payload_type == ROOTFS_IMAGE_PAYLOAD_TYPE {
        Ok(Box::new(DualRootfsInstaller::new(config).context(
            "Dual-rootfs payload without a dual-rootfs configuration",
        )?))
    } else {
        Ok(Box::new(ModuleInstaller::new(config, payload_type, index)?))
    }
}

/// Streams an artifact into freshly built installers: validates the header
/// against the expected identity and this device, materializes any artifact
/// scripts, then feeds each payload to its installer. Shared by the
/// server-driven store state and standalone installs.
pub struct StagingSink<'a> {
    pub config: &'a Config,
    pub scripts: &'a ScriptRunner,
    pub device_type: &'a str,
    pub provides: &'a HashMap<String, String>,
    /// Artifact name announced ahead of the download, when there was one.
    pub expected_name: Option<&'a str>,
    pub installers: &'a mut Vec<Box<dyn PayloadInstaller>>,
}

impl PayloadSink for StagingSink<'_> {
    fn header(&mut self, header: &Header) -> Result<(), Error> {
        if let Some(expected) = self.expected_name {
            if header.artifact.name != expected {
                bail!(
                    "Artifact names itself '{}' but the deployment promised '{expected}'",
                    header.artifact.name
                );
            }
        }
        if !header.artifact.supports_device(self.device_type) {
            bail!(
                "Artifact is not compatible with device type '{}'",
                self.device_type
            );
        }
        header
            .artifact
            .check_depends(self.device_type, self.provides)?;

        self.scripts.clear_artifact_scripts()?;
        *self.installers = from_payloads(self.config, &header.payloads)?;

        info!(
            "Artifact '{}' accepted with {} payload(s)",
            header.artifact.name,
            header.payloads.len()
        );
        Ok(())
    }

    fn script(&mut self, name: &str, contents: &[u8]) -> Result<(), Error> {
        self.scripts.install_artifact_script(name, contents)
    }

    fn begin_payload(&mut self, index: usize, payload: &PayloadHeader) -> Result<(), Error> {
        self.installers[index].download_begin(&payload.files)
    }

    fn file(
        &mut self,
        index: usize,
        entry: &FileEntry,
        reader: &mut dyn Read,
    ) -> Result<(), Error> {
        self.installers[index].download_file(entry, reader)
    }

    fn end_payload(&mut self, index: usize) -> Result<(), Error> {
        self.installers[index].download_finish()
    }
}

/// Merged rollback verdict across a set of installers.
pub fn probe_supports_rollback(
    installers: &mut [Box<dyn PayloadInstaller>],
) -> Result<bool, Error> {
    let mut supported = true;
    for installer in installers.iter_mut() {
        if !installer
            .supports_rollback()
            .with_context(|| format!("SupportsRollback probe failed for '{}'", installer.payload_type()))?
        {
            supported = false;
        }
    }
    if installers.is_empty() {
        bail!("No installers to probe for rollback support");
    }
    Ok(supported)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn config(dir: &TempDir, with_rootfs: bool) -> Config {
        let mut value = serde_json::json!({
            "ServerUrl": "https://updates.example.com",
            "ModulesPath": dir.path().join("modules"),
            "ModulesWorkPath": dir.path().join("work"),
        });
        if with_rootfs {
            value["RootfsPartA"] = serde_json::json!(dir.path().join("part2"));
            value["RootfsPartB"] = serde_json::json!(dir.path().join("part3"));
        }
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_dispatch_rootfs_requires_partitions() {
        let dir = TempDir::new().unwrap();
        let payloads = vec![PayloadHeader {
            payload_type: ROOTFS_IMAGE_PAYLOAD_TYPE.into(),
            files: Vec::new(),
        }];

        assert!(from_payloads(&config(&dir, false), &payloads).is_err());

        let installers = from_payloads(&config(&dir, true), &payloads).unwrap();
        assert_eq!(installers.len(), 1);
        assert_eq!(installers[0].payload_type(), ROOTFS_IMAGE_PAYLOAD_TYPE);
    }

    #[test]
    fn test_dispatch_module_requires_binary() {
        let dir = TempDir::new().unwrap();
        let payloads = vec![PayloadHeader {
            payload_type: "custom-installer".into(),
            files: Vec::new(),
        }];

        // No module installed for the payload type.
        assert!(from_payloads(&config(&dir, true), &payloads).is_err());

        let modules = dir.path().join("modules");
        std::fs::create_dir_all(&modules).unwrap();
        std::fs::write(modules.join("custom-installer"), "#!/bin/sh\nexit 0\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(
            modules.join("custom-installer"),
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();

        let installers = restore(&config(&dir, true), &["custom-installer".to_string()]).unwrap();
        assert_eq!(installers[0].payload_type(), "custom-installer");
    }
}
