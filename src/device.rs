use std::{collections::HashMap, path::PathBuf};

use anyhow::{Context, Error};

use hawser_api::{config::Config, constants::UNKNOWN_ARTIFACT_NAME};

use crate::datastore::{self, DataStore};

/// Identity of the device this client runs on: its device type and the
/// artifact it currently runs, assembled from the manifests and the
/// datastore ledger.
#[derive(Debug, Clone)]
pub struct Device {
    device_type_path: PathBuf,
    artifact_info_path: PathBuf,
}

impl Device {
    pub fn new(config: &Config) -> Self {
        Self {
            device_type_path: config.device_type_path.clone(),
            artifact_info_path: config.artifact_info_path.clone(),
        }
    }

    pub fn device_type(&self) -> Result<String, Error> {
        osutils::manifest::load_key(&self.device_type_path, "device_type")
            .context("Failed to determine device type")
    }

    /// Name of the currently installed artifact. The datastore ledger wins
    /// (it tracks every committed update); the artifact-info manifest covers
    /// factory images that were never updated.
    pub fn artifact_name(&self, store: &DataStore) -> Result<String, Error> {
        if let Some(name) = datastore::read_artifact_name(store)? {
            return Ok(name);
        }
        match osutils::manifest::load_key(&self.artifact_info_path, "artifact_name") {
            Ok(name) => Ok(name),
            Err(_) => Ok(UNKNOWN_ARTIFACT_NAME.to_string()),
        }
    }

    /// Everything this device provides for dependency matching.
    pub fn provides(&self, store: &DataStore) -> Result<HashMap<String, String>, Error> {
        let mut provides = datastore::read_provides(store)?;
        provides.insert("artifact_name".to_string(), self.artifact_name(store)?);
        if let Some(group) = datastore::read_artifact_group(store)? {
            provides.insert("artifact_group".to_string(), group);
        }
        Ok(provides)
    }
}
