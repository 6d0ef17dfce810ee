use std::{collections::HashMap, path::Path};

use anyhow::{Context, Error};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use hawser_api::{
    constants::STATE_DATA_VERSION,
    deployment::{wildcard_match, ArtifactInfo, StateData, StateId, UpdateInfo},
};

/// Committed state data: the state that was last entered.
pub const KEY_STATE: &str = "state";

/// Uncommitted state data: the state being transitioned to while a schema
/// migration is still pending on the committed key.
pub const KEY_STATE_UNCOMMITTED: &str = "state-uncommitted";

const KEY_ARTIFACT_NAME: &str = "artifact-name";
const KEY_ARTIFACT_GROUP: &str = "artifact-group";
const KEY_ARTIFACT_PROVIDES: &str = "artifact-provides";

/// Key under which standalone (serverless) installs park their state.
pub const KEY_STANDALONE: &str = "standalone-state";

/// Small persistent key→value store backing state data, the artifact
/// ledger, and standalone installs.
pub struct DataStore {
    db: sqlite::Connection,
}

impl DataStore {
    pub fn open(path: &Path) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create datastore directory")?;
        }

        info!("Loading datastore from {}", path.display());
        let db = sqlite::open(path)
            .with_context(|| format!("Failed to open datastore '{}'", path.display()))?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS keystore (
                key TEXT PRIMARY KEY,
                contents TEXT NOT NULL
            )",
        )
        .context("Failed to initialize datastore")?;

        Ok(Self { db })
    }

    pub fn read(&self, key: &str) -> Result<Option<String>, Error> {
        let mut statement = self
            .db
            .prepare("SELECT contents FROM keystore WHERE key = ?")
            .context("Failed to read datastore (prepare)")?;
        statement
            .bind((1, key))
            .context("Failed to read datastore (bind)")?;

        match statement.next().context("Failed to read datastore")? {
            sqlite::State::Row => Ok(Some(
                statement
                    .read::<String, _>(0)
                    .context("Failed to read datastore row")?,
            )),
            sqlite::State::Done => Ok(None),
        }
    }

    pub fn write(&self, key: &str, contents: &str) -> Result<(), Error> {
        let mut statement = self
            .db
            .prepare("REPLACE INTO keystore (key, contents) VALUES (?, ?)")
            .context("Failed to write datastore (prepare)")?;
        statement
            .bind((1, key))
            .context("Failed to write datastore (bind)")?;
        statement
            .bind((2, contents))
            .context("Failed to write datastore (bind)")?;
        statement.next().context("Failed to write datastore")?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<(), Error> {
        let mut statement = self
            .db
            .prepare("DELETE FROM keystore WHERE key = ?")
            .context("Failed to remove datastore key (prepare)")?;
        statement
            .bind((1, key))
            .context("Failed to remove datastore key (bind)")?;
        statement.next().context("Failed to remove datastore key")?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateDataError {
    /// The bounded store counter overflowed: the update keeps cycling
    /// through states without making progress.
    #[error("update interrupted too many times")]
    StoreCountExceeded,

    /// The committed entry carries a foreign schema version and no usable
    /// uncommitted entry exists to migrate from.
    #[error("state data version {version} cannot be migrated")]
    SchemaMigration {
        version: u32,
        /// Whatever deployment record could be salvaged, so the failure can
        /// still be reported against the right deployment.
        update_info: Option<Box<UpdateInfo>>,
    },

    #[error(transparent)]
    Other(#[from] Error),
}

/// Persists a state-data snapshot using the two-key protocol.
///
/// While a schema migration is pending (`has_db_schema_update`), the
/// committed key keeps the previous schema so an older client can still
/// resume, and the current schema rides on the uncommitted key. Otherwise a
/// single committed write suffices and the uncommitted key is dropped.
///
/// The snapshot is always written, even when the store counter has
/// overflowed; the error return tells the caller to head for the failure
/// path while leaving evidence for the next boot.
pub fn store_state_data(
    store: &DataStore,
    sd: &StateData,
    max_store_count: u32,
) -> Result<(), StateDataError> {
    debug!(
        "Storing state data for state '{}' (store count {})",
        sd.name, sd.update_info.state_data_store_count
    );

    if sd.update_info.has_db_schema_update {
        let legacy = StateDataV1::downgrade(sd);
        store.write(
            KEY_STATE,
            &serde_json::to_string(&legacy).context("Failed to serialize legacy state data")?,
        )?;
        store.write(
            KEY_STATE_UNCOMMITTED,
            &serde_json::to_string(sd).context("Failed to serialize state data")?,
        )?;
    } else {
        store.write(
            KEY_STATE,
            &serde_json::to_string(sd).context("Failed to serialize state data")?,
        )?;
        store.remove(KEY_STATE_UNCOMMITTED)?;
    }

    if sd.update_info.state_data_store_count > max_store_count {
        return Err(StateDataError::StoreCountExceeded);
    }
    Ok(())
}

/// Loads the state-data snapshot to resume from, if any.
///
/// An uncommitted entry that refers to the same deployment as the committed
/// one wins (it is the more recent write of a migration pair); an
/// uncommitted entry for a different deployment is stale and ignored.
pub fn load_state_data(store: &DataStore) -> Result<Option<StateData>, StateDataError> {
    let Some(committed_raw) = store.read(KEY_STATE)? else {
        return Ok(None);
    };

    #[derive(Deserialize)]
    struct Probe {
        version: u32,
    }
    let probe: Probe = serde_json::from_str(&committed_raw)
        .context("Failed to probe state data version")?;

    let uncommitted = match store.read(KEY_STATE_UNCOMMITTED)? {
        Some(raw) => match serde_json::from_str::<StateData>(&raw) {
            Ok(sd) => Some(sd),
            Err(e) => {
                warn!("Ignoring unparseable uncommitted state data: {e}");
                None
            }
        },
        None => None,
    };

    if probe.version == STATE_DATA_VERSION {
        let committed: StateData =
            serde_json::from_str(&committed_raw).context("Failed to parse state data")?;
        match uncommitted {
            Some(unc) if unc.update_info.id == committed.update_info.id => Ok(Some(unc)),
            _ => Ok(Some(committed)),
        }
    } else {
        // Foreign schema on the committed key: resume from the uncommitted
        // entry written alongside it, and remember that the committed key
        // must keep the old schema until the deployment is over.
        let legacy: Option<StateDataV1> = serde_json::from_str(&committed_raw).ok();
        match uncommitted {
            Some(mut unc)
                if legacy
                    .as_ref()
                    .map(|l| l.update_info.id == unc.update_info.id)
                    .unwrap_or(true) =>
            {
                unc.update_info.has_db_schema_update = true;
                Ok(Some(unc))
            }
            _ => Err(StateDataError::SchemaMigration {
                version: probe.version,
                update_info: legacy.map(|l| Box::new(l.upgrade())),
            }),
        }
    }
}

/// Drops both state-data keys. Called once a terminal status has been
/// reported, so no trace of the deployment outlives it.
pub fn remove_state_data(store: &DataStore) -> Result<(), Error> {
    debug!("Removing state data");
    store.remove(KEY_STATE)?;
    store.remove(KEY_STATE_UNCOMMITTED)?;
    Ok(())
}

/// First schema of the persisted snapshot, kept readable (and writable,
/// during migrations) so a client downgrade mid-deployment can still resume.
#[derive(Debug, Serialize, Deserialize)]
struct StateDataV1 {
    version: u32,
    name: StateId,
    update_info: UpdateInfoV1,
}

#[derive(Debug, Serialize, Deserialize)]
struct UpdateInfoV1 {
    id: String,
    artifact_name: String,
    #[serde(default)]
    compatible_devices: Vec<String>,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    state_data_store_count: u32,
}

impl StateDataV1 {
    fn downgrade(sd: &StateData) -> Self {
        Self {
            version: 1,
            name: sd.name,
            update_info: UpdateInfoV1 {
                id: sd.update_info.id.clone(),
                artifact_name: sd.update_info.artifact.name.clone(),
                compatible_devices: sd.update_info.artifact.compatible_devices.clone(),
                uri: sd.update_info.uri.clone(),
                state_data_store_count: sd.update_info.state_data_store_count,
            },
        }
    }

    fn upgrade(self) -> UpdateInfo {
        UpdateInfo {
            id: self.update_info.id,
            artifact: ArtifactInfo {
                name: self.update_info.artifact_name,
                compatible_devices: self.update_info.compatible_devices,
                ..Default::default()
            },
            uri: self.update_info.uri,
            supports_rollback: Default::default(),
            needs_reboot: Default::default(),
            reboot_requested: Vec::new(),
            state_data_store_count: self.update_info.state_data_store_count,
            has_db_schema_update: true,
        }
    }
}

/// Records the artifact the device now runs: name, group, and the provides
/// map with `clears_provides` patterns applied to the previous entries.
pub fn commit_artifact_data(
    store: &DataStore,
    name: &str,
    group: Option<&str>,
    provides: &HashMap<String, String>,
    clears_provides: &[String],
) -> Result<(), Error> {
    let mut merged = read_provides(store)?;
    merged.retain(|key, _| !clears_provides.iter().any(|p| wildcard_match(p, key)));
    merged.extend(provides.iter().map(|(k, v)| (k.clone(), v.clone())));

    store.write(
        KEY_ARTIFACT_PROVIDES,
        &serde_json::to_string(&merged).context("Failed to serialize provides")?,
    )?;
    write_artifact_name(store, name)?;
    match group {
        Some(group) => store.write(KEY_ARTIFACT_GROUP, group)?,
        None => store.remove(KEY_ARTIFACT_GROUP)?,
    }
    Ok(())
}

pub fn write_artifact_name(store: &DataStore, name: &str) -> Result<(), Error> {
    store.write(KEY_ARTIFACT_NAME, name)
}

pub fn read_artifact_name(store: &DataStore) -> Result<Option<String>, Error> {
    store.read(KEY_ARTIFACT_NAME)
}

pub fn read_artifact_group(store: &DataStore) -> Result<Option<String>, Error> {
    store.read(KEY_ARTIFACT_GROUP)
}

pub fn read_provides(store: &DataStore) -> Result<HashMap<String, String>, Error> {
    match store.read(KEY_ARTIFACT_PROVIDES)? {
        Some(raw) => serde_json::from_str(&raw).context("Failed to parse recorded provides"),
        None => Ok(HashMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use maplit::hashmap;
    use tempfile::TempDir;

    use hawser_api::deployment::SupportsRollback;

    fn open_store(dir: &TempDir) -> DataStore {
        DataStore::open(&dir.path().join("store.db")).unwrap()
    }

    fn state_data(id: &str, name: StateId, count: u32) -> StateData {
        StateData {
            version: STATE_DATA_VERSION,
            name,
            update_info: UpdateInfo {
                id: id.into(),
                artifact: ArtifactInfo {
                    name: "artifact-name".into(),
                    ..Default::default()
                },
                uri: "https://updates.example.com/a".into(),
                supports_rollback: SupportsRollback::Unknown,
                needs_reboot: Default::default(),
                reboot_requested: Vec::new(),
                state_data_store_count: count,
                has_db_schema_update: false,
            },
            update_status: None,
        }
    }

    #[test]
    fn test_keystore_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        assert_eq!(store.read("k").unwrap(), None);
        store.write("k", "v1").unwrap();
        assert_eq!(store.read("k").unwrap().as_deref(), Some("v1"));
        store.write("k", "v2").unwrap();
        assert_eq!(store.read("k").unwrap().as_deref(), Some("v2"));
        store.remove("k").unwrap();
        assert_eq!(store.read("k").unwrap(), None);
        // Removing an absent key is fine.
        store.remove("k").unwrap();
    }

    #[test]
    fn test_v2_write_drops_uncommitted() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        // Plant a stale uncommitted entry.
        store
            .write(
                KEY_STATE_UNCOMMITTED,
                &serde_json::to_string(&state_data("stale", StateId::UpdateFetch, 0)).unwrap(),
            )
            .unwrap();

        store_state_data(&store, &state_data("abcdefg", StateId::UpdateInstall, 1), 50).unwrap();

        assert!(store.read(KEY_STATE_UNCOMMITTED).unwrap().is_none());
        let loaded = load_state_data(&store).unwrap().unwrap();
        assert_eq!(loaded.name, StateId::UpdateInstall);
        assert_eq!(loaded.update_info.id, "abcdefg");
    }

    #[test]
    fn test_migration_write_keeps_both_keys() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut sd = state_data("abcdefg", StateId::UpdateCommit, 4);
        sd.update_info.has_db_schema_update = true;
        store_state_data(&store, &sd, 50).unwrap();

        // Committed key holds the legacy schema, uncommitted the current.
        let committed: serde_json::Value =
            serde_json::from_str(&store.read(KEY_STATE).unwrap().unwrap()).unwrap();
        assert_eq!(committed["version"], 1);
        let uncommitted: StateData =
            serde_json::from_str(&store.read(KEY_STATE_UNCOMMITTED).unwrap().unwrap()).unwrap();
        assert_eq!(uncommitted.version, 2);

        // Loading prefers the uncommitted entry and keeps the migration flag.
        let loaded = load_state_data(&store).unwrap().unwrap();
        assert_eq!(loaded.name, StateId::UpdateCommit);
        assert!(loaded.update_info.has_db_schema_update);
    }

    #[test]
    fn test_stale_uncommitted_is_ignored() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store_state_data(&store, &state_data("current", StateId::UpdateFetch, 1), 50).unwrap();
        store
            .write(
                KEY_STATE_UNCOMMITTED,
                &serde_json::to_string(&state_data("other", StateId::UpdateCommit, 9)).unwrap(),
            )
            .unwrap();

        let loaded = load_state_data(&store).unwrap().unwrap();
        assert_eq!(loaded.update_info.id, "current");
        assert_eq!(loaded.name, StateId::UpdateFetch);
    }

    #[test]
    fn test_store_count_bound() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store_state_data(&store, &state_data("abcdefg", StateId::UpdateReboot, 50), 50).unwrap();

        let err =
            store_state_data(&store, &state_data("abcdefg", StateId::UpdateReboot, 51), 50)
                .unwrap_err();
        assert!(matches!(err, StateDataError::StoreCountExceeded));

        // The overflowing snapshot is still on disk for the next boot.
        let loaded = load_state_data(&store).unwrap().unwrap();
        assert_eq!(loaded.update_info.state_data_store_count, 51);
    }

    #[test]
    fn test_foreign_version_without_uncommitted_fails() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store
            .write(
                KEY_STATE,
                r#"{"version":1,"name":"update-install","update_info":{"id":"old-deploy","artifact_name":"art-v1"}}"#,
            )
            .unwrap();

        let err = load_state_data(&store).unwrap_err();
        match err {
            StateDataError::SchemaMigration {
                version,
                update_info,
            } => {
                assert_eq!(version, 1);
                let update = update_info.unwrap();
                assert_eq!(update.id, "old-deploy");
                assert_eq!(update.artifact.name, "art-v1");
                assert!(update.has_db_schema_update);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_remove_state_data() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut sd = state_data("abcdefg", StateId::UpdateStatusReport, 3);
        sd.update_info.has_db_schema_update = true;
        store_state_data(&store, &sd, 50).unwrap();

        remove_state_data(&store).unwrap();
        assert!(load_state_data(&store).unwrap().is_none());
        assert!(store.read(KEY_STATE_UNCOMMITTED).unwrap().is_none());
    }

    #[test]
    fn test_commit_artifact_data() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        commit_artifact_data(
            &store,
            "release-1",
            Some("stable"),
            &hashmap! {
                "rootfs-image.version".to_string() => "release-1".to_string(),
                "rootfs-image.checksum".to_string() => "abc".to_string(),
            },
            &[],
        )
        .unwrap();

        assert_eq!(
            read_artifact_name(&store).unwrap().as_deref(),
            Some("release-1")
        );
        assert_eq!(
            read_artifact_group(&store).unwrap().as_deref(),
            Some("stable")
        );

        // The next artifact clears the old rootfs-image.* provides.
        commit_artifact_data(
            &store,
            "release-2",
            None,
            &hashmap! {
                "rootfs-image.version".to_string() => "release-2".to_string(),
                "data.version".to_string() => "5".to_string(),
            },
            &["rootfs-image.*".to_string()],
        )
        .unwrap();

        let provides = read_provides(&store).unwrap();
        assert_eq!(provides["rootfs-image.version"], "release-2");
        assert_eq!(provides["data.version"], "5");
        assert!(!provides.contains_key("rootfs-image.checksum"));
        assert_eq!(read_artifact_group(&store).unwrap(), None);
    }
}
