use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Stable identity of every state the driver can be in. The kebab-case
/// string form is what gets persisted in state data, so variants must never
/// be renamed.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum StateId {
    Init,
    Idle,
    Authorize,
    AuthorizeWait,
    InventoryUpdate,
    CheckWait,
    UpdateCheck,
    Final,
    UpdateFetch,
    FetchStoreRetry,
    UpdateStore,
    UpdateAfterStore,
    UpdateInstall,
    UpdateReboot,
    UpdateVerifyReboot,
    UpdateAfterReboot,
    UpdateCommit,
    UpdatePreCommitStatusReportRetry,
    UpdateAfterFirstCommit,
    UpdateAfterCommit,
    UpdateRollback,
    UpdateRollbackReboot,
    UpdateVerifyRollbackReboot,
    UpdateAfterRollbackReboot,
    UpdateError,
    UpdateCleanup,
    UpdateStatusReport,
    UpdateStatusReportRetry,
    ReportError,
}

/// Deployment status vocabulary understood by the server.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DeploymentStatus {
    Downloading,
    Installing,
    Rebooting,
    Success,
    Failure,
    AlreadyInstalled,
}

impl DeploymentStatus {
    /// Whether this status ends the deployment.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Success
                | DeploymentStatus::Failure
                | DeploymentStatus::AlreadyInstalled
        )
    }
}

/// Whether the payloads of a deployment can be rolled back, merged across
/// all installed payloads: one payload without rollback support makes the
/// whole deployment unrollbackable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SupportsRollback {
    #[default]
    Unknown,
    Supported,
    NotSupported,
}

impl SupportsRollback {
    pub fn record(&mut self, supported: bool) {
        *self = match (*self, supported) {
            (SupportsRollback::NotSupported, _) | (_, false) => SupportsRollback::NotSupported,
            _ => SupportsRollback::Supported,
        };
    }
}

/// Reboot requirement of a payload, as answered by its installer. Merging
/// across payloads keeps the strongest requirement.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default, Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RebootRequested {
    #[default]
    Unknown,
    No,
    /// The client performs the system reboot itself.
    Automatic,
    /// The payload's installer performs the reboot in its reboot callout.
    Yes,
}

impl RebootRequested {
    /// Parses the output of a `NeedsArtifactReboot` callout.
    pub fn from_output(output: &str) -> Option<Self> {
        match output.trim() {
            "No" => Some(RebootRequested::No),
            "Automatic" => Some(RebootRequested::Automatic),
            "Yes" => Some(RebootRequested::Yes),
            _ => None,
        }
    }

    pub fn merge(&mut self, other: RebootRequested) {
        *self = (*self).max(other);
    }

    pub fn needs_reboot(&self) -> bool {
        matches!(self, RebootRequested::Automatic | RebootRequested::Yes)
    }
}

/// A dependency value: either a single acceptable value or a list of them.
/// Anything else in the artifact header is a schema error, which the
/// untagged deserialization surfaces as a parse failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsValue {
    One(String),
    Many(Vec<String>),
}

impl DependsValue {
    pub fn matches(&self, local: &str) -> bool {
        match self {
            DependsValue::One(v) => v == local,
            DependsValue::Many(vs) => vs.iter().any(|v| v == local),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DependencyError {
    #[error("Artifact depends on '{key}' which this device does not provide")]
    Missing { key: String },

    #[error("Artifact dependency '{key}' not satisfied: device provides '{have}'")]
    Unsatisfied { key: String, have: String },
}

/// Artifact metadata carried in the header and echoed by the server when it
/// offers a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ArtifactInfo {
    pub name: String,

    #[serde(default)]
    pub group: Option<String>,

    #[serde(default)]
    pub compatible_devices: Vec<String>,

    #[serde(default)]
    pub payload_types: Vec<String>,

    #[serde(default)]
    pub provides: HashMap<String, String>,

    #[serde(default)]
    pub depends: HashMap<String, DependsValue>,

    #[serde(default)]
    pub clears_provides: Vec<String>,
}

impl ArtifactInfo {
    pub fn supports_device(&self, device_type: &str) -> bool {
        self.compatible_devices.iter().any(|d| d == device_type)
    }

    /// Checks every dependency against the device type and the locally
    /// recorded provides.
    pub fn check_depends(
        &self,
        device_type: &str,
        provides: &HashMap<String, String>,
    ) -> Result<(), DependencyError> {
        for (key, want) in &self.depends {
            let have = if key == "device_type" {
                device_type
            } else {
                provides
                    .get(key)
                    .ok_or_else(|| DependencyError::Missing { key: key.clone() })?
            };

            if !want.matches(have) {
                return Err(DependencyError::Unsatisfied {
                    key: key.clone(),
                    have: have.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Glob-lite matching used by `clears_provides`: `*` matches any run of
/// characters, everything else is literal.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    fn inner(pattern: &[u8], value: &[u8]) -> bool {
        match (pattern.first(), value.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pattern[1..], value)
                    || (!value.is_empty() && inner(pattern, &value[1..]))
            }
            (Some(p), Some(v)) if p == v => inner(&pattern[1..], &value[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), value.as_bytes())
}

/// The record of one deployment, created by the update check and carried
/// through every update state until cleanup destroys it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub id: String,

    pub artifact: ArtifactInfo,

    /// Where the artifact bytes are fetched from.
    pub uri: String,

    #[serde(default)]
    pub supports_rollback: SupportsRollback,

    #[serde(default)]
    pub needs_reboot: RebootRequested,

    /// Per-payload reboot requirement, in payload order, captured at install.
    #[serde(default)]
    pub reboot_requested: Vec<RebootRequested>,

    /// Times state data has been stored for this deployment. Bounded; the
    /// bound breaking is how reboot loops are detected.
    #[serde(default)]
    pub state_data_store_count: u32,

    /// True while the on-disk state data still carries the previous schema
    /// version for the benefit of older clients.
    #[serde(default)]
    pub has_db_schema_update: bool,
}

impl UpdateInfo {
    pub fn rollback_supported(&self) -> bool {
        self.supports_rollback == SupportsRollback::Supported
    }
}

/// The snapshot persisted before every update-state entry; what `Init`
/// resumes from after a restart, commanded reboot, or crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateData {
    pub version: u32,

    /// State to resume into.
    pub name: StateId,

    pub update_info: UpdateInfo,

    /// Last status dispatched to the server, if any.
    #[serde(default)]
    pub update_status: Option<DeploymentStatus>,
}

/// Terminal verdict of an installation attempt; decides which artifact name
/// is recorded on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum InstallOutcome {
    SuccessfulInstall,
    SuccessfulUncommitted,
    SuccessfulRollback,
    UnsuccessfulInstall,
}

#[cfg(test)]
mod tests {
    use super::*;

    use maplit::hashmap;

    fn depends(entries: Vec<(&str, DependsValue)>) -> ArtifactInfo {
        ArtifactInfo {
            name: "artifact-name".into(),
            depends: entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_state_id_round_trips() {
        for (id, name) in [
            (StateId::UpdateFetch, "update-fetch"),
            (StateId::UpdateVerifyRollbackReboot, "update-verify-rollback-reboot"),
            (
                StateId::UpdatePreCommitStatusReportRetry,
                "update-pre-commit-status-report-retry",
            ),
        ] {
            assert_eq!(id.to_string(), name);
            assert_eq!(serde_json::to_string(&id).unwrap(), format!("\"{name}\""));
            assert_eq!(
                serde_json::from_str::<StateId>(&format!("\"{name}\"")).unwrap(),
                id
            );
        }
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(DeploymentStatus::AlreadyInstalled.to_string(), "already-installed");
        assert_eq!(DeploymentStatus::Downloading.to_string(), "downloading");
        assert!(DeploymentStatus::Failure.is_terminal());
        assert!(!DeploymentStatus::Rebooting.is_terminal());
    }

    #[test]
    fn test_supports_rollback_merge() {
        let mut s = SupportsRollback::Unknown;
        s.record(true);
        assert_eq!(s, SupportsRollback::Supported);
        s.record(false);
        assert_eq!(s, SupportsRollback::NotSupported);
        // NotSupported is sticky.
        s.record(true);
        assert_eq!(s, SupportsRollback::NotSupported);
    }

    #[test]
    fn test_reboot_requested() {
        assert_eq!(
            RebootRequested::from_output("Yes\n"),
            Some(RebootRequested::Yes)
        );
        assert_eq!(RebootRequested::from_output("No"), Some(RebootRequested::No));
        assert_eq!(
            RebootRequested::from_output("Automatic"),
            Some(RebootRequested::Automatic)
        );
        assert_eq!(RebootRequested::from_output("Maybe"), None);

        let mut merged = RebootRequested::No;
        merged.merge(RebootRequested::Automatic);
        assert_eq!(merged, RebootRequested::Automatic);
        merged.merge(RebootRequested::No);
        assert_eq!(merged, RebootRequested::Automatic);
        assert!(merged.needs_reboot());
        assert!(!RebootRequested::No.needs_reboot());
    }

    #[test]
    fn test_depends_list_semantics() {
        let artifact = depends(vec![(
            "k",
            DependsValue::Many(vec!["v1".into(), "v2".into()]),
        )]);

        artifact
            .check_depends("test-device", &hashmap! {"k".to_string() => "v2".to_string()})
            .unwrap();

        let err = artifact
            .check_depends("test-device", &hashmap! {"k".to_string() => "v3".to_string()})
            .unwrap_err();
        assert!(matches!(err, DependencyError::Unsatisfied { .. }));
    }

    #[test]
    fn test_depends_scalar_and_device_type() {
        let artifact = depends(vec![
            ("device_type", DependsValue::One("test-device".into())),
            ("rootfs-image.version", DependsValue::One("v1".into())),
        ]);

        artifact
            .check_depends(
                "test-device",
                &hashmap! {"rootfs-image.version".to_string() => "v1".to_string()},
            )
            .unwrap();

        // Wrong device type.
        artifact
            .check_depends(
                "other-device",
                &hashmap! {"rootfs-image.version".to_string() => "v1".to_string()},
            )
            .unwrap_err();

        // Provide missing entirely.
        let err = artifact
            .check_depends("test-device", &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, DependencyError::Missing { .. }));
    }

    #[test]
    fn test_depends_schema_error() {
        // A number is neither a string nor a list of strings.
        serde_json::from_str::<HashMap<String, DependsValue>>(r#"{"k": 3}"#).unwrap_err();
        serde_json::from_str::<HashMap<String, DependsValue>>(r#"{"k": ["a", 3]}"#).unwrap_err();
        serde_json::from_str::<HashMap<String, DependsValue>>(r#"{"k": ["a", "b"]}"#).unwrap();
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("rootfs-image.*", "rootfs-image.checksum"));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("exact", "exact"));
        assert!(!wildcard_match("rootfs-image.*", "data-partition.version"));
        assert!(!wildcard_match("exact", "exact-no"));
        assert!(wildcard_match("a*c", "abbbc"));
        assert!(!wildcard_match("a*c", "abbb"));
    }

    #[test]
    fn test_state_data_json_shape() {
        let sd = StateData {
            version: 2,
            name: StateId::UpdateInstall,
            update_info: UpdateInfo {
                id: "abcdefg".into(),
                artifact: ArtifactInfo {
                    name: "artifact-name".into(),
                    compatible_devices: vec!["test-device".into()],
                    payload_types: vec!["rootfs-image".into()],
                    ..Default::default()
                },
                uri: "https://updates.example.com/a.haw".into(),
                supports_rollback: SupportsRollback::Supported,
                needs_reboot: RebootRequested::Automatic,
                reboot_requested: vec![RebootRequested::Automatic],
                state_data_store_count: 3,
                has_db_schema_update: false,
            },
            update_status: Some(DeploymentStatus::Installing),
        };

        let json = serde_json::to_string(&sd).unwrap();
        let back: StateData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sd);

        // Fields with defaults may be absent on disk.
        let minimal: StateData = serde_json::from_str(
            r#"{"version":2,"name":"update-fetch","update_info":{"id":"x","artifact":{"name":"a"},"uri":"u"}}"#,
        )
        .unwrap();
        assert_eq!(minimal.name, StateId::UpdateFetch);
        assert_eq!(minimal.update_info.supports_rollback, SupportsRollback::Unknown);
        assert_eq!(minimal.update_info.state_data_store_count, 0);
        assert!(minimal.update_status.is_none());
    }
}
