use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{constants, error::ConfigError};

/// Client configuration, loaded from a JSON file.
///
/// Every field has a default so a minimal configuration only needs the
/// server URL; the unit for all intervals and timeouts is seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Config {
    /// Deployment server base URL.
    pub server_url: Url,

    /// Organization token sent with authentication requests, if any.
    #[serde(default)]
    pub tenant_token: Option<String>,

    /// How often to ask the server for a new deployment.
    #[serde(default = "default_update_poll_interval")]
    pub update_poll_interval_seconds: u64,

    /// How long to wait before retrying a failed server interaction.
    #[serde(default = "default_retry_poll_interval")]
    pub retry_poll_interval_seconds: u64,

    /// Hard deadline for a single HTTP request.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,

    /// Hard deadline for one update-module state callout.
    #[serde(default = "default_module_timeout")]
    pub module_timeout_seconds: u64,

    /// Hard deadline for one transition script.
    #[serde(default = "default_script_timeout")]
    pub state_script_timeout_seconds: u64,

    /// Total budget for a script that keeps asking to be retried.
    #[serde(default = "default_script_retry_timeout")]
    pub state_script_retry_timeout_seconds: u64,

    /// Pause between retries of a script that asked to be retried.
    #[serde(default = "default_script_retry_interval")]
    pub state_script_retry_interval_seconds: u64,

    /// Root filesystem A partition (dual-rootfs layouts).
    #[serde(default)]
    pub rootfs_part_a: Option<PathBuf>,

    /// Root filesystem B partition (dual-rootfs layouts).
    #[serde(default)]
    pub rootfs_part_b: Option<PathBuf>,

    /// Tool used to read the bootloader environment.
    #[serde(default = "default_printenv_tool")]
    pub bootenv_read_tool: PathBuf,

    /// Tool used to write the bootloader environment.
    #[serde(default = "default_setenv_tool")]
    pub bootenv_write_tool: PathBuf,

    /// Command executed to reboot the device when the client owns the reboot.
    #[serde(default = "default_reboot_command")]
    pub reboot_command: PathBuf,

    /// PEM public key used to verify artifact headers; unset disables
    /// signature verification.
    #[serde(default)]
    pub artifact_verify_key: Option<PathBuf>,

    #[serde(default = "default_datastore_path")]
    pub datastore_path: PathBuf,

    #[serde(default = "default_modules_path")]
    pub modules_path: PathBuf,

    #[serde(default = "default_modules_work_path")]
    pub modules_work_path: PathBuf,

    #[serde(default = "default_rootfs_scripts_path")]
    pub rootfs_scripts_path: PathBuf,

    #[serde(default = "default_artifact_scripts_path")]
    pub artifact_scripts_path: PathBuf,

    #[serde(default = "default_deployment_log_path")]
    pub deployment_log_path: PathBuf,

    #[serde(default = "default_artifact_info_path")]
    pub artifact_info_path: PathBuf,

    #[serde(default = "default_device_type_path")]
    pub device_type_path: PathBuf,

    /// Upper bound on state-data stores per deployment before the update is
    /// declared stuck.
    #[serde(default = "default_max_state_data_store_count")]
    pub max_state_data_store_count: u32,
}

fn default_update_poll_interval() -> u64 {
    1800
}

fn default_retry_poll_interval() -> u64 {
    300
}

fn default_http_timeout() -> u64 {
    60
}

fn default_module_timeout() -> u64 {
    4 * 3600
}

fn default_script_timeout() -> u64 {
    3600
}

fn default_script_retry_timeout() -> u64 {
    1800
}

fn default_script_retry_interval() -> u64 {
    60
}

fn default_printenv_tool() -> PathBuf {
    "fw_printenv".into()
}

fn default_setenv_tool() -> PathBuf {
    "fw_setenv".into()
}

fn default_reboot_command() -> PathBuf {
    "reboot".into()
}

fn default_datastore_path() -> PathBuf {
    constants::DEFAULT_DATASTORE_PATH.into()
}

fn default_modules_path() -> PathBuf {
    constants::DEFAULT_MODULES_PATH.into()
}

fn default_modules_work_path() -> PathBuf {
    constants::DEFAULT_MODULES_WORK_PATH.into()
}

fn default_rootfs_scripts_path() -> PathBuf {
    constants::DEFAULT_ROOTFS_SCRIPTS_PATH.into()
}

fn default_artifact_scripts_path() -> PathBuf {
    constants::DEFAULT_ARTIFACT_SCRIPTS_PATH.into()
}

fn default_deployment_log_path() -> PathBuf {
    constants::DEFAULT_DEPLOYMENT_LOG_PATH.into()
}

fn default_artifact_info_path() -> PathBuf {
    constants::DEFAULT_ARTIFACT_INFO_PATH.into()
}

fn default_device_type_path() -> PathBuf {
    constants::DEFAULT_DEVICE_TYPE_PATH.into()
}

fn default_max_state_data_store_count() -> u32 {
    constants::DEFAULT_MAX_STATE_DATA_STORE_COUNT
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn update_poll_interval(&self) -> Duration {
        Duration::from_secs(self.update_poll_interval_seconds)
    }

    pub fn retry_poll_interval(&self) -> Duration {
        Duration::from_secs(self.retry_poll_interval_seconds)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    pub fn module_timeout(&self) -> Duration {
        Duration::from_secs(self.module_timeout_seconds)
    }

    pub fn state_script_timeout(&self) -> Duration {
        Duration::from_secs(self.state_script_timeout_seconds)
    }

    pub fn state_script_retry_timeout(&self) -> Duration {
        Duration::from_secs(self.state_script_retry_timeout_seconds)
    }

    pub fn state_script_retry_interval(&self) -> Duration {
        Duration::from_secs(self.state_script_retry_interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;

    #[test]
    fn test_minimal_config() {
        let config: Config = serde_json::from_str(indoc! {r#"
            {
                "ServerUrl": "https://updates.example.com"
            }
        "#})
        .unwrap();

        assert_eq!(config.server_url.as_str(), "https://updates.example.com/");
        assert_eq!(config.update_poll_interval(), Duration::from_secs(1800));
        assert_eq!(config.retry_poll_interval(), Duration::from_secs(300));
        assert_eq!(config.module_timeout(), Duration::from_secs(4 * 3600));
        assert_eq!(
            config.datastore_path,
            PathBuf::from("/var/lib/hawser/hawser-store.db")
        );
        assert_eq!(config.max_state_data_store_count, 50);
        assert!(config.artifact_verify_key.is_none());
    }

    #[test]
    fn test_full_config() {
        let config: Config = serde_json::from_str(indoc! {r#"
            {
                "ServerUrl": "https://updates.example.com",
                "TenantToken": "token-123",
                "UpdatePollIntervalSeconds": 60,
                "RetryPollIntervalSeconds": 10,
                "RootfsPartA": "/dev/mmcblk0p2",
                "RootfsPartB": "/dev/mmcblk0p3",
                "ModuleTimeoutSeconds": 120,
                "ArtifactVerifyKey": "/etc/hawser/artifact-verify-key.pem"
            }
        "#})
        .unwrap();

        assert_eq!(config.tenant_token.as_deref(), Some("token-123"));
        assert_eq!(config.update_poll_interval(), Duration::from_secs(60));
        assert_eq!(config.rootfs_part_a, Some(PathBuf::from("/dev/mmcblk0p2")));
        assert_eq!(config.module_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_unknown_field_rejected() {
        serde_json::from_str::<Config>(r#"{"ServerUrl": "https://u.example", "Bogus": 1}"#)
            .unwrap_err();
    }

    #[test]
    fn test_missing_server_url_rejected() {
        serde_json::from_str::<Config>("{}").unwrap_err();
    }
}
