use const_format::concatcp;

/// Root of all mutable client state.
pub const DATA_DIR: &str = "/var/lib/hawser";

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hawser/hawser.conf";

/// Default sqlite datastore holding state data and the artifact ledger.
pub const DEFAULT_DATASTORE_PATH: &str = concatcp!(DATA_DIR, "/hawser-store.db");

/// Directory holding the installed update modules, one binary per payload type.
pub const DEFAULT_MODULES_PATH: &str = concatcp!(DATA_DIR, "/modules/v3");

/// Scratch space handed to update modules, one sandbox tree per payload.
pub const DEFAULT_MODULES_WORK_PATH: &str = concatcp!(DATA_DIR, "/modules/v3/payloads");

/// Transition scripts installed with the root filesystem (Idle, Sync, Download).
pub const DEFAULT_ROOTFS_SCRIPTS_PATH: &str = "/etc/hawser/scripts";

/// Transition scripts delivered inside the artifact (Artifact*).
pub const DEFAULT_ARTIFACT_SCRIPTS_PATH: &str = concatcp!(DATA_DIR, "/scripts");

/// Per-deployment log files, served to the server on failure.
pub const DEFAULT_DEPLOYMENT_LOG_PATH: &str = DATA_DIR;

/// Manifest naming the artifact the running rootfs was installed from.
pub const DEFAULT_ARTIFACT_INFO_PATH: &str = "/etc/hawser/artifact_info";

/// Manifest naming the device type of this device.
pub const DEFAULT_DEVICE_TYPE_PATH: &str = concatcp!(DATA_DIR, "/device_type");

/// Current schema version of the persisted state data.
pub const STATE_DATA_VERSION: u32 = 2;

/// How many times state data may be stored for one deployment before the
/// client concludes the update is stuck in a loop.
pub const DEFAULT_MAX_STATE_DATA_STORE_COUNT: u32 = 50;

/// Suffix recorded with the artifact name when an update failed after its
/// commit phase began and could not be rolled back.
pub const BROKEN_ARTIFACT_SUFFIX: &str = "_INCONSISTENT";

/// Artifact name reported when no artifact-info manifest exists yet.
pub const UNKNOWN_ARTIFACT_NAME: &str = "unknown";

/// Payload type handled by the built-in dual-rootfs installer.
pub const ROOTFS_IMAGE_PAYLOAD_TYPE: &str = "rootfs-image";

/// Least number of attempts granted to any status/log upload, regardless of
/// how the poll and retry intervals divide.
pub const MIN_SENDING_ATTEMPTS: u32 = 3;

/// Transition-script exit code requesting a later retry of the same script.
pub const SCRIPT_RETRY_EXIT_CODE: i32 = 21;

/// Script-directory format versions this client understands.
pub const SUPPORTED_SCRIPT_VERSIONS: [u32; 2] = [2, 3];

/// Boot environment variable: "1" while an update awaits commit.
pub const BOOTENV_UPGRADE_AVAILABLE: &str = "upgrade_available";

/// Boot environment variable: partition number to boot, decimal.
pub const BOOTENV_BOOT_PART: &str = "mender_boot_part";

/// Boot environment variable: partition number to boot, hex. Some board
/// integrations consume the hex spelling, so both are kept in step.
pub const BOOTENV_BOOT_PART_HEX: &str = "mender_boot_part_hex";

/// Boot environment variable: boot attempt counter, zeroed on enable.
pub const BOOTENV_BOOTCOUNT: &str = "bootcount";
