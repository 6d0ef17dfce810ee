use std::{
    collections::HashMap,
    io::Write,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{bail, Context, Error};
use log::{debug, trace};

use crate::exe::CommandCheckExt;

/// Access to the small key→value store shared with the bootloader.
///
/// The store carries the A/B handshake variables (`upgrade_available`,
/// `mender_boot_part`, `mender_boot_part_hex`, `bootcount`). Reads of absent
/// keys yield no entry rather than an error; writes of multiple keys must be
/// applied as one batch so a power cut cannot leave the handshake half done.
pub trait BootEnv {
    fn read_env(&self, keys: &[&str]) -> Result<HashMap<String, String>, Error>;
    fn write_env(&self, vars: &[(String, String)]) -> Result<(), Error>;
}

/// Boot environment backed by the U-Boot environment tools.
///
/// Reading shells out to `fw_printenv <key>`; writing stages all variables in
/// a script file handed to `fw_setenv -s`, which updates the environment with
/// a single CRC-protected flash write.
pub struct UBootEnv {
    printenv: PathBuf,
    setenv: PathBuf,
}

impl UBootEnv {
    pub fn new(printenv: impl Into<PathBuf>, setenv: impl Into<PathBuf>) -> Self {
        Self {
            printenv: printenv.into(),
            setenv: setenv.into(),
        }
    }
}

impl BootEnv for UBootEnv {
    fn read_env(&self, keys: &[&str]) -> Result<HashMap<String, String>, Error> {
        let mut env = HashMap::new();

        for key in keys {
            let output = Command::new(&self.printenv)
                .arg(key)
                .output()
                .with_context(|| {
                    format!("Failed to execute '{}'", self.printenv.display())
                })?;
            if !output.status.success() {
                // An unset variable is not an error, the tool just reports it.
                trace!("Boot environment variable '{key}' is not set");
                continue;
            }

            for line in String::from_utf8_lossy(&output.stdout).lines() {
                let Some((name, value)) = line.split_once('=') else {
                    bail!("Unparseable boot environment line: '{line}'");
                };
                if name == *key {
                    env.insert(name.to_string(), value.to_string());
                }
            }
        }

        Ok(env)
    }

    fn write_env(&self, vars: &[(String, String)]) -> Result<(), Error> {
        let mut script = tempfile::NamedTempFile::new()
            .context("Failed to create boot environment script file")?;
        for (key, value) in vars {
            writeln!(script, "{key} {value}")
                .context("Failed to stage boot environment script")?;
        }
        script
            .flush()
            .context("Failed to flush boot environment script")?;

        debug!(
            "Writing boot environment: {}",
            vars.iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(" ")
        );

        Command::new(&self.setenv)
            .arg("-s")
            .arg(script.path())
            .run_and_check()
            .context("Failed to update boot environment")
    }
}

/// Renders the variables of a batch write the way `fw_setenv -s` expects
/// them, one `<key> <value>` pair per line.
pub fn render_script(vars: &[(String, String)]) -> String {
    vars.iter()
        .map(|(k, v)| format!("{k} {v}\n"))
        .collect::<String>()
}

#[cfg(test)]
mod test {
    use super::*;

    use std::os::unix::fs::PermissionsExt;

    use tempfile::TempDir;

    /// Creates stub fw_printenv/fw_setenv tools backed by a plain file of
    /// `key=value` lines under `dir`.
    fn stub_tools(dir: &Path) -> (PathBuf, PathBuf, PathBuf) {
        let env_file = dir.join("uboot.env");
        std::fs::write(&env_file, "").unwrap();

        let printenv = dir.join("fw_printenv");
        std::fs::write(
            &printenv,
            format!(
                "#!/bin/sh\ngrep \"^$1=\" '{}'\n",
                env_file.display()
            ),
        )
        .unwrap();

        let setenv = dir.join("fw_setenv");
        std::fs::write(
            &setenv,
            format!(
                concat!(
                    "#!/bin/sh\n",
                    "[ \"$1\" = -s ] || exit 1\n",
                    "while read -r key value; do\n",
                    "  grep -v \"^$key=\" '{env}' > '{env}.new' || true\n",
                    "  echo \"$key=$value\" >> '{env}.new'\n",
                    "  mv '{env}.new' '{env}'\n",
                    "done < \"$2\"\n",
                ),
                env = env_file.display()
            ),
        )
        .unwrap();

        for tool in [&printenv, &setenv] {
            let mut perms = std::fs::metadata(tool).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(tool, perms).unwrap();
        }

        (printenv, setenv, env_file)
    }

    #[test]
    fn test_render_script() {
        let vars = vec![
            ("upgrade_available".to_string(), "1".to_string()),
            ("bootcount".to_string(), "0".to_string()),
        ];
        assert_eq!(render_script(&vars), "upgrade_available 1\nbootcount 0\n");
    }

    #[test]
    fn test_uboot_roundtrip() {
        let dir = TempDir::new().unwrap();
        let (printenv, setenv, _env_file) = stub_tools(dir.path());
        let env = UBootEnv::new(printenv, setenv);

        // Nothing set yet.
        let read = env.read_env(&["upgrade_available"]).unwrap();
        assert!(read.is_empty());

        env.write_env(&[
            ("upgrade_available".to_string(), "1".to_string()),
            ("mender_boot_part".to_string(), "3".to_string()),
            ("bootcount".to_string(), "0".to_string()),
        ])
        .unwrap();

        let read = env
            .read_env(&["upgrade_available", "mender_boot_part", "bootcount"])
            .unwrap();
        assert_eq!(read["upgrade_available"], "1");
        assert_eq!(read["mender_boot_part"], "3");
        assert_eq!(read["bootcount"], "0");

        // Overwrites replace, absent keys stay absent.
        env.write_env(&[("upgrade_available".to_string(), "0".to_string())])
            .unwrap();
        let read = env
            .read_env(&["upgrade_available", "mender_boot_part_hex"])
            .unwrap();
        assert_eq!(read["upgrade_available"], "0");
        assert!(!read.contains_key("mender_boot_part_hex"));
    }

    #[test]
    fn test_missing_tool() {
        let env = UBootEnv::new("/nonexistent/fw_printenv", "/nonexistent/fw_setenv");
        env.read_env(&["upgrade_available"]).unwrap_err();
        env.write_env(&[("a".to_string(), "b".to_string())])
            .unwrap_err();
    }
}
