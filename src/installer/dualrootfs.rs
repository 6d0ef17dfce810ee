use std::{
    io::{self, Read},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Error};
use log::{debug, info, warn};

use hawser_api::{
    config::Config,
    constants::{
        BOOTENV_BOOTCOUNT, BOOTENV_BOOT_PART, BOOTENV_BOOT_PART_HEX, BOOTENV_UPGRADE_AVAILABLE,
        ROOTFS_IMAGE_PAYLOAD_TYPE,
    },
    deployment::RebootRequested,
};
use osutils::{
    blockdev::{self, BlockDevice},
    bootenv::{BootEnv, UBootEnv},
};

use crate::artifact::FileEntry;

use super::PayloadInstaller;

/// Installs whole rootfs images into the inactive partition of an A/B
/// layout and flips the bootloader handshake variables around reboots.
pub struct DualRootfsInstaller {
    part_a: PathBuf,
    part_b: PathBuf,
    bootenv: Box<dyn BootEnv>,
    /// The payload file being streamed, remembered between download calls.
    image: Option<FileEntry>,
    written: bool,
}

/// Trailing decimal partition number of a device path, e.g. 3 for
/// `/dev/mmcblk0p3`.
fn partition_number(path: &Path) -> Result<u64, Error> {
    let name = path.to_string_lossy();
    let digits: String = name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits
        .parse()
        .with_context(|| format!("Partition path '{name}' carries no partition number"))
}

impl DualRootfsInstaller {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let (Some(part_a), Some(part_b)) = (&config.rootfs_part_a, &config.rootfs_part_b) else {
            bail!("RootfsPartA/RootfsPartB are not configured");
        };

        Ok(Self {
            part_a: part_a.clone(),
            part_b: part_b.clone(),
            bootenv: Box::new(UBootEnv::new(
                &config.bootenv_read_tool,
                &config.bootenv_write_tool,
            )),
            image: None,
            written: false,
        })
    }

    #[cfg(test)]
    pub fn with_bootenv(mut self, bootenv: Box<dyn BootEnv>) -> Self {
        self.bootenv = bootenv;
        self
    }

    fn read_env(&self, keys: &[&str]) -> Result<std::collections::HashMap<String, String>, Error> {
        self.bootenv.read_env(keys)
    }

    /// The partition the bootloader will boot next, per the environment.
    fn boot_partition(&self) -> Result<u64, Error> {
        let env = self.read_env(&[BOOTENV_BOOT_PART])?;
        env.get(BOOTENV_BOOT_PART)
            .context("Boot environment does not name the boot partition")?
            .parse()
            .context("Unparseable boot partition in the boot environment")
    }

    /// The partition that should receive the update: the one the bootloader
    /// is not currently booting.
    fn inactive(&self) -> Result<(PathBuf, u64), Error> {
        let active = self.boot_partition()?;
        let number_a = partition_number(&self.part_a)?;
        let number_b = partition_number(&self.part_b)?;

        if active == number_a {
            Ok((self.part_b.clone(), number_b))
        } else if active == number_b {
            Ok((self.part_a.clone(), number_a))
        } else {
            bail!(
                "Boot partition {active} is neither rootfs partition ({number_a}, {number_b})"
            )
        }
    }

    fn other_partition_number(&self, current: u64) -> Result<u64, Error> {
        let number_a = partition_number(&self.part_a)?;
        let number_b = partition_number(&self.part_b)?;
        if current == number_a {
            Ok(number_b)
        } else {
            Ok(number_a)
        }
    }

    fn upgrade_available(&self) -> Result<bool, Error> {
        Ok(self
            .read_env(&[BOOTENV_UPGRADE_AVAILABLE])?
            .get(BOOTENV_UPGRADE_AVAILABLE)
            .map(|v| v == "1")
            .unwrap_or(false))
    }

    fn write_boot_choice(&self, partition: u64, upgrade_available: bool) -> Result<(), Error> {
        let mut vars = vec![
            (
                BOOTENV_UPGRADE_AVAILABLE.to_string(),
                if upgrade_available { "1" } else { "0" }.to_string(),
            ),
            (BOOTENV_BOOT_PART.to_string(), partition.to_string()),
            (BOOTENV_BOOT_PART_HEX.to_string(), format!("{partition:x}")),
        ];
        if upgrade_available {
            vars.push((BOOTENV_BOOTCOUNT.to_string(), "0".to_string()));
        }
        self.bootenv.write_env(&vars)
    }
}

impl PayloadInstaller for DualRootfsInstaller {
    fn payload_type(&self) -> &str {
        ROOTFS_IMAGE_PAYLOAD_TYPE
    }

    fn download_begin(&mut self, files: &[FileEntry]) -> Result<(), Error> {
        let [image] = files else {
            bail!(
                "A rootfs-image payload must carry exactly one file, got {}",
                files.len()
            );
        };
        self.image = Some(image.clone());
        Ok(())
    }

    fn download_file(&mut self, entry: &FileEntry, reader: &mut dyn Read) -> Result<(), Error> {
        let (target, number) = self.inactive()?;
        info!(
            "Streaming rootfs image '{}' ({} bytes) into '{}' (partition {number})",
            entry.name,
            entry.size,
            target.display()
        );

        let device = BlockDevice::open(&target, entry.size)
            .with_context(|| format!("Failed to open partition '{}'", target.display()))?;
        let mut writer = device.into_writer(
            entry.size,
            0,
            Some(Box::new(|start, end| {
                debug!("Wrote image bytes {start}..{end}");
            })),
        )?;

        io::copy(reader, &mut writer).context("Failed to write rootfs image")?;
        writer.close().context("Failed to finish rootfs image")?;

        blockdev::verify(&target, entry.size, &entry.checksum)
            .context("Written rootfs image failed verification")?;

        self.written = true;
        Ok(())
    }

    fn download_finish(&mut self) -> Result<(), Error> {
        if !self.written {
            bail!("Rootfs payload finished without delivering an image");
        }
        Ok(())
    }

    fn supports_rollback(&mut self) -> Result<bool, Error> {
        Ok(true)
    }

    fn needs_reboot(&mut self) -> Result<RebootRequested, Error> {
        Ok(RebootRequested::Automatic)
    }

    /// Points the bootloader at the freshly written partition, one boot
    /// attempt at a time.
    fn install_update(&mut self) -> Result<(), Error> {
        let (_, number) = self.inactive()?;
        info!("Enabling updated partition {number}");
        self.write_boot_choice(number, true)
    }

    fn reboot(&mut self) -> Result<(), Error> {
        // The client owns the reboot for this payload family.
        Ok(())
    }

    fn verify_reboot(&mut self) -> Result<(), Error> {
        if !self.upgrade_available()? {
            bail!("Bootloader reverted the update before it could be committed");
        }
        // The bootloader booted what the environment told it to; make sure
        // that is one of the managed partitions.
        let booted = self.boot_partition()?;
        self.other_partition_number(booted)?;
        debug!("Running on updated partition {booted}");
        Ok(())
    }

    fn commit_update(&mut self) -> Result<(), Error> {
        if !self.upgrade_available()? {
            bail!("No update is pending commit");
        }
        let booted = self.boot_partition()?;
        info!("Committing partition {booted}");
        self.write_boot_choice(booted, false)
    }

    fn rollback(&mut self) -> Result<(), Error> {
        if !self.upgrade_available()? {
            // Nothing was enabled (or it is already committed); the old
            // partition still boots.
            warn!("Rollback requested with no enabled update, leaving boot choice alone");
            return Ok(());
        }
        let enabled = self.boot_partition()?;
        let old = self.other_partition_number(enabled)?;
        info!("Rolling back to partition {old}");
        self.write_boot_choice(old, false)
    }

    fn rollback_reboot(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn verify_rollback_reboot(&mut self) -> Result<(), Error> {
        if self.upgrade_available()? {
            bail!("Rollback did not clear the upgrade flag");
        }
        Ok(())
    }

    fn failure(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), Error> {
        self.image = None;
        Ok(())
    }
}
