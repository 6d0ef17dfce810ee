use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    os::fd::AsRawFd,
    os::unix::fs::FileTypeExt,
    path::{Path, PathBuf},
};

use log::{debug, trace};

use crate::{files, hashing_reader::HashingReader};

/// Smallest chunk the writer will buffer before flushing to stable storage.
const MIN_CHUNK_SIZE: u64 = 1 << 20;

// BLKGETSIZE64 from <linux/fs.h>; not exposed by the `libc` crate.
const BLKGETSIZE64: libc::c_ulong = 0x80081272;

nix::ioctl_read_bad!(ioctl_blkgetsize64, BLKGETSIZE64, u64);
nix::ioctl_read_bad!(ioctl_blksszget, libc::BLKSSZGET, libc::c_int);

// UBI_IOCVOLUP from <mtd/ubi-user.h>: start a volume update of the given
// number of bytes; everything written afterwards replaces the volume payload.
nix::ioctl_write_ptr!(ioctl_ubi_volume_update, b'O', 0, i64);

#[derive(Debug, thiserror::Error)]
pub enum BlockDeviceError {
    #[error("Failed to open '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to probe '{path}': {detail}")]
    Probe { path: PathBuf, detail: String },

    #[error("No space on device: image of {needed} bytes exceeds device size of {available} bytes")]
    NoSpace { needed: u64, available: u64 },

    #[error("Short write: {written} bytes written, image declared {expected} bytes")]
    ShortWrite { written: u64, expected: u64 },

    #[error("Failed to start UBI volume update on '{path}': {source}")]
    UbiUpdate {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("Write to block device failed: {0}")]
    Io(#[from] io::Error),

    #[error("VerificationFailed: image checksum is '{computed}', expected '{expected}'")]
    VerificationFailed { expected: String, computed: String },
}

/// Smallest power-of-two multiple of the sector size that is at least 1 MiB.
pub fn chunk_size_for(sector_size: u64) -> u64 {
    let mut chunk = sector_size.max(1);
    while chunk < MIN_CHUNK_SIZE {
        chunk *= 2;
    }
    chunk
}

/// A raw partition or UBI volume opened for streaming a full image into it.
#[derive(Debug)]
pub struct BlockDevice {
    file: File,
    path: PathBuf,
    size: u64,
    sector_size: u64,
    is_ubi: bool,
}

impl BlockDevice {
    /// Opens the target write-only and probes its geometry. `image_size` is
    /// the declared length of the image about to be streamed; an image larger
    /// than the device is rejected up front, and for UBI volumes the size is
    /// passed to the volume-update ioctl before any byte is written.
    pub fn open(path: &Path, image_size: u64) -> Result<Self, BlockDeviceError> {
        let metadata = std::fs::metadata(path).map_err(|source| BlockDeviceError::Open {
            path: path.into(),
            source,
        })?;
        let is_ubi = metadata.file_type().is_char_device()
            && path.to_string_lossy().starts_with("/dev/ubi");

        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|source| BlockDeviceError::Open {
                path: path.into(),
                source,
            })?;

        let (size, sector_size) = if metadata.file_type().is_block_device() {
            let mut size: u64 = 0;
            let mut sector: libc::c_int = 0;
            // SAFETY: the fd is valid and the kernel fills in the out params.
            unsafe {
                ioctl_blkgetsize64(file.as_raw_fd(), &mut size).map_err(|e| {
                    BlockDeviceError::Probe {
                        path: path.into(),
                        detail: format!("BLKGETSIZE64 failed: {e}"),
                    }
                })?;
                ioctl_blksszget(file.as_raw_fd(), &mut sector).map_err(|e| {
                    BlockDeviceError::Probe {
                        path: path.into(),
                        detail: format!("BLKSSZGET failed: {e}"),
                    }
                })?;
            }
            (size, sector as u64)
        } else if is_ubi {
            (ubi_volume_size(path)?, 512)
        } else {
            // A regular file stands in for a partition, mainly under test.
            (metadata.len(), 512)
        };

        if image_size > size {
            return Err(BlockDeviceError::NoSpace {
                needed: image_size,
                available: size,
            });
        }

        if is_ubi {
            debug!(
                "Starting UBI volume update of {} bytes on '{}'",
                image_size,
                path.display()
            );
            let bytes = image_size as i64;
            // SAFETY: the fd refers to an open UBI volume and `bytes` lives
            // across the call.
            unsafe {
                ioctl_ubi_volume_update(file.as_raw_fd(), &bytes).map_err(|source| {
                    BlockDeviceError::UbiUpdate {
                        path: path.into(),
                        source,
                    }
                })?;
            }
        }

        Ok(Self {
            file,
            path: path.into(),
            size,
            sector_size,
            is_ubi,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn sector_size(&self) -> u64 {
        self.sector_size
    }

    /// Turns the device into a chunked writer for an image of `image_size`
    /// bytes, resuming at byte `offset` of the image. Each completed chunk is
    /// flushed to stable storage and reported through `progress` with its
    /// start and end offsets.
    pub fn into_writer(
        mut self,
        image_size: u64,
        offset: u64,
        progress: Option<Box<dyn FnMut(u64, u64)>>,
    ) -> Result<ImageWriter, BlockDeviceError> {
        let chunk_size = chunk_size_for(self.sector_size);
        if offset > 0 {
            if self.is_ubi {
                return Err(BlockDeviceError::Probe {
                    path: self.path,
                    detail: "UBI volume updates cannot be resumed mid-image".into(),
                });
            }
            self.file.seek(SeekFrom::Start(offset))?;
        }

        trace!(
            "Writing {} bytes to '{}' from offset {} in chunks of {} bytes",
            image_size,
            self.path.display(),
            offset,
            chunk_size
        );

        Ok(ImageWriter {
            file: self.file,
            buf: Vec::with_capacity(chunk_size as usize),
            chunk_size: chunk_size as usize,
            flushed: offset,
            image_size,
            device_size: self.size,
            progress,
        })
    }
}

/// Reads the usable size of a UBI volume from sysfs.
fn ubi_volume_size(path: &Path) -> Result<u64, BlockDeviceError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| BlockDeviceError::Probe {
            path: path.into(),
            detail: "UBI volume path has no device name".into(),
        })?;
    let sysfs = PathBuf::from(format!("/sys/class/ubi/{name}/data_bytes"));
    files::read_file_trim(&sysfs)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| BlockDeviceError::Probe {
            path: path.into(),
            detail: format!("cannot read volume size from '{}'", sysfs.display()),
        })
}

/// Streams an image into an open device, buffering to sector-aligned chunks
/// and syncing after every full chunk so progress survives a power cut.
pub struct ImageWriter {
    file: File,
    buf: Vec<u8>,
    chunk_size: usize,
    flushed: u64,
    image_size: u64,
    device_size: u64,
    progress: Option<Box<dyn FnMut(u64, u64)>>,
}

impl ImageWriter {
    fn flush_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }

        self.file.write_all(&self.buf)?;
        self.file.sync_data()?;

        let start = self.flushed;
        self.flushed += self.buf.len() as u64;
        self.buf.clear();

        if let Some(progress) = self.progress.as_mut() {
            progress(start, self.flushed);
        }
        Ok(())
    }

    /// Total bytes accepted so far, including any resume offset.
    pub fn bytes_written(&self) -> u64 {
        self.flushed + self.buf.len() as u64
    }

    /// Flushes the tail chunk, verifies the full image arrived, and syncs.
    pub fn close(mut self) -> Result<(), BlockDeviceError> {
        self.flush_buffered()?;

        if self.flushed != self.image_size {
            return Err(BlockDeviceError::ShortWrite {
                written: self.flushed,
                expected: self.image_size,
            });
        }

        self.file.sync_all()?;
        Ok(())
    }
}

impl Write for ImageWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.bytes_written() + data.len() as u64 > self.device_size {
            return Err(io::Error::other(BlockDeviceError::NoSpace {
                needed: self.bytes_written() + data.len() as u64,
                available: self.device_size,
            }));
        }

        let mut rest = data;
        while !rest.is_empty() {
            let room = self.chunk_size - self.buf.len();
            let take = room.min(rest.len());
            self.buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.buf.len() == self.chunk_size {
                self.flush_buffered()?;
            }
        }

        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffered()
    }
}

/// Re-reads the first `size` bytes of the device and compares their SHA-256
/// digest with `expected` (lowercase hex).
pub fn verify(path: &Path, size: u64, expected: &str) -> Result<(), BlockDeviceError> {
    let file = File::open(path).map_err(|source| BlockDeviceError::Open {
        path: path.into(),
        source,
    })?;

    let mut reader = HashingReader::new(file.take(size));
    io::copy(&mut reader, &mut io::sink())?;

    if reader.consumed() != size {
        return Err(BlockDeviceError::ShortWrite {
            written: reader.consumed(),
            expected: size,
        });
    }

    let computed = reader.hex_digest();
    if computed != expected.to_lowercase() {
        return Err(BlockDeviceError::VerificationFailed {
            expected: expected.into(),
            computed,
        });
    }
    Ok(())
}
