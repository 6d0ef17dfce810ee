use std::{
    fs::File,
    os::unix::fs::OpenOptionsExt,
    path::Path,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Error};
use nix::sys::stat::Mode;

const OPEN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Creates a named pipe readable and writable by the owner only.
pub fn create(path: &Path) -> Result<(), Error> {
    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
        .with_context(|| format!("Failed to create named pipe '{}'", path.display()))
}

/// Outcome of waiting for a pipe reader to appear.
#[derive(Debug)]
pub enum WriterHandle {
    /// A reader opened the pipe; writes will reach it.
    Connected(File),
    /// The consumer went away before opening the pipe.
    NoReader,
}

/// Opens a named pipe for writing, waiting up to `timeout` for a reader.
///
/// Opening the write end of a FIFO blocks until a reader exists, so the open
/// is attempted non-blocking and retried while `alive` reports the intended
/// consumer still running. Once connected the descriptor is switched back to
/// blocking so large writes behave normally.
pub fn open_writer(
    path: &Path,
    timeout: Duration,
    mut alive: impl FnMut() -> bool,
) -> Result<WriterHandle, Error> {
    let deadline = Instant::now() + timeout;

    loop {
        match std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Ok(file) => {
                set_blocking(&file)
                    .with_context(|| format!("Failed to configure pipe '{}'", path.display()))?;
                return Ok(WriterHandle::Connected(file));
            }
            // ENXIO: no reader has the pipe open yet.
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                if !alive() {
                    return Ok(WriterHandle::NoReader);
                }
                if Instant::now() >= deadline {
                    anyhow::bail!(
                        "Timed out waiting for a reader on pipe '{}'",
                        path.display()
                    );
                }
                thread::sleep(OPEN_POLL_INTERVAL);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to open pipe '{}'", path.display()))
            }
        }
    }
}

fn set_blocking(file: &File) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    // SAFETY: fd is owned by `file` and stays open across both calls.
    unsafe {
        let flags = libc::fcntl(file.as_raw_fd(), libc::F_GETFL);
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::fcntl(file.as_raw_fd(), libc::F_SETFL, flags & !libc::O_NONBLOCK) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
