use std::{
    io::Read,
    process::{Child, Command, Output, Stdio},
    thread,
    time::{Duration, Instant},
};

use log::{trace, warn};
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};

use crate::exe::CommandCheckExt;

/// How long a child gets to honor SIGTERM before it is killed outright.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// How often the child is polled for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process '{command}' terminated abnormally: did not finish within {timeout:?}")]
    TimedOut { command: String, timeout: Duration },

    #[error("Failed to wait for '{command}': {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut reader) = reader {
            // Read errors leave us with whatever arrived before the failure.
            let _ = reader.read_to_end(&mut buf);
        }
        buf
    })
}

fn terminate(child: &mut Child, rendered: &str) {
    let pid = Pid::from_raw(child.id() as i32);

    warn!("Terminating '{rendered}' (pid {pid})");
    let _ = kill(pid, Signal::SIGTERM);

    let grace_end = Instant::now() + TERM_GRACE;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) if Instant::now() < grace_end => thread::sleep(POLL_INTERVAL),
            _ => break,
        }
    }

    warn!("'{rendered}' survived SIGTERM, killing");
    let _ = child.kill();
    let _ = child.wait();
}

/// Runs a command to completion with a hard deadline, capturing stdout and
/// stderr. A child that outlives the deadline is sent SIGTERM, then SIGKILL
/// after a short grace period, and the call fails with
/// [`ProcessError::TimedOut`]; its side effects must be considered undefined.
pub fn run_with_timeout(command: &mut Command, timeout: Duration) -> Result<Output, ProcessError> {
    let rendered = command.render();
    trace!("Executing '{rendered}' with a {timeout:?} deadline");

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            command: rendered.clone(),
            source,
        })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    terminate(&mut child, &rendered);
                    return Err(ProcessError::TimedOut {
                        command: rendered,
                        timeout,
                    });
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(source) => {
                return Err(ProcessError::Wait {
                    command: rendered,
                    source,
                })
            }
        }
    };

    Ok(Output {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn test_captures_output() {
        let output = run_with_timeout(
            Command::new("sh").arg("-c").arg("echo out; echo err >&2"),
            Duration::from_secs(10),
        )
        .unwrap();

        assert!(output.status.success());
        assert_eq!(output.stdout, b"out\n");
        assert_eq!(output.stderr, b"err\n");
    }

    #[test]
    fn test_propagates_exit_code() {
        let output = run_with_timeout(
            Command::new("sh").arg("-c").arg("exit 42"),
            Duration::from_secs(10),
        )
        .unwrap();

        assert_eq!(output.status.code(), Some(42));
    }

    #[test]
    fn test_kills_on_timeout() {
        let start = Instant::now();
        let err = run_with_timeout(
            Command::new("sleep").arg("30"),
            Duration::from_millis(300),
        )
        .unwrap_err();

        assert!(matches!(err, ProcessError::TimedOut { .. }));
        // Must come back long before the sleep would have finished.
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_reports_signal_exits() {
        let output = run_with_timeout(
            Command::new("sh").arg("-c").arg("kill -9 $$"),
            Duration::from_secs(10),
        )
        .unwrap();

        assert!(!output.status.success());
        assert_eq!(output.status.signal(), Some(9));
    }

    #[test]
    fn test_missing_binary() {
        let err = run_with_timeout(
            &mut Command::new("nonexistent_command_1234"),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
