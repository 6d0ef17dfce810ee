use std::{
    os::unix::process::ExitStatusExt,
    process::{Command, Output},
};

use anyhow::{anyhow, Context, Error};
use log::trace;

use crate::crate_private::Sealed;

/// Describes how a finished process ended, for error messages and logs.
pub fn explain_exit(output: &Output) -> String {
    if let Some(code) = output.status.code() {
        format!("process exited with status: {code}")
    } else if let Some(signal) = output.status.signal() {
        format!("process was terminated by signal: {signal}")
    } else {
        "process exited with unknown status".into()
    }
}

fn collect_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    let mut report = String::with_capacity(stdout.len() + stderr.len() + 20);
    if !stdout.trim().is_empty() {
        report += &format!("stdout:\n{}\n", stdout);
    }
    if !stderr.trim().is_empty() {
        if !report.is_empty() {
            report += "\n";
        }
        report += &format!("stderr:\n{}\n", stderr);
    }

    report
}

/// Extension for `std::process::Command` to run a child to completion and turn
/// unsuccessful exits into contexted errors carrying the captured output.
/// This is a sealed trait, so it cannot be implemented outside of this crate.
pub trait CommandCheckExt: Sealed {
    /// Run the command and fail unless it exits with status zero.
    fn run_and_check(&mut self) -> Result<(), Error>;

    /// Run the command, fail unless it exits with status zero, and return stdout.
    fn output_and_check(&mut self) -> Result<String, Error>;

    /// Render the command line the way it would be typed into a shell.
    fn render(&self) -> String;
}

impl Sealed for Command {}

impl CommandCheckExt for Command {
    fn run_and_check(&mut self) -> Result<(), Error> {
        self.output_and_check().map(|_| ())
    }

    fn output_and_check(&mut self) -> Result<String, Error> {
        let rendered = self.render();
        trace!("Executing '{rendered}'");

        let output = self
            .output()
            .with_context(|| format!("Failed to execute: {rendered}"))?;
        trace!(
            "Executed '{rendered}': {}. Report:\n{}",
            explain_exit(&output),
            collect_output(&output),
        );

        if !output.status.success() {
            let report = collect_output(&output);
            let err = if report.is_empty() {
                anyhow!("(No output was captured)")
            } else {
                anyhow!("Process output:\n{report}")
            };
            return Err(err
                .context(explain_exit(&output))
                .context(format!("Error when running: {rendered}")));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into())
    }

    fn render(&self) -> String {
        if self.get_args().count() == 0 {
            self.get_program().to_string_lossy().into()
        } else {
            format!(
                "{} {}",
                self.get_program().to_string_lossy(),
                self.get_args()
                    .map(|arg| arg.to_string_lossy())
                    .map(|arg| if arg.contains(' ') {
                        format!("'{}'", arg)
                    } else {
                        arg.into()
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        }
    }
}

/// Resolve a program name through PATH, failing with a useful message when the
/// binary is not installed on the host.
pub fn require(program: &str) -> Result<std::path::PathBuf, Error> {
    which::which(program).with_context(|| format!("Failed to find required binary '{program}'"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_run_and_check() {
        let mut cmd = Command::new("echo");
        cmd.arg("something");
        assert_eq!(cmd.output_and_check().unwrap(), "something\n");

        // This command doesnt exist
        let mut cmd = Command::new("nonexistent_command_1234");
        cmd.arg("/nonexistent");
        cmd.run_and_check().unwrap_err();

        // This command should fail
        let mut cmd = Command::new("false");
        cmd.arg("something");
        cmd.run_and_check().unwrap_err();

        // This command should fail and mention the exit status
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exit 123");
        let err = format!("{:#}", cmd.run_and_check().unwrap_err());
        assert!(err.contains("123"), "unexpected error: {err}");
    }

    #[test]
    fn test_render() {
        let mut cmd = Command::new("echo");
        cmd.arg("something");
        assert_eq!(cmd.render(), "echo something");

        let mut cmd = Command::new("echo");
        cmd.arg("something with spaces");
        assert_eq!(cmd.render(), "echo 'something with spaces'");

        let mut cmd = Command::new("echo");
        cmd.arg("a").arg("b").arg("c");
        assert_eq!(cmd.render(), "echo a b c");
    }

    #[test]
    fn test_explain_exit() {
        let output = Command::new("true").output().unwrap();
        assert_eq!(explain_exit(&output), "process exited with status: 0");

        let output = Command::new("false").output().unwrap();
        assert_eq!(explain_exit(&output), "process exited with status: 1");
    }

    #[test]
    fn test_require() {
        require("sh").unwrap();
        require("nonexistent_command_1234").unwrap_err();
    }
}
