use anyhow::Error;
use log::warn;

use crate::scripts::{Action, ScriptRunner};

/// The transition a state sits inside, naming the scripts that surround it.
///
/// Full transitions fire their `_Enter` scripts when the machine enters a
/// state carrying them and their `_Leave` scripts when it moves on to a
/// state with a different transition. The split `..Enter`/`..Leave` pairs
/// assign the two halves to different states (the download and reboot
/// boundaries both cross a state in the middle, or an entire power cycle),
/// so each half only fires its own action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Idle,
    Sync,
    DownloadEnter,
    DownloadLeave,
    ArtifactInstall,
    ArtifactRebootEnter,
    ArtifactRebootLeave,
    ArtifactCommitEnter,
    ArtifactCommitLeave,
    ArtifactRollback,
    ArtifactRollbackRebootEnter,
    ArtifactRollbackRebootLeave,
    ArtifactFailure,
    Error,
}

impl Transition {
    /// Error transitions swallow script failures and trigger the `Error`
    /// action of the transition they interrupt.
    pub fn is_error(&self) -> bool {
        matches!(self, Transition::ArtifactFailure | Transition::Error)
    }

    /// Script-name base, shared by the split halves.
    fn base(&self) -> Option<&'static str> {
        match self {
            Transition::None | Transition::Error => None,
            Transition::Idle => Some("Idle"),
            Transition::Sync => Some("Sync"),
            Transition::DownloadEnter | Transition::DownloadLeave => Some("Download"),
            Transition::ArtifactInstall => Some("ArtifactInstall"),
            Transition::ArtifactRebootEnter | Transition::ArtifactRebootLeave => {
                Some("ArtifactReboot")
            }
            Transition::ArtifactCommitEnter | Transition::ArtifactCommitLeave => {
                Some("ArtifactCommit")
            }
            Transition::ArtifactRollback => Some("ArtifactRollback"),
            Transition::ArtifactRollbackRebootEnter | Transition::ArtifactRollbackRebootLeave => {
                Some("ArtifactRollbackReboot")
            }
            Transition::ArtifactFailure => Some("ArtifactFailure"),
        }
    }

    /// Scripts to run when the machine enters a state with this transition.
    pub fn enter(&self, scripts: &ScriptRunner) -> Result<(), Error> {
        let Some(base) = self.base() else {
            return Ok(());
        };
        let action = match self {
            // A `.._Leave` transition's whole purpose is to run the Leave
            // scripts of its pair on entry (after the download finished, or
            // on the first boot after a reboot).
            Transition::DownloadLeave
            | Transition::ArtifactRebootLeave
            | Transition::ArtifactCommitLeave
            | Transition::ArtifactRollbackRebootLeave => Action::Leave,
            _ => Action::Enter,
        };
        scripts.execute(base, action, self.is_error())
    }

    /// Scripts to run when the machine moves on to a different transition.
    pub fn leave(&self, scripts: &ScriptRunner) -> Result<(), Error> {
        match self {
            // Split halves carry no trailing action of their own.
            Transition::DownloadEnter
            | Transition::DownloadLeave
            | Transition::ArtifactRebootEnter
            | Transition::ArtifactRebootLeave
            | Transition::ArtifactCommitEnter
            | Transition::ArtifactCommitLeave
            | Transition::ArtifactRollbackRebootEnter
            | Transition::ArtifactRollbackRebootLeave => Ok(()),
            _ => match self.base() {
                Some(base) => scripts.execute(base, Action::Leave, self.is_error()),
                None => Ok(()),
            },
        }
    }

    /// The `Error` action, run instead of Leave when the machine falls into
    /// an error transition. Failures here are logged and swallowed.
    pub fn error(&self, scripts: &ScriptRunner) {
        if let Some(base) = self.base() {
            if let Err(e) = scripts.execute(base, Action::Error, true) {
                warn!("Ignoring {base}_Error script failure: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_transitions() {
        assert!(Transition::ArtifactFailure.is_error());
        assert!(Transition::Error.is_error());
        assert!(!Transition::ArtifactInstall.is_error());
        assert!(!Transition::DownloadLeave.is_error());
    }

    #[test]
    fn test_bases() {
        assert_eq!(Transition::DownloadEnter.base(), Some("Download"));
        assert_eq!(Transition::DownloadLeave.base(), Some("Download"));
        assert_eq!(
            Transition::ArtifactRollbackRebootEnter.base(),
            Some("ArtifactRollbackReboot")
        );
        assert_eq!(Transition::None.base(), None);
        assert_eq!(Transition::Error.base(), None);
    }
}
