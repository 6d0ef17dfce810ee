pub mod artifact;
pub mod cli;
pub mod client;
pub mod controlmap;
pub mod datastore;
pub mod deplog;
pub mod device;
pub mod engine;
pub mod installer;
pub mod scripts;
pub mod standalone;

pub const HAWSER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How a finished daemon run should be reflected in the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Clean idle shutdown.
    Done,
    /// Fatal runtime error.
    Fatal,
}
