//! Error types for pigate-host

use thiserror::Error;

/// Errors raised while driving a collaborator tool.
#[derive(Error, Debug)]
pub enum HostError {
    /// The program could not be spawned at all (usually not installed)
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran but exited unsuccessfully
    #[error("`{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    /// The program's output could not be understood
    #[error("unexpected output from `{command}`: {detail}")]
    UnexpectedOutput { command: String, detail: String },

    /// The requested unit, interface or package does not exist
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    /// Whether the failure means the tool itself is missing from the host.
    pub fn is_missing_tool(&self) -> bool {
        matches!(
            self,
            HostError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}
