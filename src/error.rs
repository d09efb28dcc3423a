use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Error kinds a mapping execution can end in. Kinds coming back from the
/// agent carry its wire code; the rest are produced locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingErrorKind {
    AgentUnreachable,
    AgentTimeout,
    UncInvalidFormat,
    NetworkPathNotFound,
    AccessDenied,
    InvalidCredentials,
    DestinationWriteError,
    SourceNotFound,
    PathTooLong,
    SourceEqualsDestination,
    PathOverlap,
    UnknownAgentError,
}

impl MappingErrorKind {
    pub fn from_agent_code(code: &str) -> Self {
        match code.trim().to_ascii_uppercase().as_str() {
            "AGENT_UNREACHABLE" => Self::AgentUnreachable,
            "AGENT_TIMEOUT" => Self::AgentTimeout,
            "UNC_INVALID_FORMAT" => Self::UncInvalidFormat,
            "NETWORK_PATH_NOT_FOUND" => Self::NetworkPathNotFound,
            "ACCESS_DENIED" => Self::AccessDenied,
            "INVALID_CREDENTIALS" => Self::InvalidCredentials,
            "DESTINATION_WRITE_ERROR" => Self::DestinationWriteError,
            "SOURCE_NOT_FOUND" => Self::SourceNotFound,
            "PATH_TOO_LONG" => Self::PathTooLong,
            "SOURCE_EQUALS_DESTINATION" => Self::SourceEqualsDestination,
            "PATH_OVERLAP" => Self::PathOverlap,
            _ => Self::UnknownAgentError,
        }
    }

    /// Destination-access kinds that make a mapping fail hard when the agent
    /// reports them before any data was transferred.
    pub fn is_fatal_destination(self) -> bool {
        matches!(
            self,
            Self::DestinationWriteError
                | Self::AccessDenied
                | Self::InvalidCredentials
                | Self::NetworkPathNotFound
        )
    }

    /// Kinds that make the whole job pointless to continue: the agent cannot
    /// be reached at all, so no further mapping can be attempted either.
    pub fn aborts_run(self) -> bool {
        matches!(self, Self::AgentUnreachable | Self::AgentTimeout)
    }

    /// Kinds that mean credentials or destination access were refused; a run
    /// that saw one of these skips retention rotation.
    pub fn is_access_error(self) -> bool {
        matches!(self, Self::AccessDenied | Self::InvalidCredentials)
    }

    pub fn user_message(self) -> &'static str {
        match self {
            Self::AgentUnreachable => "backup agent is offline or unreachable",
            Self::AgentTimeout => "backup agent did not answer within the timeout",
            Self::UncInvalidFormat => "network path is not a valid UNC path",
            Self::NetworkPathNotFound => "network path was not found by the agent",
            Self::AccessDenied => "access to the path was denied",
            Self::InvalidCredentials => "the supplied credentials were rejected",
            Self::DestinationWriteError => "the agent could not write to the destination",
            Self::SourceNotFound => "source path does not exist on the host",
            Self::PathTooLong => "a path exceeded the host's length limit",
            Self::SourceEqualsDestination => "source and destination are the same path",
            Self::PathOverlap => "source and destination paths overlap",
            Self::UnknownAgentError => "the agent reported an unrecognized error",
        }
    }

    pub fn as_code(self) -> &'static str {
        match self {
            Self::AgentUnreachable => "AGENT_UNREACHABLE",
            Self::AgentTimeout => "AGENT_TIMEOUT",
            Self::UncInvalidFormat => "UNC_INVALID_FORMAT",
            Self::NetworkPathNotFound => "NETWORK_PATH_NOT_FOUND",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::DestinationWriteError => "DESTINATION_WRITE_ERROR",
            Self::SourceNotFound => "SOURCE_NOT_FOUND",
            Self::PathTooLong => "PATH_TOO_LONG",
            Self::SourceEqualsDestination => "SOURCE_EQUALS_DESTINATION",
            Self::PathOverlap => "PATH_OVERLAP",
            Self::UnknownAgentError => "UNKNOWN_AGENT_ERROR",
        }
    }
}

/// A hard mapping failure. Soft conditions never become a `MappingError`;
/// they are downgraded at the call site into a partial mapping result.
#[derive(Debug, Clone)]
pub struct MappingError {
    pub kind: MappingErrorKind,
    pub message: String,
    /// Target path attached when the failure happened after a backup
    /// directory had already been created; rollback uses it.
    pub path: Option<PathBuf>,
}

impl std::fmt::Display for MappingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_code(), self.message)
    }
}

impl std::error::Error for MappingError {}

impl MappingError {
    pub fn new(kind: MappingErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Errors surfaced to callers of the execution engine.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("job is already running: {0}")]
    JobRunning(String),
    #[error("mapping '{label}' failed")]
    Mapping {
        label: String,
        #[source]
        source: MappingError,
    },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type ExecResult<T> = Result<T, ExecError>;
