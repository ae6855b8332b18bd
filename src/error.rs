use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// The external collaborator a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collaborator {
    Detector,
    Tracker,
    Sink,
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Collaborator::Detector => "detector",
            Collaborator::Tracker => "tracker",
            Collaborator::Sink => "presentation sink",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot open video source {path:?}: {reason}")]
    SourceUnavailable { path: PathBuf, reason: String },

    #[error("{collaborator} failed: {source:#}")]
    CollaboratorFailure {
        collaborator: Collaborator,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    OpenCv(#[from] opencv::Error),
}

impl Error {
    pub(crate) fn collaborator(collaborator: Collaborator, source: anyhow::Error) -> Self {
        Error::CollaboratorFailure {
            collaborator,
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
