use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use filebox_channel::MessageError;

/// Pipeline stage a message reached before it was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Hashed,
    Classified,
    Resolved,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Received => "received",
            Self::Hashed => "hashed",
            Self::Classified => "classified",
            Self::Resolved => "resolved",
        })
    }
}

/// Why a message was abandoned.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("malformed message: {0}")]
    Malformed(#[from] MessageError),

    #[error("unable to read '{}': {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("file type '{extension}' of '{}' is not supported", path.display())]
    Unsupported { path: PathBuf, extension: String },

    #[error("unable to rename '{}' to '{}': {source}", from.display(), to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("hash store {operation} failed for hash '{hash}'")]
    Store {
        operation: &'static str,
        hash: String,
    },
}

impl ConsumerError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Malformed(_) => Stage::Received,
            Self::Unreadable { .. } => Stage::Hashed,
            Self::Unsupported { .. } => Stage::Classified,
            Self::Rename { .. } | Self::Store { .. } => Stage::Resolved,
        }
    }

    /// Unsupported file types are routine; everything else is a failure
    /// worth dead-lettering.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}
