//! Wire format for file events: `"<kind> <path>"`.
//!
//! The kind never contains a space, so decoding splits on the first space
//! only and everything after it is the path, spaces included.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("empty message body")]
    Empty,
    #[error("message '{0}' carries no path")]
    MissingPath(String),
    #[error("unrecognised event kind '{0}'")]
    UnknownKind(String),
}

/// Filesystem mutation category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Deleted,
    Moved,
    Modified,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Deleted => "deleted",
            Self::Moved => "moved",
            Self::Modified => "modified",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "deleted" => Some(Self::Deleted),
            "moved" => Some(Self::Moved),
            "modified" => Some(Self::Modified),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed file lifecycle event.  Never describes a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub kind: EventKind,
    pub path: PathBuf,
}

impl FileEvent {
    pub fn new(kind: EventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn encode(&self) -> String {
        format!("{} {}", self.kind, self.path.display())
    }

    pub fn decode(body: &str) -> Result<Self, MessageError> {
        let body = body.trim_end_matches(['\r', '\n']);
        if body.trim().is_empty() {
            return Err(MessageError::Empty);
        }
        let (kind, path) = body
            .split_once(' ')
            .ok_or_else(|| MessageError::MissingPath(body.to_string()))?;
        let kind = EventKind::parse(kind).ok_or_else(|| MessageError::UnknownKind(kind.to_string()))?;
        if path.is_empty() {
            return Err(MessageError::MissingPath(body.to_string()));
        }
        Ok(Self::new(kind, path))
    }
}

impl fmt::Display for FileEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_kind_then_path() {
        let event = FileEvent::new(EventKind::Created, "/home/user/Downloads/a.txt");
        assert_eq!(event.encode(), "created /home/user/Downloads/a.txt");
    }

    #[test]
    fn decode_keeps_spaces_in_path() {
        let event = FileEvent::decode("moved /srv/in/quarterly report v2.xlsx").unwrap();
        assert_eq!(event.kind, EventKind::Moved);
        assert_eq!(event.path, PathBuf::from("/srv/in/quarterly report v2.xlsx"));
    }

    #[test]
    fn decode_strips_trailing_newline() {
        let event = FileEvent::decode("deleted /tmp/a.txt\n").unwrap();
        assert_eq!(event, FileEvent::new(EventKind::Deleted, "/tmp/a.txt"));
    }

    #[test]
    fn decode_rejects_malformed_bodies() {
        assert_eq!(FileEvent::decode(""), Err(MessageError::Empty));
        assert_eq!(FileEvent::decode("   "), Err(MessageError::Empty));
        assert_eq!(
            FileEvent::decode("created"),
            Err(MessageError::MissingPath("created".to_string()))
        );
        assert_eq!(
            FileEvent::decode("closed /tmp/a.txt"),
            Err(MessageError::UnknownKind("closed".to_string()))
        );
    }

    #[test]
    fn kind_labels_parse_back() {
        for kind in [
            EventKind::Created,
            EventKind::Deleted,
            EventKind::Moved,
            EventKind::Modified,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("Created"), None);
    }
}
