use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind as RawKind};

use filebox_channel::{EventKind, FileEvent};

/// Map a raw notification onto the pipeline's four event kinds.
///
/// Directory notifications, access events and the half-rename `From`/`To`
/// notifications produce nothing here; [`crate::RenamePairing`] handles the
/// halves.  A rename reported as a pair (`Both`) or without direction
/// (`Any`) becomes one `moved` event for the source path.
pub fn normalize(event: &Event) -> Option<FileEvent> {
    let kind = match event.kind {
        RawKind::Create(CreateKind::Folder) | RawKind::Remove(RemoveKind::Folder) => return None,
        RawKind::Create(_) => EventKind::Created,
        RawKind::Remove(_) => EventKind::Deleted,
        RawKind::Modify(ModifyKind::Name(RenameMode::Both | RenameMode::Any)) => EventKind::Moved,
        RawKind::Modify(ModifyKind::Name(_)) => return None,
        RawKind::Modify(_) => EventKind::Modified,
        RawKind::Access(_) | RawKind::Any | RawKind::Other => return None,
    };

    let path = event.paths.first()?;
    if event.paths.iter().any(|p| p.is_dir()) {
        return None;
    }
    Some(FileEvent::new(kind, path.clone()))
}
