use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind as RawKind};
use tokio::time::Instant;

use filebox_channel::{EventKind, FileEvent};

/// How long a rename source waits for its destination before it counts as
/// a removal.
pub const RENAME_GRACE: Duration = Duration::from_millis(250);

/// Paired trackers remembered while waiting for the backend's own `Both`.
const REPORTED_CAP: usize = 64;

/// What [`RenamePairing::accept`] made of one raw notification.
#[derive(Debug, PartialEq, Eq)]
pub enum Paired {
    /// Not half of a rename; normalize it as usual.
    Unrelated,
    /// Held until its other half arrives or the grace runs out.
    Held,
    /// Already reported, or a directory.
    Suppressed,
    Emit(FileEvent),
}

#[derive(Debug)]
struct Source {
    path: PathBuf,
    tracker: Option<usize>,
    deadline: Instant,
}

/// Joins the two halves of a rename.
///
/// inotify reports a rename inside the tree as `From`, `To` and then `Both`,
/// all carrying the same tracker cookie.  A file moved in from outside gets
/// only `To`, and a file moved out gets only `From`.  Halves that find their
/// partner become one `moved` event for the source path.  A lone `To` is a
/// creation, and a lone `From` becomes a deletion once the grace runs out.
#[derive(Debug)]
pub struct RenamePairing {
    grace: Duration,
    sources: VecDeque<Source>,
    reported: VecDeque<usize>,
}

impl Default for RenamePairing {
    fn default() -> Self {
        Self::new(RENAME_GRACE)
    }
}

impl RenamePairing {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            sources: VecDeque::new(),
            reported: VecDeque::new(),
        }
    }

    pub fn accept(&mut self, event: &Event, now: Instant) -> Paired {
        let RawKind::Modify(ModifyKind::Name(mode)) = event.kind else {
            return Paired::Unrelated;
        };
        let tracker = event.attrs.tracker();

        match mode {
            RenameMode::From => {
                let Some(path) = event.paths.first() else {
                    return Paired::Suppressed;
                };
                self.sources.push_back(Source {
                    path: path.clone(),
                    tracker,
                    deadline: now + self.grace,
                });
                Paired::Held
            }
            RenameMode::To => {
                let Some(path) = event.paths.last() else {
                    return Paired::Suppressed;
                };
                let source = self.take_source(tracker);
                if source.is_some() {
                    if let Some(tracker) = tracker {
                        self.remember(tracker);
                    }
                }
                if path.is_dir() {
                    return Paired::Suppressed;
                }
                match source {
                    Some(source) => Paired::Emit(FileEvent::new(EventKind::Moved, source.path)),
                    None => Paired::Emit(FileEvent::new(EventKind::Created, path.clone())),
                }
            }
            RenameMode::Both => match tracker {
                Some(tracker) if self.forget(tracker) => Paired::Suppressed,
                Some(_) => {
                    self.take_source(tracker);
                    Paired::Unrelated
                }
                None => Paired::Unrelated,
            },
            RenameMode::Any | RenameMode::Other => Paired::Unrelated,
        }
    }

    /// When the oldest held source runs out of grace.
    pub fn deadline(&self) -> Option<Instant> {
        self.sources.front().map(|source| source.deadline)
    }

    /// Turn every source whose grace has passed into a deletion.
    pub fn expire(&mut self, now: Instant) -> Vec<FileEvent> {
        let mut deleted = Vec::new();
        while self.sources.front().is_some_and(|source| source.deadline <= now) {
            if let Some(source) = self.sources.pop_front() {
                deleted.push(FileEvent::new(EventKind::Deleted, source.path));
            }
        }
        deleted
    }

    /// Give up on every held source.
    pub fn flush(&mut self) -> Vec<FileEvent> {
        self.sources
            .drain(..)
            .map(|source| FileEvent::new(EventKind::Deleted, source.path))
            .collect()
    }

    pub fn is_idle(&self) -> bool {
        self.sources.is_empty()
    }

    // Sources without a tracker only pair with destinations without one.
    fn take_source(&mut self, tracker: Option<usize>) -> Option<Source> {
        let index = self.sources.iter().position(|source| source.tracker == tracker)?;
        self.sources.remove(index)
    }

    fn remember(&mut self, tracker: usize) {
        self.reported.push_back(tracker);
        if self.reported.len() > REPORTED_CAP {
            self.reported.pop_front();
        }
    }

    fn forget(&mut self, tracker: usize) -> bool {
        match self.reported.iter().position(|&t| t == tracker) {
            Some(index) => {
                self.reported.remove(index);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn rename(mode: RenameMode, paths: &[&str], tracker: Option<usize>) -> Event {
        let event = paths.iter().fold(
            Event::new(RawKind::Modify(ModifyKind::Name(mode))),
            |event, p| event.add_path(PathBuf::from(p)),
        );
        match tracker {
            Some(tracker) => event.set_tracker(tracker),
            None => event,
        }
    }

    fn emitted(paired: Paired) -> FileEvent {
        match paired {
            Paired::Emit(event) => event,
            other => panic!("expected an event, got {other:?}"),
        }
    }

    #[test]
    fn rename_inside_the_tree_is_one_move() {
        let mut pairing = RenamePairing::default();
        let now = Instant::now();
        let from = rename(RenameMode::From, &["/box/a.txt"], Some(7));
        let to = rename(RenameMode::To, &["/box/b.txt"], Some(7));
        let both = rename(RenameMode::Both, &["/box/a.txt", "/box/b.txt"], Some(7));

        assert_eq!(pairing.accept(&from, now), Paired::Held);
        let moved = emitted(pairing.accept(&to, now));
        assert_eq!(moved.kind, EventKind::Moved);
        assert_eq!(moved.path(), Path::new("/box/a.txt"));
        assert_eq!(pairing.accept(&both, now), Paired::Suppressed);

        assert!(pairing.is_idle());
        assert!(pairing.expire(now + RENAME_GRACE * 2).is_empty());
    }

    #[test]
    fn move_in_from_outside_is_a_creation() {
        let mut pairing = RenamePairing::default();
        let to = rename(RenameMode::To, &["/box/a.txt"], Some(3));
        let created = emitted(pairing.accept(&to, Instant::now()));
        assert_eq!(created.kind, EventKind::Created);
        assert_eq!(created.path(), Path::new("/box/a.txt"));
    }

    #[test]
    fn move_out_becomes_a_deletion_after_the_grace() {
        let mut pairing = RenamePairing::default();
        let now = Instant::now();
        let from = rename(RenameMode::From, &["/box/a.txt"], Some(9));
        assert_eq!(pairing.accept(&from, now), Paired::Held);
        assert_eq!(pairing.deadline(), Some(now + RENAME_GRACE));

        assert!(pairing.expire(now).is_empty());
        let deleted = pairing.expire(now + RENAME_GRACE);
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].kind, EventKind::Deleted);
        assert_eq!(deleted[0].path(), Path::new("/box/a.txt"));
        assert!(pairing.deadline().is_none());
    }

    #[test]
    fn halves_pair_only_by_tracker() {
        let mut pairing = RenamePairing::default();
        let now = Instant::now();
        pairing.accept(&rename(RenameMode::From, &["/box/out.txt"], Some(1)), now);

        let created = emitted(pairing.accept(&rename(RenameMode::To, &["/box/in.txt"], Some(2)), now));
        assert_eq!(created.kind, EventKind::Created);

        let deleted = pairing.flush();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].path(), Path::new("/box/out.txt"));
    }

    #[test]
    fn unpaired_both_is_left_to_normalize() {
        let mut pairing = RenamePairing::default();
        let both = rename(RenameMode::Both, &["/box/a.txt", "/box/b.txt"], None);
        assert_eq!(pairing.accept(&both, Instant::now()), Paired::Unrelated);

        let any = rename(RenameMode::Any, &["/box/a.txt"], None);
        assert_eq!(pairing.accept(&any, Instant::now()), Paired::Unrelated);
    }

    #[test]
    fn directory_destination_is_suppressed() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().to_str().unwrap();
        let mut pairing = RenamePairing::default();
        let to = rename(RenameMode::To, &[path], Some(5));
        assert_eq!(pairing.accept(&to, Instant::now()), Paired::Suppressed);
    }
}
