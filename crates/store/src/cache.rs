//! Keyed mirror of remote objects and the rules for folding source events into it.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::{smallvec, SmallVec};
use switchyard_core::{Event, ListPage, ObjectKey, ResourceVersion, SourceEvent, WatchedObject};
use tracing::debug;

/// Events produced by folding one source event; at most a delete+add pair.
pub type Emitted = SmallVec<[Event; 2]>;

/// At most one entry per key; an entry's version never goes backwards.
#[derive(Debug, Default)]
pub struct Cache {
    entries: FxHashMap<ObjectKey, Arc<WatchedObject>>,
    cursor: Option<ResourceVersion>,
    stale: u64,
}

impl Cache {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn get(&self, key: &ObjectKey) -> Option<&Arc<WatchedObject>> { self.entries.get(key) }
    pub fn entries(&self) -> &FxHashMap<ObjectKey, Arc<WatchedObject>> { &self.entries }

    /// Highest resource version observed across the watched set.
    pub fn cursor(&self) -> Option<ResourceVersion> { self.cursor }

    /// Number of stale or duplicate events rejected so far.
    pub fn stale(&self) -> u64 { self.stale }

    fn advance(&mut self, rv: ResourceVersion) {
        if self.cursor.map_or(true, |c| rv > c) {
            self.cursor = Some(rv);
        }
    }

    /// Fold one watch event into the cache and return what must be dispatched.
    ///
    /// Events at or below the cached version for their key are dropped.
    pub fn apply(&mut self, ev: SourceEvent) -> Emitted {
        self.advance(ev.resource_version());
        match ev {
            SourceEvent::Bookmark(_) => SmallVec::new(),
            SourceEvent::Added(obj) | SourceEvent::Modified(obj) => self.upsert(obj, false),
            SourceEvent::Deleted(obj) => self.remove(obj),
        }
    }

    fn upsert(&mut self, obj: WatchedObject, allow_equal: bool) -> Emitted {
        let new = Arc::new(obj);
        let Some(old) = self.entries.get(&new.key).cloned() else {
            self.entries.insert(new.key.clone(), new.clone());
            return smallvec![Event::Added(new)];
        };
        let stale = if allow_equal {
            new.resource_version < old.resource_version
        } else {
            new.resource_version <= old.resource_version
        };
        if stale {
            self.stale += 1;
            debug!(key = %new.key, cached = %old.resource_version, got = %new.resource_version, "dropping stale event");
            return SmallVec::new();
        }
        self.entries.insert(new.key.clone(), new.clone());
        match (old.uid, new.uid) {
            // Same name, new incarnation: never present it as an update.
            (Some(a), Some(b)) if a != b => smallvec![Event::Deleted(old), Event::Added(new)],
            _ => smallvec![Event::Updated { old, new }],
        }
    }

    fn remove(&mut self, obj: WatchedObject) -> Emitted {
        match self.entries.get(&obj.key).map(|o| o.resource_version) {
            None => {
                debug!(key = %obj.key, "delete for unknown key ignored");
                SmallVec::new()
            }
            Some(cached) if obj.resource_version < cached => {
                self.stale += 1;
                debug!(key = %obj.key, cached = %cached, got = %obj.resource_version, "dropping stale delete");
                SmallVec::new()
            }
            Some(_) => {
                self.entries.remove(&obj.key);
                smallvec![Event::Deleted(Arc::new(obj))]
            }
        }
    }

    /// Reconcile against a full relist.
    ///
    /// Every surviving key yields an `Updated`, even when nothing changed, so
    /// handlers get a periodic nudge. Keys missing from the list are deleted.
    /// The cursor is reset to the list's version.
    pub fn replace(&mut self, page: ListPage) -> Vec<Event> {
        let mut out = Vec::with_capacity(page.items.len());
        let mut seen: FxHashSet<ObjectKey> = FxHashSet::default();
        for obj in page.items {
            seen.insert(obj.key.clone());
            out.extend(self.upsert(obj, true));
        }
        let mut gone: Vec<ObjectKey> = self.entries.keys().filter(|k| !seen.contains(*k)).cloned().collect();
        gone.sort_unstable();
        for key in gone {
            if let Some(old) = self.entries.remove(&key) {
                out.push(Event::Deleted(old));
            }
        }
        self.cursor = Some(page.resource_version);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::Phase;

    fn obj(name: &str, phase: Phase, rv: u64) -> WatchedObject {
        WatchedObject::new(ObjectKey::new("default", name), phase, rv)
    }

    fn page(items: Vec<WatchedObject>, rv: u64) -> ListPage {
        ListPage { items, resource_version: ResourceVersion(rv) }
    }

    #[test]
    fn modified_produces_update_with_prior_value() {
        let mut c = Cache::new();
        c.replace(page(vec![obj("db-0", Phase::Running, 10)], 10));
        let out = c.apply(SourceEvent::Modified(obj("db-0", Phase::Failed, 11)));
        assert_eq!(out.len(), 1);
        match &out[0] {
            Event::Updated { old, new } => {
                assert_eq!(old.phase, Phase::Running);
                assert_eq!(new.phase, Phase::Failed);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(c.cursor(), Some(ResourceVersion(11)));
    }

    #[test]
    fn stale_and_duplicate_events_are_rejected() {
        let mut c = Cache::new();
        c.apply(SourceEvent::Added(obj("db-0", Phase::Running, 10)));
        assert!(c.apply(SourceEvent::Modified(obj("db-0", Phase::Failed, 9))).is_empty());
        assert!(c.apply(SourceEvent::Modified(obj("db-0", Phase::Failed, 10))).is_empty());
        assert!(c.apply(SourceEvent::Deleted(obj("db-0", Phase::Failed, 8))).is_empty());
        assert_eq!(c.get(&ObjectKey::new("default", "db-0")).map(|o| o.phase), Some(Phase::Running));
        assert_eq!(c.stale(), 3);
    }

    #[test]
    fn modified_for_unknown_key_is_added() {
        let mut c = Cache::new();
        let out = c.apply(SourceEvent::Modified(obj("db-1", Phase::Pending, 4)));
        assert!(matches!(out.as_slice(), [Event::Added(_)]));
    }

    #[test]
    fn delete_for_unknown_key_is_ignored() {
        let mut c = Cache::new();
        assert!(c.apply(SourceEvent::Deleted(obj("ghost", Phase::Failed, 4))).is_empty());
        assert_eq!(c.cursor(), Some(ResourceVersion(4)));
    }

    #[test]
    fn uid_change_splits_into_delete_and_add() {
        let mut c = Cache::new();
        c.apply(SourceEvent::Added(obj("db-0", Phase::Running, 10).with_uid([1u8; 16])));
        let out = c.apply(SourceEvent::Modified(obj("db-0", Phase::Pending, 20).with_uid([2u8; 16])));
        assert!(matches!(out.as_slice(), [Event::Deleted(_), Event::Added(_)]));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn bookmark_only_moves_cursor() {
        let mut c = Cache::new();
        c.apply(SourceEvent::Added(obj("db-0", Phase::Running, 10)));
        assert!(c.apply(SourceEvent::Bookmark(ResourceVersion(42))).is_empty());
        assert_eq!(c.cursor(), Some(ResourceVersion(42)));
        // never backwards
        c.apply(SourceEvent::Bookmark(ResourceVersion(7)));
        assert_eq!(c.cursor(), Some(ResourceVersion(42)));
    }

    #[test]
    fn replace_nudges_survivors_and_deletes_missing() {
        let mut c = Cache::new();
        c.replace(page(vec![obj("a", Phase::Running, 1), obj("b", Phase::Running, 2), obj("c", Phase::Running, 3)], 3));
        let out = c.replace(page(vec![obj("a", Phase::Running, 1), obj("d", Phase::Pending, 5)], 6));
        let kinds: Vec<(&str, String)> = out.iter().map(|e| (e.kind(), e.key().name.clone())).collect();
        assert_eq!(
            kinds,
            vec![
                ("updated", "a".to_string()),
                ("added", "d".to_string()),
                ("deleted", "b".to_string()),
                ("deleted", "c".to_string()),
            ]
        );
        assert_eq!(c.len(), 2);
        assert_eq!(c.cursor(), Some(ResourceVersion(6)));
    }

    #[test]
    fn replace_keeps_newer_cached_entry() {
        let mut c = Cache::new();
        c.apply(SourceEvent::Added(obj("a", Phase::Failed, 9)));
        let out = c.replace(page(vec![obj("a", Phase::Running, 5)], 8));
        assert!(out.is_empty());
        assert_eq!(c.get(&ObjectKey::new("default", "a")).map(|o| o.phase), Some(Phase::Failed));
    }
}
