#![forbid(unsafe_code)]

use switchyard_core::{Event, ListPage, ObjectKey, Phase, ResourceVersion, SourceEvent, WatchedObject};
use switchyard_store::Cache;

fn obj(name: &str, phase: Phase, rv: u64) -> WatchedObject {
    WatchedObject::new(ObjectKey::new("default", name), phase, rv)
}

/// Replays a source stream and returns, per emitted event, `(kind, name, old_rv, new_rv)`.
fn replay(cache: &mut Cache, seq: Vec<SourceEvent>) -> Vec<(&'static str, String, u64, u64)> {
    let mut out = Vec::new();
    for ev in seq {
        for e in cache.apply(ev) {
            let row = match &e {
                Event::Added(o) => ("added", o.key.name.clone(), 0, o.resource_version.0),
                Event::Updated { old, new } => ("updated", new.key.name.clone(), old.resource_version.0, new.resource_version.0),
                Event::Deleted(o) => ("deleted", o.key.name.clone(), o.resource_version.0, 0),
            };
            out.push(row);
        }
    }
    out
}

#[test]
fn replay_preserves_per_key_order_and_drops_out_of_order() {
    let mut cache = Cache::new();
    cache.replace(ListPage { items: vec![obj("db-0", Phase::Running, 10)], resource_version: ResourceVersion(10) });

    let seq = vec![
        SourceEvent::Modified(obj("db-0", Phase::Running, 11)),
        SourceEvent::Added(obj("db-1", Phase::Pending, 12)),
        // late delivery of an older db-0 state
        SourceEvent::Modified(obj("db-0", Phase::Pending, 9)),
        // duplicate delivery
        SourceEvent::Added(obj("db-1", Phase::Pending, 12)),
        SourceEvent::Modified(obj("db-0", Phase::Failed, 13)),
        SourceEvent::Bookmark(ResourceVersion(15)),
        SourceEvent::Deleted(obj("db-1", Phase::Pending, 16)),
    ];
    let rows = replay(&mut cache, seq);
    assert_eq!(
        rows,
        vec![
            ("updated", "db-0".to_string(), 10, 11),
            ("added", "db-1".to_string(), 0, 12),
            ("updated", "db-0".to_string(), 11, 13),
            ("deleted", "db-1".to_string(), 16, 0),
        ]
    );
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.cursor(), Some(ResourceVersion(16)));
    assert_eq!(cache.stale(), 2);
}

#[test]
fn updated_old_always_matches_previously_delivered_state() {
    let mut cache = Cache::new();
    let mut last: Option<WatchedObject> = None;
    let phases = [Phase::Pending, Phase::Running, Phase::Running, Phase::Failed, Phase::Running];
    for (i, p) in phases.iter().enumerate() {
        for e in cache.apply(SourceEvent::Modified(obj("db-0", *p, 100 + i as u64))) {
            match e {
                Event::Added(o) => last = Some((*o).clone()),
                Event::Updated { old, new } => {
                    assert_eq!(Some(&*old), last.as_ref());
                    last = Some((*new).clone());
                }
                Event::Deleted(_) => panic!("no deletes in this stream"),
            }
        }
    }
    assert_eq!(last.map(|o| o.phase), Some(Phase::Running));
}
