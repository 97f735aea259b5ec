//! Switchyard core types: watched objects, change events and the source contract.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod mock;

pub type Uid = [u8; 16];

/// Identity of a watched object within its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Lifecycle phase as reported by the object's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl Phase {
    /// Lenient parse: anything unrecognised (or absent) is `Unknown`.
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some("Pending") => Phase::Pending,
            Some("Running") => Phase::Running,
            Some("Succeeded") => Phase::Succeeded,
            Some("Failed") => Phase::Failed,
            _ => Phase::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
            Phase::Unknown => "Unknown",
        }
    }

    pub fn is_running(&self) -> bool { matches!(self, Phase::Running) }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Ordered resource version. The API hands these out as decimal strings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceVersion(pub u64);

impl FromStr for ResourceVersion {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(ResourceVersion)
            .map_err(|_| SourceError::Malformed(format!("non-numeric resourceVersion {:?}", s)))
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// Last observed state of one object of the watched kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchedObject {
    pub key: ObjectKey,
    pub uid: Option<Uid>,
    pub phase: Phase,
    pub resource_version: ResourceVersion,
    /// Kubernetes labels as key/value pairs.
    pub labels: SmallVec<[(String, String); 8]>,
    /// Raw object with `metadata.managedFields` stripped. Opaque to the core.
    pub raw: serde_json::Value,
}

impl WatchedObject {
    /// Minimal object carrying only identity, phase and version.
    pub fn new(key: ObjectKey, phase: Phase, resource_version: u64) -> Self {
        Self {
            key,
            uid: None,
            phase,
            resource_version: ResourceVersion(resource_version),
            labels: SmallVec::new(),
            raw: serde_json::Value::Null,
        }
    }

    pub fn with_uid(mut self, uid: Uid) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Typed notification dispatched to handlers. Payloads are shared immutable snapshots.
#[derive(Debug, Clone)]
pub enum Event {
    Added(Arc<WatchedObject>),
    Updated { old: Arc<WatchedObject>, new: Arc<WatchedObject> },
    Deleted(Arc<WatchedObject>),
}

impl Event {
    pub fn key(&self) -> &ObjectKey {
        match self {
            Event::Added(o) | Event::Deleted(o) => &o.key,
            Event::Updated { new, .. } => &new.key,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Added(_) => "added",
            Event::Updated { .. } => "updated",
            Event::Deleted(_) => "deleted",
        }
    }
}

/// Label selector plus optional namespace scope. Fixed for the controller's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub label_selector: String,
    pub namespace: Option<String>,
}

impl Filter {
    pub fn new(label_selector: impl Into<String>, namespace: Option<String>) -> Self {
        Self { label_selector: label_selector.into(), namespace }
    }
}

/// Result of a full list call.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub items: Vec<WatchedObject>,
    pub resource_version: ResourceVersion,
}

/// Raw change notification from the remote source.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Added(WatchedObject),
    Modified(WatchedObject),
    Deleted(WatchedObject),
    /// Progress marker: no object changed, the cursor may advance.
    Bookmark(ResourceVersion),
}

impl SourceEvent {
    pub fn resource_version(&self) -> ResourceVersion {
        match self {
            SourceEvent::Added(o) | SourceEvent::Modified(o) | SourceEvent::Deleted(o) => o.resource_version,
            SourceEvent::Bookmark(rv) => *rv,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SourceEvent::Added(_) => "added",
            SourceEvent::Modified(_) => "modified",
            SourceEvent::Deleted(_) => "deleted",
            SourceEvent::Bookmark(_) => "bookmark",
        }
    }
}

/// Failures reported by an [`ObjectSource`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SourceError {
    /// The resume cursor is too old; a full relist is required.
    #[error("resource version expired: {0}")]
    Gone(String),
    #[error("transport: {0}")]
    Transport(String),
    /// A single undecodable event. The stream itself stays usable.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

pub type WatchStream = BoxStream<'static, Result<SourceEvent, SourceError>>;

/// Remote list+watch API for one kind of object.
#[async_trait::async_trait]
pub trait ObjectSource: Send + Sync + 'static {
    async fn list(&self, filter: &Filter) -> Result<ListPage, SourceError>;

    /// Open a change stream starting after `since`.
    async fn watch(&self, filter: &Filter, since: ResourceVersion) -> Result<WatchStream, SourceError>;
}

pub mod prelude {
    pub use super::{
        Event, Filter, ListPage, ObjectKey, ObjectSource, Phase, ResourceVersion, SourceError, SourceEvent, Uid,
        WatchStream, WatchedObject,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_parse_is_lenient() {
        assert_eq!(Phase::parse(Some("Running")), Phase::Running);
        assert_eq!(Phase::parse(Some("Failed")), Phase::Failed);
        assert_eq!(Phase::parse(Some("CrashLoop")), Phase::Unknown);
        assert_eq!(Phase::parse(None), Phase::Unknown);
        assert_eq!(Phase::Succeeded.to_string(), "Succeeded");
    }

    #[test]
    fn resource_version_orders_numerically() {
        let a: ResourceVersion = "9".parse().expect("ok");
        let b: ResourceVersion = "10".parse().expect("ok");
        assert!(a < b);
        assert_eq!(b.to_string(), "10");
    }

    #[test]
    fn resource_version_rejects_garbage() {
        let err = "abc".parse::<ResourceVersion>().unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));
    }

    #[test]
    fn event_key_and_kind() {
        let o = Arc::new(WatchedObject::new(ObjectKey::new("default", "db-0"), Phase::Running, 3));
        let ev = Event::Updated { old: o.clone(), new: o.clone() };
        assert_eq!(ev.key().to_string(), "default/db-0");
        assert_eq!(ev.kind(), "updated");
        assert_eq!(Event::Deleted(o).kind(), "deleted");
    }
}
