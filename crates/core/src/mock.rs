//! Scripted in-memory [`ObjectSource`] for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use futures::channel::mpsc;
use futures::StreamExt;

use crate::{Filter, ListPage, ObjectSource, ResourceVersion, SourceError, SourceEvent, WatchStream, WatchedObject};

#[derive(Default)]
struct MockInner {
    lists: VecDeque<Result<ListPage, SourceError>>,
    last_page: Option<ListPage>,
    watches: VecDeque<Result<mpsc::UnboundedReceiver<Result<SourceEvent, SourceError>>, SourceError>>,
    list_calls: usize,
    watch_cursors: Vec<ResourceVersion>,
}

/// Source whose list results and watch sessions are queued up front.
///
/// Lists are served from a queue; once it drains the last successful page is
/// repeated. Each `watch` call takes the next queued session, or idles forever
/// when none is queued.
#[derive(Default)]
pub struct MockSource {
    inner: Mutex<MockInner>,
}

impl MockSource {
    pub fn new() -> Self { Self::default() }

    pub fn push_list(&self, page: ListPage) {
        self.lock().lists.push_back(Ok(page));
    }

    pub fn push_list_error(&self, err: SourceError) {
        self.lock().lists.push_back(Err(err));
    }

    /// Queue a watch session and return the feed that drives it.
    pub fn push_watch(&self) -> WatchFeed {
        let (tx, rx) = mpsc::unbounded();
        self.lock().watches.push_back(Ok(rx));
        WatchFeed { tx }
    }

    /// Queue a watch call that fails to open.
    pub fn push_watch_error(&self, err: SourceError) {
        self.lock().watches.push_back(Err(err));
    }

    pub fn list_calls(&self) -> usize { self.lock().list_calls }

    /// Cursors passed to each `watch` call, in call order.
    pub fn watch_cursors(&self) -> Vec<ResourceVersion> { self.lock().watch_cursors.clone() }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockInner> {
        // A panicking test thread must not wedge the others.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl ObjectSource for MockSource {
    async fn list(&self, _filter: &Filter) -> Result<ListPage, SourceError> {
        let mut inner = self.lock();
        inner.list_calls += 1;
        match inner.lists.pop_front() {
            Some(Ok(page)) => {
                inner.last_page = Some(page.clone());
                Ok(page)
            }
            Some(Err(e)) => Err(e),
            None => inner
                .last_page
                .clone()
                .ok_or_else(|| SourceError::Transport("no list scripted".into())),
        }
    }

    async fn watch(&self, _filter: &Filter, since: ResourceVersion) -> Result<WatchStream, SourceError> {
        let mut inner = self.lock();
        inner.watch_cursors.push(since);
        match inner.watches.pop_front() {
            Some(Ok(rx)) => Ok(rx.boxed()),
            Some(Err(e)) => Err(e),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

/// Producer side of one scripted watch session. Dropping it ends the stream normally.
#[derive(Clone)]
pub struct WatchFeed {
    tx: mpsc::UnboundedSender<Result<SourceEvent, SourceError>>,
}

impl WatchFeed {
    pub fn send(&self, item: Result<SourceEvent, SourceError>) {
        // The reflector may already have hung up; scripted tests don't care.
        let _ = self.tx.unbounded_send(item);
    }

    pub fn added(&self, obj: WatchedObject) { self.send(Ok(SourceEvent::Added(obj))); }
    pub fn modified(&self, obj: WatchedObject) { self.send(Ok(SourceEvent::Modified(obj))); }
    pub fn deleted(&self, obj: WatchedObject) { self.send(Ok(SourceEvent::Deleted(obj))); }
    pub fn bookmark(&self, rv: u64) { self.send(Ok(SourceEvent::Bookmark(ResourceVersion(rv)))); }
    pub fn gone(&self) { self.send(Err(SourceError::Gone("too old resource version".into()))); }
    pub fn fail(&self, msg: &str) { self.send(Err(SourceError::Transport(msg.to_string()))); }
    pub fn malformed(&self, msg: &str) { self.send(Err(SourceError::Malformed(msg.to_string()))); }

    /// End the stream as if the server closed it.
    pub fn close(self) { self.tx.close_channel(); }
}
