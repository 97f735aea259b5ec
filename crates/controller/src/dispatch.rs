//! Event dispatch: fan cache events out to registered handlers.
//!
//! Every key gets its own lane (a task fed by an unbounded queue), so events
//! for one key are delivered strictly in order while unrelated keys proceed
//! concurrently. A slow handler only delays its own key.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use rustc_hash::FxHashMap;
use switchyard_core::{Event, ObjectKey, WatchedObject};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Callbacks for cache events. Every method defaults to a no-op.
///
/// Returned errors are logged and counted; they never stop dispatch or reach
/// other handlers.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn on_add(&self, _obj: &Arc<WatchedObject>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_update(&self, _old: &Arc<WatchedObject>, _new: &Arc<WatchedObject>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_delete(&self, _obj: &Arc<WatchedObject>) -> anyhow::Result<()> {
        Ok(())
    }
}

pub type SharedHandler = Arc<dyn EventHandler>;

type ObjFn = Box<dyn Fn(&WatchedObject) -> anyhow::Result<()> + Send + Sync>;
type UpdateFn = Box<dyn Fn(&WatchedObject, &WatchedObject) -> anyhow::Result<()> + Send + Sync>;

/// Handler assembled from plain closures, each one optional.
///
/// ```ignore
/// let h = HandlerFns::new("print")
///     .update_fn(|old, new| { println!("{} {} -> {}", new.key, old.phase, new.phase); Ok(()) });
/// ```
pub struct HandlerFns {
    name: String,
    add: Option<ObjFn>,
    update: Option<UpdateFn>,
    delete: Option<ObjFn>,
}

impl HandlerFns {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), add: None, update: None, delete: None }
    }

    pub fn add_fn(mut self, f: impl Fn(&WatchedObject) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn update_fn(
        mut self,
        f: impl Fn(&WatchedObject, &WatchedObject) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn delete_fn(mut self, f: impl Fn(&WatchedObject) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

#[async_trait]
impl EventHandler for HandlerFns {
    fn name(&self) -> &str { &self.name }

    async fn on_add(&self, obj: &Arc<WatchedObject>) -> anyhow::Result<()> {
        self.add.as_ref().map_or(Ok(()), |f| f(&**obj))
    }

    async fn on_update(&self, old: &Arc<WatchedObject>, new: &Arc<WatchedObject>) -> anyhow::Result<()> {
        self.update.as_ref().map_or(Ok(()), |f| f(&**old, &**new))
    }

    async fn on_delete(&self, obj: &Arc<WatchedObject>) -> anyhow::Result<()> {
        self.delete.as_ref().map_or(Ok(()), |f| f(&**obj))
    }
}

struct Lane {
    tx: mpsc::UnboundedSender<Event>,
    task: JoinHandle<()>,
}

/// Routes events from the reflector into per-key lanes.
pub struct Dispatcher {
    handlers: Arc<[SharedHandler]>,
}

impl Dispatcher {
    pub fn new(handlers: impl Into<Arc<[SharedHandler]>>) -> Self {
        Self { handlers: handlers.into() }
    }

    pub fn handler_count(&self) -> usize { self.handlers.len() }

    /// Dispatch until `cancel` fires or the event channel closes.
    ///
    /// On cancellation, events not yet handed to a handler are dropped and
    /// in-flight handler calls run to completion before this returns. When the
    /// channel closes instead, lanes drain what they already hold.
    pub async fn run(self, mut rx: mpsc::Receiver<Event>, cancel: CancellationToken) {
        let mut lanes: FxHashMap<ObjectKey, Lane> = FxHashMap::default();
        // Lanes closed by a delete that may still be delivering it.
        let mut retired: FxHashMap<ObjectKey, JoinHandle<()>> = FxHashMap::default();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                ev = rx.recv() => match ev {
                    Some(ev) => self.route(ev, &mut lanes, &mut retired, &cancel),
                    None => {
                        debug!("event channel closed");
                        break;
                    }
                },
            }
        }

        let mut dropped = 0u64;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        drop(rx);
        if dropped > 0 {
            debug!(dropped, "dropping undispatched events on stop");
            metrics::counter!("dispatch_dropped_on_stop_total").increment(dropped);
        }

        let tasks: Vec<JoinHandle<()>> = lanes.into_values().map(|l| l.task).chain(retired.into_values()).collect();
        for t in tasks {
            if let Err(e) = t.await {
                error!(error = %e, "dispatch lane aborted");
            }
        }
        debug!("dispatcher stopped");
    }

    fn route(
        &self,
        ev: Event,
        lanes: &mut FxHashMap<ObjectKey, Lane>,
        retired: &mut FxHashMap<ObjectKey, JoinHandle<()>>,
        cancel: &CancellationToken,
    ) {
        let key = ev.key().clone();
        let is_delete = matches!(ev, Event::Deleted(_));
        let lane = lanes.entry(key.clone()).or_insert_with(|| {
            let prev = retired.remove(&key);
            spawn_lane(Arc::clone(&self.handlers), prev, cancel.clone())
        });
        if lane.tx.send(ev).is_err() {
            debug!(key = %key, "lane closed; event dropped");
        }
        if is_delete {
            if let Some(lane) = lanes.remove(&key) {
                retired.retain(|_, h| !h.is_finished());
                retired.insert(key, lane.task);
            }
        }
    }
}

fn spawn_lane(handlers: Arc<[SharedHandler]>, prev: Option<JoinHandle<()>>, cancel: CancellationToken) -> Lane {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let task = tokio::spawn(async move {
        // A key recreated right after a delete must wait for the old lane.
        if let Some(prev) = prev {
            let _ = prev.await;
        }
        loop {
            let ev = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                ev = rx.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };
            deliver(&handlers, &ev, &cancel).await;
        }
        let mut dropped = 0u64;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            metrics::counter!("dispatch_dropped_on_stop_total").increment(dropped);
        }
    });
    Lane { tx, task }
}

async fn deliver(handlers: &[SharedHandler], ev: &Event, cancel: &CancellationToken) {
    for h in handlers {
        if cancel.is_cancelled() {
            return;
        }
        let call = async {
            match ev {
                Event::Added(o) => h.on_add(o).await,
                Event::Updated { old, new } => h.on_update(old, new).await,
                Event::Deleted(o) => h.on_delete(o).await,
            }
        };
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(handler = h.name(), key = %ev.key(), event = ev.kind(), error = %e, "handler failed");
                metrics::counter!("dispatch_handler_errors_total", "outcome" => "error").increment(1);
            }
            Err(_) => {
                error!(handler = h.name(), key = %ev.key(), event = ev.kind(), "handler panicked");
                metrics::counter!("dispatch_handler_errors_total", "outcome" => "panic").increment(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use switchyard_core::Phase;
    use tokio::sync::{Notify, Semaphore};

    type Log = Arc<Mutex<Vec<(String, &'static str, u64)>>>;

    fn obj(name: &str, rv: u64) -> Arc<WatchedObject> {
        Arc::new(WatchedObject::new(ObjectKey::new("default", name), Phase::Running, rv))
    }

    fn updated(name: &str, old: u64, new: u64) -> Event {
        Event::Updated { old: obj(name, old), new: obj(name, new) }
    }

    fn recorder(log: &Log) -> SharedHandler {
        let (a, u, d) = (log.clone(), log.clone(), log.clone());
        Arc::new(
            HandlerFns::new("recorder")
                .add_fn(move |o| {
                    a.lock().unwrap().push((o.key.name.clone(), "added", o.resource_version.0));
                    Ok(())
                })
                .update_fn(move |_, n| {
                    u.lock().unwrap().push((n.key.name.clone(), "updated", n.resource_version.0));
                    Ok(())
                })
                .delete_fn(move |o| {
                    d.lock().unwrap().push((o.key.name.clone(), "deleted", o.resource_version.0));
                    Ok(())
                }),
        )
    }

    /// Sleeps before recording updates for `slow`.
    struct SlowFor {
        key: &'static str,
        log: Log,
    }

    #[async_trait]
    impl EventHandler for SlowFor {
        async fn on_update(&self, _old: &Arc<WatchedObject>, new: &Arc<WatchedObject>) -> anyhow::Result<()> {
            if new.key.name == self.key {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.log.lock().unwrap().push((new.key.name.clone(), "updated", new.resource_version.0));
            Ok(())
        }

        async fn on_delete(&self, obj: &Arc<WatchedObject>) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.log.lock().unwrap().push((obj.key.name.clone(), "deleted", obj.resource_version.0));
            Ok(())
        }
    }

    struct Faulty;

    #[async_trait]
    impl EventHandler for Faulty {
        async fn on_update(&self, _old: &Arc<WatchedObject>, new: &Arc<WatchedObject>) -> anyhow::Result<()> {
            if new.resource_version.0 % 2 == 0 {
                panic!("boom");
            }
            anyhow::bail!("handler rejected rv {}", new.resource_version)
        }
    }

    #[tokio::test]
    async fn per_key_order_with_cross_key_concurrency() {
        let log: Log = Default::default();
        let d = Dispatcher::new(vec![Arc::new(SlowFor { key: "slow", log: log.clone() }) as SharedHandler]);
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let run = tokio::spawn(d.run(rx, cancel.clone()));

        for rv in 1..=3 {
            tx.send(updated("slow", rv - 1, rv)).await.unwrap();
        }
        tx.send(updated("fast", 0, 7)).await.unwrap();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), run).await.unwrap().unwrap();

        let log = log.lock().unwrap().clone();
        assert_eq!(log.first().map(|e| e.0.as_str()), Some("fast"));
        let slow: Vec<u64> = log.iter().filter(|e| e.0 == "slow").map(|e| e.2).collect();
        assert_eq!(slow, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn errors_and_panics_are_isolated() {
        let log: Log = Default::default();
        let d = Dispatcher::new(vec![Arc::new(Faulty) as SharedHandler, recorder(&log)]);
        let (tx, rx) = mpsc::channel(16);
        let run = tokio::spawn(d.run(rx, CancellationToken::new()));

        tx.send(updated("db-0", 0, 1)).await.unwrap();
        tx.send(updated("db-0", 1, 2)).await.unwrap();
        tx.send(updated("db-0", 2, 3)).await.unwrap();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), run).await.unwrap().unwrap();

        let rvs: Vec<u64> = log.lock().unwrap().iter().map(|e| e.2).collect();
        assert_eq!(rvs, vec![1, 2, 3]);
    }

    /// Blocks in `on_update` until the test hands out a permit.
    struct Gate {
        started: Arc<Notify>,
        permits: Arc<Semaphore>,
        log: Log,
    }

    #[async_trait]
    impl EventHandler for Gate {
        async fn on_update(&self, _old: &Arc<WatchedObject>, new: &Arc<WatchedObject>) -> anyhow::Result<()> {
            self.started.notify_one();
            self.permits.acquire().await?.forget();
            self.log.lock().unwrap().push((new.key.name.clone(), "updated", new.resource_version.0));
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancel_completes_in_flight_and_drops_queued() {
        let log: Log = Default::default();
        let started = Arc::new(Notify::new());
        let permits = Arc::new(Semaphore::new(0));
        let gate = Gate { started: started.clone(), permits: permits.clone(), log: log.clone() };
        let d = Dispatcher::new(vec![Arc::new(gate) as SharedHandler]);
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let run = tokio::spawn(d.run(rx, cancel.clone()));

        for rv in 1..=3 {
            tx.send(updated("db-0", rv - 1, rv)).await.unwrap();
        }
        started.notified().await;
        cancel.cancel();
        permits.add_permits(10);
        tokio::time::timeout(Duration::from_secs(2), run).await.unwrap().unwrap();

        let rvs: Vec<u64> = log.lock().unwrap().iter().map(|e| e.2).collect();
        assert_eq!(rvs, vec![1]);
    }

    #[tokio::test]
    async fn recreated_key_waits_for_retired_lane() {
        let log: Log = Default::default();
        let d = Dispatcher::new(vec![
            Arc::new(SlowFor { key: "none", log: log.clone() }) as SharedHandler,
            recorder(&log),
        ]);
        let (tx, rx) = mpsc::channel(16);
        let run = tokio::spawn(d.run(rx, CancellationToken::new()));

        tx.send(Event::Added(obj("db-0", 1))).await.unwrap();
        tx.send(Event::Deleted(obj("db-0", 2))).await.unwrap();
        tx.send(Event::Added(obj("db-0", 3))).await.unwrap();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), run).await.unwrap().unwrap();

        let seq: Vec<(&'static str, u64)> = log.lock().unwrap().iter().map(|e| (e.1, e.2)).collect();
        // SlowFor logs the delete, then the recorder logs it again.
        assert_eq!(seq, vec![("added", 1), ("deleted", 2), ("deleted", 2), ("added", 3)]);
    }
}
