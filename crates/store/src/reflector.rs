//! List+watch driver that keeps a [`Cache`] consistent with an [`ObjectSource`].

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use switchyard_core::{Event, Filter, ListPage, ObjectSource, ResourceVersion, SourceError};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Backoff, Cache, Publisher, Store, StoreError};

#[derive(Debug, Clone)]
pub struct ReflectorConfig {
    /// Interval between forced full relists.
    pub resync_period: Duration,
    /// Extra attempts for the initial list before giving up.
    pub list_retries: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            resync_period: Duration::from_secs(24 * 60 * 60),
            list_retries: 5,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Why a watch session ended.
enum WatchEnd {
    Cancelled,
    Gone,
    Failed(SourceError),
    Closed { received: usize },
}

/// Sole writer of the cache. Emits dispatchable events into `sink` in the
/// order the cache mutations were applied.
pub struct Reflector<S: ObjectSource> {
    source: Arc<S>,
    filter: Filter,
    config: ReflectorConfig,
    cache: Cache,
    publisher: Publisher,
    sink: mpsc::Sender<Event>,
    backoff: Backoff,
}

impl<S: ObjectSource> Reflector<S> {
    pub fn new(source: Arc<S>, filter: Filter, config: ReflectorConfig, sink: mpsc::Sender<Event>) -> (Self, Store) {
        let (publisher, store) = Publisher::pair();
        let backoff = Backoff::new(config.backoff_initial, config.backoff_max);
        let me = Self { source, filter, config, cache: Cache::new(), publisher, sink, backoff };
        (me, store)
    }

    /// Initial list: populate the cache and mark the store synced.
    ///
    /// Fails once the initial attempt and `list_retries` retries are exhausted.
    pub async fn sync(&mut self, cancel: &CancellationToken) -> Result<(), StoreError> {
        let attempts = self.config.list_retries.saturating_add(1);
        let mut attempt = 0u32;
        let page = loop {
            attempt += 1;
            let res = tokio::select! {
                _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                r = self.source.list(&self.filter) => r,
            };
            match res {
                Ok(page) => break page,
                Err(e) if attempt >= attempts => {
                    warn!(error = %e, attempt, "initial list failed; giving up");
                    return Err(StoreError::InitialList { attempts: attempt, source: e });
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(error = %e, attempt, retry_in_ms = %delay.as_millis(), "initial list failed; retrying");
                    if !pause(delay, cancel).await {
                        return Err(StoreError::Cancelled);
                    }
                }
            }
        };
        self.backoff.reset();
        let items = page.items.len();
        let rv = page.resource_version;
        self.apply_page(page, cancel).await;
        self.publisher.mark_synced();
        info!(selector = %self.filter.label_selector, ns = ?self.filter.namespace, items, rv = %rv, "initial sync complete");
        Ok(())
    }

    /// Watch loop with periodic resync. Returns once `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let period = self.config.resync_period;
        let mut resync = tokio::time::interval_at(Instant::now() + period, period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let since = self.cache.cursor().unwrap_or_default();
            match self.watch_session(since, &mut resync, &cancel).await {
                WatchEnd::Cancelled => break,
                WatchEnd::Gone => {
                    warn!(since = %since, "watch cursor expired; relisting");
                    if !self.relist_until_ok("gone", &cancel).await {
                        break;
                    }
                }
                WatchEnd::Failed(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(error = %e, since = %since, retry_in_ms = %delay.as_millis(), "watch failed; reconnecting");
                    metrics::counter!("watch_restarts_total").increment(1);
                    if !pause(delay, &cancel).await {
                        break;
                    }
                }
                WatchEnd::Closed { received } => {
                    debug!(received, "watch closed by server; reopening");
                    metrics::counter!("watch_restarts_total").increment(1);
                    // A stream that closes without delivering anything is not progress.
                    if received == 0 && !pause(self.backoff.next_delay(), &cancel).await {
                        break;
                    }
                }
            }
        }
        info!("reflector stopped");
    }

    async fn watch_session(
        &mut self,
        since: ResourceVersion,
        resync: &mut tokio::time::Interval,
        cancel: &CancellationToken,
    ) -> WatchEnd {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return WatchEnd::Cancelled,
            r = self.source.watch(&self.filter, since) => r,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(SourceError::Gone(_)) => return WatchEnd::Gone,
            Err(e) => return WatchEnd::Failed(e),
        };
        debug!(since = %since, "watch session started");
        let mut received = 0usize;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return WatchEnd::Cancelled,
                _ = resync.tick() => self.resync(cancel).await,
                item = stream.next() => match item {
                    Some(Ok(ev)) => {
                        received += 1;
                        self.backoff.reset();
                        metrics::counter!("watch_events_total", "type" => ev.kind()).increment(1);
                        let stale_before = self.cache.stale();
                        let out = self.cache.apply(ev);
                        if self.cache.stale() > stale_before {
                            metrics::counter!("stale_events_dropped_total").increment(1);
                        }
                        if !out.is_empty() {
                            self.publisher.publish(&self.cache);
                            self.emit(out, cancel).await;
                        }
                    }
                    Some(Err(SourceError::Malformed(msg))) => {
                        warn!(error = %msg, "dropping malformed watch event");
                        metrics::counter!("source_malformed_total").increment(1);
                    }
                    Some(Err(SourceError::Gone(_))) => return WatchEnd::Gone,
                    Some(Err(e)) => return WatchEnd::Failed(e),
                    None => return WatchEnd::Closed { received },
                },
            }
        }
    }

    /// Periodic relist. A failure waits for the next tick.
    async fn resync(&mut self, cancel: &CancellationToken) {
        let res = tokio::select! {
            _ = cancel.cancelled() => return,
            r = self.source.list(&self.filter) => r,
        };
        match res {
            Ok(page) => {
                info!(items = page.items.len(), rv = %page.resource_version, "resync relist");
                metrics::counter!("relists_total", "reason" => "resync").increment(1);
                self.apply_page(page, cancel).await;
            }
            Err(e) => warn!(error = %e, "resync relist failed; will retry next period"),
        }
    }

    /// Relist after the cursor expired. Retries until success or cancellation.
    async fn relist_until_ok(&mut self, reason: &'static str, cancel: &CancellationToken) -> bool {
        loop {
            let res = tokio::select! {
                _ = cancel.cancelled() => return false,
                r = self.source.list(&self.filter) => r,
            };
            match res {
                Ok(page) => {
                    self.backoff.reset();
                    info!(reason, items = page.items.len(), rv = %page.resource_version, "relisted");
                    metrics::counter!("relists_total", "reason" => reason).increment(1);
                    self.apply_page(page, cancel).await;
                    return true;
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(reason, error = %e, retry_in_ms = %delay.as_millis(), "relist failed; retrying");
                    if !pause(delay, cancel).await {
                        return false;
                    }
                }
            }
        }
    }

    async fn apply_page(&mut self, page: ListPage, cancel: &CancellationToken) {
        let out = self.cache.replace(page);
        self.publisher.publish(&self.cache);
        self.emit(out, cancel).await;
    }

    async fn emit(&self, events: impl IntoIterator<Item = Event>, cancel: &CancellationToken) {
        for ev in events {
            tokio::select! {
                _ = cancel.cancelled() => return,
                r = self.sink.send(ev) => {
                    if r.is_err() {
                        debug!("event sink closed; dropping remaining events");
                        return;
                    }
                }
            }
        }
    }
}

/// Sleep unless cancelled first. Returns false on cancellation.
async fn pause(d: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}
