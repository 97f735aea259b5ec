//! Switchyard controller: watches the active pod and signals failover.
//!
//! A [`Controller`] wires a [`Reflector`] (list + watch + resync) to a
//! [`Dispatcher`] and runs the lifecycle
//! `Created -> Starting -> Synced -> Running -> Stopping -> Stopped`.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use switchyard_core::{Event, Filter, ObjectSource};
use switchyard_store::{Reflector, ReflectorConfig, Store, StoreError};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod audit;
pub mod detector;
pub mod dispatch;

pub use audit::AuditLog;
pub use detector::{
    detect, FailoverPolicy, FailoverTrigger, LogExecutor, Switchover, SwitchoverExecutor, Transition, TriggerReason,
};
pub use dispatch::{Dispatcher, EventHandler, HandlerFns, SharedHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    Created,
    Starting,
    Synced,
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::Starting => "starting",
            LifecycleState::Synced => "synced",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("initial sync failed: {0}")]
    InitialSync(#[source] StoreError),
    #[error("initial sync did not complete within {0:?}")]
    SyncTimeout(Duration),
    #[error("cancelled before initial sync completed")]
    Cancelled,
    #[error("controller cannot start from state {0}")]
    AlreadyStarted(LifecycleState),
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub filter: Filter,
    pub reflector: ReflectorConfig,
    /// Capacity of the reflector -> dispatcher queue.
    pub queue_cap: usize,
    /// Deadline for the initial sync in [`Controller::start`].
    pub sync_timeout: Duration,
    pub policy: FailoverPolicy,
}

impl ControllerConfig {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            reflector: ReflectorConfig::default(),
            queue_cap: 1024,
            sync_timeout: Duration::from_secs(120),
            policy: FailoverPolicy::default(),
        }
    }

    /// Defaults overridden by `SWITCHYARD_*` env knobs. Unparsable values fall back silently.
    pub fn from_env(filter: Filter) -> Self {
        let mut cfg = Self::new(filter);
        cfg.reflector.resync_period = Duration::from_secs(env_or("SWITCHYARD_RESYNC_SECS", 86_400u64).max(1));
        cfg.reflector.list_retries = env_or("SWITCHYARD_LIST_RETRIES", cfg.reflector.list_retries);
        cfg.reflector.backoff_max = Duration::from_secs(env_or("SWITCHYARD_WATCH_BACKOFF_MAX_SECS", 30u64));
        cfg.queue_cap = env_or("SWITCHYARD_QUEUE_CAP", cfg.queue_cap).max(1);
        cfg.sync_timeout = Duration::from_secs(env_or("SWITCHYARD_SYNC_TIMEOUT_SECS", 120u64));
        cfg.policy.trigger_on_delete = env_or("SWITCHYARD_FAILOVER_ON_DELETE", false);
        cfg
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// Owns the cache and dispatch for one filter.
pub struct Controller<S: ObjectSource> {
    config: ControllerConfig,
    handlers: Vec<SharedHandler>,
    pending: Option<(Reflector<S>, mpsc::Receiver<Event>)>,
    store: Store,
    state: Arc<watch::Sender<LifecycleState>>,
    token: CancellationToken,
}

impl<S: ObjectSource> Controller<S> {
    /// The audit handler is always registered first.
    pub fn new(source: Arc<S>, config: ControllerConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_cap.max(1));
        let (reflector, store) = Reflector::new(source, config.filter.clone(), config.reflector.clone(), tx);
        let (state, _) = watch::channel(LifecycleState::Created);
        Self {
            config,
            handlers: vec![Arc::new(AuditLog) as SharedHandler],
            pending: Some((reflector, rx)),
            store,
            state: Arc::new(state),
            token: CancellationToken::new(),
        }
    }

    /// Register a handler. Only effective before [`start`](Self::start).
    pub fn add_handler(&mut self, handler: impl EventHandler) -> &mut Self {
        if self.state() != LifecycleState::Created {
            warn!(handler = handler.name(), state = %self.state(), "handler registered after start is ignored");
            return self;
        }
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Register the failover trigger with the configured policy. It only
    /// fires while the controller is `Running`.
    pub fn with_failover(&mut self, executor: impl SwitchoverExecutor) -> &mut Self {
        let trigger = FailoverTrigger::new(executor, self.config.policy.clone()).gated(self.state.subscribe());
        self.add_handler(trigger)
    }

    pub fn state(&self) -> LifecycleState { *self.state.borrow() }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> { self.state.subscribe() }

    /// True once the initial list has been applied; frozen after stop.
    pub fn has_synced(&self) -> bool { self.store.has_synced() }

    pub fn store(&self) -> &Store { &self.store }

    /// Sync the cache, then keep watching in the background.
    ///
    /// Returns once the controller is `Running`, or with an error if the
    /// initial sync fails, exceeds the deadline, or `cancel` fires first.
    /// Cancelling `cancel` later stops the controller like [`stop`](Self::stop).
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<(), ControllerError> {
        let state = self.state();
        let Some((mut reflector, rx)) = self.pending.take().filter(|_| state == LifecycleState::Created) else {
            return Err(ControllerError::AlreadyStarted(state));
        };
        let token = self.token.clone();
        let caller = cancel.clone();
        let linked = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = caller.cancelled() => linked.cancel(),
                _ = linked.cancelled() => {}
            }
        });

        let handlers: Vec<SharedHandler> = std::mem::take(&mut self.handlers);
        let dispatcher = Dispatcher::new(handlers);
        info!(
            selector = %self.config.filter.label_selector,
            ns = ?self.config.filter.namespace,
            handlers = dispatcher.handler_count(),
            "starting controller"
        );
        let dispatch = tokio::spawn(dispatcher.run(rx, token.clone()));
        self.transition(LifecycleState::Starting);

        let deadline = self.config.sync_timeout;
        let synced = match tokio::time::timeout(deadline, reflector.sync(&token)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(StoreError::Cancelled)) => Err(ControllerError::Cancelled),
            Ok(Err(e)) => Err(ControllerError::InitialSync(e)),
            Err(_) => Err(ControllerError::SyncTimeout(deadline)),
        };
        if let Err(e) = synced {
            error!(error = %e, "controller failed to start");
            token.cancel();
            self.transition(LifecycleState::Stopping);
            if let Err(je) = dispatch.await {
                error!(error = %je, "dispatcher task failed");
            }
            self.transition(LifecycleState::Stopped);
            return Err(e);
        }

        self.transition(LifecycleState::Synced);
        self.transition(LifecycleState::Running);
        let reflect = tokio::spawn(reflector.run(token.clone()));

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            token.cancelled().await;
            set_state(&state, LifecycleState::Stopping);
            if let Err(e) = reflect.await {
                error!(error = %e, "reflector task failed");
            }
            if let Err(e) = dispatch.await {
                error!(error = %e, "dispatcher task failed");
            }
            set_state(&state, LifecycleState::Stopped);
        });
        Ok(())
    }

    /// Request shutdown. Safe to call any number of times, before or after start.
    pub fn stop(&self) {
        if self.state() == LifecycleState::Created {
            self.transition(LifecycleState::Stopped);
        }
        self.token.cancel();
    }

    /// Wait until the controller reaches `Stopped`.
    pub async fn stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == LifecycleState::Stopped).await;
    }

    fn transition(&self, next: LifecycleState) { set_state(&self.state, next); }
}

impl<S: ObjectSource> Drop for Controller<S> {
    // An abandoned controller stops watching and dispatching.
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn set_state(tx: &watch::Sender<LifecycleState>, next: LifecycleState) {
    let prev = tx.send_replace(next);
    if prev != next {
        info!(from = %prev, to = %next, "controller state");
    }
}
