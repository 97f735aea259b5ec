//! Failover detection: the edge from `Running` to anything else.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashSet;
use switchyard_core::{ObjectKey, Phase, ResourceVersion, Uid, WatchedObject};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::dispatch::EventHandler;
use crate::LifecycleState;

/// A phase change observed on one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
}

/// Fires iff the object left `Running`.
pub fn detect(old: &WatchedObject, new: &WatchedObject) -> Option<Transition> {
    (old.phase.is_running() && !new.phase.is_running()).then_some(Transition { from: old.phase, to: new.phase })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    /// The active pod left `Running`.
    PhaseChange,
    /// The active pod was deleted while running.
    Deleted,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::PhaseChange => "phase-change",
            TriggerReason::Deleted => "deleted",
        }
    }
}

/// What the switchover hook receives for each firing.
#[derive(Debug, Clone, PartialEq)]
pub struct Switchover {
    pub key: ObjectKey,
    pub uid: Option<Uid>,
    pub old_phase: Phase,
    /// `None` when the pod is gone.
    pub new_phase: Option<Phase>,
    pub reason: TriggerReason,
    pub resource_version: ResourceVersion,
    pub fired_at: DateTime<Utc>,
}

/// Promotes a standby. Called once per firing, from the dispatch lane of the
/// failed pod. Failures are logged and do not affect the controller.
#[async_trait]
pub trait SwitchoverExecutor: Send + Sync + 'static {
    async fn switchover(&self, sw: &Switchover) -> anyhow::Result<()>;
}

/// Announces the switchover in the log and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogExecutor;

#[async_trait]
impl SwitchoverExecutor for LogExecutor {
    async fn switchover(&self, sw: &Switchover) -> anyhow::Result<()> {
        info!(target: "switchyard::failover", pod = %sw.key, "pod becomes standby; promote a replacement");
        Ok(())
    }
}

#[async_trait]
impl SwitchoverExecutor for mpsc::UnboundedSender<Switchover> {
    async fn switchover(&self, sw: &Switchover) -> anyhow::Result<()> {
        self.send(sw.clone()).map_err(|_| anyhow::anyhow!("switchover receiver dropped"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct FailoverPolicy {
    /// Also fire when a running active pod is deleted outright.
    pub trigger_on_delete: bool,
}

/// Event handler wiring [`detect`] to a [`SwitchoverExecutor`].
///
/// A key fires at most once until it is observed `Running` again.
pub struct FailoverTrigger<E> {
    executor: E,
    policy: FailoverPolicy,
    disarmed: Mutex<FxHashSet<ObjectKey>>,
    gate: Option<watch::Receiver<LifecycleState>>,
}

impl<E: SwitchoverExecutor> FailoverTrigger<E> {
    pub fn new(executor: E, policy: FailoverPolicy) -> Self {
        Self { executor, policy, disarmed: Mutex::new(FxHashSet::default()), gate: None }
    }

    /// Only fire while the lifecycle reports `Running`.
    pub fn gated(mut self, state: watch::Receiver<LifecycleState>) -> Self {
        self.gate = Some(state);
        self
    }

    fn running(&self) -> bool {
        self.gate.as_ref().map_or(true, |g| *g.borrow() == LifecycleState::Running)
    }

    fn disarmed(&self) -> std::sync::MutexGuard<'_, FxHashSet<ObjectKey>> {
        self.disarmed.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns true if the key was armed.
    fn disarm(&self, key: &ObjectKey) -> bool { self.disarmed().insert(key.clone()) }

    fn arm(&self, key: &ObjectKey) { self.disarmed().remove(key); }

    fn suppressed(&self, key: &ObjectKey, reason: TriggerReason) -> bool {
        if self.running() {
            return false;
        }
        debug!(pod = %key, reason = reason.as_str(), "failover suppressed outside running state");
        true
    }

    async fn fire(&self, obj: &WatchedObject, old_phase: Phase, new_phase: Option<Phase>, reason: TriggerReason) {
        let sw = Switchover {
            key: obj.key.clone(),
            uid: obj.uid,
            old_phase,
            new_phase,
            reason,
            resource_version: obj.resource_version,
            fired_at: Utc::now(),
        };
        let uid = sw.uid.map(|u| uuid::Uuid::from_bytes(u).to_string()).unwrap_or_default();
        let new_phase = sw.new_phase.map_or("<gone>", |p| p.as_str());
        warn!(
            target: "switchyard::failover",
            pod = %sw.key,
            uid = %uid,
            old_phase = %sw.old_phase,
            new_phase,
            reason = reason.as_str(),
            rv = %sw.resource_version,
            "failover triggered"
        );
        metrics::counter!("failover_triggers_total", "reason" => reason.as_str()).increment(1);
        if let Err(e) = self.executor.switchover(&sw).await {
            error!(target: "switchyard::failover", pod = %sw.key, error = %e, "switchover hook failed");
        }
    }
}

#[async_trait]
impl<E: SwitchoverExecutor> EventHandler for FailoverTrigger<E> {
    fn name(&self) -> &str { "failover" }

    async fn on_add(&self, obj: &Arc<WatchedObject>) -> anyhow::Result<()> {
        if obj.phase.is_running() {
            self.arm(&obj.key);
        }
        Ok(())
    }

    async fn on_update(&self, old: &Arc<WatchedObject>, new: &Arc<WatchedObject>) -> anyhow::Result<()> {
        if new.phase.is_running() {
            self.arm(&new.key);
            return Ok(());
        }
        if let Some(t) = detect(old, new) {
            // Outside `Running` the arm is kept, so a later replay of this edge still fires.
            if self.suppressed(&new.key, TriggerReason::PhaseChange) {
                return Ok(());
            }
            if self.disarm(&new.key) {
                self.fire(new, t.from, Some(t.to), TriggerReason::PhaseChange).await;
            } else {
                debug!(pod = %new.key, from = %t.from, to = %t.to, "already fired for this outage");
            }
        }
        Ok(())
    }

    async fn on_delete(&self, obj: &Arc<WatchedObject>) -> anyhow::Result<()> {
        let was_armed = !self.disarmed().remove(&obj.key);
        if self.policy.trigger_on_delete
            && was_armed
            && obj.phase.is_running()
            && !self.suppressed(&obj.key, TriggerReason::Deleted)
        {
            self.fire(obj, obj.phase, None, TriggerReason::Deleted).await;
        }
        Ok(())
    }
}
