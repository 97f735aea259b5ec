//! Audit trail: a structured log line for every dispatched event.

use std::sync::Arc;

use async_trait::async_trait;
use switchyard_core::WatchedObject;
use tracing::info;

use crate::dispatch::EventHandler;

/// One structured line per dispatched event, under the `switchyard::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuditLog;

#[async_trait]
impl EventHandler for AuditLog {
    fn name(&self) -> &str { "audit" }

    async fn on_add(&self, obj: &Arc<WatchedObject>) -> anyhow::Result<()> {
        info!(
            target: "switchyard::audit",
            ns = %obj.key.namespace,
            pod = %obj.key.name,
            phase = %obj.phase,
            rv = %obj.resource_version,
            "pod added"
        );
        Ok(())
    }

    async fn on_update(&self, old: &Arc<WatchedObject>, new: &Arc<WatchedObject>) -> anyhow::Result<()> {
        info!(
            target: "switchyard::audit",
            ns = %new.key.namespace,
            pod = %new.key.name,
            phase = %new.phase,
            old_phase = %old.phase,
            rv = %new.resource_version,
            "pod updated"
        );
        Ok(())
    }

    async fn on_delete(&self, obj: &Arc<WatchedObject>) -> anyhow::Result<()> {
        info!(target: "switchyard::audit", ns = %obj.key.namespace, pod = %obj.key.name, "pod deleted");
        Ok(())
    }
}
