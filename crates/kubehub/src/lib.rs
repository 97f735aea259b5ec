//! Switchyard kubehub: Pod list + watch wiring against the Kubernetes API.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams, WatchEvent, WatchParams},
    Client,
};
use smallvec::SmallVec;
use switchyard_core::{
    Filter, ListPage, ObjectKey, ObjectSource, Phase, ResourceVersion, SourceError, SourceEvent, WatchStream,
    WatchedObject,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// HTTP status the API server uses for an expired resource version.
const GONE: u16 = 410;

/// Server-side watch timeout. Must stay below the API server's 295s cap.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Pods matching a label selector, optionally scoped to one namespace.
#[derive(Clone)]
pub struct KubeSource {
    api: Api<Pod>,
}

impl KubeSource {
    pub fn new(client: Client, filter: &Filter) -> Self {
        let api = match filter.namespace.as_deref() {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        Self { api }
    }

    /// Build from the ambient kubeconfig / in-cluster config.
    pub async fn try_default(filter: &Filter) -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self::new(client, filter))
    }
}

#[async_trait::async_trait]
impl ObjectSource for KubeSource {
    async fn list(&self, filter: &Filter) -> Result<ListPage, SourceError> {
        let lp = ListParams::default().labels(&filter.label_selector);
        let list = self.api.list(&lp).await.map_err(map_kube_err)?;
        let resource_version: ResourceVersion = list
            .metadata
            .resource_version
            .as_deref()
            .ok_or_else(|| SourceError::Malformed("list response missing resourceVersion".into()))?
            .parse()?;
        let mut items = Vec::with_capacity(list.items.len());
        for pod in list.items.iter() {
            match object_from_pod(pod) {
                Ok(o) => items.push(o),
                Err(e) => {
                    warn!(error = %e, "dropping malformed pod from list");
                    metrics::counter!("source_malformed_total").increment(1);
                }
            }
        }
        info!(selector = %filter.label_selector, items = items.len(), rv = %resource_version, "pods listed");
        Ok(ListPage { items, resource_version })
    }

    async fn watch(&self, filter: &Filter, since: ResourceVersion) -> Result<WatchStream, SourceError> {
        let wp = WatchParams::default().labels(&filter.label_selector).timeout(WATCH_TIMEOUT_SECS);
        let stream = self.api.watch(&wp, &since.to_string()).await.map_err(map_kube_err)?;
        debug!(selector = %filter.label_selector, since = %since, "watch opened");
        let mapped = stream
            .map_err(map_kube_err)
            .map(|item| item.and_then(source_event_from));
        Ok(mapped.boxed())
    }
}

fn source_event_from(ev: WatchEvent<Pod>) -> Result<SourceEvent, SourceError> {
    match ev {
        WatchEvent::Added(p) => object_from_pod(&p).map(SourceEvent::Added),
        WatchEvent::Modified(p) => object_from_pod(&p).map(SourceEvent::Modified),
        WatchEvent::Deleted(p) => object_from_pod(&p).map(SourceEvent::Deleted),
        WatchEvent::Bookmark(b) => b.metadata.resource_version.parse().map(SourceEvent::Bookmark),
        WatchEvent::Error(e) if e.code == GONE => Err(SourceError::Gone(e.message)),
        WatchEvent::Error(e) => Err(SourceError::Transport(format!("{} ({})", e.message, e.code))),
    }
}

fn map_kube_err(e: kube::Error) -> SourceError {
    match e {
        kube::Error::Api(ae) if ae.code == GONE => SourceError::Gone(ae.message),
        other => SourceError::Transport(other.to_string()),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_uid(uid_str: &str) -> Result<switchyard_core::Uid> {
    let u = Uuid::parse_str(uid_str).context("parsing metadata.uid as uuid")?;
    Ok(*u.as_bytes())
}

/// Shape a Pod into the watched-object model.
pub fn object_from_pod(pod: &Pod) -> Result<WatchedObject, SourceError> {
    let meta = &pod.metadata;
    let name = meta
        .name
        .clone()
        .ok_or_else(|| SourceError::Malformed("pod missing metadata.name".into()))?;
    let namespace = meta.namespace.clone().unwrap_or_default();
    let resource_version: ResourceVersion = meta
        .resource_version
        .as_deref()
        .ok_or_else(|| SourceError::Malformed(format!("pod {}/{} missing resourceVersion", namespace, name)))?
        .parse()?;
    let uid = match meta.uid.as_deref().map(to_uid) {
        Some(Ok(u)) => Some(u),
        Some(Err(e)) => {
            debug!(error = %e, pod = %name, "ignoring unparsable uid");
            None
        }
        None => None,
    };
    let phase = Phase::parse(pod.status.as_ref().and_then(|s| s.phase.as_deref()));
    let labels: SmallVec<[(String, String); 8]> = meta
        .labels
        .as_ref()
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    let mut raw = serde_json::to_value(pod).map_err(|e| SourceError::Malformed(format!("serializing pod: {}", e)))?;
    strip_managed_fields(&mut raw);
    Ok(WatchedObject { key: ObjectKey { namespace, name }, uid, phase, resource_version, labels, raw })
}
