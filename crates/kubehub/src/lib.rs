//! hubkit kubehub: typed CRD client, namespace access and watch wiring

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use hubkit_core::{ChangeType, CrdKind, HubError, HubResult, Item, MergePatch, Metadata, Spec};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    core::GroupVersionKind,
    runtime::watcher::{self, Event},
    Client,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

pub mod mock;
pub mod watch;

pub use watch::{spawn_watch, ChangeHandler, ChangeWatcher, WatchHandle, WatchOptions, WatchState};

/// Server-side bound of one watch request. kube-rs rejects values >= 295s,
/// so the feed ends (and is reopened) just under five minutes.
pub const WATCH_TIMEOUT_SECS: u32 = 290;

/// Change feed of one resource kind; ends when the server closes it.
pub type WatchStream<S> = BoxStream<'static, HubResult<(ChangeType, Item<S>)>>;

/// Typed access to one kind of namespaced custom resource.
#[async_trait]
pub trait ResourceClient<S: Spec>: Send + Sync {
    fn kind(&self) -> &CrdKind;

    /// Namespace used when a call passes `None`.
    fn default_namespace(&self) -> &str;

    async fn get(&self, name: &str, namespace: Option<&str>) -> HubResult<Item<S>>;

    async fn list(&self, namespace: Option<&str>, label_selector: Option<&str>) -> HubResult<Vec<Item<S>>>;

    async fn create(&self, metadata: Metadata, spec: S, namespace: Option<&str>) -> HubResult<Item<S>>;

    /// JSON merge-patch: absent fields are untouched, `null` clears.
    async fn patch(&self, name: &str, patch: MergePatch, namespace: Option<&str>) -> HubResult<Item<S>>;

    async fn delete(&self, name: &str, namespace: Option<&str>) -> HubResult<()>;

    /// Open a change feed bounded by [`WATCH_TIMEOUT_SECS`].
    async fn watch(&self, namespace: Option<&str>) -> HubResult<WatchStream<S>>;
}

fn map_kube_err(kind: &str, op: &str, name: &str, e: kube::Error) -> HubError {
    error!(resource = %kind, op, name, error = %e, "k8s api failed");
    match e {
        kube::Error::Api(ae) if ae.code == 404 => HubError::not_found(kind, name),
        kube::Error::Api(ae) if ae.code == 409 && op == "create" => {
            HubError::ResourceConflict(format!("{kind} {name}: {}", ae.message))
        }
        other => HubError::ApiUnavailable(format!("{op} {kind} {name}: {other}")),
    }
}

fn item_from_object<S: Spec>(obj: DynamicObject) -> HubResult<Item<S>> {
    Item::from_raw(serde_json::to_value(obj)?)
}

/// kube-rs backed [`ResourceClient`] over `Api<DynamicObject>`.
pub struct KubeResourceClient<S> {
    client: Client,
    kind: CrdKind,
    resource: ApiResource,
    namespace: String,
    _spec: PhantomData<fn() -> S>,
}

impl<S: Spec> KubeResourceClient<S> {
    pub fn new(client: Client, kind: CrdKind, namespace: &str) -> Self {
        let gvk = GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind);
        let resource = ApiResource::from_gvk_with_plural(&gvk, &kind.plural);
        Self { client, kind, resource, namespace: namespace.to_string(), _spec: PhantomData }
    }

    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace.unwrap_or(&self.namespace), &self.resource)
    }

    fn prepare(&self, metadata: &Metadata, spec: &S) -> HubResult<DynamicObject> {
        let body = serde_json::json!({
            "apiVersion": self.kind.api_version(),
            "kind": self.kind.kind,
            "metadata": metadata,
            "spec": spec,
        });
        Ok(serde_json::from_value(body)?)
    }
}

#[async_trait]
impl<S: Spec> ResourceClient<S> for KubeResourceClient<S> {
    fn kind(&self) -> &CrdKind {
        &self.kind
    }

    fn default_namespace(&self) -> &str {
        &self.namespace
    }

    async fn get(&self, name: &str, namespace: Option<&str>) -> HubResult<Item<S>> {
        let obj = self.api(namespace).get(name).await.map_err(|e| map_kube_err(&self.kind.plural, "get", name, e))?;
        item_from_object(obj)
    }

    async fn list(&self, namespace: Option<&str>, label_selector: Option<&str>) -> HubResult<Vec<Item<S>>> {
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector {
            lp = lp.labels(sel);
        }
        let list = self.api(namespace).list(&lp).await.map_err(|e| {
            error!(resource = %self.kind.plural, op = "list", error = %e, "k8s api failed");
            HubError::ApiUnavailable(format!("list {}: {e}", self.kind.plural))
        })?;
        list.items.into_iter().map(item_from_object).collect()
    }

    async fn create(&self, metadata: Metadata, spec: S, namespace: Option<&str>) -> HubResult<Item<S>> {
        let name = metadata.name.clone();
        let body = self.prepare(&metadata, &spec)?;
        let obj = self
            .api(namespace)
            .create(&PostParams::default(), &body)
            .await
            .map_err(|e| map_kube_err(&self.kind.plural, "create", &name, e))?;
        item_from_object(obj)
    }

    async fn patch(&self, name: &str, patch: MergePatch, namespace: Option<&str>) -> HubResult<Item<S>> {
        let mut body = patch.into_body();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("apiVersion".into(), self.kind.api_version().into());
            obj.insert("kind".into(), self.kind.kind.clone().into());
        }
        let obj = self
            .api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| map_kube_err(&self.kind.plural, "patch", name, e))?;
        item_from_object(obj)
    }

    async fn delete(&self, name: &str, namespace: Option<&str>) -> HubResult<()> {
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_err(&self.kind.plural, "delete", name, e))?;
        Ok(())
    }

    async fn watch(&self, namespace: Option<&str>) -> HubResult<WatchStream<S>> {
        let cfg = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);
        let plural = self.kind.plural.clone();
        let mut seen = SeenObjects::default();
        let stream = watcher::watcher(self.api(namespace), cfg).flat_map(move |ev| {
            let out = match ev {
                Ok(ev) => seen.classify(ev),
                Err(e) => vec![Err(HubError::ApiUnavailable(format!("watch {plural}: {e}")))],
            };
            futures::stream::iter(out)
        });
        debug!(resource = %self.kind.plural, ns = ?namespace, "watch opened");
        Ok(stream.boxed())
    }
}

/// Names (and namespaces) observed on one feed, used to tell an add from
/// a modify and to report objects that vanished across a relist.
#[derive(Debug, Default)]
struct SeenObjects {
    names: HashMap<String, Option<String>>,
}

impl SeenObjects {
    fn classify<S: Spec>(&mut self, ev: Event<DynamicObject>) -> Vec<HubResult<(ChangeType, Item<S>)>> {
        match ev {
            Event::Applied(obj) => {
                let name = obj.metadata.name.clone().unwrap_or_default();
                let change = match self.names.insert(name, obj.metadata.namespace.clone()) {
                    Some(_) => ChangeType::Modified,
                    None => ChangeType::Added,
                };
                vec![item_from_object(obj).map(|i| (change, i))]
            }
            Event::Deleted(obj) => {
                if let Some(name) = &obj.metadata.name {
                    self.names.remove(name);
                }
                vec![item_from_object(obj).map(|i| (ChangeType::Deleted, i))]
            }
            Event::Restarted(list) => {
                let mut previous = std::mem::take(&mut self.names);
                let mut out = Vec::with_capacity(list.len());
                for obj in list {
                    let name = obj.metadata.name.clone().unwrap_or_default();
                    let change = match previous.remove(&name) {
                        Some(_) => ChangeType::Modified,
                        None => ChangeType::Added,
                    };
                    self.names.insert(name, obj.metadata.namespace.clone());
                    out.push(item_from_object(obj).map(|i| (change, i)));
                }
                // gone while the feed was down; only the name is left
                for (name, namespace) in previous {
                    let raw = serde_json::json!({"metadata": {"name": name, "namespace": namespace}});
                    match Item::from_raw(raw) {
                        Ok(item) => out.push(Ok((ChangeType::Deleted, item))),
                        Err(e) => debug!(name = %name, error = %e, "watch: vanished object not representable"),
                    }
                }
                out
            }
        }
    }
}

// ----------------- Namespaces -----------------

/// The parts of a namespace hubkit cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRecord {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl NamespaceRecord {
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// True when every `(key, value)` of `required` is present verbatim.
    pub fn has_labels(&self, required: &BTreeMap<String, String>) -> bool {
        required.iter().all(|(k, v)| self.labels.get(k) == Some(v))
    }
}

/// Cluster-scoped namespace operations used for workspace resolution.
#[async_trait]
pub trait NamespaceApi: Send + Sync {
    async fn get(&self, name: &str) -> HubResult<NamespaceRecord>;
    async fn list(&self, label_selector: &str) -> HubResult<Vec<NamespaceRecord>>;
    async fn create(&self, record: NamespaceRecord) -> HubResult<NamespaceRecord>;
    /// Merge `annotations` into the namespace's annotations.
    async fn annotate(&self, name: &str, annotations: BTreeMap<String, String>) -> HubResult<NamespaceRecord>;
    async fn delete(&self, name: &str) -> HubResult<()>;
}

pub struct KubeNamespaces {
    api: Api<Namespace>,
}

impl KubeNamespaces {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }

    fn record(ns: Namespace) -> NamespaceRecord {
        NamespaceRecord {
            name: ns.metadata.name.unwrap_or_default(),
            labels: ns.metadata.labels.unwrap_or_default(),
            annotations: ns.metadata.annotations.unwrap_or_default(),
        }
    }
}

#[async_trait]
impl NamespaceApi for KubeNamespaces {
    async fn get(&self, name: &str) -> HubResult<NamespaceRecord> {
        let ns = self.api.get(name).await.map_err(|e| map_kube_err("namespace", "get", name, e))?;
        Ok(Self::record(ns))
    }

    async fn list(&self, label_selector: &str) -> HubResult<Vec<NamespaceRecord>> {
        let list = self.api.list(&ListParams::default().labels(label_selector)).await.map_err(|e| {
            error!(resource = "namespace", op = "list", error = %e, "k8s api failed");
            HubError::ApiUnavailable(format!("list namespaces: {e}"))
        })?;
        Ok(list.items.into_iter().map(Self::record).collect())
    }

    async fn create(&self, record: NamespaceRecord) -> HubResult<NamespaceRecord> {
        let name = record.name.clone();
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(record.name),
                labels: Some(record.labels),
                annotations: Some(record.annotations),
                ..Default::default()
            },
            ..Default::default()
        };
        let created = self
            .api
            .create(&PostParams::default(), &ns)
            .await
            .map_err(|e| map_kube_err("namespace", "create", &name, e))?;
        Ok(Self::record(created))
    }

    async fn annotate(&self, name: &str, annotations: BTreeMap<String, String>) -> HubResult<NamespaceRecord> {
        let body = serde_json::json!({ "metadata": { "annotations": annotations } });
        let ns = self
            .api
            .patch(name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| map_kube_err("namespace", "patch", name, e))?;
        Ok(Self::record(ns))
    }

    async fn delete(&self, name: &str) -> HubResult<()> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_err("namespace", "delete", name, e))?;
        Ok(())
    }
}
