//! In-memory backends for tests and local runs.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use hubkit_core::{ChangeType, CrdKind, HubError, HubResult, Item, MergePatch, Metadata, Spec};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::{NamespaceApi, NamespaceRecord, ResourceClient, WatchStream};

/// RFC 7386 merge: objects merge recursively, `null` removes, anything
/// else replaces.
pub fn json_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(obj) = target {
        for (k, v) in patch {
            if v.is_null() {
                obj.remove(k);
            } else {
                json_merge_patch(obj.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

/// Equality-only selector (`a=b,c==d`); an empty selector matches everything.
pub fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector.split(',').map(str::trim).filter(|s| !s.is_empty()).all(|term| {
        let (k, v) = term.split_once("==").or_else(|| term.split_once('=')).unwrap_or((term, ""));
        match labels.get(k.trim()) {
            Some(actual) => v.is_empty() || actual == v.trim(),
            None => false,
        }
    })
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
enum Feed {
    Event { namespace: String, change: ChangeType, raw: Value },
    Error(String),
    Close,
}

/// Per-operation call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub get: usize,
    pub list: usize,
    pub create: usize,
    pub patch: usize,
    pub delete: usize,
    pub watch: usize,
}

#[derive(Default)]
struct Counters {
    get: AtomicUsize,
    list: AtomicUsize,
    create: AtomicUsize,
    patch: AtomicUsize,
    delete: AtomicUsize,
    watch: AtomicUsize,
}

struct Store {
    objects: BTreeMap<(String, String), Value>,
    resource_version: u64,
}

/// [`ResourceClient`] over a map of raw objects, with a broadcast change
/// feed and knobs for injecting list failures and latency.
pub struct MemoryResourceClient<S> {
    kind: CrdKind,
    namespace: String,
    store: Mutex<Store>,
    feed: broadcast::Sender<Feed>,
    counters: Counters,
    failing_lists: AtomicU32,
    lists_down: AtomicBool,
    failing_creates: AtomicU32,
    list_delay: Mutex<Option<Duration>>,
    _spec: PhantomData<fn() -> S>,
}

impl<S: Spec> MemoryResourceClient<S> {
    pub fn new(kind: CrdKind, namespace: &str) -> Self {
        let (feed, _) = broadcast::channel(256);
        Self {
            kind,
            namespace: namespace.to_string(),
            store: Mutex::new(Store { objects: BTreeMap::new(), resource_version: 0 }),
            feed,
            counters: Counters::default(),
            failing_lists: AtomicU32::new(0),
            lists_down: AtomicBool::new(false),
            failing_creates: AtomicU32::new(0),
            list_delay: Mutex::new(None),
            _spec: PhantomData,
        }
    }

    fn ns<'a>(&'a self, namespace: Option<&'a str>) -> &'a str {
        namespace.unwrap_or(&self.namespace)
    }

    fn stamp(&self, store: &mut Store, meta: &mut serde_json::Map<String, Value>) {
        store.resource_version += 1;
        meta.insert("resourceVersion".into(), Value::String(store.resource_version.to_string()));
    }

    fn publish(&self, namespace: &str, change: ChangeType, raw: &Value) {
        let _ = self.feed.send(Feed::Event { namespace: namespace.to_string(), change, raw: raw.clone() });
    }

    /// Insert an object without going through `create`: no event, no count.
    pub fn seed(&self, namespace: Option<&str>, name: &str, spec: Value) {
        let ns = self.ns(namespace).to_string();
        let raw = json!({
            "apiVersion": self.kind.api_version(),
            "kind": self.kind.kind,
            "metadata": {"name": name, "namespace": ns, "creationTimestamp": chrono::Utc::now().to_rfc3339()},
            "spec": spec,
        });
        locked(&self.store).objects.insert((ns, name.to_string()), raw);
    }

    pub fn contains(&self, namespace: Option<&str>, name: &str) -> bool {
        locked(&self.store).objects.contains_key(&(self.ns(namespace).to_string(), name.to_string()))
    }

    /// Stored object as the API would return it.
    pub fn raw(&self, namespace: Option<&str>, name: &str) -> Option<Value> {
        locked(&self.store).objects.get(&(self.ns(namespace).to_string(), name.to_string())).cloned()
    }

    pub fn calls(&self) -> CallCounts {
        let c = &self.counters;
        CallCounts {
            get: c.get.load(Ordering::SeqCst),
            list: c.list.load(Ordering::SeqCst),
            create: c.create.load(Ordering::SeqCst),
            patch: c.patch.load(Ordering::SeqCst),
            delete: c.delete.load(Ordering::SeqCst),
            watch: c.watch.load(Ordering::SeqCst),
        }
    }

    /// The next `n` list calls fail with `ApiUnavailable`.
    pub fn fail_next_lists(&self, n: u32) {
        self.failing_lists.store(n, Ordering::SeqCst);
    }

    /// Every list call fails until turned off again.
    pub fn set_list_failing(&self, down: bool) {
        self.lists_down.store(down, Ordering::SeqCst);
    }

    pub fn set_list_delay(&self, delay: Option<Duration>) {
        *locked(&self.list_delay) = delay;
    }

    /// The next `n` create calls fail with `ApiUnavailable`.
    pub fn fail_next_creates(&self, n: u32) {
        self.failing_creates.store(n, Ordering::SeqCst);
    }

    /// Push an event for `name` (default namespace) to every open watch,
    /// using the stored object when there is one.
    pub fn emit(&self, change: ChangeType, name: &str) {
        let raw = self.raw(None, name).unwrap_or_else(|| {
            json!({"metadata": {"name": name, "namespace": self.namespace}, "spec": {}})
        });
        self.publish(&self.namespace, change, &raw);
    }

    /// End every open watch cleanly.
    pub fn close_watches(&self) {
        let _ = self.feed.send(Feed::Close);
    }

    /// End every open watch with an error.
    pub fn fail_watches(&self, message: &str) {
        let _ = self.feed.send(Feed::Error(message.to_string()));
    }

    pub fn watcher_count(&self) -> usize {
        self.feed.receiver_count()
    }

    pub async fn wait_for_watchers(&self, n: usize) {
        while self.watcher_count() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    pub async fn wait_for_watch_calls(&self, n: usize) {
        while self.counters.watch.load(Ordering::SeqCst) < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn take_failure(flag: &AtomicU32) -> bool {
        flag.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }
}

#[async_trait]
impl<S: Spec> ResourceClient<S> for MemoryResourceClient<S> {
    fn kind(&self) -> &CrdKind {
        &self.kind
    }

    fn default_namespace(&self) -> &str {
        &self.namespace
    }

    async fn get(&self, name: &str, namespace: Option<&str>) -> HubResult<Item<S>> {
        self.counters.get.fetch_add(1, Ordering::SeqCst);
        let raw = self.raw(namespace, name).ok_or_else(|| HubError::not_found(&self.kind.plural, name))?;
        Item::from_raw(raw)
    }

    async fn list(&self, namespace: Option<&str>, label_selector: Option<&str>) -> HubResult<Vec<Item<S>>> {
        self.counters.list.fetch_add(1, Ordering::SeqCst);
        let delay = *locked(&self.list_delay);
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if self.lists_down.load(Ordering::SeqCst) || Self::take_failure(&self.failing_lists) {
            return Err(HubError::ApiUnavailable(format!("list {}: injected failure", self.kind.plural)));
        }
        let ns = self.ns(namespace);
        let raws: Vec<Value> = locked(&self.store)
            .objects
            .iter()
            .filter(|((n, _), _)| n == ns)
            .map(|(_, raw)| raw.clone())
            .collect();
        raws.into_iter()
            .map(Item::<S>::from_raw)
            .filter(|item| match (item, label_selector) {
                (Ok(i), Some(sel)) => selector_matches(sel, &i.metadata.labels),
                _ => true,
            })
            .collect()
    }

    async fn create(&self, metadata: Metadata, spec: S, namespace: Option<&str>) -> HubResult<Item<S>> {
        self.counters.create.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_creates) {
            return Err(HubError::ApiUnavailable(format!("create {}: injected failure", self.kind.plural)));
        }
        let ns = self.ns(namespace).to_string();
        let name = metadata.name.clone();
        let mut meta = serde_json::to_value(&metadata)?;
        let raw = {
            let mut store = locked(&self.store);
            let key = (ns.clone(), name.clone());
            if store.objects.contains_key(&key) {
                return Err(HubError::ResourceConflict(format!("{} {name}", self.kind.plural)));
            }
            if let Some(m) = meta.as_object_mut() {
                m.insert("namespace".into(), Value::String(ns.clone()));
                m.insert("creationTimestamp".into(), Value::String(chrono::Utc::now().to_rfc3339()));
                self.stamp(&mut store, m);
            }
            let raw = json!({
                "apiVersion": self.kind.api_version(),
                "kind": self.kind.kind,
                "metadata": meta,
                "spec": serde_json::to_value(&spec)?,
            });
            store.objects.insert(key, raw.clone());
            raw
        };
        self.publish(&ns, ChangeType::Added, &raw);
        Item::from_raw(raw)
    }

    async fn patch(&self, name: &str, patch: MergePatch, namespace: Option<&str>) -> HubResult<Item<S>> {
        self.counters.patch.fetch_add(1, Ordering::SeqCst);
        let ns = self.ns(namespace).to_string();
        let raw = {
            let mut store = locked(&self.store);
            let key = (ns.clone(), name.to_string());
            let mut raw =
                store.objects.get(&key).cloned().ok_or_else(|| HubError::not_found(&self.kind.plural, name))?;
            json_merge_patch(&mut raw, &patch.into_body());
            if let Some(m) = raw.get_mut("metadata").and_then(Value::as_object_mut) {
                self.stamp(&mut store, m);
            }
            store.objects.insert(key, raw.clone());
            raw
        };
        self.publish(&ns, ChangeType::Modified, &raw);
        Item::from_raw(raw)
    }

    async fn delete(&self, name: &str, namespace: Option<&str>) -> HubResult<()> {
        self.counters.delete.fetch_add(1, Ordering::SeqCst);
        let ns = self.ns(namespace).to_string();
        let removed = locked(&self.store).objects.remove(&(ns.clone(), name.to_string()));
        let raw = removed.ok_or_else(|| HubError::not_found(&self.kind.plural, name))?;
        self.publish(&ns, ChangeType::Deleted, &raw);
        Ok(())
    }

    async fn watch(&self, namespace: Option<&str>) -> HubResult<WatchStream<S>> {
        self.counters.watch.fetch_add(1, Ordering::SeqCst);
        let ns = self.ns(namespace).to_string();
        let rx = self.feed.subscribe();
        let stream = futures::stream::unfold(Some(rx), move |rx| {
            let ns = ns.clone();
            async move {
                let mut rx = rx?;
                loop {
                    match rx.recv().await {
                        Ok(Feed::Event { namespace, change, raw }) if namespace == ns => {
                            return Some((Item::from_raw(raw).map(|i| (change, i)), Some(rx)));
                        }
                        Ok(Feed::Event { .. }) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Ok(Feed::Error(msg)) => return Some((Err(HubError::ApiUnavailable(msg)), None)),
                        Ok(Feed::Close) | Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// [`NamespaceApi`] over a map.
#[derive(Default)]
pub struct MemoryNamespaces {
    namespaces: Mutex<BTreeMap<String, NamespaceRecord>>,
}

impl MemoryNamespaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: NamespaceRecord) {
        locked(&self.namespaces).insert(record.name.clone(), record);
    }

    pub fn record(&self, name: &str) -> Option<NamespaceRecord> {
        locked(&self.namespaces).get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        locked(&self.namespaces).contains_key(name)
    }
}

#[async_trait]
impl NamespaceApi for MemoryNamespaces {
    async fn get(&self, name: &str) -> HubResult<NamespaceRecord> {
        self.record(name).ok_or_else(|| HubError::not_found("namespace", name))
    }

    async fn list(&self, label_selector: &str) -> HubResult<Vec<NamespaceRecord>> {
        Ok(locked(&self.namespaces)
            .values()
            .filter(|ns| selector_matches(label_selector, &ns.labels))
            .cloned()
            .collect())
    }

    async fn create(&self, record: NamespaceRecord) -> HubResult<NamespaceRecord> {
        let mut map = locked(&self.namespaces);
        if map.contains_key(&record.name) {
            return Err(HubError::ResourceConflict(format!("namespace {}", record.name)));
        }
        map.insert(record.name.clone(), record.clone());
        Ok(record)
    }

    async fn annotate(&self, name: &str, annotations: BTreeMap<String, String>) -> HubResult<NamespaceRecord> {
        let mut map = locked(&self.namespaces);
        let ns = map.get_mut(name).ok_or_else(|| HubError::not_found("namespace", name))?;
        ns.annotations.extend(annotations);
        Ok(ns.clone())
    }

    async fn delete(&self, name: &str) -> HubResult<()> {
        locked(&self.namespaces).remove(name).map(|_| ()).ok_or_else(|| HubError::not_found("namespace", name))
    }
}
