//! hubkit store: per-kind resource cache.
//!
//! A snapshot `name -> item` is served until it is `max_age` old (or empty),
//! then refetched with a single upstream list that concurrent readers join.
//! Failed refetches keep the stale snapshot and retry with linear backoff;
//! after `max_retry` failures *and* `max_stale` without a successful fetch the
//! fatal hook runs (default: exit the process so a supervisor restarts it).

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use hubkit_core::{CachePolicy, ChangeType, HubError, HubResult, Item, Spec};
use hubkit_kubehub::{ChangeHandler, ResourceClient};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Runs when the cache gives up. Receives the resource name and last error.
pub type FatalHook = Arc<dyn Fn(&str, &HubError) + Send + Sync>;

type Fetch<S> = Arc<dyn Fn() -> BoxFuture<'static, HubResult<Vec<Item<S>>>> + Send + Sync>;
type Flight = Shared<BoxFuture<'static, ()>>;

/// Observable cache state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Fresh,
    /// Too old, empty or cleared; the next read refetches.
    Stale,
    Fetching,
    /// A refetch failed and a retry is scheduled; reads serve the stale snapshot.
    Backoff,
}

struct Snapshot<S> {
    items: FxHashMap<String, Arc<Item<S>>>,
    fetched_at: Option<Instant>,
}

impl<S> Snapshot<S> {
    fn empty() -> Self {
        Self { items: FxHashMap::default(), fetched_at: None }
    }
}

#[derive(Default)]
struct Bookkeeping {
    in_flight: Option<Flight>,
    retry_pending: bool,
    retry_count: u32,
    last_success: Option<Instant>,
}

struct Inner<S> {
    resource: String,
    fetch: Fetch<S>,
    policy: CachePolicy,
    snapshot: ArcSwap<Snapshot<S>>,
    book: Mutex<Bookkeeping>,
    /// Bumped by `clear`; a refetch that straddles a clear is not trusted as fresh.
    generation: AtomicU64,
    created_at: Instant,
    on_fatal: FatalHook,
}

impl<S> Inner<S> {
    fn book(&self) -> MutexGuard<'_, Bookkeeping> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_fresh(&self) -> bool {
        let snap = self.snapshot.load();
        match snap.fetched_at {
            Some(at) => !snap.items.is_empty() && at.elapsed() < self.policy.max_age,
            None => false,
        }
    }
}

pub fn exit_on_fatal() -> FatalHook {
    Arc::new(|resource: &str, err: &HubError| {
        error!(resource, error = %err, "cache: refetch failed too many times, exiting");
        std::process::exit(1);
    })
}

pub struct CacheBuilder<S> {
    resource: String,
    fetch: Fetch<S>,
    policy: CachePolicy,
    on_fatal: FatalHook,
}

impl<S: Spec> CacheBuilder<S> {
    pub fn policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn on_fatal(mut self, hook: FatalHook) -> Self {
        self.on_fatal = hook;
        self
    }

    pub fn build(self) -> ResourceCache<S> {
        ResourceCache {
            inner: Arc::new(Inner {
                resource: self.resource,
                fetch: self.fetch,
                policy: self.policy,
                snapshot: ArcSwap::from_pointee(Snapshot::empty()),
                book: Mutex::new(Bookkeeping::default()),
                generation: AtomicU64::new(0),
                created_at: Instant::now(),
                on_fatal: self.on_fatal,
            }),
        }
    }
}

/// Cheap to clone; clones share one snapshot.
pub struct ResourceCache<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for ResourceCache<S> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S: Spec> ResourceCache<S> {
    pub fn builder<F, Fut>(resource: &str, fetch: F) -> CacheBuilder<S>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HubResult<Vec<Item<S>>>> + Send + 'static,
    {
        CacheBuilder {
            resource: resource.to_string(),
            fetch: Arc::new(move || fetch().boxed()),
            policy: CachePolicy::default(),
            on_fatal: exit_on_fatal(),
        }
    }

    /// Cache backed by `client.list()` in the client's default namespace.
    pub fn for_client(client: Arc<dyn ResourceClient<S>>, policy: CachePolicy) -> Self {
        Self::client_builder(client).policy(policy).build()
    }

    pub fn client_builder(client: Arc<dyn ResourceClient<S>>) -> CacheBuilder<S> {
        let resource = client.kind().plural.clone();
        Self::builder(&resource, move || {
            let client = Arc::clone(&client);
            async move { client.list(None, None).await }
        })
    }

    pub fn resource(&self) -> &str {
        &self.inner.resource
    }

    /// Item by name; `None` when the current snapshot has not observed it.
    pub async fn get(&self, name: &str) -> Option<Arc<Item<S>>> {
        self.ensure_fresh().await;
        self.inner.snapshot.load().items.get(name).cloned()
    }

    /// Every cached item, ordered by name.
    pub async fn list(&self) -> Vec<Arc<Item<S>>> {
        self.ensure_fresh().await;
        let snap = self.inner.snapshot.load();
        let mut items: Vec<_> = snap.items.values().cloned().collect();
        items.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        items
    }

    /// Drop the snapshot; the next read refetches.
    pub fn clear(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.snapshot.store(Arc::new(Snapshot::empty()));
        debug!(resource = %self.inner.resource, "cache: cleared");
    }

    pub fn state(&self) -> CacheState {
        let book = self.inner.book();
        if book.in_flight.is_some() {
            CacheState::Fetching
        } else if book.retry_pending {
            CacheState::Backoff
        } else if self.inner.is_fresh() {
            CacheState::Fresh
        } else {
            CacheState::Stale
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.inner.book().retry_count
    }

    async fn ensure_fresh(&self) {
        let flight = {
            let mut book = self.inner.book();
            if let Some(flight) = &book.in_flight {
                debug!(resource = %self.inner.resource, "cache: wait for fetch");
                Some(flight.clone())
            } else if book.retry_pending || self.inner.is_fresh() {
                None
            } else {
                info!(resource = %self.inner.resource, "cache: not fresh");
                Some(start_refetch(&self.inner, &mut book))
            }
        };
        if let Some(flight) = flight {
            flight.await;
        }
    }
}

fn start_refetch<S: Spec>(inner: &Arc<Inner<S>>, book: &mut Bookkeeping) -> Flight {
    book.retry_pending = false;
    let task = tokio::spawn(refetch(Arc::clone(inner)));
    let weak = Arc::downgrade(inner);
    let flight = async move {
        // a panicking fetch must not leave the flight stuck
        if let Err(join) = task.await {
            if let Some(inner) = weak.upgrade() {
                let book = inner.book();
                record_failure(&inner, book, HubError::ApiUnavailable(format!("refetch task failed: {join}")));
            }
        }
    }
    .boxed()
    .shared();
    book.in_flight = Some(flight.clone());
    flight
}

fn refetch<S: Spec>(inner: Arc<Inner<S>>) -> BoxFuture<'static, ()> {
    async move { refetch_once(inner).await }.boxed()
}

async fn refetch_once<S: Spec>(inner: Arc<Inner<S>>) {
    let resource = inner.resource.clone();
    info!(resource = %resource, "cache: start refetch");
    counter!("cache_refetch_total", 1, "resource" => resource.clone());
    let generation = inner.generation.load(Ordering::SeqCst);
    let result = (inner.fetch)().await;

    let mut book = inner.book();
    match result {
        Ok(items) => {
            let count = items.len();
            let cleared_meanwhile = inner.generation.load(Ordering::SeqCst) != generation;
            let now = Instant::now();
            let items = items.into_iter().map(|i| (i.metadata.name.clone(), Arc::new(i))).collect();
            inner
                .snapshot
                .store(Arc::new(Snapshot { items, fetched_at: (!cleared_meanwhile).then_some(now) }));
            book.retry_count = 0;
            book.last_success = Some(now);
            book.in_flight = None;
            info!(resource = %resource, count, "cache: refetch done");
        }
        Err(err) => record_failure(&inner, book, err),
    }
}

/// Counts a failed refetch and either schedules the next attempt or runs the fatal hook.
fn record_failure<S: Spec>(inner: &Arc<Inner<S>>, mut book: MutexGuard<'_, Bookkeeping>, err: HubError) {
    let resource = inner.resource.as_str();
    book.in_flight = None;
    book.retry_count += 1;
    counter!("cache_refetch_errors_total", 1, "resource" => resource.to_string());
    warn!(resource, retry = book.retry_count, error = %err, "cache: refetch failed");
    let stale_for = book.last_success.unwrap_or(inner.created_at).elapsed();
    if book.retry_count > inner.policy.max_retry && stale_for >= inner.policy.max_stale {
        error!(
            resource,
            retries = book.retry_count,
            stale_secs = stale_for.as_secs(),
            "cache: refetch failed too many times"
        );
        drop(book);
        (inner.on_fatal)(resource, &err);
        return;
    }
    book.retry_pending = true;
    let delay = inner.policy.retry_delay * book.retry_count;
    drop(book);
    tokio::spawn(retry_after(Arc::downgrade(inner), delay));
}

async fn retry_after<S: Spec>(weak: Weak<Inner<S>>, delay: std::time::Duration) {
    tokio::time::sleep(delay).await;
    let Some(inner) = weak.upgrade() else { return };
    let flight = {
        let mut book = inner.book();
        if !book.retry_pending {
            // a reader or clear already moved on
            return;
        }
        match &book.in_flight {
            Some(flight) => flight.clone(),
            None => start_refetch(&inner, &mut book),
        }
    };
    flight.await;
}

/// Any observed change invalidates the whole snapshot.
#[async_trait]
impl<S: Spec> ChangeHandler<S> for ResourceCache<S> {
    async fn on_change(&self, change: ChangeType, item: &Item<S>) -> HubResult<()> {
        debug!(resource = %self.inner.resource, name = %item.name(), change = change.as_str(), "cache: invalidate");
        self.clear();
        Ok(())
    }
}
