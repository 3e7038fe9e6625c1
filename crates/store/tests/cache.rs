#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hubkit_core::{CachePolicy, ChangeType, CrdKind, HubError, Item};
use hubkit_kubehub::mock::MemoryResourceClient;
use hubkit_kubehub::{ChangeHandler, ResourceClient};
use hubkit_store::{CacheState, FatalHook, ResourceCache};
use serde_json::{json, Value};

fn client() -> Arc<MemoryResourceClient<Value>> {
    let c = Arc::new(MemoryResourceClient::new(CrdKind::new("hub.io", "v1alpha1", "images", "Image"), "hub"));
    c.seed(None, "base", json!({"url": "registry/base:1"}));
    c.seed(None, "cuda", json!({"url": "registry/cuda:12"}));
    c
}

fn counting_hook() -> (FatalHook, Arc<AtomicUsize>) {
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    let hook: FatalHook = Arc::new(move |_resource: &str, _err: &HubError| {
        f.fetch_add(1, Ordering::SeqCst);
    });
    (hook, fired)
}

fn cache_for(c: &Arc<MemoryResourceClient<Value>>, policy: CachePolicy, hook: FatalHook) -> ResourceCache<Value> {
    ResourceCache::client_builder(c.clone() as Arc<dyn ResourceClient<Value>>).policy(policy).on_fatal(hook).build()
}

#[tokio::test(start_paused = true)]
async fn concurrent_readers_share_one_list() {
    let c = client();
    c.set_list_delay(Some(Duration::from_millis(200)));
    let (hook, _) = counting_hook();
    let cache = cache_for(&c, CachePolicy::default(), hook);

    let (a, b, missing) = tokio::join!(cache.get("base"), cache.get("cuda"), cache.get("nope"));
    assert_eq!(a.map(|i| i.spec["url"].clone()), Some(json!("registry/base:1")));
    assert!(b.is_some());
    assert!(missing.is_none());
    assert_eq!(c.calls().list, 1);

    // fresh: served from the snapshot
    assert_eq!(cache.list().await.len(), 2);
    assert_eq!(c.calls().list, 1);
}

#[tokio::test(start_paused = true)]
async fn list_returns_items_in_name_order() {
    let c = client();
    c.seed(None, "alpha", json!({}));
    let (hook, _) = counting_hook();
    let cache = cache_for(&c, CachePolicy::default(), hook);
    let names: Vec<String> = cache.list().await.iter().map(|i| i.metadata.name.clone()).collect();
    assert_eq!(names, ["alpha", "base", "cuda"]);
}

#[tokio::test(start_paused = true)]
async fn stale_snapshot_triggers_refetch() {
    let c = client();
    let (hook, _) = counting_hook();
    let policy = CachePolicy { max_age: Duration::from_secs(60), ..Default::default() };
    let cache = cache_for(&c, policy, hook);

    cache.get("base").await;
    tokio::time::advance(Duration::from_secs(59)).await;
    cache.get("base").await;
    assert_eq!(c.calls().list, 1);
    tokio::time::advance(Duration::from_secs(1)).await;
    cache.get("base").await;
    assert_eq!(c.calls().list, 2);
}

#[tokio::test(start_paused = true)]
async fn empty_upstream_is_never_fresh() {
    let c = Arc::new(MemoryResourceClient::<Value>::new(CrdKind::new("hub.io", "v1", "datasets", "Dataset"), "hub"));
    let (hook, _) = counting_hook();
    let cache = cache_for(&c, CachePolicy::default(), hook);
    assert!(cache.get("x").await.is_none());
    assert!(cache.get("x").await.is_none());
    assert_eq!(c.calls().list, 2);
}

#[tokio::test(start_paused = true)]
async fn failures_within_budget_recover() {
    let c = client();
    c.fail_next_lists(3);
    let (hook, fired) = counting_hook();
    let cache = cache_for(&c, CachePolicy::default(), hook);

    // first read fails and serves the (empty) stale snapshot
    assert!(cache.get("base").await.is_none());
    assert_eq!(cache.retry_count(), 1);
    assert_eq!(cache.state(), CacheState::Backoff);

    // reads during backoff do not hit upstream
    assert!(cache.get("base").await.is_none());
    assert_eq!(c.calls().list, 1);

    // retries after 1s, 2s, 3s; the fourth list succeeds
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(c.calls().list, 4);
    assert_eq!(cache.retry_count(), 0);
    assert_eq!(cache.state(), CacheState::Fresh);
    assert!(cache.get("base").await.is_some());
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn stale_data_is_kept_while_upstream_fails() {
    let c = client();
    let (hook, fired) = counting_hook();
    let cache = cache_for(&c, CachePolicy::default(), hook);
    assert!(cache.get("base").await.is_some());

    c.set_list_failing(true);
    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(cache.get("base").await.is_some(), "stale snapshot still served");
    assert_eq!(cache.retry_count(), 1);

    c.set_list_failing(false);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(cache.retry_count(), 0);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn persistent_failure_runs_fatal_hook_once() {
    let c = client();
    c.set_list_failing(true);
    let (hook, fired) = counting_hook();
    let policy = CachePolicy {
        max_age: Duration::from_secs(60),
        retry_delay: Duration::from_secs(1),
        max_retry: 2,
        max_stale: Duration::from_secs(10),
    };
    let cache = cache_for(&c, policy, hook);
    cache.get("base").await;

    // failures at t=0, 1, 3, 6, 10: the retry budget is exhausted at t=3 but
    // the data has only been stale long enough at t=10
    tokio::time::sleep(Duration::from_secs(9)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(c.calls().list, 5);
    assert_eq!(cache.state(), CacheState::Stale);
}

#[tokio::test(start_paused = true)]
async fn retry_budget_alone_is_not_fatal() {
    let c = client();
    let (hook, fired) = counting_hook();
    let policy = CachePolicy { max_retry: 1, max_stale: Duration::from_secs(3600), ..Default::default() };
    let cache = cache_for(&c, policy, hook);
    assert!(cache.get("base").await.is_some());

    c.set_list_failing(true);
    tokio::time::advance(Duration::from_secs(60)).await;
    cache.get("base").await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(cache.retry_count() > 1);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn watch_events_clear_the_snapshot() {
    let c = client();
    let (hook, _) = counting_hook();
    let cache = cache_for(&c, CachePolicy::default(), hook);
    cache.get("base").await;
    assert_eq!(cache.state(), CacheState::Fresh);

    let changed: Item<Value> = c.get("base", None).await.expect("get");
    cache.on_change(ChangeType::Modified, &changed).await.expect("invalidate");
    assert_eq!(cache.state(), CacheState::Stale);
    cache.get("base").await;
    assert_eq!(c.calls().list, 2);
}

#[tokio::test(start_paused = true)]
async fn clear_after_write_shows_new_item() {
    let c = client();
    let (hook, _) = counting_hook();
    let cache = cache_for(&c, CachePolicy::default(), hook);
    assert!(cache.get("new").await.is_none());
    c.create(hubkit_core::Metadata::named("new"), json!({}), None).await.expect("create");
    cache.clear();
    assert!(cache.get("new").await.is_some());
}

#[tokio::test(start_paused = true)]
async fn panicking_fetch_backs_off_and_recovers() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let (hook, fired) = counting_hook();
    let cache = ResourceCache::<Value>::builder("images", move || {
        let n = c.fetch_add(1, Ordering::SeqCst);
        async move {
            if n == 0 {
                panic!("list decoder blew up");
            }
            Ok(vec![Item::from_raw(json!({"metadata": {"name": "base"}, "spec": {}})).expect("item")])
        }
    })
    .on_fatal(hook)
    .build();

    assert!(cache.get("base").await.is_none());
    assert_eq!(cache.state(), CacheState::Backoff);
    assert_eq!(cache.retry_count(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.state(), CacheState::Fresh);
    assert!(cache.get("base").await.is_some());
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}
