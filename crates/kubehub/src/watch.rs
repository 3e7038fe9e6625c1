//! Long-lived change feeds: a callback-style watch and a supervised
//! rewatch loop that turns upstream changes into invalidation callbacks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use hubkit_core::{ChangeType, HubError, HubResult, Item, Spec};
use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{ResourceClient, WatchStream};

/// Receives every change seen on a feed. Errors are logged by the caller
/// and never stop the feed.
#[async_trait]
pub trait ChangeHandler<S: Spec>: Send + Sync {
    async fn on_change(&self, change: ChangeType, item: &Item<S>) -> HubResult<()>;
}

/// Closure adapter, handy for ad-hoc invalidation callbacks.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<S, F> ChangeHandler<S> for FnHandler<F>
where
    S: Spec,
    F: Fn(ChangeType, &Item<S>) -> HubResult<()> + Send + Sync,
{
    async fn on_change(&self, change: ChangeType, item: &Item<S>) -> HubResult<()> {
        (self.0)(change, item)
    }
}

// ----------------- Callback watch -----------------

/// Abort handle for [`spawn_watch`].
#[derive(Debug)]
pub struct WatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Wait until the feed is over and `done` has run.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Open one change feed, call `handler` for every event and `done` exactly
/// once when the feed ends: naturally (`None`), on error (`Some(err)`) or
/// after [`WatchHandle::abort`] (`None`).
pub fn spawn_watch<S, H, D>(
    client: Arc<dyn ResourceClient<S>>,
    namespace: Option<String>,
    mut handler: H,
    done: D,
) -> WatchHandle
where
    S: Spec,
    H: FnMut(ChangeType, Item<S>) + Send + 'static,
    D: FnOnce(Option<HubError>) + Send + 'static,
{
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let result: HubResult<()> = async {
            let mut stream = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                opened = client.watch(namespace.as_deref()) => opened?,
            };
            loop {
                tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    next = stream.next() => match next {
                        Some(Ok((change, item))) => handler(change, item),
                        Some(Err(e)) => return Err(e),
                        None => return Ok(()),
                    },
                }
            }
        }
        .await;
        done(result.err());
    });
    WatchHandle { cancel, task }
}

// ----------------- Supervised watcher -----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Opening (or reopening) the feed.
    Starting,
    Watching,
    /// Waiting before a rewatch after an error.
    Backoff,
    /// Feed ended or failed with `rewatch` disabled.
    Stopped,
    /// Terminal, after [`ChangeWatcher::abort`].
    Aborted,
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Namespace to watch; `None` uses the client's default namespace.
    pub namespace: Option<String>,
    /// Reopen the feed after it ends or fails.
    pub rewatch: bool,
    /// Pause before reopening after an error.
    pub backoff: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self { namespace: None, rewatch: true, backoff: Duration::from_secs(1) }
    }
}

enum Outcome {
    Ended,
    Failed(HubError),
    Aborted,
}

/// Supervisor loop around [`ResourceClient::watch`]. Every event is handed
/// to the handler (typically a cache invalidation); the event payload is
/// never applied to any cache directly.
pub struct ChangeWatcher {
    resource: String,
    cancel: CancellationToken,
    state: watch::Receiver<WatchState>,
    task: JoinHandle<()>,
}

impl ChangeWatcher {
    pub fn spawn<S: Spec>(
        client: Arc<dyn ResourceClient<S>>,
        handler: Arc<dyn ChangeHandler<S>>,
        opts: WatchOptions,
    ) -> Self {
        let resource = client.kind().plural.clone();
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(WatchState::Starting);
        let task = tokio::spawn(supervise(client, handler, opts, cancel.clone(), state_tx));
        Self { resource, cancel, state: state_rx, task }
    }

    /// Cancel the pending request and suppress any rewatch.
    pub fn abort(&self) {
        info!(resource = %self.resource, "watch: abort requested");
        self.cancel.cancel();
    }

    pub fn state(&self) -> WatchState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WatchState> {
        self.state.clone()
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

async fn supervise<S: Spec>(
    client: Arc<dyn ResourceClient<S>>,
    handler: Arc<dyn ChangeHandler<S>>,
    opts: WatchOptions,
    cancel: CancellationToken,
    state: watch::Sender<WatchState>,
) {
    let resource = client.kind().plural.clone();
    loop {
        let _ = state.send(WatchState::Starting);
        info!(resource = %resource, ns = ?opts.namespace, "watch: start");
        let started = tokio::time::Instant::now();
        let opened = tokio::select! {
            _ = cancel.cancelled() => break,
            opened = client.watch(opts.namespace.as_deref()) => opened,
        };
        let outcome = match opened {
            Ok(mut stream) => {
                let _ = state.send(WatchState::Watching);
                pump(&mut stream, handler.as_ref(), &resource, &cancel).await
            }
            Err(e) => Outcome::Failed(e),
        };
        match outcome {
            Outcome::Aborted => break,
            Outcome::Ended => {
                debug!(resource = %resource, "watch: feed ended");
                if !opts.rewatch {
                    let _ = state.send(WatchState::Stopped);
                    return;
                }
                // a feed that closes right away is reopened no faster than the backoff
                let lived = started.elapsed();
                if lived < opts.backoff {
                    debug!(resource = %resource, lived_ms = lived.as_millis() as u64, "watch: feed ended early");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(opts.backoff - lived) => {}
                    }
                }
            }
            Outcome::Failed(e) => {
                error!(resource = %resource, error = %e, "watch: error");
                counter!("watch_errors_total", 1, "resource" => resource.clone());
                if !opts.rewatch {
                    let _ = state.send(WatchState::Stopped);
                    return;
                }
                let _ = state.send(WatchState::Backoff);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(opts.backoff) => {}
                }
            }
        }
    }
    let _ = state.send(WatchState::Aborted);
    info!(resource = %resource, "watch: aborted");
}

async fn pump<S: Spec>(
    stream: &mut WatchStream<S>,
    handler: &dyn ChangeHandler<S>,
    resource: &str,
    cancel: &CancellationToken,
) -> Outcome {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Outcome::Aborted,
            next = stream.next() => next,
        };
        match next {
            Some(Ok((change, item))) => {
                info!(resource, name = %item.name(), change = change.as_str(), "watch: resource event");
                counter!("watch_events_total", 1, "resource" => resource.to_string());
                if let Err(e) = handler.on_change(change, &item).await {
                    warn!(resource, name = %item.name(), error = %e, "watch: handler error");
                }
            }
            Some(Err(e)) => return Outcome::Failed(e),
            None => return Outcome::Ended,
        }
    }
}
