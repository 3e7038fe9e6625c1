use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use hubkit_core::{CrdKind, HubConfig, ResourcePrefix};
use hubkit_idp::{IdentityProvider, KeycloakAdmin};
use hubkit_kubehub::{ChangeWatcher, KubeNamespaces, KubeResourceClient, ResourceClient, WatchOptions};
use hubkit_registry::RoleReconciler;
use hubkit_workspace::WorkspaceResolver;
use serde_json::Value;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "hubkit-watcher", version, about = "Create and delete resource roles as custom resources come and go")]
struct Cli {
    /// Kind to reconcile, `prefix=group/version/plural/Kind`
    /// (e.g. `img=primehub.io/v1alpha1/images/Image`); repeatable
    #[arg(long = "kind", env = "HUBKIT_WATCH_KINDS", value_delimiter = ',', required = true)]
    kinds: Vec<String>,

    /// Also watch every workspace namespace, not only the default one
    #[arg(long = "all-workspaces", env = "HUBKIT_WATCH_ALL_WORKSPACES")]
    all_workspaces: bool,

    /// Pause before reopening a failed watch, in milliseconds
    #[arg(long = "backoff-ms", env = "HUBKIT_WATCH_BACKOFF_MS", default_value_t = 1000)]
    backoff_ms: u64,
}

fn init_tracing() {
    let env = std::env::var("HUBKIT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("HUBKIT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid HUBKIT_METRICS_ADDR; expected host:port");
        }
    }
}

/// `prefix=group/version/plural/Kind`
fn parse_kind(arg: &str) -> Result<(ResourcePrefix, CrdKind)> {
    let (prefix, key) = arg.split_once('=').ok_or_else(|| anyhow!("kind {arg}: expected prefix=group/version/plural/Kind"))?;
    let prefix = ResourcePrefix::parse(prefix).ok_or_else(|| anyhow!("kind {arg}: unknown resource prefix {prefix}"))?;
    let kind = CrdKind::from_str(key).map_err(|e| anyhow!("kind {arg}: {e}"))?;
    Ok((prefix, kind))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let config = HubConfig::from_env().context("loading HUBKIT_* configuration")?;
    let kinds = cli.kinds.iter().map(|k| parse_kind(k)).collect::<Result<Vec<_>>>()?;

    let client = kube::Client::try_default().await.context("building kubernetes client")?;
    let idp: Arc<dyn IdentityProvider> =
        Arc::new(KeycloakAdmin::new(&config.keycloak).context("building keycloak admin client")?);
    let resolver = Arc::new(WorkspaceResolver::new(&config, Arc::new(KubeNamespaces::new(client.clone())), idp.clone()));

    let mut namespaces = vec![config.default_namespace.clone()];
    if cli.all_workspaces {
        for ws in resolver.list().await.context("listing workspaces")? {
            let ns = resolver.namespace_for(&ws).to_string();
            if !namespaces.contains(&ns) {
                namespaces.push(ns);
            }
        }
    }

    let mut watchers = Vec::new();
    for (prefix, kind) in kinds {
        let resources: Arc<dyn ResourceClient<Value>> =
            Arc::new(KubeResourceClient::<Value>::new(client.clone(), kind.clone(), &config.default_namespace));
        let reconciler = Arc::new(RoleReconciler::new(&config, prefix, idp.clone(), resolver.clone()));
        for ns in &namespaces {
            let opts = WatchOptions {
                namespace: Some(ns.clone()),
                rewatch: true,
                backoff: Duration::from_millis(cli.backoff_ms),
            };
            info!(resource = %kind.plural, prefix = %prefix, namespace = %ns, "watcher: start");
            metrics::counter!("watcher_started_total", 1u64, "resource" => kind.plural.clone());
            watchers.push(ChangeWatcher::spawn(resources.clone(), reconciler.clone(), opts));
        }
    }

    signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!(watchers = watchers.len(), "Ctrl-C received; stopping watchers");
    for w in &watchers {
        w.abort();
    }
    for w in watchers {
        w.join().await;
    }
    Ok(())
}
