//! Process configuration, read once from the environment and threaded
//! through constructors.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{HubError, HubResult};

/// Freshness and failure bounds of a resource cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Age after which a snapshot is considered stale.
    pub max_age: Duration,
    /// Retry `n` is scheduled after `n * retry_delay`.
    pub retry_delay: Duration,
    /// Failed refetches tolerated before staleness can become fatal.
    pub max_retry: u32,
    /// Staleness tolerated once `max_retry` is exceeded.
    pub max_stale: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(60),
            retry_delay: Duration::from_secs(1),
            max_retry: 10,
            max_stale: Duration::from_secs(5 * 60),
        }
    }
}

/// Keycloak admin API access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeycloakSettings {
    pub base_url: String,
    pub realm: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    /// Static bearer token; skips the client-credentials grant when set.
    pub token: Option<String>,
    pub timeout: Duration,
}

impl Default for KeycloakSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".into(),
            realm: "master".into(),
            client_id: "admin-cli".into(),
            client_secret: None,
            token: None,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Namespace backing the default workspace.
    pub default_namespace: String,
    /// Global role prefix (multi-cluster deployments sharing one realm).
    pub role_prefix: Option<String>,
    /// Identity-provider group holding every user of the default workspace.
    pub everyone_group_id: String,
    /// Labels every workspace namespace must carry.
    pub workspace_labels: BTreeMap<String, String>,
    pub cache: CachePolicy,
    pub keycloak: KeycloakSettings,
}

impl HubConfig {
    pub fn new(default_namespace: &str, everyone_group_id: &str) -> Self {
        Self {
            default_namespace: default_namespace.to_string(),
            role_prefix: None,
            everyone_group_id: everyone_group_id.to_string(),
            workspace_labels: default_workspace_labels(),
            cache: CachePolicy::default(),
            keycloak: KeycloakSettings::default(),
        }
    }

    pub fn from_env() -> HubResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> HubResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let everyone_group_id = get("HUBKIT_EVERYONE_GROUP_ID")
            .ok_or_else(|| HubError::Invalid("HUBKIT_EVERYONE_GROUP_ID is required".into()))?;
        let mut cfg = HubConfig::new(
            get("HUBKIT_DEFAULT_NAMESPACE").as_deref().unwrap_or("hub"),
            &everyone_group_id,
        );

        if let Some(prefix) = get("HUBKIT_ROLE_PREFIX") {
            if prefix.contains([':', '|']) {
                return Err(HubError::Invalid(format!("HUBKIT_ROLE_PREFIX must not contain ':' or '|': {prefix}")));
            }
            cfg.role_prefix = Some(prefix);
        }
        if let Some(labels) = get("HUBKIT_WORKSPACE_LABELS") {
            cfg.workspace_labels = parse_labels(&labels)?;
        }

        if let Some(v) = get("HUBKIT_CACHE_MAX_AGE_SECS") {
            cfg.cache.max_age = Duration::from_secs(parse_num("HUBKIT_CACHE_MAX_AGE_SECS", &v)?);
        }
        if let Some(v) = get("HUBKIT_CACHE_RETRY_DELAY_MS") {
            cfg.cache.retry_delay = Duration::from_millis(parse_num("HUBKIT_CACHE_RETRY_DELAY_MS", &v)?);
        }
        if let Some(v) = get("HUBKIT_CACHE_MAX_RETRY") {
            let n = parse_num("HUBKIT_CACHE_MAX_RETRY", &v)?;
            cfg.cache.max_retry = u32::try_from(n)
                .map_err(|_| HubError::Invalid(format!("HUBKIT_CACHE_MAX_RETRY: out of range: {v}")))?;
        }
        if let Some(v) = get("HUBKIT_CACHE_MAX_STALE_SECS") {
            cfg.cache.max_stale = Duration::from_secs(parse_num("HUBKIT_CACHE_MAX_STALE_SECS", &v)?);
        }

        if let Some(url) = get("HUBKIT_KEYCLOAK_URL") {
            cfg.keycloak.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(realm) = get("HUBKIT_KEYCLOAK_REALM") {
            cfg.keycloak.realm = realm;
        }
        if let Some(id) = get("HUBKIT_KEYCLOAK_CLIENT_ID") {
            cfg.keycloak.client_id = id;
        }
        cfg.keycloak.client_secret = get("HUBKIT_KEYCLOAK_CLIENT_SECRET");
        cfg.keycloak.token = get("HUBKIT_KEYCLOAK_TOKEN");
        if let Some(v) = get("HUBKIT_KEYCLOAK_TIMEOUT_MS") {
            cfg.keycloak.timeout = Duration::from_millis(parse_num("HUBKIT_KEYCLOAK_TIMEOUT_MS", &v)?);
        }
        Ok(cfg)
    }
}

pub fn default_workspace_labels() -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), "hubkit".to_string())])
}

/// Parse `k=v,k2=v2` into a label map.
pub fn parse_labels(s: &str) -> HubResult<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => {
                out.insert(k.trim().to_string(), v.trim().to_string());
            }
            _ => return Err(HubError::Invalid(format!("invalid label pair: {pair} (expect key=value)"))),
        }
    }
    Ok(out)
}

/// Render a label map as a Kubernetes label selector.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",")
}

fn parse_num(key: &str, v: &str) -> HubResult<u64> {
    v.parse::<u64>().map_err(|_| HubError::Invalid(format!("{key}: not a number: {v}")))
}
