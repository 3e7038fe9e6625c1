use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use hubkit_core::{HubConfig, HubError, HubResult};
use hubkit_idp::{IdentityProvider, MemoryIdentityProvider};
use hubkit_kubehub::mock::MemoryNamespaces;
use hubkit_kubehub::{NamespaceApi, NamespaceRecord};
use hubkit_workspace::{Workspace, WorkspaceResolver, DISPLAY_NAME_ANNOTATION, GROUP_ID_ANNOTATION};

fn config() -> HubConfig {
    HubConfig::new("hub", "everyone-id")
}

fn owned(name: &str, group: Option<&str>) -> NamespaceRecord {
    let mut annotations = BTreeMap::from([(DISPLAY_NAME_ANNOTATION.to_string(), format!("Team {name}"))]);
    if let Some(g) = group {
        annotations.insert(GROUP_ID_ANNOTATION.to_string(), g.to_string());
    }
    NamespaceRecord {
        name: name.to_string(),
        labels: BTreeMap::from([("app".to_string(), "hubkit".to_string())]),
        annotations,
    }
}

fn setup() -> (WorkspaceResolver, Arc<MemoryNamespaces>, Arc<MemoryIdentityProvider>) {
    let ns = Arc::new(MemoryNamespaces::new());
    let idp = Arc::new(MemoryIdentityProvider::new());
    let resolver = WorkspaceResolver::new(&config(), ns.clone(), idp.clone());
    (resolver, ns, idp)
}

/// Fails every call; proves the default workspace needs no lookup.
struct Unreachable;

#[async_trait]
impl NamespaceApi for Unreachable {
    async fn get(&self, _: &str) -> HubResult<NamespaceRecord> {
        Err(HubError::ApiUnavailable("down".into()))
    }
    async fn list(&self, _: &str) -> HubResult<Vec<NamespaceRecord>> {
        Err(HubError::ApiUnavailable("down".into()))
    }
    async fn create(&self, _: NamespaceRecord) -> HubResult<NamespaceRecord> {
        Err(HubError::ApiUnavailable("down".into()))
    }
    async fn annotate(&self, _: &str, _: BTreeMap<String, String>) -> HubResult<NamespaceRecord> {
        Err(HubError::ApiUnavailable("down".into()))
    }
    async fn delete(&self, _: &str) -> HubResult<()> {
        Err(HubError::ApiUnavailable("down".into()))
    }
}

#[tokio::test]
async fn default_workspace_resolves_offline() {
    let resolver = WorkspaceResolver::new(&config(), Arc::new(Unreachable), Arc::new(MemoryIdentityProvider::new()));
    for id in [None, Some("default")] {
        let ws = resolver.resolve(id).await.expect("default");
        assert_eq!(ws, Workspace::default_workspace());
        assert_eq!(resolver.namespace_for(&ws), "hub");
        assert_eq!(resolver.everyone_group_id(&ws).await.expect("group"), "everyone-id");
    }
    assert!(matches!(resolver.resolve(Some("ws1")).await, Err(HubError::ApiUnavailable(_))));
}

#[tokio::test]
async fn named_workspace_maps_to_its_namespace() {
    let (resolver, ns, _) = setup();
    ns.insert(owned("ws1", Some("g-ws1")));
    let ws = resolver.resolve(Some("ws1")).await.expect("ws1");
    assert!(!ws.is_default);
    assert_eq!(ws.display_name, "Team ws1");
    assert_eq!(resolver.namespace_for(&ws), "ws1");
    assert_eq!(resolver.everyone_group_id(&ws).await.expect("group"), "g-ws1");
    assert_eq!(resolver.workspace_id_for_namespace("ws1"), "ws1");
    assert_eq!(resolver.workspace_id_for_namespace("hub"), "default");
}

#[tokio::test]
async fn unknown_or_foreign_namespaces_are_rejected() {
    let (resolver, ns, _) = setup();
    ns.insert(NamespaceRecord { name: "kube-system".into(), ..Default::default() });
    let err = resolver.resolve(Some("kube-system")).await.unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
    assert!(resolver.resolve(Some("missing")).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn everyone_group_is_fetched_when_missing_on_value() {
    let (resolver, ns, _) = setup();
    ns.insert(owned("ws1", Some("g-ws1")));
    let partial = Workspace {
        id: "ws1".into(),
        name: "ws1".into(),
        is_default: false,
        display_name: "ws1".into(),
        keycloak_group_id: None,
    };
    assert_eq!(resolver.everyone_group_id(&partial).await.expect("group"), "g-ws1");

    ns.insert(owned("ws2", None));
    let ws2 = resolver.resolve(Some("ws2")).await.expect("ws2");
    assert!(resolver.everyone_group_id(&ws2).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn list_puts_default_first_and_skips_foreign() {
    let (resolver, ns, _) = setup();
    ns.insert(owned("ws2", None));
    ns.insert(owned("ws1", None));
    ns.insert(NamespaceRecord { name: "kube-system".into(), ..Default::default() });
    let ids: Vec<String> = resolver.list().await.expect("list").into_iter().map(|w| w.id).collect();
    assert_eq!(ids, ["default", "ws1", "ws2"]);
}

#[tokio::test]
async fn create_links_namespace_and_group() {
    let (resolver, ns, idp) = setup();
    let ws = resolver.create("team-a", "Team A").await.expect("create");
    assert_eq!(ws.id, "team-a");
    assert_eq!(ws.display_name, "Team A");
    let group = ws.keycloak_group_id.clone().expect("group id");
    let stored = idp.find_group(&group).await.expect("find").expect("group exists");
    assert_eq!(stored.name, "team-a");
    assert_eq!(stored.attribute("namespace"), Some("team-a"));
    let record = ns.record("team-a").expect("namespace");
    assert_eq!(record.labels.get("app").map(String::as_str), Some("hubkit"));
    assert_eq!(record.annotation(GROUP_ID_ANNOTATION), Some(group.as_str()));

    let dup = resolver.create("team-a", "again").await.unwrap_err();
    assert_eq!(dup.code(), "RESOURCE_CONFLICT");
}

#[tokio::test]
async fn create_validates_before_any_write() {
    let (resolver, ns, idp) = setup();
    for bad in ["Team_A", "default", ""] {
        assert_eq!(resolver.create(bad, "x").await.unwrap_err().code(), "BAD_USER_INPUT");
    }
    assert!(ns.list("").await.expect("list").is_empty());
    assert_eq!(idp.calls().create_group, 0);
}

#[tokio::test]
async fn rename_and_destroy() {
    let (resolver, ns, idp) = setup();
    let ws = resolver.create("ws1", "One").await.expect("create");
    let renamed = resolver.rename("ws1", "Uno").await.expect("rename");
    assert_eq!(renamed.display_name, "Uno");

    resolver.destroy("ws1").await.expect("destroy");
    assert!(!ns.contains("ws1"));
    assert!(!idp.has_group(ws.keycloak_group_id.as_deref().unwrap_or_default()));
}

#[tokio::test]
async fn default_workspace_is_immutable_and_ownership_checked() {
    let (resolver, ns, idp) = setup();
    assert_eq!(resolver.rename("default", "x").await.unwrap_err().code(), "BAD_USER_INPUT");
    assert_eq!(resolver.destroy("default").await.unwrap_err().code(), "BAD_USER_INPUT");

    ns.insert(NamespaceRecord { name: "kube-system".into(), ..Default::default() });
    assert_eq!(resolver.destroy("kube-system").await.unwrap_err().code(), "FORBIDDEN");
    assert_eq!(resolver.rename("kube-system", "x").await.unwrap_err().code(), "FORBIDDEN");
    assert!(ns.contains("kube-system"));
    assert_eq!(idp.calls().delete_group, 0);
}

#[tokio::test]
async fn default_namespace_is_not_a_second_workspace() {
    let (resolver, ns, idp) = setup();
    ns.insert(owned("hub", Some("g-hub")));
    ns.insert(owned("ws1", None));

    assert_eq!(resolver.resolve(Some("hub")).await.unwrap_err().code(), "FORBIDDEN");
    let ids: Vec<String> = resolver.list().await.expect("list").into_iter().map(|w| w.id).collect();
    assert_eq!(ids, ["default", "ws1"]);
    assert_eq!(resolver.create("hub", "Hub").await.unwrap_err().code(), "BAD_USER_INPUT");
    assert_eq!(resolver.rename("hub", "x").await.unwrap_err().code(), "FORBIDDEN");
    assert_eq!(resolver.destroy("hub").await.unwrap_err().code(), "FORBIDDEN");
    assert!(ns.contains("hub"));
    assert_eq!(idp.calls().create_group, 0);
}
