//! hubkit workspace: maps a logical workspace onto its namespace and its
//! everyone-group in the identity provider.
//!
//! The default workspace is built in (no lookup, configured namespace and
//! everyone-group). Every other workspace is a namespace carrying the
//! ownership labels, with `displayName` and `kcGroupId` annotations.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use hubkit_core::config::label_selector;
use hubkit_core::{HubConfig, HubError, HubResult, DEFAULT_WORKSPACE_ID};
use hubkit_idp::IdentityProvider;
use hubkit_kubehub::{NamespaceApi, NamespaceRecord};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DISPLAY_NAME_ANNOTATION: &str = "displayName";
pub const GROUP_ID_ANNOTATION: &str = "kcGroupId";

static DNS_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub is_default: bool,
    pub display_name: String,
    pub keycloak_group_id: Option<String>,
}

impl Workspace {
    pub fn default_workspace() -> Self {
        Workspace {
            id: DEFAULT_WORKSPACE_ID.to_string(),
            name: DEFAULT_WORKSPACE_ID.to_string(),
            is_default: true,
            display_name: DEFAULT_WORKSPACE_ID.to_string(),
            keycloak_group_id: None,
        }
    }

    fn from_namespace(ns: &NamespaceRecord) -> Self {
        Workspace {
            id: ns.name.clone(),
            name: ns.name.clone(),
            is_default: false,
            display_name: ns.annotation(DISPLAY_NAME_ANNOTATION).unwrap_or(&ns.name).to_string(),
            keycloak_group_id: ns.annotation(GROUP_ID_ANNOTATION).map(str::to_string),
        }
    }
}

/// Workspace names become namespace names: DNS-1123 labels.
pub fn validate_workspace_name(name: &str) -> HubResult<()> {
    if name == DEFAULT_WORKSPACE_ID {
        return Err(HubError::Invalid(format!("workspace name {name} is reserved")));
    }
    if name.len() > 63 || !DNS_LABEL.is_match(name) {
        return Err(HubError::Invalid(format!(
            "workspace name {name:?} must be a DNS-1123 label (lowercase alphanumerics and '-', at most 63 chars)"
        )));
    }
    Ok(())
}

fn reject_default(id: &str, op: &str) -> HubResult<()> {
    if id == DEFAULT_WORKSPACE_ID {
        return Err(HubError::Invalid(format!("cannot {op} the default workspace")));
    }
    Ok(())
}

pub struct WorkspaceResolver {
    namespaces: Arc<dyn NamespaceApi>,
    idp: Arc<dyn IdentityProvider>,
    default_namespace: String,
    everyone_group_id: String,
    labels: BTreeMap<String, String>,
}

impl WorkspaceResolver {
    pub fn new(config: &HubConfig, namespaces: Arc<dyn NamespaceApi>, idp: Arc<dyn IdentityProvider>) -> Self {
        Self {
            namespaces,
            idp,
            default_namespace: config.default_namespace.clone(),
            everyone_group_id: config.everyone_group_id.clone(),
            labels: config.workspace_labels.clone(),
        }
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    /// Namespace lookup that also enforces the ownership labels. The default
    /// namespace only ever backs the default workspace.
    async fn owned_namespace(&self, id: &str) -> HubResult<NamespaceRecord> {
        if id == self.default_namespace {
            warn!(namespace = id, "workspace: default namespace requested as a workspace");
            return Err(HubError::Forbidden(format!("namespace {id} belongs to the default workspace")));
        }
        let ns = self.namespaces.get(id).await?;
        if !ns.has_labels(&self.labels) {
            warn!(namespace = id, "workspace: namespace lacks ownership labels");
            return Err(HubError::Forbidden(format!("not authorized to access namespace: {id}")));
        }
        Ok(ns)
    }

    /// `None` or `default` resolve to the built-in default workspace without
    /// touching the cluster.
    pub async fn resolve(&self, workspace_id: Option<&str>) -> HubResult<Workspace> {
        match workspace_id {
            None => Ok(Workspace::default_workspace()),
            Some(id) if id == DEFAULT_WORKSPACE_ID => Ok(Workspace::default_workspace()),
            Some(id) => Ok(Workspace::from_namespace(&self.owned_namespace(id).await?)),
        }
    }

    /// Default workspace first, then every owned namespace.
    pub async fn list(&self) -> HubResult<Vec<Workspace>> {
        let owned = self.namespaces.list(&label_selector(&self.labels)).await?;
        let mut out = Vec::with_capacity(owned.len() + 1);
        out.push(Workspace::default_workspace());
        out.extend(
            owned
                .iter()
                .filter(|ns| ns.name != self.default_namespace && ns.has_labels(&self.labels))
                .map(Workspace::from_namespace),
        );
        Ok(out)
    }

    pub fn namespace_for<'a>(&'a self, workspace: &'a Workspace) -> &'a str {
        if workspace.is_default {
            &self.default_namespace
        } else {
            &workspace.id
        }
    }

    /// Resolve a workspace id and return it with its namespace.
    pub async fn locate(&self, workspace_id: Option<&str>) -> HubResult<(Workspace, String)> {
        let ws = self.resolve(workspace_id).await?;
        let ns = self.namespace_for(&ws).to_string();
        Ok((ws, ns))
    }

    pub fn workspace_id_for_namespace(&self, namespace: &str) -> String {
        if namespace == self.default_namespace {
            DEFAULT_WORKSPACE_ID.to_string()
        } else {
            namespace.to_string()
        }
    }

    /// Group every member of the workspace belongs to.
    pub async fn everyone_group_id(&self, workspace: &Workspace) -> HubResult<String> {
        if workspace.is_default {
            return Ok(self.everyone_group_id.clone());
        }
        if let Some(id) = &workspace.keycloak_group_id {
            return Ok(id.clone());
        }
        let fresh = self.resolve(Some(&workspace.id)).await?;
        fresh.keycloak_group_id.ok_or_else(|| HubError::not_found("workspace group", &workspace.id))
    }

    /// Create the namespace, then its group, then link the two. A failure
    /// after the namespace exists leaves an unlinked namespace behind.
    pub async fn create(&self, name: &str, display_name: &str) -> HubResult<Workspace> {
        validate_workspace_name(name)?;
        if name == self.default_namespace {
            return Err(HubError::Invalid(format!("workspace name {name} is reserved")));
        }
        let record = NamespaceRecord {
            name: name.to_string(),
            labels: self.labels.clone(),
            annotations: BTreeMap::from([(DISPLAY_NAME_ANNOTATION.to_string(), display_name.to_string())]),
        };
        self.namespaces.create(record).await?;
        info!(workspace = name, "workspace: namespace created");

        let attributes = BTreeMap::from([
            ("isWorkspace".to_string(), vec!["true".to_string()]),
            ("namespace".to_string(), vec![name.to_string()]),
        ]);
        let group_id = self.idp.create_group(name, attributes).await?;
        let ns = self
            .namespaces
            .annotate(name, BTreeMap::from([(GROUP_ID_ANNOTATION.to_string(), group_id.clone())]))
            .await?;
        info!(workspace = name, group = %group_id, "workspace: created");
        Ok(Workspace::from_namespace(&ns))
    }

    pub async fn rename(&self, id: &str, display_name: &str) -> HubResult<Workspace> {
        reject_default(id, "rename")?;
        self.owned_namespace(id).await?;
        let ns = self
            .namespaces
            .annotate(id, BTreeMap::from([(DISPLAY_NAME_ANNOTATION.to_string(), display_name.to_string())]))
            .await?;
        info!(workspace = id, display_name, "workspace: renamed");
        Ok(Workspace::from_namespace(&ns))
    }

    /// Delete the workspace group, then the namespace.
    pub async fn destroy(&self, id: &str) -> HubResult<()> {
        reject_default(id, "delete")?;
        let ns = self.owned_namespace(id).await?;
        match ns.annotation(GROUP_ID_ANNOTATION) {
            Some(group) => match self.idp.delete_group(group).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => warn!(workspace = id, group, "workspace: group already gone"),
                Err(e) => return Err(e),
            },
            None => warn!(workspace = id, "workspace: no group annotation"),
        }
        self.namespaces.delete(id).await?;
        info!(workspace = id, "workspace: deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_names_are_dns_labels() {
        for ok in ["ws1", "a", "team-a", "0abc"] {
            assert!(validate_workspace_name(ok).is_ok(), "{ok}");
        }
        let long = "x".repeat(64);
        for bad in ["", "Team", "-a", "a-", "a_b", "a.b", "default", long.as_str()] {
            assert_eq!(validate_workspace_name(bad).unwrap_err().code(), "BAD_USER_INPUT", "{bad}");
        }
    }

    #[test]
    fn display_name_falls_back_to_id() {
        let ns = NamespaceRecord { name: "ws1".into(), ..Default::default() };
        let ws = Workspace::from_namespace(&ns);
        assert_eq!(ws.display_name, "ws1");
        assert!(!ws.is_default);
        assert_eq!(ws.keycloak_group_id, None);
    }
}
