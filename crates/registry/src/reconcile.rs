//! Keeps realm roles in step with resources created or deleted outside the
//! registry (kubectl, GitOps).

use std::sync::Arc;

use async_trait::async_trait;
use hubkit_core::{ChangeType, HubConfig, HubError, HubResult, Item, ResourcePrefix, Spec};
use hubkit_idp::IdentityProvider;
use hubkit_kubehub::ChangeHandler;
use hubkit_workspace::WorkspaceResolver;
use tracing::{debug, info};

use crate::RoleNamer;

/// `{prefix}-{13 random lowercase hex chars}`, a valid DNS-1123 label for
/// short prefixes.
pub fn generate_name(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &id[..13])
}

/// ADDED: create the resource role unless it exists. DELETED: delete it;
/// a role that is already gone is fine. MODIFIED is ignored.
pub struct RoleReconciler {
    prefix: ResourcePrefix,
    role_prefix: Option<String>,
    idp: Arc<dyn IdentityProvider>,
    resolver: Arc<WorkspaceResolver>,
}

impl RoleReconciler {
    pub fn new(
        config: &HubConfig,
        prefix: ResourcePrefix,
        idp: Arc<dyn IdentityProvider>,
        resolver: Arc<WorkspaceResolver>,
    ) -> Self {
        Self { prefix, role_prefix: config.role_prefix.clone(), idp, resolver }
    }

    fn role_name<S>(&self, item: &Item<S>) -> String {
        let namespace = item.namespace().unwrap_or(self.resolver.default_namespace());
        let workspace = self.resolver.workspace_id_for_namespace(namespace);
        RoleNamer::new(self.role_prefix.as_deref(), self.prefix, &workspace).role_name(item.name(), None)
    }
}

#[async_trait]
impl<S: Spec> ChangeHandler<S> for RoleReconciler {
    async fn on_change(&self, change: ChangeType, item: &Item<S>) -> HubResult<()> {
        let role = self.role_name(item);
        match change {
            ChangeType::Added => {
                if self.idp.find_role_by_name(&role).await?.is_some() {
                    return Ok(());
                }
                match self.idp.create_role(&role).await {
                    Ok(()) => info!(role = %role, name = %item.name(), "reconcile: role added"),
                    Err(HubError::ResourceConflict(_)) => debug!(role = %role, "reconcile: role created concurrently"),
                    Err(e) => return Err(e),
                }
            }
            ChangeType::Deleted => match self.idp.delete_role_by_name(&role).await {
                Ok(()) => info!(role = %role, name = %item.name(), "reconcile: role deleted"),
                Err(e) if e.is_not_found() => info!(role = %role, "reconcile: role already deleted"),
                Err(e) => return Err(e),
            },
            ChangeType::Modified => {}
        }
        Ok(())
    }
}
