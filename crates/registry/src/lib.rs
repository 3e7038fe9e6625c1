//! hubkit registry: one [`ResourceRegistry`] per resource kind ties the CRD
//! client, the identity provider and the cache together.
//!
//! Every managed resource owns one realm role named through [`RoleNamer`].
//! Mutations write the role first, then the CRD, then run hooks and clear
//! the cache. Nothing is rolled back: a role whose CRD write failed stays
//! behind and blocks a retry with the same name until it is removed.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use hubkit_core::{HubConfig, HubError, HubResult, Item, MergePatch, Metadata, ResourcePrefix, ResourceRole, Spec};
use hubkit_idp::{GroupRepresentation, IdentityProvider, RoleRepresentation};
use hubkit_kubehub::ResourceClient;
use hubkit_store::ResourceCache;
use hubkit_workspace::{Workspace, WorkspaceResolver};
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

pub mod hooks;
pub mod query;
pub mod reconcile;

pub use hooks::{
    merge_variables, CreateHook, CustomMergeStrategy, DeleteHook, GroupAcl, GroupAclHook, GroupRef, GroupRelation,
    HookContext, MapMergeStrategy, PreCreateCheck, UpdateHook,
};
pub use query::{Connection, Edge, ListQuery, PageInfo, Pagination};
pub use reconcile::{generate_name, RoleReconciler};

/// Upper bound on groups read from the identity provider in one listing.
pub const GROUP_FETCH_MAX: u32 = 10_000;

/// Names a resource kind for logs and role names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindDescriptor {
    /// Singular resource name, e.g. `instanceType`.
    pub resource: String,
    pub prefix: ResourcePrefix,
}

impl KindDescriptor {
    pub fn new(resource: &str, prefix: ResourcePrefix) -> Self {
        Self { resource: resource.to_string(), prefix }
    }
}

/// Translates between CRD items and the API shapes of one kind.
///
/// `Output` must serialize to an object with a string `id` field; list
/// queries filter, order and paginate on that JSON form.
pub trait ResourceMapper: Send + Sync + 'static {
    type Spec: Spec;
    type Input: Send + Sync;
    type Output: Serialize + Clone + Send + Sync + 'static;

    fn map(&self, item: &Item<Self::Spec>) -> Self::Output;

    /// Resource name carried by a create input, if any.
    fn name_of(&self, input: &Self::Input) -> Option<String>;

    fn create_payload(&self, input: &Self::Input, name: &str) -> HubResult<(Metadata, Self::Spec)>;

    fn update_payload(&self, input: &Self::Input) -> HubResult<MergePatch>;
}

/// Builds role names for one kind in one workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleNamer {
    role_prefix: Option<String>,
    prefix: ResourcePrefix,
    workspace_id: String,
}

impl RoleNamer {
    pub fn new(role_prefix: Option<&str>, prefix: ResourcePrefix, workspace_id: &str) -> Self {
        Self { role_prefix: role_prefix.map(str::to_string), prefix, workspace_id: workspace_id.to_string() }
    }

    pub fn role(&self, name: &str, label: Option<&str>) -> ResourceRole {
        let labels: Vec<&str> = label.into_iter().collect();
        ResourceRole::new(self.role_prefix.as_deref(), self.prefix, &labels, &self.workspace_id, name)
    }

    pub fn role_name(&self, name: &str, label: Option<&str>) -> String {
        self.role(name, label).encode()
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Same kind and role prefix, any workspace.
    pub fn same_kind(&self, role: &ResourceRole) -> bool {
        !role.is_foreign() && role.resource_prefix == Some(self.prefix) && role.role_prefix == self.role_prefix
    }

    /// Same kind, role prefix and workspace.
    pub fn owns(&self, role: &ResourceRole) -> bool {
        self.same_kind(role) && role.workspace_id() == self.workspace_id
    }
}

type NameGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Where a call lands: the resolved workspace, its namespace and role namer.
struct Scope {
    workspace: Workspace,
    namespace: String,
    roles: RoleNamer,
}

pub struct RegistryBuilder<M: ResourceMapper> {
    descriptor: KindDescriptor,
    mapper: M,
    client: Arc<dyn ResourceClient<M::Spec>>,
    idp: Arc<dyn IdentityProvider>,
    resolver: Arc<WorkspaceResolver>,
    role_prefix: Option<String>,
    cache: Option<ResourceCache<M::Spec>>,
    name_generator: Option<NameGenerator>,
    pre_create: Vec<Arc<dyn PreCreateCheck<M>>>,
    on_create: Vec<Arc<dyn CreateHook<M>>>,
    on_update: Vec<Arc<dyn UpdateHook<M>>>,
    on_delete: Vec<Arc<dyn DeleteHook<M>>>,
    merge: Option<Arc<dyn CustomMergeStrategy<M>>>,
}

impl<M: ResourceMapper> RegistryBuilder<M> {
    /// Takes the role prefix from the config.
    pub fn config(mut self, config: &HubConfig) -> Self {
        self.role_prefix = config.role_prefix.clone();
        self
    }

    pub fn role_prefix(mut self, prefix: Option<&str>) -> Self {
        self.role_prefix = prefix.map(str::to_string);
        self
    }

    /// Cache over the default namespace; other workspaces always list
    /// upstream.
    pub fn cache(mut self, cache: ResourceCache<M::Spec>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Names come from `generate` instead of the input.
    pub fn generate_names<F>(mut self, generate: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.name_generator = Some(Arc::new(generate));
        self
    }

    pub fn pre_create_check(mut self, check: impl PreCreateCheck<M> + 'static) -> Self {
        self.pre_create.push(Arc::new(check));
        self
    }

    pub fn on_create(mut self, hook: impl CreateHook<M> + 'static) -> Self {
        self.on_create.push(Arc::new(hook));
        self
    }

    pub fn on_update(mut self, hook: impl UpdateHook<M> + 'static) -> Self {
        self.on_update.push(Arc::new(hook));
        self
    }

    pub fn on_delete(mut self, hook: impl DeleteHook<M> + 'static) -> Self {
        self.on_delete.push(Arc::new(hook));
        self
    }

    pub fn merge_strategy(mut self, strategy: impl CustomMergeStrategy<M> + 'static) -> Self {
        self.merge = Some(Arc::new(strategy));
        self
    }

    pub fn build(self) -> ResourceRegistry<M> {
        ResourceRegistry {
            descriptor: self.descriptor,
            mapper: self.mapper,
            client: self.client,
            idp: self.idp,
            resolver: self.resolver,
            role_prefix: self.role_prefix,
            cache: self.cache,
            name_generator: self.name_generator,
            pre_create: self.pre_create,
            on_create: self.on_create,
            on_update: self.on_update,
            on_delete: self.on_delete,
            merge: self.merge,
        }
    }
}

pub struct ResourceRegistry<M: ResourceMapper> {
    descriptor: KindDescriptor,
    mapper: M,
    client: Arc<dyn ResourceClient<M::Spec>>,
    idp: Arc<dyn IdentityProvider>,
    resolver: Arc<WorkspaceResolver>,
    role_prefix: Option<String>,
    cache: Option<ResourceCache<M::Spec>>,
    name_generator: Option<NameGenerator>,
    pre_create: Vec<Arc<dyn PreCreateCheck<M>>>,
    on_create: Vec<Arc<dyn CreateHook<M>>>,
    on_update: Vec<Arc<dyn UpdateHook<M>>>,
    on_delete: Vec<Arc<dyn DeleteHook<M>>>,
    merge: Option<Arc<dyn CustomMergeStrategy<M>>>,
}

impl<M: ResourceMapper> ResourceRegistry<M> {
    pub fn builder(
        descriptor: KindDescriptor,
        mapper: M,
        client: Arc<dyn ResourceClient<M::Spec>>,
        idp: Arc<dyn IdentityProvider>,
        resolver: Arc<WorkspaceResolver>,
    ) -> RegistryBuilder<M> {
        RegistryBuilder {
            descriptor,
            mapper,
            client,
            idp,
            resolver,
            role_prefix: None,
            cache: None,
            name_generator: None,
            pre_create: Vec::new(),
            on_create: Vec::new(),
            on_update: Vec::new(),
            on_delete: Vec::new(),
            merge: None,
        }
    }

    pub fn descriptor(&self) -> &KindDescriptor {
        &self.descriptor
    }

    pub fn cache(&self) -> Option<&ResourceCache<M::Spec>> {
        self.cache.as_ref()
    }

    /// Role namer for a workspace id (`default` when `None`).
    pub fn role_namer(&self, workspace_id: Option<&str>) -> RoleNamer {
        RoleNamer::new(
            self.role_prefix.as_deref(),
            self.descriptor.prefix,
            workspace_id.unwrap_or(hubkit_core::DEFAULT_WORKSPACE_ID),
        )
    }

    async fn scope(&self, workspace: Option<&str>) -> HubResult<Scope> {
        let (workspace, namespace) = self.resolver.locate(workspace).await?;
        let roles = self.role_namer(Some(&workspace.id));
        Ok(Scope { workspace, namespace, roles })
    }

    fn context<'a>(&'a self, scope: &'a Scope) -> HookContext<'a, M::Spec> {
        HookContext {
            workspace: &scope.workspace,
            namespace: &scope.namespace,
            roles: &scope.roles,
            idp: self.idp.as_ref(),
            client: self.client.as_ref(),
            cache: self.cache.as_ref(),
            resolver: &self.resolver,
        }
    }

    fn invalidate(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    fn record(&self, op: &'static str, scope: &Scope, name: &str) {
        counter!("registry_mutations_total", 1u64, "resource" => self.descriptor.resource.clone(), "op" => op);
        info!(resource = %self.descriptor.resource, op, name, workspace = %scope.workspace.id, "registry: mutation done");
    }

    async fn list_mapped(&self, scope: &Scope) -> HubResult<Vec<M::Output>> {
        match &self.cache {
            Some(cache) if scope.workspace.is_default => {
                Ok(cache.list().await.iter().map(|item| self.mapper.map(item)).collect())
            }
            _ => {
                let items = self.client.list(Some(&scope.namespace), None).await?;
                Ok(items.iter().map(|item| self.mapper.map(item)).collect())
            }
        }
    }

    pub async fn query(&self, query: &ListQuery, workspace: Option<&str>) -> HubResult<Vec<M::Output>> {
        let scope = self.scope(workspace).await?;
        query::run(self.list_mapped(&scope).await?, query)
    }

    pub async fn query_connection(
        &self,
        query: &ListQuery,
        workspace: Option<&str>,
    ) -> HubResult<Connection<M::Output>> {
        let scope = self.scope(workspace).await?;
        query::connection(self.list_mapped(&scope).await?, query)
    }

    /// Reads upstream, bypassing the cache.
    pub async fn query_one(&self, id: &str, workspace: Option<&str>) -> HubResult<Option<M::Output>> {
        let scope = self.scope(workspace).await?;
        match self.client.get(id, Some(&scope.namespace)).await {
            Ok(item) => Ok(Some(self.mapper.map(&item))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn create(&self, input: &M::Input, workspace: Option<&str>) -> HubResult<M::Output> {
        let scope = self.scope(workspace).await?;
        let name = match &self.name_generator {
            Some(generate) => generate(),
            None => self
                .mapper
                .name_of(input)
                .filter(|n| !n.is_empty())
                .ok_or_else(|| HubError::Invalid(format!("{} name is required", self.descriptor.resource)))?,
        };
        let (mut metadata, spec) = self.mapper.create_payload(input, &name)?;
        metadata.name = name.clone();
        let ctx = self.context(&scope);
        for check in &self.pre_create {
            check.check(&ctx, &metadata, &spec).await?;
        }

        let role_name = scope.roles.role_name(&name, None);
        match self.idp.create_role(&role_name).await {
            Ok(()) => debug!(resource = %self.descriptor.resource, role = %role_name, "registry: role created"),
            Err(HubError::ResourceConflict(_)) => {
                warn!(resource = %self.descriptor.resource, role = %role_name, "registry: role already exists");
                return Err(HubError::ResourceConflict(format!("{} {name}", self.descriptor.resource)));
            }
            Err(e) => return Err(e),
        }
        let role = self
            .idp
            .find_role_by_name(&role_name)
            .await?
            .ok_or_else(|| HubError::not_found("role", role_name.clone()))?;

        let item = match self.client.create(metadata, spec, Some(&scope.namespace)).await {
            Ok(item) => item,
            Err(e) => {
                error!(resource = %self.descriptor.resource, name = %name, role = %role_name, error = %e, "registry: resource write failed after role create");
                return Err(e);
            }
        };
        for hook in &self.on_create {
            hook.on_create(&ctx, &role, &item, input).await?;
        }
        self.invalidate();
        self.record("create", &scope, &name);
        Ok(self.mapper.map(&item))
    }

    pub async fn update(&self, id: &str, input: &M::Input, workspace: Option<&str>) -> HubResult<M::Output> {
        let scope = self.scope(workspace).await?;
        let role_name = scope.roles.role_name(id, None);
        let role = self.idp.find_role_by_name(&role_name).await?;
        if role.is_none() {
            warn!(resource = %self.descriptor.resource, role = %role_name, "registry: updating a resource without role");
        }

        let mut patch = self.mapper.update_payload(input)?;
        if let Some(Value::Object(meta)) = &mut patch.metadata {
            meta.remove("name");
        }
        let ctx = self.context(&scope);
        let item = match &self.merge {
            Some(strategy) => strategy.update(&ctx, id, patch, input).await?,
            None => self.client.patch(id, patch, Some(&scope.namespace)).await?,
        };
        for hook in &self.on_update {
            hook.on_update(&ctx, role.as_ref(), &item, input).await?;
        }
        self.invalidate();
        self.record("update", &scope, id);
        Ok(self.mapper.map(&item))
    }

    /// Returns the resource as it was before deletion.
    pub async fn destroy(&self, id: &str, workspace: Option<&str>) -> HubResult<M::Output> {
        let scope = self.scope(workspace).await?;
        let item = self.client.get(id, Some(&scope.namespace)).await?;
        let role_name = scope.roles.role_name(id, None);
        match self.idp.delete_role_by_name(&role_name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => warn!(resource = %self.descriptor.resource, role = %role_name, "registry: role already gone"),
            Err(e) => return Err(e),
        }
        self.client.delete(id, Some(&scope.namespace)).await?;
        let ctx = self.context(&scope);
        for hook in &self.on_delete {
            hook.on_delete(&ctx, &item).await?;
        }
        self.invalidate();
        self.record("delete", &scope, id);
        Ok(self.mapper.map(&item))
    }

    /// Resources of this kind the group holds a role for. Roles whose
    /// resource cannot be read are logged and skipped.
    pub async fn query_by_group(&self, group_id: &str, workspace: Option<&str>) -> HubResult<Vec<M::Output>> {
        let scope = self.scope(workspace).await?;
        let mappings = self.idp.list_group_role_mappings(group_id).await?;
        self.resolve_roles(&scope, &mappings, group_id).await
    }

    /// Like [`query_by_group`](Self::query_by_group), plus whatever the
    /// workspace's everyone group grants. A resource reachable both ways is
    /// returned once.
    pub async fn query_by_effective_group(
        &self,
        group_id: &str,
        workspace: Option<&str>,
    ) -> HubResult<Vec<M::Output>> {
        let scope = self.scope(workspace).await?;
        let mut mappings = self.idp.list_group_role_mappings(group_id).await?;
        match self.resolver.everyone_group_id(&scope.workspace).await {
            Ok(everyone) if everyone != group_id => {
                mappings.extend(self.idp.list_group_role_mappings(&everyone).await?);
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!(workspace = %scope.workspace.id, "registry: workspace has no everyone group");
            }
            Err(e) => return Err(e),
        }
        self.resolve_roles(&scope, &mappings, group_id).await
    }

    async fn resolve_roles(
        &self,
        scope: &Scope,
        mappings: &[RoleRepresentation],
        group_id: &str,
    ) -> HubResult<Vec<M::Output>> {
        let mut seen = HashSet::new();
        let names: Vec<String> = mappings
            .iter()
            .map(|r| ResourceRole::decode(&r.name))
            .filter(|r| scope.roles.owns(r))
            .filter_map(|r| r.resource_name)
            .filter(|n| seen.insert(n.clone()))
            .collect();

        let fetched = join_all(names.iter().map(|n| self.client.get(n, Some(&scope.namespace)))).await;
        let mut out = Vec::with_capacity(fetched.len());
        for (name, result) in names.iter().zip(fetched) {
            match result {
                Ok(item) => out.push(self.mapper.map(&item)),
                Err(e) => warn!(resource = %self.descriptor.resource, name = %name, group = group_id, error = %e, "registry: role without readable resource"),
            }
        }
        Ok(out)
    }

    /// Groups other than the everyone group whose role mappings include the
    /// resource's role.
    pub async fn groups_for(&self, id: &str, workspace: Option<&str>) -> HubResult<Vec<GroupRepresentation>> {
        let scope = self.scope(workspace).await?;
        let everyone = self.resolver.everyone_group_id(&scope.workspace).await.ok();
        let role_name = scope.roles.role_name(id, None);
        let groups = self.idp.find_groups(Some(GROUP_FETCH_MAX)).await?;
        let checks = groups.into_iter().filter(|g| everyone.as_deref() != Some(g.id.as_str())).map(|group| {
            let role_name = &role_name;
            async move {
                let mapped = self.idp.list_group_role_mappings(&group.id).await?;
                Ok::<_, HubError>(mapped.iter().any(|r| &r.name == role_name).then_some(group))
            }
        });
        Ok(try_join_all(checks).await?.into_iter().flatten().collect())
    }

    /// True when the group holds a role of this kind for `name`, in any
    /// workspace.
    pub async fn find_in_group(&self, group_id: &str, name: &str) -> HubResult<bool> {
        let namer = self.role_namer(None);
        let mappings = self.idp.list_group_role_mappings(group_id).await?;
        Ok(mappings
            .iter()
            .map(|r| ResourceRole::decode(&r.name))
            .any(|r| namer.same_kind(&r) && r.resource_name.as_deref() == Some(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_namer_renders_workspace_segment() {
        let default = RoleNamer::new(None, ResourcePrefix::It, "default");
        assert_eq!(default.role_name("foo", None), "it:foo");
        let ws1 = RoleNamer::new(Some("east"), ResourcePrefix::Ds, "ws1");
        assert_eq!(ws1.role_name("bar", Some("rw")), "east:ds:rw:ws1|bar");
    }

    #[test]
    fn ownership_checks_kind_prefix_and_workspace() {
        let namer = RoleNamer::new(None, ResourcePrefix::It, "ws1");
        assert!(namer.owns(&ResourceRole::decode("it:ws1|a")));
        assert!(!namer.owns(&ResourceRole::decode("it:a")));
        assert!(namer.same_kind(&ResourceRole::decode("it:a")));
        assert!(!namer.same_kind(&ResourceRole::decode("east:it:a")));
        assert!(!namer.same_kind(&ResourceRole::decode("img:a")));
        assert!(!namer.same_kind(&ResourceRole::decode("realm-admin")));
    }
}
