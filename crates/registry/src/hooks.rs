//! Per-kind extension points run around registry mutations.

use async_trait::async_trait;
use hubkit_core::{HubError, HubResult, Item, MergePatch, Metadata, Spec};
use hubkit_idp::{IdentityProvider, RoleRepresentation};
use hubkit_kubehub::ResourceClient;
use hubkit_store::ResourceCache;
use hubkit_workspace::{Workspace, WorkspaceResolver};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::{ResourceMapper, RoleNamer};

/// Everything a hook may touch for the mutation in progress.
pub struct HookContext<'a, S: Spec> {
    pub workspace: &'a Workspace,
    /// Namespace the workspace maps onto.
    pub namespace: &'a str,
    pub roles: &'a RoleNamer,
    pub idp: &'a dyn IdentityProvider,
    pub client: &'a dyn ResourceClient<S>,
    pub cache: Option<&'a ResourceCache<S>>,
    pub resolver: &'a WorkspaceResolver,
}

/// Runs before anything is written; an error aborts the create.
#[async_trait]
pub trait PreCreateCheck<M: ResourceMapper>: Send + Sync {
    async fn check(&self, ctx: &HookContext<'_, M::Spec>, metadata: &Metadata, spec: &M::Spec) -> HubResult<()>;
}

#[async_trait]
pub trait CreateHook<M: ResourceMapper>: Send + Sync {
    async fn on_create(
        &self,
        ctx: &HookContext<'_, M::Spec>,
        role: &RoleRepresentation,
        item: &Item<M::Spec>,
        input: &M::Input,
    ) -> HubResult<()>;
}

/// `role` is `None` when the resource has no role in the identity provider.
#[async_trait]
pub trait UpdateHook<M: ResourceMapper>: Send + Sync {
    async fn on_update(
        &self,
        ctx: &HookContext<'_, M::Spec>,
        role: Option<&RoleRepresentation>,
        item: &Item<M::Spec>,
        input: &M::Input,
    ) -> HubResult<()>;
}

/// Receives the snapshot taken before deletion.
#[async_trait]
pub trait DeleteHook<M: ResourceMapper>: Send + Sync {
    async fn on_delete(&self, ctx: &HookContext<'_, M::Spec>, item: &Item<M::Spec>) -> HubResult<()>;
}

/// Replaces the plain merge-patch of an update. `patch.metadata` never
/// carries a name.
#[async_trait]
pub trait CustomMergeStrategy<M: ResourceMapper>: Send + Sync {
    async fn update(
        &self,
        ctx: &HookContext<'_, M::Spec>,
        name: &str,
        patch: MergePatch,
        input: &M::Input,
    ) -> HubResult<Item<M::Spec>>;
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Merge a replacement map into the stored one so that a merge-patch
/// yields exactly `new`:
///
/// - `new` explicitly `null` clears the field;
/// - absent or empty `new` keeps `original`;
/// - keys of `original` missing from `new` become `null`;
/// - keys only in `new` are added.
pub fn merge_variables(original: &Value, new: Option<&Value>) -> Value {
    let new = match new {
        Some(Value::Null) => return Value::Null,
        Some(v) if !is_empty(v) => v,
        _ => return original.clone(),
    };
    let Value::Object(new) = new else {
        return new.clone();
    };
    let mut merged = Map::new();
    if let Value::Object(original) = original {
        for key in original.keys() {
            merged.insert(key.clone(), new.get(key).cloned().unwrap_or(Value::Null));
        }
    }
    for (key, value) in new {
        merged.entry(key.clone()).or_insert_with(|| value.clone());
    }
    Value::Object(merged)
}

/// Update strategy for kinds with a map-valued spec field (node selectors,
/// variables): the map in the input replaces the stored map as a whole.
#[derive(Debug, Clone)]
pub struct MapMergeStrategy {
    field: String,
}

impl MapMergeStrategy {
    pub fn new(field: &str) -> Self {
        Self { field: field.to_string() }
    }
}

#[async_trait]
impl<M: ResourceMapper> CustomMergeStrategy<M> for MapMergeStrategy {
    async fn update(
        &self,
        ctx: &HookContext<'_, M::Spec>,
        name: &str,
        mut patch: MergePatch,
        _input: &M::Input,
    ) -> HubResult<Item<M::Spec>> {
        if let Value::Object(spec) = &mut patch.spec {
            let current = ctx.client.get(name, Some(ctx.namespace)).await?;
            let stored = serde_json::to_value(&current.spec)?;
            let original = stored.get(&self.field).cloned().unwrap_or_else(|| Value::Object(Map::new()));
            let merged = merge_variables(&original, spec.get(&self.field));
            spec.insert(self.field.clone(), merged);
        }
        ctx.client.patch(name, patch, Some(ctx.namespace)).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRef {
    pub id: String,
}

/// `groups: {connect: [{id}], disconnect: [{id}]}` of a mutation input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRelation {
    #[serde(default)]
    pub connect: Vec<GroupRef>,
    #[serde(default)]
    pub disconnect: Vec<GroupRef>,
}

impl GroupRelation {
    pub fn connect(ids: &[&str]) -> Self {
        Self { connect: ids.iter().map(|id| GroupRef { id: id.to_string() }).collect(), disconnect: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.connect.is_empty() && self.disconnect.is_empty()
    }
}

/// Access-control fields of an input that [`GroupAclHook`] understands.
pub trait GroupAcl {
    /// `Some(true)`: visible to everyone in the workspace.
    fn global(&self) -> Option<bool>;
    fn groups(&self) -> Option<&GroupRelation>;
}

/// Maps the resource role onto the workspace everyone-group when `global`,
/// and onto (or off) explicitly connected groups.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupAclHook;

impl GroupAclHook {
    async fn apply<S: Spec>(
        ctx: &HookContext<'_, S>,
        role: &RoleRepresentation,
        global: Option<bool>,
        groups: Option<&GroupRelation>,
        allow_disconnect: bool,
    ) -> HubResult<()> {
        let roles = std::slice::from_ref(role);
        if let Some(global) = global {
            let everyone = ctx.resolver.everyone_group_id(ctx.workspace).await?;
            if global {
                ctx.idp.add_group_role_mappings(&everyone, roles).await?;
            } else if allow_disconnect {
                ctx.idp.remove_group_role_mappings(&everyone, roles).await?;
            }
            info!(role = %role.name, global, "registry: everyone-group mapping updated");
        }
        let Some(groups) = groups else { return Ok(()) };
        for group in &groups.connect {
            ctx.idp.add_group_role_mappings(&group.id, roles).await?;
        }
        if allow_disconnect {
            for group in &groups.disconnect {
                ctx.idp.remove_group_role_mappings(&group.id, roles).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<M> CreateHook<M> for GroupAclHook
where
    M: ResourceMapper,
    M::Input: GroupAcl,
{
    async fn on_create(
        &self,
        ctx: &HookContext<'_, M::Spec>,
        role: &RoleRepresentation,
        _item: &Item<M::Spec>,
        input: &M::Input,
    ) -> HubResult<()> {
        let global = input.global().filter(|g| *g);
        Self::apply(ctx, role, global, input.groups(), false).await
    }
}

#[async_trait]
impl<M> UpdateHook<M> for GroupAclHook
where
    M: ResourceMapper,
    M::Input: GroupAcl,
{
    async fn on_update(
        &self,
        ctx: &HookContext<'_, M::Spec>,
        role: Option<&RoleRepresentation>,
        item: &Item<M::Spec>,
        input: &M::Input,
    ) -> HubResult<()> {
        let groups = input.groups().filter(|g| !g.is_empty());
        if input.global().is_none() && groups.is_none() {
            return Ok(());
        }
        let role = role.ok_or_else(|| HubError::not_found("role", ctx.roles.role_name(item.name(), None)))?;
        Self::apply(ctx, role, input.global(), groups, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_replaces_map_wholesale() {
        let original = json!({"a": "0", "b": "2"});
        assert_eq!(merge_variables(&original, Some(&json!({"a": "1"}))), json!({"a": "1", "b": null}));
        assert_eq!(merge_variables(&original, Some(&json!({"c": "3"}))), json!({"a": null, "b": null, "c": "3"}));
    }

    #[test]
    fn merge_edge_cases() {
        let original = json!({"a": "0"});
        assert_eq!(merge_variables(&original, Some(&Value::Null)), Value::Null);
        assert_eq!(merge_variables(&original, None), original);
        assert_eq!(merge_variables(&original, Some(&json!({}))), original);
        assert_eq!(merge_variables(&json!({}), Some(&json!({"x": 1}))), json!({"x": 1}));
    }

    #[test]
    fn group_relation_reads_connect_only_input() {
        let rel: GroupRelation = serde_json::from_value(json!({"connect": [{"id": "g1"}]})).expect("relation");
        assert_eq!(rel, GroupRelation::connect(&["g1"]));
        assert!(!rel.is_empty());
        assert!(GroupRelation::default().is_empty());
    }
}
