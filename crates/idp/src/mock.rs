//! In-memory identity provider for tests and local runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use hubkit_core::{HubError, HubResult};

use crate::{GroupRepresentation, IdentityProvider, RoleRepresentation, UserRepresentation};

#[derive(Default)]
struct Realm {
    roles: BTreeMap<String, RoleRepresentation>,
    groups: BTreeMap<String, GroupRepresentation>,
    mappings: BTreeMap<String, Vec<String>>,
    members: BTreeMap<String, Vec<UserRepresentation>>,
}

/// Per-operation call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdpCalls {
    pub create_role: usize,
    pub delete_role: usize,
    pub create_group: usize,
    pub delete_group: usize,
}

/// Keeps roles, groups and role mappings in maps. Deleting a role drops it
/// from every group mapping, as Keycloak does.
#[derive(Default)]
pub struct MemoryIdentityProvider {
    realm: Mutex<Realm>,
    create_role: AtomicUsize,
    delete_role: AtomicUsize,
    create_group: AtomicUsize,
    delete_group: AtomicUsize,
}

impl MemoryIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn realm(&self) -> MutexGuard<'_, Realm> {
        self.realm.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a group under a fixed id (e.g. the everyone group).
    pub fn insert_group(&self, id: &str, name: &str) {
        let group = GroupRepresentation {
            id: id.to_string(),
            name: name.to_string(),
            path: Some(format!("/{name}")),
            ..Default::default()
        };
        self.realm().groups.insert(id.to_string(), group);
    }

    pub fn insert_member(&self, group_id: &str, username: &str) {
        let user = UserRepresentation { id: uuid::Uuid::new_v4().to_string(), username: username.to_string(), email: None, enabled: true };
        self.realm().members.entry(group_id.to_string()).or_default().push(user);
    }

    pub fn has_role(&self, name: &str) -> bool {
        self.realm().roles.contains_key(name)
    }

    pub fn role_names(&self) -> Vec<String> {
        self.realm().roles.keys().cloned().collect()
    }

    pub fn has_group(&self, id: &str) -> bool {
        self.realm().groups.contains_key(id)
    }

    /// Role names mapped onto a group.
    pub fn mapped_roles(&self, group_id: &str) -> Vec<String> {
        self.realm().mappings.get(group_id).cloned().unwrap_or_default()
    }

    pub fn calls(&self) -> IdpCalls {
        IdpCalls {
            create_role: self.create_role.load(Ordering::SeqCst),
            delete_role: self.delete_role.load(Ordering::SeqCst),
            create_group: self.create_group.load(Ordering::SeqCst),
            delete_group: self.delete_group.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    async fn create_role(&self, name: &str) -> HubResult<()> {
        self.create_role.fetch_add(1, Ordering::SeqCst);
        let mut realm = self.realm();
        if realm.roles.contains_key(name) {
            return Err(HubError::ResourceConflict(format!("role {name}")));
        }
        let role = RoleRepresentation { id: Some(uuid::Uuid::new_v4().to_string()), ..RoleRepresentation::named(name) };
        realm.roles.insert(name.to_string(), role);
        Ok(())
    }

    async fn find_role_by_name(&self, name: &str) -> HubResult<Option<RoleRepresentation>> {
        Ok(self.realm().roles.get(name).cloned())
    }

    async fn delete_role_by_name(&self, name: &str) -> HubResult<()> {
        self.delete_role.fetch_add(1, Ordering::SeqCst);
        let mut realm = self.realm();
        realm.roles.remove(name).ok_or_else(|| HubError::not_found("role", name))?;
        for mapped in realm.mappings.values_mut() {
            mapped.retain(|r| r != name);
        }
        Ok(())
    }

    async fn find_groups(&self, max: Option<u32>) -> HubResult<Vec<GroupRepresentation>> {
        let realm = self.realm();
        let limit = max.map(|m| m as usize).unwrap_or(usize::MAX);
        Ok(realm.groups.values().take(limit).cloned().collect())
    }

    async fn find_group(&self, id: &str) -> HubResult<Option<GroupRepresentation>> {
        Ok(self.realm().groups.get(id).cloned())
    }

    async fn create_group(&self, name: &str, attributes: BTreeMap<String, Vec<String>>) -> HubResult<String> {
        self.create_group.fetch_add(1, Ordering::SeqCst);
        let mut realm = self.realm();
        if realm.groups.values().any(|g| g.name == name) {
            return Err(HubError::ResourceConflict(format!("group {name}")));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let group = GroupRepresentation {
            id: id.clone(),
            name: name.to_string(),
            path: Some(format!("/{name}")),
            attributes,
            sub_groups: Vec::new(),
        };
        realm.groups.insert(id.clone(), group);
        Ok(id)
    }

    async fn delete_group(&self, id: &str) -> HubResult<()> {
        self.delete_group.fetch_add(1, Ordering::SeqCst);
        let mut realm = self.realm();
        realm.groups.remove(id).ok_or_else(|| HubError::not_found("group", id))?;
        realm.mappings.remove(id);
        realm.members.remove(id);
        Ok(())
    }

    async fn list_group_members(&self, id: &str) -> HubResult<Vec<UserRepresentation>> {
        let realm = self.realm();
        if !realm.groups.contains_key(id) {
            return Err(HubError::not_found("group", id));
        }
        Ok(realm.members.get(id).cloned().unwrap_or_default())
    }

    async fn list_group_role_mappings(&self, group_id: &str) -> HubResult<Vec<RoleRepresentation>> {
        let realm = self.realm();
        if !realm.groups.contains_key(group_id) {
            return Err(HubError::not_found("group", group_id));
        }
        let names = realm.mappings.get(group_id).cloned().unwrap_or_default();
        Ok(names.iter().filter_map(|n| realm.roles.get(n).cloned()).collect())
    }

    async fn add_group_role_mappings(&self, group_id: &str, roles: &[RoleRepresentation]) -> HubResult<()> {
        let mut realm = self.realm();
        if !realm.groups.contains_key(group_id) {
            return Err(HubError::not_found("group", group_id));
        }
        if let Some(missing) = roles.iter().find(|r| !realm.roles.contains_key(&r.name)) {
            return Err(HubError::not_found("role", missing.name.clone()));
        }
        let mapped = realm.mappings.entry(group_id.to_string()).or_default();
        for role in roles {
            if !mapped.contains(&role.name) {
                mapped.push(role.name.clone());
            }
        }
        Ok(())
    }

    async fn remove_group_role_mappings(&self, group_id: &str, roles: &[RoleRepresentation]) -> HubResult<()> {
        let mut realm = self.realm();
        if !realm.groups.contains_key(group_id) {
            return Err(HubError::not_found("group", group_id));
        }
        if let Some(mapped) = realm.mappings.get_mut(group_id) {
            mapped.retain(|name| !roles.iter().any(|r| &r.name == name));
        }
        Ok(())
    }
}
