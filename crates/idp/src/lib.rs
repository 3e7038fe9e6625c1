//! hubkit idp: the slice of the identity provider's admin API that role and
//! workspace lifecycles need (realm roles, groups, group role mappings).

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use async_trait::async_trait;
use hubkit_core::HubResult;
use serde::{Deserialize, Serialize};

pub mod keycloak;
pub mod mock;

pub use keycloak::KeycloakAdmin;
pub use mock::MemoryIdentityProvider;

/// Realm role as exchanged with the admin API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRepresentation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub composite: bool,
}

impl RoleRepresentation {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRepresentation {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_groups: Vec<GroupRepresentation>,
}

impl GroupRepresentation {
    /// First value of a group attribute.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.first()).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRepresentation {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub enabled: bool,
}

/// Admin operations on one realm.
///
/// Errors follow the shared taxonomy: unknown role/group is
/// `ResourceNotFound`, a duplicate is `ResourceConflict`, a rejected token is
/// `NotAuthorized`, anything else is `ApiUnavailable`.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `ResourceConflict` when a role with that name exists.
    async fn create_role(&self, name: &str) -> HubResult<()>;

    async fn find_role_by_name(&self, name: &str) -> HubResult<Option<RoleRepresentation>>;

    async fn delete_role_by_name(&self, name: &str) -> HubResult<()>;

    async fn find_groups(&self, max: Option<u32>) -> HubResult<Vec<GroupRepresentation>>;

    async fn find_group(&self, id: &str) -> HubResult<Option<GroupRepresentation>>;

    /// Returns the id of the new group.
    async fn create_group(&self, name: &str, attributes: BTreeMap<String, Vec<String>>) -> HubResult<String>;

    async fn delete_group(&self, id: &str) -> HubResult<()>;

    async fn list_group_members(&self, id: &str) -> HubResult<Vec<UserRepresentation>>;

    /// Realm roles directly mapped onto the group.
    async fn list_group_role_mappings(&self, group_id: &str) -> HubResult<Vec<RoleRepresentation>>;

    async fn add_group_role_mappings(&self, group_id: &str, roles: &[RoleRepresentation]) -> HubResult<()>;

    async fn remove_group_role_mappings(&self, group_id: &str, roles: &[RoleRepresentation]) -> HubResult<()>;
}
