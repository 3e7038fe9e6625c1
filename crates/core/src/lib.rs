//! hubkit core types: CRD items, kind descriptors, errors.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod config;
pub mod roles;

pub use config::{CachePolicy, HubConfig, KeycloakSettings};
pub use roles::{ResourcePrefix, ResourceRole};

/// Sentinel id of the built-in default workspace.
pub const DEFAULT_WORKSPACE_ID: &str = "default";

/// Object metadata mirrored from the upstream API. Everything else the API
/// returns (managedFields, uid, ownerReferences, ...) is dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl Metadata {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }
}

/// Bound for spec payloads carried by [`Item`].
pub trait Spec: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Spec for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// A custom resource as seen by hubkit: `{metadata, spec, status}` only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item<S> {
    pub metadata: Metadata,
    pub spec: S,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
}

impl<S> Item<S> {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }
}

impl<S: DeserializeOwned> Item<S> {
    /// Build an item from a raw API object, keeping only metadata/spec/status.
    pub fn from_raw(raw: Value) -> HubResult<Self> {
        let Value::Object(mut obj) = raw else {
            return Err(HubError::Decode("expected a JSON object".into()));
        };
        let mut picked = serde_json::Map::new();
        if let Some(mut meta) = obj.remove("metadata") {
            if let Some(m) = meta.as_object_mut() {
                m.remove("managedFields");
            }
            picked.insert("metadata".into(), meta);
        }
        picked.insert(
            "spec".into(),
            obj.remove("spec").unwrap_or_else(|| Value::Object(Default::default())),
        );
        if let Some(status) = obj.remove("status") {
            picked.insert("status".into(), status);
        }
        Ok(serde_json::from_value(Value::Object(picked))?)
    }
}

/// Group/version/plural/kind of one custom resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrdKind {
    pub group: String,
    pub version: String,
    pub plural: String,
    pub kind: String,
}

impl CrdKind {
    pub fn new(group: &str, version: &str, plural: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            plural: plural.to_string(),
            kind: kind.to_string(),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl fmt::Display for CrdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.group, self.version, self.plural, self.kind)
    }
}

impl FromStr for CrdKind {
    type Err = HubError;

    /// Parses `group/version/plural/Kind`.
    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [group, version, plural, kind] if parts.iter().all(|p| !p.is_empty()) => {
                Ok(CrdKind::new(group, version, plural, kind))
            }
            _ => Err(HubError::Invalid(format!("invalid kind key: {key} (expect group/version/plural/Kind)"))),
        }
    }
}

/// Type of a change observed on a watch feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Added => "ADDED",
            ChangeType::Modified => "MODIFIED",
            ChangeType::Deleted => "DELETED",
        }
    }
}

/// Body of a JSON merge-patch: absent fields are untouched, `null` deletes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub spec: Value,
}

impl MergePatch {
    pub fn spec(spec: Value) -> Self {
        Self { metadata: None, spec }
    }

    pub fn into_body(self) -> Value {
        let mut body = serde_json::Map::new();
        if let Some(meta) = self.metadata {
            body.insert("metadata".into(), meta);
        }
        if !self.spec.is_null() {
            body.insert("spec".into(), self.spec);
        }
        Value::Object(body)
    }
}

/// Error taxonomy shared by every hubkit crate.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum HubError {
    #[error("{kind} not found: {name}")]
    ResourceNotFound { kind: String, name: String },
    #[error("upstream unavailable: {0}")]
    ApiUnavailable(String),
    #[error("resource already exists: {0}")]
    ResourceConflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not authorized: {0}")]
    NotAuthorized(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("decode: {0}")]
    Decode(String),
}

impl HubError {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        HubError::ResourceNotFound { kind: kind.into(), name: name.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HubError::ResourceNotFound { .. })
    }

    /// Stable machine-readable code for transport layers.
    pub fn code(&self) -> &'static str {
        match self {
            HubError::ResourceNotFound { .. } => "RESOURCE_NOT_FOUND",
            HubError::ApiUnavailable(_) => "API_UNAVAILABLE",
            HubError::ResourceConflict(_) => "RESOURCE_CONFLICT",
            HubError::Forbidden(_) => "FORBIDDEN",
            HubError::NotAuthorized(_) => "NOT_AUTH",
            HubError::Invalid(_) => "BAD_USER_INPUT",
            HubError::Decode(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::Decode(e.to_string())
    }
}

pub type HubResult<T> = Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_raw_strips_envelope_fields() {
        let raw = json!({
            "apiVersion": "hub.io/v1",
            "kind": "Thing",
            "metadata": {
                "name": "a",
                "namespace": "hub",
                "uid": "0000",
                "managedFields": [{"manager": "kubectl"}],
                "resourceVersion": "7",
            },
            "spec": {"x": 1},
            "status": {"phase": "Ready"},
        });
        let item: Item<Value> = Item::from_raw(raw).expect("decode");
        assert_eq!(item.name(), "a");
        assert_eq!(item.namespace(), Some("hub"));
        assert_eq!(item.metadata.resource_version.as_deref(), Some("7"));
        assert_eq!(item.spec, json!({"x": 1}));
        assert_eq!(item.status, Some(json!({"phase": "Ready"})));
        let back = serde_json::to_value(&item).expect("encode");
        assert!(back.get("apiVersion").is_none());
        assert!(back["metadata"].get("uid").is_none());
    }

    #[test]
    fn from_raw_tolerates_missing_spec() {
        let item: Item<Value> = Item::from_raw(json!({"metadata": {"name": "a"}})).expect("decode");
        assert_eq!(item.spec, json!({}));
        assert!(item.status.is_none());
    }

    #[test]
    fn from_raw_rejects_non_objects() {
        let err = Item::<Value>::from_raw(json!([1, 2])).unwrap_err();
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }

    #[test]
    fn crd_kind_parses_and_renders() {
        let k: CrdKind = "hub.io/v1alpha1/instancetypes/InstanceType".parse().expect("ok");
        assert_eq!(k.api_version(), "hub.io/v1alpha1");
        assert_eq!(k.to_string(), "hub.io/v1alpha1/instancetypes/InstanceType");
        assert!("hub.io/v1/Thing".parse::<CrdKind>().is_err());
        assert!("a//b/C".parse::<CrdKind>().is_err());
    }

    #[test]
    fn merge_patch_body_omits_absent_parts() {
        let body = MergePatch::spec(json!({"a": null})).into_body();
        assert_eq!(body, json!({"spec": {"a": null}}));
        let body = MergePatch { metadata: Some(json!({"labels": {"x": "y"}})), spec: Value::Null }.into_body();
        assert_eq!(body, json!({"metadata": {"labels": {"x": "y"}}}));
    }
}
