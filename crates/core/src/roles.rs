//! Role-name grammar linking identity-provider roles to managed resources.
//!
//! ```text
//! [ rolePrefix ":" ] resourcePrefix ":" [ label ":" ]* [ workspaceId "|" ] resourceName
//! ```
//!
//! Role names are the only record of which role governs which resource in
//! which workspace, so this is a wire format: `encode(decode(s)) == s` for
//! every input, and `decode` is total.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::DEFAULT_WORKSPACE_ID;

/// Kind segment of a role name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourcePrefix {
    /// Instance types
    It,
    /// Datasets
    Ds,
    /// Images
    Img,
    /// Announcements
    Ann,
}

impl ResourcePrefix {
    pub const ALL: [ResourcePrefix; 4] = [ResourcePrefix::It, ResourcePrefix::Ds, ResourcePrefix::Img, ResourcePrefix::Ann];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourcePrefix::It => "it",
            ResourcePrefix::Ds => "ds",
            ResourcePrefix::Img => "img",
            ResourcePrefix::Ann => "ann",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == s)
    }
}

impl fmt::Display for ResourcePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded role name. A role that does not follow the grammar is *foreign*:
/// `resource_prefix` and `resource_name` are `None` and only
/// `original_name` is meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRole {
    pub role_prefix: Option<String>,
    pub resource_prefix: Option<ResourcePrefix>,
    pub labels: SmallVec<[String; 2]>,
    /// Workspace segment as written; `None` means the default workspace.
    pub workspace: Option<String>,
    pub resource_name: Option<String>,
    pub original_name: String,
}

impl ResourceRole {
    /// Build a role for a managed resource. The workspace segment is only
    /// written for non-default workspaces.
    pub fn new(
        role_prefix: Option<&str>,
        resource_prefix: ResourcePrefix,
        labels: &[&str],
        workspace_id: &str,
        resource_name: &str,
    ) -> Self {
        let mut role = ResourceRole {
            role_prefix: role_prefix.map(str::to_string),
            resource_prefix: Some(resource_prefix),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            workspace: (workspace_id != DEFAULT_WORKSPACE_ID).then(|| workspace_id.to_string()),
            resource_name: Some(resource_name.to_string()),
            original_name: String::new(),
        };
        role.original_name = role.render();
        role
    }

    fn foreign(name: &str) -> Self {
        ResourceRole {
            role_prefix: None,
            resource_prefix: None,
            labels: SmallVec::new(),
            workspace: None,
            resource_name: None,
            original_name: name.to_string(),
        }
    }

    /// Parse a role name. Never fails; see [`ResourceRole::is_foreign`].
    pub fn decode(name: &str) -> Self {
        let segments: Vec<&str> = name.split(':').collect();
        let (role_prefix, resource_prefix, rest) = match segments.as_slice() {
            [first, rest @ ..] if ResourcePrefix::parse(first).is_some() => (None, ResourcePrefix::parse(first), rest),
            [first, second, rest @ ..] if ResourcePrefix::parse(second).is_some() => {
                (Some(*first), ResourcePrefix::parse(second), rest)
            }
            _ => return Self::foreign(name),
        };
        let Some((last, labels)) = rest.split_last() else {
            return Self::foreign(name);
        };
        let (workspace, resource_name) = match last.split_once('|') {
            Some((ws, res)) => (Some(ws.to_string()), res),
            None => (None, *last),
        };
        ResourceRole {
            role_prefix: role_prefix.map(str::to_string),
            resource_prefix,
            labels: labels.iter().map(|l| l.to_string()).collect(),
            workspace,
            resource_name: Some(resource_name.to_string()),
            original_name: name.to_string(),
        }
    }

    /// Render the role name from its fields (exact inverse of `decode`).
    pub fn encode(&self) -> String {
        if self.is_foreign() {
            return self.original_name.clone();
        }
        self.render()
    }

    fn render(&self) -> String {
        let mut out = String::new();
        if let Some(p) = &self.role_prefix {
            out.push_str(p);
            out.push(':');
        }
        if let Some(p) = self.resource_prefix {
            out.push_str(p.as_str());
            out.push(':');
        }
        for label in &self.labels {
            out.push_str(label);
            out.push(':');
        }
        if let Some(ws) = &self.workspace {
            out.push_str(ws);
            out.push('|');
        }
        if let Some(name) = &self.resource_name {
            out.push_str(name);
        }
        out
    }

    pub fn is_foreign(&self) -> bool {
        self.resource_prefix.is_none() || self.resource_name.is_none()
    }

    /// Effective workspace id; names without a workspace segment belong to
    /// the default workspace.
    pub fn workspace_id(&self) -> &str {
        self.workspace.as_deref().unwrap_or(DEFAULT_WORKSPACE_ID)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

impl fmt::Display for ResourceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl From<&str> for ResourceRole {
    fn from(name: &str) -> Self {
        ResourceRole::decode(name)
    }
}

/// Free-function form of [`ResourceRole::decode`].
pub fn decode(name: &str) -> ResourceRole {
    ResourceRole::decode(name)
}

/// Free-function form of [`ResourceRole::encode`].
pub fn encode(role: &ResourceRole) -> String {
    role.encode()
}
