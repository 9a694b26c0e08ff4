//! Migratable resource produced by the resource collaborator.

use serde::{Deserialize, Serialize};

/// Kind of a migratable resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Dashboard definition.
    Dashboard,
    /// Datasource configuration.
    Datasource,
    /// Folder.
    Folder,
    /// Library panel or variable.
    LibraryElement,
    /// Alert rule.
    AlertRule,
    /// Notification contact point.
    ContactPoint,
}

impl ResourceKind {
    /// Parse the directory name used for a kind.
    #[must_use]
    pub fn from_dir_name(name: &str) -> Option<Self> {
        match name {
            "dashboards" => Some(Self::Dashboard),
            "datasources" => Some(Self::Datasource),
            "folders" => Some(Self::Folder),
            "library_elements" => Some(Self::LibraryElement),
            "alert_rules" => Some(Self::AlertRule),
            "contact_points" => Some(Self::ContactPoint),
            _ => None,
        }
    }
}

/// One resource serialized for migration; contents are opaque here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct MigrationResource {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Identifier unique within the kind.
    pub ref_id: String,
    /// Human-readable name.
    pub name: String,
    /// Serialized resource body.
    pub data: serde_json::Value,
}
