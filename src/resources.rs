//! Resource enumeration for snapshot packaging.
//!
//! Serializing individual resource types is not this crate's concern: a
//! [`ResourceProducer`] hands back already-serialized resources and the
//! snapshot orchestrator only counts and packages them.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tracing::{debug, warn};

use crate::models::resource::{MigrationResource, ResourceKind};
use crate::models::user::SignedInUser;
use crate::{AppError, Result};

/// Source of the resources an organization can migrate.
pub trait ResourceProducer: Send + Sync {
    /// Enumerate every migratable resource visible to `user` in their organization.
    ///
    /// # Errors
    ///
    /// Returns an error if enumeration fails; the snapshot being created
    /// moves to `Error`.
    fn collect<'a>(
        &'a self,
        user: &'a SignedInUser,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MigrationResource>>> + Send + 'a>>;
}

/// Reads exported resources from `<root>/org_<id>/<kind>/<name>.json`.
///
/// Kind directories are `dashboards`, `datasources`, `folders`,
/// `library_elements`, `alert_rules` and `contact_points`; anything else
/// is skipped. A missing organization directory yields no resources.
#[derive(Debug, Clone)]
pub struct DirectoryResourceProducer {
    root: PathBuf,
}

impl DirectoryResourceProducer {
    /// Create a producer over `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding one organization's export.
    #[must_use]
    pub fn org_dir(&self, org_id: i64) -> PathBuf {
        self.root.join(format!("org_{org_id}"))
    }
}

impl ResourceProducer for DirectoryResourceProducer {
    fn collect<'a>(
        &'a self,
        user: &'a SignedInUser,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MigrationResource>>> + Send + 'a>> {
        let org_dir = self.org_dir(user.org_id);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || read_org_dir(&org_dir))
                .await
                .map_err(|err| AppError::Io(format!("resource scan task panicked: {err}")))?
        })
    }
}

fn read_org_dir(org_dir: &Path) -> Result<Vec<MigrationResource>> {
    if !org_dir.is_dir() {
        debug!(dir = %org_dir.display(), "no export directory for organization");
        return Ok(Vec::new());
    }

    let mut kind_dirs = sorted_entries(org_dir)?;
    kind_dirs.retain(|p| p.is_dir());

    let mut resources = Vec::new();
    for kind_dir in kind_dirs {
        let dir_name = kind_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(kind) = ResourceKind::from_dir_name(&dir_name) else {
            warn!(dir = %kind_dir.display(), "skipping unknown resource kind directory");
            continue;
        };

        for file in sorted_entries(&kind_dir)? {
            if file.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            resources.push(read_resource(kind, &file)?);
        }
    }

    Ok(resources)
}

fn read_resource(kind: ResourceKind, file: &Path) -> Result<MigrationResource> {
    let raw = std::fs::read(file)
        .map_err(|err| AppError::Io(format!("cannot read {}: {err}", file.display())))?;
    let data: serde_json::Value = serde_json::from_slice(&raw)
        .map_err(|err| AppError::Io(format!("invalid json in {}: {err}", file.display())))?;

    let ref_id = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = data
        .get("title")
        .or_else(|| data.get("name"))
        .and_then(serde_json::Value::as_str)
        .map_or_else(|| ref_id.clone(), ToOwned::to_owned);

    Ok(MigrationResource {
        kind,
        ref_id,
        name,
        data,
    })
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|err| AppError::Io(format!("cannot read {}: {err}", dir.display())))?;
    let mut paths = entries
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<PathBuf>>>()
        .map_err(|err| AppError::Io(format!("cannot list {}: {err}", dir.display())))?;
    paths.sort();
    Ok(paths)
}
