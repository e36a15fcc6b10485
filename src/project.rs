use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::layout::layout_key;
use crate::snapshot::snapshot_key;
use crate::store::DurableStore;

pub const PROJECTS_KEY: &str = "projects";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: String,
    /// Per-project shell override; first tier of the restoration shell
    /// fallback chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

/// The list of known projects, persisted as one document under `projects`.
pub struct ProjectRegistry {
    store: Arc<DurableStore>,
    projects: Vec<Project>,
}

impl ProjectRegistry {
    pub async fn load(store: Arc<DurableStore>) -> crate::Result<Self> {
        let projects = store.read_as(PROJECTS_KEY).await?.unwrap_or_default();
        Ok(Self { store, projects })
    }

    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    pub fn get(&self, id: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.id == id)
    }

    pub async fn add(
        &mut self,
        name: &str,
        path: &str,
        shell: Option<String>,
    ) -> crate::Result<Project> {
        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            path: path.to_string(),
            shell,
        };
        self.projects.push(project.clone());
        if let Err(e) = self.persist().await {
            self.projects.pop();
            return Err(e);
        }
        info!("Added project '{}' ({})", name, project.id);
        Ok(project)
    }

    /// Remove a project and its dependent documents (layout, snapshots).
    pub async fn remove(&mut self, id: &str) -> crate::Result<bool> {
        let before = self.projects.len();
        self.projects.retain(|p| p.id != id);
        if self.projects.len() == before {
            return Ok(false);
        }
        self.persist().await?;
        self.store.remove(&layout_key(id)).await?;
        self.store.remove(&snapshot_key(id)).await?;
        Ok(true)
    }

    pub async fn set_shell(&mut self, id: &str, shell: Option<String>) -> crate::Result<bool> {
        let Some(project) = self.projects.iter_mut().find(|p| p.id == id) else {
            return Ok(false);
        };
        project.shell = shell;
        self.persist().await?;
        Ok(true)
    }

    async fn persist(&self) -> crate::Result<()> {
        self.store.write_as(PROJECTS_KEY, &self.projects).await
    }
}
