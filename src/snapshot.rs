use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::layout::PersistedTerminal;
use crate::store::DurableStore;

pub fn snapshot_key(project_id: &str) -> String {
    format!("snapshots/{}", project_id)
}

/// Immutable point-in-time capture of a project's terminals. Never edited
/// after creation, only deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub terminals: Vec<PersistedTerminal>,
    pub active_terminal_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

fn generate_snapshot_id() -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("{}-{:08x}", Utc::now().timestamp_millis(), suffix)
}

/// Per-project snapshot lists, newest first, cached in memory and persisted
/// under `snapshots/<projectId>`.
///
/// Mutations are two-phase: the new list is computed, the durable write is
/// attempted, and the in-memory state is committed only when the write
/// succeeds. Local and durable state never silently disagree.
pub struct SnapshotStore {
    store: Arc<DurableStore>,
    local: HashMap<String, Vec<PersistedSnapshot>>,
}

impl SnapshotStore {
    pub fn new(store: Arc<DurableStore>) -> Self {
        Self {
            store,
            local: HashMap::new(),
        }
    }

    /// Warm the in-memory list for a project from disk.
    pub async fn load_project(&mut self, project_id: &str) -> crate::Result<&[PersistedSnapshot]> {
        let persisted: Vec<PersistedSnapshot> = self
            .store
            .read_as(&snapshot_key(project_id))
            .await?
            .unwrap_or_default();
        self.local.insert(project_id.to_string(), persisted);
        Ok(self.local.get(project_id).map(|v| v.as_slice()).unwrap_or(&[]))
    }

    /// In-memory view. Call `load_project` first on project open.
    pub fn snapshots(&self, project_id: &str) -> &[PersistedSnapshot] {
        self.local
            .get(project_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub async fn create_snapshot(
        &mut self,
        project_id: &str,
        name: &str,
        description: Option<String>,
        terminals: Vec<PersistedTerminal>,
        active_terminal_id: Option<String>,
        tag: Option<String>,
    ) -> crate::Result<PersistedSnapshot> {
        let snapshot = PersistedSnapshot {
            id: generate_snapshot_id(),
            project_id: project_id.to_string(),
            name: name.to_string(),
            description,
            created_at: Utc::now(),
            terminals,
            active_terminal_id,
            tag,
        };

        // Prepend to whatever list is on disk, then commit locally only
        // once the write has landed.
        let key = snapshot_key(project_id);
        let mut persisted: Vec<PersistedSnapshot> =
            self.store.read_as(&key).await?.unwrap_or_default();
        persisted.insert(0, snapshot.clone());
        self.store.write_as(&key, &persisted).await?;

        self.local
            .entry(project_id.to_string())
            .or_default()
            .insert(0, snapshot.clone());

        info!("Created snapshot '{}' for project {}", name, project_id);
        Ok(snapshot)
    }

    /// Delete by id. An id absent from local state is a no-op that performs
    /// no I/O at all.
    pub async fn delete_snapshot(&mut self, project_id: &str, id: &str) -> crate::Result<bool> {
        let known = self
            .local
            .get(project_id)
            .map(|list| list.iter().any(|s| s.id == id))
            .unwrap_or(false);
        if !known {
            debug!("Snapshot {} not in local state, nothing to delete", id);
            return Ok(false);
        }

        let key = snapshot_key(project_id);
        let mut persisted: Vec<PersistedSnapshot> =
            self.store.read_as(&key).await?.unwrap_or_default();
        persisted.retain(|s| s.id != id);
        self.store.write_as(&key, &persisted).await?;

        if let Some(list) = self.local.get_mut(project_id) {
            list.retain(|s| s.id != id);
        }
        Ok(true)
    }

    /// Read-through lookup against the persisted list.
    pub async fn get_snapshot(
        &self,
        project_id: &str,
        id: &str,
    ) -> crate::Result<Option<PersistedSnapshot>> {
        let persisted: Vec<PersistedSnapshot> = self
            .store
            .read_as(&snapshot_key(project_id))
            .await?
            .unwrap_or_default();
        Ok(persisted.into_iter().find(|s| s.id == id))
    }
}
