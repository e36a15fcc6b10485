use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::coalescer::WriteCoalescer;
use crate::store::DurableStore;
use crate::TermKeepError;

pub fn layout_key(project_id: &str) -> String {
    format!("terminals/{}", project_id)
}

/// One terminal as persisted. `id` is whatever the terminal was called when
/// the layout was saved; it does not have to match any live runtime
/// identifier, restoration reconciles the two.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedTerminal {
    pub id: String,
    pub name: String,
    pub shell: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scrollback: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedTerminalLayout {
    pub active_terminal_id: Option<String>,
    pub terminals: Vec<PersistedTerminal>,
    pub updated_at: DateTime<Utc>,
}

/// A terminal currently alive in the UI's pool.
#[derive(Debug, Clone)]
pub struct LiveTerminal {
    pub id: String,
    pub name: String,
    pub shell: String,
    pub cwd: Option<String>,
}

/// Everything the live-terminal factory needs to create a terminal,
/// including captured scrollback to replay into the new buffer.
#[derive(Debug, Clone)]
pub struct TerminalSeed {
    pub name: String,
    pub shell: String,
    pub cwd: Option<String>,
    pub scrollback: Option<String>,
}

/// Scrollback reader exposed by the terminal surface. Serialization is the
/// only consumer.
pub trait TerminalBuffer {
    fn line_count(&self) -> usize;
    fn line(&self, index: usize) -> String;
}

/// The UI's live-object pool. Restoration reconciles persisted records
/// against this; it never holds a reference into UI state.
pub trait TerminalPool {
    fn terminals(&self, project_id: &str) -> Vec<LiveTerminal>;
    fn create_terminal(
        &mut self,
        project_id: &str,
        seed: TerminalSeed,
    ) -> crate::Result<LiveTerminal>;
    fn select_terminal(&mut self, project_id: &str, terminal_id: &str);
}

pub fn platform_default_shell() -> String {
    if cfg!(target_os = "windows") {
        "powershell.exe".to_string()
    } else if cfg!(target_os = "macos") {
        "/bin/zsh".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
    }
}

/// Serializes terminal layouts through the store and reconstructs live
/// terminals from them on project switch.
pub struct RestorationService {
    store: Arc<DurableStore>,
    coalescer: Arc<WriteCoalescer>,
    scrollback_limit: usize,
    default_shell: Option<String>,
    restoring: AtomicBool,
}

impl RestorationService {
    pub fn new(
        store: Arc<DurableStore>,
        coalescer: Arc<WriteCoalescer>,
        scrollback_limit: usize,
        default_shell: Option<String>,
    ) -> Self {
        Self {
            store,
            coalescer,
            scrollback_limit,
            default_shell,
            restoring: AtomicBool::new(false),
        }
    }

    /// True while a restore is in flight. The auto-save subscriber must
    /// check this and hold its writes, otherwise a half-restored state
    /// could be persisted over the real saved layout.
    pub fn is_restoring(&self) -> bool {
        self.restoring.load(Ordering::SeqCst)
    }

    /// Map live terminals to a persistable layout. Scrollback is pulled
    /// from each terminal's own buffer, capped at the configured line
    /// count, trailing blank lines trimmed, and omitted when nothing
    /// remains after trimming.
    pub fn capture_layout(
        &self,
        terminals: &[(&LiveTerminal, &dyn TerminalBuffer)],
        active_terminal_id: Option<&str>,
    ) -> PersistedTerminalLayout {
        let persisted = terminals
            .iter()
            .map(|(terminal, buffer)| PersistedTerminal {
                id: terminal.id.clone(),
                name: terminal.name.clone(),
                shell: terminal.shell.clone(),
                cwd: terminal.cwd.clone(),
                scrollback: self.capture_scrollback(*buffer),
            })
            .collect();

        PersistedTerminalLayout {
            active_terminal_id: active_terminal_id.map(str::to_string),
            terminals: persisted,
            updated_at: Utc::now(),
        }
    }

    fn capture_scrollback(&self, buffer: &dyn TerminalBuffer) -> Option<String> {
        let total = buffer.line_count();
        let start = total.saturating_sub(self.scrollback_limit);
        let mut lines: Vec<String> = (start..total).map(|i| buffer.line(i)).collect();
        while lines.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
            lines.pop();
        }
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }

    pub async fn save_layout(
        &self,
        project_id: &str,
        layout: &PersistedTerminalLayout,
    ) -> crate::Result<()> {
        self.store.write_as(&layout_key(project_id), layout).await
    }

    /// Auto-save path. Suppressed while a restore is in flight.
    pub async fn save_layout_debounced(
        &self,
        project_id: &str,
        layout: &PersistedTerminalLayout,
    ) -> crate::Result<()> {
        if self.is_restoring() {
            debug!(
                "Restore in progress, suppressing layout save for project {}",
                project_id
            );
            return Ok(());
        }
        let document = serde_json::to_value(layout)?;
        self.coalescer
            .write_debounced(&layout_key(project_id), document)
            .await;
        Ok(())
    }

    /// Bring `project_id` to a usable terminal state and return the
    /// selected terminal.
    ///
    /// Three arms: nothing live and nothing persisted creates one default
    /// terminal; nothing live with a persisted layout recreates every
    /// terminal under fresh identifiers and remaps the active id; live
    /// terminals (a project kept warm in memory) are left alone and only
    /// the active selection is resolved. Whatever happens, a project with
    /// at least one terminal ends with one selected; a broken layout file
    /// falls back to a default terminal rather than surfacing an error.
    pub async fn restore_project(
        &self,
        project_id: &str,
        project_shell: Option<&str>,
        pool: &mut dyn TerminalPool,
    ) -> crate::Result<LiveTerminal> {
        self.restoring.store(true, Ordering::SeqCst);
        let result = self.restore_inner(project_id, project_shell, pool).await;
        let result = match result {
            Ok(terminal) => Ok(terminal),
            Err(e) => {
                warn!(
                    "Restoration failed for project {}: {}. Creating default terminal",
                    project_id, e
                );
                self.create_default(project_id, project_shell, pool)
            }
        };
        self.restoring.store(false, Ordering::SeqCst);
        result
    }

    async fn restore_inner(
        &self,
        project_id: &str,
        project_shell: Option<&str>,
        pool: &mut dyn TerminalPool,
    ) -> crate::Result<LiveTerminal> {
        let live = pool.terminals(project_id);
        let layout: Option<PersistedTerminalLayout> =
            self.store.read_as(&layout_key(project_id)).await?;

        if !live.is_empty() {
            return self.resolve_active(project_id, live, layout.as_ref(), pool);
        }

        match layout {
            Some(layout) if !layout.terminals.is_empty() => {
                self.recreate_from_layout(project_id, &layout, pool)
            }
            _ => self.create_default(project_id, project_shell, pool),
        }
    }

    /// Recreate every persisted terminal with a freshly generated id and
    /// resolve the persisted active id through the old-to-new map.
    fn recreate_from_layout(
        &self,
        project_id: &str,
        layout: &PersistedTerminalLayout,
        pool: &mut dyn TerminalPool,
    ) -> crate::Result<LiveTerminal> {
        info!(
            "Restoring {} terminal(s) for project {}",
            layout.terminals.len(),
            project_id
        );

        let mut id_map: HashMap<String, String> = HashMap::new();
        let mut created: Vec<LiveTerminal> = Vec::new();
        for persisted in &layout.terminals {
            let seed = TerminalSeed {
                name: persisted.name.clone(),
                shell: persisted.shell.clone(),
                cwd: persisted.cwd.clone(),
                scrollback: persisted.scrollback.clone(),
            };
            let terminal = pool.create_terminal(project_id, seed)?;
            id_map.insert(persisted.id.clone(), terminal.id.clone());
            created.push(terminal);
        }

        let selected_id = layout
            .active_terminal_id
            .as_ref()
            .and_then(|old| id_map.get(old))
            .cloned()
            .unwrap_or_else(|| created[0].id.clone());
        pool.select_terminal(project_id, &selected_id);

        let selected = created
            .into_iter()
            .find(|t| t.id == selected_id)
            .ok_or_else(|| TermKeepError::Terminal("selected terminal vanished".to_string()))?;
        Ok(selected)
    }

    /// Live terminals already exist: recreate nothing, only resolve which
    /// one is active. Three tiers: direct id match, then the persisted
    /// record's name matched against live names, then the first live
    /// terminal.
    fn resolve_active(
        &self,
        project_id: &str,
        live: Vec<LiveTerminal>,
        layout: Option<&PersistedTerminalLayout>,
        pool: &mut dyn TerminalPool,
    ) -> crate::Result<LiveTerminal> {
        let persisted_active = layout.and_then(|l| l.active_terminal_id.as_deref());

        let selected_id = persisted_active
            .and_then(|active_id| {
                if live.iter().any(|t| t.id == active_id) {
                    return Some(active_id.to_string());
                }
                // The persisted id no longer names a live terminal; match
                // through the persisted record's name instead.
                let name = layout?
                    .terminals
                    .iter()
                    .find(|p| p.id == active_id)
                    .map(|p| p.name.as_str())?;
                live.iter()
                    .find(|t| t.name == name)
                    .map(|t| t.id.clone())
            })
            .unwrap_or_else(|| live[0].id.clone());

        pool.select_terminal(project_id, &selected_id);
        let selected = live
            .into_iter()
            .find(|t| t.id == selected_id)
            .ok_or_else(|| TermKeepError::Terminal("selected terminal vanished".to_string()))?;
        Ok(selected)
    }

    fn create_default(
        &self,
        project_id: &str,
        project_shell: Option<&str>,
        pool: &mut dyn TerminalPool,
    ) -> crate::Result<LiveTerminal> {
        let seed = TerminalSeed {
            name: "Terminal 1".to_string(),
            shell: self.resolve_shell(project_shell),
            cwd: None,
            scrollback: None,
        };
        let terminal = pool.create_terminal(project_id, seed)?;
        pool.select_terminal(project_id, &terminal.id);
        Ok(terminal)
    }

    // Fallback chain: project setting, then global default, then the
    // platform shell.
    fn resolve_shell(&self, project_shell: Option<&str>) -> String {
        project_shell
            .map(str::to_string)
            .or_else(|| self.default_shell.clone())
            .unwrap_or_else(platform_default_shell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coalescer::DEFAULT_DEBOUNCE;
    use tempfile::TempDir;
    use uuid::Uuid;

    struct FakeBuffer {
        lines: Vec<String>,
    }

    impl FakeBuffer {
        fn new(lines: &[&str]) -> Self {
            Self {
                lines: lines.iter().map(|l| l.to_string()).collect(),
            }
        }
    }

    impl TerminalBuffer for FakeBuffer {
        fn line_count(&self) -> usize {
            self.lines.len()
        }
        fn line(&self, index: usize) -> String {
            self.lines[index].clone()
        }
    }

    #[derive(Default)]
    struct FakePool {
        terminals: Vec<LiveTerminal>,
        seeds: Vec<TerminalSeed>,
        selected: Option<String>,
        fail_creation: bool,
    }

    impl TerminalPool for FakePool {
        fn terminals(&self, _project_id: &str) -> Vec<LiveTerminal> {
            self.terminals.clone()
        }

        fn create_terminal(
            &mut self,
            _project_id: &str,
            seed: TerminalSeed,
        ) -> crate::Result<LiveTerminal> {
            if self.fail_creation {
                return Err(TermKeepError::Terminal("spawn failed".to_string()));
            }
            let terminal = LiveTerminal {
                id: Uuid::new_v4().to_string(),
                name: seed.name.clone(),
                shell: seed.shell.clone(),
                cwd: seed.cwd.clone(),
            };
            self.seeds.push(seed);
            self.terminals.push(terminal.clone());
            Ok(terminal)
        }

        fn select_terminal(&mut self, _project_id: &str, terminal_id: &str) {
            self.selected = Some(terminal_id.to_string());
        }
    }

    fn service() -> (TempDir, Arc<DurableStore>, RestorationService) {
        let tmp_dir = TempDir::new().unwrap();
        let store = Arc::new(DurableStore::new(tmp_dir.path().to_path_buf()));
        let coalescer = Arc::new(WriteCoalescer::new(store.clone(), DEFAULT_DEBOUNCE));
        let service = RestorationService::new(store.clone(), coalescer, 1000, None);
        (tmp_dir, store, service)
    }

    fn persisted(id: &str, name: &str) -> PersistedTerminal {
        PersistedTerminal {
            id: id.to_string(),
            name: name.to_string(),
            shell: "/bin/bash".to_string(),
            cwd: Some("/work".to_string()),
            scrollback: Some("$ ls".to_string()),
        }
    }

    #[tokio::test]
    async fn test_no_live_no_layout_creates_default() {
        let (_tmp, _store, service) = service();
        let mut pool = FakePool::default();

        let selected = service
            .restore_project("p1", Some("/bin/fish"), &mut pool)
            .await
            .unwrap();

        assert_eq!(pool.terminals.len(), 1);
        assert_eq!(selected.shell, "/bin/fish");
        assert_eq!(pool.selected.as_deref(), Some(selected.id.as_str()));
    }

    #[tokio::test]
    async fn test_shell_fallback_chain() {
        let (_tmp, store, _service) = service();
        let coalescer = Arc::new(WriteCoalescer::new(store.clone(), DEFAULT_DEBOUNCE));
        let service = RestorationService::new(
            store,
            coalescer,
            1000,
            Some("/bin/global".to_string()),
        );

        let mut pool = FakePool::default();
        let selected = service.restore_project("p1", None, &mut pool).await.unwrap();
        assert_eq!(selected.shell, "/bin/global");
    }

    #[tokio::test]
    async fn test_layout_recreates_terminals_with_fresh_ids() {
        let (_tmp, store, service) = service();
        let layout = PersistedTerminalLayout {
            active_terminal_id: Some("old-b".to_string()),
            terminals: vec![persisted("old-a", "build"), persisted("old-b", "server")],
            updated_at: Utc::now(),
        };
        store.write_as(&layout_key("p1"), &layout).await.unwrap();

        let mut pool = FakePool::default();
        let selected = service.restore_project("p1", None, &mut pool).await.unwrap();

        assert_eq!(pool.terminals.len(), 2);
        // Fresh identifiers, not the persisted ones.
        assert!(pool.terminals.iter().all(|t| t.id != "old-a" && t.id != "old-b"));
        // The active id resolved through the old-to-new map.
        assert_eq!(selected.name, "server");
        assert_eq!(pool.selected.as_deref(), Some(selected.id.as_str()));
        // Seeds carried scrollback through to the factory.
        assert!(pool.seeds.iter().all(|s| s.scrollback.is_some()));
    }

    #[tokio::test]
    async fn test_unresolvable_active_id_selects_first() {
        let (_tmp, store, service) = service();
        let layout = PersistedTerminalLayout {
            active_terminal_id: Some("never-existed".to_string()),
            terminals: vec![persisted("old-a", "build"), persisted("old-b", "server")],
            updated_at: Utc::now(),
        };
        store.write_as(&layout_key("p1"), &layout).await.unwrap();

        let mut pool = FakePool::default();
        let selected = service.restore_project("p1", None, &mut pool).await.unwrap();
        assert_eq!(selected.name, "build");
    }

    #[tokio::test]
    async fn test_warm_project_resolves_by_name() {
        let (_tmp, store, service) = service();
        // Persisted active id "A" names a terminal called "server"; the
        // live set has regenerated ids but matching names.
        let layout = PersistedTerminalLayout {
            active_terminal_id: Some("A".to_string()),
            terminals: vec![persisted("A", "server"), persisted("B", "build")],
            updated_at: Utc::now(),
        };
        store.write_as(&layout_key("p1"), &layout).await.unwrap();

        let live_build = LiveTerminal {
            id: "live-1".to_string(),
            name: "build".to_string(),
            shell: "/bin/bash".to_string(),
            cwd: None,
        };
        let live_server = LiveTerminal {
            id: "live-2".to_string(),
            name: "server".to_string(),
            shell: "/bin/bash".to_string(),
            cwd: None,
        };
        let mut pool = FakePool {
            terminals: vec![live_build, live_server],
            ..FakePool::default()
        };

        let selected = service.restore_project("p1", None, &mut pool).await.unwrap();
        // Nothing was recreated.
        assert_eq!(pool.seeds.len(), 0);
        assert_eq!(selected.id, "live-2");
        assert_eq!(selected.name, "server");
    }

    #[tokio::test]
    async fn test_warm_project_direct_id_match_wins() {
        let (_tmp, store, service) = service();
        let layout = PersistedTerminalLayout {
            active_terminal_id: Some("live-1".to_string()),
            terminals: vec![persisted("live-1", "build")],
            updated_at: Utc::now(),
        };
        store.write_as(&layout_key("p1"), &layout).await.unwrap();

        let mut pool = FakePool {
            terminals: vec![LiveTerminal {
                id: "live-1".to_string(),
                name: "renamed since".to_string(),
                shell: "/bin/bash".to_string(),
                cwd: None,
            }],
            ..FakePool::default()
        };

        let selected = service.restore_project("p1", None, &mut pool).await.unwrap();
        assert_eq!(selected.id, "live-1");
    }

    #[tokio::test]
    async fn test_warm_project_falls_back_to_first_live() {
        let (_tmp, _store, service) = service();
        // No persisted layout at all, but live terminals exist.
        let mut pool = FakePool {
            terminals: vec![
                LiveTerminal {
                    id: "live-1".to_string(),
                    name: "one".to_string(),
                    shell: "/bin/bash".to_string(),
                    cwd: None,
                },
                LiveTerminal {
                    id: "live-2".to_string(),
                    name: "two".to_string(),
                    shell: "/bin/bash".to_string(),
                    cwd: None,
                },
            ],
            ..FakePool::default()
        };

        let selected = service.restore_project("p1", None, &mut pool).await.unwrap();
        assert_eq!(selected.id, "live-1");
        assert_eq!(pool.selected.as_deref(), Some("live-1"));
    }

    #[tokio::test]
    async fn test_corrupt_layout_falls_back_to_default_terminal() {
        let (tmp, _store, service) = service();
        std::fs::create_dir_all(tmp.path().join("terminals")).unwrap();
        std::fs::write(tmp.path().join("terminals/p1.json"), "{broken").unwrap();

        let mut pool = FakePool::default();
        let selected = service.restore_project("p1", None, &mut pool).await.unwrap();
        assert_eq!(pool.terminals.len(), 1);
        assert_eq!(pool.selected.as_deref(), Some(selected.id.as_str()));
        assert!(!service.is_restoring());
    }

    #[tokio::test]
    async fn test_restore_flag_cleared_even_on_total_failure() {
        let (_tmp, _store, service) = service();
        let mut pool = FakePool {
            fail_creation: true,
            ..FakePool::default()
        };

        assert!(service.restore_project("p1", None, &mut pool).await.is_err());
        assert!(!service.is_restoring());
    }

    #[tokio::test]
    async fn test_save_suppressed_while_restoring() {
        let (_tmp, store, service) = service();
        service.restoring.store(true, Ordering::SeqCst);

        let layout = PersistedTerminalLayout {
            active_terminal_id: None,
            terminals: vec![persisted("a", "one")],
            updated_at: Utc::now(),
        };
        service.save_layout_debounced("p1", &layout).await.unwrap();
        service.restoring.store(false, Ordering::SeqCst);

        // Nothing reached the coalescer or the store.
        assert!(store.read(&layout_key("p1")).await.unwrap().is_none());
    }

    #[test]
    fn test_scrollback_capture_trims_and_bounds() {
        let tmp_dir = TempDir::new().unwrap();
        let store = Arc::new(DurableStore::new(tmp_dir.path().to_path_buf()));
        let coalescer = Arc::new(WriteCoalescer::new(store.clone(), DEFAULT_DEBOUNCE));
        let service = RestorationService::new(store, coalescer, 3, None);

        // Bounded to the last 3 lines, trailing blanks trimmed.
        let buffer = FakeBuffer::new(&["one", "two", "three", "four", "", "  "]);
        assert_eq!(
            service.capture_scrollback(&buffer),
            Some("three\nfour".to_string())
        );

        // All blank collapses to nothing.
        let blank = FakeBuffer::new(&["", "  ", ""]);
        assert_eq!(service.capture_scrollback(&blank), None);

        let empty = FakeBuffer::new(&[]);
        assert_eq!(service.capture_scrollback(&empty), None);
    }

    #[test]
    fn test_capture_layout_maps_terminals() {
        let tmp_dir = TempDir::new().unwrap();
        let store = Arc::new(DurableStore::new(tmp_dir.path().to_path_buf()));
        let coalescer = Arc::new(WriteCoalescer::new(store.clone(), DEFAULT_DEBOUNCE));
        let service = RestorationService::new(store, coalescer, 100, None);

        let terminal = LiveTerminal {
            id: "t1".to_string(),
            name: "build".to_string(),
            shell: "/bin/bash".to_string(),
            cwd: Some("/work".to_string()),
        };
        let buffer = FakeBuffer::new(&["$ make", "ok"]);

        let layout = service.capture_layout(&[(&terminal, &buffer)], Some("t1"));
        assert_eq!(layout.active_terminal_id.as_deref(), Some("t1"));
        assert_eq!(layout.terminals.len(), 1);
        assert_eq!(layout.terminals[0].scrollback.as_deref(), Some("$ make\nok"));
    }
}
