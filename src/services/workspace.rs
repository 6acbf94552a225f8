//! Workspace-root registry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::domain::models::WorkspaceConfig;
use crate::domain::ports::store::StateStore;

/// Operator-configured roots that workers may be granted access to.
pub struct WorkspaceRegistry {
    roots: RwLock<Vec<PathBuf>>,
    store: Arc<dyn StateStore>,
}

impl WorkspaceRegistry {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            roots: RwLock::new(Vec::new()),
            store,
        }
    }

    /// Load persisted roots. Returns true when at least one root is
    /// configured; a first run returns false and the front-end prompts.
    pub async fn initialize(&self) -> bool {
        match self.store.load_workspace_config().await {
            Ok(Some(config)) => {
                let configured = !config.workspace_roots.is_empty();
                *self.roots.write().await = config.workspace_roots;
                configured
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load workspace config");
                false
            }
        }
    }

    pub async fn roots(&self) -> Vec<PathBuf> {
        self.roots.read().await.clone()
    }

    /// Add a root. Returns false when it was already present.
    pub async fn add_root(&self, path: PathBuf) -> bool {
        let added = {
            let mut roots = self.roots.write().await;
            if roots.contains(&path) {
                false
            } else {
                roots.push(path);
                true
            }
        };
        if added {
            self.persist().await;
        }
        added
    }

    /// Remove a root. Returns false when it was not present.
    pub async fn remove_root(&self, path: &Path) -> bool {
        let removed = {
            let mut roots = self.roots.write().await;
            let before = roots.len();
            roots.retain(|r| r.as_path() != path);
            before != roots.len()
        };
        if removed {
            self.persist().await;
        }
        removed
    }

    async fn persist(&self) {
        let config = WorkspaceConfig {
            workspace_roots: self.roots.read().await.clone(),
        };
        if let Err(e) = self.store.save_workspace_config(&config).await {
            tracing::warn!(error = %e, "failed to persist workspace config");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::InMemoryStateStore;

    #[tokio::test]
    async fn test_add_remove_round_trip() {
        let store = Arc::new(InMemoryStateStore::new());
        let registry = WorkspaceRegistry::new(store.clone());
        assert!(!registry.initialize().await);

        assert!(registry.add_root(PathBuf::from("/projects/a")).await);
        assert!(!registry.add_root(PathBuf::from("/projects/a")).await);
        assert!(registry.add_root(PathBuf::from("/projects/b")).await);

        let reloaded = WorkspaceRegistry::new(store);
        assert!(reloaded.initialize().await);
        assert_eq!(reloaded.roots().await.len(), 2);

        assert!(reloaded.remove_root(Path::new("/projects/a")).await);
        assert!(!reloaded.remove_root(Path::new("/projects/a")).await);
    }
}
