//! Workspace configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Operator-configured workspace roots that workers may be pointed at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub workspace_roots: Vec<PathBuf>,
}
