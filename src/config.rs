//! Project configuration and the on-disk layout of the credential store.
//!
//! ```text
//! {project}/.heimdell/credentials.json             canonical (link or copy)
//! {project}/.heimdell/{env}/credentials.json       per-environment file
//! {project}/.heimdell/.current-env                 active environment marker
//! {project}/.heimdell/.gitignore                   generated
//! {project}/.heimdell/.temp/                       backups of replaced files
//! ```

use std::path::{Component, Path, PathBuf};

use crate::error::{HeimdellError, Result};

/// Name of the store directory inside a project (and inside `$HOME`).
pub const STORE_DIR: &str = ".heimdell";

/// File name of every credential document.
pub const CREDENTIALS_FILE: &str = "credentials.json";

/// Marker file holding the active environment name.
pub const CURRENT_ENV_FILE: &str = ".current-env";

/// Staging directory for backups.
pub const TEMP_DIR: &str = ".temp";

const GITIGNORE_FILE: &str = ".gitignore";

/// Environment variable overriding the project directory.
pub const PROJECT_DIR_ENV: &str = "HEIMDELL_PROJECT_DIR";

/// Where the project lives.
///
/// Precedence: explicit `project_dir` > `HEIMDELL_PROJECT_DIR` > current
/// working directory.
#[derive(Debug, Clone, Default)]
pub struct ProjectConfig {
    /// Explicit project directory, usually from `--project-dir`.
    pub project_dir: Option<PathBuf>,
}

impl ProjectConfig {
    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = Some(dir.into());
        self
    }

    /// Resolve the project directory using the precedence rules above.
    pub fn project_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.project_dir {
            return Ok(dir.clone());
        }

        if let Some(dir) = std::env::var_os(PROJECT_DIR_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(dir));
        }

        std::env::current_dir().map_err(|e| HeimdellError::io("resolve", ".", e))
    }

    /// The layout of the project-local store.
    pub fn layout(&self) -> Result<Layout> {
        Ok(Layout::new(self.project_dir()?))
    }
}

/// Paths of one credential store rooted at `{root}/.heimdell`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
    store_dir: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let store_dir = root.join(STORE_DIR);
        Self { root, store_dir }
    }

    /// The per-user store under the home directory, if one can be found.
    pub fn global() -> Option<Self> {
        dirs::home_dir().map(Self::new)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    /// The canonical (active) credentials path.
    pub fn credentials_path(&self) -> PathBuf {
        self.store_dir.join(CREDENTIALS_FILE)
    }

    pub fn environment_dir(&self, name: &str) -> PathBuf {
        self.store_dir.join(name)
    }

    pub fn environment_credentials(&self, name: &str) -> PathBuf {
        self.environment_dir(name).join(CREDENTIALS_FILE)
    }

    pub fn current_env_marker(&self) -> PathBuf {
        self.store_dir.join(CURRENT_ENV_FILE)
    }

    pub fn gitignore_path(&self) -> PathBuf {
        self.store_dir.join(GITIGNORE_FILE)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.store_dir.join(TEMP_DIR)
    }

    /// Deterministic backup location for `path`.
    ///
    /// The path is made relative to the project root and flattened into a
    /// single file name, so `.heimdell/credentials.json` backs up to
    /// `.heimdell/.temp/.heimdell_credentials.json.bak`.
    pub fn backup_path(&self, path: &Path) -> PathBuf {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let flattened = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("_");

        self.temp_dir().join(format!("{flattened}.bak"))
    }
}
