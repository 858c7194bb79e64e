//! Layered configuration for drover.
//!
//! Settings load from `.drover/drover.toml` when present, with serde
//! defaults for everything, then CLI flags override at the call sites that
//! care. The runtime [`Config`] bridges the file settings to concrete
//! paths under `.drover/`.
//!
//! # Configuration File Format
//!
//! ```toml
//! [phases]
//! cmd = "claude"
//! args = ["--print"]
//! transient_retries = 2
//! retry_window_secs = 60
//!
//! [workspace]
//! default_branch = "main"
//! protected_branches = ["main", "master"]
//! staleness_threshold = 5
//!
//! [quality]
//! enabled = false
//! max_iterations = 3
//!
//! [tracker]
//! gh_cmd = "gh"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Phase invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasesSection {
    /// Command executing the opaque phase operation.
    #[serde(default = "default_phase_cmd")]
    pub cmd: String,
    /// Arguments prepended before the phase name and issue id.
    #[serde(default)]
    pub args: Vec<String>,
    /// Automatic retries for transient invocation failures.
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
    /// Window within which those retries may happen, in seconds.
    #[serde(default = "default_retry_window_secs")]
    pub retry_window_secs: u64,
}

fn default_phase_cmd() -> String {
    "claude".to_string()
}

fn default_transient_retries() -> u32 {
    2
}

fn default_retry_window_secs() -> u64 {
    60
}

impl Default for PhasesSection {
    fn default() -> Self {
        Self {
            cmd: default_phase_cmd(),
            args: Vec::new(),
            transient_retries: default_transient_retries(),
            retry_window_secs: default_retry_window_secs(),
        }
    }
}

/// Workspace lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSection {
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default = "default_protected_branches")]
    pub protected_branches: Vec<String>,
    /// Commits behind the remote default before a clean workspace is
    /// destroyed and recreated.
    #[serde(default = "default_staleness_threshold")]
    pub staleness_threshold: u32,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_protected_branches() -> Vec<String> {
    vec!["main".to_string(), "master".to_string()]
}

fn default_staleness_threshold() -> u32 {
    5
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            default_branch: default_branch(),
            protected_branches: default_protected_branches(),
            staleness_threshold: default_staleness_threshold(),
        }
    }
}

/// Quality loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualitySection {
    /// Default loop enablement when no flag, label, or planning comment
    /// says otherwise.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_max_iterations() -> u32 {
    crate::quality::DEFAULT_MAX_ITERATIONS
}

impl Default for QualitySection {
    fn default() -> Self {
        Self {
            enabled: false,
            max_iterations: default_max_iterations(),
        }
    }
}

/// Tracker host settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSection {
    #[serde(default = "default_gh_cmd")]
    pub gh_cmd: String,
}

fn default_gh_cmd() -> String {
    "gh".to_string()
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            gh_cmd: default_gh_cmd(),
        }
    }
}

/// The parsed `.drover/drover.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DroverToml {
    #[serde(default)]
    pub phases: PhasesSection,
    #[serde(default)]
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub quality: QualitySection,
    #[serde(default)]
    pub tracker: TrackerSection,
}

impl DroverToml {
    /// Load from the drover directory, falling back to defaults when the
    /// file does not exist.
    pub fn load_or_default(drover_dir: &Path) -> Result<Self> {
        let path = drover_dir.join("drover.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }
}

/// Runtime configuration: file settings resolved against a project
/// directory.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub drover_dir: PathBuf,
    pub store_path: PathBuf,
    pub worktrees_dir: PathBuf,
    pub toml: DroverToml,
    pub verbose: bool,
}

impl Config {
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let drover_dir = project_dir.join(".drover");
        let toml = DroverToml::load_or_default(&drover_dir)?;
        Ok(Self {
            store_path: drover_dir.join("issues.json"),
            worktrees_dir: drover_dir.join("worktrees"),
            project_dir,
            drover_dir,
            toml,
            verbose,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.drover_dir).context("Failed to create .drover directory")?;
        std::fs::create_dir_all(&self.worktrees_dir)
            .context("Failed to create worktrees directory")?;
        Ok(())
    }

    pub fn retry_window(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.toml.phases.retry_window_secs)
    }
}
