//! Configuration for notewell.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (NOTEWELL_HOME)
//! 2. Config file (.notewell/config.yaml)
//! 3. Defaults (~/.notewell)
//!
//! Config file discovery:
//! - Searches current directory and parents for .notewell/config.yaml
//! - `paths.home` is relative to the .notewell/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub ledger: LedgerSettings,
    #[serde(default)]
    pub reconcile: ReconcileSettings,
    #[serde(default)]
    pub escalation: EscalationSettings,
    #[serde(default)]
    pub diffusion: DiffusionSettings,
    #[serde(default)]
    pub budget: BudgetSettings,
    #[serde(default)]
    pub synthesis: SynthesisSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .notewell/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    /// Chain conflicts retried before the append is surfaced as an error
    pub max_conflict_retries: u32,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            max_conflict_retries: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    /// Overlap window around an evidence timestamp (± seconds)
    pub window_seconds: f64,
    /// Revisions whose text similarity is at or above this are churn
    pub text_similarity_threshold: f64,
    /// Confidence change that always qualifies a revision
    pub confidence_delta_threshold: f64,
    /// Qualifying revisions per note per rolling hour
    pub revision_cap_per_hour: u32,
    pub synthesis_timeout_seconds: u64,
    /// Back-off before a deferred revision whose synthesis failed is tried again
    pub deferred_retry_seconds: u64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            window_seconds: 30.0,
            text_similarity_threshold: 0.95,
            confidence_delta_threshold: 0.05,
            revision_cap_per_hour: 3,
            synthesis_timeout_seconds: 30,
            deferred_retry_seconds: 60,
        }
    }
}

impl ReconcileSettings {
    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_secs(self.synthesis_timeout_seconds)
    }

    pub fn deferred_retry(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.deferred_retry_seconds as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationSettings {
    /// Added to the retrieval window by ladder step 1 (± seconds)
    pub window_increment_seconds: f64,
    /// Reserved from the cost governor before a fresh capture
    pub capture_estimated_cost: f64,
    pub capture_timeout_seconds: u64,
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            window_increment_seconds: 30.0,
            capture_estimated_cost: 1.0,
            capture_timeout_seconds: 60,
        }
    }
}

impl EscalationSettings {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionSettings {
    pub max_active_per_session: usize,
    pub task_timeout_seconds: u64,
    /// Reserved per synthesis call inside a pass
    pub estimated_cost_per_pass: f64,
    /// Notes at or above this text similarity are merge candidates
    pub merge_similarity_threshold: f64,
    /// Merge candidates must be anchored within this many seconds
    pub merge_window_seconds: f64,
}

impl Default for DiffusionSettings {
    fn default() -> Self {
        Self {
            max_active_per_session: 1,
            task_timeout_seconds: 120,
            estimated_cost_per_pass: 1.0,
            merge_similarity_threshold: 0.8,
            merge_window_seconds: 30.0,
        }
    }
}

impl DiffusionSettings {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSettings {
    /// Cost units available to each session
    pub per_session: f64,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self { per_session: 25.0 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisSettings {
    /// HTTP synthesis endpoint; the rule-based synthesizer is used when unset
    pub endpoint: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to notewell home (ledger state)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub ledger: LedgerSettings,
    pub reconcile: ReconcileSettings,
    pub escalation: EscalationSettings,
    pub diffusion: DiffusionSettings,
    pub budget: BudgetSettings,
    pub synthesis: SynthesisSettings,
}

impl ResolvedConfig {
    /// Defaults rooted at `home`
    pub fn with_home(home: PathBuf) -> Self {
        Self {
            home,
            config_file: None,
            ledger: LedgerSettings::default(),
            reconcile: ReconcileSettings::default(),
            escalation: EscalationSettings::default(),
            diffusion: DiffusionSettings::default(),
            budget: BudgetSettings::default(),
            synthesis: SynthesisSettings::default(),
        }
    }

    /// Directory holding one subdirectory per session ledger
    pub fn sessions_dir(&self) -> PathBuf {
        self.home.join("sessions")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".notewell").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".notewell");

    let config_file = find_config_file();

    let mut resolved = if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;

        let home = if let Ok(env_home) = std::env::var("NOTEWELL_HOME") {
            PathBuf::from(env_home)
        } else if let Some(ref home_path) = config.paths.home {
            let notewell_dir = config_path.parent().unwrap_or(Path::new("."));
            resolve_path(notewell_dir, home_path)
        } else {
            default_home.clone()
        };

        ResolvedConfig {
            home,
            config_file: None,
            ledger: config.ledger,
            reconcile: config.reconcile,
            escalation: config.escalation,
            diffusion: config.diffusion,
            budget: config.budget,
            synthesis: config.synthesis,
        }
    } else {
        let home = std::env::var("NOTEWELL_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_home.clone());

        ResolvedConfig::with_home(home)
    };

    resolved.config_file = config_file;
    Ok(resolved)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
