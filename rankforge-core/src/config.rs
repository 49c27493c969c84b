//! Engine configuration for Rankforge.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from the user config directory (`config.toml`) and/or
//! `.rankforge/config.toml` in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Training loop cadence and hardening.
    #[serde(default)]
    pub training: TrainingSettings,
    /// Rank control and factorization refinement.
    #[serde(default)]
    pub decomposition: DecompositionSettings,
    /// Session and checkpoint storage.
    #[serde(default)]
    pub storage: StorageSettings,
    /// Buffer allocation limits.
    #[serde(default)]
    pub resources: ResourceSettings,
}

impl EngineConfig {
    /// Collect validation problems across all sections.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = self.training.validate();
        problems.extend(self.decomposition.validate());
        problems
    }
}

/// Training loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// Emit progress every K batches.
    #[serde(default = "default_progress_interval")]
    pub progress_interval_steps: usize,
    /// Persist progress/metrics snapshots every N steps.
    #[serde(default = "default_persist_interval")]
    pub persist_interval_steps: usize,
    /// Run `maybe_adjust_structure` every N epochs.
    #[serde(default = "default_structure_interval")]
    pub structure_interval_epochs: usize,
    /// Inspect Q/R norms every N steps.
    #[serde(default = "default_rank_hook_interval")]
    pub rank_hook_interval_steps: usize,
    /// Optional wall-clock deadline for a single run, in seconds.
    #[serde(default)]
    pub max_run_secs: Option<u64>,
    /// Record a checkpoint automatically when a run pauses.
    #[serde(default = "default_true")]
    pub pause_checkpoint: bool,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            progress_interval_steps: default_progress_interval(),
            persist_interval_steps: default_persist_interval(),
            structure_interval_epochs: default_structure_interval(),
            rank_hook_interval_steps: default_rank_hook_interval(),
            max_run_secs: None,
            pause_checkpoint: true,
        }
    }
}

impl TrainingSettings {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.progress_interval_steps == 0 {
            problems.push("training.progress_interval_steps must be at least 1".into());
        }
        if self.persist_interval_steps == 0 {
            problems.push("training.persist_interval_steps must be at least 1".into());
        }
        if self.structure_interval_epochs == 0 {
            problems.push("training.structure_interval_epochs must be at least 1".into());
        }
        if self.rank_hook_interval_steps == 0 {
            problems.push("training.rank_hook_interval_steps must be at least 1".into());
        }
        if self.max_run_secs == Some(0) {
            problems.push("training.max_run_secs must be positive when set".into());
        }
        problems
    }
}

fn default_progress_interval() -> usize {
    10
}

fn default_persist_interval() -> usize {
    10
}

fn default_structure_interval() -> usize {
    5
}

fn default_rank_hook_interval() -> usize {
    100
}

fn default_true() -> bool {
    true
}

/// Rank control and low-rank refinement settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompositionSettings {
    #[serde(default = "default_min_rank")]
    pub min_rank: usize,
    #[serde(default = "default_max_rank")]
    pub max_rank: usize,
    /// Direction norm below which the rank shrinks.
    #[serde(default = "default_shrink_threshold")]
    pub shrink_threshold: f32,
    /// Direction norm above which the rank grows.
    #[serde(default = "default_grow_threshold")]
    pub grow_threshold: f32,
    /// Gradient-descent iterations when fitting Q/R to a quantized matrix.
    #[serde(default = "default_refine_iterations")]
    pub refine_iterations: usize,
    #[serde(default = "default_refine_learning_rate")]
    pub refine_learning_rate: f32,
    /// Q/R norm below which a layer is flagged as a rank-reduction candidate.
    #[serde(default = "default_candidate_threshold")]
    pub candidate_norm_threshold: f32,
    /// Half-width of the uniform distribution used for factor initialization.
    #[serde(default = "default_init_scale")]
    pub init_scale: f32,
}

impl Default for DecompositionSettings {
    fn default() -> Self {
        Self {
            min_rank: default_min_rank(),
            max_rank: default_max_rank(),
            shrink_threshold: default_shrink_threshold(),
            grow_threshold: default_grow_threshold(),
            refine_iterations: default_refine_iterations(),
            refine_learning_rate: default_refine_learning_rate(),
            candidate_norm_threshold: default_candidate_threshold(),
            init_scale: default_init_scale(),
        }
    }
}

impl DecompositionSettings {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.min_rank == 0 || self.min_rank > self.max_rank {
            problems.push(format!(
                "decomposition rank bounds invalid: min_rank={} max_rank={}",
                self.min_rank, self.max_rank
            ));
        }
        if self.shrink_threshold >= self.grow_threshold {
            problems.push("decomposition.shrink_threshold must be below grow_threshold".into());
        }
        if self.refine_learning_rate <= 0.0 {
            problems.push("decomposition.refine_learning_rate must be positive".into());
        }
        if self.init_scale <= 0.0 {
            problems.push("decomposition.init_scale must be positive".into());
        }
        problems
    }

    /// Clamp a rank into the configured bounds.
    pub fn clamp_rank(&self, rank: usize) -> usize {
        rank.max(self.min_rank).min(self.max_rank)
    }
}

fn default_min_rank() -> usize {
    1
}

fn default_max_rank() -> usize {
    64
}

fn default_shrink_threshold() -> f32 {
    0.01
}

fn default_grow_threshold() -> f32 {
    0.1
}

fn default_refine_iterations() -> usize {
    10
}

fn default_refine_learning_rate() -> f32 {
    0.01
}

fn default_candidate_threshold() -> f32 {
    0.05
}

fn default_init_scale() -> f32 {
    0.01
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory holding session and checkpoint documents.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".rankforge/data")
}

/// Resource limits for adapter buffers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSettings {
    /// Ceiling on live tracked buffer bytes per adapter. Unlimited when unset.
    #[serde(default)]
    pub max_buffer_bytes: Option<usize>,
}

/// Load configuration with layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `RANKFORGE_`)
/// 3. Workspace-local config (`.rankforge/config.toml`)
/// 4. User config (`config.toml` in the platform config directory)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&EngineConfig>,
) -> Result<EngineConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "rankforge", "rankforge") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".rankforge").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // RANKFORGE_TRAINING__PROGRESS_INTERVAL_STEPS, RANKFORGE_STORAGE__DATA_DIR, ...
    figment = figment.merge(Env::prefixed("RANKFORGE_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}
