//! Configuration loading and validation.
//!
//! All tunables live in one injected [`LoopConfig`]: storage locations,
//! the analysis window, refinement thresholds, and verifier commands
//! with their timeouts. There is no ambient global state; every
//! component receives the parts of the config it needs at construction.
//!
//! Configuration is read from `learnloop.toml` in the project root when
//! present, otherwise defaults apply.

use crate::error::{LoopError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config filename looked up in the project root.
pub const CONFIG_FILENAME: &str = "learnloop.toml";

/// Default state directory, relative to the project root.
pub const DEFAULT_STATE_DIR: &str = ".learnloop";

/// Default prompts directory, relative to the project root.
pub const DEFAULT_PROMPTS_DIR: &str = "prompts";

/// Top-level configuration for the learning loop.
///
/// # Example
///
/// ```
/// use learnloop::config::LoopConfig;
///
/// let config = LoopConfig::default();
/// assert_eq!(config.analysis.interaction_limit, 100);
/// assert_eq!(config.verification.build_timeout_secs, 300);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Directory holding prompt documents (`<id>.json`).
    #[serde(default = "default_prompts_dir")]
    pub prompts_dir: PathBuf,

    /// Directory holding ledgers and aggregates.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Performance analysis settings.
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Prompt refinement settings.
    #[serde(default)]
    pub refinement: RefinementConfig,

    /// Build/test verification settings.
    #[serde(default)]
    pub verification: VerificationConfig,
}

fn default_prompts_dir() -> PathBuf {
    PathBuf::from(DEFAULT_PROMPTS_DIR)
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            prompts_dir: default_prompts_dir(),
            state_dir: default_state_dir(),
            analysis: AnalysisConfig::default(),
            refinement: RefinementConfig::default(),
            verification: VerificationConfig::default(),
        }
    }
}

/// Settings for the performance analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Maximum interactions considered per analysis, most recent first.
    /// Older interactions are excluded from the window, not deleted.
    #[serde(default = "default_interaction_limit")]
    pub interaction_limit: usize,

    /// Success rate below which a prompt is flagged as underperforming.
    #[serde(default = "default_low_success")]
    pub low_success_threshold: f64,

    /// Mean `response_time` metric above which a prompt is flagged slow.
    #[serde(default = "default_slow_response")]
    pub slow_response_threshold: f64,

    /// Failure fraction above which a prompt is flagged failure-heavy.
    #[serde(default = "default_failure_ratio")]
    pub failure_ratio_threshold: f64,
}

fn default_interaction_limit() -> usize {
    100
}

fn default_low_success() -> f64 {
    0.7
}

fn default_slow_response() -> f64 {
    5.0
}

fn default_failure_ratio() -> f64 {
    0.3
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            interaction_limit: default_interaction_limit(),
            low_success_threshold: default_low_success(),
            slow_response_threshold: default_slow_response(),
            failure_ratio_threshold: default_failure_ratio(),
        }
    }
}

/// Settings controlling when and how prompts are refined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementConfig {
    /// Recording triggers analysis when the per-prompt interaction count
    /// is an exact multiple of this value.
    #[serde(default = "default_analyze_every")]
    pub analyze_every: u64,

    /// Minimum interactions before refinement is considered; below this
    /// the analysis is treated as too thin to act on.
    #[serde(default = "default_min_interactions")]
    pub min_interactions: u64,

    /// Refinement runs when the success rate falls below this value
    /// (or when any improvement opportunity is present).
    #[serde(default = "default_refine_below")]
    pub refine_below: f64,
}

fn default_analyze_every() -> u64 {
    10
}

fn default_min_interactions() -> u64 {
    5
}

fn default_refine_below() -> f64 {
    0.8
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            analyze_every: default_analyze_every(),
            min_interactions: default_min_interactions(),
            refine_below: default_refine_below(),
        }
    }
}

/// Settings for post-apply build/test verification.
///
/// An empty command list disables that stage (it always passes); a
/// timeout is treated as a verification failure, never a hang.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Build command, argv style. Empty disables the build stage.
    #[serde(default = "default_build_command")]
    pub build_command: Vec<String>,

    /// Test command, argv style. Empty disables the test stage.
    #[serde(default = "default_test_command")]
    pub test_command: Vec<String>,

    /// Timeout for the build verifier in seconds.
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    /// Timeout for the test verifier in seconds.
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,
}

fn default_build_command() -> Vec<String> {
    vec!["cargo".into(), "build".into()]
}

fn default_test_command() -> Vec<String> {
    vec!["cargo".into(), "test".into()]
}

fn default_build_timeout() -> u64 {
    300
}

fn default_test_timeout() -> u64 {
    600
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            build_command: default_build_command(),
            test_command: default_test_command(),
            build_timeout_secs: default_build_timeout(),
            test_timeout_secs: default_test_timeout(),
        }
    }
}

impl LoopConfig {
    /// Load configuration from a project directory.
    ///
    /// Reads `learnloop.toml` when present, otherwise returns defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(CONFIG_FILENAME);

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|e| LoopError::Config {
            message: format!("failed to read {}: {}", path.display(), e),
            path: Some(path.clone()),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| LoopError::Config {
            message: format!("failed to parse {}: {}", path.display(), e),
            path: Some(path),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate threshold and timeout values.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.analysis.interaction_limit == 0 {
            return Err(LoopError::InvalidConfig {
                field: "analysis.interaction_limit".into(),
                reason: "must be greater than zero".into(),
            });
        }
        for (field, value) in [
            (
                "analysis.low_success_threshold",
                self.analysis.low_success_threshold,
            ),
            (
                "analysis.failure_ratio_threshold",
                self.analysis.failure_ratio_threshold,
            ),
            ("refinement.refine_below", self.refinement.refine_below),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(LoopError::InvalidConfig {
                    field: field.into(),
                    reason: format!("{value} is outside [0.0, 1.0]"),
                });
            }
        }
        if self.refinement.analyze_every == 0 {
            return Err(LoopError::InvalidConfig {
                field: "refinement.analyze_every".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if self.verification.build_timeout_secs == 0 || self.verification.test_timeout_secs == 0 {
            return Err(LoopError::InvalidConfig {
                field: "verification.*_timeout_secs".into(),
                reason: "timeouts must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Resolve the state directory against a project root.
    pub fn state_dir_in(&self, project_dir: &Path) -> PathBuf {
        if self.state_dir.is_absolute() {
            self.state_dir.clone()
        } else {
            project_dir.join(&self.state_dir)
        }
    }

    /// Resolve the prompts directory against a project root.
    pub fn prompts_dir_in(&self, project_dir: &Path) -> PathBuf {
        if self.prompts_dir.is_absolute() {
            self.prompts_dir.clone()
        } else {
            project_dir.join(&self.prompts_dir)
        }
    }
}
