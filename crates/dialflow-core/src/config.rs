use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DialflowError, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub traversal: TraversalConfig,
    #[serde(default)]
    pub path_policy: PathPolicyConfig,
    #[serde(default)]
    pub lanes: LaneConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraversalConfig {
    /// Upper bound on nodes advanced through automatically in one turn.
    #[serde(default = "default_max_auto_steps")]
    pub max_auto_steps: usize,
    /// Proposals with lower extractor confidence are ignored.
    #[serde(default)]
    pub min_confidence: f32,
    /// Clarification used when a question has no validation-error edge.
    #[serde(default = "default_retry_prompt")]
    pub retry_prompt: String,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            max_auto_steps: default_max_auto_steps(),
            min_confidence: 0.0,
            retry_prompt: default_retry_prompt(),
        }
    }
}

fn default_max_auto_steps() -> usize { 64 }
fn default_retry_prompt() -> String {
    "Sorry, I couldn't use that answer. Could you try again?".to_string()
}

/// Vote/hysteresis parameters for choosing among candidate paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathPolicyConfig {
    /// Votes the active path needs before it locks.
    #[serde(default = "default_lock_threshold")]
    pub lock_threshold: f64,
    /// Multiplier applied to non-winning votes on every observed turn.
    #[serde(default = "default_decay")]
    pub decay: f64,
    /// Extra votes required per tentative switch while unlocked.
    #[serde(default = "default_switch_penalty")]
    pub switch_penalty: f64,
}

impl Default for PathPolicyConfig {
    fn default() -> Self {
        Self {
            lock_threshold: default_lock_threshold(),
            decay: default_decay(),
            switch_penalty: default_switch_penalty(),
        }
    }
}

fn default_lock_threshold() -> f64 { 2.0 }
fn default_decay() -> f64 { 0.5 }
fn default_switch_penalty() -> f64 { 1.0 }

/// Per-thread turn queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneConfig {
    #[serde(default = "default_lane_buffer")]
    pub buffer: usize,
    /// A lane with no queued work for this long is retired.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Compiled graphs kept in memory before the cache is emptied.
    #[serde(default = "default_graph_cache")]
    pub graph_cache: usize,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            buffer: default_lane_buffer(),
            idle_timeout_ms: default_idle_timeout_ms(),
            graph_cache: default_graph_cache(),
        }
    }
}

fn default_lane_buffer() -> usize { 32 }
fn default_idle_timeout_ms() -> u64 { 300_000 }
fn default_graph_cache() -> usize { 256 }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    /// Database file for the sqlite backend.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_store_path(),
        }
    }
}

fn default_backend() -> StoreBackend { StoreBackend::Memory }
fn default_store_path() -> String { "~/.dialflow/dialflow.db".to_string() }

impl StoreConfig {
    /// Resolve the database path (expand ~).
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(rest) = self.path.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing` env-filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String { "dialflow=info,warn".to_string() }

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| DialflowError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| DialflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let policy = &self.path_policy;
        if policy.lock_threshold <= 0.0 {
            return Err(DialflowError::Config(
                "path_policy.lock_threshold must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&policy.decay) {
            return Err(DialflowError::Config(
                "path_policy.decay must be within 0.0..=1.0".into(),
            ));
        }
        if policy.switch_penalty < 0.0 {
            return Err(DialflowError::Config(
                "path_policy.switch_penalty must not be negative".into(),
            ));
        }
        if self.traversal.max_auto_steps == 0 {
            return Err(DialflowError::Config(
                "traversal.max_auto_steps must be at least 1".into(),
            ));
        }
        if self.lanes.buffer == 0 {
            return Err(DialflowError::Config("lanes.buffer must be at least 1".into()));
        }
        if self.lanes.idle_timeout_ms == 0 {
            return Err(DialflowError::Config(
                "lanes.idle_timeout_ms must be at least 1".into(),
            ));
        }
        if self.lanes.graph_cache == 0 {
            return Err(DialflowError::Config("lanes.graph_cache must be at least 1".into()));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
