use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub judge: JudgeSettings,
    #[serde(default)]
    pub dod: DodSettings,
    #[serde(default)]
    pub auto_approve_destructive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_model() -> String {
    "qwen2.5-coder:32b".to_string()
}

fn default_api_key_env() -> String {
    "DROVER_API_KEY".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Sampling temperature for tool-calling turns. Low by default so that
    /// structured tool calls stay parseable.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    /// Diagnostic override: force tool support on or off regardless of what
    /// the provider advertises.
    #[serde(default)]
    pub supports_tools: Option<bool>,
    /// Adds extended-reasoning instructions to role prompts. Prompt text
    /// only; the wire protocol is unchanged.
    #[serde(default)]
    pub ultrathink: bool,
}

fn default_temperature() -> f32 {
    0.1
}

fn default_context_window() -> u32 {
    128_000
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            context_window: default_context_window(),
            supports_tools: None,
            ultrathink: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_max_steps_ceiling")]
    pub max_steps_ceiling: u32,
    #[serde(default = "default_max_consecutive_reads")]
    pub max_consecutive_reads: u32,
    #[serde(default = "default_max_file_read_count")]
    pub max_file_read_count: u32,
    #[serde(default = "default_max_failure_signature_repeats")]
    pub max_failure_signature_repeats: u32,
    #[serde(default = "default_max_prompt_improvements")]
    pub max_prompt_improvements: u32,
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
}

fn default_max_steps() -> u32 {
    10
}

fn default_max_steps_ceiling() -> u32 {
    50
}

fn default_max_consecutive_reads() -> u32 {
    5
}

fn default_max_file_read_count() -> u32 {
    2
}

fn default_max_failure_signature_repeats() -> u32 {
    3
}

fn default_max_prompt_improvements() -> u32 {
    3
}

fn default_max_recovery_attempts() -> u32 {
    2
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_steps_ceiling: default_max_steps_ceiling(),
            max_consecutive_reads: default_max_consecutive_reads(),
            max_file_read_count: default_max_file_read_count(),
            max_failure_signature_repeats: default_max_failure_signature_repeats(),
            max_prompt_improvements: default_max_prompt_improvements(),
            max_recovery_attempts: default_max_recovery_attempts(),
        }
    }
}

impl LimitSettings {
    /// `max_steps` clamped to the configured ceiling.
    pub fn effective_max_steps(&self) -> u32 {
        self.max_steps.min(self.max_steps_ceiling).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterMode {
    None,
    Full,
    Equal,
    Decorrelated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: JitterMode,
}

fn default_max_retries() -> u32 {
    8
}

fn default_base_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_jitter() -> JitterMode {
    JitterMode::Full
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_run_cmd_secs")]
    pub run_cmd_secs: u64,
    #[serde(default = "default_run_tests_secs")]
    pub run_tests_secs: u64,
}

fn default_run_cmd_secs() -> u64 {
    300
}

fn default_run_tests_secs() -> u64 {
    600
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            run_cmd_secs: default_run_cmd_secs(),
            run_tests_secs: default_run_tests_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeSettings {
    /// Confidence at or above which a gate approves outright.
    #[serde(default = "default_approve_threshold")]
    pub approve_threshold: f64,
    /// Confidence at or above which a gate asks for revision instead of
    /// rejecting.
    #[serde(default = "default_revise_threshold")]
    pub revise_threshold: f64,
    /// Consult the LLM for Socratic questioning on top of the deterministic
    /// heuristics. The heuristics run either way, so gates work offline.
    #[serde(default)]
    pub use_llm: bool,
}

fn default_approve_threshold() -> f64 {
    0.75
}

fn default_revise_threshold() -> f64 {
    0.4
}

impl Default for JudgeSettings {
    fn default() -> Self {
        Self {
            approve_threshold: default_approve_threshold(),
            revise_threshold: default_revise_threshold(),
            use_llm: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DodSource {
    #[default]
    Heuristic,
    Llm,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DodSettings {
    #[serde(default)]
    pub source: DodSource,
}

impl Config {
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("drover").join("config.toml"))
    }

    pub fn project_config_path(workspace_root: &Path) -> PathBuf {
        workspace_root.join(".drover").join("config.toml")
    }

    /// Load config layered user-then-project: project keys override user
    /// keys, both override built-in defaults. Missing files are fine.
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let mut merged = toml::Table::new();

        if let Some(user_path) = Self::user_config_path() {
            if user_path.exists() {
                let text = std::fs::read_to_string(&user_path)
                    .with_context(|| format!("reading {}", user_path.display()))?;
                let table: toml::Table = toml::from_str(&text)
                    .with_context(|| format!("parsing {}", user_path.display()))?;
                merge_tables(&mut merged, table);
            }
        }

        let project_path = Self::project_config_path(workspace_root);
        if project_path.exists() {
            let text = std::fs::read_to_string(&project_path)
                .with_context(|| format!("reading {}", project_path.display()))?;
            let table: toml::Table = toml::from_str(&text)
                .with_context(|| format!("parsing {}", project_path.display()))?;
            merge_tables(&mut merged, table);
        }

        let config: Config = toml::Value::Table(merged)
            .try_into()
            .context("deserializing merged config")?;
        tracing::debug!(?config, "config loaded");
        Ok(config)
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        if let toml::Value::Table(incoming) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge_tables(existing, incoming);
                continue;
            }
            base.insert(key, toml::Value::Table(incoming));
        } else {
            base.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_caps() {
        let config = Config::default();
        assert_eq!(config.limits.max_steps, 10);
        assert_eq!(config.limits.max_steps_ceiling, 50);
        assert_eq!(config.limits.max_consecutive_reads, 5);
        assert_eq!(config.limits.max_file_read_count, 2);
        assert_eq!(config.limits.max_failure_signature_repeats, 3);
        assert_eq!(config.retry.max_retries, 8);
        assert_eq!(config.retry.base_backoff_ms, 250);
        assert_eq!(config.retry.max_backoff_ms, 5000);
        assert_eq!(config.retry.jitter, JitterMode::Full);
        assert_eq!(config.timeouts.run_cmd_secs, 300);
        assert_eq!(config.timeouts.run_tests_secs, 600);
        assert!((config.llm.temperature - 0.1).abs() < f32::EPSILON);
    }

    #[test]
    fn effective_max_steps_respects_ceiling() {
        let mut limits = LimitSettings::default();
        limits.max_steps = 80;
        assert_eq!(limits.effective_max_steps(), 50);
        limits.max_steps = 0;
        assert_eq!(limits.effective_max_steps(), 1);
    }

    #[test]
    fn project_config_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let drover_dir = dir.path().join(".drover");
        std::fs::create_dir_all(&drover_dir).unwrap();
        std::fs::write(
            drover_dir.join("config.toml"),
            "[limits]\nmax_steps = 25\n\n[retry]\njitter = \"equal\"\n",
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.limits.max_steps, 25);
        assert_eq!(config.retry.jitter, JitterMode::Equal);
        // Untouched sections keep defaults.
        assert_eq!(config.limits.max_consecutive_reads, 5);
    }

    #[test]
    fn dod_source_defaults_to_heuristic() {
        let config = Config::default();
        assert_eq!(config.dod.source, DodSource::Heuristic);
    }

    #[test]
    fn merge_preserves_nested_keys() {
        let mut base: toml::Table = toml::from_str("[a]\nx = 1\ny = 2\n").unwrap();
        let overlay: toml::Table = toml::from_str("[a]\ny = 3\n").unwrap();
        merge_tables(&mut base, overlay);
        let a = base.get("a").unwrap().as_table().unwrap();
        assert_eq!(a.get("x").unwrap().as_integer(), Some(1));
        assert_eq!(a.get("y").unwrap().as_integer(), Some(3));
    }
}
