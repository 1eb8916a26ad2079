use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    pub sandbox: SandboxConfig,
    pub symbolic: SymbolicConfig,
    pub detector: DetectorConfig,
    pub restore: StrategyConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Isolated contexts allowed to run at the same time
    pub max_concurrency: usize,

    /// Added to the request timeout before the worker is abandoned
    pub grace_ms: u64,

    pub default_timeout_ms: u64,
    pub default_memory_limit_mb: u64,

    /// Requests with larger code are rejected before a worker is spawned
    pub max_code_bytes: usize,

    /// Per-loop iteration budget granted for every millisecond of timeout
    pub loop_iterations_per_ms: u64,

    pub recursion_limit: usize,
    pub worker_stack_bytes: usize,

    pub isolation: Isolation,

    /// Worker executable for process isolation. When unset, a
    /// `js-vmp-sandbox` binary next to the current executable is used.
    pub worker_program: Option<PathBuf>,
}

/// Where a realm runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// A child process when the worker program can be found, else a thread
    #[default]
    Auto,
    /// A child process that is killed at the hard deadline
    Process,
    /// A thread in this process; abandoned, not stopped, at the hard deadline
    Thread,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            grace_ms: 2_000,
            default_timeout_ms: 5_000,
            default_memory_limit_mb: 128,
            max_code_bytes: 1024 * 1024,
            loop_iterations_per_ms: 10_000,
            recursion_limit: 256,
            worker_stack_bytes: 8 * 1024 * 1024,
            isolation: Isolation::Auto,
            worker_program: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SymbolicConfig {
    pub max_steps: usize,
    pub timeout_ms: u64,
    /// Executed instructions rendered by the logic listing
    pub logic_preview_lines: usize,
}

impl Default for SymbolicConfig {
    fn default() -> Self {
        Self { max_steps: 1_000, timeout_ms: 5_000, logic_preview_lines: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub min_switch_cases: usize,
    pub min_array_elements: usize,
    pub max_counter_name_len: usize,
    pub high_complexity: usize,
    pub medium_complexity: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_switch_cases: 10,
            min_array_elements: 50,
            max_counter_name_len: 3,
            high_complexity: 100,
            medium_complexity: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// jsfuck/jjencode inputs above this size are refused
    pub encoded_size_limit: usize,
    pub assistant_confidence: f64,
    pub max_prompt_chars: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self { encoded_size_limit: 100 * 1024, assistant_confidence: 0.6, max_prompt_chars: 4_000 }
    }
}

impl RestoreConfig {
    pub fn from_toml(toml: &str) -> Result<Self, String> {
        toml::from_str(toml).map_err(|e| format!("Failed to parse TOML: {}", e))
    }

    pub fn from_json(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| format!("Failed to parse JSON: {}", e))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        serde_yaml::from_str(yaml).map_err(|e| format!("Failed to parse YAML: {}", e))
    }

    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize to JSON: {}", e))
    }

    pub fn to_yaml(&self) -> Result<String, String> {
        serde_yaml::to_string(self).map_err(|e| format!("Failed to serialize to YAML: {}", e))
    }
}
