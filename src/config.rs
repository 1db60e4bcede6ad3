//! Configuration for mend
//!
//! Knobs live in `.mend/config.json` inside the project, with a user-level
//! fallback at ~/.config/mend/config.json. Every field has a default so an
//! absent file is fine.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the project-local data directory.
pub const DATA_DIR: &str = ".mend";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Minimum confidence score for a stored patch to be nominated for
    /// re-application (inclusive).
    #[serde(default = "default_apply_threshold")]
    pub apply_threshold: f64,
    /// Minimum confidence score to reattempt a signature after a failure.
    #[serde(default = "default_retry_threshold")]
    pub retry_threshold: f64,
    /// Patch attempts allowed per error signature before manual review.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Alternate-order retries of previously failed patches at the rollback layer.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Full run-tests/triage/fix rounds per session.
    #[serde(default = "default_session_max_retries")]
    pub session_max_retries: u32,
    /// Re-prompt attempts against the oracle chain, each with a refinement hint.
    #[serde(default = "default_oracle_prompt_retries")]
    pub oracle_prompt_retries: u32,
    /// Oracle patches scoring below this are rejected without applying.
    #[serde(default = "default_validation_min_score")]
    pub validation_min_score: f64,
    /// Wall-clock budget for one test-executor invocation, in seconds.
    #[serde(default = "default_executor_timeout_secs")]
    pub executor_timeout_secs: u64,
    /// Seed for confidence jitter and the oracle validation draw. Set for
    /// deterministic runs; unset draws from OS entropy.
    #[serde(default)]
    pub jitter_seed: Option<u64>,
    /// Primary oracle model id.
    #[serde(default = "default_primary_model")]
    pub oracle_primary_model: String,
    /// Secondary (fallback) oracle model id.
    #[serde(default = "default_secondary_model")]
    pub oracle_secondary_model: String,
}

fn default_apply_threshold() -> f64 {
    0.75
}

fn default_retry_threshold() -> f64 {
    0.20
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_session_max_retries() -> u32 {
    3
}

fn default_oracle_prompt_retries() -> u32 {
    3
}

fn default_validation_min_score() -> f64 {
    0.75
}

fn default_executor_timeout_secs() -> u64 {
    300
}

fn default_primary_model() -> String {
    "mistralai/mistral-large".to_string()
}

fn default_secondary_model() -> String {
    "deepseek/deepseek-chat".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            apply_threshold: default_apply_threshold(),
            retry_threshold: default_retry_threshold(),
            max_attempts: default_max_attempts(),
            max_retries: default_max_retries(),
            session_max_retries: default_session_max_retries(),
            oracle_prompt_retries: default_oracle_prompt_retries(),
            validation_min_score: default_validation_min_score(),
            executor_timeout_secs: default_executor_timeout_secs(),
            jitter_seed: None,
            oracle_primary_model: default_primary_model(),
            oracle_secondary_model: default_secondary_model(),
        }
    }
}

impl Config {
    /// Load configuration for a project, falling back to the user-level file
    /// and then to defaults. A corrupt file is preserved next to itself and
    /// defaults are loaded.
    pub fn load(project_root: &Path) -> Self {
        let candidates = [
            Some(data_dir(project_root).join("config.json")),
            user_config_path(),
        ];
        for path in candidates.into_iter().flatten() {
            if let Ok(content) = fs::read_to_string(&path) {
                match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(err) => {
                        preserve_corrupt(&path, &content);
                        tracing::warn!(
                            "config file {} was corrupted ({}); a backup was saved and defaults loaded",
                            path.display(),
                            err
                        );
                    }
                }
            }
        }
        Self::default()
    }
}

/// The project-local data directory holding all persistent state.
pub fn data_dir(project_root: &Path) -> PathBuf {
    project_root.join(DATA_DIR)
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("mend").join("config.json"))
}

fn preserve_corrupt(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.apply_threshold, 0.75);
        assert_eq!(config.retry_threshold, 0.20);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.session_max_retries, 3);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load(tmp.path());
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let tmp = TempDir::new().unwrap();
        let dir = data_dir(tmp.path());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config.json"), r#"{"max_attempts": 5}"#).unwrap();
        let config = Config::load(tmp.path());
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.apply_threshold, 0.75);
    }

    #[test]
    fn test_corrupt_file_is_preserved_and_defaults_load() {
        let tmp = TempDir::new().unwrap();
        let dir = data_dir(tmp.path());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config.json"), "{not json").unwrap();
        let config = Config::load(tmp.path());
        assert_eq!(config.max_attempts, 3);
        assert!(dir.join("config.json.corrupt").exists());
    }
}
