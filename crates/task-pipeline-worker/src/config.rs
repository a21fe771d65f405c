use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use task_pipeline_core::{PipelineError, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of worker threads (and sinks)
    pub worker_count: usize,
    /// Attempts per task before it is quarantined
    pub attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Log progress every N processed tasks per worker; 0 disables
    pub progress_log_interval: usize,
    /// Directory holding one result file per worker
    pub output_dir: PathBuf,
    /// NDJSON file that quarantined tasks are appended to
    pub quarantine_report: Option<PathBuf>,
    pub thread_name_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            worker_count: 5,
            attempts: 3,
            base_delay_ms: 100,
            backoff_multiplier: 2.0,
            progress_log_interval: 100,
            output_dir: PathBuf::from("output/http-requests"),
            quarantine_report: None,
            thread_name_prefix: "tp-worker".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.worker_count == 0 {
            return Err(PipelineError::config("worker_count must be > 0"));
        }
        if self.worker_count > 1024 {
            return Err(PipelineError::config("worker_count too large (max 1024)"));
        }
        self.retry_policy()?;
        Ok(())
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, PipelineError> {
        RetryPolicy::new(self.attempts, self.base_delay(), self.backoff_multiplier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_count, 5);
        assert_eq!(config.retry_policy().unwrap().attempts(), 3);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.worker_count = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.attempts = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.backoff_multiplier = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_with_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "worker_count: 2").unwrap();
        writeln!(file, "base_delay_ms: 5").unwrap();
        writeln!(file, "quarantine_report: /tmp/quarantine.ndjson").unwrap();

        let config = PipelineConfig::from_file(file.path().to_str().unwrap()).unwrap();

        assert_eq!(config.worker_count, 2);
        assert_eq!(config.base_delay(), Duration::from_millis(5));
        assert_eq!(
            config.quarantine_report,
            Some(PathBuf::from("/tmp/quarantine.ndjson"))
        );
        // Unspecified fields fall back to defaults
        assert_eq!(config.attempts, 3);
        assert_eq!(config.progress_log_interval, 100);
    }
}
