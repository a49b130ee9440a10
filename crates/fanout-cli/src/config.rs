use anyhow::{anyhow, Context, Result};
use fanout_core::ModelType;
use fanout_runner::{ExecutorConfig, RunnerConfig};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Pipeline file. Relative paths resolve against the file's directory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub store: StoreSection,
    pub inputs: InputsSection,
    pub executor: ExecutorSection,
    pub runner: RunnerSection,
    pub llm: LlmSection,
    #[serde(skip)]
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSection {
    pub prompted: PathBuf,
    pub results: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            prompted: PathBuf::from("store/prompted_solutions"),
            results: PathBuf::from("store/test_results"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputsSection {
    pub problems: Option<PathBuf>,
    pub prompts: Option<PathBuf>,
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorSection {
    pub max_workers: Option<usize>,
    pub result_batch_size: usize,
    pub drain_grace_secs: f64,
    pub parallel_read: bool,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        let defaults = ExecutorConfig::default();
        Self {
            max_workers: defaults.max_workers,
            result_batch_size: defaults.result_batch_size,
            drain_grace_secs: defaults.drain_grace.as_secs_f64(),
            parallel_read: defaults.parallel_read,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerSection {
    pub interpreter: Vec<String>,
    pub timeout_secs: f64,
}

impl Default for RunnerSection {
    fn default() -> Self {
        let defaults = RunnerConfig::default();
        Self {
            interpreter: defaults.interpreter,
            timeout_secs: defaults.timeout.as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[default]
    Openai,
    Mock,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmSection {
    pub provider: LlmProvider,
    pub key_file: Option<PathBuf>,
    pub mock_response: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Overrides {
    pub batch_size: Option<usize>,
    pub max_workers: Option<usize>,
    pub dry_run: bool,
}

fn seconds(value: f64, field: &str) -> Result<Duration> {
    if !value.is_finite() || value <= 0.0 {
        return Err(anyhow!("{} must be a positive number of seconds", field));
    }
    Ok(Duration::from_secs_f64(value))
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline file {}", path.display()))?;
        let mut config: PipelineConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid pipeline file {}", path.display()))?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(config)
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn prompted_dir(&self) -> PathBuf {
        self.resolve(&self.store.prompted)
    }

    pub fn results_dir(&self) -> PathBuf {
        self.resolve(&self.store.results)
    }

    pub fn problems_path(&self) -> Result<PathBuf> {
        self.inputs
            .problems
            .as_deref()
            .map(|p| self.resolve(p))
            .ok_or_else(|| anyhow!("inputs.problems is required"))
    }

    pub fn prompts_path(&self) -> Result<PathBuf> {
        self.inputs
            .prompts
            .as_deref()
            .map(|p| self.resolve(p))
            .ok_or_else(|| anyhow!("inputs.prompts is required"))
    }

    /// Defaults to the single default model when none are listed.
    pub fn models(&self) -> Result<Vec<ModelType>> {
        if self.inputs.models.is_empty() {
            return Ok(vec![ModelType::DEFAULT]);
        }
        self.inputs
            .models
            .iter()
            .map(|m| ModelType::parse(m).map_err(anyhow::Error::from))
            .collect()
    }

    pub fn key_file(&self) -> Option<PathBuf> {
        self.llm.key_file.as_deref().map(|p| self.resolve(p))
    }

    pub fn executor_config(&self, overrides: Overrides) -> Result<ExecutorConfig> {
        Ok(ExecutorConfig {
            max_workers: overrides.max_workers.or(self.executor.max_workers),
            result_batch_size: overrides
                .batch_size
                .unwrap_or(self.executor.result_batch_size),
            dry_run: overrides.dry_run,
            drain_grace: seconds(self.executor.drain_grace_secs, "executor.drain_grace_secs")?,
            parallel_read: self.executor.parallel_read,
            ..ExecutorConfig::default()
        })
    }

    pub fn runner_config(&self) -> Result<RunnerConfig> {
        if self.runner.interpreter.is_empty() {
            return Err(anyhow!("runner.interpreter cannot be empty"));
        }
        Ok(RunnerConfig {
            interpreter: self.runner.interpreter.clone(),
            timeout: seconds(self.runner.timeout_secs, "runner.timeout_secs")?,
        })
    }
}
