use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{FanoutError, Result};
use crate::record::{ContentAddressedRecord, KeyedRecord, WorkKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Language {
    #[default]
    UnknownLanguage,
    Python,
    Cpp,
    Python3,
    Java,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Difficulty {
    #[default]
    UnknownDifficulty,
    Easy,
    Medium,
    Hard,
    Harder,
    Hardest,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModelType {
    #[serde(rename = "MODEL_TYPE_GPT_3_5_TURBO")]
    Gpt35Turbo,
    #[serde(rename = "MODEL_TYPE_GPT_4_TURBO")]
    Gpt4Turbo,
}

impl ModelType {
    pub const DEFAULT: ModelType = ModelType::Gpt35Turbo;

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Gpt35Turbo => "MODEL_TYPE_GPT_3_5_TURBO",
            ModelType::Gpt4Turbo => "MODEL_TYPE_GPT_4_TURBO",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "MODEL_TYPE_GPT_3_5_TURBO" | "gpt-3.5-turbo" => Ok(ModelType::Gpt35Turbo),
            "MODEL_TYPE_GPT_4_TURBO" | "gpt-4-turbo" => Ok(ModelType::Gpt4Turbo),
            other => Err(FanoutError::configuration(format!(
                "unknown model type: {}",
                other
            ))),
        }
    }
}

impl Default for ModelType {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub output: String,
}

impl ContentAddressedRecord for TestCase {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Solution {
    pub solution: String,
    #[serde(default)]
    pub language: Language,
}

impl ContentAddressedRecord for Solution {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContestProblem {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default)]
    pub time_limit_nsec: i64,
    #[serde(default)]
    pub memory_limit_bytes: i64,
    #[serde(default)]
    pub public_tests: Vec<TestCase>,
    #[serde(default)]
    pub private_tests: Vec<TestCase>,
    #[serde(default)]
    pub generated_tests: Vec<TestCase>,
    #[serde(default)]
    pub solutions: Vec<Solution>,
    #[serde(default)]
    pub incorrect_solutions: Vec<Solution>,
    #[serde(default)]
    pub cf_points: f64,
    #[serde(default)]
    pub cf_rating: i64,
}

impl ContestProblem {
    pub const DEFAULT_TIME_LIMIT_SEC: u64 = 10;

    /// Public followed by private tests. Generated tests are not part of scoring.
    pub fn tests(&self) -> Vec<TestCase> {
        self.public_tests
            .iter()
            .chain(self.private_tests.iter())
            .cloned()
            .collect()
    }

    pub fn time_limit_sec(&self) -> f64 {
        self.time_limit_nsec as f64 / 1e9
    }
}

impl ContentAddressedRecord for ContestProblem {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub prompt_name: String,
    pub unformatted_prompt: String,
}

impl PromptTemplate {
    /// Substitutes `{name}` placeholders; `{{` and `}}` render literal braces.
    /// A placeholder with no matching variable and an unpaired `}` are both errors.
    pub fn format(&self, vars: &[(&str, &str)]) -> Result<String> {
        let text = &self.unformatted_prompt;
        let mut out = String::with_capacity(text.len());
        let mut chars = text.char_indices().peekable();
        while let Some((idx, ch)) = chars.next() {
            match ch {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    out.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    out.push('}');
                }
                '}' => {
                    return Err(FanoutError::configuration(format!(
                        "prompt '{}' has an unmatched '}}'",
                        self.prompt_name
                    )));
                }
                '{' => {
                    let rest = &text[idx + 1..];
                    let end = rest.find('}').ok_or_else(|| {
                        FanoutError::configuration(format!(
                            "prompt '{}' has an unclosed placeholder",
                            self.prompt_name
                        ))
                    })?;
                    let name = &rest[..end];
                    let value = vars
                        .iter()
                        .find(|(key, _)| *key == name)
                        .map(|(_, value)| *value)
                        .ok_or_else(|| {
                            FanoutError::configuration(format!(
                                "prompt '{}' references unknown placeholder '{}'",
                                self.prompt_name, name
                            ))
                        })?;
                    out.push_str(value);
                    for _ in 0..name.chars().count() + 1 {
                        chars.next();
                    }
                }
                other => out.push(other),
            }
        }
        Ok(out)
    }
}

impl ContentAddressedRecord for PromptTemplate {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptedSolution {
    pub solution_id: String,
    pub problem_id: String,
    pub prompt_id: String,
    pub model: ModelType,
    pub patched_solution: String,
    #[serde(default)]
    pub patched_response: BTreeMap<String, String>,
    /// Empty on success; the captured error text when the model call failed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl PromptedSolution {
    pub fn is_failure(&self) -> bool {
        !self.error.is_empty()
    }
}

impl ContentAddressedRecord for PromptedSolution {}

impl KeyedRecord for PromptedSolution {
    fn work_key(&self) -> WorkKey {
        WorkKey::new([
            self.problem_id.as_str(),
            self.solution_id.as_str(),
            self.model.as_str(),
            self.prompt_id.as_str(),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_id: String,
    pub problem_id: String,
    pub solution_id: String,
    pub solution_output: String,
    pub exception_info: String,
    #[serde(default)]
    pub expected_output: String,
}

pub const TIMEOUT_PREFIX: &str = "timeout:";
pub const LAUNCH_FAILED_PREFIX: &str = "launch_failed:";

impl TestResult {
    /// Exact string comparison, trailing whitespace included.
    pub fn is_correct(&self) -> bool {
        self.solution_output == self.expected_output
    }

    pub fn timed_out(&self) -> bool {
        self.exception_info.starts_with(TIMEOUT_PREFIX)
    }
}

impl ContentAddressedRecord for TestResult {}

impl KeyedRecord for TestResult {
    fn work_key(&self) -> WorkKey {
        WorkKey::new([
            self.problem_id.as_str(),
            self.solution_id.as_str(),
            self.test_id.as_str(),
        ])
    }
}
