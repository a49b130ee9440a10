use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Context;
use fanout_core::{
    ContentAddressedRecord, ContestProblem, FanoutError, ModelType, PromptTemplate,
    PromptedSolution, Result, TestCase, TestResult, WorkKey,
};
use serde_json::Value;

use crate::executor::{ExecutorConfig, FanoutExecutor, FanoutRun, PoolKind, Worker};
use crate::isolated::IsolatedRunner;
use crate::llm::{ChatMessage, LlmHandler, ResponseFormat};
use crate::plan::WorkSpace;
use crate::store::ChunkStore;

pub const DESCRIPTION_VAR: &str = "function_description";
pub const SOLUTION_VAR: &str = "reference_solution";

/// Every incorrect solution of every problem, under every model and prompt.
#[derive(Debug, Clone, Default)]
pub struct GenerationSpace {
    pub problems: Vec<ContestProblem>,
    pub models: Vec<ModelType>,
    pub prompts: Vec<PromptTemplate>,
}

#[derive(Debug, Clone)]
pub struct GenerationInput {
    pub problem_id: String,
    pub solution_id: String,
    pub prompt_id: String,
    pub model: ModelType,
    pub description: String,
    pub solution: String,
    pub prompt: PromptTemplate,
}

impl WorkSpace for GenerationSpace {
    type Input = GenerationInput;
    type Output = PromptedSolution;

    fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(FanoutError::configuration("generation needs at least one model"));
        }
        if self.prompts.is_empty() {
            return Err(FanoutError::configuration("generation needs at least one prompt"));
        }
        for prompt in &self.prompts {
            prompt.format(&[(DESCRIPTION_VAR, ""), (SOLUTION_VAR, "")])?;
        }
        Ok(())
    }

    fn expected_len(&self) -> usize {
        let solutions: usize = self
            .problems
            .iter()
            .map(|p| p.incorrect_solutions.len())
            .sum();
        solutions * self.models.len() * self.prompts.len()
    }

    fn items(&self) -> Result<Vec<(WorkKey, GenerationInput)>> {
        let prompt_ids = self
            .prompts
            .iter()
            .map(|p| p.identity())
            .collect::<Result<Vec<_>>>()?;
        let mut out = Vec::with_capacity(self.expected_len());
        for problem in &self.problems {
            let problem_id = problem.identity()?;
            for model in &self.models {
                for (prompt, prompt_id) in self.prompts.iter().zip(&prompt_ids) {
                    for solution in &problem.incorrect_solutions {
                        let solution_id = solution.identity()?;
                        let key = WorkKey::new([
                            problem_id.as_str(),
                            solution_id.as_str(),
                            model.as_str(),
                            prompt_id.as_str(),
                        ]);
                        out.push((
                            key,
                            GenerationInput {
                                problem_id: problem_id.clone(),
                                solution_id,
                                prompt_id: prompt_id.clone(),
                                model: *model,
                                description: problem.description.clone(),
                                solution: solution.solution.clone(),
                                prompt: prompt.clone(),
                            },
                        ));
                    }
                }
            }
        }
        Ok(out)
    }
}

pub struct PromptWorker {
    llm: Arc<dyn LlmHandler>,
}

impl PromptWorker {
    pub fn new(llm: Arc<dyn LlmHandler>) -> Self {
        Self { llm }
    }

    fn record(input: &GenerationInput) -> PromptedSolution {
        PromptedSolution {
            solution_id: input.solution_id.clone(),
            problem_id: input.problem_id.clone(),
            prompt_id: input.prompt_id.clone(),
            model: input.model,
            patched_solution: String::new(),
            patched_response: BTreeMap::new(),
            error: String::new(),
        }
    }
}

/// Flattens a JSON object response into string fields; non-string values keep their
/// JSON text.
fn response_fields(response: &str) -> anyhow::Result<BTreeMap<String, String>> {
    let value: Value = serde_json::from_str(response).context("response is not JSON")?;
    let Value::Object(map) = value else {
        anyhow::bail!("response is not a JSON object");
    };
    Ok(map
        .into_iter()
        .map(|(k, v)| match v {
            Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect())
}

impl Worker for PromptWorker {
    type Input = GenerationInput;
    type Output = PromptedSolution;

    fn invoke(&self, _key: &WorkKey, input: &GenerationInput) -> anyhow::Result<PromptedSolution> {
        let system = input.prompt.format(&[
            (DESCRIPTION_VAR, input.description.as_str()),
            (SOLUTION_VAR, input.solution.as_str()),
        ])?;
        let messages = [ChatMessage::system(system), ChatMessage::user(input.solution.as_str())];
        let response = self
            .llm
            .chat_completion(&messages, input.model, ResponseFormat::JsonObject)?;
        let fields = response_fields(&response)?;
        let mut record = Self::record(input);
        record.patched_solution = fields.get("solution").cloned().unwrap_or_default();
        record.patched_response = fields;
        Ok(record)
    }

    fn failure(&self, _key: &WorkKey, input: &GenerationInput, error: String) -> PromptedSolution {
        let mut record = Self::record(input);
        record.error = error;
        record
    }
}

pub fn tests_by_problem(problems: &[ContestProblem]) -> Result<BTreeMap<String, Vec<TestCase>>> {
    problems
        .iter()
        .map(|p| -> Result<(String, Vec<TestCase>)> { Ok((p.identity()?, p.tests())) })
        .collect()
}

/// Every prompted solution against every test of its problem.
#[derive(Debug, Clone, Default)]
pub struct EvaluationSpace {
    pub solutions: Vec<PromptedSolution>,
    pub tests_by_problem: BTreeMap<String, Vec<TestCase>>,
}

#[derive(Debug, Clone)]
pub struct EvaluationInput {
    pub problem_id: String,
    pub solution_id: String,
    pub test_id: String,
    pub program: String,
    pub test: TestCase,
}

impl EvaluationSpace {
    fn tests_for(&self, problem_id: &str) -> Result<&[TestCase]> {
        self.tests_by_problem
            .get(problem_id)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                FanoutError::configuration(format!("no tests for problem {}", problem_id))
            })
    }
}

impl WorkSpace for EvaluationSpace {
    type Input = EvaluationInput;
    type Output = TestResult;

    fn validate(&self) -> Result<()> {
        let missing: BTreeSet<&str> = self
            .solutions
            .iter()
            .map(|s| s.problem_id.as_str())
            .filter(|id| !self.tests_by_problem.contains_key(*id))
            .collect();
        if !missing.is_empty() {
            return Err(FanoutError::configuration(format!(
                "solutions reference problems without tests: {}",
                missing.into_iter().collect::<Vec<_>>().join(", ")
            )));
        }
        Ok(())
    }

    fn expected_len(&self) -> usize {
        self.solutions
            .iter()
            .map(|s| self.tests_by_problem.get(&s.problem_id).map_or(0, Vec::len))
            .sum()
    }

    fn items(&self) -> Result<Vec<(WorkKey, EvaluationInput)>> {
        let mut out = Vec::with_capacity(self.expected_len());
        for solution in &self.solutions {
            let solution_id = solution.identity()?;
            for test in self.tests_for(&solution.problem_id)? {
                let test_id = test.identity()?;
                let key = WorkKey::new([
                    solution.problem_id.as_str(),
                    solution_id.as_str(),
                    test_id.as_str(),
                ]);
                out.push((
                    key,
                    EvaluationInput {
                        problem_id: solution.problem_id.clone(),
                        solution_id: solution_id.clone(),
                        test_id,
                        program: solution.patched_solution.clone(),
                        test: test.clone(),
                    },
                ));
            }
        }
        Ok(out)
    }
}

pub struct EvaluationWorker {
    runner: IsolatedRunner,
}

impl EvaluationWorker {
    pub fn new(runner: IsolatedRunner) -> Self {
        Self { runner }
    }

    fn record(input: &EvaluationInput, stdout: String, stderr: String) -> TestResult {
        TestResult {
            test_id: input.test_id.clone(),
            problem_id: input.problem_id.clone(),
            solution_id: input.solution_id.clone(),
            solution_output: stdout,
            exception_info: stderr,
            expected_output: input.test.output.clone(),
        }
    }
}

impl Worker for EvaluationWorker {
    type Input = EvaluationInput;
    type Output = TestResult;

    fn invoke(&self, _key: &WorkKey, input: &EvaluationInput) -> anyhow::Result<TestResult> {
        let outcome = self.runner.execute(&input.program, &input.test.input);
        Ok(Self::record(input, outcome.stdout, outcome.stderr))
    }

    fn failure(&self, _key: &WorkKey, input: &EvaluationInput, error: String) -> TestResult {
        Self::record(input, String::new(), error)
    }
}

pub fn generate_prompted_dataset(
    space: &GenerationSpace,
    llm: Arc<dyn LlmHandler>,
    store: &ChunkStore<PromptedSolution>,
    config: ExecutorConfig,
) -> Result<FanoutRun<PromptedSolution>> {
    let executor = FanoutExecutor::new(ExecutorConfig {
        pool: PoolKind::Thread,
        ..config
    })?;
    executor.run(space, store, Arc::new(PromptWorker::new(llm)))
}

pub fn evaluate_solutions(
    space: &EvaluationSpace,
    runner: IsolatedRunner,
    store: &ChunkStore<TestResult>,
    config: ExecutorConfig,
) -> Result<FanoutRun<TestResult>> {
    let executor = FanoutExecutor::new(ExecutorConfig {
        pool: PoolKind::Process,
        ..config
    })?;
    executor.run(space, store, Arc::new(EvaluationWorker::new(runner)))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::llm::MockLlmHandler;
    use crate::plan::WorkItemIndex;
    use crate::testutil::temp_root;
    use fanout_core::{Difficulty, Solution};
    use std::fs;
    use std::time::Duration;

    fn problem(name: &str, incorrect: &[&str]) -> ContestProblem {
        ContestProblem {
            name: name.to_string(),
            description: format!("echo the input of {}", name),
            difficulty: Difficulty::Easy,
            time_limit_nsec: 1_000_000_000,
            memory_limit_bytes: 0,
            public_tests: vec![TestCase {
                input: "5\n".to_string(),
                output: "5\n".to_string(),
            }],
            private_tests: vec![TestCase {
                input: "6\n".to_string(),
                output: "7\n".to_string(),
            }],
            generated_tests: vec![],
            solutions: vec![],
            incorrect_solutions: incorrect
                .iter()
                .map(|s| Solution {
                    solution: s.to_string(),
                    language: Default::default(),
                })
                .collect(),
            cf_points: 0.0,
            cf_rating: 0,
        }
    }

    fn prompt() -> PromptTemplate {
        PromptTemplate {
            prompt_name: "minimal".to_string(),
            unformatted_prompt: "Fix the bug. Problem: {function_description}. Reply {{\"solution\": ...}}"
                .to_string(),
        }
    }

    fn config() -> ExecutorConfig {
        ExecutorConfig {
            max_workers: Some(2),
            result_batch_size: 2,
            drain_grace: Duration::from_secs(10),
            ..ExecutorConfig::default()
        }
    }

    #[test]
    fn generation_space_covers_every_combination() {
        let space = GenerationSpace {
            problems: vec![problem("a", &["x", "y"]), problem("b", &["z"])],
            models: vec![ModelType::Gpt35Turbo, ModelType::Gpt4Turbo],
            prompts: vec![prompt()],
        };
        assert_eq!(space.expected_len(), 6);
        let items = space.items().expect("items");
        assert_eq!(items.len(), 6);
        let keys: BTreeSet<WorkKey> = items.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys.len(), 6);
    }

    #[test]
    fn generation_rejects_bad_prompt() {
        let space = GenerationSpace {
            problems: vec![problem("a", &["x"])],
            models: vec![ModelType::DEFAULT],
            prompts: vec![PromptTemplate {
                prompt_name: "broken".to_string(),
                unformatted_prompt: "{unknown_var}".to_string(),
            }],
        };
        assert!(matches!(space.validate(), Err(FanoutError::Configuration(_))));
        let empty_models = GenerationSpace {
            models: vec![],
            ..space
        };
        assert!(empty_models.validate().is_err());
    }

    #[test]
    fn generation_parses_solution_field() {
        let root = temp_root("gen_parse");
        let store = ChunkStore::<PromptedSolution>::new(&root);
        let llm = MockLlmHandler::with_chat(
            r#"{"solution":"read x; echo $x","change_description":["echo"]}"#,
        );
        let space = GenerationSpace {
            problems: vec![problem("a", &["echo 0"])],
            models: vec![ModelType::DEFAULT],
            prompts: vec![prompt()],
        };
        let records = generate_prompted_dataset(&space, Arc::new(llm), &store, config())
            .expect("run")
            .collect_records()
            .expect("records");
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.patched_solution, "read x; echo $x");
        assert_eq!(record.patched_response["change_description"], "[\"echo\"]");
        assert!(!record.is_failure());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn generation_failure_is_recorded() {
        let root = temp_root("gen_fail");
        let store = ChunkStore::<PromptedSolution>::new(&root);
        let space = GenerationSpace {
            problems: vec![problem("a", &["echo 0"])],
            models: vec![ModelType::DEFAULT],
            prompts: vec![prompt()],
        };
        let records = generate_prompted_dataset(
            &space,
            Arc::new(MockLlmHandler::default()),
            &store,
            config(),
        )
        .expect("run")
        .collect_records()
        .expect("records");
        assert_eq!(records.len(), 1);
        assert!(records[0].is_failure());
        assert!(records[0].patched_solution.is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn evaluation_requires_tests_for_every_problem() {
        let solution = PromptedSolution {
            solution_id: "s".to_string(),
            problem_id: "unknown".to_string(),
            prompt_id: "p".to_string(),
            model: ModelType::DEFAULT,
            patched_solution: "echo 1".to_string(),
            patched_response: BTreeMap::new(),
            error: String::new(),
        };
        let space = EvaluationSpace {
            solutions: vec![solution],
            tests_by_problem: BTreeMap::new(),
        };
        let err = space.validate().expect_err("must fail");
        assert!(err.to_string().contains("unknown"));
    }

    #[test]
    fn evaluation_runs_each_test() {
        let root = temp_root("eval_run");
        let store = ChunkStore::<TestResult>::new(&root);
        let problems = vec![problem("a", &["echo 0"])];
        let problem_id = problems[0].identity().expect("id");
        let solution = PromptedSolution {
            solution_id: "s".to_string(),
            problem_id: problem_id.clone(),
            prompt_id: "p".to_string(),
            model: ModelType::DEFAULT,
            patched_solution: "read x; echo $x".to_string(),
            patched_response: BTreeMap::new(),
            error: String::new(),
        };
        let space = EvaluationSpace {
            solutions: vec![solution],
            tests_by_problem: tests_by_problem(&problems).expect("tests"),
        };
        let results = evaluate_solutions(&space, IsolatedRunner::default(), &store, config())
            .expect("run")
            .collect_records()
            .expect("results");
        assert_eq!(results.len(), 2);
        let correct = results.iter().filter(|r| r.is_correct()).count();
        assert_eq!(correct, 1);
        assert!(results.iter().all(|r| r.problem_id == problem_id));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn repeated_inputs_collapse_into_one_unit_of_work() {
        let root = temp_root("repeated_inputs");
        let mut twice = problem("a", &["echo 0", "echo 0"]);
        twice.private_tests = twice.public_tests.clone();

        let generation = GenerationSpace {
            problems: vec![twice.clone()],
            models: vec![ModelType::DEFAULT],
            prompts: vec![prompt()],
        };
        let prompted = ChunkStore::<PromptedSolution>::new(root.join("prompted"));
        let plan = WorkItemIndex::plan(&generation, &prompted, false).expect("generation plan");
        assert_eq!(plan.total, 1);

        let problem_id = twice.identity().expect("id");
        let solution = PromptedSolution {
            solution_id: "s".to_string(),
            problem_id,
            prompt_id: "p".to_string(),
            model: ModelType::DEFAULT,
            patched_solution: "read x; echo $x".to_string(),
            patched_response: BTreeMap::new(),
            error: String::new(),
        };
        let evaluation = EvaluationSpace {
            solutions: vec![solution],
            tests_by_problem: tests_by_problem(&[twice]).expect("tests"),
        };
        let results_store = ChunkStore::<TestResult>::new(root.join("results"));
        let results = evaluate_solutions(
            &evaluation,
            IsolatedRunner::default(),
            &results_store,
            config(),
        )
        .expect("run")
        .collect_records()
        .expect("results");
        assert_eq!(results.len(), 1);
        assert!(results[0].is_correct());
        let _ = fs::remove_dir_all(root);
    }
}
