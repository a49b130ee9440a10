pub mod executor;
pub mod isolated;
pub mod llm;
pub mod pipeline;
pub mod plan;
pub mod scoring;
pub mod store;

#[cfg(test)]
mod testutil;

pub use executor::{ExecutorConfig, FanoutExecutor, FanoutRun, PoolKind, Worker};
pub use isolated::{IsolatedRunner, RunOutcome, RunStatus, RunnerConfig};
pub use llm::{ChatMessage, LlmHandler, MockLlmHandler, OpenAiHandler, ResponseFormat};
pub use pipeline::{
    evaluate_solutions, generate_prompted_dataset, tests_by_problem, EvaluationSpace,
    EvaluationWorker, GenerationSpace, PromptWorker,
};
pub use plan::{ListSpace, Plan, PlanSummary, WorkItemIndex, WorkSpace};
pub use scoring::{score_results, SolutionScore};
pub use store::{ChunkFile, ChunkReader, ChunkStore};
