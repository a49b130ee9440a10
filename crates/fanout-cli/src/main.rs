mod config;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use config::{LlmProvider, Overrides, PipelineConfig};
use fanout_core::{
    ContentAddressedRecord, ContestProblem, JsonlFile, KeyedRecord, PromptTemplate, PromptedSolution,
    TestResult, WriteMode,
};
use fanout_runner::{
    evaluate_solutions, generate_prompted_dataset, score_results, tests_by_problem, ChunkStore,
    EvaluationSpace, FanoutRun, GenerationSpace, IsolatedRunner, LlmHandler,
    MockLlmHandler, OpenAiHandler, PlanSummary, WorkItemIndex,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fanout", version = "0.3.0", about = "Resumable fan-out over code-repair pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PipelineArg {
    Generate,
    Evaluate,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RecordKindArg {
    #[value(name = "prompted")]
    Prompted,
    #[value(name = "results")]
    Results,
}

#[derive(clap::Args, Clone, Copy, Debug)]
struct OverrideArgs {
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    max_workers: Option<usize>,
    #[arg(long)]
    dry_run: bool,
}

impl From<OverrideArgs> for Overrides {
    fn from(value: OverrideArgs) -> Self {
        Overrides {
            batch_size: value.batch_size,
            max_workers: value.max_workers,
            dry_run: value.dry_run,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Ask models to repair every incorrect solution under every prompt.
    Generate {
        pipeline: PathBuf,
        #[command(flatten)]
        overrides: OverrideArgs,
        #[arg(long)]
        json: bool,
    },
    /// Run generated solutions against their problems' tests.
    Evaluate {
        pipeline: PathBuf,
        #[command(flatten)]
        overrides: OverrideArgs,
        #[arg(long)]
        json: bool,
    },
    /// Report cached and pending work without dispatching anything.
    Plan {
        pipeline: PathBuf,
        #[arg(long, value_enum, default_value = "generate")]
        stage: PipelineArg,
        #[arg(long)]
        json: bool,
    },
    Inspect {
        dir: PathBuf,
        #[arg(long, value_enum)]
        kind: RecordKindArg,
        #[arg(long)]
        json: bool,
    },
    /// Write every stored record to a JSONL file.
    Export {
        dir: PathBuf,
        #[arg(long, value_enum)]
        kind: RecordKindArg,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Delete all chunk files in a store directory.
    Clear {
        dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Generate {
            pipeline,
            overrides,
            json,
        } => {
            let config = PipelineConfig::load(&pipeline)?;
            let space = generation_space(&config)?;
            let store = ChunkStore::<PromptedSolution>::new(config.prompted_dir());
            let llm = llm_handler(&config)?;
            let run = generate_prompted_dataset(
                &space,
                llm,
                &store,
                config.executor_config(overrides.into())?,
            )?;
            let report = drain(run)?;
            let failures = report.records.iter().filter(|r| r.is_failure()).count();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "generate",
                    "store": store.dir().display().to_string(),
                    "run": report.to_json(),
                    "failures": failures,
                })));
            }
            report.print(store.dir());
            println!("generation_failures: {}", failures);
            Ok(None)
        }
        Commands::Evaluate {
            pipeline,
            overrides,
            json,
        } => {
            let config = PipelineConfig::load(&pipeline)?;
            let space = evaluation_space(&config)?;
            let store = ChunkStore::<TestResult>::new(config.results_dir());
            let runner = IsolatedRunner::new(config.runner_config()?);
            let run = evaluate_solutions(
                &space,
                runner,
                &store,
                config.executor_config(overrides.into())?,
            )?;
            let report = drain(run)?;
            let scores = score_results(&report.records);
            let solved = scores.iter().filter(|s| s.all_passed()).count();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "evaluate",
                    "store": store.dir().display().to_string(),
                    "run": report.to_json(),
                    "solutions": scores.len(),
                    "solved": solved,
                    "scores": scores,
                })));
            }
            report.print(store.dir());
            println!("solutions: {}", scores.len());
            println!("solved: {}", solved);
            for score in &scores {
                println!(
                    "  {} {}/{} passed ({} timed out)",
                    short_id(&score.solution_id),
                    score.passed,
                    score.total,
                    score.timed_out
                );
            }
            Ok(None)
        }
        Commands::Plan {
            pipeline,
            stage,
            json,
        } => {
            let config = PipelineConfig::load(&pipeline)?;
            let parallel = config.executor.parallel_read;
            let (dir, summary) = match stage {
                PipelineArg::Generate => {
                    let store = ChunkStore::<PromptedSolution>::new(config.prompted_dir());
                    let plan = WorkItemIndex::plan(&generation_space(&config)?, &store, parallel)?;
                    (store.dir().to_path_buf(), plan.summary())
                }
                PipelineArg::Evaluate => {
                    let store = ChunkStore::<TestResult>::new(config.results_dir());
                    let plan = WorkItemIndex::plan(&evaluation_space(&config)?, &store, parallel)?;
                    (store.dir().to_path_buf(), plan.summary())
                }
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "store": dir.display().to_string(),
                    "plan": summary,
                })));
            }
            print_plan(&dir, summary);
            Ok(None)
        }
        Commands::Inspect { dir, kind, json } => {
            let stats = match kind {
                RecordKindArg::Prompted => inspect_store(&ChunkStore::<PromptedSolution>::new(&dir))?,
                RecordKindArg::Results => inspect_store(&ChunkStore::<TestResult>::new(&dir))?,
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "inspect",
                    "store": dir.display().to_string(),
                    "chunks": stats.chunks,
                    "records": stats.records,
                    "first_sequence": stats.first_sequence,
                    "last_sequence": stats.last_sequence,
                })));
            }
            println!("store: {}", dir.display());
            println!("chunks: {}", stats.chunks);
            println!("records: {}", stats.records);
            if let (Some(first), Some(last)) = (stats.first_sequence, stats.last_sequence) {
                println!("sequences: {}..={}", first, last);
            }
            Ok(None)
        }
        Commands::Export {
            dir,
            kind,
            out,
            json,
        } => {
            let written = match kind {
                RecordKindArg::Prompted => {
                    export_store(&ChunkStore::<PromptedSolution>::new(&dir), &out)?
                }
                RecordKindArg::Results => export_store(&ChunkStore::<TestResult>::new(&dir), &out)?,
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "export",
                    "store": dir.display().to_string(),
                    "out": out.display().to_string(),
                    "records": written,
                })));
            }
            println!("exported {} records to {}", written, out.display());
            Ok(None)
        }
        Commands::Clear { dir, json } => {
            // Chunk removal does not decode records, so any record type works here.
            let removed = ChunkStore::<TestResult>::new(&dir).clear()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "clear",
                    "store": dir.display().to_string(),
                    "removed_chunks": removed,
                })));
            }
            println!("removed {} chunk files from {}", removed, dir.display());
            Ok(None)
        }
    }
}

fn generation_space(config: &PipelineConfig) -> Result<GenerationSpace> {
    let problems = JsonlFile::<ContestProblem>::open(config.problems_path()?)?.read_all()?;
    let prompts = JsonlFile::<PromptTemplate>::open(config.prompts_path()?)?.read_all()?;
    Ok(GenerationSpace {
        problems,
        models: config.models()?,
        prompts,
    })
}

/// Solutions whose generation failed have nothing to run and are left out.
fn evaluation_space(config: &PipelineConfig) -> Result<EvaluationSpace> {
    let problems = JsonlFile::<ContestProblem>::open(config.problems_path()?)?.read_all()?;
    let prompted = ChunkStore::<PromptedSolution>::new(config.prompted_dir());
    if !prompted.exists() {
        return Err(anyhow!(
            "no generated solutions under {}; run `fanout generate` first",
            prompted.dir().display()
        ));
    }
    let mut solutions = Vec::new();
    let mut skipped = 0usize;
    for set in prompted.read(config.executor.parallel_read)? {
        for solution in set? {
            if solution.is_failure() {
                skipped += 1;
            } else {
                solutions.push(solution);
            }
        }
    }
    if skipped > 0 {
        info!(skipped, "left out failed generations");
    }
    Ok(EvaluationSpace {
        solutions,
        tests_by_problem: tests_by_problem(&problems)?,
    })
}

fn llm_handler(config: &PipelineConfig) -> Result<Arc<dyn LlmHandler>> {
    match config.llm.provider {
        LlmProvider::Openai => Ok(Arc::new(OpenAiHandler::new(config.key_file().as_deref())?)),
        LlmProvider::Mock => Ok(Arc::new(MockLlmHandler {
            chat_completion: config.llm.mock_response.clone(),
            text_embedding: None,
        })),
    }
}

struct RunReport<R> {
    summary: PlanSummary,
    records: Vec<R>,
    completed: usize,
    checkpoints: usize,
    abandoned: bool,
}

impl<R> RunReport<R> {
    fn to_json(&self) -> Value {
        json!({
            "plan": self.summary,
            "records": self.records.len(),
            "completed": self.completed,
            "checkpoints": self.checkpoints,
            "abandoned": self.abandoned,
        })
    }

    fn print(&self, dir: &Path) {
        print_plan(dir, self.summary);
        println!("records: {}", self.records.len());
        println!("completed: {}", self.completed);
        println!("checkpoints: {}", self.checkpoints);
        if self.abandoned {
            println!("abandoned: true (rerun to finish the remaining work)");
        }
    }
}

fn drain<R: KeyedRecord + Send>(mut run: FanoutRun<R>) -> Result<RunReport<R>> {
    let records = run.collect_records()?;
    Ok(RunReport {
        summary: run.summary(),
        records,
        completed: run.completed(),
        checkpoints: run.checkpoints(),
        abandoned: run.abandoned(),
    })
}

fn print_plan(dir: &Path, summary: PlanSummary) {
    println!("store: {}", dir.display());
    println!("total: {}", summary.total);
    println!("cached: {}", summary.cached);
    println!("pending: {}", summary.pending);
}

struct StoreStats {
    chunks: usize,
    records: usize,
    first_sequence: Option<u64>,
    last_sequence: Option<u64>,
}

fn inspect_store<R: ContentAddressedRecord + Send>(store: &ChunkStore<R>) -> Result<StoreStats> {
    let files = store.chunk_files()?;
    let mut records = 0usize;
    for set in store.read(true)? {
        records += set?.len();
    }
    Ok(StoreStats {
        chunks: files.len(),
        records,
        first_sequence: files.first().map(|f| f.sequence),
        last_sequence: files.last().map(|f| f.sequence),
    })
}

fn export_store<R: ContentAddressedRecord + Send>(store: &ChunkStore<R>, out: &Path) -> Result<usize> {
    let file = JsonlFile::<R>::create(out)?;
    let mut written = 0usize;
    let mut mode = WriteMode::Replace;
    for set in store.read(true)? {
        written += file.write(&set?, mode)?;
        mode = WriteMode::Append;
    }
    if written == 0 {
        file.write(std::iter::empty(), WriteMode::Replace)?;
    }
    Ok(written)
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Generate { json, .. }
        | Commands::Evaluate { json, .. }
        | Commands::Plan { json, .. }
        | Commands::Inspect { json, .. }
        | Commands::Export { json, .. }
        | Commands::Clear { json, .. } => *json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_error_shape() {
        let value = json_error("command_failed", "boom".to_string(), json!({}));
        assert_eq!(value["ok"], json!(false));
        assert_eq!(value["error"]["code"], "command_failed");
        assert_eq!(value["error"]["message"], "boom");
    }

    #[test]
    fn cli_parses_overrides() {
        let cli = Cli::try_parse_from([
            "fanout",
            "generate",
            "pipeline.yaml",
            "--batch-size",
            "5",
            "--dry-run",
            "--json",
        ])
        .expect("parse");
        match cli.command {
            Commands::Generate {
                overrides, json, ..
            } => {
                assert_eq!(overrides.batch_size, Some(5));
                assert!(overrides.dry_run);
                assert!(json);
            }
            _ => panic!("expected generate"),
        }
    }

    #[test]
    fn short_id_truncates() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }
}
