use std::any::Any;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvTimeoutError};
use fanout_core::{FanoutError, KeyedRecord, RecordSet, Result, WorkKey};
use tracing::{debug, info, warn};

use crate::plan::{Plan, PlanSummary, WorkItemIndex, WorkSpace};
use crate::store::ChunkStore;

pub const DEFAULT_RESULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(30);

/// Which kind of work the pool is sized for.
///
/// `Thread` suits network-bound calls. `Process` suits work where each item runs in its
/// own child process (see `IsolatedRunner`); pool threads only wait on those children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolKind {
    #[default]
    Thread,
    Process,
}

impl PoolKind {
    pub fn default_size(&self) -> usize {
        let cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        match self {
            PoolKind::Thread => (cpus + 4).min(32),
            PoolKind::Process => cpus,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_workers: Option<usize>,
    pub result_batch_size: usize,
    /// Plan only: report cached and pending work without invoking the worker.
    pub dry_run: bool,
    /// How long to wait for stragglers once every item has been submitted.
    pub drain_grace: Duration,
    pub pool: PoolKind,
    pub parallel_read: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            result_batch_size: DEFAULT_RESULT_BATCH_SIZE,
            dry_run: false,
            drain_grace: DEFAULT_DRAIN_GRACE,
            pool: PoolKind::default(),
            parallel_read: true,
        }
    }
}

/// Computes one unit of work. Implementations may have side effects and are re-run
/// whole on resume if their result was never checkpointed.
pub trait Worker: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: KeyedRecord + Send + 'static;

    fn invoke(&self, key: &WorkKey, input: &Self::Input) -> anyhow::Result<Self::Output>;

    /// Result recorded in place of output when `invoke` errors or panics.
    fn failure(&self, key: &WorkKey, input: &Self::Input, error: String) -> Self::Output;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn invoke_guarded<W: Worker>(worker: &W, key: &WorkKey, input: &W::Input) -> W::Output {
    match panic::catch_unwind(AssertUnwindSafe(|| worker.invoke(key, input))) {
        Ok(Ok(record)) => record,
        Ok(Err(err)) => {
            warn!(key = %key, "work item failed: {:#}", err);
            worker.failure(key, input, format!("{:#}", err))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(key = %key, "work item panicked: {}", message);
            worker.failure(key, input, format!("worker panicked: {}", message))
        }
    }
}

pub struct FanoutExecutor {
    config: ExecutorConfig,
}

impl FanoutExecutor {
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        if config.result_batch_size == 0 {
            return Err(FanoutError::configuration(
                "result_batch_size must be at least 1",
            ));
        }
        if config.max_workers == Some(0) {
            return Err(FanoutError::configuration("max_workers must be at least 1"));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn pool_size(&self) -> usize {
        self.config
            .max_workers
            .unwrap_or_else(|| self.config.pool.default_size())
    }

    pub fn run<S, W>(
        &self,
        space: &S,
        store: &ChunkStore<W::Output>,
        worker: Arc<W>,
    ) -> Result<FanoutRun<W::Output>>
    where
        S: WorkSpace<Input = W::Input, Output = W::Output>,
        W: Worker,
    {
        let plan = WorkItemIndex::plan(space, store, self.config.parallel_read)?;
        Ok(self.execute(plan, store, worker))
    }

    /// Starts the pool on `plan.pending` and returns the lazy result stream. Cached
    /// results come out first as one set and are not written again.
    pub fn execute<W: Worker>(
        &self,
        plan: Plan<W::Output, W::Input>,
        store: &ChunkStore<W::Output>,
        worker: Arc<W>,
    ) -> FanoutRun<W::Output> {
        let summary = plan.summary();
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut run = FanoutRun {
            summary,
            cached: Some(RecordSet::new(plan.cached)),
            store: store.clone(),
            batch_size: self.config.result_batch_size,
            drain_grace: self.config.drain_grace,
            done_rx: None,
            fed_rx: None,
            deadline: None,
            cancelled: Arc::clone(&cancelled),
            batch: Vec::new(),
            completed: 0,
            checkpoints: 0,
            abandoned: false,
            finished: false,
        };

        if self.config.dry_run {
            info!(
                total = summary.total,
                cached = summary.cached,
                pending = summary.pending,
                "dry run, nothing dispatched"
            );
            run.finished = true;
            return run;
        }
        if plan.pending.is_empty() {
            run.finished = true;
            return run;
        }

        let workers = self.pool_size().min(plan.pending.len());
        let (job_tx, job_rx) = bounded::<(WorkKey, W::Input)>(workers);
        let (done_tx, done_rx) = unbounded::<W::Output>();
        let (fed_tx, fed_rx) = bounded::<()>(1);

        for idx in 0..workers {
            let job_rx = job_rx.clone();
            let done_tx = done_tx.clone();
            let worker = Arc::clone(&worker);
            let cancelled = Arc::clone(&cancelled);
            let spawned = thread::Builder::new()
                .name(format!("fanout-worker-{}", idx))
                .spawn(move || {
                    for (key, input) in job_rx.iter() {
                        if cancelled.load(Ordering::Relaxed) {
                            break;
                        }
                        let record = invoke_guarded(worker.as_ref(), &key, &input);
                        if done_tx.send(record).is_err() {
                            break;
                        }
                    }
                });
            if let Err(e) = spawned {
                warn!("failed to spawn worker {}: {}", idx, e);
            }
        }
        drop(job_rx);
        drop(done_tx);

        let feeder_cancelled = Arc::clone(&cancelled);
        let pending = plan.pending;
        let fed = thread::Builder::new()
            .name("fanout-feeder".to_string())
            .spawn(move || {
                let mut submitted = 0usize;
                for item in pending {
                    if feeder_cancelled.load(Ordering::Relaxed) || job_tx.send(item).is_err() {
                        break;
                    }
                    submitted += 1;
                }
                drop(job_tx);
                debug!(submitted, "all work submitted");
                let _ = fed_tx.send(());
            });
        if let Err(e) = fed {
            warn!("failed to spawn feeder: {}", e);
        }

        info!(
            workers,
            pending = summary.pending,
            batch_size = self.config.result_batch_size,
            "dispatching work"
        );
        run.done_rx = Some(done_rx);
        run.fed_rx = Some(fed_rx);
        run
    }
}

/// Lazy result stream of one execution: the cached set, then checkpointed batches in
/// the order they fill. Dropping it stops workers from picking up new items.
pub struct FanoutRun<R> {
    summary: PlanSummary,
    cached: Option<RecordSet<R>>,
    store: ChunkStore<R>,
    batch_size: usize,
    drain_grace: Duration,
    done_rx: Option<Receiver<R>>,
    fed_rx: Option<Receiver<()>>,
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
    batch: Vec<R>,
    completed: usize,
    checkpoints: usize,
    abandoned: bool,
    finished: bool,
}

impl<R: KeyedRecord + Send> FanoutRun<R> {
    pub fn summary(&self) -> PlanSummary {
        self.summary
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn checkpoints(&self) -> usize {
        self.checkpoints
    }

    /// True when the drain grace period ran out before every item finished.
    pub fn abandoned(&self) -> bool {
        self.abandoned
    }

    pub fn collect_records(&mut self) -> Result<Vec<R>> {
        let mut out = Vec::new();
        for set in self.by_ref() {
            out.extend(set?);
        }
        Ok(out)
    }

    fn next_completion(&mut self) -> Option<R> {
        let done_rx = self.done_rx.clone()?;
        loop {
            if let Some(deadline) = self.deadline {
                return match done_rx.recv_deadline(deadline) {
                    Ok(record) => Some(record),
                    Err(RecvTimeoutError::Timeout) => {
                        warn!(
                            completed = self.completed,
                            pending = self.summary.pending,
                            grace_secs = self.drain_grace.as_secs_f64(),
                            "drain grace elapsed, abandoning unfinished work"
                        );
                        self.abandoned = true;
                        None
                    }
                    Err(RecvTimeoutError::Disconnected) => None,
                };
            }
            match self.fed_rx.clone() {
                Some(fed_rx) => select! {
                    recv(done_rx) -> msg => return msg.ok(),
                    recv(fed_rx) -> _ => {
                        self.fed_rx = None;
                        self.deadline = Some(Instant::now() + self.drain_grace);
                    }
                },
                None => return done_rx.recv().ok(),
            }
        }
    }

    fn stop(&mut self) {
        self.finished = true;
        self.cancelled.store(true, Ordering::Relaxed);
        self.done_rx = None;
        self.fed_rx = None;
    }

    fn flush(&mut self) -> Result<RecordSet<R>> {
        let set = RecordSet::new(mem::take(&mut self.batch));
        let chunk = self.store.write_one(&set)?;
        self.checkpoints += 1;
        debug!(
            sequence = chunk.sequence,
            completed = self.completed,
            pending = self.summary.pending,
            "checkpointed batch of {}",
            set.len()
        );
        Ok(set)
    }
}

impl<R: KeyedRecord + Send> Iterator for FanoutRun<R> {
    type Item = Result<RecordSet<R>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(cached) = self.cached.take() {
            if !cached.is_empty() {
                return Some(Ok(cached));
            }
        }
        if self.finished {
            return None;
        }
        loop {
            match self.next_completion() {
                Some(record) => {
                    self.completed += 1;
                    self.batch.push(record);
                    if self.batch.len() >= self.batch_size {
                        let flushed = self.flush();
                        if flushed.is_err() {
                            self.stop();
                        }
                        return Some(flushed);
                    }
                }
                None => {
                    self.stop();
                    info!(
                        completed = self.completed,
                        checkpoints = self.checkpoints,
                        abandoned = self.abandoned,
                        "fan-out finished"
                    );
                    if self.batch.is_empty() {
                        return None;
                    }
                    return Some(self.flush());
                }
            }
        }
    }
}

impl<R> Drop for FanoutRun<R> {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ListSpace;
    use crate::testutil::{temp_root, Square};
    use anyhow::anyhow;
    use std::fs;

    struct SquareWorker {
        fail_on: Option<u64>,
        panic_on: Option<u64>,
        delay: Duration,
    }

    impl SquareWorker {
        fn plain() -> Self {
            Self {
                fail_on: None,
                panic_on: None,
                delay: Duration::ZERO,
            }
        }
    }

    impl Worker for SquareWorker {
        type Input = u64;
        type Output = Square;

        fn invoke(&self, _key: &WorkKey, input: &u64) -> anyhow::Result<Square> {
            thread::sleep(self.delay);
            if self.fail_on == Some(*input) {
                return Err(anyhow!("refusing {}", input));
            }
            if self.panic_on == Some(*input) {
                panic!("boom on {}", input);
            }
            Ok(Square::of(*input))
        }

        fn failure(&self, _key: &WorkKey, input: &u64, error: String) -> Square {
            Square {
                input: *input,
                output: 0,
                error,
            }
        }
    }

    fn space(inputs: &[u64]) -> ListSpace<u64, Square> {
        ListSpace::new(
            inputs
                .iter()
                .map(|i| (WorkKey::new([i.to_string()]), *i))
                .collect(),
        )
    }

    fn executor(batch: usize, workers: usize) -> FanoutExecutor {
        FanoutExecutor::new(ExecutorConfig {
            max_workers: Some(workers),
            result_batch_size: batch,
            ..ExecutorConfig::default()
        })
        .expect("config")
    }

    #[test]
    fn rejects_invalid_config() {
        let zero_batch = ExecutorConfig {
            result_batch_size: 0,
            ..ExecutorConfig::default()
        };
        assert!(matches!(
            FanoutExecutor::new(zero_batch),
            Err(FanoutError::Configuration(_))
        ));
        let zero_workers = ExecutorConfig {
            max_workers: Some(0),
            ..ExecutorConfig::default()
        };
        assert!(FanoutExecutor::new(zero_workers).is_err());
    }

    #[test]
    fn batches_of_two_checkpoint_all_five() {
        let root = temp_root("exec_batches");
        let store = ChunkStore::<Square>::new(&root);
        let mut run = executor(2, 3)
            .run(&space(&[1, 2, 3, 4, 5]), &store, Arc::new(SquareWorker::plain()))
            .expect("run");
        let sets: Vec<RecordSet<Square>> = run
            .by_ref()
            .collect::<Result<Vec<_>>>()
            .expect("results");
        let mut sizes: Vec<usize> = sets.iter().map(|s| s.len()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 2, 2]);
        assert_eq!(run.checkpoints(), 3);
        assert!(!run.abandoned());

        let stored = store.read_all(false).expect("read");
        assert_eq!(stored.len(), 3);
        let mut inputs: Vec<u64> = stored.iter().flatten().map(|r| r.input).collect();
        inputs.sort_unstable();
        assert_eq!(inputs, vec![1, 2, 3, 4, 5]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failing_and_panicking_items_become_failure_records() {
        let root = temp_root("exec_failures");
        let store = ChunkStore::<Square>::new(&root);
        let worker = SquareWorker {
            fail_on: Some(3),
            panic_on: Some(5),
            delay: Duration::ZERO,
        };
        let records = executor(10, 2)
            .run(&space(&[1, 2, 3, 4, 5]), &store, Arc::new(worker))
            .expect("run")
            .collect_records()
            .expect("records");
        assert_eq!(records.len(), 5);
        for record in &records {
            match record.input {
                3 => {
                    assert_eq!(record.output, 0);
                    assert!(record.error.contains("refusing 3"));
                }
                5 => assert!(record.error.contains("boom on 5")),
                n => {
                    assert_eq!(record.output, n * n);
                    assert!(record.error.is_empty());
                }
            }
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn cached_results_come_first_and_are_not_rewritten() {
        let root = temp_root("exec_cached");
        let store = ChunkStore::<Square>::new(&root);
        store
            .write_one(&RecordSet::new(vec![Square::of(1), Square::of(2)]))
            .expect("seed");
        let mut run = executor(10, 2)
            .run(&space(&[1, 2, 3]), &store, Arc::new(SquareWorker::plain()))
            .expect("run");
        assert_eq!(run.summary().cached, 2);
        let first = run.next().expect("cached set").expect("ok");
        assert_eq!(first.len(), 2);
        let second = run.next().expect("fresh set").expect("ok");
        assert_eq!(second.records()[0].input, 3);
        assert!(run.next().is_none());
        assert_eq!(store.chunk_files().expect("files").len(), 2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn dry_run_dispatches_nothing() {
        let root = temp_root("exec_dry");
        let store = ChunkStore::<Square>::new(root.join("store"));
        let exec = FanoutExecutor::new(ExecutorConfig {
            dry_run: true,
            ..ExecutorConfig::default()
        })
        .expect("config");
        let mut run = exec
            .run(&space(&[1, 2]), &store, Arc::new(SquareWorker::plain()))
            .expect("run");
        assert_eq!(run.summary().pending, 2);
        assert!(run.next().is_none());
        assert!(!store.exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn drain_grace_abandons_stragglers() {
        let root = temp_root("exec_grace");
        let store = ChunkStore::<Square>::new(&root);
        let exec = FanoutExecutor::new(ExecutorConfig {
            max_workers: Some(1),
            result_batch_size: 10,
            drain_grace: Duration::from_millis(100),
            ..ExecutorConfig::default()
        })
        .expect("config");
        let worker = SquareWorker {
            fail_on: None,
            panic_on: None,
            delay: Duration::from_millis(300),
        };
        let started = Instant::now();
        let mut run = exec
            .run(&space(&[1, 2, 3, 4, 5, 6]), &store, Arc::new(worker))
            .expect("run");
        let records = run.collect_records().expect("records");
        assert!(run.abandoned());
        assert!(!records.is_empty() && records.len() < 6, "got {}", records.len());
        assert!(started.elapsed() < Duration::from_secs(5));

        let stored: usize = store.read_all(false).expect("read").iter().map(|s| s.len()).sum();
        assert_eq!(stored, records.len());
        let _ = fs::remove_dir_all(root);
    }
}
