use std::collections::{BTreeMap, BTreeSet};

use fanout_core::{FanoutError, KeyedRecord, Result, WorkKey};
use serde::Serialize;
use tracing::{debug, info};

use crate::store::ChunkStore;

/// A flat cross-product of work items over some set of entities.
pub trait WorkSpace {
    type Input: Send + 'static;
    type Output: KeyedRecord + Send + 'static;

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Product of the dimension sizes, counting repeated entities.
    fn expected_len(&self) -> usize;

    fn items(&self) -> Result<Vec<(WorkKey, Self::Input)>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub total: usize,
    pub cached: usize,
    pub pending: usize,
}

#[derive(Debug)]
pub struct Plan<R, I> {
    pub cached: Vec<R>,
    pub pending: BTreeMap<WorkKey, I>,
    pub total: usize,
}

impl<R, I> Plan<R, I> {
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            total: self.total,
            cached: self.cached.len(),
            pending: self.pending.len(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

pub struct WorkItemIndex;

impl WorkItemIndex {
    /// A stored result is a hit only when every component of its work key matches a key
    /// in the space exactly. Stored results outside the space are ignored, and a key seen
    /// twice in the store keeps its first (lowest chunk) result. Items sharing a key are
    /// one unit of work; the first input is kept.
    pub fn plan<S: WorkSpace>(
        space: &S,
        store: &ChunkStore<S::Output>,
        parallel_read: bool,
    ) -> Result<Plan<S::Output, S::Input>> {
        space.validate()?;
        let items = space.items()?;
        let expected = space.expected_len();
        if items.len() != expected {
            return Err(FanoutError::configuration(format!(
                "work space produced {} items, expected {}",
                items.len(),
                expected
            )));
        }

        let mut pending = BTreeMap::new();
        let mut merged = 0usize;
        for (key, input) in items {
            if pending.contains_key(&key) {
                merged += 1;
                continue;
            }
            pending.insert(key, input);
        }
        if merged > 0 {
            debug!(merged, "merged repeated work items");
        }
        let total = pending.len();

        let mut cached = Vec::new();
        let mut cached_keys = BTreeSet::new();
        let mut duplicates = 0usize;
        let mut foreign = 0usize;
        if store.exists() {
            for set in store.read(parallel_read)? {
                for record in set? {
                    let key = record.work_key();
                    if pending.remove(&key).is_some() {
                        cached_keys.insert(key);
                        cached.push(record);
                    } else if cached_keys.contains(&key) {
                        duplicates += 1;
                    } else {
                        foreign += 1;
                    }
                }
            }
        }
        if duplicates > 0 || foreign > 0 {
            debug!(duplicates, foreign, "ignored stored results");
        }

        let plan = Plan {
            cached,
            pending,
            total,
        };
        let summary = plan.summary();
        info!(
            total = summary.total,
            cached = summary.cached,
            pending = summary.pending,
            "planned work under {}",
            store.dir().display()
        );
        Ok(plan)
    }
}

pub struct ListSpace<I, R> {
    items: Vec<(WorkKey, I)>,
    _output: std::marker::PhantomData<fn() -> R>,
}

impl<I, R> ListSpace<I, R> {
    pub fn new(items: Vec<(WorkKey, I)>) -> Self {
        Self {
            items,
            _output: std::marker::PhantomData,
        }
    }
}

impl<I, R> WorkSpace for ListSpace<I, R>
where
    I: Clone + Send + 'static,
    R: KeyedRecord + Send + 'static,
{
    type Input = I;
    type Output = R;

    fn expected_len(&self) -> usize {
        self.items.len()
    }

    fn items(&self) -> Result<Vec<(WorkKey, I)>> {
        Ok(self.items.clone())
    }
}
