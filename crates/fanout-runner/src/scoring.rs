use std::collections::BTreeMap;

use fanout_core::TestResult;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SolutionScore {
    pub problem_id: String,
    pub solution_id: String,
    pub passed: usize,
    pub timed_out: usize,
    pub total: usize,
}

impl SolutionScore {
    pub fn all_passed(&self) -> bool {
        self.total > 0 && self.passed == self.total
    }

    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.passed as f64 / self.total as f64
    }
}

/// Groups results by (problem, solution). Output is sorted by that pair.
pub fn score_results<'a, I>(results: I) -> Vec<SolutionScore>
where
    I: IntoIterator<Item = &'a TestResult>,
{
    let mut scores: BTreeMap<(&str, &str), SolutionScore> = BTreeMap::new();
    for result in results {
        let score = scores
            .entry((result.problem_id.as_str(), result.solution_id.as_str()))
            .or_insert_with(|| SolutionScore {
                problem_id: result.problem_id.clone(),
                solution_id: result.solution_id.clone(),
                ..SolutionScore::default()
            });
        score.total += 1;
        if result.is_correct() {
            score.passed += 1;
        }
        if result.timed_out() {
            score.timed_out += 1;
        }
    }
    scores.into_values().collect()
}
