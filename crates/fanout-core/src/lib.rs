pub mod canonical;
pub mod domain;
pub mod error;
pub mod record;
pub mod transport;

pub use canonical::{canonical_json_bytes, canonical_json_digest, ensure_dir, sha256_bytes};
pub use domain::{
    ContestProblem, Difficulty, Language, ModelType, PromptTemplate, PromptedSolution, Solution,
    TestCase, TestResult, LAUNCH_FAILED_PREFIX, TIMEOUT_PREFIX,
};
pub use error::{FanoutError, Result};
pub use record::{ContentAddressedRecord, KeyedRecord, RecordSet, WorkKey};
pub use transport::{JsonlFile, WriteMode};
