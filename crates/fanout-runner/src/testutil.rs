use std::path::PathBuf;

use chrono::Utc;
use fanout_core::{ensure_dir, ContentAddressedRecord, KeyedRecord, WorkKey};
use serde::{Deserialize, Serialize};

pub fn temp_root(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "fanout_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    ensure_dir(&root).expect("temp dir");
    root
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Square {
    pub input: u64,
    pub output: u64,
    #[serde(default)]
    pub error: String,
}

impl Square {
    pub fn of(input: u64) -> Self {
        Self {
            input,
            output: input * input,
            error: String::new(),
        }
    }
}

impl ContentAddressedRecord for Square {}

impl KeyedRecord for Square {
    fn work_key(&self) -> WorkKey {
        WorkKey::new([self.input.to_string()])
    }
}
