use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use fanout_core::canonical::remove_if_exists;
use fanout_core::{ensure_dir, ContentAddressedRecord, FanoutError, RecordSet, Result};
use rayon::prelude::*;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const DEFAULT_PREFIX: &str = "chunk";
pub const DEFAULT_EXTENSION: &str = "jsonl.zst";

/// How many times a writer re-allocates a sequence number after losing a publish race.
const MAX_PUBLISH_ATTEMPTS: usize = 16;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFile {
    pub sequence: u64,
    pub path: PathBuf,
}

/// Append-only directory of immutable, sequence-numbered, compressed record sets.
///
/// Files are named `<prefix>_<N>.<ext>`. Reads always come back in ascending `N`,
/// whatever order the filesystem lists them in.
pub struct ChunkStore<R> {
    dir: PathBuf,
    prefix: String,
    extension: String,
    _record: PhantomData<fn() -> R>,
}

impl<R> Clone for ChunkStore<R> {
    fn clone(&self) -> Self {
        Self {
            dir: self.dir.clone(),
            prefix: self.prefix.clone(),
            extension: self.extension.clone(),
            _record: PhantomData,
        }
    }
}

impl<R> fmt::Debug for ChunkStore<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkStore")
            .field("dir", &self.dir)
            .field("prefix", &self.prefix)
            .field("extension", &self.extension)
            .finish()
    }
}

impl<R: ContentAddressedRecord + Send> ChunkStore<R> {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_naming(dir, DEFAULT_PREFIX, DEFAULT_EXTENSION)
    }

    pub fn with_naming(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            extension: extension.into(),
            _record: PhantomData,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    fn chunk_path(&self, sequence: u64) -> PathBuf {
        self.dir
            .join(format!("{}_{}.{}", self.prefix, sequence, self.extension))
    }

    fn parse_sequence(&self, name: &str) -> Option<u64> {
        if !name.starts_with(&format!("{}_", self.prefix))
            || !name.ends_with(&format!(".{}", self.extension))
        {
            return None;
        }
        name.rsplit('_').next()?.split('.').next()?.parse().ok()
    }

    pub fn chunk_files(&self) -> Result<Vec<ChunkFile>> {
        if !self.exists() {
            return Err(FanoutError::NotFound(self.dir.clone()));
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| FanoutError::Io(io::Error::other(e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if let Some(sequence) = self.parse_sequence(name) {
                files.push(ChunkFile {
                    sequence,
                    path: entry.path().to_path_buf(),
                });
            }
        }
        files.sort_by_key(|f| f.sequence);
        Ok(files)
    }

    /// Max existing sequence plus one, or zero for an empty or missing store.
    /// Recomputed from the directory on every call.
    pub fn next_sequence(&self) -> Result<u64> {
        if !self.exists() {
            return Ok(0);
        }
        Ok(self
            .chunk_files()?
            .last()
            .map(|f| f.sequence + 1)
            .unwrap_or(0))
    }

    pub fn write<'a, I>(&self, record_sets: I) -> Result<Vec<ChunkFile>>
    where
        I: IntoIterator<Item = &'a RecordSet<R>>,
        R: 'a,
    {
        record_sets
            .into_iter()
            .map(|set| self.write_one(set))
            .collect()
    }

    pub fn write_one(&self, set: &RecordSet<R>) -> Result<ChunkFile> {
        ensure_dir(&self.dir)?;
        let bytes = set.to_compressed()?;
        for attempt in 1..=MAX_PUBLISH_ATTEMPTS {
            let sequence = self.next_sequence()?;
            match self.publish(sequence, &bytes) {
                Ok(path) => {
                    info!(
                        sequence,
                        records = set.len(),
                        bytes = bytes.len(),
                        "wrote chunk {}",
                        path.display()
                    );
                    return Ok(ChunkFile { sequence, path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    warn!(sequence, attempt, "chunk sequence taken by another writer, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(FanoutError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "could not allocate a chunk sequence in {} after {} attempts",
                self.dir.display(),
                MAX_PUBLISH_ATTEMPTS
            ),
        )))
    }

    pub fn write_at(&self, sequence: u64, set: &RecordSet<R>) -> Result<ChunkFile> {
        ensure_dir(&self.dir)?;
        let path = self.publish(sequence, &set.to_compressed()?)?;
        Ok(ChunkFile { sequence, path })
    }

    /// Temp file, fsync, then a hard link onto the final name. The link fails with
    /// `AlreadyExists` instead of clobbering a chunk someone else published.
    fn publish(&self, sequence: u64, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.chunk_path(sequence);
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("chunk");
        let tmp = path.with_file_name(format!(
            ".{}.tmp.{}.{}.{}",
            name,
            std::process::id(),
            Utc::now().timestamp_micros(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let result = (|| -> io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::hard_link(&tmp, &path)
        })();
        remove_if_exists(&tmp)?;
        result?;
        if let Ok(dir) = fs::File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(path)
    }

    /// Lazily decodes every chunk in ascending sequence order.
    ///
    /// With `parallel`, chunks are decoded a window at a time on a bounded rayon pool;
    /// output order is unaffected. The first unreadable chunk ends the sequence with
    /// a `StorageCorruption` error.
    pub fn read(&self, parallel: bool) -> Result<ChunkReader<R>> {
        let files = self.chunk_files()?;
        for pair in files.windows(2) {
            if pair[1].sequence != pair[0].sequence + 1 {
                warn!(
                    after = pair[0].sequence,
                    next = pair[1].sequence,
                    "gap in chunk sequence under {}",
                    self.dir.display()
                );
            }
        }
        debug!(chunks = files.len(), parallel, "reading {}", self.dir.display());
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let pool = if parallel {
            match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
                Ok(pool) => Some(Arc::new(pool)),
                Err(e) => {
                    warn!("failed to build decode pool, using the global pool: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Ok(ChunkReader {
            files: files.into(),
            ready: VecDeque::new(),
            parallel,
            pool,
            window: if parallel { threads * 2 } else { 1 },
            failed: false,
            _record: PhantomData,
        })
    }

    pub fn read_all(&self, parallel: bool) -> Result<Vec<RecordSet<R>>> {
        self.read(parallel)?.collect()
    }

    pub fn clear(&self) -> Result<usize> {
        if !self.exists() {
            return Ok(0);
        }
        let files = self.chunk_files()?;
        for file in &files {
            fs::remove_file(&file.path)?;
        }
        info!(removed = files.len(), "cleared {}", self.dir.display());
        Ok(files.len())
    }
}

fn decode_chunk<R: ContentAddressedRecord>(file: &ChunkFile) -> Result<RecordSet<R>> {
    let bytes = fs::read(&file.path).map_err(|e| FanoutError::corruption(&file.path, e))?;
    RecordSet::from_compressed(&bytes).map_err(|e| FanoutError::corruption(&file.path, e))
}

pub struct ChunkReader<R> {
    files: VecDeque<ChunkFile>,
    ready: VecDeque<Result<RecordSet<R>>>,
    parallel: bool,
    pool: Option<Arc<rayon::ThreadPool>>,
    window: usize,
    failed: bool,
    _record: PhantomData<fn() -> R>,
}

impl<R> ChunkReader<R> {
    pub fn remaining(&self) -> usize {
        self.files.len() + self.ready.len()
    }
}

impl<R: ContentAddressedRecord + Send> ChunkReader<R> {
    fn fill(&mut self) {
        let take = self.window.min(self.files.len());
        let batch: Vec<ChunkFile> = self.files.drain(..take).collect();
        let decoded: Vec<Result<RecordSet<R>>> = if !self.parallel {
            batch.iter().map(decode_chunk::<R>).collect()
        } else if let Some(pool) = &self.pool {
            pool.install(|| batch.par_iter().map(decode_chunk::<R>).collect())
        } else {
            batch.par_iter().map(decode_chunk::<R>).collect()
        };
        self.ready.extend(decoded);
    }
}

impl<R: ContentAddressedRecord + Send> Iterator for ChunkReader<R> {
    type Item = Result<RecordSet<R>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.ready.is_empty() {
            self.fill();
        }
        let item = self.ready.pop_front()?;
        if item.is_err() {
            self.failed = true;
            self.files.clear();
            self.ready.clear();
        }
        Some(item)
    }
}
