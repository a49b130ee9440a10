use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::canonical::ensure_dir;
use crate::error::{FanoutError, Result};
use crate::record::ContentAddressedRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Replace,
    Append,
}

#[derive(Debug, Clone)]
pub struct JsonlFile<R> {
    path: PathBuf,
    _record: PhantomData<fn() -> R>,
}

impl<R: ContentAddressedRecord> JsonlFile<R> {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        check_extension(&path)?;
        if !path.exists() {
            return Err(FanoutError::NotFound(path));
        }
        Ok(Self {
            path,
            _record: PhantomData,
        })
    }

    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        check_extension(&path)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_dir(parent)?;
        }
        Ok(Self {
            path,
            _record: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<JsonlRecords<R>> {
        let file = File::open(&self.path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FanoutError::NotFound(self.path.clone()),
            _ => FanoutError::Io(e),
        })?;
        Ok(JsonlRecords {
            lines: BufReader::new(file).lines(),
            _record: PhantomData,
        })
    }

    pub fn read_all(&self) -> Result<Vec<R>> {
        self.read()?.collect()
    }

    pub fn write<'a, I>(&self, records: I, mode: WriteMode) -> Result<usize>
    where
        I: IntoIterator<Item = &'a R>,
        R: 'a,
    {
        let file = match mode {
            WriteMode::Replace => File::create(&self.path)?,
            WriteMode::Append => OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?,
        };
        let mut writer = BufWriter::new(file);
        let mut written = 0;
        for record in records {
            writer.write_all(record.to_transport()?.as_bytes())?;
            writer.write_all(b"\n")?;
            written += 1;
        }
        writer.flush()?;
        Ok(written)
    }
}

fn check_extension(path: &Path) -> Result<()> {
    if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
        return Err(FanoutError::configuration(format!(
            "{} is not a .jsonl file",
            path.display()
        )));
    }
    Ok(())
}

/// Lazily parsed lines of a [`JsonlFile`]. Blank lines are skipped.
pub struct JsonlRecords<R> {
    lines: Lines<BufReader<File>>,
    _record: PhantomData<fn() -> R>,
}

impl<R: ContentAddressedRecord> Iterator for JsonlRecords<R> {
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(R::from_transport(&line));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TestCase;
    use chrono::Utc;
    use std::fs;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "fanout_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    fn case(input: &str) -> TestCase {
        TestCase {
            input: input.to_string(),
            output: format!("{}!", input),
        }
    }

    #[test]
    fn open_rejects_wrong_extension_and_missing_file() {
        let root = temp_root("jsonl_open");
        let err = JsonlFile::<TestCase>::open(root.join("data.json")).expect_err("extension");
        assert!(matches!(err, FanoutError::Configuration(_)));
        let err = JsonlFile::<TestCase>::open(root.join("data.jsonl")).expect_err("missing");
        assert!(matches!(err, FanoutError::NotFound(_)));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn write_replace_then_append() {
        let root = temp_root("jsonl_write");
        let file = JsonlFile::<TestCase>::create(root.join("nested").join("tests.jsonl"))
            .expect("create");
        let first = vec![case("a"), case("b")];
        assert_eq!(file.write(&first, WriteMode::Replace).expect("write"), 2);
        assert_eq!(file.write(&[case("c")], WriteMode::Append).expect("append"), 1);
        let inputs: Vec<String> = file
            .read_all()
            .expect("read")
            .into_iter()
            .map(|t| t.input)
            .collect();
        assert_eq!(inputs, vec!["a", "b", "c"]);

        file.write(&[case("z")], WriteMode::Replace).expect("replace");
        assert_eq!(file.read_all().expect("read").len(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn bad_line_surfaces_parse_error() {
        let root = temp_root("jsonl_bad");
        let path = root.join("tests.jsonl");
        fs::write(&path, "{\"input\":\"1\",\"output\":\"2\"}\nnot-json\n").expect("seed");
        let file = JsonlFile::<TestCase>::open(&path).expect("open");
        let results: Vec<Result<TestCase>> = file.read().expect("read").collect();
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(FanoutError::Parse { .. })));
        let _ = fs::remove_dir_all(root);
    }
}
