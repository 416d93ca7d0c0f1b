//! Per-tool performance logs - append-only NDJSON files
//!
//! One file per tool under the storage directory, `<tool>.jsonl`, one
//! [`PerformanceSample`] per line. Tool names are sanitised into file names.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::sample::PerformanceSample;

const LOG_EXTENSION: &str = "jsonl";

/// Manages the on-disk performance logs
#[derive(Debug, Clone)]
pub struct PerfLogStore {
    base_dir: PathBuf,
}

impl PerfLogStore {
    /// Store rooted at `base_dir`; the directory is created on first write
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the log for `tool`
    pub fn log_path(&self, tool: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}.{}", sanitize_tool_name(tool), LOG_EXTENSION))
    }

    /// Append samples, grouped per tool file, in the order given
    pub fn append(&self, samples: &[PerformanceSample]) -> Result<usize> {
        if samples.is_empty() {
            return Ok(0);
        }
        fs::create_dir_all(&self.base_dir).with_context(|| {
            format!("Failed to create performance log directory {}", self.base_dir.display())
        })?;

        let mut by_tool: BTreeMap<&str, Vec<&PerformanceSample>> = BTreeMap::new();
        for sample in samples {
            by_tool.entry(sample.tool()).or_default().push(sample);
        }

        for (tool, group) in by_tool {
            // Serialize the whole group first so a bad sample writes nothing
            let mut lines = String::new();
            for sample in group {
                let line = serde_json::to_string(sample)
                    .context("Failed to serialize performance sample")?;
                lines.push_str(&line);
                lines.push('\n');
            }

            let path = self.log_path(tool);
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            file.write_all(lines.as_bytes())
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }

        debug!("Wrote {} performance samples to {}", samples.len(), self.base_dir.display());
        Ok(samples.len())
    }

    /// Samples for `tool`, oldest first; the newest `limit` when given.
    /// Malformed lines are skipped.
    pub fn read_tool(&self, tool: &str, limit: Option<usize>) -> Result<Vec<PerformanceSample>> {
        let path = self.log_path(tool);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::File::open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut samples = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PerformanceSample>(&line) {
                Ok(sample) => samples.push(sample),
                Err(e) => warn!("Skipping malformed line {} in {}: {}", number + 1, path.display(), e),
            }
        }

        if let Some(limit) = limit {
            let skip = samples.len().saturating_sub(limit);
            samples.drain(..skip);
        }
        Ok(samples)
    }

    /// Every log file as `(file stem, line count)`, sorted by name
    pub fn tools(&self) -> Result<Vec<(String, usize)>> {
        let mut tools = Vec::new();
        for path in self.log_files()? {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let count = content.lines().filter(|l| !l.trim().is_empty()).count();
            tools.push((stem.to_string(), count));
        }
        tools.sort();
        Ok(tools)
    }

    /// Delete every log file; returns how many were removed
    pub fn delete_all(&self) -> Result<usize> {
        let files = self.log_files()?;
        for path in &files {
            fs::remove_file(path)
                .with_context(|| format!("Failed to delete {}", path.display()))?;
        }
        if !files.is_empty() {
            debug!("Deleted {} performance logs", files.len());
        }
        Ok(files.len())
    }

    fn log_files(&self) -> Result<Vec<PathBuf>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.base_dir)
            .with_context(|| format!("Failed to list {}", self.base_dir.display()))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(LOG_EXTENSION) {
                files.push(path);
            }
        }
        Ok(files)
    }
}

/// Keep ASCII alphanumerics, `-`, `_` and `.`; everything else becomes `_`
pub fn sanitize_tool_name(tool: &str) -> String {
    let cleaned: String = tool
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn minimal(tool: &str, digest: &str) -> PerformanceSample {
        let now = Utc::now();
        PerformanceSample::Minimal {
            tool: tool.to_string(),
            params_digest: digest.to_string(),
            start: now,
            end: now,
        }
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_tool_name("web.search"), "web.search");
        assert_eq!(sanitize_tool_name("../etc/passwd"), "_etc_passwd");
        assert_eq!(sanitize_tool_name("a b/c"), "a_b_c");
        assert_eq!(sanitize_tool_name(""), "_");
    }

    #[test]
    fn test_append_and_read_back_per_tool() {
        let dir = TempDir::new().unwrap();
        let store = PerfLogStore::new(dir.path().join("perf"));
        store
            .append(&[minimal("a", "1"), minimal("b", "x"), minimal("a", "2")])
            .unwrap();
        store.append(&[minimal("a", "3")]).unwrap();

        let digests: Vec<String> = store
            .read_tool("a", None)
            .unwrap()
            .into_iter()
            .map(|s| match s {
                PerformanceSample::Minimal { params_digest, .. } => params_digest,
                PerformanceSample::Detailed { .. } => String::new(),
            })
            .collect();
        assert_eq!(digests, vec!["1", "2", "3"]);
        assert_eq!(store.read_tool("a", Some(1)).unwrap().len(), 1);
        assert_eq!(store.tools().unwrap(), vec![("a".to_string(), 3), ("b".to_string(), 1)]);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let store = PerfLogStore::new(dir.path());
        store.append(&[minimal("t", "ok")]).unwrap();
        let mut file = OpenOptions::new().append(true).open(store.log_path("t")).unwrap();
        writeln!(file, "not json").unwrap();

        assert_eq!(store.read_tool("t", None).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_all() {
        let dir = TempDir::new().unwrap();
        let store = PerfLogStore::new(dir.path());
        store.append(&[minimal("a", "1"), minimal("b", "2")]).unwrap();
        fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        assert_eq!(store.delete_all().unwrap(), 2);
        assert!(store.tools().unwrap().is_empty());
        assert!(dir.path().join("notes.txt").exists());
        assert!(store.read_tool("a", None).unwrap().is_empty());
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = PerfLogStore::new(dir.path().join("never-created"));
        assert!(store.tools().unwrap().is_empty());
        assert_eq!(store.delete_all().unwrap(), 0);
    }
}
