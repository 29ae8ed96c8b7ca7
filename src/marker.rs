//! Last-processed-date marker and the new-scene decision.

use chrono::NaiveDate;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::catalog::Candidate;
use crate::error::{Error, Result};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// What a run does with the candidate scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Download,
    Skip,
}

/// The date of the last successfully processed acquisition, persisted as
/// a single `YYYY-MM-DD` line. Created on the first run, truncated and
/// rewritten on every new acquisition, never deleted.
pub struct SceneMarker {
    path: PathBuf,
}

impl SceneMarker {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored date, or `None` when no scene was ever processed. Reads at
    /// most 10 characters; content that is not a date is fatal and the
    /// error carries the offending text.
    pub fn read(&self) -> Result<Option<NaiveDate>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => {
                let head: String = content.chars().take(10).collect();
                let date = NaiveDate::parse_from_str(&head, DATE_FORMAT)
                    .map_err(|_| Error::MalformedMarker(head.clone()))?;
                Ok(Some(date))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn record(&self, date: NaiveDate) -> Result<()> {
        fs::write(&self.path, date.format(DATE_FORMAT).to_string())?;
        Ok(())
    }
}

/// The decision table. Downloads happen when nothing was ever processed,
/// or when the catalog returned exactly one result whose date differs
/// from the stored one. A query with several results never downloads,
/// even if the newest of them is unseen.
pub fn decide(stored: Option<NaiveDate>, candidate: &Candidate) -> Decision {
    match stored {
        None => Decision::Download,
        Some(prev) => {
            if candidate.matches == 1 && prev != candidate.date {
                Decision::Download
            } else {
                Decision::Skip
            }
        }
    }
}

/// Read the marker, decide, and on a download decision record the
/// candidate date immediately. A later download failure leaves the
/// marker advanced; there is no rollback.
pub fn evaluate(marker: &SceneMarker, candidate: &Candidate) -> Result<Decision> {
    let stored = marker.read()?;
    let decision = decide(stored, candidate);
    if decision == Decision::Download {
        marker.record(candidate.date)?;
    }
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn candidate(date: &str, matches: usize) -> Candidate {
        Candidate {
            uuid: "S2B_20HMG_20230115_0_L2A".to_string(),
            date: date.parse().unwrap(),
            matches,
        }
    }

    #[test]
    fn test_absent_marker_downloads_and_records() {
        let dir = TempDir::new().unwrap();
        let marker = SceneMarker::new(dir.path().join("s2_last_proc_date"));

        let decision = evaluate(&marker, &candidate("2023-01-15", 1)).unwrap();
        assert_eq!(decision, Decision::Download);
        assert_eq!(marker.read().unwrap(), Some("2023-01-15".parse().unwrap()));
    }

    #[test]
    fn test_same_date_skips_and_keeps_marker() {
        let dir = TempDir::new().unwrap();
        let marker = SceneMarker::new(dir.path().join("s2_last_proc_date"));
        marker.record("2023-01-15".parse().unwrap()).unwrap();

        let decision = evaluate(&marker, &candidate("2023-01-15", 1)).unwrap();
        assert_eq!(decision, Decision::Skip);
        assert_eq!(marker.read().unwrap(), Some("2023-01-15".parse().unwrap()));
    }

    #[test]
    fn test_new_date_downloads_and_rewrites() {
        let dir = TempDir::new().unwrap();
        let marker = SceneMarker::new(dir.path().join("s2_last_proc_date"));
        marker.record("2023-01-15".parse().unwrap()).unwrap();

        let decision = evaluate(&marker, &candidate("2023-01-25", 1)).unwrap();
        assert_eq!(decision, Decision::Download);
        assert_eq!(marker.read().unwrap(), Some("2023-01-25".parse().unwrap()));
    }

    #[test]
    fn test_multiple_results_skip_even_when_date_is_new() {
        let dir = TempDir::new().unwrap();
        let marker = SceneMarker::new(dir.path().join("s2_last_proc_date"));
        marker.record("2023-01-15".parse().unwrap()).unwrap();

        let decision = evaluate(&marker, &candidate("2023-01-25", 3)).unwrap();
        assert_eq!(decision, Decision::Skip);
        assert_eq!(marker.read().unwrap(), Some("2023-01-15".parse().unwrap()));
    }

    #[test]
    fn test_read_caps_at_ten_characters() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s2_last_proc_date");
        std::fs::write(&path, "2023-01-15 trailing junk").unwrap();

        let marker = SceneMarker::new(&path);
        assert_eq!(marker.read().unwrap(), Some("2023-01-15".parse().unwrap()));
    }

    #[test]
    fn test_garbage_content_is_fatal_and_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s2_last_proc_date");
        std::fs::write(&path, "not-a-date").unwrap();

        let marker = SceneMarker::new(&path);
        match marker.read() {
            Err(Error::MalformedMarker(content)) => assert_eq!(content, "not-a-date"),
            other => panic!("expected MalformedMarker, got {:?}", other),
        }
    }
}
