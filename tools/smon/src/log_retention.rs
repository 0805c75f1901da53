use crate::errors::SmonError;
use std::fs;
use std::path::{Path, PathBuf};

/// Deletes the oldest files in `dir` until the total size fits the budget.
/// `keep` is never deleted (the live log).
pub fn enforce_total_budget(
    dir: &Path,
    budget_bytes: u64,
    keep: Option<&Path>,
) -> Result<Vec<PathBuf>, SmonError> {
    let mut files = fs::read_dir(dir)
        .map_err(|e| SmonError::Io(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter_map(|path| {
            let meta = fs::metadata(&path).ok()?;
            Some((path, meta.len(), meta.modified().ok()))
        })
        .collect::<Vec<_>>();

    files.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)));

    let mut total = files.iter().map(|(_, len, _)| *len).sum::<u64>();

    let mut deleted = Vec::new();
    for (path, len, _) in files {
        if total <= budget_bytes {
            break;
        }
        if keep.is_some_and(|keep| keep == path) {
            continue;
        }
        fs::remove_file(&path).map_err(|e| SmonError::Io(e.to_string()))?;
        total = total.saturating_sub(len);
        deleted.push(path);
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::enforce_total_budget;
    use std::fs;

    #[test]
    fn prunes_oldest_files_until_budget_is_met() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("run-1.jsonl"), vec![0u8; 40]).expect("a");
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(dir.path().join("run-2.jsonl"), vec![0u8; 40]).expect("b");

        let deleted = enforce_total_budget(dir.path(), 50, None).expect("pruned");
        assert_eq!(deleted.len(), 1);
        assert!(deleted[0].ends_with("run-1.jsonl"));
    }

    #[test]
    fn live_log_survives_even_when_oldest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let live = dir.path().join("run.jsonl");
        fs::write(&live, vec![0u8; 40]).expect("live");
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(dir.path().join("run-9.jsonl"), vec![0u8; 40]).expect("old");

        let deleted = enforce_total_budget(dir.path(), 50, Some(&live)).expect("pruned");
        assert_eq!(deleted.len(), 1);
        assert!(live.exists());
    }
}
