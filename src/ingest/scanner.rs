use walkdir::{WalkDir, DirEntry};
use std::path::{Path, PathBuf};
use anyhow::Result;

pub const METADATA_EXTENSION: &str = "jsonl";

/// Every event metadata file under `root`, hidden entries skipped, in path order.
pub fn scan_directory(root: &Path) -> Result<Vec<PathBuf>> {
    let walker = WalkDir::new(root).sort_by_file_name().into_iter();

    let mut found = Vec::new();
    for entry in walker.filter_entry(|e| e.depth() == 0 || !is_hidden(e)) {
        let entry = entry?;
        if entry.file_type().is_file() && is_metadata(entry.path()) {
            found.push(entry.into_path());
        }
    }
    Ok(found)
}

fn is_metadata(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(METADATA_EXTENSION))
        .unwrap_or(false)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name()
         .to_str()
         .map(|s| s.starts_with('.'))
         .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_finds_only_visible_metadata() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("front"))?;
        fs::create_dir_all(dir.path().join(".trash"))?;
        fs::write(dir.path().join("front/b.jsonl"), "{}")?;
        fs::write(dir.path().join("a.JSONL"), "{}")?;
        fs::write(dir.path().join("front/b.mp4"), "")?;
        fs::write(dir.path().join(".hidden.jsonl"), "{}")?;
        fs::write(dir.path().join(".trash/c.jsonl"), "{}")?;

        let found = scan_directory(dir.path())?;
        assert_eq!(
            found,
            vec![dir.path().join("a.JSONL"), dir.path().join("front/b.jsonl")]
        );
        Ok(())
    }

    #[test]
    fn test_missing_root_is_an_error() {
        assert!(scan_directory(Path::new("/nonexistent/capture")).is_err());
    }
}
