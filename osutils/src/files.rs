use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};

/// Creates a file and all parent directories if they don't exist
pub fn create_file<S>(path: S) -> Result<File, Error>
where
    S: AsRef<Path>,
{
    if let Some(parent) = path.as_ref().parent() {
        create_dirs(parent)?;
    }

    std::fs::File::create(path.as_ref()).context(format!(
        "Could not create file: {}",
        path.as_ref().display()
    ))
}

/// Creates all directories in a path if they don't exist
pub fn create_dirs<S>(path: S) -> Result<(), Error>
where
    S: AsRef<Path>,
{
    std::fs::create_dir_all(path.as_ref()).context(format!(
        "Could not create path: {}",
        path.as_ref().display()
    ))
}

/// Reads the content of a file and trims it
pub fn read_file_trim(file_path: &Path) -> Result<String, Error> {
    let content = std::fs::read_to_string(file_path)
        .context(format!("Could not read file contents: {:?}", file_path))?;
    Ok(content.trim().to_string())
}

/// Replaces the contents of a file atomically: the new contents are staged in
/// a temporary sibling, synced, and renamed over the destination.
pub fn atomic_replace<S>(path: S, contents: &[u8]) -> Result<(), Error>
where
    S: AsRef<Path>,
{
    let path = path.as_ref();
    let dir: PathBuf = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.into(),
        _ => ".".into(),
    };
    create_dirs(&dir)?;

    let mut staged = tempfile::NamedTempFile::new_in(&dir)
        .context("Failed to create temporary file for atomic replace")?;
    staged
        .write_all(contents)
        .context("Failed to stage new file contents")?;
    staged
        .as_file()
        .sync_all()
        .context("Failed to sync staged file contents")?;
    staged
        .persist(path)
        .with_context(|| format!("Failed to replace '{}'", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use tempfile::TempDir;

    #[test]
    fn test_create_file_makes_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c.txt");
        create_file(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_read_file_trim() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("value");
        std::fs::write(&path, "  hello\n\n").unwrap();
        assert_eq!(read_file_trim(&path).unwrap(), "hello");

        read_file_trim(&dir.path().join("missing")).unwrap_err();
    }

    #[test]
    fn test_atomic_replace() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state");

        atomic_replace(&path, b"one").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"one");

        atomic_replace(&path, b"two").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");

        // No stray temporary files left behind.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
