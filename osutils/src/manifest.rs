use std::{collections::HashMap, path::Path};

use anyhow::{bail, Context, Error};

/// Parses a flat `key=value` manifest.
///
/// Blank lines and `#` comments are skipped. A line without `=` or a key that
/// appears twice is a parse error; values keep everything after the first `=`
/// with surrounding whitespace trimmed.
pub fn parse(contents: &str) -> Result<HashMap<String, String>, Error> {
    let mut entries = HashMap::new();

    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            bail!("Malformed manifest line {}: '{line}'", lineno + 1);
        };

        let key = key.trim().to_string();
        if key.is_empty() {
            bail!("Empty key on manifest line {}", lineno + 1);
        }
        if entries
            .insert(key.clone(), value.trim().to_string())
            .is_some()
        {
            bail!("Duplicate manifest key '{key}' on line {}", lineno + 1);
        }
    }

    Ok(entries)
}

/// Loads and parses a manifest file.
pub fn load(path: &Path) -> Result<HashMap<String, String>, Error> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest '{}'", path.display()))?;
    parse(&contents).with_context(|| format!("Failed to parse manifest '{}'", path.display()))
}

/// Loads a manifest and returns the value of a single required key.
pub fn load_key(path: &Path, key: &str) -> Result<String, Error> {
    load(path)?
        .remove(key)
        .with_context(|| format!("Manifest '{}' has no '{key}' entry", path.display()))
}

#[cfg(test)]
mod test {
    use super::*;

    use indoc::indoc;
    use tempfile::TempDir;

    #[test]
    fn test_parse() {
        let entries = parse(indoc! {"
            # release metadata
            artifact_name=release-2024-06
            device_type = raspberrypi4

            extra=a=b
        "})
        .unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries["artifact_name"], "release-2024-06");
        assert_eq!(entries["device_type"], "raspberrypi4");
        assert_eq!(entries["extra"], "a=b");
    }

    #[test]
    fn test_parse_rejects_duplicates() {
        parse("a=1\na=2\n").unwrap_err();
    }

    #[test]
    fn test_parse_rejects_garbage() {
        parse("not a manifest line\n").unwrap_err();
        parse("=value\n").unwrap_err();
    }

    #[test]
    fn test_load_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("artifact_info");
        std::fs::write(&path, "artifact_name=release-1\n").unwrap();

        assert_eq!(load_key(&path, "artifact_name").unwrap(), "release-1");
        load_key(&path, "device_type").unwrap_err();
        load_key(&dir.path().join("missing"), "artifact_name").unwrap_err();
    }
}
