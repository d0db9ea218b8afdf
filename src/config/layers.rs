use crate::error::{DebloatError, Result};
use std::path::{Path, PathBuf};

/// The two layer roots of a mount, validated once and never mutated afterwards.
///
/// Every engine component receives this through an `Arc` at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerConfig {
    /// Read-only tree holding the pre-existing data set.
    pub origin_root: PathBuf,
    /// Writable tree that accumulates materialized copies and new objects.
    pub cache_root: PathBuf,
    /// Reserved optimization hint. Accepted and logged, currently unused.
    pub optimize: Option<String>,
}

impl LayerConfig {
    /// Validate both roots and build the configuration.
    ///
    /// Fails if either root is missing or not a directory, or if the roots
    /// overlap (one inside the other), since the origin must never be written.
    pub fn new(origin_root: &Path, cache_root: &Path, optimize: Option<String>) -> Result<Self> {
        let origin_root = validate_root("origin (--lowerdir)", origin_root)?;
        let cache_root = validate_root("cache (--realdir)", cache_root)?;

        if origin_root.starts_with(&cache_root) || cache_root.starts_with(&origin_root) {
            return Err(DebloatError::Config(format!(
                "Origin root {} and cache root {} must not overlap",
                origin_root.display(),
                cache_root.display()
            )));
        }

        let optimize = optimize.filter(|hint| !hint.is_empty());
        if let Some(ref hint) = optimize {
            tracing::debug!("Optimization hint '{}' is reserved and ignored", hint);
        }

        Ok(LayerConfig {
            origin_root,
            cache_root,
            optimize,
        })
    }
}

fn validate_root(label: &str, path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(DebloatError::Config(format!("Missing {} root", label)));
    }

    let canonical = path.canonicalize().map_err(|e| {
        DebloatError::Config(format!(
            "Invalid {} root {}: {}",
            label,
            path.display(),
            e
        ))
    })?;

    if !canonical.is_dir() {
        return Err(DebloatError::Config(format!(
            "The {} root {} is not a directory",
            label,
            canonical.display()
        )));
    }

    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_valid_roots_are_canonicalized() {
        let temp_dir = tempfile::tempdir().unwrap();
        let lower = temp_dir.path().join("lower");
        let upper = temp_dir.path().join("upper");
        fs::create_dir(&lower).unwrap();
        fs::create_dir(&upper).unwrap();

        let config = LayerConfig::new(&lower.join("."), &upper, None).unwrap();
        assert_eq!(config.origin_root, lower.canonicalize().unwrap());
        assert_eq!(config.cache_root, upper.canonicalize().unwrap());
        assert!(config.optimize.is_none());
    }

    #[test]
    fn test_missing_root_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        let upper = temp_dir.path().join("upper");
        fs::create_dir(&upper).unwrap();

        let err = LayerConfig::new(&temp_dir.path().join("nope"), &upper, None).unwrap_err();
        assert!(err.to_string().contains("origin"));
    }

    #[test]
    fn test_empty_root_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(LayerConfig::new(Path::new(""), temp_dir.path(), None).is_err());
    }

    #[test]
    fn test_file_root_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        let lower = temp_dir.path().join("lower");
        let file = temp_dir.path().join("file");
        fs::create_dir(&lower).unwrap();
        fs::write(&file, "x").unwrap();

        let err = LayerConfig::new(&lower, &file, None).unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn test_overlapping_roots_fail() {
        let temp_dir = tempfile::tempdir().unwrap();
        let lower = temp_dir.path().join("lower");
        let nested = lower.join("cache");
        fs::create_dir_all(&nested).unwrap();

        assert!(LayerConfig::new(&lower, &lower, None).is_err());
        assert!(LayerConfig::new(&lower, &nested, None).is_err());
    }

    #[test]
    fn test_empty_optimize_hint_is_dropped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let lower = temp_dir.path().join("lower");
        let upper = temp_dir.path().join("upper");
        fs::create_dir(&lower).unwrap();
        fs::create_dir(&upper).unwrap();

        let config = LayerConfig::new(&lower, &upper, Some(String::new())).unwrap();
        assert!(config.optimize.is_none());

        let config = LayerConfig::new(&lower, &upper, Some("prefetch".to_string())).unwrap();
        assert_eq!(config.optimize.as_deref(), Some("prefetch"));
    }
}
