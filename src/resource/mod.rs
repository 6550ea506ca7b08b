// Module: Resource
// Path resolution and file access for features, config scripts and read().

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::errors::{EngineError, Result};

/// A call/read target with its suffixes split off:
/// `file.feature:10`, `file.feature@tag`, `file.feature?suffix`, `@tag`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallTarget {
    pub path: String,
    pub tag: Option<String>,
    pub lines: Vec<usize>,
    /// `?suffix` differentiates cache entries without changing the read path.
    pub cache_suffix: Option<String>,
}

impl CallTarget {
    /// Whether the target addresses the current feature (`@tag` alone).
    pub fn is_current_feature(&self) -> bool {
        self.path.is_empty()
    }

    /// The cache key: the full original target including any `?suffix`.
    pub fn cache_key(&self) -> String {
        let mut key = self.path.clone();
        if let Some(tag) = &self.tag {
            key.push('@');
            key.push_str(tag);
        }
        if let Some(suffix) = &self.cache_suffix {
            key.push('?');
            key.push_str(suffix);
        }
        key
    }
}

pub fn parse_call_target(raw: &str) -> CallTarget {
    let mut rest = raw.trim().to_string();

    let cache_suffix = match rest.split_once('?') {
        Some((path, suffix)) => {
            let suffix = suffix.to_string();
            rest = path.to_string();
            Some(suffix)
        }
        None => None,
    };

    let tag = match rest.split_once('@') {
        Some((path, tag)) => {
            let tag = tag.to_string();
            rest = path.to_string();
            Some(tag)
        }
        None => None,
    };

    // trailing :line filters; ignore drive-letter-free schemes by only
    // accepting numeric segments
    let mut lines = Vec::new();
    loop {
        match rest.rsplit_once(':') {
            Some((head, candidate)) if candidate.chars().all(|c| c.is_ascii_digit())
                && !candidate.is_empty() =>
            {
                lines.push(candidate.parse().unwrap_or(0));
                rest = head.to_string();
            }
            _ => break,
        }
    }
    lines.reverse();

    CallTarget {
        path: rest,
        tag,
        lines,
        cache_suffix,
    }
}

/// Resolves a read/call path. `classpath:` anchors at the suite root,
/// absolute paths pass through, everything else is relative to the current
/// feature's directory with the suite root as fallback.
pub fn resolve(suite_root: &Path, feature_dir: Option<&Path>, path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("classpath:") {
        return suite_root.join(rest);
    }
    if let Some(rest) = path.strip_prefix("file:") {
        return PathBuf::from(rest);
    }
    let candidate = PathBuf::from(path);
    if candidate.is_absolute() {
        return candidate;
    }
    if let Some(dir) = feature_dir {
        let relative = dir.join(path);
        if relative.exists() {
            return relative;
        }
    }
    suite_root.join(path)
}

pub fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| EngineError::io(format!("failed to read {}: {}", path.display(), e)))
}

pub fn last_modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_path_has_no_selectors() {
        let target = parse_call_target("users/get.feature");
        assert_eq!(target.path, "users/get.feature");
        assert!(target.tag.is_none());
        assert!(target.lines.is_empty());
        assert!(target.cache_suffix.is_none());
    }

    #[test]
    fn line_suffixes_parse_in_order() {
        let target = parse_call_target("file.feature:10:15");
        assert_eq!(target.path, "file.feature");
        assert_eq!(target.lines, vec![10, 15]);
    }

    #[test]
    fn tag_selector_splits_off() {
        let target = parse_call_target("auth.feature@name=token");
        assert_eq!(target.path, "auth.feature");
        assert_eq!(target.tag.as_deref(), Some("name=token"));
    }

    #[test]
    fn bare_tag_targets_the_current_feature() {
        let target = parse_call_target("@setup-users");
        assert!(target.is_current_feature());
        assert_eq!(target.tag.as_deref(), Some("setup-users"));
    }

    #[test]
    fn cache_suffix_survives_into_the_key_only() {
        let target = parse_call_target("token.feature?dev");
        assert_eq!(target.path, "token.feature");
        assert_eq!(target.cache_suffix.as_deref(), Some("dev"));
        assert_eq!(target.cache_key(), "token.feature?dev");
    }

    #[test]
    fn classpath_prefix_anchors_at_the_suite_root() {
        let resolved = resolve(
            Path::new("/suite"),
            Some(Path::new("/suite/features/auth")),
            "classpath:common/token.feature",
        );
        assert_eq!(resolved, PathBuf::from("/suite/common/token.feature"));
    }

    #[test]
    fn relative_paths_fall_back_to_the_suite_root() {
        let resolved = resolve(Path::new("/suite"), None, "users.feature");
        assert_eq!(resolved, PathBuf::from("/suite/users.feature"));
    }
}
