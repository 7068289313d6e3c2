//! Exclude-pattern matching for sync walks.
//!
//! Patterns behave the way people expect from ignore files without being
//! gitignore: `vendor` excludes any `vendor` segment, `logs/` is the same
//! as `logs`, `*.pyc` excludes by extension at any depth, `build/**`
//! excludes a subtree, `src/**/*.pb.go` excludes by suffix under a
//! prefix. A path is excluded when any pattern matches.

use globset::GlobBuilder;

/// An ordered list of exclude patterns.
#[derive(Debug, Clone, Default)]
pub struct ExcludeMatcher {
    patterns: Vec<String>,
}

impl ExcludeMatcher {
    #[must_use]
    pub fn new(patterns: &[String]) -> Self {
        Self {
            patterns: patterns.to_vec(),
        }
    }

    /// Whether `rel_path` (root-relative, forward slashes) is excluded.
    #[must_use]
    pub fn is_match(&self, rel_path: &str) -> bool {
        self.patterns
            .iter()
            .any(|pat| match_pattern(pat, rel_path))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

fn match_pattern(pattern: &str, rel_path: &str) -> bool {
    let pattern = pattern.strip_suffix('/').unwrap_or(pattern);
    if pattern.contains('/') {
        return match_path_pattern(pattern, rel_path);
    }
    if rel_path.split('/').any(|part| glob_match(pattern, part)) {
        return true;
    }
    if pattern.contains("**") {
        return match_doublestar(pattern, rel_path);
    }
    false
}

fn match_path_pattern(pattern: &str, rel_path: &str) -> bool {
    if pattern.contains("**") {
        return match_doublestar(pattern, rel_path);
    }
    glob_match(pattern, rel_path)
}

/// `prefix/**/suffix`: the path must sit under `prefix` (or equal it) and
/// some tail of the remainder must glob-match `suffix`. `**` alone
/// matches anything.
fn match_doublestar(pattern: &str, rel_path: &str) -> bool {
    let Some((raw_prefix, raw_suffix)) = split_once_doublestar(pattern) else {
        return false;
    };
    let prefix = raw_prefix.strip_suffix('/').unwrap_or(raw_prefix);
    let suffix = raw_suffix.strip_prefix('/').unwrap_or(raw_suffix);

    match (prefix.is_empty(), suffix.is_empty()) {
        (true, true) => true,
        (true, false) => match_suffix(suffix, rel_path),
        (false, true) => rel_path.starts_with(&format!("{prefix}/")) || rel_path == prefix,
        (false, false) => match rel_path.strip_prefix(&format!("{prefix}/")) {
            Some(rest) => match_suffix(suffix, rest),
            None => false,
        },
    }
}

fn split_once_doublestar(pattern: &str) -> Option<(&str, &str)> {
    let (prefix, suffix) = pattern.split_once("**")?;
    // More than one `**` is not a shape we accept.
    if suffix.contains("**") {
        return None;
    }
    Some((prefix, suffix))
}

fn match_suffix(suffix: &str, rel_path: &str) -> bool {
    let parts: Vec<&str> = rel_path.split('/').collect();
    (0..parts.len()).any(|i| glob_match(suffix, &parts[i..].join("/")))
}

/// Glob with `*`/`?`/`[...]` where `*` never crosses a path separator.
/// A malformed pattern matches nothing.
fn glob_match(pattern: &str, text: &str) -> bool {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|g| g.compile_matcher().is_match(text))
        .unwrap_or(false)
}
