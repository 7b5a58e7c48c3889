//! Resolution of dependency patterns to execute directories.
//!
//! A dependency is declared with a shell-style glob that names other tests by
//! execute directory. Patterns are resolved relative to the dependent test
//! first and widen in four tiers; the first tier that matches anything wins:
//!
//! | Tier | Pattern tried |
//! |------|---------------|
//! | 1 | `normpath(base/pattern)` |
//! | 2 | `base/*/pattern` |
//! | 3 | `pattern` |
//! | 4 | `*pattern` |
//!
//! where `base` is the directory part of the dependent's execute directory.
//! Globs use `fnmatch` semantics: `*` matches any run of characters,
//! including `/`.

use std::collections::BTreeSet;

use tracing::warn;

use crate::record::normpath;

/// Errors from compiling a dependency glob.
#[derive(Debug, thiserror::Error)]
pub enum GlobError {
    #[error("invalid glob: {0}")]
    InvalidGlob(#[from] globset::Error),

    #[error("glob does not compile to a regex: {0}")]
    Regex(String),
}

/// A compiled glob with `fnmatch`-style semantics.
///
/// `globset::GlobMatcher` treats paths specially, so the glob is compiled to
/// a plain regex instead.
#[derive(Debug, Clone)]
pub struct ShellGlob {
    pattern: String,
    regex: regex::bytes::Regex,
}

impl ShellGlob {
    pub fn new(pattern: &str) -> Result<Self, GlobError> {
        let glob = globset::GlobBuilder::new(pattern)
            .backslash_escape(false)
            .literal_separator(false)
            .build()?;
        let regex = regex::bytes::Regex::new(glob.regex())
            .map_err(|e| GlobError::Regex(e.to_string()))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn is_match(&self, s: &str) -> bool {
        self.regex.is_match(s.as_bytes())
    }
}

/// Finds the execute directories a dependency pattern refers to.
///
/// `xdir` is the execute directory of the test declaring the dependency and
/// `candidates` the execute directories of every known test. An invalid glob
/// matches nothing.
pub fn find_tests_by_execute_directory_match<'a, I>(
    xdir: &str,
    pattern: &str,
    candidates: I,
) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let candidates: Vec<&str> = candidates.into_iter().collect();

    let base = match xdir.rfind('/') {
        Some(idx) => &xdir[..idx],
        None => "",
    };
    let base = if base.is_empty() || base == "." {
        String::new()
    } else {
        format!("{}/", base)
    };

    let tiers = [
        normpath(&format!("{}{}", base, pattern)),
        format!("{}*/{}", base, pattern),
        pattern.to_string(),
        format!("*{}", pattern),
    ];

    for tier in &tiers {
        let glob = match ShellGlob::new(tier) {
            Ok(glob) => glob,
            Err(e) => {
                warn!("invalid dependency pattern '{}': {}", tier, e);
                return BTreeSet::new();
            }
        };
        let found: BTreeSet<String> = candidates
            .iter()
            .filter(|c| glob.is_match(c))
            .map(|c| c.to_string())
            .collect();
        if !found.is_empty() {
            return found;
        }
    }

    BTreeSet::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(xdir: &str, pattern: &str, all: &[&str]) -> Vec<String> {
        find_tests_by_execute_directory_match(xdir, pattern, all.iter().copied())
            .into_iter()
            .collect()
    }

    #[test]
    fn test_glob_star_crosses_separator() {
        let glob = ShellGlob::new("a*z").unwrap();
        assert!(glob.is_match("a/b/z"));
        assert!(glob.is_match("az"));
        assert!(!glob.is_match("a/b/zz/x"));
    }

    #[test]
    fn test_tier_one_sibling_wins() {
        let all = ["sub/A", "sub/deep/A", "other/A", "A"];
        assert_eq!(matches("sub/B", "A", &all), vec!["sub/A"]);
    }

    #[test]
    fn test_tier_one_relative_path() {
        let all = ["sub/A", "other/A"];
        assert_eq!(matches("sub/B", "../other/A", &all), vec!["other/A"]);
    }

    #[test]
    fn test_tier_two_one_level_down() {
        let all = ["sub/deep/A", "sub/deeper/A", "other/A"];
        assert_eq!(
            matches("sub/B", "A", &all),
            vec!["sub/deep/A", "sub/deeper/A"]
        );
    }

    #[test]
    fn test_tier_three_absolute_pattern() {
        let all = ["other/A", "third/A"];
        assert_eq!(matches("sub/B", "other/A", &all), vec!["other/A"]);
    }

    #[test]
    fn test_tier_four_suffix() {
        let all = ["x/y/other/A", "unrelated"];
        assert_eq!(matches("sub/B", "other/A", &all), vec!["x/y/other/A"]);
    }

    #[test]
    fn test_top_level_dependent() {
        // A dependent without a directory component has an empty base.
        let all = ["A", "sub/A"];
        assert_eq!(matches("B", "A", &all), vec!["A"]);
        assert_eq!(matches("B", "A*", &all), vec!["A"]);
    }

    #[test]
    fn test_glob_in_pattern() {
        let all = ["sub/gen.np=1", "sub/gen.np=4", "sub/other"];
        assert_eq!(
            matches("sub/analyze", "gen*", &all),
            vec!["sub/gen.np=1", "sub/gen.np=4"]
        );
    }

    #[test]
    fn test_no_match() {
        assert!(matches("sub/B", "missing", &["sub/A"]).is_empty());
    }
}
