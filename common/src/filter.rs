//! Regular-expression key filtering for include/exclude lists
//!
//! A pattern matches a key when it matches anywhere inside it (unanchored search); use `^` and
//! `$` to anchor. Excludes are checked first and always win. When include patterns exist, a key
//! must match at least one of them.
//!
//! # Examples
//!
//! ```
//! use common::filter::{FilterResult, FilterSettings};
//!
//! let mut settings = FilterSettings::default();
//! settings.add_include("[a|b].*").unwrap();
//! settings.add_exclude("ab.*").unwrap();
//!
//! assert!(matches!(settings.should_include("abc"), FilterResult::ExcludedByPattern(_)));
//! assert!(matches!(settings.should_include("a"), FilterResult::Included));
//! assert!(matches!(settings.should_include("zzz"), FilterResult::ExcludedByDefault));
//! ```

use anyhow::{Context, anyhow};

/// A compiled filter pattern with its original form
#[derive(Debug, Clone)]
pub struct FilterPattern {
    /// original pattern string for log output
    pub original: String,
    regex: regex::Regex,
}

impl FilterPattern {
    pub fn parse(pattern: &str) -> Result<Self, anyhow::Error> {
        if pattern.is_empty() {
            return Err(anyhow!("empty pattern is not allowed"));
        }
        let regex = regex::Regex::new(pattern)
            .with_context(|| format!("invalid regular expression {pattern:?}"))?;
        Ok(Self {
            original: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }
}

/// Result of checking whether a key should be synced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterResult {
    Included,
    /// include patterns exist but none matched
    ExcludedByDefault,
    ExcludedByPattern(String),
}

impl FilterResult {
    pub fn is_included(&self) -> bool {
        matches!(self, FilterResult::Included)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilterSettings {
    pub includes: Vec<FilterPattern>,
    pub excludes: Vec<FilterPattern>,
}

impl FilterSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_include(&mut self, pattern: &str) -> Result<(), anyhow::Error> {
        self.includes.push(FilterPattern::parse(pattern)?);
        Ok(())
    }

    pub fn add_exclude(&mut self, pattern: &str) -> Result<(), anyhow::Error> {
        self.excludes.push(FilterPattern::parse(pattern)?);
        Ok(())
    }

    /// Build settings from the raw `--include` and `--exclude` values.
    pub fn from_patterns(includes: &[String], excludes: &[String]) -> Result<Self, anyhow::Error> {
        let mut settings = Self::new();
        for pattern in includes {
            settings.add_include(pattern)?;
        }
        for pattern in excludes {
            settings.add_exclude(pattern)?;
        }
        Ok(settings)
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty()
    }

    pub fn should_include(&self, key: &str) -> FilterResult {
        // check excludes first - if matched, key is excluded
        for pattern in &self.excludes {
            if pattern.matches(key) {
                return FilterResult::ExcludedByPattern(pattern.original.clone());
            }
        }
        if !self.includes.is_empty() {
            if self.includes.iter().any(|pattern| pattern.matches(key)) {
                return FilterResult::Included;
            }
            return FilterResult::ExcludedByDefault;
        }
        FilterResult::Included
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclude_wins_over_include() {
        let settings =
            FilterSettings::from_patterns(&["[a|b].*".to_string()], &["ab.*".to_string()]).unwrap();
        assert_eq!(
            settings.should_include("abc"),
            FilterResult::ExcludedByPattern("ab.*".to_string())
        );
        assert!(settings.should_include("a").is_included());
        assert!(settings.should_include("b").is_included());
    }

    #[test]
    fn test_include_only_mode() {
        let mut settings = FilterSettings::new();
        settings.add_include(r"\.parquet$").unwrap();
        assert!(settings.should_include("data/part-0.parquet").is_included());
        assert_eq!(
            settings.should_include("data/_SUCCESS"),
            FilterResult::ExcludedByDefault
        );
    }

    #[test]
    fn test_exclude_only_mode() {
        let mut settings = FilterSettings::new();
        settings.add_exclude("^tmp/").unwrap();
        assert!(!settings.should_include("tmp/a").is_included());
        assert!(settings.should_include("data/tmp/a").is_included());
    }

    #[test]
    fn test_empty_settings_include_everything() {
        let settings = FilterSettings::new();
        assert!(settings.is_empty());
        assert!(settings.should_include("anything").is_included());
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        let mut settings = FilterSettings::new();
        assert!(settings.add_exclude("(unclosed").is_err());
        assert!(settings.add_include("").is_err());
    }
}
