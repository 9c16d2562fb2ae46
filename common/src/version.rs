//! Version of the worker agent, compared by the manager before it reuses a deployed binary.

use serde::{Deserialize, Serialize};

/// Version information printed by `objsync --protocol-version`.
///
/// Managers and workers exchange work items and counters as JSON, so only the semantic
/// version takes part in compatibility checks; git information is for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolVersion {
    /// Package version, e.g. "0.4.0"
    pub semantic: String,
    /// `git describe` of the build, e.g. "v0.4.0-3-g1a2b3c4"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_describe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_hash: Option<String>,
}

impl ProtocolVersion {
    /// Version of the running binary, git fields are set by build.rs when git was available.
    pub fn current() -> Self {
        Self {
            semantic: env!("CARGO_PKG_VERSION").to_string(),
            git_describe: option_env!("OBJSYNC_GIT_DESCRIBE").map(String::from),
            git_hash: option_env!("OBJSYNC_GIT_HASH").map(String::from),
        }
    }

    /// Exact match of the semantic version.
    ///
    /// ```
    /// use common::version::ProtocolVersion;
    ///
    /// let ours = ProtocolVersion::current();
    /// let mut theirs = ours.clone();
    /// theirs.git_hash = Some("0123abc".to_string());
    /// assert!(ours.is_compatible_with(&theirs));
    /// theirs.semantic = "0.0.0-old".to_string();
    /// assert!(!ours.is_compatible_with(&theirs));
    /// ```
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.semantic == other.semantic
    }

    /// File name of this version in a host's agent cache.
    pub fn install_name(&self) -> String {
        format!("objsync-{}", self.semantic)
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(self)
            .map_err(|e| anyhow::anyhow!("failed to serialize version: {:#}", e))
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json.trim())
            .map_err(|e| anyhow::anyhow!("failed to parse version JSON {json:?}: {:#}", e))
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.git_describe {
            Some(describe) => write!(f, "{} ({})", self.semantic, describe),
            None => write!(f, "{}", self.semantic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(semantic: &str, describe: Option<&str>) -> ProtocolVersion {
        ProtocolVersion {
            semantic: semantic.to_string(),
            git_describe: describe.map(String::from),
            git_hash: None,
        }
    }

    #[test]
    fn current_version_matches_package() {
        let current = ProtocolVersion::current();
        assert_eq!(current.semantic, env!("CARGO_PKG_VERSION"));
        assert_eq!(current.install_name(), format!("objsync-{}", current.semantic));
    }

    #[test]
    fn display_includes_describe() {
        assert_eq!(version("0.4.0", None).to_string(), "0.4.0");
        assert_eq!(
            version("0.4.0", Some("v0.4.0-3-g1a2b3c4")).to_string(),
            "0.4.0 (v0.4.0-3-g1a2b3c4)"
        );
    }

    #[test]
    fn parses_output_of_older_builds() -> anyhow::Result<()> {
        let parsed = ProtocolVersion::from_json("{\"semantic\":\"0.3.1\"}\n")?;
        assert_eq!(parsed, version("0.3.1", None));
        assert!(!parsed.is_compatible_with(&version("0.4.0", None)));
        let round = ProtocolVersion::from_json(&version("0.4.0", Some("x")).to_json()?)?;
        assert_eq!(round, version("0.4.0", Some("x")));
        Ok(())
    }
}
