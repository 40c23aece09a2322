//! Contract consumed from the version-management side of the launcher.
//!
//! The git upgrade workflow lives elsewhere; the process core only needs to
//! know which git binary is in use and how proxy URLs are formed.

use std::path::PathBuf;

use crate::config::ConfigStore;

pub trait VersionControl: Send + Sync {
    /// Resolved git executable, if one is configured or discoverable.
    fn git_executable(&self) -> Option<PathBuf>;

    /// Whether the system-default git (plain `git` on PATH) is in use.
    fn uses_default_git(&self) -> bool;

    /// Rewrite `upstream` behind a proxy `base`, e.g. `https://proxy/` + `https://github.com`.
    fn rewrite_url(&self, base: &str, upstream: &str) -> String {
        proxied_url(base, upstream)
    }
}

pub fn proxied_url(base: &str, upstream: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{upstream}")
    } else {
        format!("{base}/{upstream}")
    }
}

/// Git settings read from `paths.git_path`; empty means the system git.
pub struct ConfiguredGit {
    git_path: String,
}

impl ConfiguredGit {
    pub fn from_config(config: &ConfigStore) -> Self {
        Self {
            git_path: config.get_str("paths.git_path", "").trim().to_string(),
        }
    }
}

impl VersionControl for ConfiguredGit {
    fn git_executable(&self) -> Option<PathBuf> {
        if self.git_path.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.git_path))
        }
    }

    fn uses_default_git(&self) -> bool {
        self.git_path.is_empty() || self.git_path == "git"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_ensured_once() {
        assert_eq!(
            proxied_url("https://gh-proxy.com", "https://github.com"),
            "https://gh-proxy.com/https://github.com"
        );
        assert_eq!(
            proxied_url("https://gh-proxy.com/", "https://github.com"),
            "https://gh-proxy.com/https://github.com"
        );
    }

    #[test]
    fn plain_git_counts_as_default() {
        let git = ConfiguredGit {
            git_path: "git".into(),
        };
        assert!(git.uses_default_git());
        let git = ConfiguredGit {
            git_path: "/opt/git/bin/git".into(),
        };
        assert!(!git.uses_default_git());
        assert_eq!(git.git_executable(), Some(PathBuf::from("/opt/git/bin/git")));
    }
}
