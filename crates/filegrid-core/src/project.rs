//! Per-project limits.

use std::path::Path;

use crate::config::FilegridConfig;
use crate::types::{is_within, normalize_path};

/// Supplies project-level limits for a path.
pub trait ProjectConfigProvider: Send + Sync {
    /// Maximum size in bytes a file under this path may have.
    fn max_file_size(&self, path: &Path) -> u64;
}

/// Fixed limits with optional per-root overrides. The longest matching
/// root wins.
#[derive(Debug, Clone)]
pub struct StaticProjectConfig {
    default_max_file_size: u64,
    overrides: Vec<(String, u64)>,
}

impl StaticProjectConfig {
    /// Apply `max_file_size` to every path.
    pub fn new(max_file_size: u64) -> Self {
        Self {
            default_max_file_size: max_file_size,
            overrides: Vec::new(),
        }
    }

    /// Build from the `[scheduler]` limit and the `[[project]]` overrides.
    pub fn from_config(config: &FilegridConfig) -> Self {
        let default_max = config.max_file_size();
        let mut this = Self::new(default_max);
        for project in &config.projects {
            this = this.with_project(&project.root, project.max_file_size.unwrap_or(default_max));
        }
        this
    }

    /// Override the limit for paths under `root`.
    pub fn with_project(mut self, root: &Path, max_file_size: u64) -> Self {
        self.overrides.push((normalize_path(root), max_file_size));
        self
    }
}

impl ProjectConfigProvider for StaticProjectConfig {
    fn max_file_size(&self, path: &Path) -> u64 {
        let path = normalize_path(path);
        self.overrides
            .iter()
            .filter(|(root, _)| is_within(&path, root))
            .max_by_key(|(root, _)| root.len())
            .map(|(_, max)| *max)
            .unwrap_or(self.default_max_file_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limit_applies_outside_overrides() {
        let config = StaticProjectConfig::new(100).with_project(Path::new("/repo/vendor"), 10);
        assert_eq!(config.max_file_size(Path::new("/repo/src/a.js")), 100);
        assert_eq!(config.max_file_size(Path::new("/repo/vendor/b.js")), 10);
    }

    #[test]
    fn longest_root_wins() {
        let config = StaticProjectConfig::new(100)
            .with_project(Path::new("/repo"), 50)
            .with_project(Path::new("/repo/pkg/inner"), 5);
        assert_eq!(config.max_file_size(Path::new("/repo/pkg/inner/x.js")), 5);
        assert_eq!(config.max_file_size(Path::new("/repo/pkg/x.js")), 50);
    }

    #[test]
    fn from_config_reads_overrides() {
        let config: FilegridConfig = toml::from_str(
            "[scheduler]\nmax_file_size = 7\n[[project]]\nroot = \"/a\"\nmax_file_size = 3\n[[project]]\nroot = \"/b\"\n",
        )
        .unwrap();
        let projects = StaticProjectConfig::from_config(&config);
        assert_eq!(projects.max_file_size(Path::new("/a/f")), 3);
        assert_eq!(projects.max_file_size(Path::new("/b/f")), 7);
        assert_eq!(projects.max_file_size(Path::new("/c/f")), 7);
    }
}
