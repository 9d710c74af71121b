//! Rule management operations consumed by the dashboard/CLI collaborator.
//!
//! Every mutating operation ends with a full [`RuleEngine::reload`] so the
//! change takes effect immediately; failures are reported to the immediate
//! caller as [`RuleStoreError`] values and never panic.

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use crate::engine::RuleEngine;
use crate::loader::{ACTIVE_SUFFIX, DISABLED_SUFFIX, DYNAMIC_DIR};

#[derive(Debug, thiserror::Error)]
pub enum RuleStoreError {
    #[error("rule path escapes the rule root: {0:?}")]
    OutsideRoot(String),

    #[error("invalid rule name: {0:?}")]
    InvalidName(String),

    #[error("rule file not found: {0:?}")]
    NotFound(String),

    #[error("destination already exists: {0:?}")]
    AlreadyExists(String),

    #[error("not a rule file (expected the .rule or .rule.disabled suffix): {0:?}")]
    NotARule(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One entry in a rule listing, as presented to the management surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleListing {
    /// Path relative to the rule root, forward slashes.
    pub path: String,
    pub enabled: bool,
}

impl RuleEngine {
    /// Persist a new rule under `dynamic/<name>.rule` and reload.
    pub fn add_rule(&self, name: &str, content: &str) -> Result<(), RuleStoreError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return Err(RuleStoreError::InvalidName(name.to_string()));
        }
        let dir = self.root().join(DYNAMIC_DIR);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(format!("{name}{ACTIVE_SUFFIX}")), content)?;
        self.reload()?;
        Ok(())
    }

    /// Every rule file under the root, enabled or disabled, sorted by path.
    pub fn list_rules(&self) -> Result<Vec<RuleListing>, RuleStoreError> {
        let mut listings = Vec::new();
        list_walk(self.root(), self.root(), &mut listings)?;
        listings.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(listings)
    }

    /// Raw content of a rule file. The only management operation that does
    /// not trigger a reload.
    pub fn read_rule(&self, path: &str) -> Result<String, RuleStoreError> {
        let full = self.resolve(path)?;
        if !full.is_file() {
            return Err(RuleStoreError::NotFound(path.to_string()));
        }
        Ok(fs::read_to_string(full)?)
    }

    /// Overwrite (or create) a rule file and reload.
    pub fn save_rule(&self, path: &str, content: &str) -> Result<(), RuleStoreError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(full, content)?;
        self.reload()?;
        Ok(())
    }

    /// Flip a rule between the active and disabled suffixes and reload.
    pub fn toggle_rule(&self, path: &str) -> Result<(), RuleStoreError> {
        let renamed = if let Some(stem) = path.strip_suffix(DISABLED_SUFFIX) {
            format!("{stem}{ACTIVE_SUFFIX}")
        } else if path.ends_with(ACTIVE_SUFFIX) {
            format!("{path}.disabled")
        } else {
            return Err(RuleStoreError::NotARule(path.to_string()));
        };

        let from = self.resolve(path)?;
        if !from.is_file() {
            return Err(RuleStoreError::NotFound(path.to_string()));
        }
        fs::rename(from, self.resolve(&renamed)?)?;
        self.reload()?;
        Ok(())
    }

    /// Delete a rule file and reload.
    pub fn delete_rule(&self, path: &str) -> Result<(), RuleStoreError> {
        let full = self.resolve(path)?;
        if !full.is_file() {
            return Err(RuleStoreError::NotFound(path.to_string()));
        }
        fs::remove_file(full)?;
        self.reload()?;
        Ok(())
    }

    /// Move a rule file, creating destination directories, and reload.
    /// Refuses to overwrite an existing destination.
    pub fn rename_rule(&self, from: &str, to: &str) -> Result<(), RuleStoreError> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;

        if !src.is_file() {
            return Err(RuleStoreError::NotFound(from.to_string()));
        }
        if dst.exists() {
            return Err(RuleStoreError::AlreadyExists(to.to_string()));
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(src, dst)?;
        self.reload()?;
        Ok(())
    }

    /// Resolve a root-relative rule path, rejecting anything that could step
    /// outside the rule root.
    fn resolve(&self, path: &str) -> Result<PathBuf, RuleStoreError> {
        let rel = Path::new(path);
        let escapes = rel.is_absolute()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(RuleStoreError::OutsideRoot(path.to_string()));
        }
        Ok(self.root().join(rel))
    }
}

fn list_walk(
    root: &Path,
    dir: &Path,
    listings: &mut Vec<RuleListing>,
) -> Result<(), RuleStoreError> {
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            list_walk(root, &path, listings)?;
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let enabled = file_name.ends_with(ACTIVE_SUFFIX);
        if !enabled && !file_name.ends_with(DISABLED_SUFFIX) {
            continue;
        }
        let rel = path.strip_prefix(root).unwrap_or(&path);
        listings.push(RuleListing {
            path: rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            enabled,
        });
    }
    Ok(())
}
