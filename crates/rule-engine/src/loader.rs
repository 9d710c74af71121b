use std::fs;
use std::path::Path;

use crate::script::{self, Program};

/// Suffix a file must carry to be loaded as an active rule.
pub const ACTIVE_SUFFIX: &str = ".rule";
/// Suffix of a rule that exists on disk but is excluded from the active set.
pub const DISABLED_SUFFIX: &str = ".rule.disabled";
/// Subdirectory that receives rules added at runtime; always present.
pub const DYNAMIC_DIR: &str = "dynamic";

/// Whether a rule applies to one destination port or to all traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    Global,
    Service(u16),
}

/// A compiled, active rule.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Identity: path relative to the rule root, with forward slashes.
    pub path: String,
    /// File stem; doubles as the automatic tag when the rule drops a request.
    pub name: String,
    pub scope: RuleScope,
    pub(crate) program: Program,
}

#[derive(Debug, thiserror::Error)]
enum LoadError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Script(#[from] script::ScriptError),
}

/// Recursively scan the rule tree and compile every active rule file.
///
/// A file that fails to read or compile is logged and excluded; the scan
/// itself only fails on filesystem errors for the tree as a whole. The
/// `dynamic/` subdirectory is created if absent.
pub(crate) fn scan(root: &Path) -> std::io::Result<Vec<Rule>> {
    fs::create_dir_all(root.join(DYNAMIC_DIR))?;

    let mut rules = Vec::new();
    walk(root, root, &mut rules)?;
    rules.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(rules)
}

fn walk(root: &Path, dir: &Path, rules: &mut Vec<Rule>) -> std::io::Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, rules)?;
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !file_name.ends_with(ACTIVE_SUFFIX) {
            continue;
        }
        match load_rule(root, &path, file_name) {
            Ok(rule) => rules.push(rule),
            Err(err) => {
                tracing::error!(path = %path.display(), %err, "failed to load rule; excluding it");
            }
        }
    }
    Ok(())
}

fn load_rule(root: &Path, path: &Path, file_name: &str) -> Result<Rule, LoadError> {
    let source = fs::read_to_string(path)?;
    let program = script::parse(&source)?;

    let rel = path.strip_prefix(root).unwrap_or(path);
    let rel_path = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let name = file_name
        .strip_suffix(ACTIVE_SUFFIX)
        .unwrap_or(file_name)
        .to_string();

    Ok(Rule {
        path: rel_path,
        name,
        scope: scope_of(rel),
        program,
    })
}

/// Derive a rule's scope from its location: `services/<port>/...` scopes it
/// to that port, anything else (including an unparseable port segment) is
/// global.
fn scope_of(rel: &Path) -> RuleScope {
    let mut parts = rel.components();
    if parts.next().is_some_and(|c| c.as_os_str() == "services") {
        if let Some(second) = parts.next() {
            if let Ok(port) = second.as_os_str().to_string_lossy().parse::<u16>() {
                return RuleScope::Service(port);
            }
        }
    }
    RuleScope::Global
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_from_services_subtree() {
        assert_eq!(
            scope_of(Path::new("services/8080/allow.rule")),
            RuleScope::Service(8080)
        );
        assert_eq!(
            scope_of(Path::new("services/8080/deep/nested.rule")),
            RuleScope::Service(8080)
        );
    }

    #[test]
    fn everything_else_is_global() {
        assert_eq!(scope_of(Path::new("drop_all.rule")), RuleScope::Global);
        assert_eq!(scope_of(Path::new("global/drop_all.rule")), RuleScope::Global);
        assert_eq!(scope_of(Path::new("dynamic/block_ip.rule")), RuleScope::Global);
        // A services entry without a numeric port falls back to global.
        assert_eq!(scope_of(Path::new("services/web/x.rule")), RuleScope::Global);
        assert_eq!(scope_of(Path::new("services/x.rule")), RuleScope::Global);
    }
}
