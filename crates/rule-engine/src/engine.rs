use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use http_assembler::Request;

use crate::action::{Action, Verdict};
use crate::eval::{self, RuleVerdict};
use crate::loader::{self, Rule, RuleScope};

/// An immutable snapshot of the active rules.
///
/// Evaluation always runs against one snapshot; a concurrent reload installs
/// a fresh one without touching rules already being read.
#[derive(Debug)]
pub struct RuleSet {
    /// Incremented on every reload.
    pub generation: u64,
    /// Active rules, ordered by relative path.
    pub rules: Vec<Rule>,
}

/// The policy engine: owns the rule root and the active snapshot.
///
/// One engine instance is shared (behind `Arc`) between the relay and the
/// management surface; reload is explicit and thread-safe.
pub struct RuleEngine {
    root: PathBuf,
    snapshot: RwLock<Arc<RuleSet>>,
    generation: AtomicU64,
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("RuleEngine")
            .field("root", &self.root)
            .field("generation", &snapshot.generation)
            .field("num_rules", &snapshot.rules.len())
            .finish()
    }
}

impl RuleEngine {
    /// Create an engine with an empty snapshot. Call [`reload`](Self::reload)
    /// to scan the rule root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            snapshot: RwLock::new(Arc::new(RuleSet {
                generation: 0,
                rules: Vec::new(),
            })),
            generation: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Discard the current snapshot, rescan the rule root, and install the
    /// result atomically. Rules that fail to compile are logged and excluded;
    /// only a filesystem failure on the tree itself makes the reload fail.
    ///
    /// Returns the number of active rules installed.
    pub fn reload(&self) -> std::io::Result<usize> {
        // Scanning and compiling happen outside the lock; the write lock is
        // held only for the pointer swap.
        let rules = loader::scan(&self.root)?;
        let count = rules.len();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let set = Arc::new(RuleSet { generation, rules });

        *self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = set;

        tracing::info!(count, generation, root = %self.root.display(), "rule set reloaded");
        Ok(count)
    }

    /// The current snapshot. Holding the returned `Arc` keeps it alive across
    /// any number of concurrent reloads.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Evaluate a request against every applicable rule and merge the
    /// verdicts.
    ///
    /// Rules scoped to a port other than the request's destination are
    /// skipped. Within each scope a single accept is final and cannot be
    /// reverted by a later drop, so file order never changes the outcome.
    /// The service scope has the final say over global, and absent any drop
    /// the request passes (fail-open). Tags accumulate from every rule that
    /// ran, whether or not its verdict won.
    pub fn evaluate(&self, request: &Request) -> Action {
        let snapshot = self.snapshot();

        let mut service: Option<RuleVerdict> = None;
        let mut global: Option<RuleVerdict> = None;
        let mut tags = BTreeSet::new();

        for rule in &snapshot.rules {
            if let RuleScope::Service(port) = rule.scope {
                if port != request.destination_port {
                    continue;
                }
            }

            let outcome = match eval::run(&rule.program, request, &rule.name) {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(rule = %rule.path, %err, "rule evaluation failed; skipping its contribution");
                    continue;
                }
            };

            tags.extend(outcome.tags);

            let slot = match rule.scope {
                RuleScope::Service(_) => &mut service,
                RuleScope::Global => &mut global,
            };
            match outcome.verdict {
                Some(RuleVerdict::Accept) => *slot = Some(RuleVerdict::Accept),
                Some(RuleVerdict::Drop) => {
                    if *slot != Some(RuleVerdict::Accept) {
                        *slot = Some(RuleVerdict::Drop);
                    }
                }
                None => {}
            }
        }

        let verdict = match (service, global) {
            (Some(RuleVerdict::Accept), _) => Verdict::Accept,
            (Some(RuleVerdict::Drop), _) => Verdict::Drop,
            (None, Some(RuleVerdict::Drop)) => Verdict::Drop,
            _ => Verdict::Accept,
        };

        Action { verdict, tags }
    }
}
