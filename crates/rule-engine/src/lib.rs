//! # rule-engine
//!
//! Policy evaluation for the portcullis firewall. This crate loads rule
//! scripts from a directory tree, compiles them into ASTs, and evaluates
//! reconstructed requests against the active set under a fixed precedence
//! model: within a scope a single accept is final; the service scope (rules
//! under `services/<port>/`) overrides the global scope; with no drop
//! anywhere, traffic passes.
//!
//! Rules are plain files named `<name>.rule`; renaming to `<name>.rule.disabled`
//! removes a rule from the active set without deleting it. The `dynamic/`
//! subdirectory receives rules added at runtime. The whole set is reloaded as
//! an atomic snapshot, so in-flight evaluations never observe a half-built
//! rule list.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use rule_engine::RuleEngine;
//!
//! # fn example(request: &http_assembler::Request) -> std::io::Result<()> {
//! let engine = RuleEngine::new("rules");
//! engine.reload()?;
//! let action = engine.evaluate(request);
//! println!("{:?} {:?}", action.verdict, action.tags);
//! # Ok(())
//! # }
//! ```

mod action;
mod engine;
mod eval;
mod loader;
pub mod script;
mod store;

// Re-export primary public API at the crate root.
pub use action::{Action, Verdict};
pub use engine::{RuleEngine, RuleSet};
pub use eval::EvalError;
pub use loader::{ACTIVE_SUFFIX, DISABLED_SUFFIX, DYNAMIC_DIR, Rule, RuleScope};
pub use script::{Program, ScriptError};
pub use store::{RuleListing, RuleStoreError};
