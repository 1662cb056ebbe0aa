//! Rule evaluation.
//!
//! An item is evaluated against ordered [`Run`]s. Each Run holds ordered
//! [`Check`]s; a Check combines [`Rule`]s and [`RuleSet`]s with AND/OR and,
//! when triggered, executes its [`Action`]s. Control flow between Checks and
//! Runs follows each one's [`PostBehavior`], including bounded `goto` jumps.

pub mod behavior;
pub mod cache;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod result;
pub mod types;

pub use behavior::{GotoTarget, PostBehavior};
pub use cache::RuleResultCache;
pub use engine::{RuleEngine, RuleOutcome};
pub use error::EvaluationError;
pub use evaluator::{DEFAULT_MAX_GOTO_DEPTH, Evaluation, EvaluationContext, RunEvaluator};
pub use result::{ActionRecord, CheckOutcome, RuleResult, RunOutcome, RunResult};
pub use types::{
    Action, Check, Condition, DispatchAction, Rule, RuleNode, RuleSet, Run, resolve_target,
};
