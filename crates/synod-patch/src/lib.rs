//! Patch generation and sandboxed validation.
//!
//! Provides the refactoring and testing stages: selecting fixable findings,
//! asking a model for bounded unified diffs, parsing and applying those
//! diffs with full context verification, and running the project's test
//! suite against each candidate patch in a throwaway workspace.

pub mod diff;
pub mod generate;
pub mod sandbox;

pub use diff::{apply_file_diff, parse_unified_diff, FileDiff};
pub use generate::RefactorAgent;
pub use sandbox::{detect_test_command, TestRunner, Workspace};
