//! Static analysis stage: linter invocation and output normalization.
//!
//! Given the changed files of a pull request (hydrated with head-commit
//! content), the [`AnalysisAgent`] picks a linter per file extension, runs
//! the tools concurrently with bounded timeouts, and normalizes their
//! native output into canonical [`synod_core::Finding`]s. A tool that is
//! missing, times out, or emits unparseable output degrades to a single
//! synthetic warning finding; the stage itself only fails on
//! infrastructure errors.

pub mod parse;
mod runner;

pub use runner::{AnalysisAgent, LintTool};
