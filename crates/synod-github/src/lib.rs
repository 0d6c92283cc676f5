//! GitHub boundary: API client, comment rendering, fix-branch push.
//!
//! Everything that talks to GitHub lives here: reading PR metadata, files,
//! and diffs; posting idempotent review comments and check runs; and turning
//! validated patches into a pushed fix branch plus a fix PR.

pub mod client;
pub mod comment;
pub mod push;

pub use client::{parse_pr_reference, GitHubClient, PrSummary};
pub use comment::{
    check_conclusion, idempotency_marker, render_degraded_comment, render_failure_comment,
    render_review_comment,
};
pub use push::{commit_and_push_fixes, fix_branch_name};
