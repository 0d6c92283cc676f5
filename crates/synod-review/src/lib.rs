//! Multi-model AI review with consensus.
//!
//! Provides the reviewer stage: per-model chat completion clients, prompt
//! construction, lenient response parsing, and the clustering algorithm
//! that merges independent model opinions into one [`ConsensusReview`]
//! with agreement counts and an overall verdict.
//!
//! [`ConsensusReview`]: synod_core::ConsensusReview

pub mod client;
pub mod consensus;
pub mod prompt;

pub use client::{ModelBackend, ModelClient};
pub use consensus::{build_consensus, ReviewAgent};
