//! The synod server: webhook intake, job scheduling, and the pipeline
//! orchestrator.
//!
//! A delivery enters through [`intake`], which verifies the HMAC signature
//! and normalizes the event. The [`Scheduler`] deduplicates it against the
//! active job for the pull request and enqueues a [`ReviewJob`] in the
//! [`JobStore`]. Workers pull job ids off the queue and hand them to the
//! [`Orchestrator`], which drives the staged pipeline against a
//! [`ReviewGateway`] — the single seam to GitHub and git, swapped out for
//! scripted gateways in tests.
//!
//! [`ReviewJob`]: synod_core::ReviewJob

pub mod gateway;
pub mod intake;
pub mod orchestrator;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use gateway::{GithubGateway, ReviewGateway};
pub use intake::{
    normalize_event, router, serve, verify_signature, AppState, IntakeDecision, IntakeRejection,
    NormalizedEvent,
};
pub use orchestrator::Orchestrator;
pub use scheduler::{Scheduler, SubmitOutcome};
pub use store::JobStore;
pub use worker::run_workers;
