//! Market Resolution
//!
//! Drives a market through the auditable resolution state machine:
//! evidence validation, payout calculation, the atomic settlement write,
//! and the best-effort token distribution fan-out.

mod evidence;
mod log;
mod orchestrator;

pub use evidence::{validate_evidence, MIN_EVIDENCE_CONTENT_LEN};
pub use log::{LogQuery, ResolutionLogStore};
pub use orchestrator::{ResolutionOrchestrator, ResolutionOutcome, ResolveRequest};
