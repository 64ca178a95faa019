//! Evidence Validation
//!
//! Structural checks on resolution evidence. Upload and storage mechanics
//! belong to an external collaborator; only URL syntax and minimum content
//! length are enforced here.

use url::Url;

use crate::errors::{SettlementError, SettlementResult};
use crate::models::EvidenceItem;

/// Minimum content length for any evidence item
pub const MIN_EVIDENCE_CONTENT_LEN: usize = 10;

/// Validate a resolution's evidence list. Runs before any token movement;
/// a failure here leaves no side effects.
pub fn validate_evidence(evidence: &[EvidenceItem]) -> SettlementResult<()> {
    if evidence.is_empty() {
        return Err(SettlementError::InvalidInput(
            "at least one evidence item is required".to_string(),
        ));
    }

    for (idx, item) in evidence.iter().enumerate() {
        if item.content.trim().len() < MIN_EVIDENCE_CONTENT_LEN {
            return Err(SettlementError::InvalidInput(format!(
                "evidence item {} content is shorter than {} characters",
                idx, MIN_EVIDENCE_CONTENT_LEN
            )));
        }
        if item.evidence_type == "url" && Url::parse(item.content.trim()).is_err() {
            return Err(SettlementError::InvalidInput(format!(
                "evidence item {} is not a valid URL: {}",
                idx, item.content
            )));
        }
    }
    Ok(())
}
