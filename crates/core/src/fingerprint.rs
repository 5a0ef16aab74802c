use serde::{Deserialize, Serialize};

/// Semantic identity of a certificate for duplicate suppression.
///
/// Two records with equal fingerprints are the same certificate as far
/// as ingestion is concerned. Serial numbers are canonical decimal
/// strings (no leading zeros), validity bounds are UTC epoch seconds,
/// issuer and common name compare as exact strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CertFingerprint {
    pub issuer: String,
    pub serial_number: String,
    pub not_before: i64,
    pub not_after: i64,
    pub common_name: String,
}
