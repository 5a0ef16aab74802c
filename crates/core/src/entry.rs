//! RFC 6962 Merkle-leaf decoding.
//!
//! A CT `get-entries` response carries one base64 `leaf_input` per
//! entry. The leaf is a binary `MerkleTreeLeaf` (v1, timestamped
//! entry) wrapping either a full X.509 certificate or a
//! precertificate TBS. This module decodes the framing, hands the DER
//! to `x509-parser`, and extracts the fingerprint tuple plus every DNS
//! name (CN ∪ SAN) the suffix filter needs.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use thiserror::Error;
use x509_parser::prelude::*;

use crate::fingerprint::CertFingerprint;

const LEAF_VERSION_V1: u8 = 0;
const LEAF_TYPE_TIMESTAMPED_ENTRY: u8 = 0;
const ENTRY_TYPE_X509: u16 = 0;
const ENTRY_TYPE_PRECERT: u16 = 1;
const ISSUER_KEY_HASH_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum EntryError {
    #[error("leaf truncated at byte {0}")]
    Truncated(usize),
    #[error("unsupported leaf version {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported leaf type {0}")]
    UnsupportedLeafType(u8),
    #[error("unsupported entry type {0}")]
    UnsupportedEntryType(u16),
    #[error("invalid certificate DER: {0}")]
    Der(String),
    #[error("invalid base64 leaf: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Kind of certificate carried by a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafKind {
    X509,
    Precert,
}

/// Everything ingestion needs from one decoded leaf.
#[derive(Debug, Clone)]
pub struct ParsedEntry {
    pub kind: LeafKind,
    /// Leaf timestamp, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub fingerprint: CertFingerprint,
    /// Union of subject CN and SAN DNS names, order preserved.
    pub dns_names: Vec<String>,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], EntryError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(EntryError::Truncated(self.pos))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, EntryError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, EntryError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<usize, EntryError> {
        let b = self.take(3)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    fn u64(&mut self) -> Result<u64, EntryError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }
}

/// Decode a raw `MerkleTreeLeaf`.
pub fn parse_leaf(leaf: &[u8]) -> Result<ParsedEntry, EntryError> {
    let mut r = Reader::new(leaf);

    let version = r.u8()?;
    if version != LEAF_VERSION_V1 {
        return Err(EntryError::UnsupportedVersion(version));
    }
    let leaf_type = r.u8()?;
    if leaf_type != LEAF_TYPE_TIMESTAMPED_ENTRY {
        return Err(EntryError::UnsupportedLeafType(leaf_type));
    }

    let timestamp_ms = r.u64()?;
    let entry_type = r.u16()?;
    match entry_type {
        ENTRY_TYPE_X509 => {
            let len = r.u24()?;
            let der = r.take(len)?;
            let (_, cert) =
                parse_x509_certificate(der).map_err(|err| EntryError::Der(err.to_string()))?;
            Ok(extract(LeafKind::X509, timestamp_ms, &cert.tbs_certificate))
        }
        ENTRY_TYPE_PRECERT => {
            let _issuer_key_hash = r.take(ISSUER_KEY_HASH_LEN)?;
            let len = r.u24()?;
            let der = r.take(len)?;
            let (_, tbs) =
                TbsCertificate::from_der(der).map_err(|err| EntryError::Der(err.to_string()))?;
            Ok(extract(LeafKind::Precert, timestamp_ms, &tbs))
        }
        other => Err(EntryError::UnsupportedEntryType(other)),
    }
}

/// Decode a base64 `leaf_input` as returned by `get-entries`.
pub fn parse_leaf_b64(leaf_b64: &str) -> Result<ParsedEntry, EntryError> {
    let raw = B64.decode(leaf_b64.as_bytes())?;
    parse_leaf(&raw)
}

fn extract(kind: LeafKind, timestamp_ms: u64, tbs: &TbsCertificate<'_>) -> ParsedEntry {
    let issuer = tbs.issuer.to_string();
    let serial_number = tbs.serial.to_str_radix(10);
    let not_before = tbs.validity.not_before.timestamp();
    let not_after = tbs.validity.not_after.timestamp();

    let common_name = tbs
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut dns_names = Vec::new();
    if !common_name.is_empty() {
        dns_names.push(common_name.clone());
    }
    for ext in tbs.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for general_name in &san.general_names {
                if let GeneralName::DNSName(dns) = general_name {
                    if !dns_names.iter().any(|seen| seen == dns) {
                        dns_names.push((*dns).to_string());
                    }
                }
            }
        }
    }

    ParsedEntry {
        kind,
        timestamp_ms,
        fingerprint: CertFingerprint {
            issuer,
            serial_number,
            not_before,
            not_after,
            common_name,
        },
        dns_names,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CERT_A: &[u8] = include_bytes!("../testdata/cert_a.der");
    const CERT_B: &[u8] = include_bytes!("../testdata/cert_b.der");
    const TBS_A: &[u8] = include_bytes!("../testdata/tbs_a.der");

    fn x509_leaf(der: &[u8]) -> Vec<u8> {
        let mut leaf = vec![LEAF_VERSION_V1, LEAF_TYPE_TIMESTAMPED_ENTRY];
        leaf.extend_from_slice(&1_700_000_000_123_u64.to_be_bytes());
        leaf.extend_from_slice(&ENTRY_TYPE_X509.to_be_bytes());
        leaf.extend_from_slice(&(der.len() as u32).to_be_bytes()[1..]);
        leaf.extend_from_slice(der);
        leaf.extend_from_slice(&[0, 0]); // empty extensions
        leaf
    }

    fn precert_leaf(tbs: &[u8]) -> Vec<u8> {
        let mut leaf = vec![LEAF_VERSION_V1, LEAF_TYPE_TIMESTAMPED_ENTRY];
        leaf.extend_from_slice(&1_700_000_000_123_u64.to_be_bytes());
        leaf.extend_from_slice(&ENTRY_TYPE_PRECERT.to_be_bytes());
        leaf.extend_from_slice(&[0xab; ISSUER_KEY_HASH_LEN]);
        leaf.extend_from_slice(&(tbs.len() as u32).to_be_bytes()[1..]);
        leaf.extend_from_slice(tbs);
        leaf.extend_from_slice(&[0, 0]);
        leaf
    }

    #[test]
    fn x509_leaf_yields_names_and_fingerprint() {
        let parsed = parse_leaf(&x509_leaf(CERT_A)).unwrap();
        assert_eq!(parsed.kind, LeafKind::X509);
        assert_eq!(parsed.timestamp_ms, 1_700_000_000_123);
        assert_eq!(parsed.fingerprint.common_name, "a.example.jp");
        assert_eq!(parsed.fingerprint.serial_number, "4660");
        assert!(parsed.fingerprint.issuer.contains("Ctsieve Test"));
        assert!(parsed.fingerprint.not_before > 0);
        assert!(parsed.fingerprint.not_before < parsed.fingerprint.not_after);
        // CN first, then SAN names the CN did not already cover.
        assert_eq!(parsed.dns_names, ["a.example.jp", "www.a.example.jp"]);
    }

    #[test]
    fn large_serials_stay_canonical_decimal() {
        let parsed = parse_leaf(&x509_leaf(CERT_B)).unwrap();
        assert_eq!(parsed.fingerprint.serial_number, "25581629096090222921708");
        assert_eq!(parsed.dns_names, ["b.example.jp", "*.shop.jp"]);
    }

    #[test]
    fn precert_leaf_parses_the_tbs() {
        let parsed = parse_leaf(&precert_leaf(TBS_A)).unwrap();
        assert_eq!(parsed.kind, LeafKind::Precert);
        assert_eq!(parsed.fingerprint.common_name, "a.example.jp");
        assert_eq!(parsed.fingerprint.serial_number, "4660");
    }

    #[test]
    fn x509_and_precert_share_a_fingerprint() {
        let full = parse_leaf(&x509_leaf(CERT_A)).unwrap();
        let pre = parse_leaf(&precert_leaf(TBS_A)).unwrap();
        assert_eq!(full.fingerprint, pre.fingerprint);
    }

    #[test]
    fn b64_roundtrip_matches_raw() {
        let leaf = x509_leaf(CERT_A);
        let encoded = B64.encode(&leaf);
        let via_b64 = parse_leaf_b64(&encoded).unwrap();
        let raw = parse_leaf(&leaf).unwrap();
        assert_eq!(via_b64.fingerprint, raw.fingerprint);
    }

    #[test]
    fn framing_errors_are_reported() {
        assert!(matches!(parse_leaf(&[]), Err(EntryError::Truncated(0))));
        assert!(matches!(
            parse_leaf(&x509_leaf(CERT_A)[..12]),
            Err(EntryError::Truncated(_))
        ));

        let mut bad_version = x509_leaf(CERT_A);
        bad_version[0] = 3;
        assert!(matches!(
            parse_leaf(&bad_version),
            Err(EntryError::UnsupportedVersion(3))
        ));

        let mut bad_type = x509_leaf(CERT_A);
        bad_type[1] = 1;
        assert!(matches!(
            parse_leaf(&bad_type),
            Err(EntryError::UnsupportedLeafType(1))
        ));

        let mut bad_entry = x509_leaf(CERT_A);
        bad_entry[10] = 0;
        bad_entry[11] = 2;
        assert!(matches!(
            parse_leaf(&bad_entry),
            Err(EntryError::UnsupportedEntryType(2))
        ));
    }

    #[test]
    fn garbage_der_is_a_der_error() {
        let junk = [0u8; 64];
        assert!(matches!(
            parse_leaf(&x509_leaf(&junk)),
            Err(EntryError::Der(_))
        ));
    }

    #[test]
    fn bad_base64_is_reported() {
        assert!(matches!(
            parse_leaf_b64("not!!base64"),
            Err(EntryError::Base64(_))
        ));
    }
}
