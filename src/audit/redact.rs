//! PII redaction for audit records.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("valid regex")
});
static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b").expect("valid regex"));
static SSN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("valid regex"));
static CARD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}\b").expect("valid regex"));

/// Replaces email addresses, US phone numbers, SSNs, and 16-digit PANs with
/// redaction markers. SSN runs before the generic phone pattern so
/// `123-45-6789` is labeled as an SSN, not a phone number.
pub fn redact_pii(text: &str) -> String {
    let out = EMAIL_RE.replace_all(text, "[EMAIL_REDACTED]");
    let out = SSN_RE.replace_all(&out, "[SSN_REDACTED]");
    let out = CARD_RE.replace_all(&out, "[CARD_REDACTED]");
    let out = PHONE_RE.replace_all(&out, "[PHONE_REDACTED]");
    out.into_owned()
}

/// SHA-256 hex digest of content.
///
/// Stored alongside redacted records so operators can correlate and verify
/// content without the audit log retaining it.
pub fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}
