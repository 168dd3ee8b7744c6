//! Identifier generation for pipelines, escalations, requests, and specs.
//!
//! All identifiers embed a UTC timestamp so they sort chronologically as
//! plain strings:
//! - Pipeline: `PL-<YYYYMMDDHHMMSS>-<8 hex>`
//! - Escalation: `ESC-<YYYYMMDDHHMMSS>`
//! - Request: `REQ-<YYYYMMDDHHMMSS>-<4-digit counter>`
//! - Spec: `SPEC-<YYYYMMDDHHMMSS>-<4-digit counter>`

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

/// Process-wide counter for request and spec identifiers. Restarting the
/// process restarts the counter; uniqueness still holds because the counter
/// is combined with a second-resolution timestamp.
static SEQUENCE: AtomicU32 = AtomicU32::new(1);

fn timestamp_token(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

fn next_sequence() -> u32 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed) % 10_000
}

/// Generate a new pipeline identifier: `PL-<timestamp>-<8 hex>`.
pub fn new_pipeline_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("PL-{}-{}", timestamp_token(Utc::now()), &suffix[..8])
}

/// Generate a new escalation identifier: `ESC-<timestamp>`.
pub fn new_escalation_id() -> String {
    format!("ESC-{}", timestamp_token(Utc::now()))
}

/// Generate a new request identifier: `REQ-<timestamp>-<4-digit counter>`.
pub fn new_request_id() -> String {
    format!("REQ-{}-{:04}", timestamp_token(Utc::now()), next_sequence())
}

/// Generate a new spec identifier: `SPEC-<timestamp>-<4-digit counter>`.
pub fn new_spec_id() -> String {
    format!("SPEC-{}-{:04}", timestamp_token(Utc::now()), next_sequence())
}

/// Check whether a string looks like a pipeline identifier.
pub fn is_pipeline_id(s: &str) -> bool {
    let Some(rest) = s.strip_prefix("PL-") else {
        return false;
    };
    let mut parts = rest.splitn(2, '-');
    let ts = parts.next().unwrap_or("");
    let suffix = parts.next().unwrap_or("");
    ts.len() == 14
        && ts.chars().all(|c| c.is_ascii_digit())
        && suffix.len() == 8
        && suffix.chars().all(|c| c.is_ascii_hexdigit())
}
