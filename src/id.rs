//! ID generation utilities for patchrun
//!
//! Provides functions for generating identifiers for runs, iterations, events,
//! and outbound model requests.

use chrono::{DateTime, SubsecRound, Utc};
use rand::Rng;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current time at the microsecond precision the store keeps, so a record
/// compares equal to itself after a round trip
pub fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn random_hex(bytes: usize) -> String {
    let mut rng = rand::rng();
    (0..bytes).map(|_| format!("{:02x}", rng.random::<u8>())).collect()
}

/// Generate a unique run ID
///
/// Format: 32 lowercase hex characters. The first 8 are used in branch names,
/// so they are random rather than time-derived.
pub fn generate_run_id() -> String {
    random_hex(16)
}

/// Generate an iteration ID
///
/// Format: `it-{timestamp_ms}-{random_hex}`
pub fn generate_iteration_id() -> String {
    format!("it-{}-{}", now_ms(), random_hex(2))
}

/// Generate an event ID
///
/// Format: `evt-{timestamp_ms}-{random_hex}`
pub fn generate_event_id() -> String {
    format!("evt-{}-{}", now_ms(), random_hex(4))
}

/// Owner token for one acquisition of an issue lock
///
/// Format: `{run_prefix}-{random_hex}`; distinct for every call even for the
/// same run.
pub fn generate_lock_token(run_id: &str) -> String {
    format!("{}-{}", run_prefix(run_id), random_hex(8))
}

/// Short prefix of a run id used in branch names and temp directories
pub fn run_prefix(run_id: &str) -> &str {
    let end = run_id
        .char_indices()
        .nth(8)
        .map(|(idx, _)| idx)
        .unwrap_or(run_id.len());
    &run_id[..end]
}

/// Correlation ID attached to an outbound model request
///
/// Format: `{run_prefix}-{stage}-{attempt}`
pub fn correlation_id(run_id: &str, stage: &str, attempt: u32) -> String {
    format!("{}-{}-{}", run_prefix(run_id), stage, attempt)
}
