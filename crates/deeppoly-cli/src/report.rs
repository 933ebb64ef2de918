//! Verdict formatting.

use std::time::Duration;

pub const VERIFIED: &str = "verified";
pub const NOT_VERIFIED: &str = "not verified";

pub fn verdict_text(verified: bool) -> &'static str {
    if verified {
        VERIFIED
    } else {
        NOT_VERIFIED
    }
}

/// One line comparing a verdict with the expected answer.
///
/// ✅ when they agree, ❌ when a robust input was not certified, ⚠️ when an
/// input expected to be non-robust was certified.
pub fn check_line(verified: bool, truth: &str, elapsed: Duration, spec: &str) -> String {
    let secs = elapsed.as_secs_f32();
    if verdict_text(verified) == truth {
        format!("✅ (truth: {truth}, {secs:.1}s): {spec}")
    } else if truth == VERIFIED {
        format!("❌ ({truth}, {secs:.1}s): {spec}")
    } else {
        format!("⚠️ ({truth}, {secs:.1}s): {spec}")
    }
}
