//! Confidence tiers. The only place tier boundaries are defined.

use crate::domain::Tier;

/// At or above: stable
pub const STABLE_THRESHOLD: f64 = 0.8;

/// Below: critical
pub const CRITICAL_THRESHOLD: f64 = 0.6;

/// Map a synthesis confidence to its tier
pub fn classify(confidence: f64) -> Tier {
    if confidence >= STABLE_THRESHOLD {
        Tier::Stable
    } else if confidence >= CRITICAL_THRESHOLD {
        Tier::Warning
    } else {
        Tier::Critical
    }
}
