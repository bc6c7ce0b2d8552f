//! Network-quality classification helpers (spec §4.B).
//!
//! [`crate::types::NetworkQuality::band`] computes the three-way admission
//! band (poor/fair/good); this module adds the five-way chunk-size
//! multipliers keyed by [`SignalStrength`] and the defer-sync rule, both
//! grounded in `enterprise::cloud::transfer::AdaptiveThrottle`'s
//! bandwidth-tier table.

use crate::types::{ConnectionType, NetworkQuality, Priority, SignalStrength};

/// Multiplier applied to the base chunk size, keyed by signal strength
/// (spec §4.B: "4 if excellent, 2 if good, 1 if fair, 0.5 if poor, 1 if unknown").
pub fn chunk_multiplier(signal: SignalStrength) -> f64 {
    match signal {
        SignalStrength::Excellent => 4.0,
        SignalStrength::Good => 2.0,
        SignalStrength::Fair => 1.0,
        SignalStrength::Poor => 0.5,
        SignalStrength::Unknown => 1.0,
    }
}

/// Multiplier applied to the base chunk size to get the recommended batch
/// size, keyed by signal strength (spec §4.B).
pub fn batch_multiplier(signal: SignalStrength) -> f64 {
    match signal {
        SignalStrength::Excellent => 8.0,
        SignalStrength::Good => 4.0,
        SignalStrength::Fair => 2.0,
        SignalStrength::Poor => 1.0,
        SignalStrength::Unknown => 0.5,
    }
}

/// `optimalChunkSize` (spec §4.B).
pub fn optimal_chunk_size(base_chunk_size: usize, signal: SignalStrength) -> usize {
    ((base_chunk_size as f64) * chunk_multiplier(signal)).round() as usize
}

/// `recommendedBatchSize` (spec §4.B).
pub fn recommended_batch_size(base_chunk_size: usize, signal: SignalStrength) -> usize {
    ((base_chunk_size as f64) * batch_multiplier(signal)).round() as usize
}

/// Whether a sync at `priority` should be deferred under `quality`, per
/// spec §4.B's `shouldDeferSync`.
pub fn should_defer_sync(quality: &NetworkQuality, priority: Priority, user_initiated: Priority) -> bool {
    if priority >= user_initiated {
        return false;
    }
    let poor_and_low = quality.band() == crate::types::QualityBand::Poor && priority < Priority::High;
    let constrained_and_low = (quality.is_expensive || quality.is_constrained) && priority < Priority::Normal;
    poor_and_low || constrained_and_low
}

/// Whether a transfer of `size` bytes is admissible under the current
/// network quality and configuration (spec §4.B's eligibility rule (a)/(b)).
pub fn is_eligible(quality: &NetworkQuality, size: u64, large_file_threshold: u64, wifi_only_for_large_files: bool) -> bool {
    if quality.connection_type == ConnectionType::Unknown {
        return false;
    }
    if size > large_file_threshold && wifi_only_for_large_files {
        return matches!(quality.connection_type, ConnectionType::Wifi | ConnectionType::Ethernet);
    }
    true
}
