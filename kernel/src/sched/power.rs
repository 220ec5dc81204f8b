//! CPU frequency hints
//!
//! The scheduler does not drive frequency scaling. It only publishes a
//! per-CPU hint derived from how busy the CPU was over the last behavior
//! window, for a power-management driver to consume.

/// Frequency hint before the first window completes.
pub const DEFAULT_FREQ_MHZ: u32 = 2000;

/// Lowest frequency ever hinted.
pub const MIN_FREQ_MHZ: u32 = 800;

/// Highest frequency ever hinted.
pub const MAX_FREQ_MHZ: u32 = 4000;

/// Busy percentage at which the hint reaches the maximum.
pub const TARGET_UTILIZATION_PCT: u64 = 80;

/// Frequency hint for a window in which the CPU was busy `busy_ns` out of
/// `window_ns`. `floor_mhz` raises the result (gaming mode).
pub fn frequency_hint(busy_ns: u64, window_ns: u64, floor_mhz: Option<u32>) -> u32 {
    let busy_pct = if window_ns == 0 {
        0
    } else {
        (u128::from(busy_ns.min(window_ns)) * 100 / u128::from(window_ns)) as u64
    };
    let span = u64::from(MAX_FREQ_MHZ - MIN_FREQ_MHZ);
    let scaled = u64::from(MIN_FREQ_MHZ) + span * busy_pct / TARGET_UTILIZATION_PCT;
    let hint = scaled.clamp(u64::from(MIN_FREQ_MHZ), u64::from(MAX_FREQ_MHZ)) as u32;
    match floor_mhz {
        Some(floor) => hint.max(floor.min(MAX_FREQ_MHZ)),
        None => hint,
    }
}
