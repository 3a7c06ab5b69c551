//! System-wide constants for the EtherCAT workspace.
//!
//! Single source of truth for numeric limits and defaults. Imported by both
//! workspace crates — no duplication permitted.

/// Maximum number of slaves a single network may configure.
pub const MAX_SLAVES: usize = 64;

/// Minimum allowed cycle time [ms].
pub const CYCLE_TIME_MS_MIN: f64 = 0.5;
/// Maximum allowed cycle time [ms].
pub const CYCLE_TIME_MS_MAX: f64 = 100.0;
/// Default cycle time [ms].
pub const CYCLE_TIME_MS_DEFAULT: f64 = 5.0;

/// Default status publish period [ms]; decoupled from the cycle period.
pub const STATUS_PUBLISH_PERIOD_MS_DEFAULT: u64 = 50;

/// Default OP-entry timeout [s].
pub const OP_TIMEOUT_S_DEFAULT: f64 = 10.0;

/// Default CiA-402 state-machine transition pacing [ms].
pub const ENABLE_TRANSITION_PERIOD_MS_DEFAULT: f64 = 100.0;

/// Default PP/PV/PT/HM set-point acknowledgement mask (bit 12, "set-point acknowledged").
pub const PP_ACK_MASK_DEFAULT: u16 = 0x1000;
/// Default set-point acknowledgement timeout [ms].
pub const PP_ACK_TIMEOUT_MS_DEFAULT: f64 = 100.0;

/// Bounded number of ingress commands drained per cycle.
pub const INGRESS_DRAIN_BOUND_DEFAULT: usize = 16;

/// Minimum number of cycles the graceful-shutdown ramp must run for (≈500 ms at 10ms/cycle-ish).
pub const GRACEFUL_SHUTDOWN_MIN_CYCLES: u32 = 50;

/// Fault-reset attempt bound before the drive state machine gives up on a slave.
pub const FAULT_RESET_ATTEMPTS_MAX: u32 = 10;

/// Capacity of the rolling jitter-sample ring buffer used for percentile estimates.
pub const JITTER_RING_CAPACITY: usize = 512;

/// Magnitude beyond which the jerk-limited planner rebases its internal
/// integrated position to preserve `f64` resolution during long velocity commands.
pub const PLANNER_REBASE_THRESHOLD: f64 = 1.0e9;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_consistent() {
        assert!(MAX_SLAVES > 0);
        assert!(CYCLE_TIME_MS_MIN > 0.0);
        assert!(CYCLE_TIME_MS_MIN < CYCLE_TIME_MS_MAX);
        assert!(CYCLE_TIME_MS_DEFAULT >= CYCLE_TIME_MS_MIN);
        assert!(CYCLE_TIME_MS_DEFAULT <= CYCLE_TIME_MS_MAX);
        assert!(GRACEFUL_SHUTDOWN_MIN_CYCLES >= 50);
    }
}
