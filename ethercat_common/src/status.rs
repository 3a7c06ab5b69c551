//! `NetworkStatus`: the coalesced snapshot published by the Cyclic Worker
//! (§3, §4.5). Built once per publish period from fixed-size state so
//! publishing never allocates on the cycle's hot path.

use heapless::Vec as HVec;
use serde::{Deserialize, Serialize};

use crate::consts::MAX_SLAVES;

/// Cycle-timing figures, derived from the rolling jitter ring buffer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CycleTimingStatus {
    /// Configured cycle period, nanoseconds.
    pub configured_period_ns: u64,
    /// Measured duration of the most recently completed cycle, nanoseconds.
    pub last_cycle_ns: u64,
    /// Signed jitter of the most recent cycle (measured - configured), nanoseconds.
    pub last_jitter_ns: i64,
    /// All-time maximum absolute jitter observed, nanoseconds.
    pub max_jitter_ns: u64,
    /// 95th percentile of the jitter ring buffer, nanoseconds.
    pub p95_jitter_ns: u64,
    /// 99th percentile of the jitter ring buffer, nanoseconds.
    pub p99_jitter_ns: u64,
    /// 99.9th percentile of the jitter ring buffer, nanoseconds.
    pub p999_jitter_ns: u64,
    /// Number of cycles whose start missed the scheduled deadline.
    pub deadline_miss_count: u64,
    /// Total cycles executed since startup.
    pub cycle_count: u64,
}

/// Domain (process-data exchange) health.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DomainStatus {
    /// Working counter observed on the most recent frame.
    pub last_wkc: u32,
    /// Expected working counter given the configured slave set.
    pub expected_wkc: u32,
    /// Minimum working counter observed since startup.
    pub min_wkc: u32,
    /// Maximum working counter observed since startup.
    pub max_wkc: u32,
    /// Whether every configured slave currently reports the OP application-layer state.
    pub all_in_op: bool,
}

/// Planner (C4) status surfaced per slave.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PlannerStatus {
    /// Whether a planner request is currently active for this slave.
    pub active: bool,
    /// `true` for a velocity-hold request, `false` for a position move (meaningless if inactive).
    pub is_velocity_mode: bool,
    /// Current target (position or velocity depending on `is_velocity_mode`).
    pub target: f64,
    /// Whether the last planner start request was rejected (invalid limits, unmapped actuals, ...).
    pub has_error: bool,
}

/// Derived boolean flags computed from the statusword, published alongside
/// the raw register value so callers don't have to re-decode bits.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DriveFlags {
    /// Drive state machine reports Operation Enabled.
    pub enabled: bool,
    /// Statusword bit 3 (fault).
    pub fault: bool,
    /// Statusword bit 7 (warning).
    pub warning: bool,
    /// Statusword bit 10 (target reached).
    pub target_reached: bool,
    /// Statusword bit 12 (set-point acknowledged).
    pub setpoint_ack: bool,
}

/// Per-slave status published in every snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SlaveStatus {
    /// Bus position.
    pub position: u16,
    /// Whether this slave currently reports the OP application-layer state.
    pub in_op: bool,
    /// Number of times this slave has left OP since startup.
    pub op_dropout_count: u32,
    /// Raw statusword (0x6041), if mapped.
    pub statusword: Option<u16>,
    /// Mode-of-operation display (0x6061), if mapped.
    pub mode_display: Option<u8>,
    /// Position actual value (0x6064), if mapped.
    pub position_actual: Option<i32>,
    /// Velocity actual value (0x606C), if mapped.
    pub velocity_actual: Option<i32>,
    /// Torque actual value (0x6077), if mapped.
    pub torque_actual: Option<i16>,
    /// Error code (0x603F), if mapped.
    pub error_code: Option<u16>,
    /// Digital inputs bitfield (0x60FD), if mapped.
    pub digital_inputs: Option<u32>,
    /// Touch probe 1 position (0x60BA), if mapped.
    pub probe_pos1: Option<i32>,
    /// Touch probe 2 position, from whichever of 0x60BB/0x60BC is mapped (0x60BC preferred).
    pub probe_pos2: Option<i32>,
    /// Derived boolean flags.
    pub flags: DriveFlags,
    /// Planner status.
    pub planner: PlannerStatus,
}

/// The coalesced network-wide status snapshot (§3, §4.5, §8 invariant 5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStatus {
    /// Wall-clock timestamp of this snapshot, nanoseconds since `UNIX_EPOCH`.
    pub timestamp_ns: u64,
    /// Configured cycle period, milliseconds.
    pub cycle_time_ms: f64,
    /// Cycle timing figures.
    pub timing: CycleTimingStatus,
    /// Domain/WKC health.
    pub domain: DomainStatus,
    /// Count of motion commands blocked by `forbid_motion_commands`.
    pub motion_blocked_count: u64,
    /// Per-slave status, indexed in configuration order.
    pub slaves: HVec<SlaveStatus, MAX_SLAVES>,
}

impl NetworkStatus {
    /// A zeroed snapshot, suitable as the pre-startup placeholder before the
    /// first cycle has run.
    pub fn empty(cycle_time_ms: f64) -> Self {
        Self {
            timestamp_ns: 0,
            cycle_time_ms,
            timing: CycleTimingStatus::default(),
            domain: DomainStatus::default(),
            motion_blocked_count: 0,
            slaves: HVec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_has_no_slaves() {
        let status = NetworkStatus::empty(5.0);
        assert_eq!(status.slaves.len(), 0);
        assert_eq!(status.cycle_time_ms, 5.0);
    }

    #[test]
    fn slave_status_defaults_to_unmapped() {
        let slave = SlaveStatus::default();
        assert!(slave.statusword.is_none());
        assert!(!slave.flags.enabled);
    }
}
