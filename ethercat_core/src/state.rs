//! `SlaveRuntimeState`: the mutable, Cyclic-Worker-owned state for one slave
//! (§3), and the set-point edge-pulse state machine shared by PP, optionally
//! PV/PT, and Homing.
//!
//! Grounded on §9's explicit call to model controlword edge logic as "a small
//! per-slave state machine with explicit fields (`pending`, `active`,
//! `start_time`, `force_clear_cycles`)" rather than relying on implicit
//! history — the same shape the workspace's own power/motion state machines
//! use for multi-step sequencing.

use std::time::Instant;

use ethercat_common::cia402::{self, Mode};
use ethercat_common::command::ProbeEdge;
use ethercat_common::pdo::PdoMap;

use crate::error::PlannerError;
use crate::master::ApplicationState;

/// Edge-pulse discipline for a single controlword bit-4-style strobe (new
/// set-point / homing start). One instance per mode that needs it, owned by
/// [`SlaveRuntimeState`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetpointPulse {
    /// A request arrived and is waiting for its rising edge.
    pub pending: bool,
    /// The strobe bit is currently asserted.
    pub active: bool,
    /// When the strobe was first asserted, for timeout purposes.
    pub start_time: Option<Instant>,
    /// Remaining cycles the bit must read back as 0 before it may be
    /// reasserted (invariant 6: forces a clean 0→1 edge on retrigger).
    pub force_clear_cycles: u8,
}

impl SetpointPulse {
    /// A request for a new strobe arrived. If the previous strobe is still
    /// asserted, force one cycle of cleared bit so the next assertion is a
    /// fresh rising edge rather than a continuation of the old one.
    pub fn request(&mut self) {
        if self.active {
            self.force_clear_cycles = self.force_clear_cycles.max(1);
        }
        self.pending = true;
    }

    /// Advance the state machine by one cycle and return whether the strobe
    /// bit should be asserted in the outbound image this cycle.
    ///
    /// `ack_observed` and `timed_out` together decide when an already-active
    /// strobe clears; both are computed by the caller from the inbound
    /// statusword and the configured acknowledgement timeout.
    pub fn step(&mut self, ack_observed: bool, timed_out: bool, now: Instant) -> bool {
        if self.force_clear_cycles > 0 {
            self.force_clear_cycles -= 1;
            self.active = false;
            return false;
        }

        if self.active {
            if ack_observed || timed_out {
                self.active = false;
                self.pending = false;
                return false;
            }
            return true;
        }

        if self.pending {
            self.active = true;
            self.pending = false;
            self.start_time = Some(now);
            return true;
        }

        false
    }

    /// Reset to the idle state without asserting a clearing edge — used when
    /// the drive is disabled or leaves OP, where the bit is already being
    /// forced to 0 by the caller.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Which (index, subindex) objects this slave actually has mapped, derived
/// from its registered [`PdoMap`] at startup. Distinct from
/// [`crate::esi::SupportFlags`], which describes what the ESI file *offers*
/// before any selection/override has been applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureSet {
    /// Controlword (0x6040) mapped.
    pub controlword: bool,
    /// Statusword (0x6041) mapped.
    pub statusword: bool,
    /// Modes of operation (0x6060) mapped as PDO (vs SDO-only).
    pub mode_command: bool,
    /// Modes of operation display (0x6061) mapped.
    pub mode_display: bool,
    /// Target position (0x607A) mapped.
    pub target_position: bool,
    /// Target velocity (0x60FF) mapped.
    pub target_velocity: bool,
    /// Target torque (0x6071) mapped.
    pub target_torque: bool,
    /// Position actual value (0x6064) mapped.
    pub position_actual: bool,
    /// Velocity actual value (0x606C) mapped.
    pub velocity_actual: bool,
    /// Torque actual value (0x6077) mapped.
    pub torque_actual: bool,
    /// Touch probe function (0x60B8) mapped.
    pub probe_function: bool,
    /// Touch probe 1 position (0x60BA) mapped.
    pub probe_pos1: bool,
    /// Touch probe 2 position (0x60BB or 0x60BC) mapped.
    pub probe_pos2: bool,
    /// Digital inputs (0x60FD) mapped.
    pub digital_inputs: bool,
    /// Error code (0x603F) mapped.
    pub error_code: bool,
}

impl FeatureSet {
    /// Compute the capability set from a slave's resolved offset table.
    pub fn from_map(map: &PdoMap) -> Self {
        Self {
            controlword: map.is_mapped(cia402::CONTROLWORD_INDEX, 0),
            statusword: map.is_mapped(cia402::STATUSWORD_INDEX, 0),
            mode_command: map.is_mapped(cia402::MODES_OF_OPERATION_INDEX, 0),
            mode_display: map.is_mapped(cia402::MODES_OF_OPERATION_DISPLAY_INDEX, 0),
            target_position: map.is_mapped(cia402::TARGET_POSITION_INDEX, 0),
            target_velocity: map.is_mapped(cia402::TARGET_VELOCITY_INDEX, 0),
            target_torque: map.is_mapped(cia402::TARGET_TORQUE_INDEX, 0),
            position_actual: map.is_mapped(cia402::POSITION_ACTUAL_INDEX, 0),
            velocity_actual: map.is_mapped(cia402::VELOCITY_ACTUAL_INDEX, 0),
            torque_actual: map.is_mapped(cia402::TORQUE_ACTUAL_INDEX, 0),
            probe_function: map.is_mapped(cia402::PROBE_FUNCTION_INDEX, 0),
            probe_pos1: map.is_mapped(cia402::PROBE_POS1_INDEX, 0),
            probe_pos2: map.is_mapped(cia402::PROBE_POS2_INDEX, 0)
                || map.is_mapped(cia402::PROBE_POS2_INDEX_ALT, 0),
            digital_inputs: map.is_mapped(cia402::DIGITAL_INPUTS_INDEX, 0),
            error_code: map.is_mapped(cia402::ERROR_CODE_INDEX, 0),
        }
    }
}

/// Per-slave mutable state owned exclusively by the Cyclic Worker (§3).
/// Created once at startup from [`ethercat_common::config::DriveConfig`] and
/// mutated only inside the cycle body.
pub struct SlaveRuntimeState {
    /// Bus position.
    pub position: u16,
    /// Capability set derived from the resolved `PdoMap`.
    pub features: FeatureSet,

    // ── Drive State Machine (C2) ──
    /// An `EnableDrive` command is outstanding and no `DisableDrive` has
    /// superseded it.
    pub enable_requested: bool,
    /// A `DisableDrive` command latched the drive disabled; overrides
    /// `enable_requested` until cleared.
    pub manual_disable: bool,
    /// The state machine has observed Operation Enabled this cycle.
    pub enabled: bool,
    /// Bounded fault-reset attempt counter (§4.2).
    pub fault_reset_attempts: u32,
    /// Wall time of the last controlword transition issued by the state
    /// machine, for pacing.
    pub last_action_at: Option<Instant>,
    /// The controlword value the state machine last decided to hold.
    pub desired_controlword: u16,

    // ── Bus / application-layer state ──
    /// Whether this slave currently reports OP.
    pub in_op: bool,
    /// Last observed application-layer state, for edge detection.
    pub last_app_state: ApplicationState,
    /// Wall time the slave first reached OP.
    pub op_entered_first: Option<Instant>,
    /// Wall time of the most recent OP entry.
    pub op_entered_last: Option<Instant>,
    /// Wall time of the most recent OP departure.
    pub op_left_last: Option<Instant>,
    /// Number of times this slave has left OP since startup.
    pub op_dropout_count: u32,

    // ── Motion intent (C3) ──
    /// Selected CiA-402 mode of operation.
    pub mode: Mode,
    /// Last mode value written via the service channel, for dedup when the
    /// mode register is not PDO-mapped.
    pub last_sdo_mode: Option<u8>,
    /// Last commanded velocity (PV), drive-native units/s.
    pub last_velocity_cmd: f64,
    /// Last commanded position (PP), drive-native units.
    pub last_position_cmd: f64,
    /// Last commanded torque (PT), drive-native units.
    pub last_torque_cmd: f64,
    /// Last service-channel velocity value written, for dedup.
    pub last_sdo_velocity: Option<i32>,
    /// Last service-channel torque value written, for dedup.
    pub last_sdo_torque: Option<i16>,

    // ── Set-point pulses ──
    /// Profile Position new-set-point pulse.
    pub pp_pulse: SetpointPulse,
    /// Profile Velocity pulse, used only when `pv_requires_setpoint_toggle`.
    pub pv_pulse: SetpointPulse,
    /// Profile Torque pulse, used only when `pt_requires_setpoint_toggle`.
    pub pt_pulse: SetpointPulse,
    /// Homing start pulse.
    pub hm_pulse: SetpointPulse,

    // ── CSP streaming (invariant 4) ──
    /// Next CSP target, written by application commands, swapped into
    /// `csp_current` at the start of each cycle.
    pub csp_next: Option<f64>,
    /// Currently active CSP target (post-swap).
    pub csp_current: f64,
    /// `false` until the Mode & Motion Controller has run at least one CSP
    /// cycle since entering the mode; reset on every mode change so
    /// re-entering CSP reseeds `csp_current` from the actual position when
    /// no stream value is queued yet (§4.3 "CSP ... If `next` is empty on
    /// first cycle ... seed `current` with the actual position").
    pub csp_seeded: bool,

    // ── Touch probe ──
    /// Probe currently armed.
    pub probe_armed: bool,
    /// Edge the probe is armed to latch on.
    pub probe_edge: Option<ProbeEdge>,
    /// Re-arm automatically after each capture.
    pub probe_continuous: bool,
    /// Probe function word queued for the next write (PDO or SDO).
    pub pending_probe_word: Option<u16>,
    /// Last service-channel probe function word written, for dedup.
    pub last_sdo_probe_word: Option<u16>,

    // ── Planner (C4) ──
    /// A jerk-limited request is currently active for this slave.
    pub planner_active: bool,
    /// `true` for a velocity-hold request, `false` for a position move.
    pub planner_is_velocity_mode: bool,
    /// Current planner target (position or velocity).
    pub planner_target: f64,
    /// Reason the last planner start request was rejected, if any.
    pub planner_last_error: Option<PlannerError>,
}

impl SlaveRuntimeState {
    /// Construct the initial state for a newly configured slave.
    pub fn new(position: u16, features: FeatureSet) -> Self {
        Self {
            position,
            features,
            enable_requested: false,
            manual_disable: false,
            enabled: false,
            fault_reset_attempts: 0,
            last_action_at: None,
            desired_controlword: cia402::CONTROLWORD_DISABLED,
            in_op: false,
            last_app_state: ApplicationState::Init,
            op_entered_first: None,
            op_entered_last: None,
            op_left_last: None,
            op_dropout_count: 0,
            mode: Mode::NoMode,
            last_sdo_mode: None,
            last_velocity_cmd: 0.0,
            last_position_cmd: 0.0,
            last_torque_cmd: 0.0,
            last_sdo_velocity: None,
            last_sdo_torque: None,
            pp_pulse: SetpointPulse::default(),
            pv_pulse: SetpointPulse::default(),
            pt_pulse: SetpointPulse::default(),
            hm_pulse: SetpointPulse::default(),
            csp_next: None,
            csp_current: 0.0,
            csp_seeded: false,
            probe_armed: false,
            probe_edge: None,
            probe_continuous: false,
            pending_probe_word: None,
            last_sdo_probe_word: None,
            planner_active: false,
            planner_is_velocity_mode: false,
            planner_target: 0.0,
            planner_last_error: None,
        }
    }

    /// Clear every set-point pulse without producing an extra clearing edge
    /// (the caller is already forcing controlword to 0 or the mode has
    /// changed out from under the pulse).
    pub fn clear_pulses(&mut self) {
        self.pp_pulse.clear();
        self.pv_pulse.clear();
        self.pt_pulse.clear();
        self.hm_pulse.clear();
    }

    /// Apply the consequences of leaving OP (§4.1 cycle step 4): reset
    /// `enabled`, clear controlword/pulse state, bump the dropout counter,
    /// stamp the departure time.
    pub fn reset_on_op_loss(&mut self, now: Instant) {
        self.enabled = false;
        self.desired_controlword = cia402::CONTROLWORD_DISABLED;
        self.clear_pulses();
        self.op_dropout_count += 1;
        self.op_left_last = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulse_idle_asserts_nothing() {
        let mut pulse = SetpointPulse::default();
        assert!(!pulse.step(false, false, Instant::now()));
    }

    #[test]
    fn pulse_request_then_step_asserts_and_latches_active() {
        let mut pulse = SetpointPulse::default();
        pulse.request();
        let now = Instant::now();
        assert!(pulse.step(false, false, now));
        assert!(pulse.active);
        assert!(!pulse.pending);
    }

    #[test]
    fn pulse_clears_on_ack() {
        let mut pulse = SetpointPulse::default();
        pulse.request();
        let now = Instant::now();
        assert!(pulse.step(false, false, now));
        assert!(!pulse.step(true, false, now));
        assert!(!pulse.active);
    }

    #[test]
    fn pulse_clears_on_timeout() {
        let mut pulse = SetpointPulse::default();
        pulse.request();
        let now = Instant::now();
        pulse.step(false, false, now);
        assert!(!pulse.step(false, true, now));
    }

    #[test]
    fn retrigger_while_active_forces_one_cycle_clear() {
        let mut pulse = SetpointPulse::default();
        pulse.request();
        let now = Instant::now();
        assert!(pulse.step(false, false, now)); // asserted, now active
        pulse.request(); // retrigger while active
        assert!(!pulse.step(false, false, now)); // forced clear cycle
        assert!(pulse.step(false, false, now)); // clean rising edge
    }

    #[test]
    fn reset_on_op_loss_clears_everything() {
        let mut state = SlaveRuntimeState::new(0, FeatureSet::default());
        state.enabled = true;
        state.pp_pulse.request();
        state.pp_pulse.step(false, false, Instant::now());
        state.reset_on_op_loss(Instant::now());
        assert!(!state.enabled);
        assert_eq!(state.desired_controlword, cia402::CONTROLWORD_DISABLED);
        assert!(!state.pp_pulse.active);
        assert_eq!(state.op_dropout_count, 1);
    }

    #[test]
    fn feature_set_from_map_detects_mapped_registers() {
        let mut map = PdoMap::new();
        map.register_rx(cia402::CONTROLWORD_INDEX, 0, 0, 16);
        map.register_tx(cia402::STATUSWORD_INDEX, 0, 0, 16);
        let features = FeatureSet::from_map(&map);
        assert!(features.controlword);
        assert!(features.statusword);
        assert!(!features.target_velocity);
    }

    #[test]
    fn feature_set_accepts_either_probe2_index() {
        let mut map = PdoMap::new();
        map.register_tx(cia402::PROBE_POS2_INDEX_ALT, 0, 0, 32);
        assert!(FeatureSet::from_map(&map).probe_pos2);
    }
}
