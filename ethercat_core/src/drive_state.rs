//! The CiA-402 Drive State Machine (C2): turns an inbound statusword plus a
//! slave's `enable_requested`/`manual_disable` intent into the controlword
//! value the worker should write this cycle (§4.2).
//!
//! Modeled the same way the workspace's other sequencing state machines are
//! modeled: an explicit `match` over the observed pattern rather than nested
//! booleans, with pacing and a bounded retry counter carried in
//! [`crate::state::SlaveRuntimeState`] instead of free variables here.

use std::time::{Duration, Instant};

use ethercat_common::cia402::{
    self, is_operation_enabled, StatuswordBits, CONTROLWORD_DISABLED, CONTROLWORD_ENABLE_OPERATION,
    CONTROLWORD_FAULT_RESET, CONTROLWORD_SHUTDOWN, CONTROLWORD_SWITCH_ON, STATUSWORD_READY_TO_SWITCH_ON,
    STATUSWORD_STATE_MASK, STATUSWORD_SWITCH_ON_DISABLED, STATUSWORD_SWITCH_ON_DISABLED_MASK,
    STATUSWORD_SWITCHED_ON,
};
use ethercat_common::consts::FAULT_RESET_ATTEMPTS_MAX;

use crate::state::SlaveRuntimeState;

/// Advance the Drive State Machine by one cycle and return the controlword
/// value to write. Mutates `state.enabled`, `state.fault_reset_attempts`,
/// `state.last_action_at`, and `state.desired_controlword`.
///
/// Precondition: the caller only invokes this for a slave currently in OP;
/// OP-loss handling is [`SlaveRuntimeState::reset_on_op_loss`], not this
/// function.
pub fn step(
    state: &mut SlaveRuntimeState,
    statusword: u16,
    transition_period: Duration,
    now: Instant,
) -> u16 {
    if !state.enable_requested || state.manual_disable {
        state.enabled = false;
        state.desired_controlword = CONTROLWORD_DISABLED;
        return CONTROLWORD_DISABLED;
    }

    let masked = statusword & STATUSWORD_STATE_MASK;
    let fault = StatuswordBits::from_bits_truncate(statusword).contains(StatuswordBits::FAULT);

    let action = if fault {
        if state.fault_reset_attempts >= FAULT_RESET_ATTEMPTS_MAX {
            None
        } else {
            Some(CONTROLWORD_FAULT_RESET)
        }
    } else if statusword & STATUSWORD_SWITCH_ON_DISABLED_MASK == STATUSWORD_SWITCH_ON_DISABLED {
        state.fault_reset_attempts = 0;
        Some(CONTROLWORD_SHUTDOWN)
    } else if masked == STATUSWORD_READY_TO_SWITCH_ON {
        Some(CONTROLWORD_SWITCH_ON)
    } else if masked == STATUSWORD_SWITCHED_ON {
        Some(CONTROLWORD_ENABLE_OPERATION)
    } else if is_operation_enabled(statusword) {
        state.enabled = true;
        state.fault_reset_attempts = 0;
        Some(CONTROLWORD_ENABLE_OPERATION)
    } else {
        None
    };

    let Some(action) = action else {
        return state.desired_controlword;
    };

    let is_new_action = action != state.desired_controlword;
    let paced_ok = !is_new_action
        || state
            .last_action_at
            .map(|last| now.duration_since(last) >= transition_period)
            .unwrap_or(true);

    if !paced_ok {
        return state.desired_controlword;
    }

    if is_new_action {
        state.last_action_at = Some(now);
        if action == CONTROLWORD_FAULT_RESET {
            state.fault_reset_attempts += 1;
        }
    }

    state.desired_controlword = action;
    action
}

/// Whether a bare `0x6041` masked pattern currently reads as a fault.
pub fn is_faulted(statusword: u16) -> bool {
    StatuswordBits::from_bits_truncate(statusword).contains(StatuswordBits::FAULT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FeatureSet;
    use std::time::Duration;

    const PACING: Duration = Duration::from_millis(0);

    fn enabled_state() -> SlaveRuntimeState {
        let mut state = SlaveRuntimeState::new(0, FeatureSet::default());
        state.enable_requested = true;
        state
    }

    #[test]
    fn enable_ladder_converges_to_operation_enabled() {
        let mut state = enabled_state();
        let now = Instant::now();

        let cw = step(&mut state, STATUSWORD_SWITCH_ON_DISABLED, PACING, now);
        assert_eq!(cw, CONTROLWORD_SHUTDOWN);

        let cw = step(&mut state, STATUSWORD_READY_TO_SWITCH_ON, PACING, now);
        assert_eq!(cw, CONTROLWORD_SWITCH_ON);

        let cw = step(&mut state, STATUSWORD_SWITCHED_ON, PACING, now);
        assert_eq!(cw, CONTROLWORD_ENABLE_OPERATION);

        let cw = step(&mut state, cia402::STATUSWORD_OPERATION_ENABLED, PACING, now);
        assert_eq!(cw, CONTROLWORD_ENABLE_OPERATION);
        assert!(state.enabled);
    }

    #[test]
    fn fault_recovery_stops_at_bound() {
        let mut state = enabled_state();
        let now = Instant::now();
        let faulted = cia402::STATUSWORD_SWITCH_ON_DISABLED | (1 << 3);

        for attempt in 1..=FAULT_RESET_ATTEMPTS_MAX {
            let cw = step(&mut state, faulted, PACING, now);
            assert_eq!(cw, CONTROLWORD_FAULT_RESET);
            assert_eq!(state.fault_reset_attempts, attempt);
        }

        // Bound reached: no further increments, last word held.
        let cw = step(&mut state, faulted, PACING, now);
        assert_eq!(cw, CONTROLWORD_FAULT_RESET);
        assert_eq!(state.fault_reset_attempts, FAULT_RESET_ATTEMPTS_MAX);
    }

    #[test]
    fn manual_disable_forces_zero() {
        let mut state = enabled_state();
        state.manual_disable = true;
        let now = Instant::now();
        let cw = step(&mut state, cia402::STATUSWORD_OPERATION_ENABLED, PACING, now);
        assert_eq!(cw, CONTROLWORD_DISABLED);
        assert!(!state.enabled);
    }

    #[test]
    fn enable_not_requested_forces_zero() {
        let mut state = SlaveRuntimeState::new(0, FeatureSet::default());
        let now = Instant::now();
        let cw = step(&mut state, cia402::STATUSWORD_OPERATION_ENABLED, PACING, now);
        assert_eq!(cw, CONTROLWORD_DISABLED);
    }

    #[test]
    fn pacing_blocks_transition_before_period_elapses() {
        let mut state = enabled_state();
        let now = Instant::now();
        let long_pacing = Duration::from_secs(10);

        let cw = step(&mut state, STATUSWORD_SWITCH_ON_DISABLED, long_pacing, now);
        assert_eq!(cw, CONTROLWORD_SHUTDOWN);

        // Statusword has moved on, but pacing hasn't elapsed: hold prior word.
        let cw = step(&mut state, STATUSWORD_READY_TO_SWITCH_ON, long_pacing, now);
        assert_eq!(cw, CONTROLWORD_SHUTDOWN);
    }

    #[test]
    fn repeating_same_action_does_not_wait_on_pacing() {
        let mut state = enabled_state();
        let now = Instant::now();
        let long_pacing = Duration::from_secs(10);
        let faulted = cia402::STATUSWORD_SWITCH_ON_DISABLED | (1 << 3);

        let cw = step(&mut state, faulted, long_pacing, now);
        assert_eq!(cw, CONTROLWORD_FAULT_RESET);
        // Statusword unchanged, action unchanged: should reissue immediately,
        // not wait out the (very long) pacing interval.
        let cw = step(&mut state, faulted, long_pacing, now);
        assert_eq!(cw, CONTROLWORD_FAULT_RESET);
        assert_eq!(state.fault_reset_attempts, 1);
    }
}
