//! The Mode & Motion Controller (C3): turns a slave's selected CiA-402 mode
//! plus the latest commanded target into the outbound controlword and
//! target-register writes for one cycle (§4.3).
//!
//! Every register write is either PDO (cyclic, written every cycle the
//! register is mapped) or, when unmapped, a deduplicated service-channel
//! (SDO) write issued only on change — the same dual-dispatch rule applies
//! to the mode byte, the touch-probe function word, and (when unmapped) the
//! PV/PT targets.

use std::time::{Duration, Instant};

use ethercat_common::cia402::{self, ControlwordBits, Mode};
use ethercat_common::config::DriveConfig;
use ethercat_common::pdo::{read_i32, read_u16, write_i16, write_i32, write_u16, write_u8, PdoMap};

use crate::error::CycleError;
use crate::master::MasterAdapter;
use crate::state::SlaveRuntimeState;

enum ImageWrite {
    U8(usize, u8),
    U16(usize, u16),
    I16(usize, i16),
    I32(usize, i32),
}

fn apply_writes(image: &mut [u8], writes: &[ImageWrite]) {
    for write in writes {
        match *write {
            ImageWrite::U8(offset, value) => write_u8(image, offset, value),
            ImageWrite::U16(offset, value) => write_u16(image, offset, value),
            ImageWrite::I16(offset, value) => write_i16(image, offset, value),
            ImageWrite::I32(offset, value) => write_i32(image, offset, value),
        }
    }
}

fn sdo_error(position: u16, index: u16, subindex: u8) -> impl Fn(crate::error::MasterError) -> CycleError {
    move |e| CycleError::SdoWriteFailed { position, index, subindex, reason: e.to_string() }
}

fn read_statusword(map: &PdoMap, image: &[u8]) -> Option<u16> {
    map.tx_offset(cia402::STATUSWORD_INDEX, 0).map(|off| read_u16(image, off.byte_offset))
}

fn clamp_velocity(cfg: &DriveConfig, value: f64) -> f64 {
    match cfg.max_velocity {
        Some(max) if max > 0.0 => value.clamp(-max, max),
        _ => value,
    }
}

fn clamp_torque(cfg: &DriveConfig, value: f64) -> f64 {
    match cfg.max_torque {
        Some(max) if max > 0.0 => value.clamp(-max, max),
        _ => value,
    }
}

fn clamp_position(cfg: &DriveConfig, value: f64) -> f64 {
    match cfg.position_limits {
        Some((min, max)) => value.clamp(min, max),
        None => value,
    }
}

fn sync_mode_byte(
    state: &mut SlaveRuntimeState,
    map: &PdoMap,
    adapter: &mut dyn MasterAdapter,
    position: u16,
    writes: &mut Vec<ImageWrite>,
) -> Result<(), CycleError> {
    let value = state.mode.as_u8();
    if let Some(off) = map.rx_offset(cia402::MODES_OF_OPERATION_INDEX, 0) {
        writes.push(ImageWrite::U8(off.byte_offset, value));
        return Ok(());
    }
    if state.last_sdo_mode != Some(value) {
        adapter
            .sdo_write(position, cia402::MODES_OF_OPERATION_INDEX, 0, &[value])
            .map_err(sdo_error(position, cia402::MODES_OF_OPERATION_INDEX, 0))?;
        state.last_sdo_mode = Some(value);
    }
    Ok(())
}

fn sync_probe_function(
    state: &mut SlaveRuntimeState,
    map: &PdoMap,
    adapter: &mut dyn MasterAdapter,
    position: u16,
    writes: &mut Vec<ImageWrite>,
) -> Result<(), CycleError> {
    let Some(word) = state.pending_probe_word else {
        return Ok(());
    };
    if let Some(off) = map.rx_offset(cia402::PROBE_FUNCTION_INDEX, 0) {
        writes.push(ImageWrite::U16(off.byte_offset, word));
        state.pending_probe_word = None;
        return Ok(());
    }
    if state.last_sdo_probe_word != Some(word) {
        adapter
            .sdo_write(position, cia402::PROBE_FUNCTION_INDEX, 0, &word.to_le_bytes())
            .map_err(sdo_error(position, cia402::PROBE_FUNCTION_INDEX, 0))?;
        state.last_sdo_probe_word = Some(word);
    }
    state.pending_probe_word = None;
    Ok(())
}

fn write_position(
    state: &mut SlaveRuntimeState,
    map: &PdoMap,
    adapter: &mut dyn MasterAdapter,
    position: u16,
    value: f64,
    writes: &mut Vec<ImageWrite>,
) -> Result<(), CycleError> {
    let wire = value.round() as i32;
    if let Some(off) = map.rx_offset(cia402::TARGET_POSITION_INDEX, 0) {
        writes.push(ImageWrite::I32(off.byte_offset, wire));
        return Ok(());
    }
    adapter
        .sdo_write(position, cia402::TARGET_POSITION_INDEX, 0, &wire.to_le_bytes())
        .map_err(sdo_error(position, cia402::TARGET_POSITION_INDEX, 0))?;
    let _ = state;
    Ok(())
}

fn write_velocity(
    state: &mut SlaveRuntimeState,
    map: &PdoMap,
    adapter: &mut dyn MasterAdapter,
    position: u16,
    value: f64,
    writes: &mut Vec<ImageWrite>,
) -> Result<(), CycleError> {
    let wire = value.round() as i32;
    if let Some(off) = map.rx_offset(cia402::TARGET_VELOCITY_INDEX, 0) {
        writes.push(ImageWrite::I32(off.byte_offset, wire));
        return Ok(());
    }
    if state.last_sdo_velocity != Some(wire) {
        adapter
            .sdo_write(position, cia402::TARGET_VELOCITY_INDEX, 0, &wire.to_le_bytes())
            .map_err(sdo_error(position, cia402::TARGET_VELOCITY_INDEX, 0))?;
        state.last_sdo_velocity = Some(wire);
    }
    Ok(())
}

fn write_torque(
    state: &mut SlaveRuntimeState,
    map: &PdoMap,
    adapter: &mut dyn MasterAdapter,
    position: u16,
    value: f64,
    writes: &mut Vec<ImageWrite>,
) -> Result<(), CycleError> {
    let wire = value.round() as i16;
    if let Some(off) = map.rx_offset(cia402::TARGET_TORQUE_INDEX, 0) {
        writes.push(ImageWrite::I16(off.byte_offset, wire));
        return Ok(());
    }
    if state.last_sdo_torque != Some(wire) {
        adapter
            .sdo_write(position, cia402::TARGET_TORQUE_INDEX, 0, &wire.to_le_bytes())
            .map_err(sdo_error(position, cia402::TARGET_TORQUE_INDEX, 0))?;
        state.last_sdo_torque = Some(wire);
    }
    Ok(())
}

/// Apply one cycle's worth of motion shaping for `state`, writing into
/// `adapter`'s outbound process image (and, for unmapped registers, issuing
/// deduplicated service-channel writes).
///
/// `controlword_base` is the value decided by [`crate::drive_state::step`]
/// (the CiA-402 enable-ladder bits); this function ORs in the mode-specific
/// bits (new-set-point strobe, change-set-immediately, halt) on top of it.
/// When the slave is disabled, invariant 1 applies: controlword is forced to
/// 0 and no target register is touched.
#[allow(clippy::too_many_arguments)]
pub fn apply_cycle(
    state: &mut SlaveRuntimeState,
    cfg: &DriveConfig,
    map: &PdoMap,
    adapter: &mut dyn MasterAdapter,
    controlword_base: u16,
    now: Instant,
    pp_ack_mask: u16,
    pp_ack_timeout: Duration,
) -> Result<(), CycleError> {
    let position = state.position;
    let mut writes = Vec::with_capacity(4);

    sync_mode_byte(state, map, adapter, position, &mut writes)?;
    sync_probe_function(state, map, adapter, position, &mut writes)?;

    let controlword_offset = map
        .rx_offset(cia402::CONTROLWORD_INDEX, 0)
        .expect("controlword must be mapped (checked at startup)");

    if !state.enabled || state.manual_disable {
        writes.push(ImageWrite::U16(controlword_offset.byte_offset, cia402::CONTROLWORD_DISABLED));
        state.clear_pulses();
        apply_writes(adapter.domain_data_mut(), &writes);
        return Ok(());
    }

    let statusword = read_statusword(map, adapter.domain_data());
    let ack_observed = statusword.map(|sw| sw & pp_ack_mask != 0).unwrap_or(false);

    let mut extra = ControlwordBits::empty();

    match state.mode {
        Mode::ProfilePosition => {
            extra |= ControlwordBits::CHANGE_SET_IMMEDIATELY;
            let timed_out = state
                .pp_pulse
                .start_time
                .map(|t| now.duration_since(t) >= pp_ack_timeout)
                .unwrap_or(false);
            if state.pp_pulse.step(ack_observed, timed_out, now) {
                extra |= ControlwordBits::NEW_SET_POINT;
            }
            let target = clamp_position(cfg, state.last_position_cmd);
            write_position(state, map, adapter, position, target, &mut writes)?;
        }
        Mode::ProfileVelocity => {
            let target = clamp_velocity(cfg, state.last_velocity_cmd);
            write_velocity(state, map, adapter, position, target, &mut writes)?;
            if cfg.pv_requires_setpoint_toggle {
                let timed_out = state
                    .pv_pulse
                    .start_time
                    .map(|t| now.duration_since(t) >= pp_ack_timeout)
                    .unwrap_or(false);
                if state.pv_pulse.step(ack_observed, timed_out, now) {
                    extra |= ControlwordBits::NEW_SET_POINT;
                }
            }
        }
        Mode::ProfileTorque => {
            let target = clamp_torque(cfg, state.last_torque_cmd);
            write_torque(state, map, adapter, position, target, &mut writes)?;
            if cfg.pt_requires_setpoint_toggle {
                let timed_out = state
                    .pt_pulse
                    .start_time
                    .map(|t| now.duration_since(t) >= pp_ack_timeout)
                    .unwrap_or(false);
                if state.pt_pulse.step(ack_observed, timed_out, now) {
                    extra |= ControlwordBits::NEW_SET_POINT;
                }
            }
        }
        Mode::CyclicSyncPosition => {
            if !state.csp_seeded {
                if state.csp_next.is_none() {
                    if let Some(off) = map.tx_offset(cia402::POSITION_ACTUAL_INDEX, 0) {
                        state.csp_current = read_i32(adapter.domain_data(), off.byte_offset) as f64;
                    }
                }
                state.csp_seeded = true;
            }
            if let Some(next) = state.csp_next.take() {
                state.csp_current = clamp_position(cfg, next);
            }
            // Two's-complement truncation to the CiA-402 wire format: values
            // beyond i32 range wrap rather than saturate or error (§4.3).
            let wire = (state.csp_current.round() as i64 as u32) as i32;
            if let Some(off) = map.rx_offset(cia402::TARGET_POSITION_INDEX, 0) {
                writes.push(ImageWrite::I32(off.byte_offset, wire));
            }
        }
        Mode::Homing => {
            let timed_out = state
                .hm_pulse
                .start_time
                .map(|t| now.duration_since(t) >= pp_ack_timeout)
                .unwrap_or(false);
            if state.hm_pulse.step(ack_observed, timed_out, now) {
                extra |= ControlwordBits::NEW_SET_POINT;
            }
        }
        Mode::Velocity | Mode::CyclicSyncVelocity | Mode::NoMode => {}
    }

    let final_cw = controlword_base | extra.bits();
    writes.push(ImageWrite::U16(controlword_offset.byte_offset, final_cw));

    apply_writes(adapter.domain_data_mut(), &writes);
    Ok(())
}

/// Write one cycle of the graceful-shutdown frame (§4.1): controlword is
/// forced to 0x0000 and target velocity is driven to zero, while the target
/// position register is left untouched ("hold the current target
/// position"). Distinct from the disabled path in [`apply_cycle`], which
/// leaves velocity/position untouched entirely per invariant 1 — teardown is
/// not an ordinary disable, it must actively bleed off a running velocity
/// command rather than freeze it at its last commanded value.
pub fn write_shutdown_frame(
    state: &mut SlaveRuntimeState,
    map: &PdoMap,
    adapter: &mut dyn MasterAdapter,
) -> Result<(), CycleError> {
    let position = state.position;
    let mut writes = Vec::with_capacity(2);

    let controlword_offset = map
        .rx_offset(cia402::CONTROLWORD_INDEX, 0)
        .expect("controlword must be mapped (checked at startup)");
    writes.push(ImageWrite::U16(controlword_offset.byte_offset, cia402::CONTROLWORD_DISABLED));

    write_velocity(state, map, adapter, position, 0.0, &mut writes)?;

    state.enabled = false;
    state.clear_pulses();
    apply_writes(adapter.domain_data_mut(), &writes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::SimMaster;
    use ethercat_common::config::{DriveConfig, HomingConfig};
    use ethercat_common::pdo::read_i32;
    use ethercat_common::cia402::PROBE_FUNCTION_INDEX;
    use ethercat_common::command::ProbeEdge;

    fn drive_cfg(position: u16) -> DriveConfig {
        DriveConfig {
            position,
            alias: 0,
            vendor_id: 1,
            product_code: 1,
            enable_dc: false,
            dc_assign_activate: None,
            dc_sync0_cycle_time_ns: None,
            dc_sync0_shift_ns: 0,
            dc_sync1_cycle_time_ns: 0,
            dc_sync1_shift_ns: 0,
            operation_mode: Some(8),
            profile_velocity: None,
            profile_acceleration: None,
            max_velocity: Some(10_000.0),
            max_torque: Some(1_000.0),
            position_limits: Some((-1_000_000.0, 1_000_000.0)),
            homing: None::<HomingConfig>,
            esi: None,
            pdo_override: None,
            planner: None,
            pv_requires_setpoint_toggle: false,
            pt_requires_setpoint_toggle: false,
            startup_sdo_writes: vec![],
        }
    }

    fn map_with_basic_registers() -> PdoMap {
        let mut map = PdoMap::new();
        map.register_rx(cia402::CONTROLWORD_INDEX, 0, 0, 16);
        map.register_tx(cia402::STATUSWORD_INDEX, 0, 2, 16);
        map.register_rx(cia402::TARGET_POSITION_INDEX, 0, 4, 32);
        map.register_rx(cia402::TARGET_VELOCITY_INDEX, 0, 8, 32);
        map.register_rx(cia402::TARGET_TORQUE_INDEX, 0, 12, 16);
        map.register_rx(cia402::MODES_OF_OPERATION_INDEX, 0, 14, 8);
        map
    }

    #[test]
    fn disabled_slave_writes_zero_controlword_only() {
        let mut adapter = SimMaster::new();
        let map = map_with_basic_registers();
        let mut state = SlaveRuntimeState::new(0, crate::state::FeatureSet::from_map(&map));
        state.mode = Mode::ProfileVelocity;
        state.last_velocity_cmd = 500.0;
        let cfg = drive_cfg(0);

        apply_cycle(&mut state, &cfg, &map, &mut adapter, 0x000F, Instant::now(), 0x1000, Duration::from_millis(100))
            .unwrap();

        assert_eq!(read_u16(adapter.domain_data(), 0), 0);
        // Velocity target untouched (still zero) because the slave is disabled.
        assert_eq!(read_i32(adapter.domain_data(), 8), 0);
    }

    #[test]
    fn profile_velocity_clamps_to_max_and_writes_enable_word() {
        let mut adapter = SimMaster::new();
        let map = map_with_basic_registers();
        let mut state = SlaveRuntimeState::new(0, crate::state::FeatureSet::from_map(&map));
        state.enabled = true;
        state.mode = Mode::ProfileVelocity;
        state.last_velocity_cmd = 999_999.0;
        let cfg = drive_cfg(0);

        apply_cycle(&mut state, &cfg, &map, &mut adapter, 0x000F, Instant::now(), 0x1000, Duration::from_millis(100))
            .unwrap();

        assert_eq!(read_i32(adapter.domain_data(), 8), 10_000);
        assert_eq!(read_u16(adapter.domain_data(), 0), 0x000F);
    }

    #[test]
    fn shutdown_frame_zeroes_velocity_and_holds_position() {
        let mut adapter = SimMaster::new();
        let map = map_with_basic_registers();
        let mut state = SlaveRuntimeState::new(0, crate::state::FeatureSet::from_map(&map));
        state.enabled = true;
        state.mode = Mode::ProfileVelocity;
        state.last_velocity_cmd = 2_000.0;
        let cfg = drive_cfg(0);
        apply_cycle(&mut state, &cfg, &map, &mut adapter, 0x000F, Instant::now(), 0x1000, Duration::from_millis(100))
            .unwrap();
        assert_eq!(read_i32(adapter.domain_data(), 8), 2_000);
        write_i32(adapter.domain_data_mut(), 4, 555); // prior target position, must be preserved

        write_shutdown_frame(&mut state, &map, &mut adapter).unwrap();

        assert_eq!(read_u16(adapter.domain_data(), 0), 0);
        assert_eq!(read_i32(adapter.domain_data(), 8), 0, "velocity must be driven to zero, not frozen");
        assert_eq!(read_i32(adapter.domain_data(), 4), 555, "target position must be held, not mutated");
        assert!(!state.enabled);
    }

    #[test]
    fn profile_position_asserts_new_set_point_once_per_request() {
        let mut adapter = SimMaster::new();
        let map = map_with_basic_registers();
        let mut state = SlaveRuntimeState::new(0, crate::state::FeatureSet::from_map(&map));
        state.enabled = true;
        state.mode = Mode::ProfilePosition;
        state.last_position_cmd = 1234.0;
        state.pp_pulse.request();
        let cfg = drive_cfg(0);
        let now = Instant::now();

        apply_cycle(&mut state, &cfg, &map, &mut adapter, 0x000F, now, 0x1000, Duration::from_millis(100)).unwrap();
        let cw = read_u16(adapter.domain_data(), 0);
        assert_eq!(cw & cia402::ControlwordBits::NEW_SET_POINT.bits(), cia402::ControlwordBits::NEW_SET_POINT.bits());
        assert_eq!(read_i32(adapter.domain_data(), 4), 1234);

        // Ack observed (bit 12 set in statusword image): bit should clear.
        write_u16(adapter.domain_data_mut(), 2, 0x1000);
        apply_cycle(&mut state, &cfg, &map, &mut adapter, 0x000F, now, 0x1000, Duration::from_millis(100)).unwrap();
        let cw = read_u16(adapter.domain_data(), 0);
        assert_eq!(cw & cia402::ControlwordBits::NEW_SET_POINT.bits(), 0);
    }

    #[test]
    fn csp_seeds_current_from_actual_position_on_first_cycle() {
        let mut adapter = SimMaster::new();
        let mut map = map_with_basic_registers();
        map.register_tx(cia402::POSITION_ACTUAL_INDEX, 0, 16, 32);
        write_i32(adapter.domain_data_mut(), 16, 42_000);
        let mut state = SlaveRuntimeState::new(0, crate::state::FeatureSet::from_map(&map));
        state.enabled = true;
        state.mode = Mode::CyclicSyncPosition;
        let cfg = drive_cfg(0);

        apply_cycle(&mut state, &cfg, &map, &mut adapter, 0x000F, Instant::now(), 0x1000, Duration::from_millis(100))
            .unwrap();

        assert_eq!(read_i32(adapter.domain_data(), 4), 42_000);
        assert!(state.csp_seeded);
    }

    #[test]
    fn csp_target_wraps_to_i32_on_overflow() {
        let mut adapter = SimMaster::new();
        let map = map_with_basic_registers();
        let mut state = SlaveRuntimeState::new(0, crate::state::FeatureSet::from_map(&map));
        state.enabled = true;
        state.mode = Mode::CyclicSyncPosition;
        let mut cfg = drive_cfg(0);
        cfg.position_limits = None;
        state.csp_next = Some(i64::from(i32::MAX) as f64 + 10.0);

        apply_cycle(&mut state, &cfg, &map, &mut adapter, 0x000F, Instant::now(), 0x1000, Duration::from_millis(100))
            .unwrap();

        let wire = read_i32(adapter.domain_data(), 4);
        assert_eq!(wire, (i64::from(i32::MAX) as i64 + 10 - (1i64 << 32)) as i32);
    }

    #[test]
    fn probe_function_word_written_once_then_deduped_via_sdo_when_unmapped() {
        let mut adapter = SimMaster::new();
        let map = map_with_basic_registers(); // no probe function entry: SDO path
        let mut state = SlaveRuntimeState::new(0, crate::state::FeatureSet::from_map(&map));
        state.enabled = true;
        state.pending_probe_word = Some(cia402::probe_function_word(false));
        state.probe_edge = Some(ProbeEdge::Positive);
        let cfg = drive_cfg(0);

        apply_cycle(&mut state, &cfg, &map, &mut adapter, 0x000F, Instant::now(), 0x1000, Duration::from_millis(100))
            .unwrap();

        assert_eq!(state.last_sdo_probe_word, Some(cia402::probe_function_word(false)));
        assert!(state.pending_probe_word.is_none());
        let _ = PROBE_FUNCTION_INDEX;
    }
}
