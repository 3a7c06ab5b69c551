//! CiA-402 object dictionary indices, controlword/statusword bit layout, and
//! the mode-of-operation enumeration.
//!
//! Single source of truth for all numeric register constants — avoid
//! hard-coded hex values anywhere else in the workspace.

use bitflags::bitflags;

/// Error code (read-only, subindex 0).
pub const ERROR_CODE_INDEX: u16 = 0x603F;
/// Controlword (write, subindex 0).
pub const CONTROLWORD_INDEX: u16 = 0x6040;
/// Statusword (read-only, subindex 0).
pub const STATUSWORD_INDEX: u16 = 0x6041;
/// Modes of operation (write, subindex 0).
pub const MODES_OF_OPERATION_INDEX: u16 = 0x6060;
/// Modes of operation display (read-only, subindex 0).
pub const MODES_OF_OPERATION_DISPLAY_INDEX: u16 = 0x6061;
/// Position actual value, i32 (read-only, subindex 0).
pub const POSITION_ACTUAL_INDEX: u16 = 0x6064;
/// Velocity actual value, i32 (read-only, subindex 0).
pub const VELOCITY_ACTUAL_INDEX: u16 = 0x606C;
/// Target torque, i16 (write, subindex 0).
pub const TARGET_TORQUE_INDEX: u16 = 0x6071;
/// Max torque, u16 (write, subindex 0).
pub const MAX_TORQUE_INDEX: u16 = 0x6072;
/// Torque actual value, i16 (read-only, subindex 0).
pub const TORQUE_ACTUAL_INDEX: u16 = 0x6077;
/// Target position, i32 (write, subindex 0).
pub const TARGET_POSITION_INDEX: u16 = 0x607A;
/// Touch probe function, u16 (write, subindex 0).
pub const PROBE_FUNCTION_INDEX: u16 = 0x60B8;
/// Touch probe status, u16 (read-only, subindex 0).
pub const PROBE_STATUS_INDEX: u16 = 0x60B9;
/// Touch probe 1 positive/negative edge position, i32 (read-only).
pub const PROBE_POS1_INDEX: u16 = 0x60BA;
/// Touch probe 2 position, legacy/alternate index used by some devices.
pub const PROBE_POS2_INDEX_ALT: u16 = 0x60BB;
/// Touch probe 2 position, canonical index — preferred when both are mapped.
pub const PROBE_POS2_INDEX: u16 = 0x60BC;
/// Digital inputs, u32 (read-only, subindex 0).
pub const DIGITAL_INPUTS_INDEX: u16 = 0x60FD;
/// Target velocity, i32 (write, subindex 0).
pub const TARGET_VELOCITY_INDEX: u16 = 0x60FF;

bitflags! {
    /// Controlword bits (0x6040) relevant to this runtime. Bits not named here
    /// (e.g. the CiA-402 state-transition bits 0-3, 7) are written as literal
    /// values by [`crate::cia402::ControlwordAction`] rather than composed here.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ControlwordBits: u16 {
        /// Bit 4: new set-point (PP/PV/PT strobe) or homing start.
        const NEW_SET_POINT = 1 << 4;
        /// Bit 5: change set immediately (PP).
        const CHANGE_SET_IMMEDIATELY = 1 << 5;
        /// Bit 6: 0 = absolute, 1 = relative (PP).
        const RELATIVE = 1 << 6;
        /// Bit 8: halt.
        const HALT = 1 << 8;
    }
}

bitflags! {
    /// Statusword bits (0x6041) this runtime reads.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatuswordBits: u16 {
        /// Bit 3: fault.
        const FAULT = 1 << 3;
        /// Bit 7: warning.
        const WARNING = 1 << 7;
        /// Bit 10: target reached.
        const TARGET_REACHED = 1 << 10;
        /// Bit 11: internal limit active.
        const INTERNAL_LIMIT = 1 << 11;
        /// Bit 12: set-point acknowledged / speed = 0, depending on mode.
        const SETPOINT_ACK = 1 << 12;
    }
}

/// Mask applied to the statusword before comparing against the CiA-402
/// state-transition table (bits 0,1,2,3,5,6).
pub const STATUSWORD_STATE_MASK: u16 = 0x006F;

/// Observed pattern meaning "Switch On Disabled" (after masking 0x004F).
pub const STATUSWORD_SWITCH_ON_DISABLED: u16 = 0x0040;
/// Observed pattern meaning "Ready to Switch On" (after masking 0x006F).
pub const STATUSWORD_READY_TO_SWITCH_ON: u16 = 0x0021;
/// Observed pattern meaning "Switched On" (after masking 0x006F).
pub const STATUSWORD_SWITCHED_ON: u16 = 0x0023;
/// Observed pattern meaning "Operation Enabled" (after masking 0x006F).
pub const STATUSWORD_OPERATION_ENABLED: u16 = 0x0027;
/// Mask used specifically for the Switch-On-Disabled comparison (includes bit 6).
pub const STATUSWORD_SWITCH_ON_DISABLED_MASK: u16 = 0x004F;

/// Controlword value: fault reset (bit 7).
pub const CONTROLWORD_FAULT_RESET: u16 = 0x0080;
/// Controlword value: shutdown (CiA-402 "Shutdown" transition).
pub const CONTROLWORD_SHUTDOWN: u16 = 0x0006;
/// Controlword value: switch on.
pub const CONTROLWORD_SWITCH_ON: u16 = 0x0007;
/// Controlword value: enable operation.
pub const CONTROLWORD_ENABLE_OPERATION: u16 = 0x000F;
/// Controlword value: disable drive / no motion.
pub const CONTROLWORD_DISABLED: u16 = 0x0000;

/// Returns `true` iff the masked statusword matches the "Operation Enabled" pattern.
pub const fn is_operation_enabled(statusword: u16) -> bool {
    (statusword & STATUSWORD_STATE_MASK) == STATUSWORD_OPERATION_ENABLED
}

/// Touch probe function (0x60B8) bit: enable probe 1.
pub const PROBE_FUNC_ENABLE_PROBE1: u16 = 0x0001;
/// Touch probe function (0x60B8) bit: latch probe 1 on the positive (rising) edge.
pub const PROBE_FUNC_PROBE1_POS_EDGE: u16 = 0x0004;
/// Touch probe function (0x60B8) bit: latch probe 1 on the negative (falling) edge.
pub const PROBE_FUNC_PROBE1_NEG_EDGE: u16 = 0x0008;

/// Compose a probe function (0x60B8) word that arms probe 1 on the given edge.
pub const fn probe_function_word(negative_edge: bool) -> u16 {
    let edge_bit = if negative_edge {
        PROBE_FUNC_PROBE1_NEG_EDGE
    } else {
        PROBE_FUNC_PROBE1_POS_EDGE
    };
    PROBE_FUNC_ENABLE_PROBE1 | edge_bit
}

/// CiA-402 modes of operation (object 0x6060/0x6061).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// No mode selected.
    #[default]
    NoMode = 0,
    /// Profile Position.
    ProfilePosition = 1,
    /// Velocity mode (not cyclic synchronous, legacy "vl" mode).
    Velocity = 2,
    /// Profile Velocity.
    ProfileVelocity = 3,
    /// Homing.
    Homing = 6,
    /// Cyclic Synchronous Position.
    CyclicSyncPosition = 8,
    /// Cyclic Synchronous Velocity.
    CyclicSyncVelocity = 9,
    /// Profile Torque (this runtime treats object 0x6071/torque-mode value 10 as "Profile Torque").
    ProfileTorque = 10,
}

impl Mode {
    /// Reconstruct a `Mode` from its raw CiA-402 byte value.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::NoMode),
            1 => Some(Self::ProfilePosition),
            2 => Some(Self::Velocity),
            3 => Some(Self::ProfileVelocity),
            6 => Some(Self::Homing),
            8 => Some(Self::CyclicSyncPosition),
            9 => Some(Self::CyclicSyncVelocity),
            10 => Some(Self::ProfileTorque),
            _ => None,
        }
    }

    /// Raw CiA-402 byte value.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether this mode writes a cyclic target position every cycle rather
    /// than a one-shot set-point pulse.
    pub const fn is_cyclic_position(self) -> bool {
        matches!(self, Self::CyclicSyncPosition)
    }

    /// Whether this mode uses the pending/active/start_time/force_clear_cycles
    /// set-point pulse discipline (PP and HM always; PV/PT only when the
    /// per-drive `pv_requires_setpoint_toggle`/`pt_requires_setpoint_toggle`
    /// flag is set, handled by the caller).
    pub const fn uses_setpoint_pulse(self) -> bool {
        matches!(self, Self::ProfilePosition | Self::Homing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trip() {
        for raw in 0u8..=255 {
            if let Some(mode) = Mode::from_u8(raw) {
                assert_eq!(mode.as_u8(), raw);
            }
        }
    }

    #[test]
    fn mode_from_u8_rejects_unknown() {
        assert!(Mode::from_u8(4).is_none());
        assert!(Mode::from_u8(200).is_none());
    }

    #[test]
    fn operation_enabled_pattern() {
        assert!(is_operation_enabled(0x0027));
        assert!(is_operation_enabled(0x1027)); // high bits ignored by mask
        assert!(!is_operation_enabled(0x0023));
        assert!(!is_operation_enabled(0x0008)); // fault bit set, masked out differs
    }

    #[test]
    fn switch_on_disabled_needs_wider_mask() {
        // 0x0040 only matches under the wider 0x004F mask, not 0x006F.
        assert_eq!(0x0040 & STATUSWORD_SWITCH_ON_DISABLED_MASK, STATUSWORD_SWITCH_ON_DISABLED);
        assert_ne!(0x0040 & STATUSWORD_STATE_MASK, STATUSWORD_SWITCH_ON_DISABLED);
    }

    #[test]
    fn probe2_constants_distinct() {
        assert_ne!(PROBE_POS2_INDEX, PROBE_POS2_INDEX_ALT);
    }
}
