//! The tagged `Command` enum crossing the worker boundary (§6.3).
//!
//! Commands are plain data — no dynamic dispatch, no attached callbacks. The
//! worker drains them from a bounded ingress queue and applies them to the
//! addressed slave's runtime state.

use serde::{Deserialize, Serialize};

/// Which edge a touch-probe function should latch on.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeEdge {
    /// Latch on the rising edge.
    Positive = 0,
    /// Latch on the falling edge.
    Negative = 1,
}

/// Optional override of a jerk-limited move's kinematic limits; `None` fields
/// fall back to the slave's configured [`crate::config::RuckigConfig`] defaults.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JerkLimitOverrides {
    /// Max velocity override, drive-native units/s.
    pub max_velocity: Option<f64>,
    /// Max acceleration override, drive-native units/s².
    pub max_acceleration: Option<f64>,
    /// Max jerk override, drive-native units/s³.
    pub max_jerk: Option<f64>,
}

/// A command addressed to a single slave, carried through the ingress queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Bus position of the target slave.
    pub slave: u16,
    /// The command payload.
    pub kind: CommandKind,
}

/// Tagged command variants (§6.3). Represented as a plain enum rather than a
/// string-keyed dictionary so every variant's payload is statically typed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommandKind {
    /// Select a CiA-402 mode of operation.
    SetMode(crate::cia402::Mode),
    /// Command a target velocity (PV mode), drive-native units/s.
    SetVelocity(f64),
    /// Command a target position (PP mode), drive-native units.
    SetPosition(f64),
    /// Stream a CSP target position into the `next` double-buffer slot.
    SetPositionCsp(f64),
    /// Command a target torque (PT mode), drive-native units.
    SetTorque(f64),
    /// Strobe the homing-start bit.
    StartHoming,
    /// Arm the touch probe.
    ArmProbe {
        /// Edge to latch on.
        edge: ProbeEdge,
        /// Continuous (re-armed automatically after each capture) vs one-shot.
        continuous: bool,
    },
    /// Disarm the touch probe.
    DisableProbe,
    /// Request the Drive State Machine to bring this slave to Operation Enabled.
    EnableDrive,
    /// Request this slave be driven to controlword 0x0000 and held there.
    DisableDrive,
    /// Zero velocity/torque intent and stop any active planner, without
    /// changing the enable/disable latch.
    StopMotion,
    /// Write raw bytes directly into the outbound process image at a
    /// registered (index, subindex), bypassing mode-specific shaping.
    WriteRawPdo {
        /// Object dictionary index.
        index: u16,
        /// Object dictionary subindex.
        subindex: u8,
        /// Little-endian payload.
        bytes: Vec<u8>,
    },
    /// Issue a service-channel (SDO) write.
    WriteSdo {
        /// Object dictionary index.
        index: u16,
        /// Object dictionary subindex.
        subindex: u8,
        /// Little-endian payload.
        bytes: Vec<u8>,
    },
    /// Issue a service-channel (SDO) read; the result surfaces asynchronously
    /// through the status snapshot's per-slave SDO-read-result slot.
    ReadSdo {
        /// Object dictionary index.
        index: u16,
        /// Object dictionary subindex.
        subindex: u8,
    },
    /// Start a jerk-limited point-to-point move to an absolute position.
    StartJerkMove {
        /// Target position, drive-native units.
        position: f64,
        /// Optional limit overrides.
        overrides: JerkLimitOverrides,
    },
    /// Start or retarget a jerk-limited velocity command.
    StartJerkVelocity {
        /// Target velocity, drive-native units/s.
        velocity: f64,
        /// Optional limit overrides (acceleration/jerk only; velocity is the target itself).
        overrides: JerkLimitOverrides,
    },
    /// Stop any active jerk-limited planner request, holding position.
    StopJerk,
    /// Clear a latched fault-reset attempt counter and re-arm the Drive State Machine.
    ClearFault,
    /// No-op, useful as a liveness probe of the ingress queue.
    NoOp,
}

impl Command {
    /// Whether this command, if allowed through, would actuate motion. Used
    /// by the `forbid_motion_commands` interlock (§4.3, §7).
    pub fn is_motion_command(&self) -> bool {
        matches!(
            self.kind,
            CommandKind::SetVelocity(_)
                | CommandKind::SetPosition(_)
                | CommandKind::SetPositionCsp(_)
                | CommandKind::SetTorque(_)
                | CommandKind::StartHoming
                | CommandKind::StartJerkMove { .. }
                | CommandKind::StartJerkVelocity { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cia402::Mode;

    #[test]
    fn motion_commands_are_flagged() {
        let cmd = Command {
            slave: 0,
            kind: CommandKind::SetVelocity(10.0),
        };
        assert!(cmd.is_motion_command());
    }

    #[test]
    fn non_motion_commands_are_not_flagged() {
        let cmd = Command {
            slave: 0,
            kind: CommandKind::SetMode(Mode::ProfileVelocity),
        };
        assert!(!cmd.is_motion_command());

        let cmd = Command {
            slave: 0,
            kind: CommandKind::NoOp,
        };
        assert!(!cmd.is_motion_command());
    }
}
