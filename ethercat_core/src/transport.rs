//! Command/status transport (C5): a bounded, non-blocking ingress queue and a
//! coalescing (newest-wins) status snapshot, plus [`DriveHandle`] — the value
//! type applications hold instead of a callback or trait-object subscription
//! (§4.5, §9).

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};

use ethercat_common::cia402::Mode;
use ethercat_common::command::{Command, CommandKind, JerkLimitOverrides, ProbeEdge};
use ethercat_common::status::{NetworkStatus, SlaveStatus};

/// Shared, mutex-guarded "latest wins" status slot. Every publish overwrites
/// whatever was there; readers never block on a writer and never see a
/// historical backlog.
#[derive(Clone)]
pub struct StatusEgress(Arc<Mutex<Option<NetworkStatus>>>);

impl StatusEgress {
    /// An empty egress slot, published to for the first time at the end of
    /// the first completed cycle.
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    /// Overwrite the published snapshot.
    pub fn publish(&self, status: NetworkStatus) {
        *self.0.lock().expect("status mutex poisoned") = Some(status);
    }

    /// The most recently published snapshot, if any.
    pub fn latest(&self) -> Option<NetworkStatus> {
        self.0.lock().expect("status mutex poisoned").clone()
    }
}

impl Default for StatusEgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker-side handle to the transport: the command receiver the Cyclic
/// Worker drains each cycle, and the egress slot it publishes into.
pub struct Transport {
    command_rx: Receiver<Command>,
    status: StatusEgress,
}

impl Transport {
    /// Build a fresh transport with a bounded ingress channel. Returns the
    /// worker-side `Transport` plus the sender and status handle needed to
    /// construct [`DriveHandle`]s for applications.
    pub fn new(ingress_bound: usize) -> (Self, SyncSender<Command>, StatusEgress) {
        let (tx, rx) = sync_channel(ingress_bound.max(1));
        let status = StatusEgress::new();
        (Self { command_rx: rx, status: status.clone() }, tx, status)
    }

    /// Drain up to `bound` commands without blocking. Fewer may be returned
    /// if the queue is empty; this never allocates more than `bound` slots.
    pub fn drain(&self, bound: usize) -> Vec<Command> {
        let mut out = Vec::with_capacity(bound);
        for _ in 0..bound {
            match self.command_rx.try_recv() {
                Ok(cmd) => out.push(cmd),
                Err(_) => break,
            }
        }
        out
    }

    /// Publish a new status snapshot, overwriting whatever was published before.
    pub fn publish(&self, status: NetworkStatus) {
        self.status.publish(status);
    }
}

/// A `Clone + Send` application-facing reference to one slave. Carries no
/// callbacks and cannot be dynamically attached/detached at runtime — every
/// clone is just a cheap copy of a channel sender and a shared status slot
/// (§9: deliberately a plain value type, not a subscription object).
#[derive(Clone)]
pub struct DriveHandle {
    position: u16,
    commands: SyncSender<Command>,
    status: StatusEgress,
}

impl DriveHandle {
    /// Construct a handle addressed to `position`, sharing the ingress
    /// sender and status egress of the worker that owns this slave.
    pub fn new(position: u16, commands: SyncSender<Command>, status: StatusEgress) -> Self {
        Self { position, commands, status }
    }

    /// Bus position this handle is addressed to.
    pub fn position(&self) -> u16 {
        self.position
    }

    fn send(&self, kind: CommandKind) -> Result<(), TrySendError<Command>> {
        self.commands.try_send(Command { slave: self.position, kind })
    }

    /// Select a CiA-402 mode of operation.
    pub fn set_mode(&self, mode: Mode) -> Result<(), TrySendError<Command>> {
        self.send(CommandKind::SetMode(mode))
    }

    /// Command a target velocity (PV mode).
    pub fn set_velocity(&self, velocity: f64) -> Result<(), TrySendError<Command>> {
        self.send(CommandKind::SetVelocity(velocity))
    }

    /// Command a target position (PP mode).
    pub fn set_position(&self, position: f64) -> Result<(), TrySendError<Command>> {
        self.send(CommandKind::SetPosition(position))
    }

    /// Stream a CSP target into the double-buffered `next` slot.
    pub fn set_position_csp(&self, position: f64) -> Result<(), TrySendError<Command>> {
        self.send(CommandKind::SetPositionCsp(position))
    }

    /// Command a target torque (PT mode).
    pub fn set_torque(&self, torque: f64) -> Result<(), TrySendError<Command>> {
        self.send(CommandKind::SetTorque(torque))
    }

    /// Strobe the homing-start bit.
    pub fn start_homing(&self) -> Result<(), TrySendError<Command>> {
        self.send(CommandKind::StartHoming)
    }

    /// Arm the touch probe on the given edge.
    pub fn arm_probe(&self, edge: ProbeEdge, continuous: bool) -> Result<(), TrySendError<Command>> {
        self.send(CommandKind::ArmProbe { edge, continuous })
    }

    /// Disarm the touch probe.
    pub fn disable_probe(&self) -> Result<(), TrySendError<Command>> {
        self.send(CommandKind::DisableProbe)
    }

    /// Request the Drive State Machine bring this slave to Operation Enabled.
    pub fn enable_drive(&self) -> Result<(), TrySendError<Command>> {
        self.send(CommandKind::EnableDrive)
    }

    /// Request this slave be driven to controlword 0x0000 and held there.
    pub fn disable_drive(&self) -> Result<(), TrySendError<Command>> {
        self.send(CommandKind::DisableDrive)
    }

    /// Zero velocity/torque intent and stop any active planner.
    pub fn stop_motion(&self) -> Result<(), TrySendError<Command>> {
        self.send(CommandKind::StopMotion)
    }

    /// Write raw bytes directly into the outbound process image.
    pub fn write_raw_pdo(&self, index: u16, subindex: u8, bytes: Vec<u8>) -> Result<(), TrySendError<Command>> {
        self.send(CommandKind::WriteRawPdo { index, subindex, bytes })
    }

    /// Issue a service-channel (SDO) write.
    pub fn write_sdo(&self, index: u16, subindex: u8, bytes: Vec<u8>) -> Result<(), TrySendError<Command>> {
        self.send(CommandKind::WriteSdo { index, subindex, bytes })
    }

    /// Issue a service-channel (SDO) read.
    pub fn read_sdo(&self, index: u16, subindex: u8) -> Result<(), TrySendError<Command>> {
        self.send(CommandKind::ReadSdo { index, subindex })
    }

    /// Start a jerk-limited point-to-point move to an absolute position.
    pub fn start_jerk_move(&self, position: f64, overrides: JerkLimitOverrides) -> Result<(), TrySendError<Command>> {
        self.send(CommandKind::StartJerkMove { position, overrides })
    }

    /// Start or retarget a jerk-limited velocity hold.
    pub fn start_jerk_velocity(&self, velocity: f64, overrides: JerkLimitOverrides) -> Result<(), TrySendError<Command>> {
        self.send(CommandKind::StartJerkVelocity { velocity, overrides })
    }

    /// Stop any active jerk-limited planner request, holding position.
    pub fn stop_jerk(&self) -> Result<(), TrySendError<Command>> {
        self.send(CommandKind::StopJerk)
    }

    /// Clear a latched fault-reset attempt counter and re-arm the Drive State Machine.
    pub fn clear_fault(&self) -> Result<(), TrySendError<Command>> {
        self.send(CommandKind::ClearFault)
    }

    /// No-op, useful as a liveness probe of the ingress queue.
    pub fn no_op(&self) -> Result<(), TrySendError<Command>> {
        self.send(CommandKind::NoOp)
    }

    /// This slave's status from the most recently published snapshot, if any.
    pub fn status(&self) -> Option<SlaveStatus> {
        self.status.latest()?.slaves.into_iter().find(|s| s.position == self.position)
    }

    /// The full network-wide snapshot, if one has been published yet.
    pub fn network_status(&self) -> Option<NetworkStatus> {
        self.status.latest()
    }
}
