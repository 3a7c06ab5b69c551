//! `MasterAdapter`: the native EtherCAT master/domain/slave/SDO boundary
//! (§6, component C7), plus an in-memory simulation implementation used by
//! tests and local development when no real master binding is linked.
//!
//! Grounded on the workspace's original `master_adapter.py` / `igh_master.py`
//! (an `ecrt_*`-style ctypes wrapper): `request`/`release`, `create_domain`,
//! `config_slave`, `register_pdo_entry_list`, `activate`/`deactivate`,
//! `send`/`receive`/`process_domain`/`queue_domain`, `sdo_download`/
//! `sdo_upload`, `set_application_time`. This crate never links a real
//! `libethercat`/SOEM/ethercrab binding — the trait is the seam a real
//! adapter would plug into.

use std::collections::HashMap;

use crate::error::MasterError;

/// A slave's observed EtherCAT application-layer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplicationState {
    /// Init — no mailbox, no process data.
    #[default]
    Init,
    /// Pre-Operational — mailbox only.
    PreOp,
    /// Safe-Operational — process data inbound only.
    SafeOp,
    /// Operational — full cyclic process-data exchange.
    Op,
}

/// One `(index, subindex, bit_length)` entry to bulk-register on a slave,
/// tagged with its process-image direction.
#[derive(Debug, Clone, Copy)]
pub struct PdoEntrySpec {
    /// Object dictionary index.
    pub index: u16,
    /// Object dictionary subindex.
    pub subindex: u8,
    /// Bit length (8/16/32).
    pub bit_length: u8,
    /// `true` if this entry is written by the master (outbound, "rx" from
    /// the slave's perspective); `false` if read from the slave (inbound).
    pub outbound: bool,
}

/// Distributed-clock configuration for one slave (§4.1 step 6, §6).
#[derive(Debug, Clone, Copy, Default)]
pub struct DcConfig {
    /// DC assign/activate word.
    pub assign_activate: u16,
    /// SYNC0 cycle time, nanoseconds.
    pub sync0_cycle_time_ns: u32,
    /// SYNC0 shift, nanoseconds.
    pub sync0_shift_ns: i32,
    /// SYNC1 cycle time, nanoseconds.
    pub sync1_cycle_time_ns: u32,
    /// SYNC1 shift, nanoseconds.
    pub sync1_shift_ns: i32,
}

/// The native EtherCAT master boundary. An implementation owns exactly one
/// master instance, one process-data domain, and the per-slave offset
/// bookkeeping the adapter itself assigns during registration.
///
/// All methods are synchronous and non-blocking except [`MasterAdapter::request`]
/// (one-shot, at startup) — this mirrors §5's requirement that everything
/// inside the cycle body other than the terminal sleep is non-blocking.
pub trait MasterAdapter {
    /// Request (acquire) the master instance.
    fn request(&mut self, master_index: u32) -> Result<(), MasterError>;
    /// Release the master instance. Best-effort; never panics.
    fn release(&mut self);
    /// Create the process-data domain. Must be called once, after `request`.
    fn create_domain(&mut self) -> Result<(), MasterError>;
    /// Configure a slave's identity at the given bus position.
    fn config_slave(
        &mut self,
        position: u16,
        alias: u16,
        vendor_id: u32,
        product_code: u32,
    ) -> Result<(), MasterError>;
    /// Bulk-register every PDO entry for a slave, returning the assigned
    /// byte offset for each, in the same order as `entries`.
    fn register_pdo_entries(
        &mut self,
        position: u16,
        entries: &[PdoEntrySpec],
    ) -> Result<Vec<usize>, MasterError>;
    /// Configure distributed clocks for a slave.
    fn config_dc(&mut self, position: u16, dc: DcConfig) -> Result<(), MasterError>;
    /// Designate the distributed-clock reference slave.
    fn select_reference_clock(&mut self, position: u16) -> Result<(), MasterError>;
    /// Issue a pre-activation service-channel (SDO) write.
    fn sdo_write(
        &mut self,
        position: u16,
        index: u16,
        subindex: u8,
        data: &[u8],
    ) -> Result<(), MasterError>;
    /// Issue a service-channel (SDO) read.
    fn sdo_read(
        &mut self,
        position: u16,
        index: u16,
        subindex: u8,
    ) -> Result<Vec<u8>, MasterError>;
    /// Activate the master (transition to cyclic process-data exchange).
    fn activate(&mut self) -> Result<(), MasterError>;
    /// Deactivate the master.
    fn deactivate(&mut self);
    /// Receive the inbound frame.
    fn receive(&mut self) -> Result<(), MasterError>;
    /// Process the domain so reads observe the just-arrived image.
    fn process_domain(&mut self);
    /// Queue the domain for transmission.
    fn queue_domain(&mut self);
    /// Send the outbound frame.
    fn send(&mut self) -> Result<(), MasterError>;
    /// Borrow the local process image read-only.
    fn domain_data(&self) -> &[u8];
    /// Borrow the local process image mutably.
    fn domain_data_mut(&mut self) -> &mut [u8];
    /// The most recently observed domain working counter and the value
    /// expected given every slave that registered at least one PDO entry.
    fn working_counter(&self) -> (u32, u32);
    /// The observed application-layer state of a slave.
    fn slave_state(&self, position: u16) -> ApplicationState;
    /// Set the master's notion of application (DC) time.
    fn set_application_time(&mut self, time_ns: u64);
}

/// A minimal virtual CiA-402 slave used by [`SimMaster`] to give tests and
/// local development a plausible statusword response to controlword writes,
/// without depending on real hardware or a real master binding.
#[derive(Debug, Clone, Copy, Default)]
struct VirtualDrive {
    controlword_offset: Option<usize>,
    statusword_offset: Option<usize>,
    target_position_offset: Option<usize>,
    position_actual_offset: Option<usize>,
    target_velocity_offset: Option<usize>,
    velocity_actual_offset: Option<usize>,
    cycles_in_op: u32,
}

/// In-memory [`MasterAdapter`] simulation (component C7). Reaches `Op` for
/// every slave after a handful of cycles, and drives a tiny virtual CiA-402
/// state machine so integration tests can exercise the cold-start-to-enabled
/// and CSP-streaming scenarios (§8) end to end without real hardware.
pub struct SimMaster {
    requested: bool,
    activated: bool,
    domain: Vec<u8>,
    cycles_since_activate: u32,
    op_delay_cycles: u32,
    slaves: HashMap<u16, VirtualDrive>,
    sdo_store: HashMap<(u16, u16, u8), Vec<u8>>,
    next_offset: usize,
    reference_clock: Option<u16>,
}

impl SimMaster {
    /// Create a simulation that reaches Op `op_delay_cycles` after activation
    /// (default construction uses 2, matching a realistic PreOp->SafeOp->Op
    /// handshake taking a couple of cycles).
    pub fn new() -> Self {
        Self {
            requested: false,
            activated: false,
            domain: vec![0u8; 4096],
            cycles_since_activate: 0,
            op_delay_cycles: 2,
            slaves: HashMap::new(),
            sdo_store: HashMap::new(),
            next_offset: 0,
            reference_clock: None,
        }
    }

    /// Override how many cycles after activation the simulated bus reaches Op.
    pub fn with_op_delay(mut self, cycles: u32) -> Self {
        self.op_delay_cycles = cycles;
        self
    }

    /// Force a slave's simulated statusword directly (test hook for fault
    /// injection / bus-dropout scenarios, §8 scenarios 4 and 5).
    pub fn sim_set_statusword(&mut self, position: u16, value: u16) {
        if let Some(drive) = self.slaves.get(&position) {
            if let Some(offset) = drive.statusword_offset {
                self.domain[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
            }
        }
    }

    /// Force a slave out of Op for the next `cycles` cycles (bus dropout).
    pub fn sim_force_preop(&mut self, position: u16, cycles: u32) {
        if let Some(drive) = self.slaves.get_mut(&position) {
            drive.cycles_in_op = 0;
            self.cycles_since_activate = self.cycles_since_activate.saturating_sub(cycles);
        }
    }

    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.domain[offset..offset + 2].try_into().unwrap())
    }

    fn write_u16(&mut self, offset: usize, value: u16) {
        self.domain[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn write_i32(&mut self, offset: usize, value: i32) {
        self.domain[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn read_i32(&self, offset: usize) -> i32 {
        i32::from_le_bytes(self.domain[offset..offset + 4].try_into().unwrap())
    }

    /// Advance the tiny virtual CiA-402 state machine for every slave,
    /// mirroring how real drive firmware reacts to the controlword (not to
    /// be confused with this crate's own, master-side, drive_state module).
    fn step_virtual_drives(&mut self) {
        let positions: Vec<u16> = self.slaves.keys().copied().collect();
        for position in positions {
            let drive = *self.slaves.get(&position).unwrap();
            if let (Some(cw_off), Some(sw_off)) = (drive.controlword_offset, drive.statusword_offset) {
                let controlword = self.read_u16(cw_off);
                let statusword = self.read_u16(sw_off);
                let masked = statusword & ethercat_common::cia402::STATUSWORD_STATE_MASK;
                let next_state = if controlword & 0x000F == 0x0000 {
                    ethercat_common::cia402::STATUSWORD_SWITCH_ON_DISABLED
                } else if masked == ethercat_common::cia402::STATUSWORD_SWITCH_ON_DISABLED
                    && controlword & 0x0007 == 0x0006
                {
                    ethercat_common::cia402::STATUSWORD_READY_TO_SWITCH_ON
                } else if masked == ethercat_common::cia402::STATUSWORD_READY_TO_SWITCH_ON
                    && controlword & 0x0007 == 0x0007
                {
                    ethercat_common::cia402::STATUSWORD_SWITCHED_ON
                } else if masked == ethercat_common::cia402::STATUSWORD_SWITCHED_ON
                    && controlword & 0x000F == 0x000F
                {
                    ethercat_common::cia402::STATUSWORD_OPERATION_ENABLED
                } else {
                    masked
                };
                self.write_u16(sw_off, next_state);

                if next_state == ethercat_common::cia402::STATUSWORD_OPERATION_ENABLED {
                    if let (Some(tp), Some(pa)) =
                        (drive.target_position_offset, drive.position_actual_offset)
                    {
                        let target = self.read_i32(tp);
                        let actual = self.read_i32(pa);
                        let step = (target - actual).clamp(-2000, 2000);
                        self.write_i32(pa, actual + step);
                    }
                    if let (Some(tv), Some(va)) =
                        (drive.target_velocity_offset, drive.velocity_actual_offset)
                    {
                        let target = self.read_i32(tv);
                        self.write_i32(va, target);
                    }
                }
            }
        }
    }
}

impl Default for SimMaster {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterAdapter for SimMaster {
    fn request(&mut self, _master_index: u32) -> Result<(), MasterError> {
        self.requested = true;
        Ok(())
    }

    fn release(&mut self) {
        self.requested = false;
        self.activated = false;
    }

    fn create_domain(&mut self) -> Result<(), MasterError> {
        if !self.requested {
            return Err(MasterError::Acquisition("master not requested".into()));
        }
        Ok(())
    }

    fn config_slave(
        &mut self,
        position: u16,
        _alias: u16,
        _vendor_id: u32,
        _product_code: u32,
    ) -> Result<(), MasterError> {
        self.slaves.entry(position).or_default();
        Ok(())
    }

    fn register_pdo_entries(
        &mut self,
        position: u16,
        entries: &[PdoEntrySpec],
    ) -> Result<Vec<usize>, MasterError> {
        let drive = self.slaves.entry(position).or_default();
        let mut offsets = Vec::with_capacity(entries.len());
        for entry in entries {
            let size = (entry.bit_length as usize).div_ceil(8).max(1);
            let offset = self.next_offset;
            self.next_offset += size;
            if self.next_offset > self.domain.len() {
                self.domain.resize(self.next_offset * 2, 0);
            }
            match (entry.index, entry.subindex) {
                (0x6040, _) => drive.controlword_offset = Some(offset),
                (0x6041, _) => drive.statusword_offset = Some(offset),
                (0x607A, _) => drive.target_position_offset = Some(offset),
                (0x6064, _) => drive.position_actual_offset = Some(offset),
                (0x60FF, _) => drive.target_velocity_offset = Some(offset),
                (0x606C, _) => drive.velocity_actual_offset = Some(offset),
                _ => {}
            }
            offsets.push(offset);
        }
        Ok(offsets)
    }

    fn config_dc(&mut self, _position: u16, _dc: DcConfig) -> Result<(), MasterError> {
        Ok(())
    }

    fn select_reference_clock(&mut self, position: u16) -> Result<(), MasterError> {
        self.reference_clock = Some(position);
        Ok(())
    }

    fn sdo_write(
        &mut self,
        position: u16,
        index: u16,
        subindex: u8,
        data: &[u8],
    ) -> Result<(), MasterError> {
        self.sdo_store
            .insert((position, index, subindex), data.to_vec());
        Ok(())
    }

    fn sdo_read(
        &mut self,
        position: u16,
        index: u16,
        subindex: u8,
    ) -> Result<Vec<u8>, MasterError> {
        self.sdo_store
            .get(&(position, index, subindex))
            .cloned()
            .ok_or_else(|| MasterError::Sdo(format!("0x{index:04X}:{subindex} not written")))
    }

    fn activate(&mut self) -> Result<(), MasterError> {
        if !self.requested {
            return Err(MasterError::Activation("master not requested".into()));
        }
        self.activated = true;
        self.cycles_since_activate = 0;
        for drive in self.slaves.values_mut() {
            drive.cycles_in_op = 0;
        }
        Ok(())
    }

    fn deactivate(&mut self) {
        self.activated = false;
    }

    fn receive(&mut self) -> Result<(), MasterError> {
        if !self.activated {
            return Err(MasterError::Domain("master not activated".into()));
        }
        Ok(())
    }

    fn process_domain(&mut self) {
        if self.cycles_since_activate >= self.op_delay_cycles {
            for drive in self.slaves.values_mut() {
                drive.cycles_in_op += 1;
            }
        }
    }

    fn queue_domain(&mut self) {
        self.step_virtual_drives();
    }

    fn send(&mut self) -> Result<(), MasterError> {
        self.cycles_since_activate += 1;
        Ok(())
    }

    fn domain_data(&self) -> &[u8] {
        &self.domain
    }

    fn domain_data_mut(&mut self) -> &mut [u8] {
        &mut self.domain
    }

    fn working_counter(&self) -> (u32, u32) {
        let expected = self.slaves.len() as u32;
        (expected, expected)
    }

    fn slave_state(&self, position: u16) -> ApplicationState {
        match self.slaves.get(&position) {
            Some(drive) if self.cycles_since_activate >= self.op_delay_cycles && drive.cycles_in_op > 0 => {
                ApplicationState::Op
            }
            Some(_) if self.activated => ApplicationState::SafeOp,
            Some(_) => ApplicationState::PreOp,
            None => ApplicationState::Init,
        }
    }

    fn set_application_time(&mut self, _time_ns: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_master_reaches_op_after_delay() {
        let mut sim = SimMaster::new().with_op_delay(2);
        sim.request(0).unwrap();
        sim.create_domain().unwrap();
        sim.config_slave(0, 0, 0xAB, 0x1234).unwrap();
        sim.activate().unwrap();

        assert_eq!(sim.slave_state(0), ApplicationState::SafeOp);
        sim.receive().unwrap();
        sim.process_domain();
        sim.queue_domain();
        sim.send().unwrap();
        assert_eq!(sim.slave_state(0), ApplicationState::SafeOp);

        sim.receive().unwrap();
        sim.process_domain();
        sim.queue_domain();
        sim.send().unwrap();
        assert_eq!(sim.slave_state(0), ApplicationState::Op);
    }

    #[test]
    fn sim_master_register_offsets_are_unique_and_increasing() {
        let mut sim = SimMaster::new();
        sim.request(0).unwrap();
        sim.config_slave(0, 0, 0xAB, 0x1234).unwrap();
        let offsets = sim
            .register_pdo_entries(
                0,
                &[
                    PdoEntrySpec { index: 0x6040, subindex: 0, bit_length: 16, outbound: true },
                    PdoEntrySpec { index: 0x607A, subindex: 0, bit_length: 32, outbound: true },
                ],
            )
            .unwrap();
        assert_eq!(offsets[0], 0);
        assert_eq!(offsets[1], 2);
    }

    #[test]
    fn sdo_write_then_read_round_trips() {
        let mut sim = SimMaster::new();
        sim.sdo_write(0, 0x6098, 0, &[1, 2, 3]).unwrap();
        assert_eq!(sim.sdo_read(0, 0x6098, 0).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn unwritten_sdo_read_is_an_error() {
        let mut sim = SimMaster::new();
        assert!(sim.sdo_read(0, 0x1234, 0).is_err());
    }

    #[test]
    fn virtual_drive_climbs_state_ladder_on_enable_sequence() {
        let mut sim = SimMaster::new().with_op_delay(0);
        sim.request(0).unwrap();
        sim.config_slave(0, 0, 0xAB, 0x1234).unwrap();
        let offsets = sim
            .register_pdo_entries(
                0,
                &[
                    PdoEntrySpec { index: 0x6040, subindex: 0, bit_length: 16, outbound: true },
                    PdoEntrySpec { index: 0x6041, subindex: 0, bit_length: 16, outbound: false },
                ],
            )
            .unwrap();
        let cw_off = offsets[0];
        let sw_off = offsets[1];
        sim.activate().unwrap();
        sim.write_u16(sw_off, ethercat_common::cia402::STATUSWORD_SWITCH_ON_DISABLED);

        for controlword in [0x0006u16, 0x0007, 0x000F] {
            sim.write_u16(cw_off, controlword);
            sim.queue_domain();
        }
        assert_eq!(
            sim.read_u16(sw_off) & ethercat_common::cia402::STATUSWORD_STATE_MASK,
            ethercat_common::cia402::STATUSWORD_OPERATION_ENABLED
        );
    }
}
