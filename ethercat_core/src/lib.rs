//! # EtherCAT Core
//!
//! Cyclic EtherCAT runtime driving CiA-402 motion devices: the isolated
//! real-time worker that owns the master handle, schedules fixed-period
//! cycles, runs the CiA-402 drive state machine and per-mode motion
//! semantics, and mediates between asynchronous application commands and the
//! strict timing of the cyclic loop.
//!
//! ## Module Structure
//!
//! - [`master`] — `MasterAdapter` trait (native master/domain/slave/SDO
//!   boundary) plus an in-memory simulation implementation.
//! - [`esi`] — namespace-agnostic ESI XML decoder.
//! - [`state`] — `SlaveRuntimeState` and the set-point edge-pulse state machine.
//! - [`drive_state`] — the CiA-402 Drive State Machine (C2).
//! - [`motion`] — the Mode & Motion Controller (C3).
//! - [`planner`] — the jerk-limited trajectory generator (C4).
//! - [`transport`] — bounded command/status queues (C5).
//! - [`cycle`] — the Cyclic Worker (C1): startup, cycle body, shutdown.
//! - [`error`] — layered error taxonomy (§7).

pub mod cycle;
pub mod drive_state;
pub mod error;
pub mod esi;
pub mod master;
pub mod motion;
pub mod planner;
pub mod state;
pub mod transport;
