//! Cycle benchmark — measure the compute-intensive portion of the Cyclic
//! Worker's per-slave cycle body (Drive State Machine + Mode & Motion
//! Controller writes, §4.1 steps 5 and 7) for N-slave configurations.
//!
//! Domain receive/send and the master handle itself are excluded: those are
//! `MasterAdapter` responsibilities benchmarked separately by an integrator
//! against a real binding, not by this crate's own in-memory simulation.

use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use ethercat_common::config::DriveConfig;
use ethercat_core::drive_state;
use ethercat_core::master::{ApplicationState, MasterAdapter, PdoEntrySpec, SimMaster};
use ethercat_core::motion;
use ethercat_core::state::{FeatureSet, SlaveRuntimeState};
use ethercat_common::pdo::PdoMap;

struct BenchSlave {
    cfg: DriveConfig,
    map: PdoMap,
    state: SlaveRuntimeState,
}

fn drive_config(position: u16) -> DriveConfig {
    DriveConfig {
        position,
        alias: 0,
        vendor_id: 171,
        product_code: 305_419_896,
        enable_dc: false,
        dc_assign_activate: None,
        dc_sync0_cycle_time_ns: None,
        dc_sync0_shift_ns: 0,
        dc_sync1_cycle_time_ns: 0,
        dc_sync1_shift_ns: 0,
        operation_mode: Some(8),
        profile_velocity: None,
        profile_acceleration: None,
        max_velocity: Some(200_000.0),
        max_torque: Some(1_000.0),
        position_limits: None,
        homing: None,
        esi: None,
        pdo_override: None,
        planner: None,
        pv_requires_setpoint_toggle: false,
        pt_requires_setpoint_toggle: false,
        startup_sdo_writes: vec![],
    }
}

/// Register a typical CiA-402 CSP register set on `adapter` for `position`
/// and build the matching `PdoMap`.
fn build_slave(adapter: &mut SimMaster, position: u16) -> BenchSlave {
    adapter.request(0).unwrap();
    adapter.create_domain().unwrap();
    adapter.config_slave(position, 0, 171, 305_419_896).unwrap();

    let entries = [
        PdoEntrySpec { index: 0x6040, subindex: 0, bit_length: 16, outbound: true },
        PdoEntrySpec { index: 0x6060, subindex: 0, bit_length: 8, outbound: true },
        PdoEntrySpec { index: 0x607A, subindex: 0, bit_length: 32, outbound: true },
        PdoEntrySpec { index: 0x60FF, subindex: 0, bit_length: 32, outbound: true },
        PdoEntrySpec { index: 0x6041, subindex: 0, bit_length: 16, outbound: false },
        PdoEntrySpec { index: 0x6061, subindex: 0, bit_length: 8, outbound: false },
        PdoEntrySpec { index: 0x6064, subindex: 0, bit_length: 32, outbound: false },
        PdoEntrySpec { index: 0x606C, subindex: 0, bit_length: 32, outbound: false },
    ];
    let offsets = adapter.register_pdo_entries(position, &entries).unwrap();

    let mut map = PdoMap::new();
    for (entry, offset) in entries.iter().zip(offsets.iter()) {
        if entry.outbound {
            map.register_rx(entry.index, entry.subindex, *offset, entry.bit_length);
        } else {
            map.register_tx(entry.index, entry.subindex, *offset, entry.bit_length);
        }
    }

    let features = FeatureSet::from_map(&map);
    let mut state = SlaveRuntimeState::new(position, features);
    state.enabled = true;
    state.enable_requested = true;
    state.in_op = true;

    BenchSlave { cfg: drive_config(position), map, state }
}

fn simulate_cycle(adapter: &mut SimMaster, slaves: &mut [BenchSlave], now: Instant) {
    let transition_period = Duration::from_millis(0);
    let pp_ack_timeout = Duration::from_millis(100);

    for slave in slaves {
        let statusword = slave
            .map
            .tx_offset(0x6041, 0)
            .map(|off| u16::from_le_bytes(adapter.domain_data()[off.byte_offset..off.byte_offset + 2].try_into().unwrap()))
            .unwrap_or(0x0027);

        let controlword_base = drive_state::step(&mut slave.state, statusword, transition_period, now);

        motion::apply_cycle(
            &mut slave.state,
            &slave.cfg,
            &slave.map,
            adapter,
            controlword_base,
            now,
            1 << 12,
            pp_ack_timeout,
        )
        .unwrap();
    }
}

fn bench_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("cycle_body_per_slave_compute");
    group.sample_size(200);

    for &n_slaves in &[1u16, 4, 8, 16, 32, 64] {
        group.bench_with_input(BenchmarkId::new("slaves", n_slaves), &n_slaves, |b, &n_slaves| {
            let mut adapter = SimMaster::new();
            let mut slaves: Vec<BenchSlave> = (0..n_slaves).map(|p| build_slave(&mut adapter, p)).collect();
            adapter.activate().unwrap();

            b.iter(|| {
                let now = Instant::now();
                simulate_cycle(&mut adapter, &mut slaves, now);
            });

            assert!(matches!(adapter.slave_state(0), ApplicationState::Op | ApplicationState::PreOp));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_cycle);
criterion_main!(benches);
